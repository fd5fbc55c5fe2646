use std::sync::mpsc;
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::debug;
use wasmtime::Engine;

/// Background thread that advances the engine epoch at a fixed interval.
///
/// Stores derive their deadline from the tick count, so a stopped ticker
/// means executions can no longer time out.
pub struct EpochTicker {
  stop: Option<mpsc::Sender<()>>,
  handle: Option<JoinHandle<()>>,
}

impl EpochTicker {
  pub fn spawn(engine: Engine, interval: Duration) -> Self {
    let (stop, stopped) = mpsc::channel::<()>();
    let handle = std::thread::spawn(move || {
      loop {
        match stopped.recv_timeout(interval) {
          Err(mpsc::RecvTimeoutError::Timeout) => engine.increment_epoch(),
          _ => break,
        }
      }
      debug!("epoch ticker stopped");
    });
    Self {
      stop: Some(stop),
      handle: Some(handle),
    }
  }

  pub fn stop(&mut self) {
    if let Some(stop) = self.stop.take() {
      let _ = stop.send(());
    }
    if let Some(handle) = self.handle.take() {
      let _ = handle.join();
    }
  }
}

impl Drop for EpochTicker {
  fn drop(&mut self) {
    self.stop();
  }
}
