//! Mode-aware time source for workflow executions.
//!
//! Guests never read the host clock directly. `now` and the WASI clock both go
//! through a [`TimeFetcher`], a single background task per execution that
//! owns the provider and serves one request at a time.

use std::sync::{Arc, Mutex, Once};
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use cre_protocol::Mode;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::HostError;

/// Where execution time comes from.
///
/// DON time is agreed on by the network; node time is the local clock of
/// this node.
#[async_trait]
pub trait TimeProvider: Send + Sync {
  async fn don_time(&self) -> Result<SystemTime, HostError>;

  async fn node_time(&self) -> Result<SystemTime, HostError>;
}

/// Serves both modes from the local system clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

#[async_trait]
impl TimeProvider for SystemClock {
  async fn don_time(&self) -> Result<SystemTime, HostError> {
    Ok(SystemTime::now())
  }

  async fn node_time(&self) -> Result<SystemTime, HostError> {
    Ok(SystemTime::now())
  }
}

/// Returns the same instants on every call.
#[derive(Debug, Clone, Copy)]
pub struct FixedClock {
  pub don: SystemTime,
  pub node: SystemTime,
}

impl FixedClock {
  pub fn new(at: SystemTime) -> Self {
    Self { don: at, node: at }
  }
}

#[async_trait]
impl TimeProvider for FixedClock {
  async fn don_time(&self) -> Result<SystemTime, HostError> {
    Ok(self.don)
  }

  async fn node_time(&self) -> Result<SystemTime, HostError> {
    Ok(self.node)
  }
}

/// Nanoseconds since the unix epoch.
pub fn unix_nanos(time: SystemTime) -> Result<u64, HostError> {
  let since = time
    .duration_since(UNIX_EPOCH)
    .map_err(|e| HostError::time(e.to_string()))?;
  u64::try_from(since.as_nanos()).map_err(|_| HostError::time("time out of range"))
}

type TimeResult = Result<SystemTime, HostError>;

/// Serializes time lookups for one execution through a background task.
pub struct TimeFetcher {
  provider: Arc<dyn TimeProvider>,
  cancel: CancellationToken,
  requests: mpsc::Sender<Mode>,
  responses: tokio::sync::Mutex<mpsc::Receiver<TimeResult>>,
  /// Channel ends handed to the loop on first start.
  pending: Mutex<Option<(mpsc::Receiver<Mode>, mpsc::Sender<TimeResult>)>>,
  started: Once,
}

impl TimeFetcher {
  pub fn new(provider: Arc<dyn TimeProvider>, cancel: CancellationToken) -> Self {
    let (request_tx, request_rx) = mpsc::channel(1);
    let (response_tx, response_rx) = mpsc::channel(1);
    Self {
      provider,
      cancel,
      requests: request_tx,
      responses: tokio::sync::Mutex::new(response_rx),
      pending: Mutex::new(Some((request_rx, response_tx))),
      started: Once::new(),
    }
  }

  /// Spawn the fetch loop. Calling this more than once has no effect.
  ///
  /// Must be called from within a tokio runtime.
  pub fn start(&self) {
    self.started.call_once(|| {
      let channels = self.pending.lock().ok().and_then(|mut pending| pending.take());
      if let Some((requests, responses)) = channels {
        tokio::spawn(fetch_loop(
          self.provider.clone(),
          self.cancel.clone(),
          requests,
          responses,
        ));
      }
    });
  }

  /// Fetch the current time for `mode`.
  pub async fn get_time(&self, mode: Mode) -> TimeResult {
    self.start();

    // Hold the response side for the whole round trip so concurrent callers
    // cannot read each other's answers.
    let mut responses = tokio::select! {
      biased;
      _ = self.cancel.cancelled() => return Err(HostError::Cancelled),
      guard = self.responses.lock() => guard,
    };

    tokio::select! {
      biased;
      _ = self.cancel.cancelled() => return Err(HostError::Cancelled),
      sent = self.requests.send(mode) => sent.map_err(|_| HostError::Cancelled)?,
    }

    tokio::select! {
      biased;
      _ = self.cancel.cancelled() => Err(HostError::Cancelled),
      received = responses.recv() => received.unwrap_or(Err(HostError::Cancelled)),
    }
  }
}

async fn fetch_loop(
  provider: Arc<dyn TimeProvider>,
  cancel: CancellationToken,
  mut requests: mpsc::Receiver<Mode>,
  responses: mpsc::Sender<TimeResult>,
) {
  loop {
    let mode = tokio::select! {
      biased;
      _ = cancel.cancelled() => break,
      mode = requests.recv() => match mode {
        Some(mode) => mode,
        None => break,
      },
    };

    let result = tokio::select! {
      biased;
      _ = cancel.cancelled() => break,
      result = fetch(provider.as_ref(), mode) => result,
    };

    tokio::select! {
      biased;
      _ = cancel.cancelled() => break,
      sent = responses.send(result) => if sent.is_err() { break },
    }
  }
  debug!("time fetcher stopped");
}

async fn fetch(provider: &dyn TimeProvider, mode: Mode) -> TimeResult {
  match mode {
    Mode::Don => provider.don_time().await,
    Mode::Node => provider.node_time().await,
  }
}

#[cfg(test)]
mod tests {
  use std::time::Duration;

  use super::*;

  fn fixed() -> Arc<dyn TimeProvider> {
    Arc::new(FixedClock {
      don: UNIX_EPOCH + Duration::from_secs(100),
      node: UNIX_EPOCH + Duration::from_secs(200),
    })
  }

  struct NeverClock;

  #[async_trait]
  impl TimeProvider for NeverClock {
    async fn don_time(&self) -> Result<SystemTime, HostError> {
      std::future::pending().await
    }

    async fn node_time(&self) -> Result<SystemTime, HostError> {
      std::future::pending().await
    }
  }

  #[tokio::test]
  async fn test_get_time_per_mode() {
    let fetcher = TimeFetcher::new(fixed(), CancellationToken::new());

    let don = fetcher.get_time(Mode::Don).await.unwrap();
    let node = fetcher.get_time(Mode::Node).await.unwrap();
    assert_eq!(unix_nanos(don).unwrap(), 100_000_000_000);
    assert_eq!(unix_nanos(node).unwrap(), 200_000_000_000);
  }

  #[tokio::test]
  async fn test_start_is_idempotent() {
    let fetcher = TimeFetcher::new(fixed(), CancellationToken::new());
    fetcher.start();
    fetcher.start();

    assert!(fetcher.get_time(Mode::Don).await.is_ok());
  }

  #[tokio::test]
  async fn test_cancelled_before_request() {
    let cancel = CancellationToken::new();
    let fetcher = TimeFetcher::new(fixed(), cancel.clone());
    cancel.cancel();

    assert!(matches!(
      fetcher.get_time(Mode::Don).await,
      Err(HostError::Cancelled)
    ));
  }

  #[tokio::test]
  async fn test_cancelled_while_waiting() {
    let cancel = CancellationToken::new();
    let fetcher = TimeFetcher::new(Arc::new(NeverClock), cancel.clone());

    let canceller = cancel.clone();
    tokio::spawn(async move {
      tokio::time::sleep(Duration::from_millis(20)).await;
      canceller.cancel();
    });

    assert!(matches!(
      fetcher.get_time(Mode::Node).await,
      Err(HostError::Cancelled)
    ));
  }
}
