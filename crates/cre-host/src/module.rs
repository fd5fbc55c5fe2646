use std::path::Path;
use std::sync::Mutex;

use cre_protocol::{
  ExecuteRequest, ExecutionResult, ExitCode, HOST_MODULE, SUPPORTED_VERSION_IMPORT,
  VERSION_IMPORT_PREFIX, decode,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument};
use wasmtime::{Engine, InstancePre, Linker, Trap};

use crate::engine::{ModuleConfig, create_engine};
use crate::error::HostError;
use crate::execution::{Execution, HostServices};
use crate::linker::link;
use crate::state::{HostState, create_store};
use crate::ticker::EpochTicker;

/// A compiled, linked workflow binary.
///
/// Compilation and linking happen once; every execution gets a fresh store
/// and instance. Each module owns its engine and epoch ticker.
pub struct Module {
  engine: Engine,
  instance_pre: InstancePre<HostState>,
  config: ModuleConfig,
  version: String,
  ticker: Mutex<Option<EpochTicker>>,
}

impl Module {
  /// Compile and link a workflow binary.
  pub fn new(binary: &[u8], config: ModuleConfig) -> Result<Self, HostError> {
    config.validate()?;
    if binary.len() > config.max_binary_size {
      return Err(HostError::Compile {
        message: format!(
          "binary of {} bytes exceeds the maximum of {} bytes",
          binary.len(),
          config.max_binary_size
        ),
      });
    }

    let engine = create_engine(&config)?;
    let module = wasmtime::Module::new(&engine, binary).map_err(|e| HostError::Compile {
      message: format!("{:#}", e),
    })?;
    let version = version_import(&module)?;

    let mut linker = Linker::new(&engine);
    link(&mut linker).map_err(|e| HostError::Link {
      message: e.to_string(),
    })?;
    let instance_pre = linker
      .instantiate_pre(&module)
      .map_err(|e| HostError::Link {
        message: format!("{:#}", e),
      })?;

    info!(version = %version, size = binary.len(), "loaded workflow module");

    Ok(Self {
      engine,
      instance_pre,
      config,
      version,
      ticker: Mutex::new(None),
    })
  }

  /// Load a workflow binary from a file.
  pub fn from_file(path: &Path, config: ModuleConfig) -> Result<Self, HostError> {
    let binary = std::fs::read(path).map_err(|e| HostError::Compile {
      message: format!("failed to read {}: {}", path.display(), e),
    })?;
    Self::new(&binary, config)
  }

  pub fn config(&self) -> &ModuleConfig {
    &self.config
  }

  /// Protocol version import declared by the binary.
  pub fn version(&self) -> &str {
    &self.version
  }

  /// Start the epoch ticker. Calling this again has no effect.
  pub fn start(&self) {
    let mut ticker = self.ticker.lock().unwrap_or_else(|e| e.into_inner());
    if ticker.is_none() {
      *ticker = Some(EpochTicker::spawn(
        self.engine.clone(),
        self.config.tick_interval(),
      ));
    }
  }

  /// Stop the epoch ticker.
  pub fn close(&self) {
    let ticker = self.ticker.lock().unwrap_or_else(|e| e.into_inner()).take();
    if let Some(mut ticker) = ticker {
      ticker.stop();
    }
  }

  /// Run the workflow once for `request`.
  ///
  /// Starts the ticker if needed. Cancelling `cancel` aborts the guest, any
  /// in-flight capability calls and the time fetcher. The same happens when
  /// `timeout_ms` passes, even while the guest is blocked in a host call.
  #[instrument(
    name = "module_execute",
    skip(self, request, services, cancel),
    fields(execution_id = %request.id)
  )]
  pub async fn execute(
    &self,
    request: &ExecuteRequest,
    services: HostServices,
    cancel: CancellationToken,
  ) -> Result<ExecutionResult, HostError> {
    info!("starting execution");

    let result = self.execute_inner(request, services, cancel).await;

    match &result {
      Ok(_) => info!("execution completed"),
      Err(e) => error!(error = %e, "execution failed"),
    }

    result
  }

  async fn execute_inner(
    &self,
    request: &ExecuteRequest,
    services: HostServices,
    cancel: CancellationToken,
  ) -> Result<ExecutionResult, HostError> {
    self.start();

    let request_json = serde_json::to_string(request).map_err(cre_protocol::CodecError::Encode)?;
    // Scoped to this execution: stops its calls and time fetcher on return.
    let scope = cancel.child_token();
    let _scope_guard = scope.clone().drop_guard();
    let execution = Execution::new(
      &request.id,
      services,
      scope.clone(),
      &self.config,
      request.max_response_size,
    );
    let mut store = create_store(&self.engine, &self.config, &request_json, execution)?;

    let instance = self
      .instance_pre
      .instantiate_async(&mut store)
      .await
      .map_err(|e| HostError::instantiation(format!("{:#}", e)))?;
    let start = instance
      .get_typed_func::<(), ()>(&mut store, "_start")
      .map_err(|e| HostError::instantiation(format!("{:#}", e)))?;

    let outcome = tokio::select! {
      biased;
      _ = cancel.cancelled() => return Err(HostError::Cancelled),
      _ = tokio::time::sleep(self.config.timeout()) => {
        scope.cancel();
        return Err(HostError::DeadlineExceeded);
      }
      outcome = start.call_async(&mut store, ()) => outcome,
    };

    if let Err(e) = outcome {
      match e.downcast_ref::<wasmtime_wasi::I32Exit>() {
        Some(exit) if exit.0 == ExitCode::Success.code() => {}
        Some(exit) => return Err(exit_error(exit.0)),
        None => return Err(trap_error(e, &cancel)),
      }
    }

    let response = store
      .data_mut()
      .execution
      .take_response()
      .ok_or(HostError::NoResponse)?;
    Ok(decode(&response)?)
  }
}

impl Drop for Module {
  fn drop(&mut self) {
    self.close();
  }
}

/// Find the protocol-version import and check that this host speaks it.
fn version_import(module: &wasmtime::Module) -> Result<String, HostError> {
  let found = module
    .imports()
    .find(|import| import.module() == HOST_MODULE && import.name().starts_with(VERSION_IMPORT_PREFIX))
    .map(|import| import.name().to_string());

  match found {
    Some(name) if name == SUPPORTED_VERSION_IMPORT => Ok(name),
    Some(name) => Err(HostError::UnsupportedVersion { found: name }),
    None => Err(HostError::UnsupportedVersion {
      found: "none".to_string(),
    }),
  }
}

fn exit_error(code: i32) -> HostError {
  match ExitCode::from_code(code) {
    Some(ExitCode::InvalidResponse) => HostError::InvalidResponse,
    Some(ExitCode::InvalidRequest) => HostError::InvalidRequest,
    Some(ExitCode::RunnerError) => HostError::Runner {
      message: format!("workflow exited with code {}", code),
    },
    _ => HostError::execution(format!("workflow exited with code {}", code)),
  }
}

fn trap_error(e: wasmtime::Error, cancel: &CancellationToken) -> HostError {
  if let Some(trap) = e.downcast_ref::<Trap>() {
    match trap {
      Trap::OutOfFuel => return HostError::FuelExhausted,
      Trap::Interrupt => return HostError::DeadlineExceeded,
      _ => {}
    }
  }
  if cancel.is_cancelled() || matches!(e.downcast_ref::<HostError>(), Some(HostError::Cancelled)) {
    return HostError::Cancelled;
  }
  HostError::execution(format!("{:#}", e))
}
