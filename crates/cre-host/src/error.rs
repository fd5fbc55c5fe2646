use cre_protocol::CodecError;
use thiserror::Error;

/// Errors raised while loading or executing a workflow module.
#[derive(Debug, Error)]
pub enum HostError {
  /// The module configuration is inconsistent.
  #[error("invalid module config: {message}")]
  InvalidConfig { message: String },

  /// The binary is not a valid wasm module.
  #[error("failed to compile module: {message}")]
  Compile { message: String },

  /// The module does not declare a protocol version this host speaks.
  #[error("unsupported protocol version: {found}")]
  UnsupportedVersion { found: String },

  /// The host function table could not be wired to the module.
  #[error("failed to link module: {message}")]
  Link { message: String },

  /// Module instantiation failed (missing exports, start trap, etc.)
  #[error("instantiation failed: {message}")]
  Instantiation { message: String },

  #[error("wasmtime error: {0}")]
  Wasmtime(#[from] wasmtime::Error),

  #[error("protocol error: {0}")]
  Codec(#[from] CodecError),

  #[error("guest memory access out of bounds")]
  MemoryOutOfBounds,

  #[error("module does not export memory")]
  MissingMemory,

  #[error("capability not found: {0}")]
  CapabilityNotFound(String),

  #[error("capability already registered: {0}")]
  DuplicateCapability(String),

  #[error("call id already in flight: {0}")]
  DuplicateCallId(i32),

  #[error("unknown call id: {0}")]
  UnknownCallId(i32),

  #[error("secrets are not available in node mode")]
  SecretsInNodeMode,

  #[error("response of {size} bytes exceeds the maximum of {max} bytes")]
  ResponseTooLarge { size: usize, max: u64 },

  /// The store ran out of fuel.
  #[error("fuel exhausted")]
  FuelExhausted,

  /// The execution ran past its wall-clock limit.
  #[error("execution deadline exceeded")]
  DeadlineExceeded,

  #[error("execution cancelled")]
  Cancelled,

  #[error("time provider failed: {message}")]
  Time { message: String },

  /// The guest trapped for a reason other than a defined exit code.
  #[error("execution failed: {message}")]
  Execution { message: String },

  #[error("workflow could not deliver a valid response")]
  InvalidResponse,

  #[error("workflow rejected the execute request as invalid")]
  InvalidRequest,

  #[error("workflow runner failed: {message}")]
  Runner { message: String },

  #[error("workflow exited without sending a response")]
  NoResponse,
}

impl HostError {
  pub fn invalid_config(message: impl Into<String>) -> Self {
    Self::InvalidConfig {
      message: message.into(),
    }
  }

  pub fn instantiation(message: impl Into<String>) -> Self {
    Self::Instantiation {
      message: message.into(),
    }
  }

  pub fn execution(message: impl Into<String>) -> Self {
    Self::Execution {
      message: message.into(),
    }
  }

  pub fn time(message: impl Into<String>) -> Self {
    Self::Time {
      message: message.into(),
    }
  }

  /// Whether the error aborted the execution because a resource limit was hit.
  pub fn is_resource_limit(&self) -> bool {
    matches!(self, Self::FuelExhausted | Self::DeadlineExceeded)
  }
}
