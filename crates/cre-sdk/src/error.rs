use cre_protocol::CodecError;
use thiserror::Error;

/// Errors surfaced to workflow code.
///
/// Cloneable so a memoized promise can hand the same error out on every wait.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SdkError {
  /// The DON runtime was used while a node-mode block was running.
  #[error("cannot use the DON runtime while in node mode")]
  DonModeCallInNodeMode,

  /// A node runtime was used after its node-mode block returned.
  #[error("cannot use a node runtime outside of its node mode block")]
  NodeModeCallInDonMode,

  #[error("call ids exhausted")]
  CallIdsExhausted,

  /// Error reported by a capability or by the host bridge for a call.
  #[error("{0}")]
  Capability(String),

  #[error("secret {namespace}/{id}: {error}")]
  Secret {
    id: String,
    namespace: String,
    error: String,
  },

  #[error("host call failed: {0}")]
  Host(String),

  #[error("{0}")]
  Codec(String),

  /// The consensus aggregation could not be built for the requested type.
  #[error("invalid consensus aggregation: {0}")]
  Descriptor(String),

  #[error("promise waited on while it was being resolved")]
  PromiseReentered,

  /// Error returned by workflow code.
  #[error("{0}")]
  Workflow(String),
}

impl SdkError {
  pub fn workflow(message: impl std::fmt::Display) -> Self {
    Self::Workflow(message.to_string())
  }

  pub fn descriptor(message: impl Into<String>) -> Self {
    Self::Descriptor(message.into())
  }
}

impl From<CodecError> for SdkError {
  fn from(e: CodecError) -> Self {
    Self::Codec(e.to_string())
  }
}
