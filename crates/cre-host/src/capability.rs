//! Capabilities callable from workflow code.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use cre_protocol::{Mode, Payload};
use thiserror::Error;

use crate::error::HostError;

/// Everything a capability learns about one invocation.
#[derive(Debug, Clone)]
pub struct CapabilityInvocation {
  pub execution_id: String,
  /// Host-wide unique id of this call, `<execution_id>:<n>`.
  pub call_id: String,
  /// Mode the workflow was in when it issued the call.
  pub mode: Mode,
  pub method: String,
  pub payload: Payload,
}

#[derive(Debug, Error)]
pub enum CapabilityError {
  #[error("method not supported: {0}")]
  UnsupportedMethod(String),

  #[error("invalid payload: {0}")]
  InvalidPayload(String),

  #[error("{0}")]
  Failed(String),
}

impl CapabilityError {
  pub fn failed(message: impl Into<String>) -> Self {
    Self::Failed(message.into())
  }
}

/// An externally implemented capability.
#[async_trait]
pub trait Capability: Send + Sync {
  /// Capability identifier, e.g. `consensus@1.0.0-alpha`.
  fn id(&self) -> &str;

  async fn invoke(&self, invocation: CapabilityInvocation) -> Result<Payload, CapabilityError>;
}

/// The set of capabilities available to executions.
#[derive(Default, Clone)]
pub struct CapabilityRegistry {
  capabilities: BTreeMap<String, Arc<dyn Capability>>,
}

impl CapabilityRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  /// Register a capability under its own id. Ids must be unique.
  pub fn register(&mut self, capability: Arc<dyn Capability>) -> Result<(), HostError> {
    let id = capability.id().to_string();
    if self.capabilities.contains_key(&id) {
      return Err(HostError::DuplicateCapability(id));
    }
    self.capabilities.insert(id, capability);
    Ok(())
  }

  pub fn get(&self, id: &str) -> Option<Arc<dyn Capability>> {
    self.capabilities.get(id).cloned()
  }

  pub fn ids(&self) -> impl Iterator<Item = &str> {
    self.capabilities.keys().map(String::as_str)
  }
}

impl std::fmt::Debug for CapabilityRegistry {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("CapabilityRegistry")
      .field("ids", &self.capabilities.keys().collect::<Vec<_>>())
      .finish()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  struct Echo;

  #[async_trait]
  impl Capability for Echo {
    fn id(&self) -> &str {
      "echo@1.0.0"
    }

    async fn invoke(&self, invocation: CapabilityInvocation) -> Result<Payload, CapabilityError> {
      Ok(invocation.payload)
    }
  }

  #[test]
  fn test_register_and_get() {
    let mut registry = CapabilityRegistry::new();
    registry.register(Arc::new(Echo)).unwrap();

    assert!(registry.get("echo@1.0.0").is_some());
    assert!(registry.get("missing@1.0.0").is_none());
    assert_eq!(registry.ids().collect::<Vec<_>>(), vec!["echo@1.0.0"]);
  }

  #[test]
  fn test_register_rejects_duplicates() {
    let mut registry = CapabilityRegistry::new();
    registry.register(Arc::new(Echo)).unwrap();

    let err = registry.register(Arc::new(Echo)).unwrap_err();
    assert!(matches!(err, HostError::DuplicateCapability(id) if id == "echo@1.0.0"));
  }
}
