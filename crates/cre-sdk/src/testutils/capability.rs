use cre_protocol::{
  CONSENSUS_CAPABILITY_ID, CONSENSUS_SIMPLE_METHOD, CONSENSUS_VALUE_TYPE, Observation, Payload,
  SimpleConsensusInputs,
};

/// A capability served by [`TestHost`](super::TestHost).
///
/// Invoked on a worker thread, hence `Send + Sync`.
pub trait TestCapability: Send + Sync {
  fn id(&self) -> &str;

  fn invoke(&self, method: &str, payload: Payload) -> Result<Payload, String>;
}

type InvokeFn = Box<dyn Fn(&str, Payload) -> Result<Payload, String> + Send + Sync>;

/// A [`TestCapability`] backed by a closure.
pub struct FnCapability {
  id: String,
  invoke: InvokeFn,
}

pub fn capability_fn<F>(id: impl Into<String>, invoke: F) -> FnCapability
where
  F: Fn(&str, Payload) -> Result<Payload, String> + Send + Sync + 'static,
{
  FnCapability {
    id: id.into(),
    invoke: Box::new(invoke),
  }
}

impl TestCapability for FnCapability {
  fn id(&self) -> &str {
    &self.id
  }

  fn invoke(&self, method: &str, payload: Payload) -> Result<Payload, String> {
    (self.invoke)(method, payload)
  }
}

/// Consensus among a network of one: the local observation wins.
///
/// Error observations resolve to the default when one was supplied.
#[derive(Debug, Default, Clone, Copy)]
pub struct SingleNodeConsensus;

impl TestCapability for SingleNodeConsensus {
  fn id(&self) -> &str {
    CONSENSUS_CAPABILITY_ID
  }

  fn invoke(&self, method: &str, payload: Payload) -> Result<Payload, String> {
    if method != CONSENSUS_SIMPLE_METHOD {
      return Err(format!("unsupported method: {}", method));
    }
    let inputs: SimpleConsensusInputs = payload.decode().map_err(|e| e.to_string())?;
    let value = match (inputs.observation, inputs.default) {
      (Observation::Value(value), _) => value,
      (Observation::Error(_), Some(default)) => default,
      (Observation::Error(error), None) => return Err(error),
    };
    Ok(Payload::new(CONSENSUS_VALUE_TYPE, value))
  }
}
