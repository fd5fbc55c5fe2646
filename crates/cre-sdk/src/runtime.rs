//! DON and node runtimes.
//!
//! Workflow code talks to the host through a [`DonRuntime`]. Node-local
//! observations run inside [`DonRuntime::run_in_node_mode`], which hands the
//! closure a [`NodeRuntime`] and reconciles its result through the consensus
//! capability. Each runtime is only usable in its own mode: the DON runtime
//! is poisoned for the duration of a node-mode block, and a node runtime is
//! poisoned for good once its block returns.

use std::cell::{Cell, RefCell};
use std::fmt::Display;
use std::rc::Rc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use cre_protocol::{
  AwaitCapabilitiesRequest, AwaitCapabilitiesResponse, AwaitSecretsRequest, AwaitSecretsResponse,
  CONSENSUS_CAPABILITY_ID, CONSENSUS_SIMPLE_METHOD, CapabilityRequest, CapabilityResponse,
  DEFAULT_MAX_RESPONSE_SIZE, GetSecretsRequest, Mode, Observation, Payload,
  SIMPLE_CONSENSUS_INPUTS_TYPE, Secret, SecretRequest, SecretResponse, SimpleConsensusInputs,
  decode, encode,
};
use rand::SeedableRng;
use rand::rngs::StdRng;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::consensus::ConsensusAggregation;
use crate::error::SdkError;
use crate::host::Host;
use crate::promise::Promise;
use crate::random::Rand;

/// State shared by the DON runtime and every node runtime of one execution.
struct RuntimeCore {
  host: Rc<dyn Host>,
  max_response_size: u64,
  /// Next DON call id; DON ids count up from 1.
  next_don_id: Cell<Option<i32>>,
  /// Next node call id; node ids count down from 0.
  next_node_id: Cell<Option<i32>>,
}

impl RuntimeCore {
  fn next_call_id(&self, mode: Mode) -> Result<i32, SdkError> {
    match mode {
      Mode::Don => {
        let id = self.next_don_id.get().ok_or(SdkError::CallIdsExhausted)?;
        self.next_don_id.set(id.checked_add(1));
        Ok(id)
      }
      Mode::Node => {
        let id = self.next_node_id.get().ok_or(SdkError::CallIdsExhausted)?;
        self.next_node_id.set(id.checked_sub(1));
        Ok(id)
      }
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Access {
  Active,
  Poisoned(SdkError),
}

/// Mode-scoped half of a runtime.
pub(crate) struct RuntimeBase {
  core: Rc<RuntimeCore>,
  mode: Mode,
  access: RefCell<Access>,
  rng: RefCell<Option<StdRng>>,
}

impl RuntimeBase {
  fn new(core: Rc<RuntimeCore>, mode: Mode) -> Self {
    Self {
      core,
      mode,
      access: RefCell::new(Access::Active),
      rng: RefCell::new(None),
    }
  }

  pub(crate) fn check(&self) -> Result<(), SdkError> {
    match &*self.access.borrow() {
      Access::Active => Ok(()),
      Access::Poisoned(error) => Err(error.clone()),
    }
  }

  fn set_access(&self, access: Access) {
    *self.access.borrow_mut() = access;
  }

  pub(crate) fn with_rng<R>(&self, f: impl FnOnce(&mut StdRng) -> R) -> R {
    let mut rng = self.rng.borrow_mut();
    let rng = rng.get_or_insert_with(|| {
      let seed = self.core.host.random_seed(self.mode);
      StdRng::seed_from_u64(seed as u64)
    });
    f(rng)
  }

  fn host(&self) -> &dyn Host {
    self.core.host.as_ref()
  }

  fn call_capability(&self, id: &str, method: &str, payload: Payload) -> Promise<Payload> {
    if let Err(e) = self.check() {
      return Promise::rejected(e);
    }
    let callback_id = match self.core.next_call_id(self.mode) {
      Ok(callback_id) => callback_id,
      Err(e) => return Promise::rejected(e),
    };

    let request = CapabilityRequest {
      id: id.to_string(),
      method: method.to_string(),
      payload,
      callback_id,
    };
    let started = encode(&request)
      .map_err(SdkError::from)
      .and_then(|bytes| self.host().call_capability(&bytes).map_err(SdkError::Capability));
    if let Err(e) = started {
      return Promise::rejected(e);
    }

    let core = self.core.clone();
    Promise::new(move || await_capability(&core, callback_id))
  }

  fn get_secret(&self, request: SecretRequest) -> Promise<Secret> {
    if let Err(e) = self.check() {
      return Promise::rejected(e);
    }
    let callback_id = match self.core.next_call_id(self.mode) {
      Ok(callback_id) => callback_id,
      Err(e) => return Promise::rejected(e),
    };

    let request = GetSecretsRequest {
      callback_id,
      requests: vec![request],
    };
    let started = encode(&request)
      .map_err(SdkError::from)
      .and_then(|bytes| self.host().get_secrets(&bytes).map_err(SdkError::Capability));
    if let Err(e) = started {
      return Promise::rejected(e);
    }

    let core = self.core.clone();
    Promise::new(move || await_secret(&core, callback_id))
  }

  fn log(&self, message: &str) {
    self.host().log(message);
  }

  fn now(&self) -> Result<SystemTime, SdkError> {
    let nanos = self.host().now().map_err(SdkError::Host)?;
    Ok(UNIX_EPOCH + Duration::from_nanos(nanos))
  }
}

fn await_capability(core: &RuntimeCore, callback_id: i32) -> Result<Payload, SdkError> {
  let request = encode(&AwaitCapabilitiesRequest {
    ids: vec![callback_id],
  })?;
  let bytes = core
    .host
    .await_capabilities(&request, core.max_response_size)
    .map_err(SdkError::Capability)?;
  let mut response: AwaitCapabilitiesResponse = decode(&bytes)?;
  match response.responses.remove(&callback_id) {
    Some(CapabilityResponse::Payload(payload)) => Ok(payload),
    Some(CapabilityResponse::Error(error)) => Err(SdkError::Capability(error)),
    None => Err(SdkError::Host(format!("no response for call id {}", callback_id))),
  }
}

fn await_secret(core: &RuntimeCore, callback_id: i32) -> Result<Secret, SdkError> {
  let request = encode(&AwaitSecretsRequest {
    ids: vec![callback_id],
  })?;
  let bytes = core
    .host
    .await_secrets(&request, core.max_response_size)
    .map_err(SdkError::Capability)?;
  let mut response: AwaitSecretsResponse = decode(&bytes)?;
  let secret = response
    .responses
    .remove(&callback_id)
    .and_then(|responses| responses.into_iter().next());
  match secret {
    Some(SecretResponse::Secret(secret)) => Ok(secret),
    Some(SecretResponse::Error(e)) => Err(SdkError::Secret {
      id: e.id,
      namespace: e.namespace,
      error: e.error,
    }),
    None => Err(SdkError::Host(format!("no secret for call id {}", callback_id))),
  }
}

/// Runtime for code that runs identically on every node.
#[derive(Clone)]
pub struct DonRuntime {
  base: Rc<RuntimeBase>,
}

/// Runtime handed to a node-mode block.
#[derive(Clone)]
pub struct NodeRuntime {
  base: Rc<RuntimeBase>,
}

impl DonRuntime {
  /// `max_response_size` of zero selects the protocol default.
  pub fn new(host: Rc<dyn Host>, max_response_size: u64) -> Self {
    let max_response_size = if max_response_size == 0 {
      DEFAULT_MAX_RESPONSE_SIZE
    } else {
      max_response_size
    };
    let core = RuntimeCore {
      host,
      max_response_size,
      next_don_id: Cell::new(Some(1)),
      next_node_id: Cell::new(Some(0)),
    };
    Self::from_core(Rc::new(core))
  }

  fn from_core(core: Rc<RuntimeCore>) -> Self {
    Self {
      base: Rc::new(RuntimeBase::new(core, Mode::Don)),
    }
  }

  pub fn mode(&self) -> Mode {
    Mode::Don
  }

  /// Start a capability call. The host runs it concurrently with any other
  /// outstanding call; the returned promise waits for the response.
  pub fn call_capability(&self, id: &str, method: &str, payload: Payload) -> Promise<Payload> {
    self.base.call_capability(id, method, payload)
  }

  pub fn get_secret(&self, request: SecretRequest) -> Promise<Secret> {
    self.base.get_secret(request)
  }

  /// Deterministic random source for DON mode.
  pub fn rand(&self) -> Result<Rand, SdkError> {
    self.base.check()?;
    Ok(Rand::new(self.base.clone()))
  }

  pub fn log(&self, message: &str) {
    self.base.log(message);
  }

  pub fn now(&self) -> Result<SystemTime, SdkError> {
    self.base.now()
  }

  /// Run `f` as a node-local observation and reach consensus on its result.
  ///
  /// If `aggregation` is invalid the returned promise is rejected and `f`
  /// never runs. Errors returned by `f` become error observations; the
  /// consensus outcome, value or error, is delivered through the promise.
  pub fn run_in_node_mode<T, E, F>(&self, aggregation: &ConsensusAggregation<T>, f: F) -> Promise<T>
  where
    T: Serialize + DeserializeOwned + Clone + 'static,
    E: Display,
    F: FnOnce(&NodeRuntime) -> Result<T, E>,
  {
    if let Err(e) = self.base.check() {
      return Promise::rejected(e);
    }
    let descriptor = match aggregation.descriptor() {
      Ok(descriptor) => descriptor.clone(),
      Err(e) => return Promise::rejected(e),
    };

    let node = NodeRuntime {
      base: Rc::new(RuntimeBase::new(self.base.core.clone(), Mode::Node)),
    };
    let scope = NodeModeScope::enter(&self.base, &node.base);
    let observation = match f(&node) {
      Ok(value) => match serde_json::to_value(&value) {
        Ok(value) => Observation::Value(value),
        Err(e) => Observation::Error(e.to_string()),
      },
      Err(e) => Observation::Error(e.to_string()),
    };
    drop(scope);

    let inputs = SimpleConsensusInputs {
      observation,
      descriptors: descriptor,
      default: aggregation.default_value().cloned(),
    };
    let payload = match Payload::encode(SIMPLE_CONSENSUS_INPUTS_TYPE, &inputs) {
      Ok(payload) => payload,
      Err(e) => return Promise::rejected(e.into()),
    };

    self
      .base
      .call_capability(CONSENSUS_CAPABILITY_ID, CONSENSUS_SIMPLE_METHOD, payload)
      .then(|payload| Ok(payload.decode::<T>()?))
  }
}

impl NodeRuntime {
  pub fn mode(&self) -> Mode {
    Mode::Node
  }

  pub fn call_capability(&self, id: &str, method: &str, payload: Payload) -> Promise<Payload> {
    self.base.call_capability(id, method, payload)
  }

  /// Deterministic random source for this node-mode block.
  pub fn rand(&self) -> Result<Rand, SdkError> {
    self.base.check()?;
    Ok(Rand::new(self.base.clone()))
  }

  pub fn log(&self, message: &str) {
    self.base.log(message);
  }

  pub fn now(&self) -> Result<SystemTime, SdkError> {
    self.base.now()
  }
}

/// Keeps the runtimes and the host mode flag consistent for the duration of a
/// node-mode block, including when the block unwinds.
struct NodeModeScope<'a> {
  don: &'a RuntimeBase,
  node: &'a RuntimeBase,
}

impl<'a> NodeModeScope<'a> {
  fn enter(don: &'a RuntimeBase, node: &'a RuntimeBase) -> Self {
    don.set_access(Access::Poisoned(SdkError::DonModeCallInNodeMode));
    don.host().switch_modes(Mode::Node);
    Self { don, node }
  }
}

impl Drop for NodeModeScope<'_> {
  fn drop(&mut self) {
    self.don.host().switch_modes(Mode::Don);
    self.don.set_access(Access::Active);
    self.node.set_access(Access::Poisoned(SdkError::NodeModeCallInDonMode));
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  struct NullHost;

  impl Host for NullHost {
    fn call_capability(&self, _request: &[u8]) -> Result<(), String> {
      Ok(())
    }

    fn await_capabilities(&self, _request: &[u8], _max: u64) -> Result<Vec<u8>, String> {
      Err("not available".to_string())
    }

    fn get_secrets(&self, _request: &[u8]) -> Result<(), String> {
      Ok(())
    }

    fn await_secrets(&self, _request: &[u8], _max: u64) -> Result<Vec<u8>, String> {
      Err("not available".to_string())
    }

    fn log(&self, _message: &str) {}

    fn switch_modes(&self, _mode: Mode) {}

    fn random_seed(&self, mode: Mode) -> i64 {
      mode.as_i32() as i64
    }

    fn now(&self) -> Result<u64, String> {
      Ok(0)
    }

    fn send_response(&self, _response: &[u8]) -> Result<(), String> {
      Ok(())
    }
  }

  fn core() -> RuntimeCore {
    RuntimeCore {
      host: Rc::new(NullHost),
      max_response_size: DEFAULT_MAX_RESPONSE_SIZE,
      next_don_id: Cell::new(Some(1)),
      next_node_id: Cell::new(Some(0)),
    }
  }

  #[test]
  fn test_call_id_directions() {
    let core = core();
    assert_eq!(core.next_call_id(Mode::Don), Ok(1));
    assert_eq!(core.next_call_id(Mode::Node), Ok(0));
    assert_eq!(core.next_call_id(Mode::Don), Ok(2));
    assert_eq!(core.next_call_id(Mode::Node), Ok(-1));
    assert_eq!(core.next_call_id(Mode::Node), Ok(-2));
  }

  #[test]
  fn test_call_ids_exhausted() {
    let core = core();
    core.next_don_id.set(Some(i32::MAX));
    core.next_node_id.set(Some(i32::MIN));

    assert_eq!(core.next_call_id(Mode::Don), Ok(i32::MAX));
    assert_eq!(core.next_call_id(Mode::Don), Err(SdkError::CallIdsExhausted));
    assert_eq!(core.next_call_id(Mode::Node), Ok(i32::MIN));
    assert_eq!(core.next_call_id(Mode::Node), Err(SdkError::CallIdsExhausted));
  }

  #[test]
  fn test_exhausted_ids_reject_calls() {
    let runtime = DonRuntime::from_core(Rc::new(core()));
    runtime.base.core.next_don_id.set(None);

    let promise = runtime.call_capability("a@1.0.0", "Run", Payload::new("t", serde_json::Value::Null));
    assert_eq!(promise.wait(), Err(SdkError::CallIdsExhausted));
  }
}
