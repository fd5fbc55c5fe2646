//! In-process host for running workflows in unit tests.
//!
//! [`TestHost`] implements [`Host`] natively: capabilities registered on it
//! run on their own threads, so calls started together really are in flight
//! together, the same as under the wasm host. Limits and error texts follow
//! the wasm host's defaults.

mod capability;

use std::collections::{BTreeMap, HashMap};
use std::cell::RefCell;
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver};

use cre_protocol::{
  AwaitCapabilitiesRequest, AwaitCapabilitiesResponse, AwaitSecretsRequest, AwaitSecretsResponse,
  CapabilityRequest, CapabilityResponse, DEFAULT_MAX_RESPONSE_SIZE, ExecutionResult,
  GetSecretsRequest, Mode, RESPONSE_BUFFER_TOO_SMALL, Secret, SecretError, SecretResponse, decode,
  encode, truncate_utf8,
};

pub use capability::{FnCapability, SingleNodeConsensus, TestCapability, capability_fn};

use crate::host::Host;

const DEFAULT_MAX_LOG_COUNT: usize = 1_000;
const DEFAULT_MAX_LOG_LEN: usize = 1024;

#[derive(Debug, thiserror::Error)]
pub enum TestHostError {
  #[error("capability already registered: {0}")]
  DuplicateCapability(String),
}

struct State {
  mode: Mode,
  node_mode_entries: u64,
  calls: HashMap<i32, Receiver<CapabilityResponse>>,
  secret_calls: HashMap<i32, Vec<SecretResponse>>,
  logs: Vec<String>,
  response: Option<Vec<u8>>,
}

/// A [`Host`] that serves one execution from in-process state.
pub struct TestHost {
  execution_id: String,
  now: u64,
  capabilities: BTreeMap<String, Arc<dyn TestCapability>>,
  secrets: HashMap<(String, String), String>,
  max_result_size: u64,
  max_log_count: usize,
  max_log_len: usize,
  state: RefCell<State>,
}

impl TestHost {
  pub fn new(execution_id: impl Into<String>) -> Self {
    Self {
      execution_id: execution_id.into(),
      now: 0,
      capabilities: BTreeMap::new(),
      secrets: HashMap::new(),
      max_result_size: DEFAULT_MAX_RESPONSE_SIZE,
      max_log_count: DEFAULT_MAX_LOG_COUNT,
      max_log_len: DEFAULT_MAX_LOG_LEN,
      state: RefCell::new(State {
        mode: Mode::Don,
        node_mode_entries: 0,
        calls: HashMap::new(),
        secret_calls: HashMap::new(),
        logs: Vec::new(),
        response: None,
      }),
    }
  }

  pub fn register(&mut self, capability: impl TestCapability + 'static) -> Result<(), TestHostError> {
    let id = capability.id().to_string();
    if self.capabilities.contains_key(&id) {
      return Err(TestHostError::DuplicateCapability(id));
    }
    self.capabilities.insert(id, Arc::new(capability));
    Ok(())
  }

  pub fn with_secret(
    mut self,
    namespace: impl Into<String>,
    id: impl Into<String>,
    value: impl Into<String>,
  ) -> Self {
    self
      .secrets
      .insert((namespace.into(), id.into()), value.into());
    self
  }

  /// Time returned by `now`, in nanoseconds since the unix epoch.
  pub fn with_now(mut self, nanos: u64) -> Self {
    self.now = nanos;
    self
  }

  /// Limit on the result accepted by `send_response`.
  pub fn with_max_result_size(mut self, max: u64) -> Self {
    self.max_result_size = max;
    self
  }

  /// Keep at most `count` log lines, each truncated to `len` bytes.
  pub fn with_log_limits(mut self, count: usize, len: usize) -> Self {
    self.max_log_count = count;
    self.max_log_len = len;
    self
  }

  pub fn mode(&self) -> Mode {
    self.state.borrow().mode
  }

  pub fn logs(&self) -> Vec<String> {
    self.state.borrow().logs.clone()
  }

  /// The result delivered through `send_response`, if any.
  pub fn result(&self) -> Option<ExecutionResult> {
    let state = self.state.borrow();
    state.response.as_deref().and_then(|bytes| decode(bytes).ok())
  }

  fn check_size(bytes: Vec<u8>, max_response_len: u64) -> Result<Vec<u8>, String> {
    if bytes.len() as u64 > max_response_len {
      return Err(RESPONSE_BUFFER_TOO_SMALL.to_string());
    }
    Ok(bytes)
  }
}

impl Host for TestHost {
  fn call_capability(&self, request: &[u8]) -> Result<(), String> {
    let request: CapabilityRequest = decode(request).map_err(|e| e.to_string())?;
    let capability = self
      .capabilities
      .get(&request.id)
      .cloned()
      .ok_or_else(|| format!("capability not found: {}", request.id))?;

    let mut state = self.state.borrow_mut();
    if state.calls.contains_key(&request.callback_id) {
      return Err(format!("call id already in flight: {}", request.callback_id));
    }

    let (tx, rx) = mpsc::channel();
    std::thread::spawn(move || {
      let response = match capability.invoke(&request.method, request.payload) {
        Ok(payload) => CapabilityResponse::Payload(payload),
        Err(e) => CapabilityResponse::Error(e),
      };
      let _ = tx.send(response);
    });
    state.calls.insert(request.callback_id, rx);
    Ok(())
  }

  fn await_capabilities(&self, request: &[u8], max_response_len: u64) -> Result<Vec<u8>, String> {
    let request: AwaitCapabilitiesRequest = decode(request).map_err(|e| e.to_string())?;

    let receivers = {
      let mut state = self.state.borrow_mut();
      if let Some(id) = request.ids.iter().find(|id| !state.calls.contains_key(*id)) {
        return Err(format!("unknown call id: {}", id));
      }
      request
        .ids
        .iter()
        .filter_map(|id| state.calls.remove(id).map(|rx| (*id, rx)))
        .collect::<Vec<_>>()
    };

    let mut response = AwaitCapabilitiesResponse::default();
    for (id, rx) in receivers {
      let result = rx
        .recv()
        .unwrap_or_else(|_| CapabilityResponse::Error("capability call dropped".to_string()));
      response.responses.insert(id, result);
    }

    let bytes = encode(&response).map_err(|e| e.to_string())?;
    Self::check_size(bytes, max_response_len)
  }

  fn get_secrets(&self, request: &[u8]) -> Result<(), String> {
    let request: GetSecretsRequest = decode(request).map_err(|e| e.to_string())?;
    let mut state = self.state.borrow_mut();
    if state.mode == Mode::Node {
      return Err("secrets are not available in node mode".to_string());
    }
    if state.secret_calls.contains_key(&request.callback_id) {
      return Err(format!("call id already in flight: {}", request.callback_id));
    }

    let responses = request
      .requests
      .into_iter()
      .map(|request| {
        let key = (request.namespace.clone(), request.id.clone());
        match self.secrets.get(&key) {
          Some(value) => SecretResponse::Secret(Secret {
            id: request.id,
            namespace: request.namespace,
            value: value.clone(),
          }),
          None => SecretResponse::Error(SecretError {
            error: format!("secret not found: {}/{}", request.namespace, request.id),
            id: request.id,
            namespace: request.namespace,
          }),
        }
      })
      .collect();
    state.secret_calls.insert(request.callback_id, responses);
    Ok(())
  }

  fn await_secrets(&self, request: &[u8], max_response_len: u64) -> Result<Vec<u8>, String> {
    let request: AwaitSecretsRequest = decode(request).map_err(|e| e.to_string())?;
    let mut state = self.state.borrow_mut();
    if let Some(id) = request
      .ids
      .iter()
      .find(|id| !state.secret_calls.contains_key(*id))
    {
      return Err(format!("unknown call id: {}", id));
    }

    let mut response = AwaitSecretsResponse::default();
    for id in request.ids {
      if let Some(secrets) = state.secret_calls.remove(&id) {
        response.responses.insert(id, secrets);
      }
    }

    let bytes = encode(&response).map_err(|e| e.to_string())?;
    Self::check_size(bytes, max_response_len)
  }

  fn log(&self, message: &str) {
    let mut state = self.state.borrow_mut();
    if state.logs.len() >= self.max_log_count {
      return;
    }
    state
      .logs
      .push(truncate_utf8(message, self.max_log_len).to_string());
  }

  fn switch_modes(&self, mode: Mode) {
    let mut state = self.state.borrow_mut();
    if mode == Mode::Node && state.mode != Mode::Node {
      state.node_mode_entries += 1;
    }
    state.mode = mode;
  }

  fn random_seed(&self, mode: Mode) -> i64 {
    let entries = self.state.borrow().node_mode_entries;
    cre_protocol::random_seed(&self.execution_id, mode, entries)
  }

  fn now(&self) -> Result<u64, String> {
    Ok(self.now)
  }

  fn send_response(&self, response: &[u8]) -> Result<(), String> {
    if response.len() as u64 > self.max_result_size {
      return Err(format!(
        "response of {} bytes exceeds the maximum of {} bytes",
        response.len(),
        self.max_result_size
      ));
    }
    self.state.borrow_mut().response = Some(response.to_vec());
    Ok(())
  }
}
