//! Per-execution host state: the capability bridge, secrets, mode and
//! the virtual clock.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use cre_protocol::{
  CapabilityRequest, CapabilityResponse, GetSecretsRequest, Mode, Secret, SecretError,
  SecretResponse, truncate_utf8,
};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};

use crate::capability::{CapabilityInvocation, CapabilityRegistry};
use crate::engine::ModuleConfig;
use crate::error::HostError;
use crate::secrets::{InMemorySecrets, SecretsProvider};
use crate::time::{SystemClock, TimeFetcher, TimeProvider};

/// External services an execution may reach.
#[derive(Clone)]
pub struct HostServices {
  pub capabilities: Arc<CapabilityRegistry>,
  pub secrets: Arc<dyn SecretsProvider>,
  pub clock: Arc<dyn TimeProvider>,
}

impl HostServices {
  /// Services with no secrets and the system clock.
  pub fn new(capabilities: Arc<CapabilityRegistry>) -> Self {
    Self {
      capabilities,
      secrets: Arc::new(InMemorySecrets::new()),
      clock: Arc::new(SystemClock),
    }
  }

  pub fn with_secrets(mut self, secrets: Arc<dyn SecretsProvider>) -> Self {
    self.secrets = secrets;
    self
  }

  pub fn with_clock(mut self, clock: Arc<dyn TimeProvider>) -> Self {
    self.clock = clock;
    self
  }
}

type Pending<T> = HashMap<i32, oneshot::Receiver<T>>;

/// State of one workflow execution, owned by its store.
pub struct Execution {
  execution_id: String,
  services: HostServices,
  cancel: CancellationToken,
  time: Arc<TimeFetcher>,
  mode: Mode,
  node_mode_entries: u64,
  capability_calls: Pending<CapabilityResponse>,
  secret_calls: Pending<Vec<SecretResponse>>,
  /// Guest callback id to host-wide call id.
  external_ids: HashMap<i32, String>,
  next_call: u64,
  /// Nanoseconds the guest has slept so far.
  clock_offset: u64,
  last_time: Option<u64>,
  log_count: usize,
  log_limit_warned: bool,
  max_log_len: usize,
  max_log_count: usize,
  max_response_size: u64,
  max_result_size: u64,
  response: Option<Vec<u8>>,
}

impl Execution {
  /// `max_response_size` bounds await responses; zero selects the module
  /// default. The final result is bounded by `config.max_result_size`.
  pub fn new(
    execution_id: impl Into<String>,
    services: HostServices,
    cancel: CancellationToken,
    config: &ModuleConfig,
    max_response_size: u64,
  ) -> Self {
    let time = Arc::new(TimeFetcher::new(services.clock.clone(), cancel.clone()));
    let max_response_size = if max_response_size == 0 {
      config.max_response_size
    } else {
      max_response_size
    };
    Self {
      execution_id: execution_id.into(),
      services,
      cancel,
      time,
      mode: Mode::Don,
      node_mode_entries: 0,
      capability_calls: HashMap::new(),
      secret_calls: HashMap::new(),
      external_ids: HashMap::new(),
      next_call: 0,
      clock_offset: 0,
      last_time: None,
      log_count: 0,
      log_limit_warned: false,
      max_log_len: config.max_log_len_bytes,
      max_log_count: config.max_log_count,
      max_response_size,
      max_result_size: config.max_result_size,
      response: None,
    }
  }

  pub fn execution_id(&self) -> &str {
    &self.execution_id
  }

  pub fn mode(&self) -> Mode {
    self.mode
  }

  pub fn cancel_token(&self) -> CancellationToken {
    self.cancel.clone()
  }

  pub fn time_fetcher(&self) -> Arc<TimeFetcher> {
    self.time.clone()
  }

  pub fn max_response_size(&self) -> u64 {
    self.max_response_size
  }

  /// Start a capability call in the background.
  ///
  /// Fails synchronously when the capability is unknown or the callback id is
  /// already in flight.
  pub fn call_capability(&mut self, request: CapabilityRequest) -> Result<(), HostError> {
    let capability = self
      .services
      .capabilities
      .get(&request.id)
      .ok_or_else(|| HostError::CapabilityNotFound(request.id.clone()))?;
    if self.capability_calls.contains_key(&request.callback_id) {
      return Err(HostError::DuplicateCallId(request.callback_id));
    }

    let call_id = format!("{}:{}", self.execution_id, self.next_call);
    self.next_call += 1;
    self.external_ids.insert(request.callback_id, call_id.clone());

    let span = info_span!(
      "capability",
      execution_id = %self.execution_id,
      capability_id = %request.id,
      call_id = %call_id,
    );
    let invocation = CapabilityInvocation {
      execution_id: self.execution_id.clone(),
      call_id,
      mode: self.mode,
      method: request.method,
      payload: request.payload,
    };

    let (tx, rx) = oneshot::channel();
    self.capability_calls.insert(request.callback_id, rx);

    let cancel = self.cancel.clone();
    tokio::spawn(
      async move {
        let response = tokio::select! {
          biased;
          _ = cancel.cancelled() => return,
          result = capability.invoke(invocation) => match result {
            Ok(payload) => CapabilityResponse::Payload(payload),
            Err(e) => {
              debug!(error = %e, "capability returned an error");
              CapabilityResponse::Error(e.to_string())
            }
          },
        };
        let _ = tx.send(response);
      }
      .instrument(span),
    );

    Ok(())
  }

  /// Remove the pending calls for `ids`. Every id must be outstanding;
  /// otherwise nothing is removed.
  pub fn take_capability_calls(
    &mut self,
    ids: &[i32],
  ) -> Result<Vec<(i32, oneshot::Receiver<CapabilityResponse>)>, HostError> {
    let taken = take_pending(&mut self.capability_calls, ids)?;
    for (id, _) in &taken {
      self.external_ids.remove(id);
    }
    Ok(taken)
  }

  /// Host-wide id of an outstanding capability call.
  pub fn external_call_id(&self, callback_id: i32) -> Option<&str> {
    self.external_ids.get(&callback_id).map(String::as_str)
  }

  /// Start fetching a batch of secrets. Only allowed in DON mode.
  pub fn get_secrets(&mut self, request: GetSecretsRequest) -> Result<(), HostError> {
    if self.mode == Mode::Node {
      return Err(HostError::SecretsInNodeMode);
    }
    if self.secret_calls.contains_key(&request.callback_id) {
      return Err(HostError::DuplicateCallId(request.callback_id));
    }

    let (tx, rx) = oneshot::channel();
    self.secret_calls.insert(request.callback_id, rx);

    let provider = self.services.secrets.clone();
    let cancel = self.cancel.clone();
    let span = info_span!(
      "secrets",
      execution_id = %self.execution_id,
      callback_id = request.callback_id,
    );
    tokio::spawn(
      async move {
        let fetch = async {
          let mut responses = Vec::with_capacity(request.requests.len());
          for secret in request.requests {
            let response = match provider.get(&secret.namespace, &secret.id).await {
              Ok(value) => SecretResponse::Secret(Secret {
                id: secret.id,
                namespace: secret.namespace,
                value,
              }),
              Err(error) => SecretResponse::Error(SecretError {
                id: secret.id,
                namespace: secret.namespace,
                error,
              }),
            };
            responses.push(response);
          }
          responses
        };
        let responses = tokio::select! {
          biased;
          _ = cancel.cancelled() => return,
          responses = fetch => responses,
        };
        let _ = tx.send(responses);
      }
      .instrument(span),
    );

    Ok(())
  }

  pub fn take_secret_calls(
    &mut self,
    ids: &[i32],
  ) -> Result<Vec<(i32, oneshot::Receiver<Vec<SecretResponse>>)>, HostError> {
    take_pending(&mut self.secret_calls, ids)
  }

  pub fn switch_mode(&mut self, mode: Mode) {
    if mode == Mode::Node && self.mode != Mode::Node {
      self.node_mode_entries += 1;
    }
    debug!(execution_id = %self.execution_id, from = %self.mode, to = %mode, "switching mode");
    self.mode = mode;
  }

  pub fn random_seed(&self, mode: Mode) -> i64 {
    cre_protocol::random_seed(&self.execution_id, mode, self.node_mode_entries)
  }

  /// Emit a guest log line under the `workflow` target.
  pub fn log(&mut self, message: &[u8]) {
    if self.log_count >= self.max_log_count {
      if !self.log_limit_warned {
        warn!(
          execution_id = %self.execution_id,
          max_log_count = self.max_log_count,
          "workflow log limit reached, dropping further logs"
        );
        self.log_limit_warned = true;
      }
      return;
    }
    self.log_count += 1;

    let message = String::from_utf8_lossy(message);
    let line = truncate_utf8(&message, self.max_log_len);
    info!(
      target: "workflow",
      execution_id = %self.execution_id,
      mode = %self.mode,
      "{}",
      line
    );
  }

  /// Number of guest log lines emitted so far.
  pub fn log_count(&self) -> usize {
    self.log_count
  }

  /// Combine a freshly fetched time with the virtual clock.
  pub fn observe_time(&mut self, fetched_nanos: u64) -> u64 {
    self.last_time = Some(fetched_nanos);
    fetched_nanos.saturating_add(self.clock_offset)
  }

  /// Whether any time has been fetched yet in this execution.
  pub fn has_observed_time(&self) -> bool {
    self.last_time.is_some()
  }

  /// Current virtual time, based on the last observed time.
  pub fn virtual_now(&self) -> u64 {
    self.last_time.unwrap_or(0).saturating_add(self.clock_offset)
  }

  /// Advance the virtual clock by `nanos`.
  pub fn sleep_for(&mut self, nanos: u64) {
    self.clock_offset = self.clock_offset.saturating_add(nanos);
  }

  /// Advance the virtual clock so it reads at least `deadline`.
  pub fn sleep_until(&mut self, deadline: u64) {
    let now = self.virtual_now();
    if deadline > now {
      self.sleep_for(deadline - now);
    }
  }

  pub fn set_response(&mut self, response: Vec<u8>) -> Result<(), HostError> {
    if response.len() as u64 > self.max_result_size {
      return Err(HostError::ResponseTooLarge {
        size: response.len(),
        max: self.max_result_size,
      });
    }
    self.response = Some(response);
    Ok(())
  }

  pub fn take_response(&mut self) -> Option<Vec<u8>> {
    self.response.take()
  }
}

fn take_pending<T>(
  pending: &mut Pending<T>,
  ids: &[i32],
) -> Result<Vec<(i32, oneshot::Receiver<T>)>, HostError> {
  if let Some(id) = ids.iter().find(|id| !pending.contains_key(*id)) {
    return Err(HostError::UnknownCallId(*id));
  }
  Ok(
    ids
      .iter()
      .filter_map(|id| pending.remove(id).map(|rx| (*id, rx)))
      .collect(),
  )
}

/// Wait for every receiver, keyed by call id.
///
/// A receiver whose sender went away resolves to `dropped()`. Cancellation
/// aborts the whole wait.
pub async fn await_all<T>(
  receivers: Vec<(i32, oneshot::Receiver<T>)>,
  cancel: &CancellationToken,
  dropped: impl Fn() -> T,
) -> Result<BTreeMap<i32, T>, HostError> {
  let mut results = BTreeMap::new();
  for (id, rx) in receivers {
    let result = tokio::select! {
      biased;
      _ = cancel.cancelled() => return Err(HostError::Cancelled),
      result = rx => result.unwrap_or_else(|_| dropped()),
    };
    results.insert(id, result);
  }
  Ok(results)
}

#[cfg(test)]
mod tests {
  use std::time::Duration;

  use async_trait::async_trait;
  use cre_protocol::{Payload, SecretRequest};
  use tokio::sync::Barrier;

  use super::*;
  use crate::capability::{Capability, CapabilityError};

  struct Echo;

  #[async_trait]
  impl Capability for Echo {
    fn id(&self) -> &str {
      "echo@1.0.0"
    }

    async fn invoke(&self, invocation: CapabilityInvocation) -> Result<Payload, CapabilityError> {
      if invocation.method == "Fail" {
        return Err(CapabilityError::failed("echo failed"));
      }
      Ok(invocation.payload)
    }
  }

  /// Completes only once two invocations are in flight at the same time.
  struct Rendezvous(Barrier);

  #[async_trait]
  impl Capability for Rendezvous {
    fn id(&self) -> &str {
      "rendezvous@1.0.0"
    }

    async fn invoke(&self, invocation: CapabilityInvocation) -> Result<Payload, CapabilityError> {
      self.0.wait().await;
      Ok(invocation.payload)
    }
  }

  struct Stalled;

  #[async_trait]
  impl Capability for Stalled {
    fn id(&self) -> &str {
      "stalled@1.0.0"
    }

    async fn invoke(&self, _invocation: CapabilityInvocation) -> Result<Payload, CapabilityError> {
      std::future::pending().await
    }
  }

  fn execution_with(capabilities: Vec<Arc<dyn Capability>>, cancel: CancellationToken) -> Execution {
    let mut registry = CapabilityRegistry::new();
    for capability in capabilities {
      registry.register(capability).unwrap();
    }
    let secrets = InMemorySecrets::new().with_secret("main", "token", "abc");
    let services = HostServices::new(Arc::new(registry)).with_secrets(Arc::new(secrets));
    Execution::new("exec-1", services, cancel, &ModuleConfig::default(), 0)
  }

  fn request(id: &str, method: &str, callback_id: i32) -> CapabilityRequest {
    CapabilityRequest {
      id: id.to_string(),
      method: method.to_string(),
      payload: Payload::new("test.Input", serde_json::json!({ "callback": callback_id })),
      callback_id,
    }
  }

  fn dropped() -> CapabilityResponse {
    CapabilityResponse::Error("dropped".to_string())
  }

  #[tokio::test]
  async fn test_call_and_await() {
    let cancel = CancellationToken::new();
    let mut execution = execution_with(vec![Arc::new(Echo)], cancel.clone());

    execution.call_capability(request("echo@1.0.0", "Run", 1)).unwrap();
    execution.call_capability(request("echo@1.0.0", "Fail", 2)).unwrap();
    assert_eq!(execution.external_call_id(1), Some("exec-1:0"));
    assert_eq!(execution.external_call_id(2), Some("exec-1:1"));

    let calls = execution.take_capability_calls(&[1, 2]).unwrap();
    let responses = await_all(calls, &cancel, dropped).await.unwrap();

    assert_eq!(
      responses[&1],
      CapabilityResponse::Payload(Payload::new("test.Input", serde_json::json!({ "callback": 1 })))
    );
    assert_eq!(responses[&2], CapabilityResponse::Error("echo failed".to_string()));
    assert_eq!(execution.external_call_id(1), None);
  }

  #[tokio::test]
  async fn test_unknown_capability_fails_synchronously() {
    let mut execution = execution_with(vec![], CancellationToken::new());

    let err = execution
      .call_capability(request("missing@1.0.0", "Run", 1))
      .unwrap_err();
    assert_eq!(err.to_string(), "capability not found: missing@1.0.0");
  }

  #[tokio::test]
  async fn test_duplicate_callback_id() {
    let mut execution = execution_with(vec![Arc::new(Echo)], CancellationToken::new());

    execution.call_capability(request("echo@1.0.0", "Run", 7)).unwrap();
    let err = execution
      .call_capability(request("echo@1.0.0", "Run", 7))
      .unwrap_err();
    assert!(matches!(err, HostError::DuplicateCallId(7)));
  }

  #[tokio::test]
  async fn test_unknown_call_id_consumes_nothing() {
    let mut execution = execution_with(vec![Arc::new(Echo)], CancellationToken::new());
    execution.call_capability(request("echo@1.0.0", "Run", 1)).unwrap();

    let err = execution.take_capability_calls(&[1, 99]).unwrap_err();
    assert_eq!(err.to_string(), "unknown call id: 99");

    // Still outstanding, and only consumable once.
    assert_eq!(execution.take_capability_calls(&[1]).unwrap().len(), 1);
    assert!(matches!(
      execution.take_capability_calls(&[1]),
      Err(HostError::UnknownCallId(1))
    ));
  }

  #[tokio::test]
  async fn test_calls_run_concurrently() {
    let cancel = CancellationToken::new();
    let mut execution = execution_with(vec![Arc::new(Rendezvous(Barrier::new(2)))], cancel.clone());

    execution.call_capability(request("rendezvous@1.0.0", "Run", 1)).unwrap();
    execution.call_capability(request("rendezvous@1.0.0", "Run", 2)).unwrap();

    let calls = execution.take_capability_calls(&[1, 2]).unwrap();
    let responses = tokio::time::timeout(Duration::from_secs(5), await_all(calls, &cancel, dropped))
      .await
      .expect("calls did not run concurrently")
      .unwrap();
    assert_eq!(responses.len(), 2);
  }

  #[tokio::test]
  async fn test_cancellation_aborts_await() {
    let cancel = CancellationToken::new();
    let mut execution = execution_with(vec![Arc::new(Stalled)], cancel.clone());
    execution.call_capability(request("stalled@1.0.0", "Run", 1)).unwrap();
    let calls = execution.take_capability_calls(&[1]).unwrap();

    let canceller = cancel.clone();
    tokio::spawn(async move {
      tokio::time::sleep(Duration::from_millis(20)).await;
      canceller.cancel();
    });

    let result = await_all(calls, &cancel, dropped).await;
    assert!(matches!(result, Err(HostError::Cancelled)));
  }

  #[tokio::test]
  async fn test_secrets_only_in_don_mode() {
    let cancel = CancellationToken::new();
    let mut execution = execution_with(vec![], cancel.clone());
    let secrets = GetSecretsRequest {
      callback_id: 1,
      requests: vec![
        SecretRequest {
          id: "token".to_string(),
          namespace: "main".to_string(),
        },
        SecretRequest {
          id: "missing".to_string(),
          namespace: "main".to_string(),
        },
      ],
    };

    execution.switch_mode(Mode::Node);
    assert!(matches!(
      execution.get_secrets(secrets.clone()),
      Err(HostError::SecretsInNodeMode)
    ));

    execution.switch_mode(Mode::Don);
    execution.get_secrets(secrets).unwrap();
    let calls = execution.take_secret_calls(&[1]).unwrap();
    let responses = await_all(calls, &cancel, Vec::new).await.unwrap();

    assert_eq!(
      responses[&1],
      vec![
        SecretResponse::Secret(Secret {
          id: "token".to_string(),
          namespace: "main".to_string(),
          value: "abc".to_string(),
        }),
        SecretResponse::Error(SecretError {
          id: "missing".to_string(),
          namespace: "main".to_string(),
          error: "secret not found: main/missing".to_string(),
        }),
      ]
    );
  }

  #[tokio::test]
  async fn test_node_seed_changes_per_entry() {
    let mut execution = execution_with(vec![], CancellationToken::new());
    let don = execution.random_seed(Mode::Don);

    execution.switch_mode(Mode::Node);
    let first = execution.random_seed(Mode::Node);
    execution.switch_mode(Mode::Don);
    execution.switch_mode(Mode::Node);
    let second = execution.random_seed(Mode::Node);

    assert_ne!(first, second);
    assert_eq!(execution.random_seed(Mode::Don), don);
  }

  #[tokio::test]
  async fn test_log_limit() {
    let config = ModuleConfig {
      max_log_count: 2,
      ..ModuleConfig::default()
    };
    let services = HostServices::new(Arc::new(CapabilityRegistry::new()));
    let mut execution = Execution::new("exec-1", services, CancellationToken::new(), &config, 0);

    for _ in 0..5 {
      execution.log(b"hello");
    }
    assert_eq!(execution.log_count(), 2);
  }

  #[tokio::test]
  async fn test_response_size_limit() {
    let config = ModuleConfig {
      max_result_size: 4,
      ..ModuleConfig::default()
    };
    let services = HostServices::new(Arc::new(CapabilityRegistry::new()));
    let mut execution = Execution::new("exec-1", services, CancellationToken::new(), &config, 0);

    assert!(matches!(
      execution.set_response(b"too long".to_vec()),
      Err(HostError::ResponseTooLarge { size: 8, max: 4 })
    ));
    execution.set_response(b"ok".to_vec()).unwrap();
    assert_eq!(execution.take_response(), Some(b"ok".to_vec()));
    assert_eq!(execution.take_response(), None);
  }

  #[tokio::test]
  async fn test_await_limit_does_not_bound_result() {
    let services = HostServices::new(Arc::new(CapabilityRegistry::new()));
    let mut execution = Execution::new(
      "exec-1",
      services,
      CancellationToken::new(),
      &ModuleConfig::default(),
      1,
    );

    assert_eq!(execution.max_response_size(), 1);
    execution
      .set_response(br#"{"error":"response buffer too small"}"#.to_vec())
      .unwrap();
    assert!(execution.take_response().is_some());
  }

  #[tokio::test]
  async fn test_virtual_clock() {
    let mut execution = execution_with(vec![], CancellationToken::new());
    assert!(!execution.has_observed_time());

    assert_eq!(execution.observe_time(1_000), 1_000);
    assert!(execution.has_observed_time());
    execution.sleep_for(500);
    assert_eq!(execution.virtual_now(), 1_500);
    execution.sleep_until(2_000);
    assert_eq!(execution.observe_time(1_000), 2_000);
    execution.sleep_until(10);
    assert_eq!(execution.virtual_now(), 2_000);
  }
}
