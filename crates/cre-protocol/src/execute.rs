use serde::{Deserialize, Serialize};

use crate::capability::Payload;

/// Top-level request handed to a workflow binary for one execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecuteRequest {
  /// Execution id; seeds deterministic randomness.
  pub id: String,
  /// Workflow configuration, parsed by the workflow itself.
  #[serde(default)]
  pub config: Vec<u8>,
  /// Upper bound for any response buffer in this execution. Zero means the
  /// host default.
  #[serde(default)]
  pub max_response_size: u64,
  pub request: Request,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Request {
  /// Ask the workflow which triggers it wants to subscribe to.
  Subscribe,
  /// Run the handler registered for a subscription.
  Trigger(TriggerEvent),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerEvent {
  /// Index of the subscription (as returned by the subscribe phase).
  pub id: u64,
  pub payload: Payload,
}

/// A trigger the workflow wants to be invoked by.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerSubscription {
  /// Capability id of the trigger.
  pub id: String,
  pub method: String,
  pub payload: Payload,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TriggerSubscriptionRequest {
  pub subscriptions: Vec<TriggerSubscription>,
}

/// Final outcome of an execution, delivered through `send_response`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionResult {
  Value(serde_json::Value),
  Error(String),
  TriggerSubscriptions(TriggerSubscriptionRequest),
}

impl ExecuteRequest {
  pub fn subscribe(id: impl Into<String>, config: Vec<u8>) -> Self {
    Self {
      id: id.into(),
      config,
      max_response_size: 0,
      request: Request::Subscribe,
    }
  }

  pub fn trigger(id: impl Into<String>, config: Vec<u8>, trigger_id: u64, payload: Payload) -> Self {
    Self {
      id: id.into(),
      config,
      max_response_size: 0,
      request: Request::Trigger(TriggerEvent {
        id: trigger_id,
        payload,
      }),
    }
  }

  pub fn with_max_response_size(mut self, max_response_size: u64) -> Self {
    self.max_response_size = max_response_size;
    self
  }
}
