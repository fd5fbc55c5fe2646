use std::fmt::Display;

use cre_protocol::{Payload, TriggerSubscription};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::SdkError;
use crate::runtime::DonRuntime;

/// A trigger capability a workflow can subscribe to.
pub trait Trigger {
  /// Event payload delivered when the trigger fires.
  type Output: DeserializeOwned;

  fn capability_id(&self) -> &str;

  fn method(&self) -> &str;

  /// Subscription config sent to the trigger capability.
  fn config_payload(&self) -> Result<Payload, SdkError>;
}

type Callback<C> = Box<dyn Fn(&C, &DonRuntime, Payload) -> Result<serde_json::Value, SdkError>>;

/// A trigger subscription paired with the callback that handles its events.
pub struct Handler<C> {
  subscription: Result<TriggerSubscription, SdkError>,
  callback: Callback<C>,
}

/// The handler table of a workflow. Trigger events select a handler by index.
pub type Workflow<C> = Vec<Handler<C>>;

/// Bind `callback` to `trigger`.
pub fn handler<C, T, O, E, F>(trigger: T, callback: F) -> Handler<C>
where
  T: Trigger,
  O: Serialize,
  E: Display,
  F: Fn(&C, &DonRuntime, T::Output) -> Result<O, E> + 'static,
{
  let subscription = trigger.config_payload().map(|payload| TriggerSubscription {
    id: trigger.capability_id().to_string(),
    method: trigger.method().to_string(),
    payload,
  });

  let callback = move |config: &C,
                       runtime: &DonRuntime,
                       payload: Payload|
        -> Result<serde_json::Value, SdkError> {
    let event: T::Output = payload.decode()?;
    let output = callback(config, runtime, event).map_err(SdkError::workflow)?;
    serde_json::to_value(output).map_err(|e| SdkError::Codec(e.to_string()))
  };

  Handler {
    subscription,
    callback: Box::new(callback),
  }
}

impl<C> Handler<C> {
  pub fn subscription(&self) -> Result<&TriggerSubscription, SdkError> {
    self.subscription.as_ref().map_err(Clone::clone)
  }

  pub(crate) fn invoke(
    &self,
    config: &C,
    runtime: &DonRuntime,
    payload: Payload,
  ) -> Result<serde_json::Value, SdkError> {
    (self.callback)(config, runtime, payload)
  }
}
