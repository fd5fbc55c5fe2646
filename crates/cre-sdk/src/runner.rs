use std::fmt::Display;
use std::rc::Rc;

use cre_protocol::{
  ExecuteRequest, ExecutionResult, ExitCode, Request, TriggerSubscriptionRequest, encode,
};

use crate::host::Host;
use crate::runtime::DonRuntime;
use crate::workflow::Workflow;

/// Drives one execution: builds the workflow, dispatches the request and
/// delivers the result to the host.
pub struct Runner {
  host: Rc<dyn Host>,
  request: ExecuteRequest,
}

impl Runner {
  pub fn new(host: Rc<dyn Host>, request: ExecuteRequest) -> Self {
    Self { host, request }
  }

  /// Run the workflow and send its result.
  ///
  /// Config, initialisation and handler failures are reported to the host as
  /// an error result. The exit code only reflects whether the result could be
  /// delivered.
  pub fn run<C, P, I, PE, IE>(self, parse_config: P, init: I) -> ExitCode
  where
    P: FnOnce(&[u8]) -> Result<C, PE>,
    I: FnOnce(&C) -> Result<Workflow<C>, IE>,
    PE: Display,
    IE: Display,
  {
    let result = self.execute(parse_config, init);

    let response = match encode(&result) {
      Ok(response) => response,
      Err(e) => {
        self.host.log(&format!("failed to encode result: {}", e));
        return ExitCode::InvalidResponse;
      }
    };
    match self.host.send_response(&response) {
      Ok(()) => ExitCode::Success,
      Err(e) => {
        self.host.log(&format!("failed to send result: {}", e));
        ExitCode::InvalidResponse
      }
    }
  }

  fn execute<C, P, I, PE, IE>(&self, parse_config: P, init: I) -> ExecutionResult
  where
    P: FnOnce(&[u8]) -> Result<C, PE>,
    I: FnOnce(&C) -> Result<Workflow<C>, IE>,
    PE: Display,
    IE: Display,
  {
    let config = match parse_config(&self.request.config) {
      Ok(config) => config,
      Err(e) => return ExecutionResult::Error(format!("failed to parse config: {}", e)),
    };
    let workflow = match init(&config) {
      Ok(workflow) => workflow,
      Err(e) => return ExecutionResult::Error(format!("failed to initialise workflow: {}", e)),
    };

    match &self.request.request {
      Request::Subscribe => {
        let subscriptions = workflow
          .iter()
          .map(|handler| handler.subscription().cloned())
          .collect::<Result<Vec<_>, _>>();
        match subscriptions {
          Ok(subscriptions) => {
            ExecutionResult::TriggerSubscriptions(TriggerSubscriptionRequest { subscriptions })
          }
          Err(e) => ExecutionResult::Error(format!("invalid trigger subscription: {}", e)),
        }
      }
      Request::Trigger(event) => {
        let handler = usize::try_from(event.id)
          .ok()
          .and_then(|index| workflow.get(index));
        let Some(handler) = handler else {
          return ExecutionResult::Error(format!("no handler registered for trigger {}", event.id));
        };
        let runtime = DonRuntime::new(self.host.clone(), self.request.max_response_size);
        match handler.invoke(&config, &runtime, event.payload.clone()) {
          Ok(value) => ExecutionResult::Value(value),
          Err(e) => ExecutionResult::Error(e.to_string()),
        }
      }
    }
  }
}
