//! CRE SDK
//!
//! The guest side of a workflow execution. A workflow binary declares its
//! handlers and calls [`run_workflow`] from `main`; everything else happens
//! through a [`DonRuntime`]:
//!
//! - capability calls return a [`Promise`] so several can be in flight at once
//! - [`DonRuntime::run_in_node_mode`] runs a node-local observation and
//!   reconciles it through consensus, as described by a
//!   [`ConsensusAggregation`]
//! - randomness is deterministic per execution and mode
//!
//! On native targets the [`testutils`] module provides an in-process host so
//! workflows can be unit tested without a wasm engine.

mod consensus;
mod error;
mod host;
mod promise;
mod random;
mod runner;
mod runtime;
mod workflow;

#[cfg(not(target_arch = "wasm32"))]
pub mod testutils;

#[cfg(target_arch = "wasm32")]
mod wasm;

pub use consensus::{ConsensusAggregation, ConsensusShape, FieldShape, MapKey, Shape, StructShape};
pub use error::SdkError;
pub use host::Host;
pub use promise::Promise;
pub use random::Rand;
pub use runner::Runner;
pub use runtime::{DonRuntime, NodeRuntime};
pub use workflow::{Handler, Trigger, Workflow, handler};

#[cfg(target_arch = "wasm32")]
pub use wasm::{WasmHost, run_workflow};

pub use cre_protocol::{
  AggregationType, ConsensusDescriptor, ExecuteRequest, ExecutionResult, Mode, Payload, Secret,
  SecretRequest, TriggerSubscription,
};
