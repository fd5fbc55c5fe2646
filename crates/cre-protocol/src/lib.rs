//! CRE Protocol
//!
//! This crate contains the types that cross the host/guest boundary of a
//! workflow execution, and the codec used to move them through guest linear
//! memory. Both `cre-host` (the wasmtime side) and `cre-sdk` (the code
//! compiled into the workflow binary) depend on it, so the two sides always
//! agree on the shape of every buffer.
//!
//! Everything here is plain data. The only behaviour is encoding, the
//! deterministic seed derivation, and a few helpers for the buffer
//! conventions of the host imports.

mod capability;
mod codec;
mod consensus;
mod execute;
mod mode;
mod secrets;

pub use capability::{
  AwaitCapabilitiesRequest, AwaitCapabilitiesResponse, CapabilityRequest, CapabilityResponse,
  Payload,
};
pub use codec::{
  CodecError, DEFAULT_MAX_RESPONSE_SIZE, ERROR_BUFFER_LEN, ExitCode, RESPONSE_BUFFER_TOO_SMALL,
  decode, encode, response_buffer_len, truncate_utf8,
};
pub use consensus::{
  AggregationType, CONSENSUS_CAPABILITY_ID, CONSENSUS_SIMPLE_METHOD, CONSENSUS_VALUE_TYPE,
  ConsensusDescriptor, Observation, SIMPLE_CONSENSUS_INPUTS_TYPE, SimpleConsensusInputs,
};
pub use execute::{
  ExecuteRequest, ExecutionResult, Request, TriggerEvent, TriggerSubscription,
  TriggerSubscriptionRequest,
};
pub use mode::{Mode, random_seed};
pub use secrets::{
  AwaitSecretsRequest, AwaitSecretsResponse, GetSecretsRequest, Secret, SecretError,
  SecretRequest, SecretResponse,
};

/// Import namespace of every host function.
pub const HOST_MODULE: &str = "env";

/// Prefix shared by all protocol-version imports a guest may declare.
pub const VERSION_IMPORT_PREFIX: &str = "version_v";

/// The protocol-version import this host speaks.
pub const SUPPORTED_VERSION_IMPORT: &str = "version_v2";
