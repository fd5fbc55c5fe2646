//! Wasmtime host for CRE workflow binaries.
//!
//! This crate provides:
//! - A resource-limited module host (fuel, memory/table/instance limits and an
//!   epoch-based wall-clock deadline)
//! - The host function table workflows import from `env`, plus sandboxed WASI
//!   clock and poll functions
//! - The capability call bridge, secrets lookup and mode bookkeeping of a
//!   single execution
//! - A background time fetcher serving DON and node time
//! - A single-process consensus capability for local runs
//!
//! Capabilities themselves are supplied by the embedder through a
//! [`CapabilityRegistry`].

mod capability;
mod consensus;
mod engine;
mod error;
mod execution;
mod linker;
pub mod memory;
mod module;
mod secrets;
mod state;
mod ticker;
mod time;

pub use capability::{Capability, CapabilityError, CapabilityInvocation, CapabilityRegistry};
pub use consensus::{LocalConsensus, aggregate, max_faulty};
pub use engine::{ModuleConfig, create_engine};
pub use error::HostError;
pub use execution::{Execution, HostServices, await_all};
pub use linker::link;
pub use module::Module;
pub use secrets::{InMemorySecrets, SecretsProvider};
pub use state::{HostState, create_store};
pub use ticker::EpochTicker;
pub use time::{FixedClock, SystemClock, TimeFetcher, TimeProvider, unix_nanos};
