use std::path::Path;
use std::time::Duration;

use cre_protocol::DEFAULT_MAX_RESPONSE_SIZE;
use serde::{Deserialize, Serialize};
use wasmtime::{Config, Engine};

use crate::error::HostError;

const MIB: u64 = 1024 * 1024;

/// Resource limits and behaviour of a loaded workflow module.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModuleConfig {
  /// Period of the epoch ticker.
  pub tick_interval_ms: u64,
  /// Wall-clock limit for a single execution.
  pub timeout_ms: u64,
  /// Fuel budget per execution. `None` disables metering.
  pub max_fuel: Option<u64>,
  pub max_memory_mb: u64,
  /// Floor applied to `max_memory_mb`.
  pub min_memory_mb: u64,
  pub max_table_elements: usize,
  pub max_instances: usize,
  /// Await response limit used when the execute request does not carry its
  /// own.
  pub max_response_size: u64,
  /// Limit on the final result delivered through `send_response`.
  pub max_result_size: u64,
  pub max_log_len_bytes: usize,
  pub max_log_count: usize,
  pub max_binary_size: usize,
}

impl Default for ModuleConfig {
  fn default() -> Self {
    Self {
      tick_interval_ms: 100,
      timeout_ms: 60_000,
      max_fuel: Some(10_000_000_000),
      max_memory_mb: 128,
      min_memory_mb: 16,
      max_table_elements: 10_000,
      max_instances: 1,
      max_response_size: DEFAULT_MAX_RESPONSE_SIZE,
      max_result_size: DEFAULT_MAX_RESPONSE_SIZE,
      max_log_len_bytes: 1024,
      max_log_count: 1_000,
      max_binary_size: 30 * MIB as usize,
    }
  }
}

impl ModuleConfig {
  /// Load a config from a JSON file. Missing fields take their defaults.
  pub fn from_json_file(path: &Path) -> Result<Self, HostError> {
    let content = std::fs::read_to_string(path).map_err(|e| {
      HostError::invalid_config(format!("failed to read {}: {}", path.display(), e))
    })?;
    let config: Self = serde_json::from_str(&content).map_err(|e| {
      HostError::invalid_config(format!("failed to parse {}: {}", path.display(), e))
    })?;
    config.validate()?;
    Ok(config)
  }

  pub fn validate(&self) -> Result<(), HostError> {
    if self.tick_interval_ms == 0 {
      return Err(HostError::invalid_config("tick_interval_ms must be positive"));
    }
    if self.timeout_ms < self.tick_interval_ms {
      return Err(HostError::invalid_config(
        "timeout_ms must be at least one tick interval",
      ));
    }
    if self.max_instances == 0 {
      return Err(HostError::invalid_config("max_instances must be positive"));
    }
    Ok(())
  }

  /// Wall-clock limit for a single execution.
  pub fn timeout(&self) -> Duration {
    Duration::from_millis(self.timeout_ms)
  }

  pub fn tick_interval(&self) -> Duration {
    Duration::from_millis(self.tick_interval_ms)
  }

  /// Epoch ticks an execution may run before it is interrupted.
  pub fn deadline_ticks(&self) -> u64 {
    self.timeout_ms.div_ceil(self.tick_interval_ms)
  }

  /// Effective memory cap in bytes.
  pub fn memory_limit_bytes(&self) -> usize {
    (self.max_memory_mb.max(self.min_memory_mb) * MIB) as usize
  }
}

/// Create the wasmtime Engine for one module.
///
/// Every engine has epoch interruption enabled; fuel metering follows
/// `config.max_fuel`. The engine is shared read-only by every execution of the
/// module.
pub fn create_engine(config: &ModuleConfig) -> Result<Engine, HostError> {
  let mut wasm_config = Config::new();

  wasm_config.async_support(true);
  wasm_config.epoch_interruption(true);
  wasm_config.consume_fuel(config.max_fuel.is_some());

  // Guests must behave identically on every node
  wasm_config.wasm_threads(false);
  wasm_config.cranelift_nan_canonicalization(true);

  Engine::new(&wasm_config).map_err(HostError::from)
}
