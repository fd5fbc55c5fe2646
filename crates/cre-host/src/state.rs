use wasmtime::{Engine, Store, StoreLimits, StoreLimitsBuilder};
use wasmtime_wasi::WasiCtxBuilder;
use wasmtime_wasi::p1::WasiP1Ctx;

use crate::engine::ModuleConfig;
use crate::error::HostError;
use crate::execution::Execution;

/// Host state stored in the wasmtime Store.
///
/// Each execution gets a fresh HostState; nothing is shared between stores.
pub struct HostState {
  /// WASI preview1 context. argv carries the execute request.
  pub wasi: WasiP1Ctx,

  /// Memory, table and instance limits enforced by the store.
  pub limits: StoreLimits,

  pub execution: Execution,
}

/// Create a new Store for one execution.
///
/// The guest sees `["workflow", request_json]` as its arguments. The store is
/// metered with fuel when the module config asks for it, and interrupted once
/// `timeout_ms` worth of epoch ticks have passed.
pub fn create_store(
  engine: &Engine,
  config: &ModuleConfig,
  request_json: &str,
  execution: Execution,
) -> Result<Store<HostState>, HostError> {
  let wasi = WasiCtxBuilder::new()
    .args(&["workflow", request_json])
    .inherit_stderr()
    .build_p1();

  let limits = StoreLimitsBuilder::new()
    .memory_size(config.memory_limit_bytes())
    .table_elements(config.max_table_elements)
    .instances(config.max_instances)
    .memories(config.max_instances)
    .tables(config.max_instances)
    .build();

  let mut store = Store::new(
    engine,
    HostState {
      wasi,
      limits,
      execution,
    },
  );
  store.limiter(|state| &mut state.limits);

  if let Some(fuel) = config.max_fuel {
    store.set_fuel(fuel)?;
  }

  store.set_epoch_deadline(config.deadline_ticks());
  store.epoch_deadline_trap();

  Ok(store)
}
