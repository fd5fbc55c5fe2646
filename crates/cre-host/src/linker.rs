//! The host function table.
//!
//! Buffer conventions shared by the request/await pairs:
//!
//! - A start call (`call_capability`, `get_secrets`) returns `0` on success.
//!   On failure it writes the error text back into the request buffer,
//!   truncated to the request length, and returns the negated length.
//! - An await call returns the number of response bytes written on success.
//!   On failure it writes the error text into the response buffer, truncated
//!   to `response_buffer_len(max_len)`, and returns the negated length.
//!
//! Malformed buffers and out-of-bounds pointers are protocol faults and trap.

use cre_protocol::{
  AwaitCapabilitiesRequest, AwaitCapabilitiesResponse, AwaitSecretsRequest, AwaitSecretsResponse,
  CapabilityRequest, CapabilityResponse, GetSecretsRequest, HOST_MODULE, Mode,
  RESPONSE_BUFFER_TOO_SMALL, SUPPORTED_VERSION_IMPORT, decode, encode, response_buffer_len,
  truncate_utf8,
};
use tracing::warn;
use wasmtime::{Caller, Linker};

use crate::error::HostError;
use crate::execution::await_all;
use crate::memory;
use crate::state::HostState;
use crate::time::unix_nanos;

const WASI_MODULE: &str = "wasi_snapshot_preview1";

const ERRNO_SUCCESS: i32 = 0;
const ERRNO_FAULT: i32 = 21;
const ERRNO_INVAL: i32 = 28;
const ERRNO_IO: i32 = 29;
const ERRNO_NOTSUP: i32 = 58;

const SUBSCRIPTION_SIZE: usize = 48;
const EVENT_SIZE: usize = 32;
const EVENTTYPE_CLOCK: u8 = 0;
const SUBCLOCKFLAGS_ABSTIME: u16 = 1;

/// Register WASI preview1 and the workflow host functions.
pub fn link(linker: &mut Linker<HostState>) -> Result<(), HostError> {
  wasmtime_wasi::p1::add_to_linker_async(linker, |state| &mut state.wasi)?;

  // The WASI clock and poll functions are replaced below.
  linker.allow_shadowing(true);

  linker.func_wrap(HOST_MODULE, SUPPORTED_VERSION_IMPORT, || {})?;
  linker.func_wrap(HOST_MODULE, "send_response", send_response)?;
  linker.func_wrap(HOST_MODULE, "call_capability", call_capability)?;
  linker.func_wrap_async(
    HOST_MODULE,
    "await_capabilities",
    |caller: Caller<'_, HostState>, (req_ptr, req_len, resp_ptr, max_len): (i32, i32, i32, i32)| {
      Box::new(await_capabilities(caller, req_ptr, req_len, resp_ptr, max_len))
    },
  )?;
  linker.func_wrap(HOST_MODULE, "get_secrets", get_secrets)?;
  linker.func_wrap_async(
    HOST_MODULE,
    "await_secrets",
    |caller: Caller<'_, HostState>, (req_ptr, req_len, resp_ptr, max_len): (i32, i32, i32, i32)| {
      Box::new(await_secrets(caller, req_ptr, req_len, resp_ptr, max_len))
    },
  )?;
  linker.func_wrap(HOST_MODULE, "log", log)?;
  linker.func_wrap(HOST_MODULE, "switch_modes", switch_modes)?;
  linker.func_wrap(HOST_MODULE, "random_seed", random_seed)?;
  linker.func_wrap_async(
    HOST_MODULE,
    "now",
    |caller: Caller<'_, HostState>, (ts_ptr,): (i32,)| Box::new(now(caller, ts_ptr)),
  )?;

  linker.func_wrap_async(
    WASI_MODULE,
    "clock_time_get",
    |caller: Caller<'_, HostState>, (_clock_id, _precision, time_ptr): (i32, i64, i32)| {
      Box::new(clock_time_get(caller, time_ptr))
    },
  )?;
  linker.func_wrap_async(
    WASI_MODULE,
    "poll_oneoff",
    |caller: Caller<'_, HostState>,
     (in_ptr, out_ptr, nsubscriptions, nevents_ptr): (i32, i32, i32, i32)| {
      Box::new(poll_oneoff(caller, in_ptr, out_ptr, nsubscriptions, nevents_ptr))
    },
  )?;

  Ok(())
}

fn mode_arg(mode: i32) -> wasmtime::Result<Mode> {
  Mode::try_from(mode).map_err(|m| wasmtime::Error::msg(format!("invalid mode: {}", m)))
}

fn len_arg(len: i32) -> wasmtime::Result<usize> {
  usize::try_from(len).map_err(|_| HostError::MemoryOutOfBounds.into())
}

/// Write `message` to `ptr`, truncated to `capacity`, and return the negated
/// length written.
fn write_error(
  caller: &mut Caller<'_, HostState>,
  ptr: i32,
  capacity: usize,
  message: &str,
) -> wasmtime::Result<i64> {
  let text = truncate_utf8(message, capacity);
  memory::write(caller, ptr, text.as_bytes())?;
  Ok(-(text.len().max(1) as i64))
}

/// Write an encoded await response, or the buffer-too-small error when it
/// exceeds the declared maximum.
fn write_response(
  caller: &mut Caller<'_, HostState>,
  resp_ptr: i32,
  max_len: i32,
  encoded: &[u8],
) -> wasmtime::Result<i64> {
  let max = len_arg(max_len)? as u64;
  if encoded.len() as u64 > max {
    let capacity = response_buffer_len(max) as usize;
    return write_error(caller, resp_ptr, capacity, RESPONSE_BUFFER_TOO_SMALL);
  }
  memory::write(caller, resp_ptr, encoded)?;
  Ok(encoded.len() as i64)
}

fn send_response(mut caller: Caller<'_, HostState>, ptr: i32, len: i32) -> wasmtime::Result<i32> {
  let response = memory::read(&mut caller, ptr, len)?;
  match caller.data_mut().execution.set_response(response) {
    Ok(()) => Ok(0),
    Err(e) => {
      warn!(error = %e, "rejected workflow response");
      Ok(-1)
    }
  }
}

fn call_capability(mut caller: Caller<'_, HostState>, ptr: i32, len: i32) -> wasmtime::Result<i64> {
  let bytes = memory::read(&mut caller, ptr, len)?;
  let request: CapabilityRequest = decode(&bytes)?;
  match caller.data_mut().execution.call_capability(request) {
    Ok(()) => Ok(0),
    Err(e) => write_error(&mut caller, ptr, bytes.len(), &e.to_string()),
  }
}

async fn await_capabilities(
  mut caller: Caller<'_, HostState>,
  req_ptr: i32,
  req_len: i32,
  resp_ptr: i32,
  max_len: i32,
) -> wasmtime::Result<i64> {
  let capacity = response_buffer_len(len_arg(max_len)? as u64) as usize;
  let bytes = memory::read(&mut caller, req_ptr, req_len)?;
  let request: AwaitCapabilitiesRequest = decode(&bytes)?;

  let calls = match caller.data_mut().execution.take_capability_calls(&request.ids) {
    Ok(calls) => calls,
    Err(e) => return write_error(&mut caller, resp_ptr, capacity, &e.to_string()),
  };

  let cancel = caller.data().execution.cancel_token();
  let responses = await_all(calls, &cancel, || {
    CapabilityResponse::Error("capability call was dropped".to_string())
  })
  .await?;

  let encoded = encode(&AwaitCapabilitiesResponse { responses })?;
  write_response(&mut caller, resp_ptr, max_len, &encoded)
}

fn get_secrets(mut caller: Caller<'_, HostState>, ptr: i32, len: i32) -> wasmtime::Result<i64> {
  let bytes = memory::read(&mut caller, ptr, len)?;
  let request: GetSecretsRequest = decode(&bytes)?;
  match caller.data_mut().execution.get_secrets(request) {
    Ok(()) => Ok(0),
    Err(e) => write_error(&mut caller, ptr, bytes.len(), &e.to_string()),
  }
}

async fn await_secrets(
  mut caller: Caller<'_, HostState>,
  req_ptr: i32,
  req_len: i32,
  resp_ptr: i32,
  max_len: i32,
) -> wasmtime::Result<i64> {
  let capacity = response_buffer_len(len_arg(max_len)? as u64) as usize;
  let bytes = memory::read(&mut caller, req_ptr, req_len)?;
  let request: AwaitSecretsRequest = decode(&bytes)?;

  let calls = match caller.data_mut().execution.take_secret_calls(&request.ids) {
    Ok(calls) => calls,
    Err(e) => return write_error(&mut caller, resp_ptr, capacity, &e.to_string()),
  };

  let cancel = caller.data().execution.cancel_token();
  let responses = await_all(calls, &cancel, Vec::new).await?;

  let encoded = encode(&AwaitSecretsResponse { responses })?;
  write_response(&mut caller, resp_ptr, max_len, &encoded)
}

fn log(mut caller: Caller<'_, HostState>, ptr: i32, len: i32) -> wasmtime::Result<()> {
  let message = memory::read(&mut caller, ptr, len)?;
  caller.data_mut().execution.log(&message);
  Ok(())
}

fn switch_modes(mut caller: Caller<'_, HostState>, mode: i32) -> wasmtime::Result<()> {
  let mode = mode_arg(mode)?;
  caller.data_mut().execution.switch_mode(mode);
  Ok(())
}

fn random_seed(caller: Caller<'_, HostState>, mode: i32) -> wasmtime::Result<i64> {
  let mode = mode_arg(mode)?;
  Ok(caller.data().execution.random_seed(mode))
}

/// Fetch the time for the current mode and fold in the virtual clock.
async fn current_time(caller: &mut Caller<'_, HostState>) -> Result<u64, HostError> {
  let fetcher = caller.data().execution.time_fetcher();
  let mode = caller.data().execution.mode();
  let fetched = unix_nanos(fetcher.get_time(mode).await?)?;
  Ok(caller.data_mut().execution.observe_time(fetched))
}

async fn now(mut caller: Caller<'_, HostState>, ts_ptr: i32) -> wasmtime::Result<i32> {
  let nanos = match current_time(&mut caller).await {
    Ok(nanos) => nanos,
    Err(HostError::Cancelled) => return Err(HostError::Cancelled.into()),
    Err(e) => {
      warn!(error = %e, "failed to fetch time");
      return Ok(-1);
    }
  };
  memory::write_u64(&mut caller, ts_ptr, nanos)?;
  Ok(0)
}

async fn clock_time_get(mut caller: Caller<'_, HostState>, time_ptr: i32) -> wasmtime::Result<i32> {
  let nanos = match current_time(&mut caller).await {
    Ok(nanos) => nanos,
    Err(HostError::Cancelled) => return Err(HostError::Cancelled.into()),
    Err(e) => {
      warn!(error = %e, "failed to fetch time");
      return Ok(ERRNO_IO);
    }
  };
  match memory::write_u64(&mut caller, time_ptr, nanos) {
    Ok(()) => Ok(ERRNO_SUCCESS),
    Err(_) => Ok(ERRNO_FAULT),
  }
}

struct ClockSubscription {
  userdata: u64,
  timeout: u64,
  absolute: bool,
}

fn parse_subscriptions(bytes: &[u8]) -> Option<Vec<ClockSubscription>> {
  let mut subscriptions = Vec::with_capacity(bytes.len() / SUBSCRIPTION_SIZE);
  for chunk in bytes.chunks_exact(SUBSCRIPTION_SIZE) {
    if chunk[8] != EVENTTYPE_CLOCK {
      return None;
    }
    let u64_at = |at: usize| {
      let mut buf = [0u8; 8];
      buf.copy_from_slice(&chunk[at..at + 8]);
      u64::from_le_bytes(buf)
    };
    let flags = u16::from_le_bytes([chunk[40], chunk[41]]);
    subscriptions.push(ClockSubscription {
      userdata: u64_at(0),
      timeout: u64_at(24),
      absolute: flags & SUBCLOCKFLAGS_ABSTIME != 0,
    });
  }
  Some(subscriptions)
}

/// Satisfy clock subscriptions by advancing the virtual clock.
///
/// Only clock subscriptions are supported. Nothing ever blocks.
async fn poll_oneoff(
  mut caller: Caller<'_, HostState>,
  in_ptr: i32,
  out_ptr: i32,
  nsubscriptions: i32,
  nevents_ptr: i32,
) -> wasmtime::Result<i32> {
  if nsubscriptions <= 0 {
    return Ok(ERRNO_INVAL);
  }
  let Some(in_len) = (nsubscriptions as usize)
    .checked_mul(SUBSCRIPTION_SIZE)
    .and_then(|len| i32::try_from(len).ok())
  else {
    return Ok(ERRNO_INVAL);
  };
  let Ok(bytes) = memory::read(&mut caller, in_ptr, in_len) else {
    return Ok(ERRNO_FAULT);
  };
  let Some(subscriptions) = parse_subscriptions(&bytes) else {
    return Ok(ERRNO_NOTSUP);
  };

  // Absolute deadlines are compared against real time, so the virtual clock
  // needs an anchor first.
  let needs_anchor = !caller.data().execution.has_observed_time();
  if needs_anchor && subscriptions.iter().any(|sub| sub.absolute) {
    match current_time(&mut caller).await {
      Ok(_) => {}
      Err(HostError::Cancelled) => return Err(HostError::Cancelled.into()),
      Err(e) => {
        warn!(error = %e, "failed to fetch time");
        return Ok(ERRNO_IO);
      }
    }
  }

  let execution = &mut caller.data_mut().execution;
  let now = execution.virtual_now();
  let deadline = subscriptions
    .iter()
    .map(|sub| {
      if sub.absolute {
        sub.timeout
      } else {
        now.saturating_add(sub.timeout)
      }
    })
    .max()
    .unwrap_or(now);
  execution.sleep_until(deadline);

  let mut events = vec![0u8; subscriptions.len() * EVENT_SIZE];
  for (event, sub) in events.chunks_exact_mut(EVENT_SIZE).zip(&subscriptions) {
    event[0..8].copy_from_slice(&sub.userdata.to_le_bytes());
    event[10] = EVENTTYPE_CLOCK;
  }
  if memory::write(&mut caller, out_ptr, &events).is_err() {
    return Ok(ERRNO_FAULT);
  }
  if memory::write_u32(&mut caller, nevents_ptr, subscriptions.len() as u32).is_err() {
    return Ok(ERRNO_FAULT);
  }
  Ok(ERRNO_SUCCESS)
}
