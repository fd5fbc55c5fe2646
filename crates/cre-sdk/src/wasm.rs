//! Host imports for workflows compiled to `wasm32-wasip1`.
//!
//! This is the only module that deals in raw pointers. Buffers are allocated
//! here, handed to the host for the duration of one call, and copied out.

use std::fmt::Display;
use std::rc::Rc;

use cre_protocol::{ExecuteRequest, ExitCode, Mode, decode, response_buffer_len};

use crate::host::Host;
use crate::runner::Runner;
use crate::workflow::Workflow;

#[link(wasm_import_module = "env")]
unsafe extern "C" {
  fn version_v2();
  fn send_response(ptr: *const u8, len: i32) -> i32;
  fn call_capability(ptr: *mut u8, len: i32) -> i64;
  fn await_capabilities(req_ptr: *const u8, req_len: i32, resp_ptr: *mut u8, max_len: i32) -> i64;
  fn get_secrets(ptr: *mut u8, len: i32) -> i64;
  fn await_secrets(req_ptr: *const u8, req_len: i32, resp_ptr: *mut u8, max_len: i32) -> i64;
  fn log(ptr: *const u8, len: i32);
  fn switch_modes(mode: i32);
  fn random_seed(mode: i32) -> i64;
  fn now(ts_ptr: *mut u64) -> i32;
}

/// [`Host`] backed by the `env` imports of the workflow host.
#[derive(Debug, Default, Clone, Copy)]
pub struct WasmHost;

fn buffer_len(len: usize) -> Result<i32, String> {
  i32::try_from(len).map_err(|_| format!("buffer of {} bytes is too large", len))
}

/// Error text the host wrote into `buffer`, given the negative return value.
fn error_text(buffer: &[u8], code: i64) -> String {
  let len = usize::try_from(code.unsigned_abs()).map_or(buffer.len(), |len| len.min(buffer.len()));
  String::from_utf8_lossy(&buffer[..len]).into_owned()
}

type StartFn = unsafe extern "C" fn(*mut u8, i32) -> i64;
type AwaitFn = unsafe extern "C" fn(*const u8, i32, *mut u8, i32) -> i64;

fn start(import: StartFn, request: &[u8]) -> Result<(), String> {
  // The host may write an error back into the request buffer.
  let mut buffer = request.to_vec();
  let len = buffer_len(buffer.len())?;
  let code = unsafe { import(buffer.as_mut_ptr(), len) };
  if code < 0 {
    return Err(error_text(&buffer, code));
  }
  Ok(())
}

fn await_response(import: AwaitFn, request: &[u8], max_response_len: u64) -> Result<Vec<u8>, String> {
  let max_len = i32::try_from(max_response_len).unwrap_or(i32::MAX);
  let mut response = vec![0u8; response_buffer_len(max_len as u64) as usize];
  let req_len = buffer_len(request.len())?;
  let code = unsafe { import(request.as_ptr(), req_len, response.as_mut_ptr(), max_len) };
  if code < 0 {
    return Err(error_text(&response, code));
  }
  response.truncate(code as usize);
  Ok(response)
}

impl Host for WasmHost {
  fn call_capability(&self, request: &[u8]) -> Result<(), String> {
    start(call_capability, request)
  }

  fn await_capabilities(&self, request: &[u8], max_response_len: u64) -> Result<Vec<u8>, String> {
    await_response(await_capabilities, request, max_response_len)
  }

  fn get_secrets(&self, request: &[u8]) -> Result<(), String> {
    start(get_secrets, request)
  }

  fn await_secrets(&self, request: &[u8], max_response_len: u64) -> Result<Vec<u8>, String> {
    await_response(await_secrets, request, max_response_len)
  }

  fn log(&self, message: &str) {
    if let Ok(len) = buffer_len(message.len()) {
      unsafe { log(message.as_ptr(), len) }
    }
  }

  fn switch_modes(&self, mode: Mode) {
    unsafe { switch_modes(mode.as_i32()) }
  }

  fn random_seed(&self, mode: Mode) -> i64 {
    unsafe { random_seed(mode.as_i32()) }
  }

  fn now(&self) -> Result<u64, String> {
    let mut nanos: u64 = 0;
    let code = unsafe { now(&mut nanos) };
    if code != 0 {
      return Err("failed to read the current time".to_string());
    }
    Ok(nanos)
  }

  fn send_response(&self, response: &[u8]) -> Result<(), String> {
    let len = buffer_len(response.len())?;
    let code = unsafe { send_response(response.as_ptr(), len) };
    if code != 0 {
      return Err("response rejected by the host".to_string());
    }
    Ok(())
  }
}

/// Entry point of a workflow binary.
///
/// Reads the execute request from the first argument, runs the workflow and
/// exits with the resulting [`ExitCode`].
pub fn run_workflow<C, P, I, PE, IE>(parse_config: P, init: I) -> !
where
  P: FnOnce(&[u8]) -> Result<C, PE>,
  I: FnOnce(&C) -> Result<Workflow<C>, IE>,
  PE: Display,
  IE: Display,
{
  unsafe { version_v2() };

  let code = match std::env::args().nth(1) {
    None => ExitCode::RunnerError,
    Some(argument) => match decode::<ExecuteRequest>(argument.as_bytes()) {
      Ok(request) => Runner::new(Rc::new(WasmHost), request).run(parse_config, init),
      Err(_) => ExitCode::InvalidRequest,
    },
  };
  std::process::exit(code.code())
}
