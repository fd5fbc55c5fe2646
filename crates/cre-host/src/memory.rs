//! Guest linear memory access.
//!
//! Host functions never index guest memory directly. Every pointer/length
//! pair coming from the guest goes through `read` or `write`, which check the
//! values once against the current memory size.

use wasmtime::{Caller, Extern, Memory};

use crate::error::HostError;
use crate::state::HostState;

fn memory(caller: &mut Caller<'_, HostState>) -> Result<Memory, HostError> {
  match caller.get_export("memory") {
    Some(Extern::Memory(memory)) => Ok(memory),
    _ => Err(HostError::MissingMemory),
  }
}

fn range(ptr: i32, len: i32, size: usize) -> Result<std::ops::Range<usize>, HostError> {
  let start = usize::try_from(ptr).map_err(|_| HostError::MemoryOutOfBounds)?;
  let len = usize::try_from(len).map_err(|_| HostError::MemoryOutOfBounds)?;
  let end = start.checked_add(len).ok_or(HostError::MemoryOutOfBounds)?;
  if end > size {
    return Err(HostError::MemoryOutOfBounds);
  }
  Ok(start..end)
}

/// Copy `len` bytes starting at `ptr` out of guest memory.
pub fn read(caller: &mut Caller<'_, HostState>, ptr: i32, len: i32) -> Result<Vec<u8>, HostError> {
  let memory = memory(caller)?;
  let data = memory.data(&*caller);
  let range = range(ptr, len, data.len())?;
  Ok(data[range].to_vec())
}

/// Copy `bytes` into guest memory at `ptr`.
pub fn write(caller: &mut Caller<'_, HostState>, ptr: i32, bytes: &[u8]) -> Result<(), HostError> {
  let len = i32::try_from(bytes.len()).map_err(|_| HostError::MemoryOutOfBounds)?;
  let memory = memory(caller)?;
  let data = memory.data_mut(&mut *caller);
  let range = range(ptr, len, data.len())?;
  data[range].copy_from_slice(bytes);
  Ok(())
}

/// Read a little-endian `u64` at `ptr`.
pub fn read_u64(caller: &mut Caller<'_, HostState>, ptr: i32) -> Result<u64, HostError> {
  let bytes = read(caller, ptr, 8)?;
  let mut buf = [0u8; 8];
  buf.copy_from_slice(&bytes);
  Ok(u64::from_le_bytes(buf))
}

pub fn write_u64(caller: &mut Caller<'_, HostState>, ptr: i32, value: u64) -> Result<(), HostError> {
  write(caller, ptr, &value.to_le_bytes())
}

pub fn write_u32(caller: &mut Caller<'_, HostState>, ptr: i32, value: u32) -> Result<(), HostError> {
  write(caller, ptr, &value.to_le_bytes())
}
