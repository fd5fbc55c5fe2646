//! Buffer codec for the host/guest boundary.
//!
//! Every message that crosses guest linear memory is JSON. The host treats a
//! decoding failure as a protocol fault; the guest surfaces it as an ordinary
//! error.

use serde::Serialize;
use serde::de::DeserializeOwned;

/// Minimum capacity of a guest response buffer.
///
/// A guest always allocates at least this many bytes for an await call, so the
/// host can report errors even when the declared maximum response size is tiny.
pub const ERROR_BUFFER_LEN: u64 = 1024;

/// Response limit used when an execute request does not declare one.
pub const DEFAULT_MAX_RESPONSE_SIZE: u64 = 5 * 1024 * 1024;

/// Error text written when an encoded response exceeds the declared maximum.
pub const RESPONSE_BUFFER_TOO_SMALL: &str = "response buffer too small";

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
  #[error("failed to encode message: {0}")]
  Encode(#[source] serde_json::Error),

  #[error("failed to decode message: {0}")]
  Decode(#[source] serde_json::Error),
}

/// Encode a message for transfer across the boundary.
pub fn encode<T: Serialize>(message: &T) -> Result<Vec<u8>, CodecError> {
  serde_json::to_vec(message).map_err(CodecError::Encode)
}

/// Decode a message received across the boundary.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CodecError> {
  serde_json::from_slice(bytes).map_err(CodecError::Decode)
}

/// Capacity the guest allocates for a response declared to be at most
/// `max_response_len` bytes.
pub fn response_buffer_len(max_response_len: u64) -> u64 {
  max_response_len.max(ERROR_BUFFER_LEN)
}

/// Truncate `message` to at most `limit` bytes without splitting a character.
pub fn truncate_utf8(message: &str, limit: usize) -> &str {
  if message.len() <= limit {
    return message;
  }
  let mut end = limit;
  while !message.is_char_boundary(end) {
    end -= 1;
  }
  &message[..end]
}

/// Process exit codes a workflow binary uses to report how `_start` ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCode {
  Success,
  /// The guest could not encode or deliver its response.
  InvalidResponse,
  /// The guest could not decode the execute request.
  InvalidRequest,
  /// Workflow initialisation failed before any handler ran.
  RunnerError,
}

impl ExitCode {
  pub fn code(self) -> i32 {
    match self {
      ExitCode::Success => 0,
      ExitCode::InvalidResponse => 110,
      ExitCode::InvalidRequest => 111,
      ExitCode::RunnerError => 112,
    }
  }

  pub fn from_code(code: i32) -> Option<Self> {
    match code {
      0 => Some(ExitCode::Success),
      110 => Some(ExitCode::InvalidResponse),
      111 => Some(ExitCode::InvalidRequest),
      112 => Some(ExitCode::RunnerError),
      _ => None,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_decode_garbage_is_error() {
    let result: Result<serde_json::Value, _> = decode(b"{not json");
    assert!(matches!(result, Err(CodecError::Decode(_))));
  }

  #[test]
  fn test_response_buffer_len_has_floor() {
    assert_eq!(response_buffer_len(1), ERROR_BUFFER_LEN);
    assert_eq!(response_buffer_len(4096), 4096);
  }

  #[test]
  fn test_truncate_respects_char_boundary() {
    assert_eq!(truncate_utf8("hello", 10), "hello");
    assert_eq!(truncate_utf8("hello", 3), "hel");
    // 'é' is two bytes; cutting inside it backs off to the previous boundary
    assert_eq!(truncate_utf8("aé", 2), "a");
    assert_eq!(truncate_utf8("abc", 0), "");
  }

  #[test]
  fn test_exit_codes() {
    for code in [
      ExitCode::Success,
      ExitCode::InvalidResponse,
      ExitCode::InvalidRequest,
      ExitCode::RunnerError,
    ] {
      assert_eq!(ExitCode::from_code(code.code()), Some(code));
    }
    assert_eq!(ExitCode::from_code(1), None);
  }
}
