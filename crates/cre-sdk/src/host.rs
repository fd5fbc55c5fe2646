use cre_protocol::Mode;

/// The byte-level boundary between workflow code and the host.
///
/// Requests and responses are already encoded. Errors are the text the host
/// reported. Implementations own every raw buffer; nothing above this trait
/// touches pointers.
pub trait Host {
  /// Start a capability call described by an encoded `CapabilityRequest`.
  fn call_capability(&self, request: &[u8]) -> Result<(), String>;

  /// Wait for the calls listed in an encoded `AwaitCapabilitiesRequest`.
  /// Responses larger than `max_response_len` are an error.
  fn await_capabilities(&self, request: &[u8], max_response_len: u64) -> Result<Vec<u8>, String>;

  fn get_secrets(&self, request: &[u8]) -> Result<(), String>;

  fn await_secrets(&self, request: &[u8], max_response_len: u64) -> Result<Vec<u8>, String>;

  fn log(&self, message: &str);

  fn switch_modes(&self, mode: Mode);

  fn random_seed(&self, mode: Mode) -> i64;

  /// Current time for the active mode, in nanoseconds since the unix epoch.
  fn now(&self) -> Result<u64, String>;

  /// Deliver the encoded `ExecutionResult`.
  fn send_response(&self, response: &[u8]) -> Result<(), String>;
}
