use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Execution mode of a workflow.
///
/// DON mode code runs identically on every node; node mode code runs local
/// observations whose results are reconciled through consensus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
  Don,
  Node,
}

impl Mode {
  pub fn as_i32(self) -> i32 {
    match self {
      Mode::Don => 0,
      Mode::Node => 1,
    }
  }
}

impl TryFrom<i32> for Mode {
  type Error = i32;

  fn try_from(value: i32) -> Result<Self, Self::Error> {
    match value {
      0 => Ok(Mode::Don),
      1 => Ok(Mode::Node),
      other => Err(other),
    }
  }
}

impl std::fmt::Display for Mode {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      Mode::Don => write!(f, "don"),
      Mode::Node => write!(f, "node"),
    }
  }
}

/// Deterministic random seed for `mode` within one execution.
///
/// DON mode seeds depend only on the execution id. Node mode seeds also
/// depend on how many times the execution has entered node mode, so every
/// node-mode block gets its own stream, and replaying the same transitions
/// reproduces the same streams.
pub fn random_seed(execution_id: &str, mode: Mode, node_mode_entries: u64) -> i64 {
  let mut hasher = Sha256::new();
  hasher.update(execution_id.as_bytes());
  hasher.update(mode.as_i32().to_be_bytes());
  if mode == Mode::Node {
    hasher.update(node_mode_entries.to_be_bytes());
  }
  let digest = hasher.finalize();
  let mut seed = [0u8; 8];
  seed.copy_from_slice(&digest[..8]);
  i64::from_be_bytes(seed)
}
