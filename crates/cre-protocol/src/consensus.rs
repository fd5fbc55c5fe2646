use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Capability that reconciles per-node observations into one value.
pub const CONSENSUS_CAPABILITY_ID: &str = "consensus@1.0.0-alpha";

/// Method of the consensus capability that takes [`SimpleConsensusInputs`].
pub const CONSENSUS_SIMPLE_METHOD: &str = "Simple";

/// Type url of a payload carrying [`SimpleConsensusInputs`].
pub const SIMPLE_CONSENSUS_INPUTS_TYPE: &str = "sdk.SimpleConsensusInputs";

/// Type url of the agreed value returned by the consensus capability.
pub const CONSENSUS_VALUE_TYPE: &str = "sdk.Value";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregationType {
  Median,
  Identical,
  CommonPrefix,
  CommonSuffix,
}

/// Declarative description of how observations are aggregated.
///
/// Either a single aggregation applied to the whole value, or a map from
/// field name to the descriptor of that field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsensusDescriptor {
  Aggregation(AggregationType),
  FieldsMap(BTreeMap<String, ConsensusDescriptor>),
}

impl ConsensusDescriptor {
  pub fn aggregation(kind: AggregationType) -> Self {
    ConsensusDescriptor::Aggregation(kind)
  }

  pub fn fields<K, I>(fields: I) -> Self
  where
    K: Into<String>,
    I: IntoIterator<Item = (K, ConsensusDescriptor)>,
  {
    ConsensusDescriptor::FieldsMap(fields.into_iter().map(|(k, v)| (k.into(), v)).collect())
  }
}

/// What a single node observed while running in node mode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Observation {
  Value(serde_json::Value),
  Error(String),
}

/// Payload submitted to the consensus capability when leaving node mode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimpleConsensusInputs {
  pub observation: Observation,
  pub descriptors: ConsensusDescriptor,
  /// Returned when consensus fails or the observation is an error.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub default: Option<serde_json::Value>,
}
