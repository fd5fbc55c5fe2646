//! Single-process stand-in for the consensus capability.
//!
//! Real deployments reconcile observations across a network of nodes. For
//! local runs, [`LocalConsensus`] aggregates this node's observation with an
//! optional fixed set of peer observations, using the same aggregation rules.

use std::cmp::Ordering;

use async_trait::async_trait;
use cre_protocol::{
  AggregationType, CONSENSUS_CAPABILITY_ID, CONSENSUS_SIMPLE_METHOD, CONSENSUS_VALUE_TYPE,
  ConsensusDescriptor, Observation, Payload, SimpleConsensusInputs,
};
use serde_json::{Map, Value};
use tracing::debug;

use crate::capability::{Capability, CapabilityError, CapabilityInvocation};

/// Number of faulty nodes tolerated among `n`.
pub fn max_faulty(n: usize) -> usize {
  n.saturating_sub(1) / 3
}

/// Reduce per-node observations to one value as described by `descriptor`.
pub fn aggregate(descriptor: &ConsensusDescriptor, observations: &[Value]) -> Result<Value, String> {
  if observations.is_empty() {
    return Err("no observations".to_string());
  }
  match descriptor {
    ConsensusDescriptor::Aggregation(kind) => aggregate_values(*kind, observations),
    ConsensusDescriptor::FieldsMap(fields) => {
      let objects = observations
        .iter()
        .map(|o| o.as_object().ok_or("fields aggregation needs object observations"))
        .collect::<Result<Vec<_>, _>>()?;

      let mut result = Map::new();
      for (name, field) in fields {
        let values: Vec<Value> = objects
          .iter()
          .map(|o| o.get(name).cloned().unwrap_or(Value::Null))
          .collect();
        let value = aggregate(field, &values).map_err(|e| format!("field {}: {}", name, e))?;
        result.insert(name.clone(), value);
      }
      Ok(Value::Object(result))
    }
  }
}

fn aggregate_values(kind: AggregationType, observations: &[Value]) -> Result<Value, String> {
  let threshold = max_faulty(observations.len()) + 1;
  match kind {
    AggregationType::Median => median(observations),
    AggregationType::Identical => identical(observations, threshold),
    AggregationType::CommonPrefix => common_run(observations, threshold, false),
    AggregationType::CommonSuffix => common_run(observations, threshold, true),
  }
}

/// Integers are ordered exactly; anything else numeric goes through `f64`.
fn median(observations: &[Value]) -> Result<Value, String> {
  if let Some(non_numeric) = observations.iter().find(|o| !o.is_number()) {
    return Err(format!("median needs numeric observations, got {}", non_numeric));
  }

  let mut sorted: Vec<&Value> = observations.iter().collect();
  if sorted.iter().all(|o| o.is_i64()) {
    sorted.sort_by_key(|o| o.as_i64());
  } else if sorted.iter().all(|o| o.is_i64() || o.is_u64()) {
    // Mixed signs: negatives all fit in i64 and sort before any u64.
    sorted.sort_by_key(|o| match o.as_u64() {
      Some(unsigned) => (true, 0, unsigned),
      None => (false, o.as_i64().unwrap_or(0), 0),
    });
  } else {
    sorted.sort_by(|a, b| {
      let a = a.as_f64().unwrap_or(f64::NAN);
      let b = b.as_f64().unwrap_or(f64::NAN);
      a.partial_cmp(&b).unwrap_or(Ordering::Equal)
    });
  }
  Ok(sorted[sorted.len() / 2].clone())
}

fn identical(observations: &[Value], threshold: usize) -> Result<Value, String> {
  let mut best: Option<(&Value, usize)> = None;
  for candidate in observations {
    let count = observations.iter().filter(|o| *o == candidate).count();
    if count >= threshold && best.is_none_or(|(_, c)| count > c) {
      best = Some((candidate, count));
    }
  }
  best
    .map(|(value, _)| value.clone())
    .ok_or_else(|| format!("no value was observed by at least {} nodes", threshold))
}

/// Longest prefix (or suffix) shared by at least `threshold` observations.
fn common_run(observations: &[Value], threshold: usize, suffix: bool) -> Result<Value, String> {
  let lists = observations
    .iter()
    .map(|o| {
      let mut items = o
        .as_array()
        .cloned()
        .ok_or_else(|| format!("expected list observations, got {}", o))?;
      if suffix {
        items.reverse();
      }
      Ok(items)
    })
    .collect::<Result<Vec<_>, String>>()?;

  let mut best: &[Value] = &[];
  for list in &lists {
    for len in (best.len() + 1)..=list.len() {
      let run = &list[..len];
      let shared = lists.iter().filter(|other| other.starts_with(run)).count();
      if shared < threshold {
        break;
      }
      best = run;
    }
  }

  let mut result = best.to_vec();
  if suffix {
    result.reverse();
  }
  Ok(Value::Array(result))
}

/// Implements `consensus@1.0.0-alpha` for a single process.
#[derive(Debug, Default, Clone)]
pub struct LocalConsensus {
  peers: Vec<Value>,
}

impl LocalConsensus {
  pub fn new() -> Self {
    Self::default()
  }

  /// Observations reported by simulated peer nodes on every call.
  pub fn with_peer_observations(mut self, peers: Vec<Value>) -> Self {
    self.peers = peers;
    self
  }

  /// Resolve one set of consensus inputs.
  pub fn resolve(&self, inputs: SimpleConsensusInputs) -> Result<Value, String> {
    let outcome = match inputs.observation {
      Observation::Error(error) => Err(error),
      Observation::Value(value) => {
        let mut observations = Vec::with_capacity(self.peers.len() + 1);
        observations.push(value);
        observations.extend(self.peers.iter().cloned());
        aggregate(&inputs.descriptors, &observations)
      }
    };
    match (outcome, inputs.default) {
      (Ok(value), _) => Ok(value),
      (Err(error), Some(default)) => {
        debug!(error = %error, "consensus failed, using default");
        Ok(default)
      }
      (Err(error), None) => Err(error),
    }
  }
}

#[async_trait]
impl Capability for LocalConsensus {
  fn id(&self) -> &str {
    CONSENSUS_CAPABILITY_ID
  }

  async fn invoke(&self, invocation: CapabilityInvocation) -> Result<Payload, CapabilityError> {
    if invocation.method != CONSENSUS_SIMPLE_METHOD {
      return Err(CapabilityError::UnsupportedMethod(invocation.method));
    }
    let inputs: SimpleConsensusInputs = invocation
      .payload
      .decode()
      .map_err(|e| CapabilityError::InvalidPayload(e.to_string()))?;
    let value = self.resolve(inputs).map_err(CapabilityError::Failed)?;
    Ok(Payload::new(CONSENSUS_VALUE_TYPE, value))
  }
}

#[cfg(test)]
mod tests {
  use serde_json::json;

  use super::*;

  fn agg(kind: AggregationType) -> ConsensusDescriptor {
    ConsensusDescriptor::aggregation(kind)
  }

  #[test]
  fn test_median_picks_middle() {
    let observations = vec![json!(7), json!(1), json!(4), json!(10), json!(3)];
    assert_eq!(aggregate(&agg(AggregationType::Median), &observations), Ok(json!(4)));
  }

  #[test]
  fn test_median_orders_large_integers_exactly() {
    // Adjacent values above 2^53 collapse to the same f64.
    let base = 1u64 << 60;
    let observations = vec![json!(base + 2), json!(base), json!(base + 1)];
    assert_eq!(
      aggregate(&agg(AggregationType::Median), &observations),
      Ok(json!(base + 1))
    );

    let base = i64::MIN + 10;
    let observations = vec![json!(base), json!(base + 2), json!(base + 1)];
    assert_eq!(
      aggregate(&agg(AggregationType::Median), &observations),
      Ok(json!(base + 1))
    );

    let observations = vec![json!(u64::MAX), json!(-5), json!(u64::MAX - 1)];
    assert_eq!(
      aggregate(&agg(AggregationType::Median), &observations),
      Ok(json!(u64::MAX - 1))
    );
  }

  #[test]
  fn test_median_rejects_non_numeric() {
    let observations = vec![json!(1), json!("two")];
    assert!(aggregate(&agg(AggregationType::Median), &observations).is_err());
  }

  #[test]
  fn test_identical_needs_f_plus_one() {
    // n = 4, f = 1: two matching observations are enough
    let observations = vec![json!("a"), json!("b"), json!("a"), json!("c")];
    assert_eq!(
      aggregate(&agg(AggregationType::Identical), &observations),
      Ok(json!("a"))
    );

    let observations = vec![json!("a"), json!("b"), json!("c"), json!("d")];
    assert!(aggregate(&agg(AggregationType::Identical), &observations).is_err());
  }

  #[test]
  fn test_common_prefix_and_suffix() {
    let observations = vec![json!([1, 2, 3]), json!([1, 2, 4]), json!([9, 2, 3]), json!([1, 2])];
    assert_eq!(
      aggregate(&agg(AggregationType::CommonPrefix), &observations),
      Ok(json!([1, 2]))
    );

    let observations = vec![json!([1, 2, 3]), json!([5, 3]), json!([7]), json!([0, 2, 3])];
    assert_eq!(
      aggregate(&agg(AggregationType::CommonSuffix), &observations),
      Ok(json!([2, 3]))
    );
  }

  #[test]
  fn test_fields_map() {
    let descriptor = ConsensusDescriptor::fields([
      ("price", agg(AggregationType::Median)),
      ("symbol", agg(AggregationType::Identical)),
    ]);
    let observations = vec![
      json!({ "price": 10, "symbol": "ETH", "extra": true }),
      json!({ "price": 12, "symbol": "ETH" }),
      json!({ "price": 11, "symbol": "BTC" }),
    ];
    assert_eq!(
      aggregate(&descriptor, &observations),
      Ok(json!({ "price": 11, "symbol": "ETH" }))
    );
  }

  #[test]
  fn test_resolve_uses_default_on_error() {
    let consensus = LocalConsensus::new();
    let inputs = SimpleConsensusInputs {
      observation: Observation::Error("fetch failed".to_string()),
      descriptors: agg(AggregationType::Median),
      default: Some(json!(0)),
    };
    assert_eq!(consensus.resolve(inputs), Ok(json!(0)));

    let inputs = SimpleConsensusInputs {
      observation: Observation::Error("fetch failed".to_string()),
      descriptors: agg(AggregationType::Median),
      default: None,
    };
    assert_eq!(consensus.resolve(inputs), Err("fetch failed".to_string()));
  }

  #[test]
  fn test_resolve_with_peers() {
    let consensus = LocalConsensus::new().with_peer_observations(vec![json!(20), json!(30)]);
    let inputs = SimpleConsensusInputs {
      observation: Observation::Value(json!(10)),
      descriptors: agg(AggregationType::Median),
      default: None,
    };
    assert_eq!(consensus.resolve(inputs), Ok(json!(20)));
  }
}
