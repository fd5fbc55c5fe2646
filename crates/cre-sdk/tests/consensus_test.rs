use std::collections::BTreeMap;

use cre_sdk::{AggregationType, ConsensusAggregation, ConsensusDescriptor, SdkError, consensus_fields};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Inner {
  tags: Vec<String>,
  score: Option<f64>,
}

consensus_fields! {
  Inner {
    tags: Vec<String> => common_prefix,
    score: Option<f64> => median,
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Report {
  price: i64,
  source: String,
  labels: BTreeMap<String, bool>,
  trail: [u8; 4],
  inner: Inner,
  maybe_inner: Option<Box<Inner>>,
  skipped: String,
  untagged: serde_json::Value,
}

consensus_fields! {
  Report {
    price: i64 => median,
    source: String => identical,
    labels: BTreeMap<String, bool> => identical,
    trail: [u8; 4] => common_suffix,
    inner: Inner => nested,
    maybe_inner: Option<Box<Inner>> => nested,
    skipped: String => ignore,
    untagged: serde_json::Value,
  }
}

fn inner_descriptor() -> ConsensusDescriptor {
  ConsensusDescriptor::fields([
    ("tags", ConsensusDescriptor::aggregation(AggregationType::CommonPrefix)),
    ("score", ConsensusDescriptor::aggregation(AggregationType::Median)),
  ])
}

#[test]
fn test_fields_descriptor() {
  let aggregation = ConsensusAggregation::<Report>::from_fields();
  assert!(aggregation.err().is_none(), "{:?}", aggregation.err());

  let expected = ConsensusDescriptor::fields([
    ("price", ConsensusDescriptor::aggregation(AggregationType::Median)),
    ("source", ConsensusDescriptor::aggregation(AggregationType::Identical)),
    ("labels", ConsensusDescriptor::aggregation(AggregationType::Identical)),
    ("trail", ConsensusDescriptor::aggregation(AggregationType::CommonSuffix)),
    ("inner", inner_descriptor()),
    ("maybe_inner", inner_descriptor()),
  ]);
  assert_eq!(aggregation.descriptor(), Ok(&expected));
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct BadMedian {
  name: String,
}

consensus_fields! {
  BadMedian {
    name: String => median,
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct UnknownTag {
  value: i64,
}

consensus_fields! {
  UnknownTag {
    value: i64 => average,
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct BadNested {
  value: i64,
}

consensus_fields! {
  BadNested {
    value: i64 => nested,
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DynamicIdentical {
  value: serde_json::Value,
}

consensus_fields! {
  DynamicIdentical {
    value: serde_json::Value => identical,
  }
}

fn descriptor_error<T: cre_sdk::ConsensusShape>() -> String {
  match ConsensusAggregation::<T>::from_fields().err() {
    Some(SdkError::Descriptor(message)) => message.clone(),
    other => panic!("expected a descriptor error, got {:?}", other),
  }
}

#[test]
fn test_invalid_field_tags() {
  assert_eq!(
    descriptor_error::<BadMedian>(),
    "BadMedian.name: median requires a number, found string"
  );
  assert_eq!(
    descriptor_error::<UnknownTag>(),
    "UnknownTag.value: unknown tag average"
  );
  assert!(descriptor_error::<BadNested>().starts_with("BadNested.value: nested requires a struct"));
  assert!(descriptor_error::<DynamicIdentical>().contains("identical requires a comparable type"));
}

#[test]
fn test_invalid_aggregation_keeps_error() {
  let aggregation = ConsensusAggregation::<Vec<serde_json::Value>>::common_prefix();
  let error = aggregation.err().cloned();
  assert!(matches!(error, Some(SdkError::Descriptor(_))));
  assert_eq!(aggregation.descriptor().err(), error);

  // a default does not repair an invalid aggregation
  let aggregation = aggregation.with_default(Vec::new());
  assert!(aggregation.err().is_some());
}
