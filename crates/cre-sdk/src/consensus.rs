//! Consensus descriptors built from compile-time type shapes.
//!
//! A [`ConsensusAggregation`] pairs a [`ConsensusDescriptor`] with the Rust
//! type it describes. Constructors never fail; if the type cannot be
//! aggregated the way requested, the error is kept and reported by
//! [`ConsensusAggregation::err`] and by every use of the aggregation.

use std::collections::{BTreeMap, HashMap};
use std::marker::PhantomData;

use cre_protocol::{AggregationType, ConsensusDescriptor};
use serde::Serialize;

use crate::error::SdkError;

/// Structural description of a type, as far as consensus cares.
#[derive(Debug, Clone, PartialEq)]
pub enum Shape {
  Numeric,
  Bool,
  String,
  List(Box<Shape>),
  Map { string_keys: bool, value: Box<Shape> },
  Optional(Box<Shape>),
  Struct(StructShape),
  /// A dynamically typed value whose structure is unknown.
  Dynamic,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StructShape {
  pub name: &'static str,
  pub fields: Vec<FieldShape>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FieldShape {
  pub name: &'static str,
  /// Aggregation tag, e.g. `median` or `nested`. Untagged fields are skipped.
  pub tag: Option<&'static str>,
  pub shape: Shape,
}

impl Shape {
  /// The shape itself, or what it points at for optional values.
  fn pointee(&self) -> &Shape {
    match self {
      Shape::Optional(inner) => inner.pointee(),
      other => other,
    }
  }

  fn is_numeric(&self) -> bool {
    matches!(self.pointee(), Shape::Numeric)
  }

  /// Whether two values of this shape can be compared for equality.
  fn is_identical_comparable(&self) -> bool {
    match self {
      Shape::Numeric | Shape::Bool | Shape::String => true,
      Shape::List(item) => item.is_identical_comparable(),
      Shape::Map { string_keys, value } => *string_keys && value.is_identical_comparable(),
      Shape::Optional(inner) => inner.is_identical_comparable(),
      Shape::Struct(shape) => shape.fields.iter().all(|f| f.shape.is_identical_comparable()),
      Shape::Dynamic => false,
    }
  }

  fn is_comparable_list(&self) -> bool {
    match self.pointee() {
      Shape::List(item) => item.is_identical_comparable(),
      _ => false,
    }
  }

  fn describe(&self) -> String {
    match self {
      Shape::Numeric => "number".to_string(),
      Shape::Bool => "bool".to_string(),
      Shape::String => "string".to_string(),
      Shape::List(item) => format!("list of {}", item.describe()),
      Shape::Map { string_keys: true, value } => format!("string-keyed map of {}", value.describe()),
      Shape::Map { string_keys: false, value } => format!("non-string-keyed map of {}", value.describe()),
      Shape::Optional(inner) => format!("optional {}", inner.describe()),
      Shape::Struct(shape) => format!("struct {}", shape.name),
      Shape::Dynamic => "dynamic value".to_string(),
    }
  }
}

/// Types whose shape is known at compile time.
///
/// Implemented for primitives, strings, lists, arrays, maps, `Option` and
/// `Box`. Structs implement it with [`consensus_fields!`](crate::consensus_fields).
pub trait ConsensusShape {
  fn shape() -> Shape;
}

macro_rules! numeric_shape {
  ($($ty:ty),*) => {
    $(
      impl ConsensusShape for $ty {
        fn shape() -> Shape {
          Shape::Numeric
        }
      }
    )*
  };
}

numeric_shape!(i8, i16, i32, i64, i128, isize, u8, u16, u32, u64, u128, usize, f32, f64);

impl ConsensusShape for bool {
  fn shape() -> Shape {
    Shape::Bool
  }
}

impl ConsensusShape for String {
  fn shape() -> Shape {
    Shape::String
  }
}

impl<T: ConsensusShape> ConsensusShape for Vec<T> {
  fn shape() -> Shape {
    Shape::List(Box::new(T::shape()))
  }
}

impl<T: ConsensusShape, const N: usize> ConsensusShape for [T; N] {
  fn shape() -> Shape {
    Shape::List(Box::new(T::shape()))
  }
}

impl<T: ConsensusShape> ConsensusShape for Option<T> {
  fn shape() -> Shape {
    Shape::Optional(Box::new(T::shape()))
  }
}

impl<T: ConsensusShape> ConsensusShape for Box<T> {
  fn shape() -> Shape {
    T::shape()
  }
}

impl ConsensusShape for serde_json::Value {
  fn shape() -> Shape {
    Shape::Dynamic
  }
}

/// Map key types.
pub trait MapKey {
  const IS_STRING: bool;
}

impl MapKey for String {
  const IS_STRING: bool = true;
}

macro_rules! integer_key {
  ($($ty:ty),*) => {
    $(
      impl MapKey for $ty {
        const IS_STRING: bool = false;
      }
    )*
  };
}

integer_key!(i8, i16, i32, i64, u8, u16, u32, u64, bool);

impl<K: MapKey, V: ConsensusShape> ConsensusShape for BTreeMap<K, V> {
  fn shape() -> Shape {
    Shape::Map {
      string_keys: K::IS_STRING,
      value: Box::new(V::shape()),
    }
  }
}

impl<K: MapKey, V: ConsensusShape, S> ConsensusShape for HashMap<K, V, S> {
  fn shape() -> Shape {
    Shape::Map {
      string_keys: K::IS_STRING,
      value: Box::new(V::shape()),
    }
  }
}

/// Describe a struct's fields and their aggregation tags.
///
/// ```
/// use cre_sdk::consensus_fields;
///
/// #[derive(serde::Serialize, serde::Deserialize, Clone)]
/// struct Reading {
///   price: i64,
///   source: String,
///   note: String,
/// }
///
/// consensus_fields! {
///   Reading {
///     price: i64 => median,
///     source: String => identical,
///     note: String,
///   }
/// }
/// ```
///
/// Declared field types are checked against the struct at compile time.
#[macro_export]
macro_rules! consensus_fields {
  (@tag $tag:ident) => {
    Some(stringify!($tag))
  };
  (@tag) => {
    None
  };
  ($ty:ident { $($field:ident : $fty:ty $(=> $tag:ident)?),* $(,)? }) => {
    impl $crate::ConsensusShape for $ty {
      fn shape() -> $crate::Shape {
        #[allow(dead_code)]
        fn assert_field_types(value: &$ty) {
          $(let _: &$fty = &value.$field;)*
        }

        $crate::Shape::Struct($crate::StructShape {
          name: stringify!($ty),
          fields: vec![
            $(
              $crate::FieldShape {
                name: stringify!($field),
                tag: $crate::consensus_fields!(@tag $($tag)?),
                shape: <$fty as $crate::ConsensusShape>::shape(),
              },
            )*
          ],
        })
      }
    }
  };
}

fn fields_descriptor(shape: &StructShape) -> Result<ConsensusDescriptor, SdkError> {
  let mut fields = BTreeMap::new();
  for field in &shape.fields {
    let Some(tag) = field.tag else {
      continue;
    };
    let invalid = |requirement: &str| {
      SdkError::descriptor(format!(
        "{}.{}: {} requires {}, found {}",
        shape.name,
        field.name,
        tag,
        requirement,
        field.shape.describe()
      ))
    };
    let descriptor = match tag {
      "ignore" => continue,
      "median" if field.shape.is_numeric() => {
        ConsensusDescriptor::aggregation(AggregationType::Median)
      }
      "median" => return Err(invalid("a number")),
      "identical" if field.shape.is_identical_comparable() => {
        ConsensusDescriptor::aggregation(AggregationType::Identical)
      }
      "identical" => return Err(invalid("a comparable type")),
      "common_prefix" | "common_suffix" if field.shape.is_comparable_list() => {
        ConsensusDescriptor::aggregation(if tag == "common_prefix" {
          AggregationType::CommonPrefix
        } else {
          AggregationType::CommonSuffix
        })
      }
      "common_prefix" | "common_suffix" => return Err(invalid("a list of comparable items")),
      "nested" => match field.shape.pointee() {
        Shape::Struct(inner) => fields_descriptor(inner)?,
        _ => return Err(invalid("a struct")),
      },
      other => {
        return Err(SdkError::descriptor(format!(
          "{}.{}: unknown tag {}",
          shape.name, field.name, other
        )));
      }
    };
    fields.insert(field.name.to_string(), descriptor);
  }
  Ok(ConsensusDescriptor::FieldsMap(fields))
}

/// How node-mode observations of `T` are reconciled.
pub struct ConsensusAggregation<T> {
  descriptor: Result<ConsensusDescriptor, SdkError>,
  default: Option<serde_json::Value>,
  _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for ConsensusAggregation<T> {
  fn clone(&self) -> Self {
    Self {
      descriptor: self.descriptor.clone(),
      default: self.default.clone(),
      _marker: PhantomData,
    }
  }
}

impl<T> std::fmt::Debug for ConsensusAggregation<T> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("ConsensusAggregation")
      .field("descriptor", &self.descriptor)
      .field("default", &self.default)
      .finish()
  }
}

impl<T: ConsensusShape> ConsensusAggregation<T> {
  fn build(descriptor: Result<ConsensusDescriptor, SdkError>) -> Self {
    Self {
      descriptor,
      default: None,
      _marker: PhantomData,
    }
  }

  fn leaf(kind: AggregationType, valid: bool, requirement: &str) -> Self {
    let descriptor = if valid {
      Ok(ConsensusDescriptor::aggregation(kind))
    } else {
      Err(SdkError::descriptor(format!(
        "{:?} requires {}, found {}",
        kind,
        requirement,
        T::shape().describe()
      )))
    };
    Self::build(descriptor)
  }

  /// Median of numeric observations.
  pub fn median() -> Self {
    Self::leaf(AggregationType::Median, T::shape().is_numeric(), "a number")
  }

  /// A value observed identically by enough nodes.
  pub fn identical() -> Self {
    Self::leaf(
      AggregationType::Identical,
      T::shape().is_identical_comparable(),
      "a comparable type",
    )
  }

  pub fn common_prefix() -> Self {
    Self::leaf(
      AggregationType::CommonPrefix,
      T::shape().is_comparable_list(),
      "a list of comparable items",
    )
  }

  pub fn common_suffix() -> Self {
    Self::leaf(
      AggregationType::CommonSuffix,
      T::shape().is_comparable_list(),
      "a list of comparable items",
    )
  }

  /// Per-field aggregation taken from the tags of a struct.
  pub fn from_fields() -> Self {
    let descriptor = match T::shape() {
      Shape::Struct(shape) => fields_descriptor(&shape),
      other => Err(SdkError::descriptor(format!(
        "field aggregation requires a struct, found {}",
        other.describe()
      ))),
    };
    Self::build(descriptor)
  }
}

impl<T> ConsensusAggregation<T> {
  /// Value used when consensus fails or the observation is an error.
  pub fn with_default(mut self, value: T) -> Self
  where
    T: Serialize,
  {
    match serde_json::to_value(&value) {
      Ok(value) => self.default = Some(value),
      Err(e) => self.descriptor = Err(SdkError::descriptor(format!("invalid default: {}", e))),
    }
    self
  }

  /// The construction error, if the aggregation is unusable.
  pub fn err(&self) -> Option<&SdkError> {
    self.descriptor.as_ref().err()
  }

  pub fn descriptor(&self) -> Result<&ConsensusDescriptor, SdkError> {
    self.descriptor.as_ref().map_err(Clone::clone)
  }

  pub fn default_value(&self) -> Option<&serde_json::Value> {
    self.default.as_ref()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_leaf_validation() {
    assert!(ConsensusAggregation::<i64>::median().err().is_none());
    assert!(ConsensusAggregation::<Option<f64>>::median().err().is_none());
    assert!(ConsensusAggregation::<String>::median().err().is_some());

    assert!(ConsensusAggregation::<Vec<String>>::identical().err().is_none());
    assert!(ConsensusAggregation::<BTreeMap<String, i32>>::identical().err().is_none());
    assert!(ConsensusAggregation::<BTreeMap<u32, i32>>::identical().err().is_some());
    assert!(ConsensusAggregation::<serde_json::Value>::identical().err().is_some());

    assert!(ConsensusAggregation::<Vec<u8>>::common_prefix().err().is_none());
    assert!(ConsensusAggregation::<[u8; 4]>::common_suffix().err().is_none());
    assert!(ConsensusAggregation::<u8>::common_prefix().err().is_some());
  }

  #[test]
  fn test_from_fields_requires_struct() {
    let aggregation = ConsensusAggregation::<i64>::from_fields();
    assert!(matches!(aggregation.err(), Some(SdkError::Descriptor(_))));
    assert!(aggregation.descriptor().is_err());
  }

  #[test]
  fn test_with_default() {
    let aggregation = ConsensusAggregation::<i64>::median().with_default(5);
    assert_eq!(aggregation.default_value(), Some(&serde_json::json!(5)));
    assert_eq!(
      aggregation.descriptor(),
      Ok(&ConsensusDescriptor::aggregation(AggregationType::Median))
    );
  }
}
