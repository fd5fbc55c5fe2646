use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::codec::CodecError;

/// An opaque, typed payload.
///
/// The host never looks inside `value`; only the capability and the workflow
/// code that share `type_url` know how to interpret it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payload {
  pub type_url: String,
  #[serde(default)]
  pub value: serde_json::Value,
}

impl Payload {
  pub fn new(type_url: impl Into<String>, value: serde_json::Value) -> Self {
    Self {
      type_url: type_url.into(),
      value,
    }
  }

  /// Wrap a serializable value under the given type url.
  pub fn encode<T: Serialize>(type_url: impl Into<String>, value: &T) -> Result<Self, CodecError> {
    let value = serde_json::to_value(value).map_err(CodecError::Encode)?;
    Ok(Self::new(type_url, value))
  }

  /// Decode the payload value into `T`.
  pub fn decode<T: DeserializeOwned>(&self) -> Result<T, CodecError> {
    serde_json::from_value(self.value.clone()).map_err(CodecError::Decode)
  }
}

/// A single capability invocation issued by workflow code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityRequest {
  /// Capability identifier, e.g. `basic-test-action@1.0.0`.
  pub id: String,
  pub method: String,
  pub payload: Payload,
  /// Guest-allocated id used to await the response.
  pub callback_id: i32,
}

/// Outcome of a capability invocation. Consumed exactly once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapabilityResponse {
  Payload(Payload),
  Error(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AwaitCapabilitiesRequest {
  pub ids: Vec<i32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AwaitCapabilitiesResponse {
  pub responses: BTreeMap<i32, CapabilityResponse>,
}

#[cfg(test)]
mod tests {
  use super::*;

  #[derive(Debug, PartialEq, Serialize, Deserialize)]
  struct Outputs {
    adapted_thing: String,
  }

  #[test]
  fn test_payload_decodes_typed_value() {
    let payload = Payload::encode(
      "basicaction.Outputs",
      &Outputs {
        adapted_thing: "ok".to_string(),
      },
    )
    .unwrap();

    assert_eq!(payload.type_url, "basicaction.Outputs");
    assert_eq!(payload.value["adapted_thing"], "ok");

    let decoded: Outputs = payload.decode().unwrap();
    assert_eq!(decoded.adapted_thing, "ok");
  }

  #[test]
  fn test_payload_decode_wrong_shape_fails() {
    let payload = Payload::new("x", serde_json::json!(12));
    let result: Result<Outputs, _> = payload.decode();
    assert!(result.is_err());
  }

  #[test]
  fn test_await_response_keeps_negative_ids() {
    let mut response = AwaitCapabilitiesResponse::default();
    response
      .responses
      .insert(-3, CapabilityResponse::Error("boom".to_string()));
    response.responses.insert(
      7,
      CapabilityResponse::Payload(Payload::new("t", serde_json::json!("v"))),
    );

    let bytes = serde_json::to_vec(&response).unwrap();
    let back: AwaitCapabilitiesResponse = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(back, response);
  }
}
