use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretRequest {
  pub id: String,
  #[serde(default)]
  pub namespace: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GetSecretsRequest {
  pub callback_id: i32,
  pub requests: Vec<SecretRequest>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AwaitSecretsRequest {
  pub ids: Vec<i32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Secret {
  pub id: String,
  pub namespace: String,
  pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretError {
  pub id: String,
  pub namespace: String,
  pub error: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecretResponse {
  Secret(Secret),
  Error(SecretError),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AwaitSecretsResponse {
  pub responses: BTreeMap<i32, Vec<SecretResponse>>,
}
