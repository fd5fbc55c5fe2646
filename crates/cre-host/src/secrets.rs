use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;

/// Source of workflow secrets.
///
/// Lookups are async to support remote vaults. A missing secret is an error
/// string that is handed back to the workflow as-is.
pub trait SecretsProvider: Send + Sync {
  fn get(&self, namespace: &str, id: &str) -> Pin<Box<dyn Future<Output = Result<String, String>> + Send + '_>>;
}

/// In-memory secrets keyed by `(namespace, id)`.
#[derive(Debug, Default, Clone)]
pub struct InMemorySecrets {
  data: HashMap<(String, String), String>,
}

impl InMemorySecrets {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with_secret(
    mut self,
    namespace: impl Into<String>,
    id: impl Into<String>,
    value: impl Into<String>,
  ) -> Self {
    self.insert(namespace, id, value);
    self
  }

  pub fn insert(&mut self, namespace: impl Into<String>, id: impl Into<String>, value: impl Into<String>) {
    self.data.insert((namespace.into(), id.into()), value.into());
  }
}

impl SecretsProvider for InMemorySecrets {
  fn get(&self, namespace: &str, id: &str) -> Pin<Box<dyn Future<Output = Result<String, String>> + Send + '_>> {
    let value = self
      .data
      .get(&(namespace.to_string(), id.to_string()))
      .cloned()
      .ok_or_else(|| format!("secret not found: {}/{}", namespace, id));
    Box::pin(async move { value })
  }
}
