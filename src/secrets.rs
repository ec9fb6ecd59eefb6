//! Secret resolution for identity provider configuration.
//!
//! Provider config blobs may carry literal strings or references into an
//! external secret store: `{"vault": {"mount": "...", "path": "...",
//! "key": "...", "engine": "kv-v2", "version": 2}}`. The store itself is
//! an external collaborator behind [`SecretStore`]; the deployment wires
//! a real client, tests use [`MemorySecretStore`].

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use secrecy::SecretString;
use serde::Deserialize;

#[derive(Debug, thiserror::Error)]
pub enum SecretError {
    #[error("secret reference {0} could not be resolved")]
    NotFound(String),

    #[error("secret store unavailable: {0}")]
    Unavailable(String),
}

/// Reference into the external secret store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize)]
pub struct SecretRef {
    pub mount: String,
    pub path: String,
    pub key: String,
    #[serde(default = "default_engine")]
    pub engine: String,
    #[serde(default)]
    pub version: Option<u32>,
}

fn default_engine() -> String {
    "kv-v2".to_string()
}

impl SecretRef {
    /// Canonical `mount/path#key` form used in logs and lookups.
    pub fn locator(&self) -> String {
        format!("{}/{}#{}", self.mount, self.path, self.key)
    }
}

/// External secret store collaborator.
#[async_trait]
pub trait SecretStore: Send + Sync {
    async fn read(&self, reference: &SecretRef) -> Result<SecretString, SecretError>;
    async fn write(&self, reference: &SecretRef, value: SecretString) -> Result<(), SecretError>;
}

/// In-memory store keyed by locator; used by tests and by deployments
/// that inline their secrets.
#[derive(Default)]
pub struct MemorySecretStore {
    values: tokio::sync::Mutex<HashMap<String, SecretString>>,
}

impl MemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SecretStore for MemorySecretStore {
    async fn read(&self, reference: &SecretRef) -> Result<SecretString, SecretError> {
        self.values
            .lock()
            .await
            .get(&reference.locator())
            .cloned()
            .ok_or_else(|| SecretError::NotFound(reference.locator()))
    }

    async fn write(&self, reference: &SecretRef, value: SecretString) -> Result<(), SecretError> {
        self.values.lock().await.insert(reference.locator(), value);
        Ok(())
    }
}

/// Resolve a config value that is either a literal string or a
/// `{"vault": …}` reference. Returns `None` when the field is absent.
pub async fn resolve_secret_field(
    store: &Arc<dyn SecretStore>,
    value: Option<&serde_json::Value>,
) -> Result<Option<SecretString>, SecretError> {
    let Some(value) = value else {
        return Ok(None);
    };
    if value.is_null() {
        return Ok(None);
    }
    if let Some(literal) = value.as_str() {
        return Ok(Some(SecretString::from(literal.to_string())));
    }
    if let Some(reference) = value.get("vault") {
        let reference: SecretRef = serde_json::from_value(reference.clone())
            .map_err(|err| SecretError::Unavailable(err.to_string()))?;
        return store.read(&reference).await.map(Some);
    }
    Err(SecretError::Unavailable(
        "secret field must be a string or a vault reference".to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;

    fn reference() -> SecretRef {
        SecretRef {
            mount: "secret".into(),
            path: "auth/ldap".into(),
            key: "bind_password".into(),
            engine: "kv-v2".into(),
            version: None,
        }
    }

    #[tokio::test]
    async fn literal_values_pass_through() {
        let store: Arc<dyn SecretStore> = Arc::new(MemorySecretStore::new());
        let value = serde_json::json!("hunter2");
        let resolved = resolve_secret_field(&store, Some(&value)).await.unwrap();
        assert_eq!(resolved.unwrap().expose_secret(), "hunter2");
    }

    #[tokio::test]
    async fn vault_references_resolve_through_store() {
        let store = MemorySecretStore::new();
        store
            .write(&reference(), SecretString::from("s3cret".to_string()))
            .await
            .unwrap();
        let store: Arc<dyn SecretStore> = Arc::new(store);

        let value = serde_json::json!({
            "vault": {"mount": "secret", "path": "auth/ldap", "key": "bind_password"}
        });
        let resolved = resolve_secret_field(&store, Some(&value)).await.unwrap();
        assert_eq!(resolved.unwrap().expose_secret(), "s3cret");
    }

    #[tokio::test]
    async fn missing_reference_is_an_error() {
        let store: Arc<dyn SecretStore> = Arc::new(MemorySecretStore::new());
        let value = serde_json::json!({
            "vault": {"mount": "secret", "path": "auth/ldap", "key": "absent"}
        });
        assert!(resolve_secret_field(&store, Some(&value)).await.is_err());
    }
}
