//! Identity provider abstraction and registry.
//!
//! Providers are built once at startup from the static configuration
//! plus enabled database records. Vault references inside a provider's
//! config blob resolve through the [`SecretStore`] at build time; a
//! provider whose required secret cannot be resolved is skipped with an
//! error log rather than served half-configured.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::config::{Config, ProviderDefinition};
use crate::db::Database;
use crate::error::AuthError;
use crate::kv::Kv;
use crate::secrets::SecretStore;

use super::audit::AuditService;
use super::ldap::{LdapAuthProvider, LdapFlavor};
use super::local::LocalAuthProvider;
use super::oidc::OidcAuthProvider;
use super::state::StateSigner;
use super::throttle::LoginThrottle;

/// Normalized identity returned by a successful provider flow.
#[derive(Debug, Clone)]
pub struct AuthResult {
    pub external_id: String,
    pub username: String,
    pub email: Option<String>,
    pub display_name: Option<String>,
    pub provider_name: String,
    pub attributes: Value,
    pub roles: Vec<String>,
}

/// How a login flow starts.
#[derive(Debug, Clone)]
pub enum BeginFlow {
    /// Credentials are posted directly (local, LDAP).
    Form,
    /// Redirect the browser to the identity provider.
    Redirect { url: String },
}

#[derive(Debug, Clone)]
pub struct BeginRequest {
    pub base_url: String,
    pub next: Option<String>,
    pub mode: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

/// Inputs to a provider's completion step. Form providers read
/// `credentials`; redirect providers read `callback_params`.
#[derive(Debug, Clone, Default)]
pub struct CompleteRequest {
    pub credentials: Option<Credentials>,
    pub callback_params: HashMap<String, String>,
    pub base_url: String,
    pub source_ip: Option<String>,
    pub user_agent: Option<String>,
}

#[async_trait]
pub trait AuthProvider: Send + Sync {
    fn name(&self) -> &str;
    fn kind(&self) -> &'static str;

    async fn begin(&self, request: &BeginRequest) -> Result<BeginFlow, AuthError>;

    async fn complete(&self, request: &CompleteRequest) -> Result<AuthResult, AuthError>;
}

/// Provider metadata surfaced to clients.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ProviderMetadata {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
}

pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn AuthProvider>>,
}

/// Dependencies shared by provider construction.
pub struct ProviderDeps {
    pub db: Arc<dyn Database>,
    pub kv: Arc<dyn Kv>,
    pub secrets: Arc<dyn SecretStore>,
    pub audit: AuditService,
    pub state_signer: StateSigner,
    pub redis_prefix: String,
}

impl ProviderRegistry {
    /// Build providers from config definitions plus enabled DB records.
    /// DB records win on name collisions (they are operator-editable).
    pub async fn build(config: &Config, deps: &ProviderDeps) -> Self {
        let mut definitions: HashMap<String, ProviderDefinition> = HashMap::new();
        for definition in &config.auth.providers {
            definitions.insert(definition.name.clone(), definition.clone());
        }
        match deps.db.list_provider_configs().await {
            Ok(records) => {
                for record in records {
                    definitions.insert(
                        record.name.clone(),
                        ProviderDefinition {
                            name: record.name,
                            kind: record.kind,
                            enabled: record.enabled,
                            config: record.config,
                        },
                    );
                }
            }
            Err(err) => {
                tracing::error!(error = %err, "failed to load provider configs from database");
            }
        }

        let mut providers: HashMap<String, Arc<dyn AuthProvider>> = HashMap::new();
        for definition in definitions.into_values() {
            if !definition.enabled {
                continue;
            }
            match Self::build_one(&definition, deps).await {
                Ok(provider) => {
                    providers.insert(definition.name.clone(), provider);
                }
                Err(err) => {
                    tracing::error!(
                        provider = %definition.name,
                        kind = %definition.kind,
                        error = %err,
                        "rejecting identity provider"
                    );
                }
            }
        }
        Self { providers }
    }

    async fn build_one(
        definition: &ProviderDefinition,
        deps: &ProviderDeps,
    ) -> Result<Arc<dyn AuthProvider>, AuthError> {
        match definition.kind.as_str() {
            "local" => Ok(Arc::new(LocalAuthProvider::new(
                &definition.name,
                &definition.config,
                deps.db.clone(),
                deps.audit.clone(),
                LoginThrottle::new(deps.kv.clone(), &deps.redis_prefix),
            )?)),
            "oidc" => Ok(Arc::new(
                OidcAuthProvider::new(
                    &definition.name,
                    &definition.config,
                    deps.state_signer.clone(),
                    &deps.secrets,
                )
                .await?,
            )),
            "ldap" => Ok(Arc::new(
                LdapAuthProvider::new(
                    &definition.name,
                    &definition.config,
                    LdapFlavor::Generic,
                    &deps.secrets,
                )
                .await?,
            )),
            "active_directory" => Ok(Arc::new(
                LdapAuthProvider::new(
                    &definition.name,
                    &definition.config,
                    LdapFlavor::ActiveDirectory,
                    &deps.secrets,
                )
                .await?,
            )),
            other => Err(AuthError::InvalidRequest(format!(
                "unknown provider type '{other}'"
            ))),
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn AuthProvider>> {
        self.providers.get(name).cloned()
    }

    pub fn metadata(&self) -> Vec<ProviderMetadata> {
        let mut metadata: Vec<ProviderMetadata> = self
            .providers
            .values()
            .map(|provider| ProviderMetadata {
                name: provider.name().to_string(),
                kind: provider.kind().to_string(),
            })
            .collect();
        metadata.sort_by(|a, b| a.name.cmp(&b.name));
        metadata
    }
}

/// Default role slugs granted when a provider supplies none.
pub fn default_roles(config: &Value) -> Vec<String> {
    config
        .get("default_roles")
        .and_then(|value| value.as_array())
        .map(|values| {
            values
                .iter()
                .filter_map(|value| value.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_else(|| vec![super::ROLE_TOOLKIT_USER.to_string()])
}
