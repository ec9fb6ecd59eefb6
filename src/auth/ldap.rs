//! LDAP and Active Directory providers.
//!
//! Flow: service bind, locate the user entry (DN template or search
//! filter), rebind as the user to verify the password, then collect
//! groups from `memberOf` plus an optional dedicated group search. The
//! Active Directory flavor prefers a UPN (`user@default_domain`) bind
//! and falls back to the entry DN.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use ldap3::{LdapConnAsync, LdapConnSettings, Scope, SearchEntry, ldap_escape};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::Value;

use crate::error::AuthError;
use crate::secrets::{SecretStore, resolve_secret_field};

use super::providers::{
    AuthProvider, AuthResult, BeginFlow, BeginRequest, CompleteRequest, default_roles,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LdapFlavor {
    Generic,
    ActiveDirectory,
}

#[derive(Debug, Clone, Deserialize)]
struct LdapConfig {
    server_uri: String,
    #[serde(default)]
    bind_dn: Option<String>,
    #[serde(default)]
    bind_password: Option<Value>,
    #[serde(default)]
    start_tls: bool,
    #[serde(default)]
    user_dn_template: Option<String>,
    #[serde(default)]
    user_search_base: Option<String>,
    #[serde(default)]
    user_filter: Option<String>,
    #[serde(default = "default_group_member_attr")]
    group_member_attr: String,
    #[serde(default)]
    group_search_base: Option<String>,
    #[serde(default)]
    group_filter: Option<String>,
    #[serde(default = "default_attribute_map")]
    attributes: HashMap<String, String>,
    #[serde(default)]
    role_mappings: HashMap<String, Vec<String>>,
    #[serde(default)]
    default_domain: Option<String>,
}

fn default_group_member_attr() -> String {
    "memberOf".to_string()
}

fn default_attribute_map() -> HashMap<String, String> {
    HashMap::from([
        ("username".to_string(), "uid".to_string()),
        ("email".to_string(), "mail".to_string()),
        ("display_name".to_string(), "cn".to_string()),
    ])
}

#[derive(Debug)]
pub struct LdapAuthProvider {
    name: String,
    config: LdapConfig,
    bind_password: Option<SecretString>,
    flavor: LdapFlavor,
    roles_fallback: Vec<String>,
}

struct LookedUpUser {
    dn: String,
    attributes: HashMap<String, Option<String>>,
    groups: Vec<String>,
}

impl LdapAuthProvider {
    pub async fn new(
        name: &str,
        config: &Value,
        flavor: LdapFlavor,
        secrets: &Arc<dyn SecretStore>,
    ) -> Result<Self, AuthError> {
        let parsed: LdapConfig = serde_json::from_value(config.clone())
            .map_err(|err| AuthError::InvalidRequest(format!("invalid ldap config: {err}")))?;
        let bind_password = resolve_secret_field(secrets, parsed.bind_password.as_ref())
            .await
            .map_err(|err| AuthError::InvalidRequest(err.to_string()))?;
        if parsed.bind_dn.is_some() && bind_password.is_none() {
            return Err(AuthError::InvalidRequest(
                "ldap bind_dn configured without bind_password".to_string(),
            ));
        }
        Ok(Self {
            name: name.to_string(),
            roles_fallback: default_roles(config),
            config: parsed,
            bind_password,
            flavor,
        })
    }

    async fn connect(&self) -> Result<ldap3::Ldap, AuthError> {
        let settings = LdapConnSettings::new().set_starttls(self.config.start_tls);
        let (conn, ldap) = LdapConnAsync::with_settings(settings, &self.config.server_uri)
            .await
            .map_err(|err| AuthError::Upstream(format!("LDAP connect failed: {err}")))?;
        ldap3::drive!(conn);
        Ok(ldap)
    }

    async fn service_bind(&self) -> Result<ldap3::Ldap, AuthError> {
        let mut ldap = self.connect().await?;
        if let Some(bind_dn) = &self.config.bind_dn {
            let password = self
                .bind_password
                .as_ref()
                .expect("bind password checked at construction");
            ldap.simple_bind(bind_dn, password.expose_secret())
                .await
                .map_err(|err| AuthError::Upstream(format!("LDAP bind failed: {err}")))?
                .success()
                .map_err(|_| AuthError::InvalidCredentials("LDAP bind failed".to_string()))?;
        }
        Ok(ldap)
    }

    async fn find_user(
        &self,
        ldap: &mut ldap3::Ldap,
        username: &str,
    ) -> Result<LookedUpUser, AuthError> {
        let escaped = ldap_escape(username).to_string();
        let (base, filter) = match &self.config.user_dn_template {
            Some(template) => (
                template.replace("{username}", &escaped),
                "(objectClass=*)".to_string(),
            ),
            None => {
                let template = self
                    .config
                    .user_filter
                    .clone()
                    .unwrap_or_else(|| "(uid={username})".to_string());
                (
                    self.config.user_search_base.clone().unwrap_or_default(),
                    template.replace("{username}", &escaped),
                )
            }
        };

        let (results, _response) = ldap
            .search(&base, Scope::Subtree, &filter, vec!["*"])
            .await
            .map_err(|err| AuthError::Upstream(format!("LDAP search failed: {err}")))?
            .success()
            .map_err(|_| AuthError::InvalidCredentials("LDAP user not found".to_string()))?;

        let entry = results
            .into_iter()
            .next()
            .map(SearchEntry::construct)
            .ok_or_else(|| AuthError::InvalidCredentials("LDAP user not found".to_string()))?;

        let attributes = self
            .config
            .attributes
            .iter()
            .map(|(field, attr)| {
                let value = entry.attrs.get(attr).and_then(|values| values.first());
                (field.clone(), value.cloned())
            })
            .collect();

        let mut groups: Vec<String> = entry
            .attrs
            .get(&self.config.group_member_attr)
            .cloned()
            .unwrap_or_default();

        if let (Some(group_base), Some(group_filter)) =
            (&self.config.group_search_base, &self.config.group_filter)
        {
            let filter = group_filter
                .replace("{user_dn}", &ldap_escape(&entry.dn))
                .replace("{username}", &escaped);
            if let Ok(result) = ldap
                .search(group_base, Scope::Subtree, &filter, vec!["cn"])
                .await
            {
                if let Ok((group_results, _)) = result.success() {
                    for group in group_results {
                        groups.push(SearchEntry::construct(group).dn);
                    }
                }
            }
        }

        Ok(LookedUpUser {
            dn: entry.dn,
            attributes,
            groups,
        })
    }

    /// Verify the password by binding as the located user.
    async fn authenticate(&self, user_dn: &str, password: &str) -> Result<(), AuthError> {
        let bind_identities: Vec<String> = match (self.flavor, &self.config.default_domain) {
            (LdapFlavor::ActiveDirectory, Some(domain)) if !user_dn.contains('@') => {
                // AD usually wants the UPN; keep the DN as a fallback.
                vec![format!("{user_dn}@{domain}"), user_dn.to_string()]
            }
            _ => vec![user_dn.to_string()],
        };

        let mut last_err =
            AuthError::InvalidCredentials("Invalid LDAP credentials".to_string());
        for identity in bind_identities {
            let mut ldap = self.connect().await?;
            let outcome = ldap
                .simple_bind(&identity, password)
                .await
                .map_err(|err| AuthError::Upstream(format!("LDAP bind failed: {err}")))?
                .success();
            let _ = ldap.unbind().await;
            match outcome {
                Ok(_) => return Ok(()),
                Err(_) => {
                    last_err =
                        AuthError::InvalidCredentials("Invalid LDAP credentials".to_string());
                }
            }
        }
        Err(last_err)
    }

    fn map_roles(&self, groups: &[String]) -> Vec<String> {
        let mut roles: std::collections::BTreeSet<String> =
            self.roles_fallback.iter().cloned().collect();
        for group in groups {
            if let Some(mapped) = self.config.role_mappings.get(group) {
                roles.extend(mapped.iter().cloned());
            }
        }
        roles.into_iter().collect()
    }
}

#[async_trait]
impl AuthProvider for LdapAuthProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &'static str {
        match self.flavor {
            LdapFlavor::Generic => "ldap",
            LdapFlavor::ActiveDirectory => "active_directory",
        }
    }

    async fn begin(&self, _request: &BeginRequest) -> Result<BeginFlow, AuthError> {
        Ok(BeginFlow::Form)
    }

    async fn complete(&self, request: &CompleteRequest) -> Result<AuthResult, AuthError> {
        let credentials = request
            .credentials
            .as_ref()
            .ok_or_else(|| AuthError::InvalidRequest("Missing credentials".to_string()))?;
        let username = credentials.username.trim();
        if username.is_empty() || credentials.password.is_empty() {
            return Err(AuthError::InvalidRequest("Missing credentials".to_string()));
        }

        let mut ldap = self.service_bind().await?;
        let user = self.find_user(&mut ldap, username).await;
        let _ = ldap.unbind().await;
        let user = user?;

        self.authenticate(&user.dn, &credentials.password).await?;

        let roles = self.map_roles(&user.groups);
        let resolved_username = user
            .attributes
            .get("username")
            .and_then(|value| value.clone())
            .unwrap_or_else(|| username.to_string());
        let display_name = user
            .attributes
            .get("display_name")
            .and_then(|value| value.clone())
            .or_else(|| Some(resolved_username.clone()));
        let email = user.attributes.get("email").and_then(|value| value.clone());

        Ok(AuthResult {
            external_id: user.dn.clone(),
            username: resolved_username,
            email,
            display_name,
            provider_name: self.name.clone(),
            attributes: serde_json::json!({
                "groups": user.groups,
                "dn": user.dn,
            }),
            roles,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::secrets::MemorySecretStore;
    use pretty_assertions::assert_eq;

    async fn provider(config: Value, flavor: LdapFlavor) -> LdapAuthProvider {
        let secrets: Arc<dyn SecretStore> = Arc::new(MemorySecretStore::new());
        LdapAuthProvider::new("corp-ldap", &config, flavor, &secrets)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn config_defaults_apply() {
        let provider = provider(
            serde_json::json!({"server_uri": "ldap://ldap.corp.example"}),
            LdapFlavor::Generic,
        )
        .await;
        assert_eq!(provider.config.group_member_attr, "memberOf");
        assert_eq!(
            provider.config.attributes.get("username").unwrap(),
            "uid"
        );
        assert_eq!(provider.kind(), "ldap");
    }

    #[tokio::test]
    async fn bind_dn_without_password_is_rejected() {
        let secrets: Arc<dyn SecretStore> = Arc::new(MemorySecretStore::new());
        let err = LdapAuthProvider::new(
            "corp-ldap",
            &serde_json::json!({
                "server_uri": "ldap://ldap.corp.example",
                "bind_dn": "cn=svc,dc=corp,dc=example",
            }),
            LdapFlavor::Generic,
            &secrets,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, AuthError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn role_mapping_includes_defaults() {
        let provider = provider(
            serde_json::json!({
                "server_uri": "ldap://ldap.corp.example",
                "role_mappings": {
                    "cn=ops,ou=groups,dc=corp,dc=example": ["system.admin"],
                },
            }),
            LdapFlavor::Generic,
        )
        .await;

        let roles = provider.map_roles(&[
            "cn=ops,ou=groups,dc=corp,dc=example".to_string(),
            "cn=unmapped,ou=groups,dc=corp,dc=example".to_string(),
        ]);
        assert_eq!(
            roles,
            vec!["system.admin".to_string(), "toolkit.user".to_string()]
        );
    }

    #[tokio::test]
    async fn missing_credentials_are_rejected() {
        let provider = provider(
            serde_json::json!({"server_uri": "ldap://ldap.corp.example"}),
            LdapFlavor::Generic,
        )
        .await;
        let err = provider
            .complete(&CompleteRequest::default())
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::InvalidRequest(_)));
    }
}
