//! OIDC provider with PKCE, signed state, and JWKS validation.
//!
//! `begin` builds the authorization redirect: S256 code challenge, a
//! random nonce, and a signed state blob carrying the verifier so the
//! callback can complete statelessly. `complete` verifies the state,
//! exchanges the code (HTTP basic auth when a client secret is set),
//! and validates the id token against the provider's JWKS: audience,
//! issuer, nonce, and an algorithm the discovery document advertises.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use jsonwebtoken::jwk::JwkSet;
use jsonwebtoken::{DecodingKey, Validation};
use rand::RngCore;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::sync::OnceCell;

use crate::error::AuthError;
use crate::secrets::{SecretStore, resolve_secret_field};

use super::providers::{
    AuthProvider, AuthResult, BeginFlow, BeginRequest, CompleteRequest, default_roles,
};
use super::state::StateSigner;

/// Network budget for discovery, token, and JWKS calls.
const HTTP_TIMEOUT_SECONDS: u64 = 10;

#[derive(Debug, Clone, Deserialize)]
struct OidcConfig {
    discovery_url: String,
    client_id: String,
    #[serde(default)]
    client_secret: Option<Value>,
    #[serde(default = "default_scopes")]
    scopes: Vec<String>,
    #[serde(default = "default_response_type")]
    response_type: String,
    #[serde(default = "default_true")]
    use_pkce: bool,
    #[serde(default)]
    redirect_base_url: Option<String>,
    #[serde(default)]
    prompt: Option<String>,
    #[serde(default)]
    audience: Option<String>,
    #[serde(default)]
    claim_mappings: HashMap<String, String>,
    #[serde(default)]
    group_claim: Option<String>,
    #[serde(default)]
    role_mappings: HashMap<String, Vec<String>>,
}

fn default_scopes() -> Vec<String> {
    vec!["openid".to_string(), "profile".to_string(), "email".to_string()]
}

fn default_response_type() -> String {
    "code".to_string()
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
struct DiscoveryDocument {
    issuer: Option<String>,
    authorization_endpoint: Option<String>,
    token_endpoint: Option<String>,
    jwks_uri: Option<String>,
    #[serde(default)]
    id_token_signing_alg_values_supported: Vec<String>,
}

/// Contents of the signed `state` parameter.
#[derive(Debug, Serialize, Deserialize)]
struct StatePayload {
    provider: String,
    nonce: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    code_verifier: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    next: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    mode: Option<String>,
}

pub struct OidcAuthProvider {
    name: String,
    config: OidcConfig,
    client_secret: Option<SecretString>,
    roles_fallback: Vec<String>,
    state_signer: StateSigner,
    http: reqwest::Client,
    discovery: OnceCell<DiscoveryDocument>,
}

fn b64url(data: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(data)
}

fn generate_code_verifier() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    b64url(&bytes)
}

fn code_challenge(verifier: &str) -> String {
    b64url(&Sha256::digest(verifier.as_bytes()))
}

impl OidcAuthProvider {
    pub async fn new(
        name: &str,
        config: &Value,
        state_signer: StateSigner,
        secrets: &Arc<dyn SecretStore>,
    ) -> Result<Self, AuthError> {
        let parsed: OidcConfig = serde_json::from_value(config.clone())
            .map_err(|err| AuthError::InvalidRequest(format!("invalid oidc config: {err}")))?;
        let client_secret = resolve_secret_field(secrets, parsed.client_secret.as_ref())
            .await
            .map_err(|err| AuthError::InvalidRequest(err.to_string()))?;

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(HTTP_TIMEOUT_SECONDS))
            .build()
            .map_err(|err| AuthError::Upstream(err.to_string()))?;

        Ok(Self {
            name: name.to_string(),
            roles_fallback: default_roles(config),
            config: parsed,
            client_secret,
            state_signer,
            http,
            discovery: OnceCell::new(),
        })
    }

    async fn discovery(&self) -> Result<&DiscoveryDocument, AuthError> {
        self.discovery
            .get_or_try_init(|| async {
                let response = self
                    .http
                    .get(&self.config.discovery_url)
                    .send()
                    .await
                    .map_err(|err| AuthError::Upstream(err.to_string()))?;
                if !response.status().is_success() {
                    return Err(AuthError::Upstream(format!(
                        "discovery returned {}",
                        response.status()
                    )));
                }
                response
                    .json::<DiscoveryDocument>()
                    .await
                    .map_err(|err| AuthError::Upstream(err.to_string()))
            })
            .await
    }

    fn redirect_uri(&self, base_url: &str) -> String {
        let base = self
            .config
            .redirect_base_url
            .as_deref()
            .unwrap_or(base_url)
            .trim_end_matches('/');
        format!("{base}/auth/providers/{}/callback", self.name)
    }

    async fn exchange_code(
        &self,
        code: &str,
        redirect_uri: &str,
        code_verifier: Option<&str>,
    ) -> Result<Value, AuthError> {
        let discovery = self.discovery().await?;
        let token_endpoint = discovery
            .token_endpoint
            .as_deref()
            .ok_or_else(|| AuthError::Upstream("OIDC token endpoint missing".to_string()))?;

        let mut form: Vec<(&str, &str)> = vec![
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", redirect_uri),
            ("client_id", &self.config.client_id),
        ];
        if let Some(verifier) = code_verifier {
            form.push(("code_verifier", verifier));
        }

        let mut request = self.http.post(token_endpoint).form(&form);
        if let Some(secret) = &self.client_secret {
            request = request.basic_auth(&self.config.client_id, Some(secret.expose_secret()));
        }

        let response = request
            .send()
            .await
            .map_err(|err| AuthError::Upstream(err.to_string()))?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            tracing::error!(
                provider = %self.name,
                %status,
                body = %body.trim(),
                "OIDC token exchange failed"
            );
            return Err(AuthError::InvalidCredentials(
                "OIDC token exchange failed".to_string(),
            ));
        }
        response
            .json()
            .await
            .map_err(|err| AuthError::Upstream(err.to_string()))
    }

    async fn validate_id_token(&self, id_token: &str, nonce: &str) -> Result<Value, AuthError> {
        let discovery = self.discovery().await?;
        let jwks_uri = discovery
            .jwks_uri
            .as_deref()
            .ok_or_else(|| AuthError::Upstream("OIDC JWKS URI missing".to_string()))?;
        let jwks: JwkSet = self
            .http
            .get(jwks_uri)
            .send()
            .await
            .map_err(|err| AuthError::Upstream(err.to_string()))?
            .json()
            .await
            .map_err(|err| AuthError::Upstream(err.to_string()))?;

        let header = jsonwebtoken::decode_header(id_token)
            .map_err(|_| AuthError::InvalidCredentials("OIDC token validation failed".to_string()))?;

        // Accept the algorithms the provider advertises; a token signed
        // with its own advertised alg is also accepted.
        let mut algorithms: Vec<jsonwebtoken::Algorithm> = discovery
            .id_token_signing_alg_values_supported
            .iter()
            .filter_map(|alg| alg.parse().ok())
            .collect();
        if algorithms.is_empty() {
            algorithms.push(jsonwebtoken::Algorithm::RS256);
        }
        if !algorithms.contains(&header.alg) {
            algorithms.insert(0, header.alg);
        }

        let jwk = match &header.kid {
            Some(kid) => jwks.find(kid),
            None => jwks.keys.first(),
        }
        .ok_or_else(|| AuthError::InvalidCredentials("OIDC signing key not found".to_string()))?;
        let key = DecodingKey::from_jwk(jwk)
            .map_err(|err| AuthError::Upstream(err.to_string()))?;

        let mut validation = Validation::new(header.alg);
        validation.algorithms = algorithms;
        let audience = self
            .config
            .audience
            .as_deref()
            .unwrap_or(&self.config.client_id);
        validation.set_audience(&[audience]);
        if let Some(issuer) = discovery.issuer.as_deref() {
            validation.set_issuer(&[issuer]);
        }

        let data = jsonwebtoken::decode::<Value>(id_token, &key, &validation).map_err(|err| {
            tracing::error!(provider = %self.name, error = %err, "OIDC token validation failed");
            AuthError::InvalidCredentials("OIDC token validation failed".to_string())
        })?;
        let claims = data.claims;

        if claims.get("nonce").and_then(Value::as_str) != Some(nonce) {
            return Err(AuthError::InvalidCredentials(
                "OIDC nonce mismatch".to_string(),
            ));
        }
        Ok(claims)
    }

    fn claim_mapping(&self, field: &str, default: &str) -> String {
        self.config
            .claim_mappings
            .get(field)
            .cloned()
            .unwrap_or_else(|| default.to_string())
    }

    fn map_roles(&self, claims: &Value) -> Vec<String> {
        let mut roles: std::collections::BTreeSet<String> =
            self.roles_fallback.iter().cloned().collect();
        if let Some(group_claim) = &self.config.group_claim {
            let groups: Vec<String> = match claims.get(group_claim) {
                Some(Value::String(group)) => vec![group.clone()],
                Some(Value::Array(values)) => values
                    .iter()
                    .filter_map(|value| value.as_str().map(str::to_string))
                    .collect(),
                _ => vec![],
            };
            for group in groups {
                if let Some(mapped) = self.config.role_mappings.get(&group) {
                    roles.extend(mapped.iter().cloned());
                }
            }
        }
        roles.into_iter().collect()
    }
}

#[async_trait]
impl AuthProvider for OidcAuthProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &'static str {
        "oidc"
    }

    async fn begin(&self, request: &BeginRequest) -> Result<BeginFlow, AuthError> {
        let discovery = self.discovery().await?;
        let authorization_endpoint = discovery
            .authorization_endpoint
            .as_deref()
            .ok_or_else(|| AuthError::Upstream("OIDC provider misconfigured".to_string()))?;

        let mut nonce_bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = b64url(&nonce_bytes);
        let code_verifier = self.config.use_pkce.then(generate_code_verifier);

        let state = self.state_signer.sign(&StatePayload {
            provider: self.name.clone(),
            nonce: nonce.clone(),
            code_verifier: code_verifier.clone(),
            next: request.next.clone(),
            mode: request.mode.clone(),
        });

        let mut url = url::Url::parse(authorization_endpoint)
            .map_err(|err| AuthError::Upstream(err.to_string()))?;
        {
            let mut params = url.query_pairs_mut();
            params.append_pair("response_type", &self.config.response_type);
            params.append_pair("client_id", &self.config.client_id);
            params.append_pair("redirect_uri", &self.redirect_uri(&request.base_url));
            params.append_pair("scope", &self.config.scopes.join(" "));
            params.append_pair("state", &state);
            params.append_pair("nonce", &nonce);
            if let Some(prompt) = &self.config.prompt {
                params.append_pair("prompt", prompt);
            }
            if let Some(audience) = &self.config.audience {
                params.append_pair("audience", audience);
            }
            if let Some(verifier) = &code_verifier {
                params.append_pair("code_challenge", &code_challenge(verifier));
                params.append_pair("code_challenge_method", "S256");
            }
        }

        Ok(BeginFlow::Redirect {
            url: url.to_string(),
        })
    }

    async fn complete(&self, request: &CompleteRequest) -> Result<AuthResult, AuthError> {
        let code = request
            .callback_params
            .get("code")
            .ok_or_else(|| AuthError::InvalidRequest("Missing authorization response".to_string()))?;
        let state_token = request
            .callback_params
            .get("state")
            .ok_or_else(|| AuthError::InvalidRequest("Missing authorization response".to_string()))?;

        let state: StatePayload = self
            .state_signer
            .verify(state_token)
            .map_err(|err| AuthError::InvalidRequest(err.to_string()))?;
        if state.provider != self.name {
            return Err(AuthError::InvalidRequest(
                "Invalid SSO state token".to_string(),
            ));
        }

        let redirect_uri = self.redirect_uri(&request.base_url);
        let token_payload = self
            .exchange_code(code, &redirect_uri, state.code_verifier.as_deref())
            .await?;
        let id_token = token_payload
            .get("id_token")
            .and_then(Value::as_str)
            .ok_or_else(|| AuthError::InvalidCredentials("OIDC id_token missing".to_string()))?;

        let claims = self.validate_id_token(id_token, &state.nonce).await?;

        let username_claim = self.claim_mapping("username", "preferred_username");
        let email_claim = self.claim_mapping("email", "email");
        let display_claim = self.claim_mapping("display_name", "name");

        let username = claims
            .get(&username_claim)
            .and_then(Value::as_str)
            .ok_or_else(|| AuthError::InvalidRequest("OIDC username missing".to_string()))?
            .to_string();
        let email = claims
            .get(&email_claim)
            .and_then(Value::as_str)
            .map(str::to_string);
        let display_name = claims
            .get(&display_claim)
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| Some(username.clone()));
        let subject = claims
            .get("sub")
            .and_then(Value::as_str)
            .unwrap_or(&username)
            .to_string();
        let roles = self.map_roles(&claims);

        Ok(AuthResult {
            external_id: subject,
            username,
            email,
            display_name,
            provider_name: self.name.clone(),
            attributes: serde_json::json!({ "claims": claims }),
            roles,
        })
    }
}
