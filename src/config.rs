//! Process configuration resolved once at startup.
//!
//! Everything comes from the environment (optionally seeded from `.env`
//! via dotenvy). The resulting [`Config`] is immutable and passed by
//! value to the components that need it; nothing reads the environment
//! after startup.

use std::collections::HashMap;
use std::path::PathBuf;

use secrecy::SecretString;
use serde::Deserialize;
use url::Url;

/// JWT secrets that are rejected outright even when long enough.
const BANNED_JWT_SECRETS: &[&str] = &[
    "changeme",
    "change-me",
    "secret",
    "password",
    "insecure",
    "dev-secret",
    "development",
];

const MIN_JWT_SECRET_LEN: usize = 32;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),

    #[error("invalid value for {name}: {reason}")]
    Invalid { name: &'static str, reason: String },

    #[error("auth jwt secret must be at least {MIN_JWT_SECRET_LEN} characters")]
    WeakJwtSecret,

    #[error("auth jwt secret is a known placeholder value")]
    BannedJwtSecret,

    #[error("algorithm {0} requires both AUTH_JWT_PRIVATE_KEY and AUTH_JWT_PUBLIC_KEY")]
    MissingKeypair(String),
}

/// Declarative definition of an identity provider, from
/// `AUTH_PROVIDERS_JSON` / `AUTH_PROVIDERS_FILE` or the database.
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderDefinition {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub config: serde_json::Value,
}

fn default_true() -> bool {
    true
}

/// Database settings.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub pool_size: usize,
}

/// Authentication and token settings.
#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub jwt_secret: SecretString,
    pub jwt_algorithm: String,
    pub jwt_private_key: Option<SecretString>,
    pub jwt_public_key: Option<SecretString>,
    pub token_issuer: String,
    pub access_token_ttl_seconds: i64,
    pub refresh_token_ttl_seconds: i64,
    pub cookie_domain: Option<String>,
    pub cookie_secure: bool,
    pub cookie_samesite: String,
    pub state_secret: Option<SecretString>,
    pub sso_state_ttl_seconds: i64,
    pub providers: Vec<ProviderDefinition>,
}

impl AuthConfig {
    /// Key used to sign SSO state blobs; falls back to the JWT secret.
    pub fn state_signing_secret(&self) -> &SecretString {
        self.state_secret.as_ref().unwrap_or(&self.jwt_secret)
    }
}

/// Toolkit storage and bundle limits.
#[derive(Debug, Clone)]
pub struct ToolkitConfig {
    pub storage_dir: PathBuf,
    pub upload_max_bytes: u64,
    pub bundle_max_bytes: u64,
    pub bundle_max_file_bytes: u64,
    pub catalog_url: Option<String>,
}

/// Complete process configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub app_env: String,
    pub listen_host: String,
    pub listen_port: u16,
    pub database: DatabaseConfig,
    pub redis_url: String,
    pub redis_prefix: String,
    pub frontend_base_url: Option<Url>,
    pub cors_origins: Vec<String>,
    pub toolkits: ToolkitConfig,
    pub auth: AuthConfig,
    pub audit_retention_days: i64,
    pub worker_queue: String,
    pub worker_concurrency: usize,
}

impl Config {
    /// Load configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(&|name| std::env::var(name).ok())
    }

    /// Load configuration from an arbitrary lookup (used by tests).
    pub fn from_lookup(env: &dyn Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let database = DatabaseConfig {
            url: env("DATABASE_URL").ok_or(ConfigError::Missing("DATABASE_URL"))?,
            pool_size: parse_or(env, "DATABASE_POOL_SIZE", 16)?,
        };

        let redis_url =
            env("REDIS_URL").unwrap_or_else(|| "redis://localhost:6379/0".to_string());
        let redis_prefix = env("REDIS_PREFIX")
            .map(|raw| raw.trim_matches(':').to_string())
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| "opsdeck".to_string());

        let frontend_base_url = match env("FRONTEND_BASE_URL") {
            Some(raw) if !raw.trim().is_empty() => Some(Url::parse(raw.trim()).map_err(
                |err| ConfigError::Invalid {
                    name: "FRONTEND_BASE_URL",
                    reason: err.to_string(),
                },
            )?),
            _ => None,
        };

        let cors_origins = env("CORS_ORIGINS")
            .map(|raw| {
                raw.split(',')
                    .map(|part| part.trim().to_string())
                    .filter(|part| !part.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        let toolkits = ToolkitConfig {
            storage_dir: env("TOOLKIT_STORAGE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("data/toolkits")),
            upload_max_bytes: parse_or(env, "TOOLKIT_UPLOAD_MAX_BYTES", 64 * 1024 * 1024)?,
            bundle_max_bytes: parse_or(env, "TOOLKIT_BUNDLE_MAX_BYTES", 256 * 1024 * 1024)?,
            bundle_max_file_bytes: parse_or(
                env,
                "TOOLKIT_BUNDLE_MAX_FILE_BYTES",
                32 * 1024 * 1024,
            )?,
            catalog_url: env("TOOLKIT_CATALOG_URL").filter(|value| !value.trim().is_empty()),
        };

        let auth = load_auth(env)?;

        Ok(Self {
            app_env: env("APP_ENV").unwrap_or_else(|| "dev".to_string()),
            listen_host: env("APP_HOST").unwrap_or_else(|| "0.0.0.0".to_string()),
            listen_port: parse_or(env, "APP_PORT", 8080)?,
            database,
            redis_url,
            redis_prefix,
            frontend_base_url,
            cors_origins,
            toolkits,
            auth,
            audit_retention_days: parse_or(env, "AUDIT_LOG_RETENTION_DAYS", 90)?,
            worker_queue: env("WORKER_QUEUE").unwrap_or_else(|| "opsdeck".to_string()),
            worker_concurrency: parse_or(env, "WORKER_CONCURRENCY", 4)?,
        })
    }

    /// Redis key under the configured prefix: `prefix:part1:part2`.
    pub fn redis_key(&self, parts: &[&str]) -> String {
        redis_key(&self.redis_prefix, parts)
    }
}

/// Join key segments under a prefix, trimming stray colons.
pub fn redis_key(prefix: &str, parts: &[&str]) -> String {
    let mut key = prefix.trim_matches(':').to_string();
    for part in parts {
        let trimmed = part.trim_matches(':');
        if !trimmed.is_empty() {
            key.push(':');
            key.push_str(trimmed);
        }
    }
    key
}

fn load_auth(env: &dyn Fn(&str) -> Option<String>) -> Result<AuthConfig, ConfigError> {
    let raw_secret = env("AUTH_JWT_SECRET").ok_or(ConfigError::Missing("AUTH_JWT_SECRET"))?;
    let secret = raw_secret.trim().to_string();
    if BANNED_JWT_SECRETS.contains(&secret.to_lowercase().as_str()) {
        return Err(ConfigError::BannedJwtSecret);
    }
    if secret.len() < MIN_JWT_SECRET_LEN {
        return Err(ConfigError::WeakJwtSecret);
    }

    let algorithm = env("AUTH_JWT_ALGORITHM")
        .unwrap_or_else(|| "HS256".to_string())
        .to_uppercase();

    let private_key = env("AUTH_JWT_PRIVATE_KEY").map(SecretString::from);
    let public_key = env("AUTH_JWT_PUBLIC_KEY").map(SecretString::from);
    if (algorithm.starts_with("RS") || algorithm.starts_with("ES"))
        && (private_key.is_none() || public_key.is_none())
    {
        return Err(ConfigError::MissingKeypair(algorithm));
    }

    let providers = load_providers(env)?;

    Ok(AuthConfig {
        jwt_secret: SecretString::from(secret),
        jwt_algorithm: algorithm,
        jwt_private_key: private_key,
        jwt_public_key: public_key,
        token_issuer: env("AUTH_TOKEN_ISSUER").unwrap_or_else(|| "opsdeck".to_string()),
        access_token_ttl_seconds: parse_or(env, "AUTH_ACCESS_TOKEN_TTL_SECONDS", 900)?,
        refresh_token_ttl_seconds: parse_or(env, "AUTH_REFRESH_TOKEN_TTL_SECONDS", 14 * 86_400)?,
        cookie_domain: env("AUTH_COOKIE_DOMAIN").filter(|value| !value.trim().is_empty()),
        cookie_secure: parse_or(env, "AUTH_COOKIE_SECURE", true)?,
        cookie_samesite: env("AUTH_COOKIE_SAMESITE").unwrap_or_else(|| "lax".to_string()),
        state_secret: env("AUTH_STATE_SECRET").map(SecretString::from),
        sso_state_ttl_seconds: parse_or(env, "AUTH_SSO_STATE_TTL_SECONDS", 600)?,
        providers,
    })
}

fn load_providers(
    env: &dyn Fn(&str) -> Option<String>,
) -> Result<Vec<ProviderDefinition>, ConfigError> {
    let raw = if let Some(inline) = env("AUTH_PROVIDERS_JSON") {
        inline
    } else if let Some(path) = env("AUTH_PROVIDERS_FILE") {
        std::fs::read_to_string(&path).map_err(|err| ConfigError::Invalid {
            name: "AUTH_PROVIDERS_FILE",
            reason: format!("{path}: {err}"),
        })?
    } else {
        return Ok(default_providers());
    };

    let definitions: Vec<ProviderDefinition> =
        serde_json::from_str(&raw).map_err(|err| ConfigError::Invalid {
            name: "AUTH_PROVIDERS_JSON",
            reason: err.to_string(),
        })?;

    let mut seen: HashMap<String, ()> = HashMap::new();
    for definition in &definitions {
        if seen.insert(definition.name.clone(), ()).is_some() {
            return Err(ConfigError::Invalid {
                name: "AUTH_PROVIDERS_JSON",
                reason: format!("duplicate provider name '{}'", definition.name),
            });
        }
    }
    Ok(definitions)
}

/// Without explicit provider configuration a local provider with
/// throttling disabled is always available.
fn default_providers() -> Vec<ProviderDefinition> {
    vec![ProviderDefinition {
        name: "local".to_string(),
        kind: "local".to_string(),
        enabled: true,
        config: serde_json::json!({}),
    }]
}

fn parse_or<T: std::str::FromStr>(
    env: &dyn Fn(&str) -> Option<String>,
    name: &'static str,
    default: T,
) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match env(name) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|err| ConfigError::Invalid {
                name,
                reason: err.to_string(),
            }),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;
    use std::collections::HashMap;

    fn env_with(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        let mut map = HashMap::new();
        map.insert(
            "DATABASE_URL".to_string(),
            "postgres://opsdeck@localhost/opsdeck".to_string(),
        );
        map.insert(
            "AUTH_JWT_SECRET".to_string(),
            "0123456789abcdef0123456789abcdef".to_string(),
        );
        for (key, value) in pairs {
            map.insert((*key).to_string(), (*value).to_string());
        }
        map
    }

    fn load(map: &HashMap<String, String>) -> Result<Config, ConfigError> {
        Config::from_lookup(&|name| map.get(name).cloned())
    }

    #[test]
    fn loads_defaults() {
        let config = load(&env_with(&[])).unwrap();
        assert_eq!(config.redis_prefix, "opsdeck");
        assert_eq!(config.auth.access_token_ttl_seconds, 900);
        assert_eq!(config.auth.providers.len(), 1);
        assert_eq!(config.auth.providers[0].kind, "local");
    }

    #[test]
    fn rejects_short_jwt_secret() {
        let map = env_with(&[("AUTH_JWT_SECRET", "short")]);
        assert!(matches!(load(&map), Err(ConfigError::WeakJwtSecret)));
    }

    #[test]
    fn rejects_banned_jwt_secret() {
        let map = env_with(&[("AUTH_JWT_SECRET", "  ChangeMe  ")]);
        assert!(matches!(load(&map), Err(ConfigError::BannedJwtSecret)));
    }

    #[test]
    fn trims_jwt_secret_before_validation() {
        let map = env_with(&[(
            "AUTH_JWT_SECRET",
            "  0123456789abcdef0123456789abcdef  ",
        )]);
        let config = load(&map).unwrap();
        assert_eq!(
            config.auth.jwt_secret.expose_secret(),
            "0123456789abcdef0123456789abcdef"
        );
    }

    #[test]
    fn asymmetric_algorithm_requires_keypair() {
        let map = env_with(&[("AUTH_JWT_ALGORITHM", "RS256")]);
        assert!(matches!(load(&map), Err(ConfigError::MissingKeypair(_))));
    }

    #[test]
    fn redis_key_joins_under_prefix() {
        assert_eq!(redis_key("opsdeck", &["jobs"]), "opsdeck:jobs");
        assert_eq!(
            redis_key("opsdeck:", &["auth", "local", "attempts", "alice"]),
            "opsdeck:auth:local:attempts:alice"
        );
        assert_eq!(redis_key("opsdeck", &[]), "opsdeck");
    }

    #[test]
    fn cors_origins_split_on_commas() {
        let map = env_with(&[(
            "CORS_ORIGINS",
            "http://localhost:5173, https://ops.example.com",
        )]);
        let config = load(&map).unwrap();
        assert_eq!(config.cors_origins.len(), 2);
    }

    #[test]
    fn provider_definitions_parse_from_json() {
        let map = env_with(&[(
            "AUTH_PROVIDERS_JSON",
            r#"[{"name":"corp","type":"oidc","config":{"discovery_url":"https://idp.example/.well-known/openid-configuration","client_id":"ops"}}]"#,
        )]);
        let config = load(&map).unwrap();
        assert_eq!(config.auth.providers.len(), 1);
        assert_eq!(config.auth.providers[0].kind, "oidc");
        assert!(config.auth.providers[0].enabled);
    }

    #[test]
    fn duplicate_provider_names_rejected() {
        let map = env_with(&[(
            "AUTH_PROVIDERS_JSON",
            r#"[{"name":"local","type":"local"},{"name":"local","type":"ldap"}]"#,
        )]);
        assert!(load(&map).is_err());
    }
}
