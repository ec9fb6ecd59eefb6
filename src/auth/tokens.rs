//! JWT issuance and validation.
//!
//! Access and refresh tokens are JWTs sharing a claim base (`iss`,
//! `iat`, `nbf`, `exp`, `jti`, `typ`, `sub`, `roles`, `sid`,
//! `provider`); refresh tokens additionally carry `token_use:
//! "refresh"`. HS* algorithms sign with the shared secret, RS*/ES* with
//! the configured keypair.

use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::config::AuthConfig;
use crate::error::AuthError;

/// Claims carried by both token types.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub roles: Vec<String>,
    pub sid: String,
    pub provider: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub iss: String,
    pub iat: i64,
    pub nbf: i64,
    pub exp: i64,
    pub jti: String,
    pub typ: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_use: Option<String>,
}

/// A matched access/refresh token pair.
#[derive(Debug, Clone)]
pub struct TokenBundle {
    pub access_token: String,
    pub access_expires_at: DateTime<Utc>,
    pub refresh_token: String,
    pub refresh_expires_at: DateTime<Utc>,
    pub session_id: String,
    pub token_type: &'static str,
}

#[derive(Clone)]
pub struct TokenService {
    config: AuthConfig,
    algorithm: Algorithm,
}

impl TokenService {
    pub fn new(config: AuthConfig) -> Result<Self, AuthError> {
        let algorithm: Algorithm = config
            .jwt_algorithm
            .parse()
            .map_err(|_| AuthError::Token(format!("unsupported algorithm {}", config.jwt_algorithm)))?;
        Ok(Self { config, algorithm })
    }

    fn encoding_key(&self) -> Result<EncodingKey, AuthError> {
        match self.algorithm {
            Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512 => Ok(
                EncodingKey::from_secret(self.config.jwt_secret.expose_secret().as_bytes()),
            ),
            Algorithm::RS256 | Algorithm::RS384 | Algorithm::RS512 => {
                let key = self
                    .config
                    .jwt_private_key
                    .as_ref()
                    .ok_or_else(|| AuthError::Token("JWT keypair not configured".to_string()))?;
                EncodingKey::from_rsa_pem(key.expose_secret().as_bytes())
                    .map_err(|err| AuthError::Token(err.to_string()))
            }
            Algorithm::ES256 | Algorithm::ES384 => {
                let key = self
                    .config
                    .jwt_private_key
                    .as_ref()
                    .ok_or_else(|| AuthError::Token("JWT keypair not configured".to_string()))?;
                EncodingKey::from_ec_pem(key.expose_secret().as_bytes())
                    .map_err(|err| AuthError::Token(err.to_string()))
            }
            other => Err(AuthError::Token(format!("unsupported algorithm {other:?}"))),
        }
    }

    fn decoding_key(&self) -> Result<DecodingKey, AuthError> {
        match self.algorithm {
            Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512 => Ok(
                DecodingKey::from_secret(self.config.jwt_secret.expose_secret().as_bytes()),
            ),
            Algorithm::RS256 | Algorithm::RS384 | Algorithm::RS512 => {
                let key = self
                    .config
                    .jwt_public_key
                    .as_ref()
                    .ok_or_else(|| AuthError::Token("JWT keypair not configured".to_string()))?;
                DecodingKey::from_rsa_pem(key.expose_secret().as_bytes())
                    .map_err(|err| AuthError::Token(err.to_string()))
            }
            Algorithm::ES256 | Algorithm::ES384 => {
                let key = self
                    .config
                    .jwt_public_key
                    .as_ref()
                    .ok_or_else(|| AuthError::Token("JWT keypair not configured".to_string()))?;
                DecodingKey::from_ec_pem(key.expose_secret().as_bytes())
                    .map_err(|err| AuthError::Token(err.to_string()))
            }
            other => Err(AuthError::Token(format!("unsupported algorithm {other:?}"))),
        }
    }

    fn encode(
        &self,
        base: &Claims,
        ttl_seconds: i64,
        typ: &str,
        token_use: Option<&str>,
    ) -> Result<(String, DateTime<Utc>), AuthError> {
        let issued_at = Utc::now();
        let expires_at = issued_at + Duration::seconds(ttl_seconds);
        let claims = Claims {
            iat: issued_at.timestamp(),
            nbf: issued_at.timestamp(),
            exp: expires_at.timestamp(),
            jti: Uuid::new_v4().to_string(),
            typ: typ.to_string(),
            token_use: token_use.map(str::to_string),
            ..base.clone()
        };
        let token = jsonwebtoken::encode(
            &Header::new(self.algorithm),
            &claims,
            &self.encoding_key()?,
        )
        .map_err(|err| AuthError::Token(err.to_string()))?;
        Ok((token, expires_at))
    }

    pub fn create_token_bundle(
        &self,
        user_id: &str,
        roles: &[String],
        provider: &str,
        session_id: &str,
        display_name: Option<&str>,
    ) -> Result<TokenBundle, AuthError> {
        let base = Claims {
            sub: user_id.to_string(),
            roles: roles.to_vec(),
            sid: session_id.to_string(),
            provider: provider.to_string(),
            name: display_name.map(str::to_string),
            iss: self.config.token_issuer.clone(),
            iat: 0,
            nbf: 0,
            exp: 0,
            jti: String::new(),
            typ: String::new(),
            token_use: None,
        };

        let (access_token, access_expires_at) =
            self.encode(&base, self.config.access_token_ttl_seconds, "access", None)?;
        let (refresh_token, refresh_expires_at) = self.encode(
            &base,
            self.config.refresh_token_ttl_seconds,
            "refresh",
            Some("refresh"),
        )?;

        Ok(TokenBundle {
            access_token,
            access_expires_at,
            refresh_token,
            refresh_expires_at,
            session_id: session_id.to_string(),
            token_type: "bearer",
        })
    }

    /// Decode and validate signature, expiry, and issuer.
    pub fn decode(&self, token: &str) -> Result<Claims, AuthError> {
        let mut validation = Validation::new(self.algorithm);
        validation.set_issuer(&[&self.config.token_issuer]);
        validation.validate_aud = false;
        jsonwebtoken::decode::<Claims>(token, &self.decoding_key()?, &validation)
            .map(|data| data.claims)
            .map_err(|err| match err.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => {
                    AuthError::Token("Token expired".to_string())
                }
                _ => AuthError::Token("Token validation failed".to_string()),
            })
    }

    /// Decode an access token specifically; rejects refresh tokens.
    pub fn decode_access(&self, token: &str) -> Result<Claims, AuthError> {
        let claims = self.decode(token)?;
        if claims.typ != "access" {
            return Err(AuthError::Token("Not an access token".to_string()));
        }
        Ok(claims)
    }
}

/// Hex SHA-256 of a token; the only form ever persisted.
pub fn hash_token(token: &str) -> String {
    let digest = Sha256::digest(token.as_bytes());
    digest.iter().map(|byte| format!("{byte:02x}")).collect()
}

pub fn is_token_expired(expires_at: DateTime<Utc>) -> bool {
    expires_at <= Utc::now()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AuthConfig;
    use pretty_assertions::assert_eq;
    use secrecy::SecretString;

    pub(crate) fn auth_config() -> AuthConfig {
        AuthConfig {
            jwt_secret: SecretString::from("0123456789abcdef0123456789abcdef".to_string()),
            jwt_algorithm: "HS256".to_string(),
            jwt_private_key: None,
            jwt_public_key: None,
            token_issuer: "opsdeck".to_string(),
            access_token_ttl_seconds: 900,
            refresh_token_ttl_seconds: 86_400,
            cookie_domain: None,
            cookie_secure: false,
            cookie_samesite: "lax".to_string(),
            state_secret: None,
            sso_state_ttl_seconds: 600,
            providers: vec![],
        }
    }

    #[test]
    fn bundle_roundtrip() {
        let service = TokenService::new(auth_config()).unwrap();
        let bundle = service
            .create_token_bundle(
                "user-1",
                &["toolkit.user".to_string()],
                "local",
                "sess-1",
                Some("Alice"),
            )
            .unwrap();

        let access = service.decode_access(&bundle.access_token).unwrap();
        assert_eq!(access.sub, "user-1");
        assert_eq!(access.typ, "access");
        assert_eq!(access.token_use, None);
        assert_eq!(access.sid, "sess-1");
        assert_eq!(access.provider, "local");
        assert_eq!(access.name.as_deref(), Some("Alice"));

        let refresh = service.decode(&bundle.refresh_token).unwrap();
        assert_eq!(refresh.typ, "refresh");
        assert_eq!(refresh.token_use.as_deref(), Some("refresh"));
    }

    #[test]
    fn refresh_token_is_not_an_access_token() {
        let service = TokenService::new(auth_config()).unwrap();
        let bundle = service
            .create_token_bundle("user-1", &[], "local", "sess-1", None)
            .unwrap();
        assert!(service.decode_access(&bundle.refresh_token).is_err());
    }

    #[test]
    fn wrong_issuer_is_rejected() {
        let service = TokenService::new(auth_config()).unwrap();
        let mut other_config = auth_config();
        other_config.token_issuer = "someone-else".to_string();
        let other = TokenService::new(other_config).unwrap();

        let bundle = other
            .create_token_bundle("user-1", &[], "local", "sess-1", None)
            .unwrap();
        assert!(service.decode(&bundle.access_token).is_err());
    }

    #[test]
    fn token_hash_is_stable_hex_sha256() {
        let hash = hash_token("token");
        assert_eq!(hash.len(), 64);
        assert_eq!(hash, hash_token("token"));
        assert_ne!(hash, hash_token("other"));
    }
}
