//! Local username/password provider.
//!
//! Verifies bcrypt hashes against the users table, with Redis-backed
//! attempt throttling and lockout. Every rejected attempt lands in the
//! audit log with the reason.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::db::Database;
use crate::error::AuthError;

use super::audit::{AuditContext, AuditService};
use super::providers::{
    AuthProvider, AuthResult, BeginFlow, BeginRequest, CompleteRequest, default_roles,
};
use super::throttle::{LoginThrottle, ThrottleConfig};

pub struct LocalAuthProvider {
    name: String,
    throttle_config: ThrottleConfig,
    roles_fallback: Vec<String>,
    db: Arc<dyn Database>,
    audit: AuditService,
    throttle: LoginThrottle,
}

impl LocalAuthProvider {
    pub fn new(
        name: &str,
        config: &Value,
        db: Arc<dyn Database>,
        audit: AuditService,
        throttle: LoginThrottle,
    ) -> Result<Self, AuthError> {
        let throttle_config: ThrottleConfig = serde_json::from_value(config.clone())
            .map_err(|err| AuthError::InvalidRequest(format!("invalid local config: {err}")))?;
        Ok(Self {
            name: name.to_string(),
            throttle_config,
            roles_fallback: default_roles(config),
            db,
            audit,
            throttle,
        })
    }

    async fn audit_failure(&self, username: &str, reason: &str, request: &CompleteRequest) {
        let _ = self
            .audit
            .log(
                "auth.login.failure",
                Some(serde_json::json!({
                    "provider": self.name,
                    "username": username,
                    "reason": reason,
                })),
                AuditContext {
                    source_ip: request.source_ip.clone(),
                    user_agent: request.user_agent.clone(),
                    ..Default::default()
                },
            )
            .await;
    }
}

#[async_trait]
impl AuthProvider for LocalAuthProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &'static str {
        "local"
    }

    async fn begin(&self, _request: &BeginRequest) -> Result<BeginFlow, AuthError> {
        // Local auth happens inline; nothing to begin.
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

        if self.throttle_config.enabled() {
            let ttl = self.throttle.check_lockout(username).await?;
            if ttl > 0 {
                return Err(AuthError::Locked {
                    retry_after_seconds: ttl,
                });
            }
        }

        let user = self.db.get_user_by_username(username).await?;
        let verified = match &user {
            Some(user) => match &user.password_hash {
                Some(hash) => bcrypt::verify(&credentials.password, hash).unwrap_or(false),
                None => false,
            },
            None => {
                // Burn a comparison so missing users cost the same as
                // wrong passwords.
                let _ = bcrypt::verify(&credentials.password, DUMMY_HASH);
                false
            }
        };

        if !verified {
            self.audit_failure(username, "invalid_credentials", request)
                .await;
            let (locked, metric) = self
                .throttle
                .record_failure(username, &self.throttle_config)
                .await?;
            if locked {
                // The tripping attempt still reads as a credential
                // failure; the lockout is observed on the next request.
                let _ = self
                    .audit
                    .log(
                        "auth.login.lockout",
                        Some(serde_json::json!({
                            "provider": self.name,
                            "username": username,
                            "lockout_seconds": metric,
                        })),
                        AuditContext {
                            source_ip: request.source_ip.clone(),
                            user_agent: request.user_agent.clone(),
                            ..Default::default()
                        },
                    )
                    .await;
            }
            return Err(AuthError::InvalidCredentials(
                "Invalid username or password".to_string(),
            ));
        }

        let user = user.expect("verified user present");
        if !user.is_active {
            self.audit_failure(username, "disabled_account", request).await;
            return Err(AuthError::Forbidden);
        }

        self.throttle.reset(username).await?;

        let roles = if user.roles.is_empty() {
            self.roles_fallback.clone()
        } else {
            user.roles.clone()
        };
        Ok(AuthResult {
            external_id: user.id.to_string(),
            username: user.username.clone(),
            email: user.email.clone(),
            display_name: user.display_name.clone(),
            provider_name: self.name.clone(),
            attributes: Value::Object(Default::default()),
            roles,
        })
    }
}

/// Valid bcrypt hash of an unguessable value, used to equalize timing
/// for unknown usernames.
const DUMMY_HASH: &str = "$2b$12$C6UzMDM.H6dfI/f/IKcEeO7GBZ0p0R4wU8kWmLClT0cfpNZaEYyY.";

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{MemoryDb, NewUser};
    use crate::kv::MemoryKv;
    use pretty_assertions::assert_eq;

    async fn provider_with_user(
        throttle_config: serde_json::Value,
    ) -> (LocalAuthProvider, Arc<MemoryDb>) {
        let db = Arc::new(MemoryDb::new());
        let hash = bcrypt::hash("correct horse", 4).unwrap();
        let user = db
            .create_user(NewUser {
                username: "alice".to_string(),
                email: Some("alice@example.com".to_string()),
                display_name: Some("Alice".to_string()),
                password_hash: Some(hash),
                is_active: true,
                is_superuser: false,
            })
            .await
            .unwrap();
        db.assign_roles(user.id, &["toolkit.user".to_string()])
            .await
            .unwrap();

        let audit = AuditService::new(db.clone(), 90);
        let throttle = LoginThrottle::new(Arc::new(MemoryKv::new()), "opsdeck");
        let provider =
            LocalAuthProvider::new("local", &throttle_config, db.clone(), audit, throttle)
                .unwrap();
        (provider, db)
    }

    fn login(username: &str, password: &str) -> CompleteRequest {
        CompleteRequest {
            credentials: Some(super::super::providers::Credentials {
                username: username.to_string(),
                password: password.to_string(),
            }),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn valid_credentials_return_identity() {
        let (provider, _db) = provider_with_user(serde_json::json!({})).await;
        let result = provider
            .complete(&login("alice", "correct horse"))
            .await
            .unwrap();
        assert_eq!(result.username, "alice");
        assert_eq!(result.roles, vec!["toolkit.user".to_string()]);
    }

    #[tokio::test]
    async fn wrong_password_is_rejected_and_audited() {
        let (provider, db) = provider_with_user(serde_json::json!({})).await;
        let err = provider
            .complete(&login("alice", "wrong"))
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::InvalidCredentials(_)));

        let audit = AuditService::new(db, 90);
        let records = audit.list(&Default::default(), 10).await.unwrap();
        assert_eq!(records[0].event, "auth.login.failure");
    }

    #[tokio::test]
    async fn lockout_after_max_attempts() {
        let config = serde_json::json!({
            "max_attempts": 3,
            "window_seconds": 300,
            "lockout_seconds": 900,
        });
        let (provider, db) = provider_with_user(config).await;

        // Three wrong passwords each read as a credential failure; the
        // third trips the lockout behind the scenes.
        for _ in 0..3 {
            let err = provider
                .complete(&login("alice", "wrong"))
                .await
                .unwrap_err();
            assert!(matches!(err, AuthError::InvalidCredentials(_)));
        }

        // The fourth attempt observes the lockout, even with correct
        // credentials.
        let err = provider
            .complete(&login("alice", "correct horse"))
            .await
            .unwrap_err();
        let AuthError::Locked {
            retry_after_seconds,
        } = err
        else {
            panic!("expected lockout, got {err:?}");
        };
        assert!(retry_after_seconds > 0);

        let audit = AuditService::new(db, 90);
        let lockouts = audit
            .list(&Default::default(), 50)
            .await
            .unwrap()
            .into_iter()
            .filter(|record| record.event == "auth.login.lockout")
            .count();
        assert_eq!(lockouts, 1);
    }

    #[tokio::test]
    async fn success_resets_attempt_counter() {
        let config = serde_json::json!({
            "max_attempts": 3,
            "window_seconds": 300,
            "lockout_seconds": 900,
        });
        let (provider, _db) = provider_with_user(config).await;

        for _ in 0..2 {
            let _ = provider.complete(&login("alice", "wrong")).await;
        }
        provider
            .complete(&login("alice", "correct horse"))
            .await
            .unwrap();

        // The counter restarted; two more failures do not lock.
        for _ in 0..2 {
            let err = provider
                .complete(&login("alice", "wrong"))
                .await
                .unwrap_err();
            assert!(matches!(err, AuthError::InvalidCredentials(_)));
        }
    }

    #[tokio::test]
    async fn unknown_user_is_indistinguishable() {
        let (provider, _db) = provider_with_user(serde_json::json!({})).await;
        let err = provider
            .complete(&login("mallory", "whatever"))
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::InvalidCredentials(_)));
    }
}
