//! Authentication and session core.
//!
//! Pluggable identity providers resolve credentials into an
//! [`providers::AuthResult`]; this module turns that into a user row,
//! a pair of JWTs, and a hashed server-side session record. Refresh
//! rotation replaces both the returned refresh token and the stored
//! hash, invalidating the prior token.

pub mod audit;
pub mod ldap;
pub mod local;
pub mod oidc;
pub mod providers;
pub mod state;
pub mod throttle;
pub mod tokens;

use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use crate::db::{AuthSessionRecord, Database, NewUser, User};
use crate::error::AuthError;

use audit::{AuditContext, AuditService};
use providers::{AuthProvider, AuthResult};
use tokens::{TokenBundle, TokenService, hash_token, is_token_expired};

pub const ROLE_TOOLKIT_USER: &str = "toolkit.user";
pub const ROLE_TOOLKIT_CURATOR: &str = "toolkit.curator";
pub const ROLE_SYSTEM_ADMIN: &str = "system.admin";

/// Minimum password length accepted by the bootstrap helper.
const BOOTSTRAP_MIN_PASSWORD_LEN: usize = 8;

#[derive(Clone)]
pub struct AuthService {
    db: Arc<dyn Database>,
    tokens: TokenService,
    audit: AuditService,
}

impl AuthService {
    pub fn new(db: Arc<dyn Database>, tokens: TokenService, audit: AuditService) -> Self {
        Self { db, tokens, audit }
    }

    pub fn tokens(&self) -> &TokenService {
        &self.tokens
    }

    pub fn audit(&self) -> &AuditService {
        &self.audit
    }

    /// Map a provider identity onto a user row, provisioning SSO users
    /// on first login, then sync profile fields and roles and stamp the
    /// login.
    pub async fn resolve_user(
        &self,
        provider: &dyn AuthProvider,
        result: &AuthResult,
        source_ip: Option<&str>,
        user_agent: Option<&str>,
    ) -> Result<User, AuthError> {
        let user = if provider.kind() == "local" {
            self.db
                .get_user_by_username(&result.username)
                .await?
                .ok_or_else(|| AuthError::InvalidCredentials("User not found".to_string()))?
        } else {
            match self
                .db
                .find_user_by_identity(provider.name(), &result.external_id)
                .await?
            {
                Some(user) => user,
                None => self.provision_user(provider, result).await?,
            }
        };

        let email_update = result
            .email
            .as_deref()
            .filter(|email| user.email.as_deref() != Some(email));
        let display_update = result
            .display_name
            .as_deref()
            .filter(|name| user.display_name.as_deref() != Some(name));
        if email_update.is_some() || display_update.is_some() {
            self.db
                .update_user_profile(user.id, email_update, display_update)
                .await?;
        }

        self.db.assign_roles(user.id, &result.roles).await?;
        self.db.mark_login(user.id).await?;
        self.audit
            .log(
                "auth.login.success",
                Some(serde_json::json!({ "provider": provider.name() })),
                AuditContext {
                    user_id: Some(user.id),
                    source_ip: source_ip.map(str::to_string),
                    user_agent: user_agent.map(str::to_string),
                    ..Default::default()
                },
            )
            .await?;

        Ok(self
            .db
            .get_user_by_id(user.id)
            .await?
            .expect("user present after login"))
    }

    async fn provision_user(
        &self,
        provider: &dyn AuthProvider,
        result: &AuthResult,
    ) -> Result<User, AuthError> {
        let base = if !result.username.is_empty() {
            result.username.clone()
        } else if let Some(email) = &result.email {
            email.clone()
        } else {
            return Err(AuthError::InvalidRequest(
                "Cannot derive username from identity".to_string(),
            ));
        };
        let username = self.deduplicate_username(&base).await?;

        let user = self
            .db
            .create_user(NewUser {
                username,
                email: result.email.clone(),
                display_name: result.display_name.clone(),
                password_hash: None,
                is_active: true,
                is_superuser: false,
            })
            .await?;
        self.db.assign_roles(user.id, &result.roles).await?;
        self.db
            .link_identity(
                user.id,
                provider.name(),
                &result.external_id,
                &result.attributes,
            )
            .await?;
        self.audit
            .log(
                "user.provision",
                Some(serde_json::json!({
                    "provider": provider.name(),
                    "user_external_id": result.external_id,
                })),
                AuditContext {
                    user_id: Some(user.id),
                    ..Default::default()
                },
            )
            .await?;
        Ok(user)
    }

    async fn deduplicate_username(&self, base: &str) -> Result<String, AuthError> {
        let mut candidate = base.to_string();
        let mut attempt = 0u32;
        loop {
            if self.db.get_user_by_username(&candidate).await?.is_none() {
                return Ok(candidate);
            }
            attempt += 1;
            candidate = format!("{base}{attempt}");
        }
    }

    /// Effective role set: stored roles plus the implicit admin role
    /// for superusers.
    pub fn effective_roles(user: &User) -> Vec<String> {
        let mut roles = user.roles.clone();
        if user.is_superuser && !roles.iter().any(|role| role == ROLE_SYSTEM_ADMIN) {
            roles.push(ROLE_SYSTEM_ADMIN.to_string());
        }
        roles
    }

    /// Issue an access/refresh pair and persist the session keyed by
    /// the refresh token's hash.
    pub async fn issue_tokens(
        &self,
        user: &User,
        provider_name: &str,
        client_info: Option<&str>,
    ) -> Result<TokenBundle, AuthError> {
        let roles = Self::effective_roles(user);
        let session_id = format!("{}:{}", user.id, Utc::now().timestamp_micros());
        let bundle = self.tokens.create_token_bundle(
            &user.id.to_string(),
            &roles,
            provider_name,
            &session_id,
            user.display_name.as_deref().or(Some(&user.username)),
        )?;
        self.store_refresh_token(user.id, &bundle, client_info).await?;
        Ok(bundle)
    }

    async fn store_refresh_token(
        &self,
        user_id: Uuid,
        bundle: &TokenBundle,
        client_info: Option<&str>,
    ) -> Result<(), AuthError> {
        let token_hash = hash_token(&bundle.refresh_token);
        if let Some(existing) = self.db.get_session_by_hash(&token_hash).await? {
            if existing.user_id == user_id {
                // Same hash from the same user extends the session.
                self.db
                    .update_session(
                        existing.id,
                        &token_hash,
                        bundle.refresh_expires_at,
                        client_info,
                    )
                    .await?;
                return Ok(());
            }
            self.db.delete_session(existing.id).await?;
        }
        self.db
            .create_session(AuthSessionRecord {
                id: Uuid::new_v4(),
                user_id,
                refresh_token_hash: token_hash,
                client_info: client_info.map(str::to_string),
                expires_at: bundle.refresh_expires_at,
                revoked_at: None,
                created_at: Utc::now(),
            })
            .await?;
        Ok(())
    }

    /// Rotate a refresh token: the presented token's hash must match a
    /// live session, after which both tokens are reissued and the
    /// stored hash replaced, invalidating the old token.
    pub async fn refresh_tokens(
        &self,
        refresh_token: &str,
        source_ip: Option<&str>,
        user_agent: Option<&str>,
    ) -> Result<(TokenBundle, User), AuthError> {
        let claims = self.tokens.decode(refresh_token)?;
        if claims.typ != "refresh" || claims.token_use.as_deref() != Some("refresh") {
            return Err(AuthError::Token("Refresh token invalid".to_string()));
        }

        let token_hash = hash_token(refresh_token);
        let record = self
            .db
            .get_session_by_hash(&token_hash)
            .await?
            .filter(|record| record.revoked_at.is_none())
            .ok_or_else(|| AuthError::Token("Refresh token not recognized".to_string()))?;
        if is_token_expired(record.expires_at) {
            return Err(AuthError::Token("Refresh token expired".to_string()));
        }

        let user_id: Uuid = claims
            .sub
            .parse()
            .map_err(|_| AuthError::Token("Refresh token invalid".to_string()))?;
        let user = self
            .db
            .get_user_by_id(user_id)
            .await?
            .filter(|user| user.is_active)
            .ok_or_else(|| AuthError::Token("User inactive".to_string()))?;

        let roles = Self::effective_roles(&user);
        let bundle = self.tokens.create_token_bundle(
            &user.id.to_string(),
            &roles,
            &claims.provider,
            &claims.sid,
            user.display_name.as_deref().or(Some(&user.username)),
        )?;
        self.db
            .update_session(
                record.id,
                &hash_token(&bundle.refresh_token),
                bundle.refresh_expires_at,
                user_agent,
            )
            .await?;
        self.audit
            .log(
                "auth.token.refresh",
                Some(serde_json::json!({
                    "provider": claims.provider,
                    "session_id": claims.sid,
                })),
                AuditContext {
                    user_id: Some(user.id),
                    source_ip: source_ip.map(str::to_string),
                    user_agent: user_agent.map(str::to_string),
                    ..Default::default()
                },
            )
            .await?;
        Ok((bundle, user))
    }

    /// Soft-revoke the session backing a refresh token.
    pub async fn revoke_refresh_token(&self, refresh_token: &str) -> Result<(), AuthError> {
        let token_hash = hash_token(refresh_token);
        if let Some(record) = self.db.get_session_by_hash(&token_hash).await? {
            self.db.revoke_session(record.id).await?;
        }
        Ok(())
    }

    pub async fn logout_all_sessions(&self, user_id: Uuid) -> Result<u64, AuthError> {
        Ok(self.db.revoke_sessions_for_user(user_id).await?)
    }

    /// Create the first administrator. Fails on weak credentials or an
    /// existing username; used by the `bootstrap-admin` subcommand.
    pub async fn bootstrap_admin(
        &self,
        username: &str,
        password: &str,
        email: Option<&str>,
    ) -> Result<User, AuthError> {
        let username = username.trim();
        if username.is_empty() {
            return Err(AuthError::InvalidRequest(
                "bootstrap username must not be empty".to_string(),
            ));
        }
        if password.len() < BOOTSTRAP_MIN_PASSWORD_LEN {
            return Err(AuthError::InvalidRequest(format!(
                "bootstrap password must be at least {BOOTSTRAP_MIN_PASSWORD_LEN} characters"
            )));
        }
        if self.db.get_user_by_username(username).await?.is_some() {
            return Err(AuthError::InvalidRequest(format!(
                "user '{username}' already exists"
            )));
        }

        let password_hash = bcrypt::hash(password, bcrypt::DEFAULT_COST)
            .map_err(|err| AuthError::Token(err.to_string()))?;
        let user = self
            .db
            .create_user(NewUser {
                username: username.to_string(),
                email: email.map(str::to_string),
                display_name: None,
                password_hash: Some(password_hash),
                is_active: true,
                is_superuser: true,
            })
            .await?;
        self.db
            .assign_roles(
                user.id,
                &[ROLE_SYSTEM_ADMIN.to_string(), ROLE_TOOLKIT_USER.to_string()],
            )
            .await?;
        self.audit
            .log(
                "user.bootstrap",
                Some(serde_json::json!({ "username": username })),
                AuditContext {
                    user_id: Some(user.id),
                    ..Default::default()
                },
            )
            .await?;
        tracing::info!(username, "bootstrapped initial admin user");
        Ok(user)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryDb;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use providers::{BeginFlow, BeginRequest, CompleteRequest};
    use secrecy::SecretString;

    struct FakeProvider {
        kind: &'static str,
    }

    #[async_trait]
    impl AuthProvider for FakeProvider {
        fn name(&self) -> &str {
            "fake"
        }

        fn kind(&self) -> &'static str {
            self.kind
        }

        async fn begin(&self, _request: &BeginRequest) -> Result<BeginFlow, AuthError> {
            Ok(BeginFlow::Form)
        }

        async fn complete(&self, _request: &CompleteRequest) -> Result<AuthResult, AuthError> {
            unreachable!("tests drive resolve_user directly")
        }
    }

    fn auth_config() -> crate::config::AuthConfig {
        crate::config::AuthConfig {
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

    fn service() -> (AuthService, Arc<MemoryDb>) {
        let db = Arc::new(MemoryDb::new());
        let tokens = TokenService::new(auth_config()).unwrap();
        let audit = AuditService::new(db.clone(), 90);
        (AuthService::new(db.clone(), tokens, audit), db)
    }

    fn sso_result(username: &str) -> AuthResult {
        AuthResult {
            external_id: "ext-1".to_string(),
            username: username.to_string(),
            email: Some(format!("{username}@corp.example")),
            display_name: Some("Alice Example".to_string()),
            provider_name: "fake".to_string(),
            attributes: serde_json::json!({}),
            roles: vec![ROLE_TOOLKIT_USER.to_string()],
        }
    }

    #[tokio::test]
    async fn sso_login_provisions_then_reuses_user() {
        let (service, db) = service();
        let provider = FakeProvider { kind: "oidc" };

        let first = service
            .resolve_user(&provider, &sso_result("alice"), None, None)
            .await
            .unwrap();
        assert_eq!(first.username, "alice");
        assert!(first.roles.contains(&ROLE_TOOLKIT_USER.to_string()));

        let second = service
            .resolve_user(&provider, &sso_result("alice"), None, None)
            .await
            .unwrap();
        assert_eq!(second.id, first.id);
        assert_eq!(db.count_users().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn username_collisions_get_numeric_suffixes() {
        let (service, db) = service();
        db.create_user(NewUser {
            username: "alice".to_string(),
            email: None,
            display_name: None,
            password_hash: None,
            is_active: true,
            is_superuser: false,
        })
        .await
        .unwrap();

        let provider = FakeProvider { kind: "oidc" };
        let provisioned = service
            .resolve_user(&provider, &sso_result("alice"), None, None)
            .await
            .unwrap();
        assert_eq!(provisioned.username, "alice1");
    }

    #[tokio::test]
    async fn refresh_rotates_and_invalidates_old_token() {
        let (service, db) = service();
        let user = db
            .create_user(NewUser {
                username: "alice".to_string(),
                email: None,
                display_name: None,
                password_hash: None,
                is_active: true,
                is_superuser: false,
            })
            .await
            .unwrap();

        let bundle = service.issue_tokens(&user, "local", None).await.unwrap();
        assert_eq!(db.session_count().await, 1);

        let (rotated, refreshed_user) = service
            .refresh_tokens(&bundle.refresh_token, None, None)
            .await
            .unwrap();
        assert_eq!(refreshed_user.id, user.id);
        assert_ne!(rotated.refresh_token, bundle.refresh_token);
        // Rotation reuses the session row rather than growing the table.
        assert_eq!(db.session_count().await, 1);

        // Refresh-then-refresh with the old token fails.
        let err = service
            .refresh_tokens(&bundle.refresh_token, None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::Token(_)));
        assert!(err.to_string().contains("not recognized"));

        // The rotated token still works.
        service
            .refresh_tokens(&rotated.refresh_token, None, None)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn access_token_cannot_refresh() {
        let (service, db) = service();
        let user = db
            .create_user(NewUser {
                username: "alice".to_string(),
                email: None,
                display_name: None,
                password_hash: None,
                is_active: true,
                is_superuser: false,
            })
            .await
            .unwrap();
        let bundle = service.issue_tokens(&user, "local", None).await.unwrap();

        let err = service
            .refresh_tokens(&bundle.access_token, None, None)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("invalid"));
    }

    #[tokio::test]
    async fn revoked_session_refuses_refresh() {
        let (service, db) = service();
        let user = db
            .create_user(NewUser {
                username: "alice".to_string(),
                email: None,
                display_name: None,
                password_hash: None,
                is_active: true,
                is_superuser: false,
            })
            .await
            .unwrap();
        let bundle = service.issue_tokens(&user, "local", None).await.unwrap();

        service
            .revoke_refresh_token(&bundle.refresh_token)
            .await
            .unwrap();
        let err = service
            .refresh_tokens(&bundle.refresh_token, None, None)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not recognized"));
    }

    #[tokio::test]
    async fn superusers_carry_implicit_admin_role() {
        let (service, db) = service();
        let user = db
            .create_user(NewUser {
                username: "root".to_string(),
                email: None,
                display_name: None,
                password_hash: None,
                is_active: true,
                is_superuser: true,
            })
            .await
            .unwrap();

        let bundle = service.issue_tokens(&user, "local", None).await.unwrap();
        let claims = service.tokens().decode_access(&bundle.access_token).unwrap();
        assert!(claims.roles.contains(&ROLE_SYSTEM_ADMIN.to_string()));
    }

    #[tokio::test]
    async fn bootstrap_admin_validates_credentials() {
        let (service, _db) = service();
        assert!(service.bootstrap_admin("", "longenough", None).await.is_err());
        assert!(service.bootstrap_admin("root", "short", None).await.is_err());

        let user = service
            .bootstrap_admin("root", "longenough", Some("root@corp.example"))
            .await
            .unwrap();
        assert!(user.is_superuser);
        assert!(user.roles.contains(&ROLE_SYSTEM_ADMIN.to_string()));

        // A second bootstrap with the same name fails.
        assert!(
            service
                .bootstrap_admin("root", "longenough", None)
                .await
                .is_err()
        );
    }
}
