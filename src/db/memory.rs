//! In-memory [`Database`] implementation.
//!
//! Mirrors the observable behavior of [`super::PgStore`] closely enough
//! for service-level tests: role assignment ignores unknown slugs, audit
//! listing is newest-first, session lookups go by token hash.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::toolkits::ToolkitRecord;

use super::{
    AuditFilters, AuditLogRecord, AuthSessionRecord, Database, NewAuditLog, NewUser,
    ProviderConfigRecord, User,
};

struct Inner {
    users: HashMap<Uuid, User>,
    known_roles: HashSet<String>,
    identities: HashMap<(String, String), Uuid>,
    sessions: HashMap<Uuid, AuthSessionRecord>,
    audit: Vec<AuditLogRecord>,
    audit_seq: i64,
    toolkits: HashMap<String, ToolkitRecord>,
    removals: HashSet<String>,
    settings: HashMap<String, Value>,
    provider_configs: Vec<ProviderConfigRecord>,
}

impl Default for Inner {
    fn default() -> Self {
        // The migrations seed the static role catalog; mirror it here.
        let known_roles = ["toolkit.user", "toolkit.curator", "system.admin"]
            .into_iter()
            .map(str::to_string)
            .collect();
        Self {
            users: HashMap::new(),
            known_roles,
            identities: HashMap::new(),
            sessions: HashMap::new(),
            audit: Vec::new(),
            audit_seq: 0,
            toolkits: HashMap::new(),
            removals: HashSet::new(),
            settings: HashMap::new(),
            provider_configs: Vec::new(),
        }
    }
}

/// In-memory store for tests.
#[derive(Clone, Default)]
pub struct MemoryDb {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryDb {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_provider_config(&self, record: ProviderConfigRecord) {
        self.inner.lock().await.provider_configs.push(record);
    }

    pub async fn session_count(&self) -> usize {
        self.inner.lock().await.sessions.len()
    }
}

#[async_trait]
impl Database for MemoryDb {
    async fn ping(&self) -> Result<(), DatabaseError> {
        Ok(())
    }

    async fn get_user_by_username(&self, username: &str) -> Result<Option<User>, DatabaseError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .users
            .values()
            .find(|user| user.username == username)
            .cloned())
    }

    async fn get_user_by_id(&self, id: Uuid) -> Result<Option<User>, DatabaseError> {
        Ok(self.inner.lock().await.users.get(&id).cloned())
    }

    async fn create_user(&self, user: NewUser) -> Result<User, DatabaseError> {
        let mut inner = self.inner.lock().await;
        let now = Utc::now();
        let record = User {
            id: Uuid::new_v4(),
            username: user.username,
            email: user.email,
            display_name: user.display_name,
            password_hash: user.password_hash,
            is_active: user.is_active,
            is_superuser: user.is_superuser,
            last_login_at: None,
            created_at: now,
            updated_at: now,
            roles: Vec::new(),
        };
        inner.users.insert(record.id, record.clone());
        Ok(record)
    }

    async fn update_user_profile(
        &self,
        id: Uuid,
        email: Option<&str>,
        display_name: Option<&str>,
    ) -> Result<(), DatabaseError> {
        let mut inner = self.inner.lock().await;
        if let Some(user) = inner.users.get_mut(&id) {
            if let Some(email) = email {
                user.email = Some(email.to_string());
            }
            if let Some(display_name) = display_name {
                user.display_name = Some(display_name.to_string());
            }
            user.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn assign_roles(&self, user_id: Uuid, roles: &[String]) -> Result<(), DatabaseError> {
        let mut inner = self.inner.lock().await;
        let known: Vec<String> = roles
            .iter()
            .filter(|role| inner.known_roles.contains(*role))
            .cloned()
            .collect();
        if let Some(user) = inner.users.get_mut(&user_id) {
            for role in known {
                if !user.roles.contains(&role) {
                    user.roles.push(role);
                }
            }
            user.roles.sort();
        }
        Ok(())
    }

    async fn mark_login(&self, user_id: Uuid) -> Result<(), DatabaseError> {
        let mut inner = self.inner.lock().await;
        if let Some(user) = inner.users.get_mut(&user_id) {
            user.last_login_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn find_user_by_identity(
        &self,
        provider: &str,
        external_id: &str,
    ) -> Result<Option<User>, DatabaseError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .identities
            .get(&(provider.to_string(), external_id.to_string()))
            .and_then(|id| inner.users.get(id))
            .cloned())
    }

    async fn link_identity(
        &self,
        user_id: Uuid,
        provider: &str,
        external_id: &str,
        _attributes: &Value,
    ) -> Result<(), DatabaseError> {
        self.inner
            .lock()
            .await
            .identities
            .insert((provider.to_string(), external_id.to_string()), user_id);
        Ok(())
    }

    async fn count_users(&self) -> Result<i64, DatabaseError> {
        Ok(self.inner.lock().await.users.len() as i64)
    }

    async fn get_session_by_hash(
        &self,
        token_hash: &str,
    ) -> Result<Option<AuthSessionRecord>, DatabaseError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .sessions
            .values()
            .find(|session| session.refresh_token_hash == token_hash)
            .cloned())
    }

    async fn create_session(&self, session: AuthSessionRecord) -> Result<(), DatabaseError> {
        self.inner.lock().await.sessions.insert(session.id, session);
        Ok(())
    }

    async fn update_session(
        &self,
        id: Uuid,
        refresh_token_hash: &str,
        expires_at: DateTime<Utc>,
        client_info: Option<&str>,
    ) -> Result<(), DatabaseError> {
        let mut inner = self.inner.lock().await;
        if let Some(session) = inner.sessions.get_mut(&id) {
            session.refresh_token_hash = refresh_token_hash.to_string();
            session.expires_at = expires_at;
            session.revoked_at = None;
            if let Some(client_info) = client_info {
                session.client_info = Some(client_info.to_string());
            }
        }
        Ok(())
    }

    async fn revoke_session(&self, id: Uuid) -> Result<(), DatabaseError> {
        let mut inner = self.inner.lock().await;
        if let Some(session) = inner.sessions.get_mut(&id) {
            if session.revoked_at.is_none() {
                session.revoked_at = Some(Utc::now());
            }
        }
        Ok(())
    }

    async fn revoke_sessions_for_user(&self, user_id: Uuid) -> Result<u64, DatabaseError> {
        let mut inner = self.inner.lock().await;
        let mut revoked = 0;
        for session in inner.sessions.values_mut() {
            if session.user_id == user_id && session.revoked_at.is_none() {
                session.revoked_at = Some(Utc::now());
                revoked += 1;
            }
        }
        Ok(revoked)
    }

    async fn delete_session(&self, id: Uuid) -> Result<(), DatabaseError> {
        self.inner.lock().await.sessions.remove(&id);
        Ok(())
    }

    async fn insert_audit_log(&self, entry: NewAuditLog) -> Result<(), DatabaseError> {
        let mut inner = self.inner.lock().await;
        inner.audit_seq += 1;
        let username = entry
            .user_id
            .and_then(|id| inner.users.get(&id))
            .map(|user| user.username.clone());
        let id = inner.audit_seq;
        inner.audit.push(AuditLogRecord {
            id,
            user_id: entry.user_id,
            username,
            event: entry.event,
            severity: entry.severity,
            payload: entry.payload,
            source_ip: entry.source_ip,
            user_agent: entry.user_agent,
            target_type: entry.target_type,
            target_id: entry.target_id,
            created_at: Utc::now(),
        });
        Ok(())
    }

    async fn list_audit_logs(
        &self,
        filters: &AuditFilters,
        limit: usize,
    ) -> Result<Vec<AuditLogRecord>, DatabaseError> {
        let inner = self.inner.lock().await;
        let mut records: Vec<AuditLogRecord> = inner
            .audit
            .iter()
            .filter(|record| {
                (filters.events.is_empty() || filters.events.contains(&record.event))
                    && (filters.severities.is_empty()
                        || filters.severities.contains(&record.severity))
                    && (filters.user_ids.is_empty()
                        || record
                            .user_id
                            .is_some_and(|id| filters.user_ids.contains(&id)))
                    && (filters.target_types.is_empty()
                        || record
                            .target_type
                            .as_ref()
                            .is_some_and(|value| filters.target_types.contains(value)))
                    && (filters.target_ids.is_empty()
                        || record
                            .target_id
                            .as_ref()
                            .is_some_and(|value| filters.target_ids.contains(value)))
                    && filters
                        .created_before
                        .is_none_or(|cutoff| record.created_at < cutoff)
            })
            .cloned()
            .collect();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        records.truncate(limit);
        Ok(records)
    }

    async fn purge_audit_logs_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, DatabaseError> {
        let mut inner = self.inner.lock().await;
        let before = inner.audit.len();
        inner.audit.retain(|record| record.created_at >= cutoff);
        Ok((before - inner.audit.len()) as u64)
    }

    async fn upsert_toolkit(&self, record: &ToolkitRecord) -> Result<(), DatabaseError> {
        self.inner
            .lock()
            .await
            .toolkits
            .insert(record.slug.clone(), record.clone());
        Ok(())
    }

    async fn get_toolkit(&self, slug: &str) -> Result<Option<ToolkitRecord>, DatabaseError> {
        Ok(self.inner.lock().await.toolkits.get(slug).cloned())
    }

    async fn list_toolkits(&self) -> Result<Vec<ToolkitRecord>, DatabaseError> {
        Ok(self.inner.lock().await.toolkits.values().cloned().collect())
    }

    async fn delete_toolkit(&self, slug: &str) -> Result<bool, DatabaseError> {
        Ok(self.inner.lock().await.toolkits.remove(slug).is_some())
    }

    async fn record_toolkit_removal(&self, slug: &str) -> Result<(), DatabaseError> {
        self.inner.lock().await.removals.insert(slug.to_string());
        Ok(())
    }

    async fn clear_toolkit_removal(&self, slug: &str) -> Result<(), DatabaseError> {
        self.inner.lock().await.removals.remove(slug);
        Ok(())
    }

    async fn toolkit_removal_exists(&self, slug: &str) -> Result<bool, DatabaseError> {
        Ok(self.inner.lock().await.removals.contains(slug))
    }

    async fn get_setting(&self, key: &str) -> Result<Option<Value>, DatabaseError> {
        Ok(self.inner.lock().await.settings.get(key).cloned())
    }

    async fn set_setting(&self, key: &str, value: &Value) -> Result<(), DatabaseError> {
        self.inner
            .lock()
            .await
            .settings
            .insert(key.to_string(), value.clone());
        Ok(())
    }

    async fn list_provider_configs(&self) -> Result<Vec<ProviderConfigRecord>, DatabaseError> {
        Ok(self.inner.lock().await.provider_configs.clone())
    }
}
