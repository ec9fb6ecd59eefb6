//! SQL persistence layer.
//!
//! The [`Database`] trait is the seam between services and storage:
//! production uses [`PgStore`] (deadpool + tokio-postgres + embedded
//! refinery migrations), tests use [`MemoryDb`].

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::toolkits::ToolkitRecord;

pub use memory::MemoryDb;
pub use postgres::PgStore;

/// A user account with its resolved role slugs.
#[derive(Debug, Clone)]
pub struct User {
    pub id: Uuid,
    pub username: String,
    pub email: Option<String>,
    pub display_name: Option<String>,
    pub password_hash: Option<String>,
    pub is_active: bool,
    pub is_superuser: bool,
    pub last_login_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub roles: Vec<String>,
}

/// Fields for creating a user.
#[derive(Debug, Clone)]
pub struct NewUser {
    pub username: String,
    pub email: Option<String>,
    pub display_name: Option<String>,
    pub password_hash: Option<String>,
    pub is_active: bool,
    pub is_superuser: bool,
}

/// Server-side session backing a refresh token. Only the SHA-256 of the
/// token is stored.
#[derive(Debug, Clone)]
pub struct AuthSessionRecord {
    pub id: Uuid,
    pub user_id: Uuid,
    pub refresh_token_hash: String,
    pub client_info: Option<String>,
    pub expires_at: DateTime<Utc>,
    pub revoked_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// A stored audit row.
#[derive(Debug, Clone)]
pub struct AuditLogRecord {
    pub id: i64,
    pub user_id: Option<Uuid>,
    pub username: Option<String>,
    pub event: String,
    pub severity: String,
    pub payload: Option<Value>,
    pub source_ip: Option<String>,
    pub user_agent: Option<String>,
    pub target_type: Option<String>,
    pub target_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Audit row to insert.
#[derive(Debug, Clone, Default)]
pub struct NewAuditLog {
    pub user_id: Option<Uuid>,
    pub event: String,
    pub severity: String,
    pub payload: Option<Value>,
    pub source_ip: Option<String>,
    pub user_agent: Option<String>,
    pub target_type: Option<String>,
    pub target_id: Option<String>,
}

/// Filters for audit listing; empty vectors match everything.
#[derive(Debug, Clone, Default)]
pub struct AuditFilters {
    pub events: Vec<String>,
    pub severities: Vec<String>,
    pub user_ids: Vec<Uuid>,
    pub target_types: Vec<String>,
    pub target_ids: Vec<String>,
    pub created_before: Option<DateTime<Utc>>,
}

/// Persisted identity provider configuration.
#[derive(Debug, Clone)]
pub struct ProviderConfigRecord {
    pub id: Uuid,
    pub name: String,
    pub kind: String,
    pub enabled: bool,
    pub config: Value,
}

/// Storage seam used by the auth core, the toolkit registry, the audit
/// service, and system settings.
#[async_trait]
pub trait Database: Send + Sync {
    /// Cheap connectivity check (`SELECT 1`).
    async fn ping(&self) -> Result<(), DatabaseError>;

    // --- Users ---

    async fn get_user_by_username(&self, username: &str) -> Result<Option<User>, DatabaseError>;

    async fn get_user_by_id(&self, id: Uuid) -> Result<Option<User>, DatabaseError>;

    async fn create_user(&self, user: NewUser) -> Result<User, DatabaseError>;

    async fn update_user_profile(
        &self,
        id: Uuid,
        email: Option<&str>,
        display_name: Option<&str>,
    ) -> Result<(), DatabaseError>;

    /// Ensure the user holds exactly the union of their current roles and
    /// `roles`; unknown role slugs are ignored.
    async fn assign_roles(&self, user_id: Uuid, roles: &[String]) -> Result<(), DatabaseError>;

    async fn mark_login(&self, user_id: Uuid) -> Result<(), DatabaseError>;

    async fn find_user_by_identity(
        &self,
        provider: &str,
        external_id: &str,
    ) -> Result<Option<User>, DatabaseError>;

    async fn link_identity(
        &self,
        user_id: Uuid,
        provider: &str,
        external_id: &str,
        attributes: &Value,
    ) -> Result<(), DatabaseError>;

    async fn count_users(&self) -> Result<i64, DatabaseError>;

    // --- Auth sessions ---

    async fn get_session_by_hash(
        &self,
        token_hash: &str,
    ) -> Result<Option<AuthSessionRecord>, DatabaseError>;

    async fn create_session(&self, session: AuthSessionRecord) -> Result<(), DatabaseError>;

    /// Rotate the stored hash and expiry for an existing session.
    async fn update_session(
        &self,
        id: Uuid,
        refresh_token_hash: &str,
        expires_at: DateTime<Utc>,
        client_info: Option<&str>,
    ) -> Result<(), DatabaseError>;

    async fn revoke_session(&self, id: Uuid) -> Result<(), DatabaseError>;

    async fn revoke_sessions_for_user(&self, user_id: Uuid) -> Result<u64, DatabaseError>;

    async fn delete_session(&self, id: Uuid) -> Result<(), DatabaseError>;

    // --- Audit log ---

    async fn insert_audit_log(&self, entry: NewAuditLog) -> Result<(), DatabaseError>;

    async fn list_audit_logs(
        &self,
        filters: &AuditFilters,
        limit: usize,
    ) -> Result<Vec<AuditLogRecord>, DatabaseError>;

    async fn purge_audit_logs_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, DatabaseError>;

    // --- Toolkits ---

    async fn upsert_toolkit(&self, record: &ToolkitRecord) -> Result<(), DatabaseError>;

    async fn get_toolkit(&self, slug: &str) -> Result<Option<ToolkitRecord>, DatabaseError>;

    async fn list_toolkits(&self) -> Result<Vec<ToolkitRecord>, DatabaseError>;

    async fn delete_toolkit(&self, slug: &str) -> Result<bool, DatabaseError>;

    async fn record_toolkit_removal(&self, slug: &str) -> Result<(), DatabaseError>;

    async fn clear_toolkit_removal(&self, slug: &str) -> Result<(), DatabaseError>;

    async fn toolkit_removal_exists(&self, slug: &str) -> Result<bool, DatabaseError>;

    // --- System settings ---

    async fn get_setting(&self, key: &str) -> Result<Option<Value>, DatabaseError>;

    async fn set_setting(&self, key: &str, value: &Value) -> Result<(), DatabaseError>;

    // --- Provider configs ---

    async fn list_provider_configs(&self) -> Result<Vec<ProviderConfigRecord>, DatabaseError>;
}
