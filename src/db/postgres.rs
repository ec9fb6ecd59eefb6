//! PostgreSQL store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_postgres::{Config, Pool, Runtime};
use serde_json::Value;
use tokio_postgres::NoTls;
use tokio_postgres::Row;
use uuid::Uuid;

use crate::config::DatabaseConfig;
use crate::error::DatabaseError;
use crate::toolkits::{DashboardCard, ToolkitOrigin, ToolkitRecord};

use super::{
    AuditFilters, AuditLogRecord, AuthSessionRecord, Database, NewAuditLog, NewUser,
    ProviderConfigRecord, User,
};

mod embedded {
    refinery::embed_migrations!("migrations");
}

/// Database store backed by a deadpool connection pool.
pub struct PgStore {
    pool: Pool,
}

impl PgStore {
    /// Create a new store and verify connectivity.
    pub async fn new(config: &DatabaseConfig) -> Result<Self, DatabaseError> {
        let mut cfg = Config::new();
        cfg.url = Some(config.url.clone());
        cfg.pool = Some(deadpool_postgres::PoolConfig {
            max_size: config.pool_size,
            ..Default::default()
        });

        let pool = cfg
            .create_pool(Some(Runtime::Tokio1), NoTls)
            .map_err(|e| DatabaseError::Pool(e.to_string()))?;

        // Test connection
        let _ = pool.get().await?;

        Ok(Self { pool })
    }

    /// Run embedded migrations.
    pub async fn run_migrations(&self) -> Result<(), DatabaseError> {
        let mut conn = self.pool.get().await?;
        let client: &mut tokio_postgres::Client = &mut conn;
        embedded::migrations::runner()
            .run_async(client)
            .await
            .map_err(|e| DatabaseError::Migration(e.to_string()))?;
        Ok(())
    }

    async fn conn(&self) -> Result<deadpool_postgres::Object, DatabaseError> {
        Ok(self.pool.get().await?)
    }

    async fn roles_for(&self, user_id: Uuid) -> Result<Vec<String>, DatabaseError> {
        let conn = self.conn().await?;
        let rows = conn
            .query(
                "SELECT role_slug FROM user_roles WHERE user_id = $1 ORDER BY role_slug",
                &[&user_id],
            )
            .await?;
        Ok(rows.iter().map(|row| row.get(0)).collect())
    }

    async fn user_from_row(&self, row: Row) -> Result<User, DatabaseError> {
        let id: Uuid = row.get("id");
        let roles = self.roles_for(id).await?;
        Ok(User {
            id,
            username: row.get("username"),
            email: row.get("email"),
            display_name: row.get("display_name"),
            password_hash: row.get("password_hash"),
            is_active: row.get("is_active"),
            is_superuser: row.get("is_superuser"),
            last_login_at: row.get("last_login_at"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
            roles,
        })
    }
}

const USER_COLUMNS: &str = "id, username, email, display_name, password_hash, is_active, \
     is_superuser, last_login_at, created_at, updated_at";

fn toolkit_from_row(row: &Row) -> Result<ToolkitRecord, DatabaseError> {
    let origin_raw: String = row.get("origin");
    let origin = ToolkitOrigin::parse(&origin_raw)
        .ok_or_else(|| DatabaseError::Decode(format!("unknown toolkit origin '{origin_raw}'")))?;
    let tags: Value = row.get("tags");
    let cards: Value = row.get("dashboard_cards");
    let tags: Vec<String> = serde_json::from_value(tags)
        .map_err(|e| DatabaseError::Decode(e.to_string()))?;
    let dashboard_cards: Vec<DashboardCard> =
        serde_json::from_value(cards).map_err(|e| DatabaseError::Decode(e.to_string()))?;
    Ok(ToolkitRecord {
        slug: row.get("slug"),
        name: row.get("name"),
        description: row.get("description"),
        base_path: row.get("base_path"),
        enabled: row.get("enabled"),
        category: row.get("category"),
        tags,
        origin,
        version: row.get("version"),
        backend_module: row.get("backend_module"),
        backend_router_attr: row.get("backend_router_attr"),
        worker_module: row.get("worker_module"),
        worker_register_attr: row.get("worker_register_attr"),
        dashboard_cards,
        dashboard_context_module: row.get("dashboard_context_module"),
        dashboard_context_attr: row.get("dashboard_context_attr"),
        frontend_entry: row.get("frontend_entry"),
        frontend_source_entry: row.get("frontend_source_entry"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

const TOOLKIT_COLUMNS: &str = "slug, name, description, base_path, enabled, category, tags, \
     origin, version, backend_module, backend_router_attr, worker_module, \
     worker_register_attr, dashboard_cards, dashboard_context_module, \
     dashboard_context_attr, frontend_entry, frontend_source_entry, created_at, updated_at";

#[async_trait]
impl Database for PgStore {
    async fn ping(&self) -> Result<(), DatabaseError> {
        let conn = self.conn().await?;
        conn.execute("SELECT 1", &[]).await?;
        Ok(())
    }

    // ==================== Users ====================

    async fn get_user_by_username(&self, username: &str) -> Result<Option<User>, DatabaseError> {
        let conn = self.conn().await?;
        let row = conn
            .query_opt(
                &format!("SELECT {USER_COLUMNS} FROM users WHERE username = $1"),
                &[&username],
            )
            .await?;
        drop(conn);
        match row {
            Some(row) => Ok(Some(self.user_from_row(row).await?)),
            None => Ok(None),
        }
    }

    async fn get_user_by_id(&self, id: Uuid) -> Result<Option<User>, DatabaseError> {
        let conn = self.conn().await?;
        let row = conn
            .query_opt(
                &format!("SELECT {USER_COLUMNS} FROM users WHERE id = $1"),
                &[&id],
            )
            .await?;
        drop(conn);
        match row {
            Some(row) => Ok(Some(self.user_from_row(row).await?)),
            None => Ok(None),
        }
    }

    async fn create_user(&self, user: NewUser) -> Result<User, DatabaseError> {
        let conn = self.conn().await?;
        let id = Uuid::new_v4();
        conn.execute(
            "INSERT INTO users (id, username, email, display_name, password_hash, is_active, is_superuser) \
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
            &[
                &id,
                &user.username,
                &user.email,
                &user.display_name,
                &user.password_hash,
                &user.is_active,
                &user.is_superuser,
            ],
        )
        .await?;
        drop(conn);
        self.get_user_by_id(id)
            .await?
            .ok_or_else(|| DatabaseError::Decode("created user vanished".to_string()))
    }

    async fn update_user_profile(
        &self,
        id: Uuid,
        email: Option<&str>,
        display_name: Option<&str>,
    ) -> Result<(), DatabaseError> {
        let conn = self.conn().await?;
        conn.execute(
            "UPDATE users SET email = COALESCE($2, email), \
             display_name = COALESCE($3, display_name), updated_at = NOW() WHERE id = $1",
            &[&id, &email, &display_name],
        )
        .await?;
        Ok(())
    }

    async fn assign_roles(&self, user_id: Uuid, roles: &[String]) -> Result<(), DatabaseError> {
        let conn = self.conn().await?;
        for role in roles {
            conn.execute(
                "INSERT INTO user_roles (user_id, role_slug) \
                 SELECT $1, slug FROM roles WHERE slug = $2 \
                 ON CONFLICT DO NOTHING",
                &[&user_id, role],
            )
            .await?;
        }
        Ok(())
    }

    async fn mark_login(&self, user_id: Uuid) -> Result<(), DatabaseError> {
        let conn = self.conn().await?;
        conn.execute(
            "UPDATE users SET last_login_at = NOW(), updated_at = NOW() WHERE id = $1",
            &[&user_id],
        )
        .await?;
        Ok(())
    }

    async fn find_user_by_identity(
        &self,
        provider: &str,
        external_id: &str,
    ) -> Result<Option<User>, DatabaseError> {
        let conn = self.conn().await?;
        let row = conn
            .query_opt(
                "SELECT user_id FROM sso_identities WHERE provider = $1 AND external_id = $2",
                &[&provider, &external_id],
            )
            .await?;
        drop(conn);
        match row {
            Some(row) => self.get_user_by_id(row.get(0)).await,
            None => Ok(None),
        }
    }

    async fn link_identity(
        &self,
        user_id: Uuid,
        provider: &str,
        external_id: &str,
        attributes: &Value,
    ) -> Result<(), DatabaseError> {
        let conn = self.conn().await?;
        conn.execute(
            "INSERT INTO sso_identities (id, user_id, provider, external_id, attributes) \
             VALUES ($1, $2, $3, $4, $5) \
             ON CONFLICT (provider, external_id) DO UPDATE \
             SET user_id = EXCLUDED.user_id, attributes = EXCLUDED.attributes",
            &[&Uuid::new_v4(), &user_id, &provider, &external_id, attributes],
        )
        .await?;
        Ok(())
    }

    async fn count_users(&self) -> Result<i64, DatabaseError> {
        let conn = self.conn().await?;
        let row = conn.query_one("SELECT COUNT(*) FROM users", &[]).await?;
        Ok(row.get(0))
    }

    // ==================== Auth sessions ====================

    async fn get_session_by_hash(
        &self,
        token_hash: &str,
    ) -> Result<Option<AuthSessionRecord>, DatabaseError> {
        let conn = self.conn().await?;
        let row = conn
            .query_opt(
                "SELECT id, user_id, refresh_token_hash, client_info, expires_at, revoked_at, created_at \
                 FROM auth_sessions WHERE refresh_token_hash = $1",
                &[&token_hash],
            )
            .await?;
        Ok(row.map(|row| AuthSessionRecord {
            id: row.get(0),
            user_id: row.get(1),
            refresh_token_hash: row.get(2),
            client_info: row.get(3),
            expires_at: row.get(4),
            revoked_at: row.get(5),
            created_at: row.get(6),
        }))
    }

    async fn create_session(&self, session: AuthSessionRecord) -> Result<(), DatabaseError> {
        let conn = self.conn().await?;
        conn.execute(
            "INSERT INTO auth_sessions (id, user_id, refresh_token_hash, client_info, expires_at, revoked_at) \
             VALUES ($1, $2, $3, $4, $5, $6)",
            &[
                &session.id,
                &session.user_id,
                &session.refresh_token_hash,
                &session.client_info,
                &session.expires_at,
                &session.revoked_at,
            ],
        )
        .await?;
        Ok(())
    }

    async fn update_session(
        &self,
        id: Uuid,
        refresh_token_hash: &str,
        expires_at: DateTime<Utc>,
        client_info: Option<&str>,
    ) -> Result<(), DatabaseError> {
        let conn = self.conn().await?;
        conn.execute(
            "UPDATE auth_sessions SET refresh_token_hash = $2, expires_at = $3, \
             client_info = COALESCE($4, client_info), revoked_at = NULL WHERE id = $1",
            &[&id, &refresh_token_hash, &expires_at, &client_info],
        )
        .await?;
        Ok(())
    }

    async fn revoke_session(&self, id: Uuid) -> Result<(), DatabaseError> {
        let conn = self.conn().await?;
        conn.execute(
            "UPDATE auth_sessions SET revoked_at = NOW() WHERE id = $1 AND revoked_at IS NULL",
            &[&id],
        )
        .await?;
        Ok(())
    }

    async fn revoke_sessions_for_user(&self, user_id: Uuid) -> Result<u64, DatabaseError> {
        let conn = self.conn().await?;
        let updated = conn
            .execute(
                "UPDATE auth_sessions SET revoked_at = NOW() \
                 WHERE user_id = $1 AND revoked_at IS NULL",
                &[&user_id],
            )
            .await?;
        Ok(updated)
    }

    async fn delete_session(&self, id: Uuid) -> Result<(), DatabaseError> {
        let conn = self.conn().await?;
        conn.execute("DELETE FROM auth_sessions WHERE id = $1", &[&id])
            .await?;
        Ok(())
    }

    // ==================== Audit log ====================

    async fn insert_audit_log(&self, entry: NewAuditLog) -> Result<(), DatabaseError> {
        let conn = self.conn().await?;
        conn.execute(
            "INSERT INTO audit_logs (user_id, event, severity, payload, source_ip, user_agent, target_type, target_id) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
            &[
                &entry.user_id,
                &entry.event,
                &entry.severity,
                &entry.payload,
                &entry.source_ip,
                &entry.user_agent,
                &entry.target_type,
                &entry.target_id,
            ],
        )
        .await?;
        Ok(())
    }

    async fn list_audit_logs(
        &self,
        filters: &AuditFilters,
        limit: usize,
    ) -> Result<Vec<AuditLogRecord>, DatabaseError> {
        let conn = self.conn().await?;
        let limit = limit as i64;
        let created_before = filters.created_before.unwrap_or_else(Utc::now);
        let events = filters.events.clone();
        let severities = filters.severities.clone();
        let user_ids = filters.user_ids.clone();
        let target_types = filters.target_types.clone();
        let target_ids = filters.target_ids.clone();
        let rows = conn
            .query(
                "SELECT a.id, a.user_id, u.username, a.event, a.severity, a.payload, \
                        a.source_ip, a.user_agent, a.target_type, a.target_id, a.created_at \
                 FROM audit_logs a LEFT JOIN users u ON u.id = a.user_id \
                 WHERE a.created_at < $1 \
                   AND (cardinality($2::text[]) = 0 OR a.event = ANY($2)) \
                   AND (cardinality($3::text[]) = 0 OR a.severity = ANY($3)) \
                   AND (cardinality($4::uuid[]) = 0 OR a.user_id = ANY($4)) \
                   AND (cardinality($5::text[]) = 0 OR a.target_type = ANY($5)) \
                   AND (cardinality($6::text[]) = 0 OR a.target_id = ANY($6)) \
                 ORDER BY a.created_at DESC LIMIT $7",
                &[
                    &created_before,
                    &events,
                    &severities,
                    &user_ids,
                    &target_types,
                    &target_ids,
                    &limit,
                ],
            )
            .await?;
        Ok(rows
            .iter()
            .map(|row| AuditLogRecord {
                id: row.get(0),
                user_id: row.get(1),
                username: row.get(2),
                event: row.get(3),
                severity: row.get(4),
                payload: row.get(5),
                source_ip: row.get(6),
                user_agent: row.get(7),
                target_type: row.get(8),
                target_id: row.get(9),
                created_at: row.get(10),
            })
            .collect())
    }

    async fn purge_audit_logs_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, DatabaseError> {
        let conn = self.conn().await?;
        let deleted = conn
            .execute("DELETE FROM audit_logs WHERE created_at < $1", &[&cutoff])
            .await?;
        Ok(deleted)
    }

    // ==================== Toolkits ====================

    async fn upsert_toolkit(&self, record: &ToolkitRecord) -> Result<(), DatabaseError> {
        let conn = self.conn().await?;
        let tags = serde_json::to_value(&record.tags)
            .map_err(|e| DatabaseError::Decode(e.to_string()))?;
        let cards = serde_json::to_value(&record.dashboard_cards)
            .map_err(|e| DatabaseError::Decode(e.to_string()))?;
        conn.execute(
            "INSERT INTO toolkits (slug, name, description, base_path, enabled, category, tags, \
                 origin, version, backend_module, backend_router_attr, worker_module, \
                 worker_register_attr, dashboard_cards, dashboard_context_module, \
                 dashboard_context_attr, frontend_entry, frontend_source_entry, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19, $20) \
             ON CONFLICT (slug) DO UPDATE SET \
                 name = EXCLUDED.name, description = EXCLUDED.description, \
                 base_path = EXCLUDED.base_path, enabled = EXCLUDED.enabled, \
                 category = EXCLUDED.category, tags = EXCLUDED.tags, \
                 origin = EXCLUDED.origin, version = EXCLUDED.version, \
                 backend_module = EXCLUDED.backend_module, \
                 backend_router_attr = EXCLUDED.backend_router_attr, \
                 worker_module = EXCLUDED.worker_module, \
                 worker_register_attr = EXCLUDED.worker_register_attr, \
                 dashboard_cards = EXCLUDED.dashboard_cards, \
                 dashboard_context_module = EXCLUDED.dashboard_context_module, \
                 dashboard_context_attr = EXCLUDED.dashboard_context_attr, \
                 frontend_entry = EXCLUDED.frontend_entry, \
                 frontend_source_entry = EXCLUDED.frontend_source_entry, \
                 updated_at = EXCLUDED.updated_at",
            &[
                &record.slug,
                &record.name,
                &record.description,
                &record.base_path,
                &record.enabled,
                &record.category,
                &tags,
                &record.origin.as_str(),
                &record.version,
                &record.backend_module,
                &record.backend_router_attr,
                &record.worker_module,
                &record.worker_register_attr,
                &cards,
                &record.dashboard_context_module,
                &record.dashboard_context_attr,
                &record.frontend_entry,
                &record.frontend_source_entry,
                &record.created_at,
                &record.updated_at,
            ],
        )
        .await?;
        Ok(())
    }

    async fn get_toolkit(&self, slug: &str) -> Result<Option<ToolkitRecord>, DatabaseError> {
        let conn = self.conn().await?;
        let row = conn
            .query_opt(
                &format!("SELECT {TOOLKIT_COLUMNS} FROM toolkits WHERE slug = $1"),
                &[&slug],
            )
            .await?;
        row.as_ref().map(toolkit_from_row).transpose()
    }

    async fn list_toolkits(&self) -> Result<Vec<ToolkitRecord>, DatabaseError> {
        let conn = self.conn().await?;
        let rows = conn
            .query(&format!("SELECT {TOOLKIT_COLUMNS} FROM toolkits"), &[])
            .await?;
        rows.iter().map(toolkit_from_row).collect()
    }

    async fn delete_toolkit(&self, slug: &str) -> Result<bool, DatabaseError> {
        let conn = self.conn().await?;
        let deleted = conn
            .execute("DELETE FROM toolkits WHERE slug = $1", &[&slug])
            .await?;
        Ok(deleted > 0)
    }

    async fn record_toolkit_removal(&self, slug: &str) -> Result<(), DatabaseError> {
        let conn = self.conn().await?;
        conn.execute(
            "INSERT INTO toolkit_removals (slug) VALUES ($1) ON CONFLICT (slug) DO NOTHING",
            &[&slug],
        )
        .await?;
        Ok(())
    }

    async fn clear_toolkit_removal(&self, slug: &str) -> Result<(), DatabaseError> {
        let conn = self.conn().await?;
        conn.execute("DELETE FROM toolkit_removals WHERE slug = $1", &[&slug])
            .await?;
        Ok(())
    }

    async fn toolkit_removal_exists(&self, slug: &str) -> Result<bool, DatabaseError> {
        let conn = self.conn().await?;
        let row = conn
            .query_opt("SELECT 1 FROM toolkit_removals WHERE slug = $1", &[&slug])
            .await?;
        Ok(row.is_some())
    }

    // ==================== System settings ====================

    async fn get_setting(&self, key: &str) -> Result<Option<Value>, DatabaseError> {
        let conn = self.conn().await?;
        let row = conn
            .query_opt("SELECT value FROM system_settings WHERE key = $1", &[&key])
            .await?;
        Ok(row.map(|row| row.get(0)))
    }

    async fn set_setting(&self, key: &str, value: &Value) -> Result<(), DatabaseError> {
        let conn = self.conn().await?;
        conn.execute(
            "INSERT INTO system_settings (key, value, updated_at) VALUES ($1, $2, NOW()) \
             ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value, updated_at = NOW()",
            &[&key, value],
        )
        .await?;
        Ok(())
    }

    // ==================== Provider configs ====================

    async fn list_provider_configs(&self) -> Result<Vec<ProviderConfigRecord>, DatabaseError> {
        let conn = self.conn().await?;
        let rows = conn
            .query(
                "SELECT id, name, kind, enabled, config FROM auth_provider_configs ORDER BY name",
                &[],
            )
            .await?;
        Ok(rows
            .iter()
            .map(|row| ProviderConfigRecord {
                id: row.get(0),
                name: row.get(1),
                kind: row.get(2),
                enabled: row.get(3),
                config: row.get(4),
            })
            .collect())
    }
}
