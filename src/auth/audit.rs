//! Append-only security audit log.
//!
//! Severity defaults come from a static event catalog; retention is a
//! system setting enforced as an amortized sweep on every write.

use std::sync::Arc;

use chrono::{Duration, Utc};
use serde_json::Value;
use uuid::Uuid;

use crate::db::{AuditFilters, AuditLogRecord, Database, NewAuditLog};
use crate::error::DatabaseError;

/// System-settings key holding the retention window in days.
pub const RETENTION_SETTING_KEY: &str = "security.audit.retention_days";

#[derive(Debug, Clone, Copy)]
pub struct AuditEventDefinition {
    pub name: &'static str,
    pub category: &'static str,
    pub description: &'static str,
    pub severity: &'static str,
}

/// Known events and their default severities.
pub const AUDIT_EVENTS: &[AuditEventDefinition] = &[
    AuditEventDefinition {
        name: "auth.login.success",
        category: "authentication",
        description: "User authenticated successfully.",
        severity: "info",
    },
    AuditEventDefinition {
        name: "auth.login.failure",
        category: "authentication",
        description: "Failed authentication attempt was rejected.",
        severity: "warning",
    },
    AuditEventDefinition {
        name: "auth.login.lockout",
        category: "authentication",
        description: "Account locked after repeated failed attempts.",
        severity: "warning",
    },
    AuditEventDefinition {
        name: "auth.logout",
        category: "authentication",
        description: "User explicitly signed out of the system.",
        severity: "info",
    },
    AuditEventDefinition {
        name: "auth.token.refresh",
        category: "authentication",
        description: "Access token refreshed for an active session.",
        severity: "info",
    },
    AuditEventDefinition {
        name: "user.bootstrap",
        category: "user_management",
        description: "System bootstrap created the first privileged administrator.",
        severity: "critical",
    },
    AuditEventDefinition {
        name: "user.provision",
        category: "user_management",
        description: "User account provisioned automatically from an identity provider.",
        severity: "info",
    },
    AuditEventDefinition {
        name: "toolkit.install",
        category: "toolkit_lifecycle",
        description: "Toolkit bundle installed or updated.",
        severity: "info",
    },
    AuditEventDefinition {
        name: "toolkit.remove",
        category: "toolkit_lifecycle",
        description: "Toolkit uninstalled.",
        severity: "warning",
    },
    AuditEventDefinition {
        name: "security.settings.update",
        category: "security_administration",
        description: "Security settings were changed.",
        severity: "warning",
    },
];

pub fn audit_event(name: &str) -> Option<&'static AuditEventDefinition> {
    AUDIT_EVENTS.iter().find(|definition| definition.name == name)
}

/// Context attached to a logged event.
#[derive(Debug, Clone, Default)]
pub struct AuditContext {
    pub user_id: Option<Uuid>,
    pub source_ip: Option<String>,
    pub user_agent: Option<String>,
    pub target_type: Option<String>,
    pub target_id: Option<String>,
}

#[derive(Clone)]
pub struct AuditService {
    db: Arc<dyn Database>,
    default_retention_days: i64,
}

impl AuditService {
    pub fn new(db: Arc<dyn Database>, default_retention_days: i64) -> Self {
        Self {
            db,
            default_retention_days,
        }
    }

    /// Append an event; severity falls back to the catalog default,
    /// then `info`. Every write also sweeps expired rows.
    pub async fn log(
        &self,
        event: &str,
        payload: Option<Value>,
        context: AuditContext,
    ) -> Result<(), DatabaseError> {
        let severity = audit_event(event)
            .map(|definition| definition.severity)
            .unwrap_or("info");
        self.db
            .insert_audit_log(NewAuditLog {
                user_id: context.user_id,
                event: event.to_string(),
                severity: severity.to_string(),
                payload,
                source_ip: context.source_ip,
                user_agent: context.user_agent,
                target_type: context.target_type,
                target_id: context.target_id,
            })
            .await?;
        let _ = self.purge_expired().await?;
        Ok(())
    }

    pub async fn retention_days(&self) -> Result<i64, DatabaseError> {
        let stored = self.db.get_setting(RETENTION_SETTING_KEY).await?;
        Ok(stored
            .and_then(|value| value.as_i64())
            .filter(|days| *days > 0)
            .unwrap_or(self.default_retention_days))
    }

    pub async fn set_retention_days(&self, days: i64) -> Result<(), DatabaseError> {
        self.db
            .set_setting(RETENTION_SETTING_KEY, &Value::from(days))
            .await
    }

    pub async fn purge_expired(&self) -> Result<u64, DatabaseError> {
        let days = self.retention_days().await?;
        if days <= 0 {
            return Ok(0);
        }
        let cutoff = Utc::now() - Duration::days(days);
        self.db.purge_audit_logs_before(cutoff).await
    }

    pub async fn list(
        &self,
        filters: &AuditFilters,
        limit: usize,
    ) -> Result<Vec<AuditLogRecord>, DatabaseError> {
        self.db.list_audit_logs(filters, limit).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryDb;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn severity_defaults_from_catalog() {
        let db = Arc::new(MemoryDb::new());
        let audit = AuditService::new(db.clone(), 90);

        audit
            .log("auth.login.failure", None, AuditContext::default())
            .await
            .unwrap();
        audit
            .log("something.unknown", None, AuditContext::default())
            .await
            .unwrap();

        let records = audit.list(&AuditFilters::default(), 10).await.unwrap();
        assert_eq!(records.len(), 2);
        let failure = records
            .iter()
            .find(|record| record.event == "auth.login.failure")
            .unwrap();
        assert_eq!(failure.severity, "warning");
        let unknown = records
            .iter()
            .find(|record| record.event == "something.unknown")
            .unwrap();
        assert_eq!(unknown.severity, "info");
    }

    #[tokio::test]
    async fn retention_setting_overrides_default() {
        let db = Arc::new(MemoryDb::new());
        let audit = AuditService::new(db.clone(), 90);
        assert_eq!(audit.retention_days().await.unwrap(), 90);

        audit.set_retention_days(7).await.unwrap();
        assert_eq!(audit.retention_days().await.unwrap(), 7);
    }

    #[tokio::test]
    async fn filters_narrow_listing() {
        let db = Arc::new(MemoryDb::new());
        let audit = AuditService::new(db, 90);
        audit
            .log("auth.login.success", None, AuditContext::default())
            .await
            .unwrap();
        audit
            .log("auth.login.failure", None, AuditContext::default())
            .await
            .unwrap();

        let filters = AuditFilters {
            events: vec!["auth.login.failure".to_string()],
            ..Default::default()
        };
        let records = audit.list(&filters, 10).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].event, "auth.login.failure");
    }
}
