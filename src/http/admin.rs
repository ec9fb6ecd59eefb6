//! Security administration: audit retention settings and log browsing.

use axum::extract::{Query, State};
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{Value, json};
use uuid::Uuid;

use crate::auth::ROLE_SYSTEM_ADMIN;
use crate::auth::audit::{AUDIT_EVENTS, AuditContext, audit_event};
use crate::db::AuditFilters;
use crate::error::ApiError;

use super::AppState;
use super::auth_middleware::{CurrentUser, client_context};

pub fn routes() -> Router<AppState> {
    Router::new()
        .route(
            "/admin/security/settings",
            get(get_settings).put(put_settings),
        )
        .route("/admin/security/audit-logs", get(list_audit_logs))
}

async fn get_settings(
    State(state): State<AppState>,
    user: CurrentUser,
) -> Result<Json<Value>, ApiError> {
    user.require_role(ROLE_SYSTEM_ADMIN)?;
    let retention_days = state.auth.audit().retention_days().await?;
    Ok(Json(json!({ "audit_retention_days": retention_days })))
}

#[derive(Debug, Deserialize)]
struct SettingsUpdate {
    audit_retention_days: i64,
}

async fn put_settings(
    State(state): State<AppState>,
    user: CurrentUser,
    headers: axum::http::HeaderMap,
    Json(update): Json<SettingsUpdate>,
) -> Result<Json<Value>, ApiError> {
    user.require_role(ROLE_SYSTEM_ADMIN)?;
    if update.audit_retention_days <= 0 {
        return Err(ApiError::bad_request(
            "Retention days must be greater than zero",
        ));
    }
    state
        .auth
        .audit()
        .set_retention_days(update.audit_retention_days)
        .await?;

    let (source_ip, user_agent) = client_context(&headers);
    let _ = state
        .auth
        .audit()
        .log(
            "security.settings.update",
            Some(json!({ "audit_retention_days": update.audit_retention_days })),
            AuditContext {
                user_id: Some(user.id),
                source_ip,
                user_agent,
                ..Default::default()
            },
        )
        .await;
    Ok(Json(json!({
        "audit_retention_days": update.audit_retention_days
    })))
}

#[derive(Debug, Deserialize)]
struct AuditQuery {
    #[serde(default)]
    limit: Option<usize>,
    #[serde(default)]
    before: Option<DateTime<Utc>>,
    #[serde(default)]
    event: Option<String>,
    #[serde(default)]
    severity: Option<String>,
    #[serde(default)]
    user_id: Option<Uuid>,
    #[serde(default)]
    target_type: Option<String>,
    #[serde(default)]
    target_id: Option<String>,
}

async fn list_audit_logs(
    State(state): State<AppState>,
    user: CurrentUser,
    Query(query): Query<AuditQuery>,
) -> Result<Json<Value>, ApiError> {
    user.require_role(ROLE_SYSTEM_ADMIN)?;

    let limit = query.limit.unwrap_or(100).clamp(1, 500);
    let filters = AuditFilters {
        events: query.event.into_iter().collect(),
        severities: query.severity.into_iter().collect(),
        user_ids: query.user_id.into_iter().collect(),
        target_types: query.target_type.into_iter().collect(),
        target_ids: query.target_id.into_iter().collect(),
        created_before: query.before,
    };

    let records = state.auth.audit().list(&filters, limit).await?;
    let next_cursor = (records.len() == limit)
        .then(|| records.last().map(|record| record.created_at))
        .flatten();

    let items: Vec<Value> = records
        .into_iter()
        .map(|record| {
            let definition = audit_event(&record.event);
            json!({
                "id": record.id,
                "event": record.event,
                "severity": record.severity,
                "category": definition.map(|d| d.category),
                "description": definition.map(|d| d.description),
                "created_at": record.created_at,
                "source_ip": record.source_ip,
                "user_agent": record.user_agent,
                "target_type": record.target_type,
                "target_id": record.target_id,
                "actor": record.user_id.map(|id| json!({
                    "id": id,
                    "username": record.username,
                })),
                "payload": record.payload,
            })
        })
        .collect();

    let events: Vec<Value> = AUDIT_EVENTS
        .iter()
        .map(|definition| {
            json!({
                "name": definition.name,
                "category": definition.category,
                "description": definition.description,
                "severity": definition.severity,
            })
        })
        .collect();

    Ok(Json(json!({
        "items": items,
        "next_cursor": next_cursor,
        "events": events,
    })))
}
