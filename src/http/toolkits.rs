//! Toolkit endpoints: registry CRUD, bundle upload, community catalog.

use axum::extract::{Multipart, Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::TryStreamExt;
use serde::Deserialize;
use serde_json::{Value, json};

use crate::auth::audit::AuditContext;
use crate::auth::{ROLE_SYSTEM_ADMIN, ROLE_TOOLKIT_CURATOR, ROLE_TOOLKIT_USER};
use crate::error::{ApiError, BundleError};
use crate::toolkits::{ToolkitCreate, ToolkitOrigin, ToolkitUpdate, normalize_slug};

use super::AppState;
use super::auth_middleware::{CurrentUser, client_context};

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/toolkits/", get(list).post(create))
        .route("/toolkits/install", post(install_upload))
        .route("/toolkits/community", get(browse_catalog))
        .route("/toolkits/community/install", post(install_from_catalog))
        .route("/toolkits/community/updates", get(check_updates))
        .route(
            "/toolkits/{slug}",
            get(get_one).put(update).delete(delete_one),
        )
        .route("/toolkits/{slug}/jobs", post(enqueue_form))
}

async fn list(State(state): State<AppState>, user: CurrentUser) -> Result<Json<Value>, ApiError> {
    user.require_role(ROLE_TOOLKIT_USER)?;
    let toolkits = state.registry.list().await?;
    Ok(Json(json!(toolkits)))
}

async fn create(
    State(state): State<AppState>,
    user: CurrentUser,
    Json(payload): Json<ToolkitCreate>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    user.require_role(ROLE_SYSTEM_ADMIN)?;
    let record = state
        .registry
        .create(payload, ToolkitOrigin::Custom)
        .await?;
    if record.enabled {
        state.loader.activate(&record.slug).await?;
    }
    Ok((StatusCode::CREATED, Json(json!(record))))
}

async fn get_one(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(slug): Path<String>,
) -> Result<Json<Value>, ApiError> {
    user.require_role(ROLE_TOOLKIT_USER)?;
    match state.registry.get(&slug).await? {
        Some(record) => Ok(Json(json!(record))),
        None => Err(ApiError::not_found("Toolkit not found")),
    }
}

async fn update(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(slug): Path<String>,
    Json(payload): Json<ToolkitUpdate>,
) -> Result<Json<Value>, ApiError> {
    user.require_role(ROLE_TOOLKIT_CURATOR)?;
    let previous = state.registry.get(&slug).await?;
    let record = state
        .registry
        .update(&slug, payload)
        .await?
        .ok_or_else(|| ApiError::not_found("Toolkit not found"))?;
    // Enabling triggers activation exactly once.
    let was_enabled = previous.map(|record| record.enabled).unwrap_or(false);
    if record.enabled && !was_enabled {
        state.loader.activate(&slug).await?;
    }
    Ok(Json(json!(record)))
}

async fn delete_one(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(slug): Path<String>,
    headers: axum::http::HeaderMap,
) -> Result<StatusCode, ApiError> {
    user.require_role(ROLE_SYSTEM_ADMIN)?;
    let record = state.registry.delete(&slug).await?;
    state.loader.mark_removed(&slug);

    // Remove the on-disk bundle and archive.
    let storage = state.installer.storage_dir();
    let _ = tokio::fs::remove_dir_all(storage.join(&slug)).await;
    let _ = tokio::fs::remove_file(storage.join(format!("{slug}.zip"))).await;

    let (source_ip, user_agent) = client_context(&headers);
    let _ = state
        .auth
        .audit()
        .log(
            "toolkit.remove",
            Some(json!({ "slug": slug, "origin": record.origin })),
            AuditContext {
                user_id: Some(user.id),
                source_ip,
                user_agent,
                target_type: Some("toolkit".to_string()),
                target_id: Some(slug.clone()),
            },
        )
        .await;
    Ok(StatusCode::NO_CONTENT)
}

async fn install_upload(
    State(state): State<AppState>,
    user: CurrentUser,
    headers: axum::http::HeaderMap,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    user.require_role(ROLE_SYSTEM_ADMIN)?;

    let mut slug_override: Option<String> = None;
    let mut bundle_path = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| ApiError::bad_request(err.to_string()))?
    {
        let name = field.name().map(str::to_string);
        match name.as_deref() {
            Some("slug") => {
                let raw = field
                    .text()
                    .await
                    .map_err(|err| ApiError::bad_request(err.to_string()))?;
                if !raw.trim().is_empty() {
                    slug_override =
                        Some(normalize_slug(&raw).map_err(ApiError::bad_request)?);
                }
            }
            Some("file") => {
                let file_name = field
                    .file_name()
                    .map(str::to_string)
                    .unwrap_or_else(|| "upload.zip".to_string());
                if !file_name.ends_with(".zip") {
                    return Err(ApiError::bad_request("Only .zip bundles are supported"));
                }
                let stream =
                    Box::pin(field.map_err(|err| BundleError::Io(std::io::Error::other(err))));
                let path = state
                    .installer
                    .write_upload_to_disk(&file_name, stream)
                    .await?;
                bundle_path = Some(path);
            }
            _ => {}
        }
    }

    let bundle_path =
        bundle_path.ok_or_else(|| ApiError::bad_request("Missing bundle file"))?;
    let outcome = state
        .installer
        .install_uploaded_bundle(
            &bundle_path,
            slug_override.as_deref(),
            ToolkitOrigin::Uploaded,
            false,
        )
        .await?;

    let (source_ip, user_agent) = client_context(&headers);
    let _ = state
        .auth
        .audit()
        .log(
            "toolkit.install",
            Some(json!({
                "slug": outcome.record.slug,
                "origin": "uploaded",
                "version": outcome.record.version,
            })),
            AuditContext {
                user_id: Some(user.id),
                source_ip,
                user_agent,
                target_type: Some("toolkit".to_string()),
                target_id: Some(outcome.record.slug.clone()),
            },
        )
        .await;

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({
            "uploaded": true,
            "toolkit": outcome.record,
            "bundle_path": outcome.bundle_path,
        })),
    ))
}

async fn browse_catalog(
    State(state): State<AppState>,
    user: CurrentUser,
) -> Result<Json<Value>, ApiError> {
    user.require_role(ROLE_TOOLKIT_CURATOR)?;
    let (catalog_url, toolkits) = state.catalog.fetch().await?;
    Ok(Json(json!({
        "catalog_url": catalog_url.to_string(),
        "toolkits": toolkits,
    })))
}

#[derive(Debug, Deserialize)]
struct CommunityInstallRequest {
    slug: String,
}

async fn install_from_catalog(
    State(state): State<AppState>,
    user: CurrentUser,
    headers: axum::http::HeaderMap,
    Json(payload): Json<CommunityInstallRequest>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    user.require_role(ROLE_SYSTEM_ADMIN)?;
    let slug = normalize_slug(&payload.slug).map_err(ApiError::bad_request)?;
    let (source_ip, user_agent) = client_context(&headers);
    let record = state
        .catalog
        .install(
            &slug,
            AuditContext {
                user_id: Some(user.id),
                source_ip,
                user_agent,
                ..Default::default()
            },
        )
        .await?;
    Ok((StatusCode::ACCEPTED, Json(json!(record))))
}

async fn check_updates(
    State(state): State<AppState>,
    user: CurrentUser,
) -> Result<Json<Value>, ApiError> {
    user.require_role(ROLE_TOOLKIT_CURATOR)?;
    let installed = state.registry.list().await?;
    let updates = state.catalog.check_updates(&installed).await?;
    Ok(Json(json!({ "updates": updates })))
}

#[derive(Debug, Deserialize)]
struct EnqueueForm {
    operation: String,
    #[serde(default)]
    payload: Option<String>,
}

async fn enqueue_form(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(slug): Path<String>,
    axum::extract::Form(form): axum::extract::Form<EnqueueForm>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    user.require_role(ROLE_TOOLKIT_USER)?;
    let payload: Value = match form.payload.as_deref().filter(|raw| !raw.trim().is_empty()) {
        Some(raw) => serde_json::from_str(raw)
            .map_err(|err| ApiError::bad_request(format!("Invalid JSON payload: {err}")))?,
        None => json!({}),
    };
    let job = state
        .dispatcher
        .enqueue(&slug, &form.operation, payload)
        .await
        .map_err(|err| match err {
            crate::jobs::dispatcher::DispatchError::Store(inner) => inner.into(),
            crate::jobs::dispatcher::DispatchError::Broker(inner) => ApiError::from(inner),
        })?;
    Ok((StatusCode::ACCEPTED, Json(json!({ "job": job }))))
}
