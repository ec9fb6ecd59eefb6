//! Job endpoints: enqueue, list, fetch, cancel.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{Value, json};

use crate::auth::ROLE_TOOLKIT_USER;
use crate::error::ApiError;
use crate::jobs::JobFilters;

use super::AppState;
use super::auth_middleware::CurrentUser;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/jobs/", post(enqueue).get(list))
        .route("/jobs/{id}", get(get_one))
        .route("/jobs/{id}/cancel", post(cancel))
}

#[derive(Debug, Deserialize)]
struct EnqueueRequest {
    toolkit: String,
    operation: String,
    #[serde(default)]
    payload: Value,
}

async fn enqueue(
    State(state): State<AppState>,
    user: CurrentUser,
    Json(request): Json<EnqueueRequest>,
) -> Result<Json<Value>, ApiError> {
    user.require_role(ROLE_TOOLKIT_USER)?;
    if request.toolkit.trim().is_empty() || request.operation.trim().is_empty() {
        return Err(ApiError::bad_request("toolkit and operation are required"));
    }
    let job = state
        .dispatcher
        .enqueue(&request.toolkit, &request.operation, request.payload)
        .await
        .map_err(dispatch_error)?;
    Ok(Json(json!({ "job": job })))
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    #[serde(default)]
    toolkit: Option<String>,
    #[serde(default)]
    module: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    page: Option<usize>,
    #[serde(default)]
    page_size: Option<usize>,
}

async fn list(
    State(state): State<AppState>,
    user: CurrentUser,
    Query(query): Query<ListQuery>,
) -> Result<Json<Value>, ApiError> {
    user.require_role(ROLE_TOOLKIT_USER)?;

    let split = |raw: Option<String>| -> Vec<String> {
        raw.map(|raw| {
            raw.split(',')
                .map(|part| part.trim().to_string())
                .filter(|part| !part.is_empty())
                .collect()
        })
        .unwrap_or_default()
    };
    let filters = JobFilters {
        toolkits: split(query.toolkit),
        modules: split(query.module),
        statuses: split(query.status),
    };

    let page = query.page.unwrap_or(1).max(1);
    let page_size = query.page_size.unwrap_or(20).clamp(1, 200);
    let offset = (page - 1) * page_size;

    let (jobs, total) = state
        .dispatcher
        .store()
        .list(&filters, Some(page_size), offset)
        .await?;
    Ok(Json(json!({
        "jobs": jobs,
        "total": total,
        "page": page,
        "page_size": page_size,
    })))
}

async fn get_one(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    user.require_role(ROLE_TOOLKIT_USER)?;
    match state.dispatcher.get_status(&id).await.map_err(dispatch_error)? {
        Some(job) => Ok(Json(json!({ "job": job }))),
        None => Err(ApiError::not_found("Job not found")),
    }
}

async fn cancel(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    user.require_role(ROLE_TOOLKIT_USER)?;
    match state.dispatcher.cancel(&id).await.map_err(dispatch_error)? {
        Some(job) => Ok((StatusCode::ACCEPTED, Json(json!({ "job": job })))),
        None => Err(ApiError::not_found("Job not found")),
    }
}

fn dispatch_error(err: crate::jobs::dispatcher::DispatchError) -> ApiError {
    match err {
        crate::jobs::dispatcher::DispatchError::Store(inner) => inner.into(),
        crate::jobs::dispatcher::DispatchError::Broker(inner) => inner.into(),
    }
}
