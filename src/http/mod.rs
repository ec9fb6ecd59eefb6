//! HTTP surface: router assembly and shared application state.

pub mod admin;
pub mod auth_middleware;
pub mod auth_routes;
pub mod dashboard;
pub mod jobs;
pub mod toolkits;

use std::sync::Arc;

use axum::http::HeaderValue;
use axum::routing::get;
use axum::{Json, Router};
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::auth::AuthService;
use crate::auth::providers::ProviderRegistry;
use crate::catalog::CatalogService;
use crate::config::Config;
use crate::db::Database;
use crate::health::HealthAggregator;
use crate::jobs::Dispatcher;
use crate::kv::Kv;
use crate::toolkits::bundle::BundleInstaller;
use crate::toolkits::{ToolkitLoader, ToolkitRegistry};

/// Shared state injected into every route handler.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub db: Arc<dyn Database>,
    pub kv: Arc<dyn Kv>,
    pub dispatcher: Dispatcher,
    pub registry: ToolkitRegistry,
    pub loader: Arc<ToolkitLoader>,
    pub installer: Arc<BundleInstaller>,
    pub catalog: Arc<CatalogService>,
    pub auth: AuthService,
    pub providers: Arc<ProviderRegistry>,
    pub health: Arc<HealthAggregator>,
}

/// Assemble the full application router.
pub fn router(state: AppState) -> Router {
    let cors = if state.config.cors_origins.is_empty() {
        CorsLayer::permissive()
    } else {
        let origins: Vec<HeaderValue> = state
            .config
            .cors_origins
            .iter()
            .filter_map(|origin| origin.parse().ok())
            .collect();
        CorsLayer::new()
            .allow_origin(AllowOrigin::list(origins))
            .allow_methods(tower_http::cors::Any)
            .allow_headers(tower_http::cors::Any)
    };

    // Bundle uploads stream through multipart; size enforcement happens
    // chunk by chunk in the installer, so the framework limit only needs
    // to sit above the configured cap.
    let body_limit = axum::extract::DefaultBodyLimit::max(
        (state.config.toolkits.upload_max_bytes as usize).saturating_add(1024 * 1024),
    );

    Router::new()
        .route("/health", get(health))
        .route("/health/components", get(component_health))
        .merge(dashboard::routes())
        .merge(jobs::routes())
        .merge(toolkits::routes())
        .merge(auth_routes::routes())
        .merge(admin::routes())
        .layer(body_limit)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

#[derive(serde::Serialize)]
struct LivenessResponse {
    status: &'static str,
    env: String,
}

async fn health(
    axum::extract::State(state): axum::extract::State<AppState>,
) -> Json<LivenessResponse> {
    Json(LivenessResponse {
        status: "ok",
        env: state.config.app_env.clone(),
    })
}

#[derive(serde::Deserialize)]
struct ComponentHealthQuery {
    #[serde(default)]
    force_refresh: bool,
}

async fn component_health(
    axum::extract::State(state): axum::extract::State<AppState>,
    user: auth_middleware::CurrentUser,
    axum::extract::Query(query): axum::extract::Query<ComponentHealthQuery>,
) -> Result<Json<crate::health::HealthSummary>, crate::error::ApiError> {
    user.require_role(crate::auth::ROLE_TOOLKIT_USER)?;
    Ok(Json(state.health.summary(query.force_refresh).await))
}
