//! Operator dashboard aggregate: toolkit cards, plugin context, and
//! recent jobs.

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{Value, json};

use crate::auth::ROLE_TOOLKIT_USER;
use crate::error::ApiError;
use crate::jobs::JobFilters;

use super::AppState;
use super::auth_middleware::CurrentUser;

const RECENT_JOBS: usize = 10;

pub fn routes() -> Router<AppState> {
    Router::new().route("/dashboard/", get(dashboard))
}

async fn dashboard(
    State(state): State<AppState>,
    user: CurrentUser,
) -> Result<Json<Value>, ApiError> {
    user.require_role(ROLE_TOOLKIT_USER)?;

    let toolkits = state.registry.list().await?;
    let cards: Vec<Value> = toolkits
        .iter()
        .filter(|record| record.enabled)
        .flat_map(|record| {
            record.dashboard_cards.iter().map(|card| {
                json!({
                    "toolkit": record.slug,
                    "title": card.title,
                    "body": card.body,
                    "link_text": card.link_text,
                    "link_href": card.link_href,
                    "icon": card.icon,
                })
            })
        })
        .collect();

    let (recent_jobs, _total) = state
        .dispatcher
        .store()
        .list(&JobFilters::default(), Some(RECENT_JOBS), 0)
        .await?;

    Ok(Json(json!({
        "cards": cards,
        "contexts": state.loader.dashboard_contexts(),
        "recent_jobs": recent_jobs,
    })))
}
