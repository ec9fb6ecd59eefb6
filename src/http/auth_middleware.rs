//! Request authentication and role guards.
//!
//! [`CurrentUser`] is an extractor: it validates the bearer token and
//! exposes the claims; handlers then assert roles with
//! [`CurrentUser::require_role`]. Holding `system.admin` satisfies any
//! role check.

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use uuid::Uuid;

use crate::auth::ROLE_SYSTEM_ADMIN;
use crate::error::ApiError;

use super::AppState;

/// Authenticated principal for the current request.
#[derive(Debug, Clone)]
pub struct CurrentUser {
    pub id: Uuid,
    pub display_name: Option<String>,
    pub roles: Vec<String>,
    pub session_id: String,
    pub provider: String,
}

impl CurrentUser {
    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|held| held == role || held == ROLE_SYSTEM_ADMIN)
    }

    pub fn require_role(&self, role: &str) -> Result<(), ApiError> {
        if self.has_role(role) {
            return Ok(());
        }
        Err(ApiError::forbidden("Insufficient permissions"))
    }

    pub fn is_admin(&self) -> bool {
        self.has_role(ROLE_SYSTEM_ADMIN)
    }
}

impl FromRequestParts<AppState> for CurrentUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let token = parts
            .headers
            .get("authorization")
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))
            .ok_or_else(|| ApiError::unauthorized("Missing bearer token"))?;

        let claims = state.auth.tokens().decode_access(token)?;
        let id: Uuid = claims
            .sub
            .parse()
            .map_err(|_| ApiError::unauthorized("Token validation failed"))?;

        Ok(CurrentUser {
            id,
            display_name: claims.name,
            roles: claims.roles,
            session_id: claims.sid,
            provider: claims.provider,
        })
    }
}

/// Best-effort client context for audit rows.
pub fn client_context(parts_headers: &axum::http::HeaderMap) -> (Option<String>, Option<String>) {
    let source_ip = parts_headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(|value| value.trim().to_string());
    let user_agent = parts_headers
        .get("user-agent")
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);
    (source_ip, user_agent)
}

/// Base URL of the current request, honoring forwarding headers.
pub fn request_base_url(headers: &axum::http::HeaderMap) -> String {
    let proto = headers
        .get("x-forwarded-proto")
        .and_then(|value| value.to_str().ok())
        .unwrap_or("http");
    let host = headers
        .get("host")
        .and_then(|value| value.to_str().ok())
        .unwrap_or("localhost");
    format!("{proto}://{host}")
}
