//! Authentication endpoints: provider listing, credential login, OIDC
//! callback, token refresh, logout, and the current-user probe.
//!
//! The refresh token travels in an HttpOnly cookie scoped to
//! `/auth/refresh`; the access token is returned in the JSON payload.

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Redirect, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{Value, json};

use crate::auth::audit::AuditContext;
use crate::auth::providers::{BeginFlow, BeginRequest, CompleteRequest, Credentials};
use crate::auth::tokens::TokenBundle;
use crate::db::User;
use crate::error::ApiError;

use super::AppState;
use super::auth_middleware::{CurrentUser, client_context, request_base_url};

const REFRESH_COOKIE: &str = "refresh_token";

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/auth/providers", get(list_providers))
        .route("/auth/providers/{name}/begin", post(begin_flow))
        .route("/auth/providers/{name}/callback", get(provider_callback))
        .route("/auth/login/{provider}", post(credential_login))
        .route("/auth/refresh", post(refresh))
        .route("/auth/logout", post(logout))
        .route("/auth/me", get(me))
}

fn refresh_cookie(state: &AppState, value: &str, max_age: i64) -> String {
    let auth = &state.config.auth;
    let mut cookie = format!(
        "{REFRESH_COOKIE}={value}; Max-Age={max_age}; Path=/auth/refresh; HttpOnly; SameSite={}",
        capitalize(&auth.cookie_samesite)
    );
    if auth.cookie_secure {
        cookie.push_str("; Secure");
    }
    if let Some(domain) = &auth.cookie_domain {
        cookie.push_str("; Domain=");
        cookie.push_str(domain);
    }
    cookie
}

fn capitalize(raw: &str) -> String {
    let mut chars = raw.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => "Lax".to_string(),
    }
}

fn read_refresh_cookie(headers: &HeaderMap) -> Option<String> {
    let raw = headers.get(header::COOKIE)?.to_str().ok()?;
    for pair in raw.split(';') {
        let pair = pair.trim();
        if let Some(value) = pair.strip_prefix(&format!("{REFRESH_COOKIE}=")) {
            if !value.is_empty() {
                return Some(value.to_string());
            }
        }
    }
    None
}

fn login_payload(user: &User, bundle: &TokenBundle) -> Value {
    json!({
        "access_token": bundle.access_token,
        "token_type": bundle.token_type,
        "expires_at": bundle.access_expires_at,
        "user": {
            "id": user.id,
            "username": user.username,
            "display_name": user.display_name,
            "email": user.email,
            "roles": user.roles,
            "is_superuser": user.is_superuser,
        },
    })
}

async fn list_providers(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "providers": state.providers.metadata() }))
}

#[derive(Debug, Deserialize)]
struct BeginQuery {
    #[serde(default)]
    next: Option<String>,
    #[serde(default)]
    mode: Option<String>,
}

async fn begin_flow(
    State(state): State<AppState>,
    Path(name): Path<String>,
    headers: HeaderMap,
    Query(query): Query<BeginQuery>,
) -> Result<Json<Value>, ApiError> {
    let provider = state
        .providers
        .get(&name)
        .ok_or_else(|| ApiError::not_found("Provider not found"))?;
    let flow = provider
        .begin(&BeginRequest {
            base_url: request_base_url(&headers),
            next: query.next,
            mode: query.mode,
        })
        .await?;
    Ok(Json(match flow {
        BeginFlow::Form => json!({ "type": "form" }),
        BeginFlow::Redirect { url } => json!({ "type": "redirect", "url": url }),
    }))
}

#[derive(Debug, Deserialize)]
struct LoginRequest {
    username: String,
    password: String,
}

async fn credential_login(
    State(state): State<AppState>,
    Path(provider_name): Path<String>,
    headers: HeaderMap,
    Json(request): Json<LoginRequest>,
) -> Result<Response, ApiError> {
    let provider = state
        .providers
        .get(&provider_name)
        .ok_or_else(|| ApiError::not_found("Provider not found"))?;
    if provider.kind() == "oidc" {
        return Err(ApiError::bad_request(
            "Provider requires the redirect flow",
        ));
    }

    let (source_ip, user_agent) = client_context(&headers);
    let result = provider
        .complete(&CompleteRequest {
            credentials: Some(Credentials {
                username: request.username,
                password: request.password,
            }),
            base_url: request_base_url(&headers),
            source_ip: source_ip.clone(),
            user_agent: user_agent.clone(),
            ..Default::default()
        })
        .await?;

    let user = state
        .auth
        .resolve_user(
            provider.as_ref(),
            &result,
            source_ip.as_deref(),
            user_agent.as_deref(),
        )
        .await?;
    let bundle = state
        .auth
        .issue_tokens(&user, provider.name(), user_agent.as_deref())
        .await?;

    let cookie = refresh_cookie(
        &state,
        &bundle.refresh_token,
        state.config.auth.refresh_token_ttl_seconds,
    );
    let mut response = Json(login_payload(&user, &bundle)).into_response();
    response
        .headers_mut()
        .insert(header::SET_COOKIE, cookie.parse().expect("valid cookie"));
    Ok(response)
}

async fn provider_callback(
    State(state): State<AppState>,
    Path(name): Path<String>,
    headers: HeaderMap,
    Query(params): Query<std::collections::HashMap<String, String>>,
) -> Result<Response, ApiError> {
    let provider = state
        .providers
        .get(&name)
        .ok_or_else(|| ApiError::not_found("Provider not found"))?;

    let (source_ip, user_agent) = client_context(&headers);
    let result = provider
        .complete(&CompleteRequest {
            credentials: None,
            callback_params: params,
            base_url: request_base_url(&headers),
            source_ip: source_ip.clone(),
            user_agent: user_agent.clone(),
        })
        .await?;

    let user = state
        .auth
        .resolve_user(
            provider.as_ref(),
            &result,
            source_ip.as_deref(),
            user_agent.as_deref(),
        )
        .await?;
    let bundle = state
        .auth
        .issue_tokens(&user, provider.name(), user_agent.as_deref())
        .await?;

    let target = state
        .config
        .frontend_base_url
        .as_ref()
        .map(|url| url.to_string())
        .unwrap_or_else(|| "/".to_string());
    let redirect = format!(
        "{target}#access_token={}&token_type=bearer",
        urlencoding::encode(&bundle.access_token)
    );

    let cookie = refresh_cookie(
        &state,
        &bundle.refresh_token,
        state.config.auth.refresh_token_ttl_seconds,
    );
    let mut response = Redirect::to(&redirect).into_response();
    response
        .headers_mut()
        .insert(header::SET_COOKIE, cookie.parse().expect("valid cookie"));
    Ok(response)
}

async fn refresh(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let token = read_refresh_cookie(&headers)
        .ok_or_else(|| ApiError::unauthorized("Missing refresh token"))?;
    let (source_ip, user_agent) = client_context(&headers);

    let (bundle, user) = state
        .auth
        .refresh_tokens(&token, source_ip.as_deref(), user_agent.as_deref())
        .await?;

    let cookie = refresh_cookie(
        &state,
        &bundle.refresh_token,
        state.config.auth.refresh_token_ttl_seconds,
    );
    let mut response = Json(login_payload(&user, &bundle)).into_response();
    response
        .headers_mut()
        .insert(header::SET_COOKIE, cookie.parse().expect("valid cookie"));
    Ok(response)
}

async fn logout(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    if let Some(token) = read_refresh_cookie(&headers) {
        state.auth.revoke_refresh_token(&token).await?;
    }
    let (source_ip, user_agent) = client_context(&headers);
    let _ = state
        .auth
        .audit()
        .log(
            "auth.logout",
            None,
            AuditContext {
                source_ip,
                user_agent,
                ..Default::default()
            },
        )
        .await;

    // Expire the cookie.
    let cookie = refresh_cookie(&state, "", 0);
    let mut response = StatusCode::NO_CONTENT.into_response();
    response
        .headers_mut()
        .insert(header::SET_COOKIE, cookie.parse().expect("valid cookie"));
    Ok(response)
}

async fn me(
    State(state): State<AppState>,
    current: CurrentUser,
) -> Result<Json<Value>, ApiError> {
    let user = state
        .db
        .get_user_by_id(current.id)
        .await?
        .ok_or_else(|| ApiError::not_found("User not found"))?;
    Ok(Json(json!({
        "id": user.id,
        "username": user.username,
        "display_name": user.display_name,
        "email": user.email,
        "roles": user.roles,
        "is_superuser": user.is_superuser,
        "last_login_at": user.last_login_at,
    })))
}
