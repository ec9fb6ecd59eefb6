//! Error types shared across the server.
//!
//! Each domain owns a small `thiserror` enum; the HTTP layer folds them
//! into [`ApiError`], which carries the status code and the `detail`
//! string returned to clients.

use axum::Json;
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde_json::json;

/// Error from the key-value store.
#[derive(Debug, thiserror::Error)]
pub enum KvError {
    #[error("kv backend error: {0}")]
    Backend(String),

    #[error("kv value could not be decoded: {0}")]
    Decode(String),
}

impl From<redis::RedisError> for KvError {
    fn from(err: redis::RedisError) -> Self {
        KvError::Backend(err.to_string())
    }
}

/// Error from the SQL store.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("database pool error: {0}")]
    Pool(String),

    #[error("database query error: {0}")]
    Query(#[from] tokio_postgres::Error),

    #[error("database migration error: {0}")]
    Migration(String),

    #[error("row could not be decoded: {0}")]
    Decode(String),
}

impl From<deadpool_postgres::PoolError> for DatabaseError {
    fn from(err: deadpool_postgres::PoolError) -> Self {
        DatabaseError::Pool(err.to_string())
    }
}

/// Error from the durable job store.
#[derive(Debug, thiserror::Error)]
pub enum JobStoreError {
    #[error(transparent)]
    Kv(#[from] KvError),

    #[error("job record could not be decoded: {0}")]
    Decode(String),
}

/// Error from the task broker.
#[derive(Debug, thiserror::Error)]
pub enum TaskBusError {
    #[error("broker error: {0}")]
    Broker(String),

    #[error("task message could not be decoded: {0}")]
    Decode(String),
}

impl From<redis::RedisError> for TaskBusError {
    fn from(err: redis::RedisError) -> Self {
        TaskBusError::Broker(err.to_string())
    }
}

/// Error raised while ingesting or validating a toolkit bundle.
#[derive(Debug, thiserror::Error)]
pub enum BundleError {
    #[error("{0}")]
    Manifest(String),

    #[error("upload exceeds the configured size limit")]
    UploadTooLarge,

    #[error("bundle entry '{0}' exceeds the per-file size limit")]
    FileTooLarge(String),

    #[error("bundle exceeds the aggregate size limit")]
    BundleTooLarge,

    #[error("bundle entry '{0}' is not allowed")]
    ForbiddenEntry(String),

    #[error("invalid zip bundle: {0}")]
    BadArchive(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Error from the full bundle install pipeline (extraction + registry).
#[derive(Debug, thiserror::Error)]
pub enum InstallError {
    #[error(transparent)]
    Bundle(#[from] BundleError),

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Error from the toolkit registry.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("toolkit '{0}' already exists")]
    DuplicateSlug(String),

    #[error("toolkit not found")]
    NotFound,

    #[error("cannot delete builtin toolkit")]
    BuiltinProtected,

    #[error("{0}")]
    InvalidSlug(String),

    #[error(transparent)]
    Database(#[from] DatabaseError),

    #[error(transparent)]
    Kv(#[from] KvError),
}

/// Error from authentication flows.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("{0}")]
    InvalidCredentials(String),

    #[error("{0}")]
    InvalidRequest(String),

    #[error("account locked")]
    Locked { retry_after_seconds: i64 },

    #[error("forbidden")]
    Forbidden,

    #[error("provider not found")]
    ProviderNotFound,

    #[error("identity provider unavailable: {0}")]
    Upstream(String),

    #[error(transparent)]
    Database(#[from] DatabaseError),

    #[error(transparent)]
    Kv(#[from] KvError),

    #[error("token error: {0}")]
    Token(String),
}

/// Error from the community catalog service.
#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("no community catalog url configured")]
    NotConfigured,

    #[error("catalog fetch failed: {0}")]
    Fetch(String),

    #[error("catalog entry '{0}' not found")]
    EntryNotFound(String),

    #[error("no downloadable bundle found for '{0}'")]
    NoBundle(String),

    #[error(transparent)]
    Bundle(#[from] BundleError),

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

impl From<InstallError> for CatalogError {
    fn from(err: InstallError) -> Self {
        match err {
            InstallError::Bundle(inner) => CatalogError::Bundle(inner),
            InstallError::Registry(inner) => CatalogError::Registry(inner),
        }
    }
}

/// HTTP-facing error with a status code and client-visible detail.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub detail: String,
    pub retry_after_seconds: Option<i64>,
}

impl ApiError {
    pub fn new(status: StatusCode, detail: impl Into<String>) -> Self {
        Self {
            status,
            detail: detail.into(),
            retry_after_seconds: None,
        }
    }

    pub fn bad_request(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, detail)
    }

    pub fn unauthorized(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, detail)
    }

    pub fn forbidden(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, detail)
    }

    pub fn not_found(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, detail)
    }

    pub fn too_large(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::PAYLOAD_TOO_LARGE, detail)
    }

    pub fn throttled(retry_after_seconds: i64) -> Self {
        Self {
            status: StatusCode::TOO_MANY_REQUESTS,
            detail: "Too many failed attempts; try again later".to_string(),
            retry_after_seconds: Some(retry_after_seconds),
        }
    }

    pub fn upstream(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_GATEWAY, detail)
    }

    pub fn internal(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, detail)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            tracing::error!(status = %self.status, detail = %self.detail, "request failed");
        }
        let mut response =
            (self.status, Json(json!({ "detail": self.detail }))).into_response();
        if let Some(seconds) = self.retry_after_seconds {
            if let Ok(value) = HeaderValue::from_str(&seconds.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}

impl From<KvError> for ApiError {
    fn from(err: KvError) -> Self {
        ApiError::internal(err.to_string())
    }
}

impl From<DatabaseError> for ApiError {
    fn from(err: DatabaseError) -> Self {
        ApiError::internal(err.to_string())
    }
}

impl From<JobStoreError> for ApiError {
    fn from(err: JobStoreError) -> Self {
        ApiError::internal(err.to_string())
    }
}

impl From<TaskBusError> for ApiError {
    fn from(err: TaskBusError) -> Self {
        ApiError::new(StatusCode::SERVICE_UNAVAILABLE, err.to_string())
    }
}

impl From<BundleError> for ApiError {
    fn from(err: BundleError) -> Self {
        match err {
            BundleError::UploadTooLarge
            | BundleError::FileTooLarge(_)
            | BundleError::BundleTooLarge => ApiError::too_large(err.to_string()),
            BundleError::Io(inner) => ApiError::internal(inner.to_string()),
            other => ApiError::bad_request(other.to_string()),
        }
    }
}

impl From<InstallError> for ApiError {
    fn from(err: InstallError) -> Self {
        match err {
            InstallError::Bundle(inner) => inner.into(),
            InstallError::Registry(inner) => inner.into(),
        }
    }
}

impl From<RegistryError> for ApiError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::NotFound => ApiError::not_found("Toolkit not found"),
            RegistryError::DuplicateSlug(_)
            | RegistryError::BuiltinProtected
            | RegistryError::InvalidSlug(_) => ApiError::bad_request(err.to_string()),
            RegistryError::Database(inner) => inner.into(),
            RegistryError::Kv(inner) => inner.into(),
        }
    }
}

impl From<AuthError> for ApiError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::InvalidCredentials(detail) => ApiError::unauthorized(detail),
            AuthError::InvalidRequest(detail) => ApiError::bad_request(detail),
            AuthError::Locked {
                retry_after_seconds,
            } => ApiError::throttled(retry_after_seconds),
            AuthError::Forbidden => ApiError::forbidden("Insufficient permissions"),
            AuthError::ProviderNotFound => ApiError::not_found("Provider not found"),
            AuthError::Upstream(detail) => ApiError::upstream(detail),
            AuthError::Token(detail) => ApiError::unauthorized(detail),
            AuthError::Database(inner) => inner.into(),
            AuthError::Kv(inner) => inner.into(),
        }
    }
}

impl From<CatalogError> for ApiError {
    fn from(err: CatalogError) -> Self {
        match err {
            CatalogError::NotConfigured => {
                ApiError::not_found("No community catalog configured")
            }
            CatalogError::EntryNotFound(_) | CatalogError::NoBundle(_) => {
                ApiError::not_found(err.to_string())
            }
            CatalogError::Fetch(detail) => ApiError::upstream(detail),
            CatalogError::Bundle(inner) => inner.into(),
            CatalogError::Registry(inner) => inner.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn throttled_error_carries_retry_after() {
        let err = ApiError::throttled(900);
        assert_eq!(err.status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(err.retry_after_seconds, Some(900));
    }

    #[test]
    fn bundle_size_errors_map_to_413() {
        let err: ApiError = BundleError::UploadTooLarge.into();
        assert_eq!(err.status, StatusCode::PAYLOAD_TOO_LARGE);

        let err: ApiError = BundleError::Manifest("bad manifest".into()).into();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
    }

    #[test]
    fn registry_not_found_maps_to_404() {
        let err: ApiError = RegistryError::NotFound.into();
        assert_eq!(err.status, StatusCode::NOT_FOUND);
    }
}
