//! # Error Handling
//!
//! Unified problem+json error responses for the HTTP surface, with trace ID
//! propagation and mappings from the pipeline's error types.

use axum::{
    extract::rejection::JsonRejection,
    http::{HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use serde::Serialize;
use serde_json::json;
use utoipa::ToSchema;

use crate::connection_registry::ConnectionError;
use crate::providers::ProviderError;
use crate::store::{StoreError, is_unique_violation};
use crate::sync_orchestrator::SyncError;
use crate::telemetry;
use crate::webhook_gateway::GatewayError;

/// Unified API error response structure
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ApiError {
    /// HTTP status code for the response
    #[serde(skip_serializing, skip_deserializing)]
    pub status: StatusCode,
    /// Error code for programmatic handling
    pub code: Box<str>,
    /// Human-readable error message
    pub message: Box<str>,
    /// Additional error details (optional)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Box<serde_json::Value>>,
    /// Suggested retry delay in seconds (optional)
    pub retry_after: Option<u64>,
    /// Correlation trace ID for debugging (optional)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<Box<str>>,
}

impl ApiError {
    pub fn new<S: Into<String>>(status: StatusCode, code: S, message: S) -> Self {
        Self {
            status,
            code: code.into().into_boxed_str(),
            message: message.into().into_boxed_str(),
            details: None,
            retry_after: None,
            trace_id: Self::current_trace_id(),
        }
    }

    pub fn with_details<V: Into<serde_json::Value>>(mut self, details: V) -> Self {
        self.details = Some(Box::new(details.into()));
        self
    }

    pub fn with_retry_after(mut self, seconds: u64) -> Self {
        self.retry_after = Some(seconds);
        self
    }

    /// Trace ID of the active span, or a generated correlation ID.
    fn current_trace_id() -> Option<Box<str>> {
        telemetry::current_trace_id()
            .map(|trace_id| trace_id.into_boxed_str())
            .or_else(|| {
                Some(format!("corr-{}", &uuid::Uuid::new_v4().to_string()[..8]).into_boxed_str())
            })
    }

    fn internal(message: &str) -> Self {
        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "INTERNAL_SERVER_ERROR",
            message,
        )
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut headers = HeaderMap::new();
        headers.insert(
            "content-type",
            HeaderValue::from_static("application/problem+json"),
        );

        if let Some(retry_after) = self.retry_after
            && let Ok(header_value) = HeaderValue::from_str(&retry_after.to_string())
        {
            headers.insert("retry-after", header_value);
        }

        (self.status, headers, axum::Json(self)).into_response()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(error: anyhow::Error) -> Self {
        tracing::error!("Internal error: {:?}", error);
        Self::internal("An internal error occurred")
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        let message = match rejection {
            JsonRejection::JsonDataError(err) => format!("Invalid JSON: {}", err),
            JsonRejection::JsonSyntaxError(err) => format!("JSON syntax error: {}", err),
            JsonRejection::MissingJsonContentType(_) => {
                "Missing 'Content-Type: application/json' header".to_string()
            }
            _ => "Invalid request body".to_string(),
        };

        Self::new(StatusCode::BAD_REQUEST, "VALIDATION_FAILED", &message)
    }
}

impl From<sea_orm::DbErr> for ApiError {
    fn from(error: sea_orm::DbErr) -> Self {
        if is_unique_violation(&error) {
            tracing::debug!(?error, "Unique constraint violation detected");
            return Self::new(StatusCode::CONFLICT, "CONFLICT", "Resource already exists");
        }

        match error {
            sea_orm::DbErr::RecordNotFound(record) => Self::new(
                StatusCode::NOT_FOUND,
                "NOT_FOUND",
                &format!("Record not found: {}", record),
            ),
            sea_orm::DbErr::Conn(connection_err) => {
                tracing::error!("Database connection error: {:?}", connection_err);
                Self::new(
                    StatusCode::SERVICE_UNAVAILABLE,
                    "SERVICE_UNAVAILABLE",
                    "Database service unavailable",
                )
            }
            other => {
                tracing::error!("Database error: {:?}", other);
                Self::internal("Database error occurred")
            }
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::Conflict(what) => Self::new(
                StatusCode::CONFLICT,
                "CONFLICT",
                &format!("Resource already exists: {what}"),
            ),
            StoreError::NotFound(what) => Self::new(
                StatusCode::NOT_FOUND,
                "NOT_FOUND",
                &format!("Record not found: {what}"),
            ),
            StoreError::Database(db_err) => db_err.into(),
            other => {
                tracing::error!(error = %other, "Store failure");
                Self::internal("Storage error occurred")
            }
        }
    }
}

impl From<ConnectionError> for ApiError {
    fn from(error: ConnectionError) -> Self {
        let message = error.to_string();
        match error {
            ConnectionError::Duplicate { owner_id, provider } => Self::new(
                StatusCode::CONFLICT,
                "CONNECTION_EXISTS",
                &message,
            )
            .with_details(json!({ "owner_id": owner_id, "provider": provider })),
            ConnectionError::NotFound(id) => Self::new(
                StatusCode::NOT_FOUND,
                "NOT_FOUND",
                &format!("Connection {id} not found"),
            ),
            ConnectionError::UnknownProvider(provider) => Self::new(
                StatusCode::NOT_FOUND,
                "UNKNOWN_PROVIDER",
                &format!("Provider '{provider}' is not configured"),
            ),
            ConnectionError::Inactive { .. } => {
                Self::new(StatusCode::CONFLICT, "CONNECTION_INACTIVE", &message)
            }
            ConnectionError::Expired { .. } => {
                Self::new(StatusCode::UNAUTHORIZED, "CREDENTIAL_EXPIRED", &message)
            }
            ConnectionError::Store(store) => store.into(),
        }
    }
}

/// Upstream failures surface as 502, with rate limits carrying a retry hint.
fn provider_failure(error: &ProviderError) -> ApiError {
    let api_error = ApiError::new(
        StatusCode::BAD_GATEWAY,
        "PROVIDER_ERROR",
        &error.to_string(),
    );
    match error {
        ProviderError::RateLimited {
            retry_after_secs: Some(secs),
        } => api_error.with_retry_after(*secs),
        _ => api_error,
    }
}

impl From<SyncError> for ApiError {
    fn from(error: SyncError) -> Self {
        match error {
            e @ SyncError::AlreadyRunning { .. } => {
                Self::new(StatusCode::CONFLICT, "SYNC_IN_PROGRESS", &e.to_string())
            }
            e @ SyncError::NoActiveConnection { .. } => {
                Self::new(StatusCode::NOT_FOUND, "NO_ACTIVE_CONNECTION", &e.to_string())
            }
            SyncError::Connection(connection) => connection.into(),
            e @ (SyncError::Lease(_) | SyncError::LeaseLost { .. }) => {
                tracing::warn!(error = %e, "Sync lease failure");
                Self::new(StatusCode::CONFLICT, "SYNC_LEASE_LOST", &e.to_string())
            }
            SyncError::Aborted {
                ref summary,
                ref source,
                ..
            } => provider_failure(source).with_details(json!({ "summary": summary })),
            SyncError::StorageFailed {
                ref summary,
                ref source,
                ..
            } => {
                tracing::error!(error = %source, "Sync page could not be stored");
                Self::new(
                    StatusCode::SERVICE_UNAVAILABLE,
                    "SYNC_STORAGE_FAILED",
                    "Sync stopped because a page could not be stored",
                )
                .with_details(json!({ "summary": summary }))
            }
            SyncError::Cancelled { ref summary, .. } => Self::new(
                StatusCode::SERVICE_UNAVAILABLE,
                "SYNC_CANCELLED",
                "Sync was cancelled before completion",
            )
            .with_details(json!({ "summary": summary })),
            e @ SyncError::Inference(_) => {
                tracing::error!(error = %e, "Activity could not be applied");
                Self::internal("Activity could not be applied")
            }
        }
    }
}

impl From<GatewayError> for ApiError {
    fn from(error: GatewayError) -> Self {
        match error {
            e @ GatewayError::UnknownProvider(_) => {
                Self::new(StatusCode::NOT_FOUND, "UNKNOWN_PROVIDER", &e.to_string())
            }
            e @ GatewayError::Validation(_) => {
                Self::new(StatusCode::BAD_REQUEST, "VALIDATION_FAILED", &e.to_string())
            }
            GatewayError::SignatureRejected { .. } => unauthorized(Some("Invalid webhook signature")),
            GatewayError::Store(store) => store.into(),
        }
    }
}

/// Create an unauthorized error (401)
pub fn unauthorized(message: Option<&str>) -> ApiError {
    let msg = message.unwrap_or("Authentication required");
    ApiError::new(StatusCode::UNAUTHORIZED, "UNAUTHORIZED", msg)
}

/// Create a validation error with field details
pub fn validation_error(message: &str, field_errors: serde_json::Value) -> ApiError {
    ApiError::new(StatusCode::BAD_REQUEST, "VALIDATION_FAILED", message).with_details(field_errors)
}

/// Create a rate limit error (429) with a retry hint
pub fn rate_limited(retry_after_secs: u64) -> ApiError {
    ApiError::new(
        StatusCode::TOO_MANY_REQUESTS,
        "RATE_LIMITED",
        "Too many requests",
    )
    .with_retry_after(retry_after_secs)
}
