use http::StatusCode;
use sea_orm::error::DbErr;
use serde::{Deserialize, Serialize};

/// Error payload handed to outer layers (HTTP, CLI) that render engine failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// HTTP status category (e.g., "Unprocessable Entity", "Conflict")
    pub error: String,
    /// Human-readable error description
    pub message: String,
    /// Whether the caller may retry the same request unchanged
    pub retryable: bool,
    /// ISO 8601 timestamp when error occurred
    pub timestamp: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("Database error: {0}")]
    DatabaseError(#[from] DbErr),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error(
        "Insufficient stock for variant {variant_id} at store {store_id}: requested {requested}, available {available}"
    )]
    InsufficientStock {
        variant_id: i64,
        store_id: i64,
        requested: i32,
        available: i32,
    },

    #[error("Concurrency conflict: {0}")]
    ConcurrencyConflict(String),

    #[error("Lock not acquired: {0}")]
    LockAcquisitionTimeout(String),

    #[error("Invalid store: {0}")]
    InvalidStore(i64),

    #[error("No store configured")]
    NoStoreConfigured,

    #[error("Authentication required")]
    AuthenticationRequired,

    #[error("Event error: {0}")]
    EventError(String),

    #[error("Cache error: {0}")]
    CacheError(String),

    #[error("Internal error: {0}")]
    InternalError(String),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

impl From<validator::ValidationErrors> for ServiceError {
    fn from(err: validator::ValidationErrors) -> Self {
        ServiceError::ValidationError(err.to_string())
    }
}

impl From<redis::RedisError> for ServiceError {
    fn from(err: redis::RedisError) -> Self {
        ServiceError::CacheError(err.to_string())
    }
}

/// Message fragments the supported databases use for transient lock conflicts.
const CONFLICT_SIGNATURES: &[&str] = &[
    "deadlock",
    "lock wait timeout",
    "lock timeout",
    "could not serialize",
    "serialization failure",
    "database is locked",
    "database table is locked",
];

pub trait IntoDbErr {
    fn into_db_err(self) -> DbErr;
}

impl IntoDbErr for DbErr {
    fn into_db_err(self) -> DbErr {
        self
    }
}

impl IntoDbErr for String {
    fn into_db_err(self) -> DbErr {
        DbErr::Custom(self)
    }
}

impl IntoDbErr for &str {
    fn into_db_err(self) -> DbErr {
        DbErr::Custom(self.to_string())
    }
}

impl ServiceError {
    /// Generic constructor that normalizes any supported database error input.
    pub fn db_error<E: IntoDbErr>(error: E) -> Self {
        ServiceError::DatabaseError(error.into_db_err())
    }

    /// True for conflict-class failures (deadlock, lock-wait timeout, version
    /// mismatch). Everything else must propagate without a retry.
    pub fn is_retriable(&self) -> bool {
        match self {
            Self::ConcurrencyConflict(_) => true,
            Self::DatabaseError(err) => {
                let message = err.to_string().to_lowercase();
                CONFLICT_SIGNATURES
                    .iter()
                    .any(|signature| message.contains(signature))
            }
            _ => false,
        }
    }

    /// Returns the HTTP status code for this error.
    /// This is the single source of truth for error-to-status mapping.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::ValidationError(_) | Self::InvalidStore(_) | Self::NoStoreConfigured => {
                StatusCode::BAD_REQUEST
            }
            Self::InsufficientStock { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            Self::AuthenticationRequired => StatusCode::UNAUTHORIZED,
            Self::ConcurrencyConflict(_) => StatusCode::CONFLICT,
            Self::LockAcquisitionTimeout(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::DatabaseError(_)
            | Self::EventError(_)
            | Self::CacheError(_)
            | Self::InternalError(_)
            | Self::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Returns the error message suitable for responses.
    /// Internal errors and lock failures return generic messages so that no
    /// lock key or database detail leaks out.
    pub fn response_message(&self) -> String {
        match self {
            Self::DatabaseError(_) => "Database error".to_string(),
            Self::ConcurrencyConflict(_) => {
                "The inventory record was modified concurrently, please try again".to_string()
            }
            Self::LockAcquisitionTimeout(_) => {
                "The resource is busy, please try again shortly".to_string()
            }
            Self::EventError(_) | Self::CacheError(_) | Self::InternalError(_) | Self::Other(_) => {
                "Internal server error".to_string()
            }
            _ => self.to_string(),
        }
    }

    /// Whether the caller is expected to retry later ("try again" responses).
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::ConcurrencyConflict(_) | Self::LockAcquisitionTimeout(_)
        ) || self.is_retriable()
    }

    pub fn to_response(&self) -> ErrorResponse {
        let status = self.status_code();
        ErrorResponse {
            error: status.canonical_reason().unwrap_or("Error").to_string(),
            message: self.response_message(),
            retryable: self.is_transient(),
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }
}

// Result extensions for easier error handling
pub trait ResultExt<T> {
    fn map_err_to_service(self) -> Result<T, ServiceError>;
}

impl<T, E> ResultExt<T> for Result<T, E>
where
    E: Into<ServiceError>,
{
    fn map_err_to_service(self) -> Result<T, ServiceError> {
        self.map_err(|e| e.into())
    }
}
