use snafu::Snafu;

use crate::cache::CacheError;

#[derive(Debug, Snafu)]
pub enum Error {
    /// The request was rejected before any I/O was attempted.
    #[snafu(display("Invalid message: {message}"))]
    Validation { message: String },

    /// The cache tier is unreachable or timed out. Trips the owning circuit
    /// breaker and triggers the durable fallback for writes.
    #[snafu(display("Cache tier unavailable: {source}"))]
    Connectivity { source: CacheError },

    /// The payload itself is defective (malformed cached entry, constraint
    /// violation on insert). Never trips a breaker.
    #[snafu(display("Data integrity failure: {message}"))]
    DataIntegrity { message: String },

    #[snafu(display("Resource not found: {resource}"))]
    NotFound { resource: String },

    /// Both the fast path and the durable fallback failed. The message was
    /// NOT accepted; the caller must retry or report the failure.
    #[snafu(display("Message not accepted: both write paths failed"))]
    Unavailable {
        #[snafu(source(false))]
        source: Option<eyre::Report>,
    },

    #[snafu(display("Error returned from database"))]
    Sqlx {
        #[snafu(source)]
        source: sqlx::Error,
    },

    #[snafu(display("Error running migrations"))]
    Migration {
        #[snafu(source)]
        source: sqlx::migrate::MigrateError,
    },
}

impl From<sqlx::Error> for Error {
    fn from(source: sqlx::Error) -> Self {
        // Constraint violations are a property of the data, not of the
        // backend's availability, and must not feed the circuit breaker.
        if let Some(db_err) = source.as_database_error() {
            use sqlx::error::ErrorKind;
            match db_err.kind() {
                ErrorKind::UniqueViolation
                | ErrorKind::ForeignKeyViolation
                | ErrorKind::NotNullViolation
                | ErrorKind::CheckViolation => {
                    return Self::DataIntegrity {
                        message: db_err.to_string(),
                    }
                }
                _ => {}
            }
        }
        Self::Sqlx { source }
    }
}

impl From<CacheError> for Error {
    fn from(source: CacheError) -> Self {
        match source {
            CacheError::Corrupt { .. } => Self::DataIntegrity {
                message: source.to_string(),
            },
            _ => Self::Connectivity { source },
        }
    }
}

impl From<sqlx::migrate::MigrateError> for Error {
    fn from(source: sqlx::migrate::MigrateError) -> Self {
        Self::Migration { source }
    }
}

impl Error {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    pub fn not_found(resource: impl Into<String>) -> Self {
        Self::NotFound {
            resource: resource.into(),
        }
    }

    pub fn unavailable(e: impl Into<eyre::Report>) -> Self {
        Self::Unavailable {
            source: Some(e.into()),
        }
    }

    /// True for failures that indicate the backend itself is unhealthy, as
    /// opposed to a defect in the specific payload.
    pub fn is_connectivity(&self) -> bool {
        matches!(self, Self::Connectivity { .. } | Self::Sqlx { .. })
    }

    pub fn room_not_found(chatroom_id: i64) -> Self {
        Self::NotFound {
            resource: format!("chatroom {chatroom_id}"),
        }
    }
}

impl actix_web::ResponseError for Error {
    fn status_code(&self) -> actix_web::http::StatusCode {
        match self {
            Self::Validation { .. } => actix_web::http::StatusCode::BAD_REQUEST,
            Self::NotFound { .. } => actix_web::http::StatusCode::NOT_FOUND,
            Self::Unavailable { .. } | Self::Connectivity { .. } => {
                actix_web::http::StatusCode::SERVICE_UNAVAILABLE
            }
            Self::DataIntegrity { .. } => actix_web::http::StatusCode::UNPROCESSABLE_ENTITY,
            Self::Sqlx { .. } | Self::Migration { .. } => {
                actix_web::http::StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}
