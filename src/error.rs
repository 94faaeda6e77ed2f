//! # Error Handling
//!
//! Library errors are carried by [`TenancyError`]. At an HTTP boundary they
//! convert into [`ApiError`], which renders a problem+json body with the
//! current trace id attached.

use std::borrow::Cow;

use axum::{
    http::{HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use sea_orm::{DbErr, RuntimeErr};
use serde::Serialize;
use thiserror::Error;

use crate::config::ConfigError;
use crate::telemetry;

const PG_UNIQUE_VIOLATION: &str = "23505";
const PG_DUPLICATE_SCHEMA: &str = "42P06";
const PG_INVALID_SCHEMA_NAME: &str = "3F000";
const SQLITE_DUPLICATE_CODES: &[&str] = &["1555", "2067"];

/// Boxed error returned by hooks and other external collaborators.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors surfaced by the tenant schema engine.
#[derive(Debug, Error)]
pub enum TenancyError {
    #[error("tenant or schema '{identifier}' already exists")]
    AlreadyExists { identifier: String },

    #[error("schema name of tenant '{identifier}' is immutable (attempted '{attempted}')")]
    ImmutableIdentifier {
        identifier: String,
        attempted: String,
    },

    #[error("the template schema cannot be activated as a data tenant")]
    TemplateActivationForbidden,

    #[error("access to tenant '{identifier}' is forbidden")]
    Forbidden { identifier: String },

    #[error("tenant '{identifier}' no longer exists")]
    NotFound { identifier: String },

    #[error("foreign key cycle reached table '{table}' during classification")]
    ClassificationCycle { table: String },

    #[error("structural change failed in schema '{schema}': {source}")]
    FanoutFailure {
        schema: String,
        #[source]
        source: Box<TenancyError>,
    },

    #[error("invalid schema identifier '{identifier}': {reason}")]
    InvalidIdentifier { identifier: String, reason: String },

    #[error("schema identifier '{identifier}' is reserved")]
    ReservedIdentifier { identifier: String },

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("an explicit tenant or template scope is required for partitioned tables: {}", tables.join(", "))]
    TenantRequired { tables: Vec<String> },

    #[error("hook '{hook}' failed: {source}")]
    Hook {
        hook: String,
        #[source]
        source: BoxError,
    },

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Database(#[from] DbErr),
}

impl TenancyError {
    /// Maps uniqueness and duplicate-schema violations to `AlreadyExists`,
    /// leaving every other database error untouched.
    pub fn from_db(error: DbErr, identifier: &str) -> Self {
        if is_unique_violation(&error) || is_duplicate_schema(&error) {
            tracing::debug!(?error, identifier, "duplicate identifier rejected by database");
            return TenancyError::AlreadyExists {
                identifier: identifier.to_string(),
            };
        }
        TenancyError::Database(error)
    }

    /// True for errors that deny access rather than signal a fault.
    pub fn is_access_denied(&self) -> bool {
        matches!(
            self,
            TenancyError::Forbidden { .. } | TenancyError::TemplateActivationForbidden
        )
    }
}

fn sqlstate(error: &DbErr) -> Option<Cow<'_, str>> {
    let runtime_err = match error {
        DbErr::Query(RuntimeErr::SqlxError(sqlx_err))
        | DbErr::Exec(RuntimeErr::SqlxError(sqlx_err)) => sqlx_err,
        _ => return None,
    };

    runtime_err.as_database_error().and_then(|db_error| db_error.code())
}

/// Detects unique-constraint violations reported by Postgres or SQLite.
pub fn is_unique_violation(error: &DbErr) -> bool {
    if let DbErr::Query(RuntimeErr::SqlxError(sqlx_err))
    | DbErr::Exec(RuntimeErr::SqlxError(sqlx_err)) = error
        && let Some(db_error) = sqlx_err.as_database_error()
        && db_error.is_unique_violation()
    {
        return true;
    }

    sqlstate(error).is_some_and(|code| {
        code == PG_UNIQUE_VIOLATION || SQLITE_DUPLICATE_CODES.contains(&code.as_ref())
    })
}

/// Detects Postgres `duplicate_schema`.
pub fn is_duplicate_schema(error: &DbErr) -> bool {
    sqlstate(error).is_some_and(|code| code == PG_DUPLICATE_SCHEMA)
}

/// Detects Postgres `invalid_schema_name` (source schema missing).
pub fn is_invalid_schema_name(error: &DbErr) -> bool {
    sqlstate(error).is_some_and(|code| code == PG_INVALID_SCHEMA_NAME)
}

/// Unified API error response structure
#[derive(Debug, Clone, Serialize)]
pub struct ApiError {
    /// HTTP status code for the response
    #[serde(skip_serializing)]
    pub status: StatusCode,
    /// Error code for programmatic handling
    pub code: Box<str>,
    /// Human-readable error message
    pub message: Box<str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Box<serde_json::Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<Box<str>>,
}

impl ApiError {
    pub fn new(status: StatusCode, code: &str, message: &str) -> Self {
        Self {
            status,
            code: code.into(),
            message: message.into(),
            details: None,
            trace_id: Self::current_trace_id(),
        }
    }

    pub fn with_details<V: Into<serde_json::Value>>(mut self, details: V) -> Self {
        self.details = Some(Box::new(details.into()));
        self
    }

    fn current_trace_id() -> Option<Box<str>> {
        telemetry::current_trace_id()
            .map(|trace_id| trace_id.into_boxed_str())
            .or_else(|| {
                Some(format!("corr-{}", &uuid::Uuid::new_v4().simple().to_string()[..8]).into_boxed_str())
            })
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut headers = HeaderMap::new();
        headers.insert(
            "content-type",
            HeaderValue::from_static("application/problem+json"),
        );

        (self.status, headers, axum::Json(self)).into_response()
    }
}

impl From<TenancyError> for ApiError {
    fn from(error: TenancyError) -> Self {
        match &error {
            TenancyError::Forbidden { .. } | TenancyError::TemplateActivationForbidden => {
                Self::new(StatusCode::FORBIDDEN, "FORBIDDEN", &error.to_string())
            }
            TenancyError::NotFound { .. } => {
                Self::new(StatusCode::NOT_FOUND, "NOT_FOUND", &error.to_string())
            }
            TenancyError::AlreadyExists { .. } | TenancyError::ImmutableIdentifier { .. } => {
                Self::new(StatusCode::CONFLICT, "CONFLICT", &error.to_string())
            }
            TenancyError::InvalidIdentifier { .. }
            | TenancyError::ReservedIdentifier { .. }
            | TenancyError::Validation(_)
            | TenancyError::TenantRequired { .. } => {
                Self::new(StatusCode::BAD_REQUEST, "VALIDATION_FAILED", &error.to_string())
            }
            TenancyError::Database(db_err) if matches!(db_err, DbErr::Conn(_)) => {
                tracing::error!(error = ?db_err, "database connection error");
                Self::new(
                    StatusCode::SERVICE_UNAVAILABLE,
                    "SERVICE_UNAVAILABLE",
                    "Database service unavailable",
                )
            }
            _ => {
                tracing::error!(?error, "internal tenancy error");
                Self::new(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL_SERVER_ERROR",
                    "An internal error occurred",
                )
            }
        }
    }
}

impl From<DbErr> for ApiError {
    fn from(error: DbErr) -> Self {
        if is_unique_violation(&error) {
            tracing::debug!(?error, "Unique constraint violation detected");
            return Self::new(StatusCode::CONFLICT, "CONFLICT", "Resource already exists");
        }
        TenancyError::Database(error).into()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(error: anyhow::Error) -> Self {
        tracing::error!("Internal error: {:?}", error);

        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "INTERNAL_SERVER_ERROR",
            "An internal error occurred",
        )
    }
}
