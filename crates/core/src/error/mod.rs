//! Error handling for the gateway.
//!
//! Every failure in the system carries an [`ErrorCode`] from the taxonomy
//! plus a human-readable message. The code determines the HTTP status the
//! façade returns and whether the dispatcher may consume the failure and
//! try the next agent in the fallback chain (`is_transient`). Internal
//! detail stays in logs; the wire only ever sees the stable code string
//! and a sanitized message.

pub mod codes;

pub use codes::ErrorCode;

use serde::Serialize;
use thiserror::Error as ThisError;

pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the gateway.
#[derive(Debug, Clone, ThisError, Serialize)]
#[error("{code}: {message}")]
pub struct Error {
    /// Standardized error code
    pub code: ErrorCode,
    /// Human-readable error message
    pub message: String,
    /// Optional detail, logged but never returned to clients
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    /// Tenant the failure is attributed to, when known
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tenant: Option<String>,
}

impl Error {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
            tenant: None,
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn with_tenant(mut self, tenant: impl Into<String>) -> Self {
        self.tenant = Some(tenant.into());
        self
    }

    pub fn http_status(&self) -> u16 {
        self.code.http_status()
    }

    /// Recoverable failures may trigger the next candidate agent.
    pub fn is_transient(&self) -> bool {
        self.code.is_transient()
    }

    // Shorthand constructors for the common cases.

    pub fn config(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ConfigInvalid, message)
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::BadRequest, message)
    }

    pub fn tenant_unknown(tenant: impl Into<String>) -> Self {
        let tenant = tenant.into();
        Self::new(ErrorCode::TenantUnknown, format!("unknown tenant '{tenant}'"))
            .with_tenant(tenant)
    }

    pub fn tenant_required() -> Self {
        Self::new(
            ErrorCode::TenantRequired,
            "request carries no tenant identity and defaulting is disabled",
        )
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Timeout, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Internal, message)
    }
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::PoolTimedOut => {
                Error::new(ErrorCode::PoolExhausted, "database pool exhausted")
                    .with_details(err.to_string())
            }
            sqlx::Error::PoolClosed => {
                Error::new(ErrorCode::DbUnavailable, "database pool closed")
                    .with_details(err.to_string())
            }
            sqlx::Error::Io(_) | sqlx::Error::Tls(_) => {
                Error::new(ErrorCode::DbUnavailable, "database unreachable")
                    .with_details(err.to_string())
            }
            sqlx::Error::Database(db) => {
                // 57014 = query_canceled, raised by statement_timeout
                if db.code().as_deref() == Some("57014") {
                    Error::new(ErrorCode::QueryTooExpensive, "query exceeded statement timeout")
                        .with_details(db.to_string())
                } else {
                    Error::new(ErrorCode::DbUnavailable, "database error")
                        .with_details(db.to_string())
                }
            }
            _ => Error::new(ErrorCode::DbUnavailable, "database error").with_details(err.to_string()),
        }
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(err: serde_yaml::Error) -> Self {
        Error::config(format!("invalid tenant configuration document: {err}"))
    }
}
