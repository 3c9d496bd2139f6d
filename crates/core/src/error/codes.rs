use serde::{Deserialize, Serialize};
use std::fmt;

/// Standardized error codes for the gateway.
/// These are tenant-agnostic and represent technical failure categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    // Configuration errors
    ConfigInvalid,
    TenantDuplicate,
    CredentialMissing,

    // Identity errors
    TenantRequired,
    TenantUnknown,
    TenantDisabled,
    TenantConflict,
    UnauthorizedTenant,

    // Policy errors
    AgentDisabled,
    OverrideRejected,

    // SQL safety errors
    SqlRejected,
    DisallowedStatement,
    ForbiddenSchema,

    // Resource errors
    Timeout,
    QueryTooExpensive,
    PoolExhausted,

    // Transient upstream errors
    ProviderUnavailable,
    DbUnavailable,
    KbUnavailable,
    AgentUnavailable,

    // Request errors
    BadRequest,

    // Internal errors
    Internal,
}

impl ErrorCode {
    /// HTTP status the façade maps this code to.
    pub fn http_status(&self) -> u16 {
        match self {
            ErrorCode::BadRequest
            | ErrorCode::TenantConflict
            | ErrorCode::OverrideRejected => 400,

            ErrorCode::UnauthorizedTenant | ErrorCode::TenantRequired => 401,

            ErrorCode::TenantDisabled | ErrorCode::AgentDisabled => 403,

            ErrorCode::TenantUnknown => 404,

            ErrorCode::Timeout => 408,

            // Safety gate refusals are client-attributable but well-formed
            ErrorCode::SqlRejected
            | ErrorCode::DisallowedStatement
            | ErrorCode::ForbiddenSchema => 422,

            ErrorCode::QueryTooExpensive | ErrorCode::PoolExhausted => 429,

            ErrorCode::ConfigInvalid
            | ErrorCode::TenantDuplicate
            | ErrorCode::CredentialMissing
            | ErrorCode::Internal => 500,

            ErrorCode::ProviderUnavailable
            | ErrorCode::DbUnavailable
            | ErrorCode::KbUnavailable
            | ErrorCode::AgentUnavailable => 503,
        }
    }

    /// Whether the dispatcher may consume this failure and try the next
    /// agent in the fallback chain. Fatal codes surface immediately.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ErrorCode::Timeout
                | ErrorCode::PoolExhausted
                | ErrorCode::ProviderUnavailable
                | ErrorCode::DbUnavailable
                | ErrorCode::KbUnavailable
                | ErrorCode::AgentUnavailable
        )
    }

    /// Stable wire identifier used in the OpenAI-style error envelope.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::ConfigInvalid => "config_invalid",
            ErrorCode::TenantDuplicate => "tenant_duplicate",
            ErrorCode::CredentialMissing => "credential_missing",
            ErrorCode::TenantRequired => "tenant_required",
            ErrorCode::TenantUnknown => "tenant_unknown",
            ErrorCode::TenantDisabled => "tenant_disabled",
            ErrorCode::TenantConflict => "tenant_conflict",
            ErrorCode::UnauthorizedTenant => "unauthorized_tenant",
            ErrorCode::AgentDisabled => "agent_disabled",
            ErrorCode::OverrideRejected => "override_rejected",
            ErrorCode::SqlRejected => "safety_rejected",
            ErrorCode::DisallowedStatement => "disallowed_statement",
            ErrorCode::ForbiddenSchema => "forbidden_schema",
            ErrorCode::Timeout => "timeout",
            ErrorCode::QueryTooExpensive => "query_too_expensive",
            ErrorCode::PoolExhausted => "pool_exhausted",
            ErrorCode::ProviderUnavailable => "provider_unavailable",
            ErrorCode::DbUnavailable => "db_unavailable",
            ErrorCode::KbUnavailable => "kb_unavailable",
            ErrorCode::AgentUnavailable => "agent_unavailable",
            ErrorCode::BadRequest => "bad_request",
            ErrorCode::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn safety_rejections_map_to_422() {
        assert_eq!(ErrorCode::SqlRejected.http_status(), 422);
        assert_eq!(ErrorCode::DisallowedStatement.http_status(), 422);
        assert_eq!(ErrorCode::ForbiddenSchema.http_status(), 422);
    }

    #[test]
    fn transient_codes_are_server_side() {
        for code in [
            ErrorCode::ProviderUnavailable,
            ErrorCode::DbUnavailable,
            ErrorCode::KbUnavailable,
        ] {
            assert!(code.is_transient());
            assert!(code.http_status() >= 500);
        }
    }

    #[test]
    fn fatal_codes_do_not_fall_back() {
        assert!(!ErrorCode::TenantUnknown.is_transient());
        assert!(!ErrorCode::SqlRejected.is_transient());
        assert!(!ErrorCode::QueryTooExpensive.is_transient());
    }
}
