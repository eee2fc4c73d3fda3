// SPDX-License-Identifier: Apache-2.0
use thiserror::Error;

/// The error taxonomy the core surfaces, matching the kinds every caller
/// (HTTP surface, RPC surface, internal tasks) must be able to distinguish.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Caller-supplied data failed preconditions. Returned verbatim, never
    /// retried.
    #[error("validation error: {0}")]
    Validation(String),

    /// Addressed entity does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Idempotency-duplicate, unique-constraint violation, or
    /// double-registration.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Auth failed outright (bad signature, expired token, revoked
    /// principal, replayed nonce). Message shown to callers must stay
    /// generic per the propagation policy; detail is logged separately.
    #[error("unauthenticated")]
    Unauthenticated,

    /// Authenticated, but the principal's role set doesn't permit the
    /// operation.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// No agent registered for the target, the agent's send queue is full,
    /// or a tool provider refused. Callers may retry with backoff.
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// The request was canceled by its caller.
    #[error("canceled")]
    Canceled,

    /// The request exceeded its deadline.
    #[error("timeout: {0}")]
    Timeout(String),

    /// Ledger/store failure.
    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    /// Anything else: persistence failure outside the storage layer,
    /// unexpected panics caught at a boundary, serialization bugs.
    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// HTTP status code this error kind maps to, per the EXTERNAL INTERFACES
    /// status-code table.
    pub fn status_code(&self) -> u16 {
        match self {
            GatewayError::Validation(_) => 400,
            GatewayError::NotFound(_) => 404,
            GatewayError::Conflict(_) => 409,
            GatewayError::Unauthenticated => 401,
            GatewayError::Forbidden(_) => 403,
            GatewayError::Unavailable(_) => 503,
            GatewayError::Canceled => 499,
            GatewayError::Timeout(_) => 504,
            GatewayError::Storage(_) | GatewayError::Internal(_) => 500,
        }
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_match_spec_table() {
        assert_eq!(GatewayError::Validation("x".into()).status_code(), 400);
        assert_eq!(GatewayError::Unauthenticated.status_code(), 401);
        assert_eq!(GatewayError::Forbidden("x".into()).status_code(), 403);
        assert_eq!(GatewayError::NotFound("x".into()).status_code(), 404);
        assert_eq!(GatewayError::Conflict("x".into()).status_code(), 409);
        assert_eq!(GatewayError::Unavailable("x".into()).status_code(), 503);
        assert_eq!(GatewayError::Internal("x".into()).status_code(), 500);
    }
}
