//! Call Controller error types.
//!
//! Errors map to the two client-facing frame kinds (`callError` and
//! `validationError`). Internal details are logged server-side but never
//! exposed on the wire.

use thiserror::Error;

/// Client-facing reason strings.
///
/// Precondition reasons are part of the wire contract: clients branch on them,
/// so the exact strings are pinned here rather than inlined at call sites.
pub mod reasons {
    /// `registerUser` with a blank or missing `userId`/`username`.
    pub const IDENTITY_REQUIRED: &str = "username and userId are required";
    /// `requestCall` from a connection that never registered.
    pub const CALLER_SESSION_MISSING: &str = "caller session missing";
    /// `requestCall` naming a callee that is not registered.
    pub const CALLEE_UNAVAILABLE: &str = "callee unavailable";
    /// `requestCall` while the caller is already in a call.
    pub const CALLER_ALREADY_BUSY: &str = "caller already busy";
    /// `requestCall` naming a callee that is already in a call.
    pub const CALLEE_ALREADY_BUSY: &str = "callee already busy";
    /// `acceptCall` without a ringing call to accept.
    pub const NO_CALL_TO_ACCEPT: &str = "no incoming call to accept";
    /// `declineCall` from a connection with no still-ringing call.
    pub const NO_CALL_TO_DECLINE: &str = "no ringing call to decline";
    /// `endCall` without a live call.
    pub const NO_ACTIVE_CALL: &str = "no active call";
    /// `submitFeedback` from an uplifter.
    pub const FEEDBACK_HERO_ONLY: &str = "only heroes can submit feedback";
    /// `submitFeedback` without a settled-in session to write to.
    pub const NO_ACTIVE_SESSION: &str = "no active session";
    /// `submitFeedback` that lost the settlement race.
    pub const SESSION_ALREADY_SETTLED: &str = "session already settled";
    /// Generic reason when the durable create fails; internals stay server-side.
    pub const CALL_SETUP_FAILED: &str = "call setup failed";
    /// Generic reason when a feedback settlement fails; internals stay server-side.
    pub const SETTLEMENT_FAILED: &str = "settlement failed";
}

/// Call Controller error type.
///
/// `Validation` surfaces as a `validationError` frame, `Precondition` as a
/// `callError` frame with its exact reason; everything else is collapsed to a
/// generic client message by [`CcError::client_reason`].
#[derive(Debug, Error)]
pub enum CcError {
    /// Malformed or non-numeric client input.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Lifecycle precondition failed (caller/callee missing or busy, no
    /// ringing call, wrong role). Carries the wire reason verbatim.
    #[error("Precondition failed: {0}")]
    Precondition(String),

    /// Durable store operation failed.
    #[error("Store error: {0}")]
    Store(#[from] sqlx::Error),

    /// Durable store operation exceeded the configured deadline.
    #[error("Store timeout during {0}")]
    StoreTimeout(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error (actor channel breaks and other invariant violations).
    #[error("Internal error: {0}")]
    Internal(String),
}

impl CcError {
    /// Stable lowercase label for metrics and log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            CcError::Validation(_) => "validation",
            CcError::Precondition(_) => "precondition",
            CcError::Store(_) => "store",
            CcError::StoreTimeout(_) => "store_timeout",
            CcError::Config(_) => "config",
            CcError::Internal(_) => "internal",
        }
    }

    /// Returns a client-safe reason string (no internal details).
    pub fn client_reason(&self) -> String {
        match self {
            CcError::Validation(reason) | CcError::Precondition(reason) => reason.clone(),
            CcError::Store(_)
            | CcError::StoreTimeout(_)
            | CcError::Config(_)
            | CcError::Internal(_) => "An internal error occurred".to_string(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mapping() {
        assert_eq!(CcError::Validation("bad mood".to_string()).kind(), "validation");
        assert_eq!(
            CcError::Precondition(reasons::CALLER_ALREADY_BUSY.to_string()).kind(),
            "precondition"
        );
        assert_eq!(CcError::Store(sqlx::Error::PoolClosed).kind(), "store");
        assert_eq!(
            CcError::StoreTimeout("create_session".to_string()).kind(),
            "store_timeout"
        );
        assert_eq!(CcError::Config("bad port".to_string()).kind(), "config");
        assert_eq!(CcError::Internal("channel closed".to_string()).kind(), "internal");
    }

    #[test]
    fn test_precondition_reasons_pass_through() {
        let err = CcError::Precondition(reasons::CALLEE_ALREADY_BUSY.to_string());
        assert_eq!(err.client_reason(), "callee already busy");

        let err = CcError::Validation("finalMood must be numeric".to_string());
        assert_eq!(err.client_reason(), "finalMood must be numeric");
    }

    #[test]
    fn test_client_reason_hides_internal_details() {
        let store_err = CcError::Store(sqlx::Error::PoolClosed);
        assert_eq!(store_err.client_reason(), "An internal error occurred");

        let timeout_err = CcError::StoreTimeout("deduct at 10.0.0.4:5432".to_string());
        assert!(!timeout_err.client_reason().contains("10.0.0.4"));

        let internal_err = CcError::Internal("mailbox send failed: full".to_string());
        assert!(!internal_err.client_reason().contains("mailbox"));
        assert_eq!(internal_err.client_reason(), "An internal error occurred");
    }

    #[test]
    fn test_display_formatting() {
        assert_eq!(
            format!("{}", CcError::Precondition("caller already busy".to_string())),
            "Precondition failed: caller already busy"
        );
        assert_eq!(
            format!("{}", CcError::StoreTimeout("create_session".to_string())),
            "Store timeout during create_session"
        );
    }

    #[test]
    fn test_sqlx_error_converts() {
        fn settle() -> Result<(), CcError> {
            Err(sqlx::Error::RowNotFound)?
        }
        assert!(matches!(settle(), Err(CcError::Store(_))));
    }
}
