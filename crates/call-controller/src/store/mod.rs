//! Durable stores for sessions, subscriptions, and uplifter profiles.
//!
//! Each store is an `async_trait` seam with two implementations: Postgres for
//! production and an in-memory double used by tests and local runs. The
//! traits carry the guarded-write semantics the lifecycle depends on (settle
//! compare-and-swap, never-negative balance decrements) so every
//! implementation enforces them, not just the SQL one.

pub mod memory;
pub mod postgres;

use crate::errors::CcError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::types::{SessionId, UserId};
use std::future::Future;
use std::time::Duration;

/// Session lifecycle status persisted with the record.
///
/// `Pending` is never written by this controller; it is accepted on read and
/// as a settle-from state so surfaces that park a session awaiting feedback
/// stay compatible.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Ongoing,
    Pending,
    Completed,
    Declined,
}

impl SessionStatus {
    /// Storage string for this status.
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Ongoing => "ongoing",
            SessionStatus::Pending => "pending",
            SessionStatus::Completed => "completed",
            SessionStatus::Declined => "declined",
        }
    }

    /// Parse a storage string.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ongoing" => Some(SessionStatus::Ongoing),
            "pending" => Some(SessionStatus::Pending),
            "completed" => Some(SessionStatus::Completed),
            "declined" => Some(SessionStatus::Declined),
            _ => None,
        }
    }
}

/// A persisted call session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionRecord {
    pub session_id: SessionId,
    pub hero_user_id: UserId,
    pub uplifter_user_id: UserId,
    pub initial_mood: f64,
    pub final_mood: Option<f64>,
    pub feedback_text: Option<String>,
    pub rating_given: Option<f64>,
    pub inappropriate_flag: bool,
    pub status: SessionStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_secs: Option<i64>,
}

/// Fields written when a session settles. Duration is computed by the store
/// from the persisted `started_at`, floored to whole seconds.
#[derive(Debug, Clone)]
pub struct SettleUpdate {
    pub status: SessionStatus,
    pub ended_at: DateTime<Utc>,
    pub final_mood: Option<f64>,
    pub feedback_text: Option<String>,
    pub rating_given: Option<f64>,
    pub inappropriate_flag: bool,
}

/// Result of a guarded settle write.
#[derive(Debug, Clone)]
pub enum SettleWrite {
    /// The guard matched and the row transitioned.
    Applied(SessionRecord),
    /// The row exists but already left the allowed source statuses.
    AlreadySettled(SessionStatus),
    /// No such session.
    NotFound,
}

/// Store of durable call sessions.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Create an `Ongoing` session and return its id.
    async fn create_session(
        &self,
        hero_user_id: &UserId,
        uplifter_user_id: &UserId,
        initial_mood: f64,
        started_at: DateTime<Utc>,
    ) -> Result<SessionId, CcError>;

    /// Fetch a session by id.
    async fn find_session(&self, session_id: SessionId)
        -> Result<Option<SessionRecord>, CcError>;

    /// Apply `update` only while the current status is in `allowed_from`.
    ///
    /// The guard is what makes settlement at-most-once: concurrent triggers
    /// race on it and exactly one write reports `Applied`.
    async fn settle_session(
        &self,
        session_id: SessionId,
        allowed_from: &[SessionStatus],
        update: SettleUpdate,
    ) -> Result<SettleWrite, CcError>;
}

/// A hero's subscription balances.
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionRecord {
    pub user_id: UserId,
    pub weekly_balance: i64,
    pub weekly_expires_at: Option<DateTime<Utc>>,
    pub weekly_unlimited: bool,
    pub bundle_balance: i64,
}

/// Store of hero subscriptions.
///
/// Decrements are store-side guarded (`balance >= 1`, and a live window for
/// the weekly leg) so balances never go negative; callers learn whether a
/// unit was actually taken.
#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    /// Fetch a hero's subscription, if any.
    async fn find_subscription(
        &self,
        user_id: &UserId,
    ) -> Result<Option<SubscriptionRecord>, CcError>;

    /// Take one unit from the weekly balance; `false` when the guard refused.
    async fn deduct_weekly(&self, user_id: &UserId) -> Result<bool, CcError>;

    /// Take one unit from the bundle balance; `false` when the guard refused.
    async fn deduct_bundle(&self, user_id: &UserId) -> Result<bool, CcError>;
}

/// An uplifter's public profile aggregates.
#[derive(Debug, Clone, PartialEq)]
pub struct ProfileRecord {
    pub user_id: UserId,
    pub rating: f64,
    pub flag_count: i64,
}

/// Store of uplifter profiles.
#[async_trait]
pub trait ProfileStore: Send + Sync {
    /// Fetch an uplifter's profile, if any.
    async fn find_profile(&self, user_id: &UserId) -> Result<Option<ProfileRecord>, CcError>;

    /// Write the new aggregate rating, bumping the flag count when the
    /// session was marked inappropriate.
    async fn apply_feedback(
        &self,
        user_id: &UserId,
        rating: f64,
        flag_inappropriate: bool,
    ) -> Result<(), CcError>;
}

/// Run a store call under the configured deadline.
///
/// Elapsed deadlines surface as [`CcError::StoreTimeout`] naming the
/// operation; the caller decides whether that rolls anything back.
pub async fn with_deadline<T>(
    op: &'static str,
    deadline: Duration,
    fut: impl Future<Output = Result<T, CcError>>,
) -> Result<T, CcError> {
    match tokio::time::timeout(deadline, fut).await {
        Ok(result) => result,
        Err(_) => Err(CcError::StoreTimeout(op.to_string())),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_status_strings_round_trip() {
        for status in [
            SessionStatus::Ongoing,
            SessionStatus::Pending,
            SessionStatus::Completed,
            SessionStatus::Declined,
        ] {
            assert_eq!(SessionStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(SessionStatus::parse("ringing"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_deadline_times_out() {
        let slow = async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok::<_, CcError>(42)
        };

        let result = with_deadline("create_session", Duration::from_secs(3), slow).await;
        assert!(matches!(result, Err(CcError::StoreTimeout(op)) if op == "create_session"));
    }

    #[tokio::test]
    async fn test_with_deadline_passes_through() {
        let fast = async { Ok::<_, CcError>(7) };
        let result = with_deadline("find_session", Duration::from_secs(3), fast).await;
        assert_eq!(result.unwrap(), 7);
    }
}
