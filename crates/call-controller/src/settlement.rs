//! Session settlement and billing.
//!
//! Every call-ending trigger funnels here exactly once per session: the
//! guarded status transition in the session store decides the winner, then
//! billable outcomes deduct at most one unit from the hero's subscription
//! and feedback outcomes update the uplifter's public aggregates.
//!
//! Failures after the session row has settled (deduction, profile write) are
//! logged and non-fatal: the session stays settled and the call teardown
//! that already happened in memory stands.

use crate::errors::CcError;
use crate::observability::metrics;
use crate::store::{
    with_deadline, ProfileStore, SessionRecord, SessionStatus, SessionStore, SettleUpdate,
    SettleWrite, SubscriptionStore,
};
use chrono::Utc;
use common::types::{SessionId, UserId};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};

/// Feedback text stamped on sessions that complete without a submitted form
/// (explicit end, connected-disconnect, ceiling expiry).
pub const SYSTEM_FEEDBACK_TEXT: &str = "call ended without feedback";

/// How a session ended.
#[derive(Debug, Clone)]
pub enum SettlementOutcome {
    /// The hero submitted the feedback form. Billable; settles from
    /// `Ongoing` or `Pending`.
    Feedback {
        final_mood: f64,
        feedback_text: String,
        rating_given: f64,
        inappropriate: bool,
    },
    /// The call completed without feedback. Billable; outcome fields are
    /// synthesized (final mood carries the initial mood).
    Ended,
    /// The call never came to be (decline, pre-accept disconnect, aborted
    /// setup). Never billable.
    Declined,
}

/// Which subscription leg paid for the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Deduction {
    Weekly,
    Bundle,
    None,
}

impl Deduction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Deduction::Weekly => "weekly",
            Deduction::Bundle => "bundle",
            Deduction::None => "none",
        }
    }
}

/// Everything settlement needs to know about one ending call.
#[derive(Debug, Clone)]
pub struct SettlementRequest {
    pub session_id: SessionId,
    pub hero_user_id: UserId,
    pub uplifter_user_id: UserId,
    pub outcome: SettlementOutcome,
}

/// What a winning settlement did.
#[derive(Debug, Clone)]
pub struct SettlementReceipt {
    pub session: SessionRecord,
    pub deduction: Deduction,
    pub new_uplifter_rating: Option<f64>,
}

/// Result of a settlement attempt.
#[derive(Debug, Clone)]
pub enum SettlementResult {
    /// This trigger won the race and the session is now terminal.
    Settled(SettlementReceipt),
    /// Another trigger settled the session first.
    AlreadySettled(SessionStatus),
    /// The session record does not exist.
    NotFound,
}

/// A first rating stands as-is; later ratings average against the current
/// aggregate and round to the nearest whole value.
pub fn aggregate_rating(prior: f64, given: f64) -> f64 {
    if prior > 0.0 {
        ((prior + given) / 2.0).round()
    } else {
        given
    }
}

/// Settles sessions against the durable stores.
pub struct SettlementService {
    sessions: Arc<dyn SessionStore>,
    subscriptions: Arc<dyn SubscriptionStore>,
    profiles: Arc<dyn ProfileStore>,
    store_timeout: Duration,
}

impl SettlementService {
    pub fn new(
        sessions: Arc<dyn SessionStore>,
        subscriptions: Arc<dyn SubscriptionStore>,
        profiles: Arc<dyn ProfileStore>,
        store_timeout: Duration,
    ) -> Self {
        Self {
            sessions,
            subscriptions,
            profiles,
            store_timeout,
        }
    }

    /// Settle one session.
    ///
    /// Returns an error only when the guarded status transition itself could
    /// not be performed; everything after that point is non-fatal.
    #[instrument(skip_all, name = "cc.settlement.settle", fields(session_id = %request.session_id))]
    pub async fn settle(&self, request: SettlementRequest) -> Result<SettlementResult, CcError> {
        let ended_at = Utc::now();

        let (allowed_from, update, billable, feedback): (
            &[SessionStatus],
            SettleUpdate,
            bool,
            Option<(f64, bool)>,
        ) = match &request.outcome {
            SettlementOutcome::Feedback {
                final_mood,
                feedback_text,
                rating_given,
                inappropriate,
            } => (
                &[SessionStatus::Ongoing, SessionStatus::Pending],
                SettleUpdate {
                    status: SessionStatus::Completed,
                    ended_at,
                    final_mood: Some(*final_mood),
                    feedback_text: Some(feedback_text.clone()),
                    rating_given: Some(*rating_given),
                    inappropriate_flag: *inappropriate,
                },
                true,
                Some((*rating_given, *inappropriate)),
            ),
            SettlementOutcome::Ended => {
                // Synthesize the outcome fields: the final mood carries the
                // session's initial mood, and the rating is a literal zero
                // rather than absent.
                let record = with_deadline(
                    "find_session",
                    self.store_timeout,
                    self.sessions.find_session(request.session_id),
                )
                .await?;
                let Some(record) = record else {
                    warn!(target: "cc.settlement", "session missing at settlement");
                    metrics::record_settlement("not_found", Deduction::None.as_str());
                    return Ok(SettlementResult::NotFound);
                };
                (
                    &[SessionStatus::Ongoing],
                    SettleUpdate {
                        status: SessionStatus::Completed,
                        ended_at,
                        final_mood: Some(record.initial_mood),
                        feedback_text: Some(SYSTEM_FEEDBACK_TEXT.to_string()),
                        rating_given: Some(0.0),
                        inappropriate_flag: false,
                    },
                    true,
                    None,
                )
            }
            SettlementOutcome::Declined => (
                &[SessionStatus::Ongoing],
                SettleUpdate {
                    status: SessionStatus::Declined,
                    ended_at,
                    final_mood: None,
                    feedback_text: None,
                    rating_given: None,
                    inappropriate_flag: false,
                },
                false,
                None,
            ),
        };
        let outcome_label = update.status.as_str();

        let write = with_deadline(
            "settle_session",
            self.store_timeout,
            self.sessions
                .settle_session(request.session_id, allowed_from, update),
        )
        .await?;

        let record = match write {
            SettleWrite::Applied(record) => record,
            SettleWrite::AlreadySettled(status) => {
                debug!(
                    target: "cc.settlement",
                    status = status.as_str(),
                    "settlement lost the race; session already terminal"
                );
                metrics::record_settlement("already_settled", Deduction::None.as_str());
                return Ok(SettlementResult::AlreadySettled(status));
            }
            SettleWrite::NotFound => {
                warn!(target: "cc.settlement", "session missing at settlement");
                metrics::record_settlement("not_found", Deduction::None.as_str());
                return Ok(SettlementResult::NotFound);
            }
        };

        // The session row is terminal; from here on nothing may undo it.
        let deduction = if billable {
            match self.deduct_one(&request.hero_user_id).await {
                Ok(deduction) => deduction,
                Err(e) => {
                    error!(
                        target: "cc.settlement",
                        error = %e,
                        hero_user_id = %request.hero_user_id,
                        "deduction failed after session settled; not retried"
                    );
                    Deduction::None
                }
            }
        } else {
            Deduction::None
        };

        let new_uplifter_rating = match feedback {
            Some((rating_given, inappropriate)) => {
                match self
                    .apply_uplifter_feedback(&request.uplifter_user_id, rating_given, inappropriate)
                    .await
                {
                    Ok(new_rating) => new_rating,
                    Err(e) => {
                        error!(
                            target: "cc.settlement",
                            error = %e,
                            uplifter_user_id = %request.uplifter_user_id,
                            "profile update failed after session settled; not retried"
                        );
                        None
                    }
                }
            }
            None => None,
        };

        info!(
            target: "cc.settlement",
            status = outcome_label,
            duration_secs = record.duration_secs,
            deduction = deduction.as_str(),
            "session settled"
        );
        metrics::record_settlement(outcome_label, deduction.as_str());

        Ok(SettlementResult::Settled(SettlementReceipt {
            session: record,
            deduction,
            new_uplifter_rating,
        }))
    }

    /// Take at most one unit from the hero's subscription.
    ///
    /// Precedence: a weekly plan with a live window and balance first, the
    /// bundle balance second, nothing third. A missing subscription row is a
    /// normal outcome, not an error.
    async fn deduct_one(&self, user_id: &UserId) -> Result<Deduction, CcError> {
        let subscription = with_deadline(
            "find_subscription",
            self.store_timeout,
            self.subscriptions.find_subscription(user_id),
        )
        .await?;
        let Some(subscription) = subscription else {
            debug!(
                target: "cc.settlement",
                user_id = %user_id,
                "no subscription row; session not billed"
            );
            return Ok(Deduction::None);
        };

        let now = Utc::now();
        let weekly_live = subscription.weekly_expires_at.is_some_and(|t| t > now)
            && subscription.weekly_balance >= 1;
        if weekly_live {
            // The unlimited flag does not skip the decrement; the counter
            // tracks usage on every weekly plan.
            let taken = with_deadline(
                "deduct_weekly",
                self.store_timeout,
                self.subscriptions.deduct_weekly(user_id),
            )
            .await?;
            if taken {
                return Ok(Deduction::Weekly);
            }
        }

        if subscription.bundle_balance >= 1 {
            let taken = with_deadline(
                "deduct_bundle",
                self.store_timeout,
                self.subscriptions.deduct_bundle(user_id),
            )
            .await?;
            if taken {
                return Ok(Deduction::Bundle);
            }
        }

        Ok(Deduction::None)
    }

    /// Fold a submitted rating into the uplifter's aggregate and bump the
    /// flag count for inappropriate sessions.
    async fn apply_uplifter_feedback(
        &self,
        user_id: &UserId,
        rating_given: f64,
        inappropriate: bool,
    ) -> Result<Option<f64>, CcError> {
        let profile = with_deadline(
            "find_profile",
            self.store_timeout,
            self.profiles.find_profile(user_id),
        )
        .await?;
        let Some(profile) = profile else {
            debug!(
                target: "cc.settlement",
                user_id = %user_id,
                "no profile row; skipping rating aggregate"
            );
            return Ok(None);
        };

        let new_rating = aggregate_rating(profile.rating, rating_given);
        with_deadline(
            "apply_feedback",
            self.store_timeout,
            self.profiles.apply_feedback(user_id, new_rating, inappropriate),
        )
        .await?;
        Ok(Some(new_rating))
    }
}
