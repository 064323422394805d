//! In-memory store implementations.
//!
//! Fixtures for tests and local runs. They enforce the same guarded-write
//! semantics as the Postgres implementations and add failure injection and
//! call counters so lifecycle tests can drive the unhappy paths.

use super::{
    ProfileRecord, ProfileStore, SessionRecord, SessionStatus, SessionStore, SettleUpdate,
    SettleWrite, SubscriptionRecord, SubscriptionStore,
};
use crate::errors::CcError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::types::{SessionId, UserId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;

fn injected_failure() -> CcError {
    CcError::Store(sqlx::Error::PoolClosed)
}

/// In-memory [`SessionStore`].
#[derive(Default)]
pub struct MemorySessionStore {
    sessions: Mutex<HashMap<SessionId, SessionRecord>>,
    create_calls: AtomicUsize,
    settle_calls: AtomicUsize,
    fail_creates: AtomicBool,
    fail_settles: AtomicBool,
    create_delay: Mutex<Option<Duration>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent creates fail, simulating a store outage.
    pub fn set_fail_creates(&self, fail: bool) {
        self.fail_creates.store(fail, Ordering::SeqCst);
    }

    /// Make subsequent settles fail.
    pub fn set_fail_settles(&self, fail: bool) {
        self.fail_settles.store(fail, Ordering::SeqCst);
    }

    /// Delay creates by `delay`, for driving deadline behavior under a
    /// paused clock.
    pub async fn set_create_delay(&self, delay: Duration) {
        *self.create_delay.lock().await = Some(delay);
    }

    /// Seed a record directly.
    pub async fn insert(&self, record: SessionRecord) {
        self.sessions.lock().await.insert(record.session_id, record);
    }

    /// Current copy of a record, if present.
    pub async fn session(&self, session_id: SessionId) -> Option<SessionRecord> {
        self.sessions.lock().await.get(&session_id).cloned()
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.lock().await.len()
    }

    pub fn create_calls(&self) -> usize {
        self.create_calls.load(Ordering::SeqCst)
    }

    pub fn settle_calls(&self) -> usize {
        self.settle_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn create_session(
        &self,
        hero_user_id: &UserId,
        uplifter_user_id: &UserId,
        initial_mood: f64,
        started_at: DateTime<Utc>,
    ) -> Result<SessionId, CcError> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);

        let delay = *self.create_delay.lock().await;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_creates.load(Ordering::SeqCst) {
            return Err(injected_failure());
        }

        let record = SessionRecord {
            session_id: SessionId::new(),
            hero_user_id: hero_user_id.clone(),
            uplifter_user_id: uplifter_user_id.clone(),
            initial_mood,
            final_mood: None,
            feedback_text: None,
            rating_given: None,
            inappropriate_flag: false,
            status: SessionStatus::Ongoing,
            started_at,
            ended_at: None,
            duration_secs: None,
        };
        let session_id = record.session_id;
        self.sessions.lock().await.insert(session_id, record);
        Ok(session_id)
    }

    async fn find_session(
        &self,
        session_id: SessionId,
    ) -> Result<Option<SessionRecord>, CcError> {
        Ok(self.sessions.lock().await.get(&session_id).cloned())
    }

    async fn settle_session(
        &self,
        session_id: SessionId,
        allowed_from: &[SessionStatus],
        update: SettleUpdate,
    ) -> Result<SettleWrite, CcError> {
        self.settle_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_settles.load(Ordering::SeqCst) {
            return Err(injected_failure());
        }

        let mut sessions = self.sessions.lock().await;
        let Some(record) = sessions.get_mut(&session_id) else {
            return Ok(SettleWrite::NotFound);
        };
        if !allowed_from.contains(&record.status) {
            return Ok(SettleWrite::AlreadySettled(record.status));
        }

        record.status = update.status;
        record.ended_at = Some(update.ended_at);
        record.duration_secs = Some((update.ended_at - record.started_at).num_seconds());
        record.final_mood = update.final_mood;
        record.feedback_text = update.feedback_text;
        record.rating_given = update.rating_given;
        record.inappropriate_flag = update.inappropriate_flag;
        Ok(SettleWrite::Applied(record.clone()))
    }
}

/// In-memory [`SubscriptionStore`].
#[derive(Default)]
pub struct MemorySubscriptionStore {
    subscriptions: Mutex<HashMap<UserId, SubscriptionRecord>>,
    fail_deductions: AtomicBool,
}

impl MemorySubscriptionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style seeding for fixtures.
    pub fn with_subscription(record: SubscriptionRecord) -> Self {
        let store = Self::default();
        if let Ok(mut subscriptions) = store.subscriptions.try_lock() {
            subscriptions.insert(record.user_id.clone(), record);
        }
        store
    }

    pub async fn insert(&self, record: SubscriptionRecord) {
        self.subscriptions
            .lock()
            .await
            .insert(record.user_id.clone(), record);
    }

    /// Current copy of a subscription, if present.
    pub async fn subscription(&self, user_id: &UserId) -> Option<SubscriptionRecord> {
        self.subscriptions.lock().await.get(user_id).cloned()
    }

    /// Make subsequent deductions fail.
    pub fn set_fail_deductions(&self, fail: bool) {
        self.fail_deductions.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl SubscriptionStore for MemorySubscriptionStore {
    async fn find_subscription(
        &self,
        user_id: &UserId,
    ) -> Result<Option<SubscriptionRecord>, CcError> {
        Ok(self.subscriptions.lock().await.get(user_id).cloned())
    }

    async fn deduct_weekly(&self, user_id: &UserId) -> Result<bool, CcError> {
        if self.fail_deductions.load(Ordering::SeqCst) {
            return Err(injected_failure());
        }
        let mut subscriptions = self.subscriptions.lock().await;
        let Some(record) = subscriptions.get_mut(user_id) else {
            return Ok(false);
        };
        let window_live = record.weekly_expires_at.is_some_and(|t| t > Utc::now());
        if window_live && record.weekly_balance >= 1 {
            record.weekly_balance -= 1;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn deduct_bundle(&self, user_id: &UserId) -> Result<bool, CcError> {
        if self.fail_deductions.load(Ordering::SeqCst) {
            return Err(injected_failure());
        }
        let mut subscriptions = self.subscriptions.lock().await;
        let Some(record) = subscriptions.get_mut(user_id) else {
            return Ok(false);
        };
        if record.bundle_balance >= 1 {
            record.bundle_balance -= 1;
            Ok(true)
        } else {
            Ok(false)
        }
    }
}

/// In-memory [`ProfileStore`].
#[derive(Default)]
pub struct MemoryProfileStore {
    profiles: Mutex<HashMap<UserId, ProfileRecord>>,
}

impl MemoryProfileStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style seeding for fixtures.
    pub fn with_profile(record: ProfileRecord) -> Self {
        let store = Self::default();
        if let Ok(mut profiles) = store.profiles.try_lock() {
            profiles.insert(record.user_id.clone(), record);
        }
        store
    }

    pub async fn insert(&self, record: ProfileRecord) {
        self.profiles
            .lock()
            .await
            .insert(record.user_id.clone(), record);
    }

    /// Current copy of a profile, if present.
    pub async fn profile(&self, user_id: &UserId) -> Option<ProfileRecord> {
        self.profiles.lock().await.get(user_id).cloned()
    }
}

#[async_trait]
impl ProfileStore for MemoryProfileStore {
    async fn find_profile(&self, user_id: &UserId) -> Result<Option<ProfileRecord>, CcError> {
        Ok(self.profiles.lock().await.get(user_id).cloned())
    }

    async fn apply_feedback(
        &self,
        user_id: &UserId,
        rating: f64,
        flag_inappropriate: bool,
    ) -> Result<(), CcError> {
        let mut profiles = self.profiles.lock().await;
        if let Some(record) = profiles.get_mut(user_id) {
            record.rating = rating;
            if flag_inappropriate {
                record.flag_count += 1;
            }
        }
        Ok(())
    }
}
