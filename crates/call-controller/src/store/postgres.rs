//! Postgres store implementations.
//!
//! All queries are parameterized statements; the settle and deduct paths are
//! single guarded UPDATEs so concurrent writers race on the database row, not
//! on application state.
//!
//! Expected schema (provisioned by deployment tooling):
//!
//! ```sql
//! CREATE TABLE call_sessions (
//!     session_id         UUID PRIMARY KEY,
//!     hero_user_id       TEXT NOT NULL,
//!     uplifter_user_id   TEXT NOT NULL,
//!     initial_mood       DOUBLE PRECISION NOT NULL,
//!     final_mood         DOUBLE PRECISION,
//!     feedback_text      TEXT,
//!     rating_given       DOUBLE PRECISION,
//!     inappropriate_flag BOOLEAN NOT NULL DEFAULT FALSE,
//!     status             TEXT NOT NULL,
//!     started_at         TIMESTAMPTZ NOT NULL,
//!     ended_at           TIMESTAMPTZ,
//!     duration_secs      BIGINT
//! );
//!
//! CREATE TABLE subscriptions (
//!     user_id           TEXT PRIMARY KEY,
//!     weekly_balance    BIGINT NOT NULL DEFAULT 0,
//!     weekly_expires_at TIMESTAMPTZ,
//!     weekly_unlimited  BOOLEAN NOT NULL DEFAULT FALSE,
//!     bundle_balance    BIGINT NOT NULL DEFAULT 0
//! );
//!
//! CREATE TABLE uplifter_profiles (
//!     user_id    TEXT PRIMARY KEY,
//!     rating     DOUBLE PRECISION NOT NULL DEFAULT 0,
//!     flag_count BIGINT NOT NULL DEFAULT 0
//! );
//! ```

use super::{
    ProfileRecord, ProfileStore, SessionRecord, SessionStatus, SessionStore, SettleUpdate,
    SettleWrite, SubscriptionRecord, SubscriptionStore,
};
use crate::errors::CcError;
use crate::observability::metrics;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::types::{SessionId, UserId};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use std::time::Instant;
use tracing::instrument;
use uuid::Uuid;

const SESSION_COLUMNS: &str = "session_id, hero_user_id, uplifter_user_id, initial_mood, \
     final_mood, feedback_text, rating_given, inappropriate_flag, status, \
     started_at, ended_at, duration_secs";

fn observe<T>(operation: &'static str, result: &Result<T, sqlx::Error>, start: Instant) {
    let status = if result.is_ok() { "success" } else { "error" };
    metrics::record_store_query(operation, status, start.elapsed());
}

fn map_session_row(row: &PgRow) -> Result<SessionRecord, CcError> {
    let status_raw: String = row.try_get("status")?;
    let status = SessionStatus::parse(&status_raw)
        .ok_or_else(|| CcError::Internal(format!("unknown session status in store: {status_raw}")))?;

    Ok(SessionRecord {
        session_id: SessionId(row.try_get::<Uuid, _>("session_id")?),
        hero_user_id: UserId::new(row.try_get::<String, _>("hero_user_id")?),
        uplifter_user_id: UserId::new(row.try_get::<String, _>("uplifter_user_id")?),
        initial_mood: row.try_get("initial_mood")?,
        final_mood: row.try_get("final_mood")?,
        feedback_text: row.try_get("feedback_text")?,
        rating_given: row.try_get("rating_given")?,
        inappropriate_flag: row.try_get("inappropriate_flag")?,
        status,
        started_at: row.try_get("started_at")?,
        ended_at: row.try_get("ended_at")?,
        duration_secs: row.try_get("duration_secs")?,
    })
}

/// Postgres-backed [`SessionStore`].
pub struct PostgresSessionStore {
    pool: PgPool,
}

impl PostgresSessionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SessionStore for PostgresSessionStore {
    #[instrument(skip_all, name = "cc.store.create_session")]
    async fn create_session(
        &self,
        hero_user_id: &UserId,
        uplifter_user_id: &UserId,
        initial_mood: f64,
        started_at: DateTime<Utc>,
    ) -> Result<SessionId, CcError> {
        let session_id = SessionId::new();
        let start = Instant::now();

        let result = sqlx::query(
            r#"
            INSERT INTO call_sessions (
                session_id, hero_user_id, uplifter_user_id,
                initial_mood, status, started_at
            )
            VALUES ($1, $2, $3, $4, 'ongoing', $5)
            "#,
        )
        .bind(session_id.0) // $1
        .bind(hero_user_id.as_str()) // $2
        .bind(uplifter_user_id.as_str()) // $3
        .bind(initial_mood) // $4
        .bind(started_at) // $5
        .execute(&self.pool)
        .await;

        observe("create_session", &result, start);
        result?;
        Ok(session_id)
    }

    #[instrument(skip_all, name = "cc.store.find_session")]
    async fn find_session(
        &self,
        session_id: SessionId,
    ) -> Result<Option<SessionRecord>, CcError> {
        let start = Instant::now();

        let sql = format!("SELECT {SESSION_COLUMNS} FROM call_sessions WHERE session_id = $1");
        let result = sqlx::query(&sql)
            .bind(session_id.0)
            .fetch_optional(&self.pool)
            .await;

        observe("find_session", &result, start);
        result?.as_ref().map(map_session_row).transpose()
    }

    #[instrument(skip_all, name = "cc.store.settle_session")]
    async fn settle_session(
        &self,
        session_id: SessionId,
        allowed_from: &[SessionStatus],
        update: SettleUpdate,
    ) -> Result<SettleWrite, CcError> {
        let allowed: Vec<String> = allowed_from.iter().map(|s| s.as_str().to_string()).collect();
        let start = Instant::now();

        // Guarded transition: the WHERE clause is the settlement CAS. Duration
        // is derived from the persisted started_at in the same statement.
        let sql = format!(
            r#"
            UPDATE call_sessions
            SET status = $2,
                ended_at = $3,
                duration_secs = FLOOR(EXTRACT(EPOCH FROM ($3 - started_at)))::BIGINT,
                final_mood = $4,
                feedback_text = $5,
                rating_given = $6,
                inappropriate_flag = $7
            WHERE session_id = $1 AND status = ANY($8)
            RETURNING {SESSION_COLUMNS}
            "#
        );
        let result = sqlx::query(&sql)
            .bind(session_id.0) // $1
            .bind(update.status.as_str()) // $2
            .bind(update.ended_at) // $3
            .bind(update.final_mood) // $4
            .bind(update.feedback_text.as_deref()) // $5
            .bind(update.rating_given) // $6
            .bind(update.inappropriate_flag) // $7
            .bind(allowed) // $8
            .fetch_optional(&self.pool)
            .await;

        observe("settle_session", &result, start);

        if let Some(row) = result? {
            return Ok(SettleWrite::Applied(map_session_row(&row)?));
        }

        // Guard did not match; tell a lost race apart from a missing row.
        match self.find_session(session_id).await? {
            Some(record) => Ok(SettleWrite::AlreadySettled(record.status)),
            None => Ok(SettleWrite::NotFound),
        }
    }
}

/// Postgres-backed [`SubscriptionStore`].
pub struct PostgresSubscriptionStore {
    pool: PgPool,
}

impl PostgresSubscriptionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SubscriptionStore for PostgresSubscriptionStore {
    #[instrument(skip_all, name = "cc.store.find_subscription")]
    async fn find_subscription(
        &self,
        user_id: &UserId,
    ) -> Result<Option<SubscriptionRecord>, CcError> {
        let start = Instant::now();

        let result = sqlx::query(
            r#"
            SELECT user_id, weekly_balance, weekly_expires_at, weekly_unlimited, bundle_balance
            FROM subscriptions
            WHERE user_id = $1
            "#,
        )
        .bind(user_id.as_str())
        .fetch_optional(&self.pool)
        .await;

        observe("find_subscription", &result, start);

        let Some(row) = result? else {
            return Ok(None);
        };
        Ok(Some(SubscriptionRecord {
            user_id: UserId::new(row.try_get::<String, _>("user_id")?),
            weekly_balance: row.try_get("weekly_balance")?,
            weekly_expires_at: row.try_get("weekly_expires_at")?,
            weekly_unlimited: row.try_get("weekly_unlimited")?,
            bundle_balance: row.try_get("bundle_balance")?,
        }))
    }

    #[instrument(skip_all, name = "cc.store.deduct_weekly")]
    async fn deduct_weekly(&self, user_id: &UserId) -> Result<bool, CcError> {
        let start = Instant::now();

        // The guard re-checks balance and window so a stale read can
        // never push the balance below zero.
        let result = sqlx::query(
            r#"
            UPDATE subscriptions
            SET weekly_balance = weekly_balance - 1
            WHERE user_id = $1 AND weekly_balance >= 1 AND weekly_expires_at > NOW()
            "#,
        )
        .bind(user_id.as_str())
        .execute(&self.pool)
        .await;

        observe("deduct_weekly", &result, start);
        Ok(result?.rows_affected() == 1)
    }

    #[instrument(skip_all, name = "cc.store.deduct_bundle")]
    async fn deduct_bundle(&self, user_id: &UserId) -> Result<bool, CcError> {
        let start = Instant::now();

        let result = sqlx::query(
            r#"
            UPDATE subscriptions
            SET bundle_balance = bundle_balance - 1
            WHERE user_id = $1 AND bundle_balance >= 1
            "#,
        )
        .bind(user_id.as_str())
        .execute(&self.pool)
        .await;

        observe("deduct_bundle", &result, start);
        Ok(result?.rows_affected() == 1)
    }
}

/// Postgres-backed [`ProfileStore`].
pub struct PostgresProfileStore {
    pool: PgPool,
}

impl PostgresProfileStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ProfileStore for PostgresProfileStore {
    #[instrument(skip_all, name = "cc.store.find_profile")]
    async fn find_profile(&self, user_id: &UserId) -> Result<Option<ProfileRecord>, CcError> {
        let start = Instant::now();

        let result = sqlx::query(
            "SELECT user_id, rating, flag_count FROM uplifter_profiles WHERE user_id = $1",
        )
        .bind(user_id.as_str())
        .fetch_optional(&self.pool)
        .await;

        observe("find_profile", &result, start);

        let Some(row) = result? else {
            return Ok(None);
        };
        Ok(Some(ProfileRecord {
            user_id: UserId::new(row.try_get::<String, _>("user_id")?),
            rating: row.try_get("rating")?,
            flag_count: row.try_get("flag_count")?,
        }))
    }

    #[instrument(skip_all, name = "cc.store.apply_feedback")]
    async fn apply_feedback(
        &self,
        user_id: &UserId,
        rating: f64,
        flag_inappropriate: bool,
    ) -> Result<(), CcError> {
        let start = Instant::now();

        let result = sqlx::query(
            r#"
            UPDATE uplifter_profiles
            SET rating = $2,
                flag_count = flag_count + CASE WHEN $3 THEN 1 ELSE 0 END
            WHERE user_id = $1
            "#,
        )
        .bind(user_id.as_str()) // $1
        .bind(rating) // $2
        .bind(flag_inappropriate) // $3
        .execute(&self.pool)
        .await;

        observe("apply_feedback", &result, start);

        let outcome = result?;
        if outcome.rows_affected() == 0 {
            tracing::debug!(
                target: "cc.store.postgres",
                user_id = %user_id,
                "no profile row to update; skipping feedback aggregate"
            );
        }
        Ok(())
    }
}
