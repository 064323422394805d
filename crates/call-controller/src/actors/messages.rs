//! Message types for the registry actor.
//!
//! Inbound operations carry a `respond_to` oneshot when the caller needs the
//! outcome; rejoin messages (`SessionCreated`, `FeedbackSettled`,
//! `CallExpired`) are sent by tasks the actor spawned and close the loop on
//! durable I/O without blocking the mailbox.

use crate::actors::connection::ConnectionActorHandle;
use crate::errors::CcError;
use crate::events::{Presence, Role};
use crate::settlement::SettlementResult;
use common::types::{CallId, ConnectionId, SessionId, UserId};
use tokio::sync::oneshot;

/// How a participant relates to their call peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PeerState {
    /// No call in progress.
    #[default]
    Disconnected,
    /// Call requested, not yet accepted.
    Connecting,
    /// Call accepted and live.
    Connected,
}

/// Live call table entry status.
///
/// There is no `Ended`: ending a call removes the entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallStatus {
    /// Requested, awaiting accept.
    Initiating,
    /// Accepted and live.
    Connected,
}

impl CallStatus {
    /// Log label.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            CallStatus::Initiating => "initiating",
            CallStatus::Connected => "connected",
        }
    }
}

/// A `registerUser` payload after gateway-side defaulting.
///
/// `user_id` is kept raw: the registry rejects a blank value with a
/// validation error frame instead of creating a roster entry.
#[derive(Debug, Clone)]
pub struct Registration {
    pub username: String,
    pub user_id: String,
    pub role: Role,
    pub rating: f64,
    pub avatar: String,
}

/// A `requestCall` payload.
#[derive(Debug, Clone)]
pub struct CallRequest {
    pub caller_name: String,
    pub room_id: String,
    pub callee: ConnectionId,
    pub initial_mood: f64,
}

/// A `submitFeedback` payload after numeric validation.
#[derive(Debug, Clone)]
pub struct FeedbackSubmission {
    pub final_mood: f64,
    pub feedback_text: String,
    pub rating_given: f64,
    pub inappropriate: bool,
}

/// Messages handled by the registry actor.
#[derive(Debug)]
pub enum RegistryMessage {
    /// A socket opened; the registry takes custody of its outbound link.
    Attach { link: ConnectionActorHandle },

    /// `registerUser`. Fire-and-forget: validation failures come back as
    /// frames on the sender's own connection.
    Register {
        connection_id: ConnectionId,
        registration: Registration,
    },

    /// `requestCall`. Precondition failures come back through `respond_to`;
    /// the ring itself is delivered later, once the session row exists.
    RequestCall {
        caller: ConnectionId,
        request: CallRequest,
        respond_to: oneshot::Sender<Result<(), CcError>>,
    },

    /// `acceptCall`, resolved from the sender's own active call.
    AcceptCall {
        connection_id: ConnectionId,
        respond_to: oneshot::Sender<Result<(), CcError>>,
    },

    /// `endCall`, resolved from the sender's own active call.
    EndCall {
        connection_id: ConnectionId,
        respond_to: oneshot::Sender<Result<(), CcError>>,
    },

    /// `declineCall`, valid from either party while the call still rings.
    DeclineCall {
        connection_id: ConnectionId,
        respond_to: oneshot::Sender<Result<(), CcError>>,
    },

    /// `submitFeedback`. `Ok(())` means the settlement was spawned; its
    /// outcome arrives as frames on the submitter's connection.
    SubmitFeedback {
        connection_id: ConnectionId,
        feedback: FeedbackSubmission,
        respond_to: oneshot::Sender<Result<(), CcError>>,
    },

    /// The socket closed (or its outbound actor died).
    Disconnect { connection_id: ConnectionId },

    /// Rejoin: outcome of the durable session create spawned by
    /// `RequestCall`. Carries the party ids so an orphaned create (entry
    /// torn down mid-write) can still be settled.
    SessionCreated {
        call_id: CallId,
        hero_user_id: UserId,
        uplifter_user_id: UserId,
        result: Result<SessionId, CcError>,
    },

    /// Rejoin: outcome of a feedback settlement spawned by
    /// `SubmitFeedback`.
    FeedbackSettled {
        connection_id: ConnectionId,
        call_id: CallId,
        result: Result<SettlementResult, CcError>,
    },

    /// Rejoin: a call reached its ceiling. A late fire after teardown is a
    /// no-op.
    CallExpired { call_id: CallId },

    /// Snapshot of registry state, for tests and diagnostics.
    GetState {
        respond_to: oneshot::Sender<RegistryState>,
    },
}

/// One participant's full registry entry.
#[derive(Debug, Clone)]
pub struct ParticipantState {
    pub connection_id: ConnectionId,
    pub user_id: UserId,
    pub username: String,
    pub role: Role,
    pub rating: f64,
    pub avatar: String,
    pub presence: Presence,
    pub peer_state: PeerState,
    pub active_call: Option<CallId>,
}

/// One live call table entry.
#[derive(Debug, Clone)]
pub struct CallState {
    pub call_id: CallId,
    pub caller: ConnectionId,
    pub callee: ConnectionId,
    pub status: CallStatus,
    pub session_id: Option<SessionId>,
}

/// Point-in-time view of the registry.
#[derive(Debug, Clone)]
pub struct RegistryState {
    pub participants: Vec<ParticipantState>,
    pub calls: Vec<CallState>,
    pub online_count: usize,
    pub active_call_count: usize,
}

impl RegistryState {
    /// Find a participant entry by connection id.
    #[must_use]
    pub fn participant(&self, connection_id: ConnectionId) -> Option<&ParticipantState> {
        self.participants
            .iter()
            .find(|p| p.connection_id == connection_id)
    }
}
