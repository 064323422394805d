//! Wire protocol for the WebSocket gateway.
//!
//! Frames are JSON text messages tagged with a `"type"` field, camelCase
//! throughout. Inbound frames deserialize strictly except where the protocol
//! is deliberately lenient: `registerUser.rating` accepts any JSON value and
//! falls back to `0`, while `submitFeedback.finalMood`/`ratingGiven` are
//! carried as raw values so the lifecycle layer can reject non-numeric input
//! with a specific reason instead of a generic parse failure.

use common::types::ConnectionId;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Participant role: heroes consume (and are billed for) sessions,
/// uplifters provide them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Hero,
    Uplifter,
}

impl Role {
    /// Wire string, also used as a log/metrics label.
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Hero => "hero",
            Role::Uplifter => "uplifter",
        }
    }
}

/// Presence shown in roster snapshots.
///
/// This controller never writes `Offline` (entries are removed on
/// disconnect); the variant exists because snapshot consumers share the
/// vocabulary with surfaces that do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Presence {
    Online,
    Busy,
    Offline,
}

impl Presence {
    /// Wire string, also used as a log/metrics label.
    pub fn as_str(&self) -> &'static str {
        match self {
            Presence::Online => "online",
            Presence::Busy => "busy",
            Presence::Offline => "offline",
        }
    }
}

/// Inbound client frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientEvent {
    #[serde(rename_all = "camelCase")]
    RegisterUser {
        #[serde(default)]
        username: String,
        #[serde(default)]
        user_id: String,
        role: Role,
        /// Any JSON value; non-numeric input means "no rating yet".
        #[serde(default)]
        rating: Value,
        #[serde(default)]
        avatar: String,
    },
    #[serde(rename_all = "camelCase")]
    RequestCall {
        caller_name: String,
        room_id: String,
        callee_connection_id: ConnectionId,
        #[serde(default)]
        initial_mood: f64,
    },
    #[serde(rename_all = "camelCase")]
    AcceptCall { caller_connection_id: ConnectionId },
    #[serde(rename_all = "camelCase")]
    EndCall { peer_connection_id: ConnectionId },
    #[serde(rename_all = "camelCase")]
    DeclineCall { peer_connection_id: ConnectionId },
    #[serde(rename_all = "camelCase")]
    SubmitFeedback {
        #[serde(default)]
        final_mood: Value,
        #[serde(default)]
        feedback_text: String,
        #[serde(default)]
        inappropriate: bool,
        #[serde(default)]
        rating_given: Value,
    },
}

impl ClientEvent {
    /// The frame's wire tag, used as an event label in logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            ClientEvent::RegisterUser { .. } => "registerUser",
            ClientEvent::RequestCall { .. } => "requestCall",
            ClientEvent::AcceptCall { .. } => "acceptCall",
            ClientEvent::EndCall { .. } => "endCall",
            ClientEvent::DeclineCall { .. } => "declineCall",
            ClientEvent::SubmitFeedback { .. } => "submitFeedback",
        }
    }
}

/// Outbound server frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerEvent {
    #[serde(rename_all = "camelCase")]
    IncomingCall {
        caller_name: String,
        room_id: String,
        caller_connection_id: ConnectionId,
    },
    #[serde(rename_all = "camelCase")]
    CallError { reason: String },
    CallAccepted,
    CallEnded,
    CallDeclined,
    FeedbackAccepted,
    ReenterQueue,
    #[serde(rename_all = "camelCase")]
    ValidationError { reason: String },
    #[serde(rename_all = "camelCase")]
    PresenceSnapshot {
        participants: Vec<ParticipantInfo>,
        online_count: usize,
        active_call_count: usize,
    },
}

impl ServerEvent {
    /// The frame's wire tag, used as a frame label in logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            ServerEvent::IncomingCall { .. } => "incomingCall",
            ServerEvent::CallError { .. } => "callError",
            ServerEvent::CallAccepted => "callAccepted",
            ServerEvent::CallEnded => "callEnded",
            ServerEvent::CallDeclined => "callDeclined",
            ServerEvent::FeedbackAccepted => "feedbackAccepted",
            ServerEvent::ReenterQueue => "reenterQueue",
            ServerEvent::ValidationError { .. } => "validationError",
            ServerEvent::PresenceSnapshot { .. } => "presenceSnapshot",
        }
    }
}

/// Roster entry in a presence snapshot.
///
/// Identity on the wire is the anonymous display identity; durable user ids
/// never leave the controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantInfo {
    pub connection_id: ConnectionId,
    pub username: String,
    pub role: Role,
    pub rating: f64,
    pub avatar: String,
    pub presence: Presence,
}

/// Read a loosely typed client field as a number.
///
/// JSON strings are not coerced: `"4"` is non-numeric here.
pub fn numeric_field(value: &Value) -> Option<f64> {
    value.as_f64()
}
