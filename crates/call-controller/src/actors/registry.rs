//! `RegistryActor` - the single writer for all live call-controller state.
//!
//! The registry owns:
//! - the link table: every attached socket's outbound mailbox handle
//! - the participant roster keyed by connection id, plus the user index
//! - the live call table and each call's expiry timer
//!
//! Every inbound operation mutates this state on the actor, one message at a
//! time. Durable I/O never runs on the actor itself: session creates and
//! settlements are spawned and rejoin through the mailbox
//! (`SessionCreated`, `FeedbackSettled`, `CallExpired`), so a slow store
//! delays one call's ring, not the event stream.
//!
//! After every roster or call-table mutation the full presence snapshot goes
//! to all attached sockets, registered or not.

use crate::errors::{reasons, CcError};
use crate::events::{ParticipantInfo, Presence, Role, ServerEvent};
use crate::observability::metrics;
use crate::settlement::{
    SettlementOutcome, SettlementRequest, SettlementResult, SettlementService,
};
use crate::store::{with_deadline, SessionStore};

use super::connection::ConnectionActorHandle;
use super::messages::{
    CallRequest, CallState, CallStatus, FeedbackSubmission, ParticipantState, PeerState,
    Registration, RegistryMessage, RegistryState,
};
use super::metrics::{ActorMetrics, ActorType, MailboxMonitor};

use chrono::{DateTime, Utc};
use common::types::{CallId, ConnectionId, SessionId, UserId};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// How often the registry checks links for dead outbound actors.
const LINK_SWEEP_INTERVAL: Duration = Duration::from_secs(5);

/// Tunables the registry copies out of the service config.
#[derive(Debug, Clone, Copy)]
pub struct RegistrySettings {
    /// Hard ceiling on call duration.
    pub call_ceiling: Duration,
    /// Deadline for each durable-store call spawned by the actor.
    pub store_timeout: Duration,
    /// Mailbox capacity for the registry and for each connection actor.
    pub mailbox_capacity: usize,
}

impl RegistrySettings {
    #[must_use]
    pub fn from_config(config: &crate::config::Config) -> Self {
        Self {
            call_ceiling: config.call_ceiling(),
            store_timeout: config.store_timeout(),
            mailbox_capacity: config.mailbox_capacity,
        }
    }
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            call_ceiling: Duration::from_secs(crate::config::DEFAULT_CALL_CEILING_SECONDS),
            store_timeout: Duration::from_millis(crate::config::DEFAULT_STORE_TIMEOUT_MS),
            mailbox_capacity: crate::config::DEFAULT_MAILBOX_CAPACITY,
        }
    }
}

/// Handle to the `RegistryActor`.
#[derive(Clone)]
pub struct RegistryActorHandle {
    sender: mpsc::Sender<RegistryMessage>,
    cancel_token: CancellationToken,
}

impl RegistryActorHandle {
    /// Hand a freshly opened socket's outbound link to the registry.
    pub async fn attach(&self, link: ConnectionActorHandle) -> Result<(), CcError> {
        self.sender
            .send(RegistryMessage::Attach { link })
            .await
            .map_err(|e| CcError::Internal(format!("channel send failed: {e}")))
    }

    /// `registerUser`. Validation failures surface as frames on the sender's
    /// own connection, so there is nothing to wait for.
    pub async fn register(
        &self,
        connection_id: ConnectionId,
        registration: Registration,
    ) -> Result<(), CcError> {
        self.sender
            .send(RegistryMessage::Register {
                connection_id,
                registration,
            })
            .await
            .map_err(|e| CcError::Internal(format!("channel send failed: {e}")))
    }

    /// `requestCall` from `caller`. `Ok(())` means the call entry exists and
    /// the durable create is in flight; precondition failures come back as
    /// errors.
    pub async fn request_call(
        &self,
        caller: ConnectionId,
        request: CallRequest,
    ) -> Result<(), CcError> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.sender
            .send(RegistryMessage::RequestCall {
                caller,
                request,
                respond_to: tx,
            })
            .await
            .map_err(|e| CcError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| CcError::Internal(format!("response receive failed: {e}")))?
    }

    /// `acceptCall` from the ringing callee.
    pub async fn accept_call(&self, connection_id: ConnectionId) -> Result<(), CcError> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.sender
            .send(RegistryMessage::AcceptCall {
                connection_id,
                respond_to: tx,
            })
            .await
            .map_err(|e| CcError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| CcError::Internal(format!("response receive failed: {e}")))?
    }

    /// `endCall` from either side of a live call.
    pub async fn end_call(&self, connection_id: ConnectionId) -> Result<(), CcError> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.sender
            .send(RegistryMessage::EndCall {
                connection_id,
                respond_to: tx,
            })
            .await
            .map_err(|e| CcError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| CcError::Internal(format!("response receive failed: {e}")))?
    }

    /// `declineCall` from either party of a still-ringing call.
    pub async fn decline_call(&self, connection_id: ConnectionId) -> Result<(), CcError> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.sender
            .send(RegistryMessage::DeclineCall {
                connection_id,
                respond_to: tx,
            })
            .await
            .map_err(|e| CcError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| CcError::Internal(format!("response receive failed: {e}")))?
    }

    /// `submitFeedback` from the hero of a live call. `Ok(())` means the
    /// settlement was spawned; its outcome arrives as frames.
    pub async fn submit_feedback(
        &self,
        connection_id: ConnectionId,
        feedback: FeedbackSubmission,
    ) -> Result<(), CcError> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.sender
            .send(RegistryMessage::SubmitFeedback {
                connection_id,
                feedback,
                respond_to: tx,
            })
            .await
            .map_err(|e| CcError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| CcError::Internal(format!("response receive failed: {e}")))?
    }

    /// The socket closed.
    pub async fn disconnect(&self, connection_id: ConnectionId) -> Result<(), CcError> {
        self.sender
            .send(RegistryMessage::Disconnect { connection_id })
            .await
            .map_err(|e| CcError::Internal(format!("channel send failed: {e}")))
    }

    /// Snapshot of current registry state.
    pub async fn state(&self) -> Result<RegistryState, CcError> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.sender
            .send(RegistryMessage::GetState { respond_to: tx })
            .await
            .map_err(|e| CcError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| CcError::Internal(format!("response receive failed: {e}")))
    }

    /// Cancel the registry actor (and, transitively, every child token).
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    /// Check if the actor is cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    /// Get a child token for connection actors.
    #[must_use]
    pub fn child_token(&self) -> CancellationToken {
        self.cancel_token.child_token()
    }
}

/// Participant roster entry.
#[derive(Debug)]
struct Participant {
    /// Connection this entry lives on.
    connection_id: ConnectionId,
    /// Durable identity; never leaves the controller.
    user_id: UserId,
    /// Display name.
    username: String,
    /// Hero or uplifter.
    role: Role,
    /// Display rating.
    rating: f64,
    /// Avatar URL.
    avatar: String,
    /// Roster presence.
    presence: Presence,
    /// Relation to the current call peer.
    peer_state: PeerState,
    /// Live call this participant is party to, if any.
    active_call: Option<CallId>,
}

impl Participant {
    fn to_info(&self) -> ParticipantInfo {
        ParticipantInfo {
            connection_id: self.connection_id,
            username: self.username.clone(),
            role: self.role,
            rating: self.rating,
            avatar: self.avatar.clone(),
            presence: self.presence,
        }
    }

    fn to_state(&self) -> ParticipantState {
        ParticipantState {
            connection_id: self.connection_id,
            user_id: self.user_id.clone(),
            username: self.username.clone(),
            role: self.role,
            rating: self.rating,
            avatar: self.avatar.clone(),
            presence: self.presence,
            peer_state: self.peer_state,
            active_call: self.active_call,
        }
    }
}

/// Live call table entry.
struct CallEntry {
    call_id: CallId,
    /// Hero side.
    caller: ConnectionId,
    /// Uplifter side.
    callee: ConnectionId,
    hero_user_id: UserId,
    uplifter_user_id: UserId,
    /// Ring payload, held until the session row exists.
    caller_name: String,
    room_id: String,
    /// None while the durable create is in flight.
    session_id: Option<SessionId>,
    status: CallStatus,
    started_at: DateTime<Utc>,
    /// Cancelling this token makes a late expiry fire a silent no-op.
    expiry: Option<CancellationToken>,
}

/// The `RegistryActor` implementation.
pub struct RegistryActor {
    /// Message receiver.
    receiver: mpsc::Receiver<RegistryMessage>,
    /// Sender clone handed to spawned tasks for rejoin messages.
    sender: mpsc::Sender<RegistryMessage>,
    /// Cancellation token; connection actors run on child tokens.
    cancel_token: CancellationToken,
    /// Outbound link per attached socket.
    links: HashMap<ConnectionId, ConnectionActorHandle>,
    /// Roster, keyed by connection.
    participants: HashMap<ConnectionId, Participant>,
    /// Latest registration per user.
    users: HashMap<UserId, ConnectionId>,
    /// Live calls.
    calls: HashMap<CallId, CallEntry>,
    /// Durable session creation.
    sessions: Arc<dyn SessionStore>,
    /// Everything after creation goes through settlement.
    settlement: Arc<SettlementService>,
    /// Copied config.
    settings: RegistrySettings,
    /// Shared actor metrics.
    actor_metrics: Arc<ActorMetrics>,
    /// Mailbox monitor.
    mailbox: MailboxMonitor,
}

impl RegistryActor {
    /// Spawn the registry actor.
    ///
    /// Returns a handle and the task join handle.
    pub fn spawn(
        settings: RegistrySettings,
        sessions: Arc<dyn SessionStore>,
        settlement: Arc<SettlementService>,
        cancel_token: CancellationToken,
        actor_metrics: Arc<ActorMetrics>,
    ) -> (RegistryActorHandle, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(settings.mailbox_capacity.max(1));

        let actor = Self {
            receiver,
            sender: sender.clone(),
            cancel_token: cancel_token.clone(),
            links: HashMap::new(),
            participants: HashMap::new(),
            users: HashMap::new(),
            calls: HashMap::new(),
            sessions,
            settlement,
            settings,
            actor_metrics,
            mailbox: MailboxMonitor::new(ActorType::Registry, "registry"),
        };

        let task_handle = tokio::spawn(actor.run());

        let handle = RegistryActorHandle {
            sender,
            cancel_token,
        };

        (handle, task_handle)
    }

    /// Run the actor message loop.
    #[instrument(skip_all, name = "cc.actor.registry")]
    async fn run(mut self) {
        info!(target: "cc.actor.registry", "RegistryActor started");

        let mut link_sweep = tokio::time::interval(LINK_SWEEP_INTERVAL);

        loop {
            tokio::select! {
                // Handle cancellation
                () = self.cancel_token.cancelled() => {
                    info!(
                        target: "cc.actor.registry",
                        "RegistryActor received cancellation signal"
                    );
                    self.graceful_shutdown();
                    break;
                }

                // Reap sockets whose outbound actor died without a disconnect
                _ = link_sweep.tick() => {
                    self.sweep_links();
                }

                // Handle messages
                msg = self.receiver.recv() => {
                    match msg {
                        Some(message) => {
                            self.mailbox.record_enqueue();
                            self.handle_message(message);
                            self.mailbox.record_dequeue();
                            self.actor_metrics.record_message_processed();
                        }
                        None => {
                            info!(
                                target: "cc.actor.registry",
                                "RegistryActor channel closed, exiting"
                            );
                            break;
                        }
                    }
                }
            }
        }

        info!(
            target: "cc.actor.registry",
            participants = self.participants.len(),
            calls = self.calls.len(),
            messages_processed = self.mailbox.messages_processed(),
            "RegistryActor stopped"
        );
    }

    /// Handle a single message. All mutations are synchronous; durable work
    /// leaves on spawned tasks.
    fn handle_message(&mut self, message: RegistryMessage) {
        match message {
            RegistryMessage::Attach { link } => {
                self.handle_attach(link);
            }

            RegistryMessage::Register {
                connection_id,
                registration,
            } => {
                self.handle_register(connection_id, registration);
            }

            RegistryMessage::RequestCall {
                caller,
                request,
                respond_to,
            } => {
                let result = self.handle_request_call(caller, request);
                let _ = respond_to.send(result);
            }

            RegistryMessage::AcceptCall {
                connection_id,
                respond_to,
            } => {
                let result = self.handle_accept_call(connection_id);
                let _ = respond_to.send(result);
            }

            RegistryMessage::EndCall {
                connection_id,
                respond_to,
            } => {
                let result = self.handle_end_call(connection_id);
                let _ = respond_to.send(result);
            }

            RegistryMessage::DeclineCall {
                connection_id,
                respond_to,
            } => {
                let result = self.handle_decline_call(connection_id);
                let _ = respond_to.send(result);
            }

            RegistryMessage::SubmitFeedback {
                connection_id,
                feedback,
                respond_to,
            } => {
                let result = self.handle_submit_feedback(connection_id, feedback);
                let _ = respond_to.send(result);
            }

            RegistryMessage::Disconnect { connection_id } => {
                self.handle_disconnect(connection_id);
            }

            RegistryMessage::SessionCreated {
                call_id,
                hero_user_id,
                uplifter_user_id,
                result,
            } => {
                self.handle_session_created(call_id, hero_user_id, uplifter_user_id, result);
            }

            RegistryMessage::FeedbackSettled {
                connection_id,
                call_id,
                result,
            } => {
                self.handle_feedback_settled(connection_id, call_id, result);
            }

            RegistryMessage::CallExpired { call_id } => {
                self.handle_call_expired(call_id);
            }

            RegistryMessage::GetState { respond_to } => {
                let _ = respond_to.send(self.state_snapshot());
            }
        }
    }

    /// Take custody of a socket's outbound link.
    fn handle_attach(&mut self, link: ConnectionActorHandle) {
        let connection_id = link.connection_id();
        debug!(
            target: "cc.actor.registry",
            connection_id = %connection_id,
            "Connection attached"
        );
        self.links.insert(connection_id, link);
        self.actor_metrics.connection_created();
    }

    /// Insert or overwrite the roster entry for this connection.
    fn handle_register(&mut self, connection_id: ConnectionId, registration: Registration) {
        if registration.user_id.trim().is_empty() || registration.username.trim().is_empty() {
            debug!(
                target: "cc.actor.registry",
                connection_id = %connection_id,
                "Rejecting registration without identity"
            );
            self.deliver(
                connection_id,
                ServerEvent::ValidationError {
                    reason: reasons::IDENTITY_REQUIRED.to_string(),
                },
            );
            return;
        }

        let user_id = UserId::new(registration.user_id);
        if let Some(existing) = self.participants.get(&connection_id) {
            // An identity switch releases the old user mapping, provided it
            // still points at this connection.
            if existing.user_id != user_id
                && self.users.get(&existing.user_id) == Some(&connection_id)
            {
                self.users.remove(&existing.user_id);
            }
        }

        if let Some(previous) = self.users.insert(user_id.clone(), connection_id) {
            if previous != connection_id {
                // One live roster entry per user. The evicted socket keeps its
                // link and is sent nothing.
                self.participants.remove(&previous);
                debug!(
                    target: "cc.actor.registry",
                    connection_id = %connection_id,
                    evicted_connection_id = %previous,
                    "User re-registered from a new connection, evicting stale entry"
                );
            }
        }

        let participant = Participant {
            connection_id,
            user_id,
            username: registration.username,
            role: registration.role,
            rating: registration.rating,
            avatar: registration.avatar,
            presence: Presence::Online,
            peer_state: PeerState::Disconnected,
            active_call: None,
        };

        info!(
            target: "cc.actor.registry",
            connection_id = %connection_id,
            role = participant.role.as_str(),
            "Participant registered"
        );

        self.participants.insert(connection_id, participant);
        self.broadcast();
    }

    /// Validate a call request and, if it holds, reserve both parties and
    /// start the durable session create.
    fn handle_request_call(
        &mut self,
        caller: ConnectionId,
        request: CallRequest,
    ) -> Result<(), CcError> {
        let Some(caller_entry) = self.participants.get(&caller) else {
            return Err(CcError::Precondition(
                reasons::CALLER_SESSION_MISSING.to_string(),
            ));
        };
        let Some(callee_entry) = self.participants.get(&request.callee) else {
            return Err(CcError::Precondition(
                reasons::CALLEE_UNAVAILABLE.to_string(),
            ));
        };
        if caller_entry.presence == Presence::Busy {
            return Err(CcError::Precondition(
                reasons::CALLER_ALREADY_BUSY.to_string(),
            ));
        }
        if callee_entry.presence == Presence::Busy {
            return Err(CcError::Precondition(
                reasons::CALLEE_ALREADY_BUSY.to_string(),
            ));
        }

        let call_id = CallId::new();
        let started_at = Utc::now();
        let hero_user_id = caller_entry.user_id.clone();
        let uplifter_user_id = callee_entry.user_id.clone();

        for connection_id in [caller, request.callee] {
            if let Some(participant) = self.participants.get_mut(&connection_id) {
                participant.presence = Presence::Busy;
                participant.peer_state = PeerState::Connecting;
                participant.active_call = Some(call_id);
            }
        }

        self.calls.insert(
            call_id,
            CallEntry {
                call_id,
                caller,
                callee: request.callee,
                hero_user_id: hero_user_id.clone(),
                uplifter_user_id: uplifter_user_id.clone(),
                caller_name: request.caller_name,
                room_id: request.room_id,
                session_id: None,
                status: CallStatus::Initiating,
                started_at,
                expiry: None,
            },
        );

        info!(
            target: "cc.actor.registry",
            call_id = %call_id,
            caller = %caller,
            callee = %request.callee,
            "Call requested, creating session"
        );

        // The callee rings only once the session row exists; the create
        // rejoins through the mailbox either way.
        let sessions = Arc::clone(&self.sessions);
        let sender = self.sender.clone();
        let store_timeout = self.settings.store_timeout;
        let initial_mood = request.initial_mood;
        tokio::spawn(async move {
            let result = with_deadline(
                "create_session",
                store_timeout,
                sessions.create_session(&hero_user_id, &uplifter_user_id, initial_mood, started_at),
            )
            .await;
            let _ = sender
                .send(RegistryMessage::SessionCreated {
                    call_id,
                    hero_user_id,
                    uplifter_user_id,
                    result,
                })
                .await;
        });

        self.broadcast();
        Ok(())
    }

    /// Rejoin from the durable session create.
    fn handle_session_created(
        &mut self,
        call_id: CallId,
        hero_user_id: UserId,
        uplifter_user_id: UserId,
        result: Result<SessionId, CcError>,
    ) {
        match result {
            Ok(session_id) => {
                let Some(entry) = self.calls.get_mut(&call_id) else {
                    // A party bailed while the row was being written; the
                    // session never rang anyone.
                    info!(
                        target: "cc.actor.registry",
                        call_id = %call_id,
                        session_id = %session_id,
                        "Call gone before session create finished, declining orphan session"
                    );
                    self.spawn_settlement(
                        session_id,
                        hero_user_id,
                        uplifter_user_id,
                        SettlementOutcome::Declined,
                    );
                    return;
                };

                entry.session_id = Some(session_id);
                let caller = entry.caller;
                let callee = entry.callee;
                let ring = ServerEvent::IncomingCall {
                    caller_name: entry.caller_name.clone(),
                    room_id: entry.room_id.clone(),
                    caller_connection_id: caller,
                };

                let expiry = self.arm_expiry(call_id);
                if let Some(entry) = self.calls.get_mut(&call_id) {
                    entry.expiry = Some(expiry);
                }

                info!(
                    target: "cc.actor.registry",
                    call_id = %call_id,
                    session_id = %session_id,
                    "Session created, ringing callee"
                );
                self.deliver(callee, ring);
                self.broadcast();
            }
            Err(e) => {
                if self.calls.contains_key(&call_id) {
                    warn!(
                        target: "cc.actor.registry",
                        call_id = %call_id,
                        error = %e,
                        "Session create failed, rolling back call"
                    );
                    if let Some(entry) = self.tear_down_entry(call_id) {
                        self.deliver(
                            entry.caller,
                            ServerEvent::CallError {
                                reason: reasons::CALL_SETUP_FAILED.to_string(),
                            },
                        );
                        self.broadcast();
                    }
                } else {
                    debug!(
                        target: "cc.actor.registry",
                        call_id = %call_id,
                        error = %e,
                        "Session create failed after call teardown"
                    );
                }
            }
        }
    }

    /// The ringing callee accepts.
    fn handle_accept_call(&mut self, connection_id: ConnectionId) -> Result<(), CcError> {
        let call_id = self
            .participants
            .get(&connection_id)
            .and_then(|p| p.active_call)
            .ok_or_else(|| CcError::Precondition(reasons::NO_CALL_TO_ACCEPT.to_string()))?;

        let Some(entry) = self.calls.get_mut(&call_id) else {
            return Err(CcError::Precondition(reasons::NO_CALL_TO_ACCEPT.to_string()));
        };
        if entry.callee != connection_id
            || entry.status != CallStatus::Initiating
            || entry.session_id.is_none()
        {
            return Err(CcError::Precondition(reasons::NO_CALL_TO_ACCEPT.to_string()));
        }

        entry.status = CallStatus::Connected;
        let caller = entry.caller;
        let callee = entry.callee;

        for connection_id in [caller, callee] {
            if let Some(participant) = self.participants.get_mut(&connection_id) {
                participant.peer_state = PeerState::Connected;
            }
        }

        info!(
            target: "cc.actor.registry",
            call_id = %call_id,
            "Call accepted"
        );
        self.deliver(caller, ServerEvent::CallAccepted);
        self.broadcast();
        Ok(())
    }

    /// Either side ends their call.
    fn handle_end_call(&mut self, connection_id: ConnectionId) -> Result<(), CcError> {
        let call_id = self
            .participants
            .get(&connection_id)
            .and_then(|p| p.active_call)
            .ok_or_else(|| CcError::Precondition(reasons::NO_ACTIVE_CALL.to_string()))?;

        let Some(entry) = self.tear_down_entry(call_id) else {
            // Stale pointer; repair it rather than leave the participant
            // wedged as busy.
            if let Some(participant) = self.participants.get_mut(&connection_id) {
                participant.presence = Presence::Online;
                participant.peer_state = PeerState::Disconnected;
                participant.active_call = None;
            }
            return Err(CcError::Precondition(reasons::NO_ACTIVE_CALL.to_string()));
        };

        let peer = if entry.caller == connection_id {
            entry.callee
        } else {
            entry.caller
        };

        info!(
            target: "cc.actor.registry",
            call_id = %entry.call_id,
            status = entry.status.as_str(),
            elapsed_secs = (Utc::now() - entry.started_at).num_seconds(),
            "Call ended by participant"
        );

        self.deliver(peer, ServerEvent::CallEnded);

        if let Some(session_id) = entry.session_id {
            // An explicit end is a delivered (billable) session even if the
            // callee never picked up.
            self.spawn_settlement(
                session_id,
                entry.hero_user_id.clone(),
                entry.uplifter_user_id.clone(),
                SettlementOutcome::Ended,
            );
        }
        // No session yet: the in-flight create rejoins, finds the entry
        // gone, and settles the orphan as declined.

        self.broadcast();
        Ok(())
    }

    /// Either party aborts a still-ringing call.
    fn handle_decline_call(&mut self, connection_id: ConnectionId) -> Result<(), CcError> {
        let call_id = self
            .participants
            .get(&connection_id)
            .and_then(|p| p.active_call)
            .ok_or_else(|| CcError::Precondition(reasons::NO_CALL_TO_DECLINE.to_string()))?;

        // Once the call connects, decline no longer applies; ending it is the
        // only way out.
        match self.calls.get(&call_id) {
            Some(entry) if entry.status == CallStatus::Initiating => {}
            _ => {
                return Err(CcError::Precondition(
                    reasons::NO_CALL_TO_DECLINE.to_string(),
                ));
            }
        }

        if let Some(entry) = self.tear_down_entry(call_id) {
            let peer = if entry.caller == connection_id {
                entry.callee
            } else {
                entry.caller
            };
            info!(
                target: "cc.actor.registry",
                call_id = %call_id,
                "Call declined"
            );
            self.deliver(peer, ServerEvent::CallDeclined);
            if let Some(session_id) = entry.session_id {
                self.spawn_settlement(
                    session_id,
                    entry.hero_user_id.clone(),
                    entry.uplifter_user_id.clone(),
                    SettlementOutcome::Declined,
                );
            }
            self.broadcast();
        }
        Ok(())
    }

    /// The hero submits end-of-call feedback; settlement decides the rest.
    fn handle_submit_feedback(
        &mut self,
        connection_id: ConnectionId,
        feedback: FeedbackSubmission,
    ) -> Result<(), CcError> {
        let Some(participant) = self.participants.get(&connection_id) else {
            return Err(CcError::Precondition(
                reasons::FEEDBACK_HERO_ONLY.to_string(),
            ));
        };
        if participant.role != Role::Hero {
            return Err(CcError::Precondition(
                reasons::FEEDBACK_HERO_ONLY.to_string(),
            ));
        }

        let session = participant
            .active_call
            .and_then(|call_id| self.calls.get(&call_id))
            .and_then(|entry| {
                entry.session_id.map(|session_id| {
                    (
                        entry.call_id,
                        session_id,
                        entry.hero_user_id.clone(),
                        entry.uplifter_user_id.clone(),
                    )
                })
            });
        let Some((call_id, session_id, hero_user_id, uplifter_user_id)) = session else {
            return Err(CcError::Precondition(reasons::NO_ACTIVE_SESSION.to_string()));
        };

        info!(
            target: "cc.actor.registry",
            call_id = %call_id,
            session_id = %session_id,
            "Feedback submitted, settling session"
        );

        let service = Arc::clone(&self.settlement);
        let sender = self.sender.clone();
        let request = SettlementRequest {
            session_id,
            hero_user_id,
            uplifter_user_id,
            outcome: SettlementOutcome::Feedback {
                final_mood: feedback.final_mood,
                feedback_text: feedback.feedback_text,
                rating_given: feedback.rating_given,
                inappropriate: feedback.inappropriate,
            },
        };
        tokio::spawn(async move {
            let result = service.settle(request).await;
            let _ = sender
                .send(RegistryMessage::FeedbackSettled {
                    connection_id,
                    call_id,
                    result,
                })
                .await;
        });
        Ok(())
    }

    /// Rejoin from a feedback settlement.
    fn handle_feedback_settled(
        &mut self,
        connection_id: ConnectionId,
        call_id: CallId,
        result: Result<SettlementResult, CcError>,
    ) {
        match result {
            Ok(SettlementResult::Settled(receipt)) => {
                debug!(
                    target: "cc.actor.registry",
                    call_id = %call_id,
                    deduction = receipt.deduction.as_str(),
                    "Feedback settlement applied"
                );
                if let Some(entry) = self.tear_down_entry(call_id) {
                    let peer = if entry.caller == connection_id {
                        entry.callee
                    } else {
                        entry.caller
                    };
                    self.deliver(connection_id, ServerEvent::FeedbackAccepted);
                    self.deliver(connection_id, ServerEvent::ReenterQueue);
                    self.deliver(peer, ServerEvent::ReenterQueue);
                    self.broadcast();
                } else {
                    // Torn down while the settlement ran; the submitter
                    // still learns their feedback landed.
                    self.deliver(connection_id, ServerEvent::FeedbackAccepted);
                }
            }
            Ok(SettlementResult::AlreadySettled(status)) => {
                debug!(
                    target: "cc.actor.registry",
                    call_id = %call_id,
                    status = status.as_str(),
                    "Feedback lost the settlement race"
                );
                self.deliver(
                    connection_id,
                    ServerEvent::CallError {
                        reason: reasons::SESSION_ALREADY_SETTLED.to_string(),
                    },
                );
            }
            Ok(SettlementResult::NotFound) => {
                warn!(
                    target: "cc.actor.registry",
                    call_id = %call_id,
                    "Session missing during feedback settlement"
                );
                self.deliver(
                    connection_id,
                    ServerEvent::CallError {
                        reason: reasons::SETTLEMENT_FAILED.to_string(),
                    },
                );
            }
            Err(e) => {
                error!(
                    target: "cc.actor.registry",
                    call_id = %call_id,
                    error = %e,
                    "Feedback settlement failed"
                );
                self.deliver(
                    connection_id,
                    ServerEvent::CallError {
                        reason: reasons::SETTLEMENT_FAILED.to_string(),
                    },
                );
            }
        }
    }

    /// Socket closed (or its outbound actor died).
    fn handle_disconnect(&mut self, connection_id: ConnectionId) {
        let had_link = if let Some(link) = self.links.remove(&connection_id) {
            link.cancel();
            self.actor_metrics.connection_closed();
            true
        } else {
            false
        };

        let Some(participant) = self.participants.remove(&connection_id) else {
            if had_link {
                debug!(
                    target: "cc.actor.registry",
                    connection_id = %connection_id,
                    "Unregistered connection detached"
                );
            }
            return;
        };

        if self.users.get(&participant.user_id) == Some(&connection_id) {
            self.users.remove(&participant.user_id);
        }

        if let Some(call_id) = participant.active_call {
            if let Some(entry) = self.tear_down_entry(call_id) {
                let peer = if entry.caller == connection_id {
                    entry.callee
                } else {
                    entry.caller
                };
                self.deliver(peer, ServerEvent::CallEnded);

                if let Some(session_id) = entry.session_id {
                    // Mid-call drops bill; drops while ringing do not.
                    let outcome = if participant.peer_state == PeerState::Connected {
                        SettlementOutcome::Ended
                    } else {
                        SettlementOutcome::Declined
                    };
                    self.spawn_settlement(
                        session_id,
                        entry.hero_user_id.clone(),
                        entry.uplifter_user_id.clone(),
                        outcome,
                    );
                }

                info!(
                    target: "cc.actor.registry",
                    call_id = %call_id,
                    "Call torn down by disconnect"
                );
            }
        }

        info!(
            target: "cc.actor.registry",
            connection_id = %connection_id,
            online = self.participants.len(),
            "Participant disconnected"
        );
        self.broadcast();
    }

    /// A call reached its ceiling.
    fn handle_call_expired(&mut self, call_id: CallId) {
        let Some(entry) = self.tear_down_entry(call_id) else {
            // The timer lost the race with another ending trigger.
            debug!(
                target: "cc.actor.registry",
                call_id = %call_id,
                "Expiry for a call that is already gone"
            );
            return;
        };

        info!(
            target: "cc.actor.registry",
            call_id = %call_id,
            status = entry.status.as_str(),
            "Call reached ceiling, ending"
        );

        self.deliver(entry.caller, ServerEvent::CallEnded);
        self.deliver(entry.callee, ServerEvent::CallEnded);

        if let Some(session_id) = entry.session_id {
            let outcome = if entry.status == CallStatus::Connected {
                SettlementOutcome::Ended
            } else {
                SettlementOutcome::Declined
            };
            self.spawn_settlement(
                session_id,
                entry.hero_user_id.clone(),
                entry.uplifter_user_id.clone(),
                outcome,
            );
        }

        self.broadcast();
    }

    /// Remove a call entry, cancel its timer, and restore both surviving
    /// parties to the open roster.
    fn tear_down_entry(&mut self, call_id: CallId) -> Option<CallEntry> {
        let entry = self.calls.remove(&call_id)?;
        if let Some(token) = &entry.expiry {
            token.cancel();
        }
        for connection_id in [entry.caller, entry.callee] {
            if let Some(participant) = self.participants.get_mut(&connection_id) {
                participant.presence = Presence::Online;
                participant.peer_state = PeerState::Disconnected;
                participant.active_call = None;
            }
        }
        Some(entry)
    }

    /// Start the ceiling timer for a call. The token cancels it; a fire
    /// after teardown is ignored by `handle_call_expired`.
    fn arm_expiry(&self, call_id: CallId) -> CancellationToken {
        let token = self.cancel_token.child_token();
        let timer_token = token.clone();
        let sender = self.sender.clone();
        let ceiling = self.settings.call_ceiling;
        tokio::spawn(async move {
            tokio::select! {
                () = timer_token.cancelled() => {}
                () = tokio::time::sleep(ceiling) => {
                    let _ = sender.send(RegistryMessage::CallExpired { call_id }).await;
                }
            }
        });
        token
    }

    /// Settle a session off the actor; failures leave the row for
    /// reconciliation and are logged by the service.
    fn spawn_settlement(
        &self,
        session_id: SessionId,
        hero_user_id: UserId,
        uplifter_user_id: UserId,
        outcome: SettlementOutcome,
    ) {
        let service = Arc::clone(&self.settlement);
        let request = SettlementRequest {
            session_id,
            hero_user_id,
            uplifter_user_id,
            outcome,
        };
        tokio::spawn(async move {
            if let Err(e) = service.settle(request).await {
                error!(
                    target: "cc.actor.registry",
                    session_id = %session_id,
                    error = %e,
                    "Settlement failed"
                );
            }
        });
    }

    /// Deliver one frame to one connection, if it is still attached.
    fn deliver(&self, connection_id: ConnectionId, event: ServerEvent) {
        if let Some(link) = self.links.get(&connection_id) {
            link.deliver(event);
        }
    }

    /// Push the full presence snapshot to every attached socket.
    fn broadcast(&self) {
        let participants: Vec<ParticipantInfo> = self
            .participants
            .values()
            .map(Participant::to_info)
            .collect();
        let snapshot = ServerEvent::PresenceSnapshot {
            online_count: participants.len(),
            active_call_count: self.calls.len(),
            participants,
        };

        for link in self.links.values() {
            link.deliver(snapshot.clone());
        }

        metrics::record_broadcast();
        metrics::set_registry_gauges(self.participants.len(), self.calls.len());
    }

    /// Detect sockets whose outbound actor exited without a disconnect.
    fn sweep_links(&mut self) {
        let dead: Vec<ConnectionId> = self
            .links
            .iter()
            .filter(|(_, link)| link.is_closed())
            .map(|(connection_id, _)| *connection_id)
            .collect();

        for connection_id in dead {
            debug!(
                target: "cc.actor.registry",
                connection_id = %connection_id,
                "Outbound actor gone, treating as disconnect"
            );
            self.handle_disconnect(connection_id);
        }
    }

    /// Current state, for `GetState`.
    fn state_snapshot(&self) -> RegistryState {
        RegistryState {
            participants: self
                .participants
                .values()
                .map(Participant::to_state)
                .collect(),
            calls: self
                .calls
                .values()
                .map(|entry| CallState {
                    call_id: entry.call_id,
                    caller: entry.caller,
                    callee: entry.callee,
                    status: entry.status,
                    session_id: entry.session_id,
                })
                .collect(),
            online_count: self.participants.len(),
            active_call_count: self.calls.len(),
        }
    }

    /// Perform graceful shutdown: cancel every outbound actor and pending
    /// timer. Unsettled sessions stay `Ongoing` for reconciliation.
    fn graceful_shutdown(&mut self) {
        info!(
            target: "cc.shutdown",
            participants = self.participants.len(),
            connections = self.links.len(),
            calls = self.calls.len(),
            "Registry draining"
        );

        for entry in self.calls.values() {
            if let Some(token) = &entry.expiry {
                token.cancel();
            }
        }
        for link in self.links.values() {
            link.cancel();
        }
        self.links.clear();

        info!(target: "cc.shutdown", "Registry drained");
    }
}
