//! WebSocket gateway.
//!
//! `GET /ws` upgrades a socket and wires it into the actor system:
//!
//! 1. Mint a [`ConnectionId`] and split the socket.
//! 2. Spawn a `ConnectionActor` that owns the outbound half.
//! 3. Attach the actor's handle to the registry.
//! 4. Run the inbound loop here, translating frames into registry calls.
//!
//! Precondition and validation failures surface as `callError` and
//! `validationError` frames on the sender's own connection. Everything a
//! frame causes elsewhere (rings, roster snapshots, call teardown) is
//! delivered by the registry through attached connection handles.
//!
//! Upgrades are refused with 503 while the instance is starting or
//! draining, so the load balancer steers clients to a live instance.

use crate::actors::{
    ActorMetrics, ActorType, CallRequest, ConnectionActor, ConnectionActorHandle,
    FeedbackSubmission, Registration, RegistryActorHandle,
};
use crate::errors::CcError;
use crate::events::{numeric_field, ClientEvent, ServerEvent};
use crate::observability::metrics;
use crate::observability::HealthState;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use common::types::ConnectionId;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// How long to wait for a connection actor to flush its close frame after
/// the inbound loop exits.
const CONNECTION_EXIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Shared state for the gateway routes.
#[derive(Clone)]
pub struct AppState {
    /// Handle to the registry actor.
    pub registry: RegistryActorHandle,
    /// Readiness gate for new upgrades.
    pub health: Arc<HealthState>,
    /// Shared actor metrics.
    pub actor_metrics: Arc<ActorMetrics>,
    /// Mailbox capacity for each connection actor.
    pub mailbox_capacity: usize,
}

/// Router with the WebSocket endpoint. Health and metrics routes are
/// composed next to this one at startup.
pub fn gateway_router(state: AppState) -> Router {
    Router::new().route("/ws", get(ws_handler)).with_state(state)
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    if !state.health.is_ready() {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }
    ws.on_upgrade(move |socket| handle_socket(socket, state))
        .into_response()
}

/// Run one WebSocket connection from upgrade to teardown.
async fn handle_socket(socket: WebSocket, state: AppState) {
    let connection_id = ConnectionId::new();
    let (sink, mut stream) = socket.split();

    let cancel_token = state.registry.child_token();
    let (link, actor_task) = ConnectionActor::spawn(
        connection_id,
        sink,
        cancel_token.clone(),
        Arc::clone(&state.actor_metrics),
        state.mailbox_capacity,
    );

    if let Err(e) = state.registry.attach(link.clone()).await {
        // Registry is gone (shutdown race); nothing to run a loop for.
        error!(
            target: "cc.gateway",
            connection_id = %connection_id,
            error = %e,
            "Failed to attach connection to registry"
        );
        link.cancel();
        return;
    }

    info!(
        target: "cc.gateway",
        connection_id = %connection_id,
        "WebSocket connected"
    );

    loop {
        tokio::select! {
            () = cancel_token.cancelled() => {
                debug!(
                    target: "cc.gateway",
                    connection_id = %connection_id,
                    "Connection cancelled, leaving inbound loop"
                );
                break;
            }
            frame = stream.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        handle_text_frame(&state, &link, connection_id, &text).await;
                    }
                    Some(Ok(Message::Binary(_))) => {
                        debug!(
                            target: "cc.gateway",
                            connection_id = %connection_id,
                            "Ignoring binary frame"
                        );
                    }
                    // Axum answers pings at the protocol level
                    Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                    Some(Ok(Message::Close(_))) => {
                        debug!(
                            target: "cc.gateway",
                            connection_id = %connection_id,
                            "Client sent close frame"
                        );
                        break;
                    }
                    Some(Err(e)) => {
                        debug!(
                            target: "cc.gateway",
                            connection_id = %connection_id,
                            error = %e,
                            "WebSocket receive error"
                        );
                        break;
                    }
                    None => break,
                }
            }
        }
    }

    // The registry settles any live call, notifies the peer, and cancels
    // the outbound actor.
    if let Err(e) = state.registry.disconnect(connection_id).await {
        debug!(
            target: "cc.gateway",
            connection_id = %connection_id,
            error = %e,
            "Disconnect dispatch failed during shutdown"
        );
        link.cancel();
    }

    match tokio::time::timeout(CONNECTION_EXIT_TIMEOUT, actor_task).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) if e.is_panic() => {
            state.actor_metrics.record_panic(ActorType::Connection);
            error!(
                target: "cc.gateway",
                connection_id = %connection_id,
                error = %e,
                "Connection actor panicked"
            );
        }
        Ok(Err(_)) => {} // Cancelled
        Err(_) => {
            warn!(
                target: "cc.gateway",
                connection_id = %connection_id,
                "Connection actor did not exit in time"
            );
        }
    }

    info!(
        target: "cc.gateway",
        connection_id = %connection_id,
        "WebSocket closed"
    );
}

/// Parse one text frame and dispatch it, answering failures on the
/// sender's own link.
async fn handle_text_frame(
    state: &AppState,
    link: &ConnectionActorHandle,
    connection_id: ConnectionId,
    text: &str,
) {
    let event: ClientEvent = match serde_json::from_str(text) {
        Ok(event) => event,
        Err(e) => {
            debug!(
                target: "cc.gateway",
                connection_id = %connection_id,
                error = %e,
                "Unparseable frame"
            );
            metrics::record_event("unparseable", "error");
            link.deliver(ServerEvent::ValidationError {
                reason: format!("invalid frame: {e}"),
            });
            return;
        }
    };

    let kind = event.kind();
    match dispatch(state, connection_id, event).await {
        Ok(()) => metrics::record_event(kind, "success"),
        Err(e) => {
            metrics::record_event(kind, "error");
            debug!(
                target: "cc.gateway",
                connection_id = %connection_id,
                event = kind,
                error = %e,
                "Event rejected"
            );
            let frame = match &e {
                CcError::Validation(reason) => ServerEvent::ValidationError {
                    reason: reason.clone(),
                },
                other => ServerEvent::CallError {
                    reason: other.client_reason(),
                },
            };
            link.deliver(frame);
        }
    }
}

/// Translate a parsed frame into a registry call.
async fn dispatch(
    state: &AppState,
    connection_id: ConnectionId,
    event: ClientEvent,
) -> Result<(), CcError> {
    match event {
        ClientEvent::RegisterUser {
            username,
            user_id,
            role,
            rating,
            avatar,
        } => {
            // Non-numeric ratings mean "no rating yet", not a bad frame
            let rating = numeric_field(&rating).unwrap_or(0.0);
            state
                .registry
                .register(
                    connection_id,
                    Registration {
                        username,
                        user_id,
                        role,
                        rating,
                        avatar,
                    },
                )
                .await
        }

        ClientEvent::RequestCall {
            caller_name,
            room_id,
            callee_connection_id,
            initial_mood,
        } => {
            state
                .registry
                .request_call(
                    connection_id,
                    CallRequest {
                        caller_name,
                        room_id,
                        callee: callee_connection_id,
                        initial_mood,
                    },
                )
                .await
        }

        // Resolution is by the sender's own active call; the payload ids
        // are client-side bookkeeping.
        ClientEvent::AcceptCall { .. } => state.registry.accept_call(connection_id).await,
        ClientEvent::EndCall { .. } => state.registry.end_call(connection_id).await,
        ClientEvent::DeclineCall { .. } => state.registry.decline_call(connection_id).await,

        ClientEvent::SubmitFeedback {
            final_mood,
            feedback_text,
            inappropriate,
            rating_given,
        } => {
            let final_mood = numeric_field(&final_mood)
                .ok_or_else(|| CcError::Validation("finalMood must be numeric".to_string()))?;
            let rating_given = numeric_field(&rating_given)
                .ok_or_else(|| CcError::Validation("ratingGiven must be numeric".to_string()))?;
            state
                .registry
                .submit_feedback(
                    connection_id,
                    FeedbackSubmission {
                        final_mood,
                        feedback_text,
                        rating_given,
                        inappropriate,
                    },
                )
                .await
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::actors::{RegistryActor, RegistrySettings};
    use crate::errors::reasons;
    use crate::events::{Presence, Role};
    use crate::settlement::SettlementService;
    use crate::store::memory::{
        MemoryProfileStore, MemorySessionStore, MemorySubscriptionStore,
    };
    use crate::store::{ProfileStore, SessionStore, SubscriptionStore};
    use axum::body::Body;
    use axum::http::Request;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;
    use tower::util::ServiceExt;

    fn test_state() -> AppState {
        let sessions = Arc::new(MemorySessionStore::new());
        let subscriptions = Arc::new(MemorySubscriptionStore::new());
        let profiles = Arc::new(MemoryProfileStore::new());
        let settings = RegistrySettings::default();
        let settlement = Arc::new(SettlementService::new(
            Arc::clone(&sessions) as Arc<dyn SessionStore>,
            Arc::clone(&subscriptions) as Arc<dyn SubscriptionStore>,
            Arc::clone(&profiles) as Arc<dyn ProfileStore>,
            settings.store_timeout,
        ));
        let (registry, _task) = RegistryActor::spawn(
            settings,
            sessions as Arc<dyn SessionStore>,
            settlement,
            CancellationToken::new(),
            ActorMetrics::new(),
        );
        AppState {
            registry,
            health: Arc::new(HealthState::new()),
            actor_metrics: ActorMetrics::new(),
            mailbox_capacity: 64,
        }
    }

    async fn attach_link(
        state: &AppState,
    ) -> (
        ConnectionId,
        ConnectionActorHandle,
        mpsc::Receiver<ServerEvent>,
    ) {
        let connection_id = ConnectionId::new();
        let (sender, receiver) = mpsc::channel(64);
        let link = ConnectionActorHandle::new(connection_id, sender, state.registry.child_token());
        state.registry.attach(link.clone()).await.unwrap();
        (connection_id, link, receiver)
    }

    async fn expect_frame(receiver: &mut mpsc::Receiver<ServerEvent>, kind: &str) -> ServerEvent {
        loop {
            let event = tokio::time::timeout(Duration::from_secs(5), receiver.recv())
                .await
                .expect("timed out waiting for frame")
                .expect("event channel closed");
            if event.kind() == kind {
                return event;
            }
        }
    }

    fn upgrade_request() -> Request<Body> {
        Request::builder()
            .uri("/ws")
            .header("connection", "upgrade")
            .header("upgrade", "websocket")
            .header("sec-websocket-version", "13")
            .header("sec-websocket-key", "dGhlIHNhbXBsZSBub25jZQ==")
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn test_upgrade_refused_until_ready() {
        let state = test_state();
        let app = gateway_router(state.clone());

        let response = app.clone().oneshot(upgrade_request()).await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        state.health.set_ready();
        let response = app.oneshot(upgrade_request()).await.unwrap();
        assert_eq!(response.status(), StatusCode::SWITCHING_PROTOCOLS);
    }

    #[tokio::test]
    async fn test_plain_get_is_rejected() {
        let state = test_state();
        state.health.set_ready();
        let app = gateway_router(state);

        let request = Request::builder().uri("/ws").body(Body::empty()).unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert!(response.status().is_client_error());
    }

    #[tokio::test]
    async fn test_unparseable_frame_gets_validation_error() {
        let state = test_state();
        let (connection_id, link, mut receiver) = attach_link(&state).await;

        handle_text_frame(&state, &link, connection_id, "not json at all").await;

        let event = expect_frame(&mut receiver, "validationError").await;
        match event {
            ServerEvent::ValidationError { reason } => {
                assert!(reason.starts_with("invalid frame"));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unknown_type_gets_validation_error() {
        let state = test_state();
        let (connection_id, link, mut receiver) = attach_link(&state).await;

        handle_text_frame(
            &state,
            &link,
            connection_id,
            r#"{"type": "joinQueue", "queue": "uplift"}"#,
        )
        .await;

        expect_frame(&mut receiver, "validationError").await;
    }

    #[tokio::test]
    async fn test_register_defaults_non_numeric_rating() {
        let state = test_state();
        let (connection_id, link, _receiver) = attach_link(&state).await;

        handle_text_frame(
            &state,
            &link,
            connection_id,
            r#"{"type": "registerUser", "username": "sunny", "userId": "u-1", "role": "uplifter", "rating": "five stars"}"#,
        )
        .await;

        let registry_state = state.registry.state().await.unwrap();
        let participant = registry_state.participant(connection_id).unwrap();
        assert_eq!(participant.username, "sunny");
        assert!((participant.rating - 0.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_feedback_requires_numeric_fields() {
        let state = test_state();
        let (connection_id, link, mut receiver) = attach_link(&state).await;

        // Validation runs before role or session checks
        handle_text_frame(
            &state,
            &link,
            connection_id,
            r#"{"type": "submitFeedback", "finalMood": 4, "ratingGiven": "five"}"#,
        )
        .await;

        let event = expect_frame(&mut receiver, "validationError").await;
        match event {
            ServerEvent::ValidationError { reason } => {
                assert_eq!(reason, "ratingGiven must be numeric");
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_precondition_maps_to_call_error() {
        let state = test_state();
        let (connection_id, link, mut receiver) = attach_link(&state).await;

        handle_text_frame(
            &state,
            &link,
            connection_id,
            r#"{"type": "endCall", "peerConnectionId": "00000000-0000-0000-0000-000000000000"}"#,
        )
        .await;

        let event = expect_frame(&mut receiver, "callError").await;
        match event {
            ServerEvent::CallError { reason } => {
                assert_eq!(reason, reasons::NO_ACTIVE_CALL);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_call_flow_over_text_frames() {
        let state = test_state();
        let (hero, hero_link, _hero_rx) = attach_link(&state).await;
        let (uplifter, uplifter_link, mut uplifter_rx) = attach_link(&state).await;

        handle_text_frame(
            &state,
            &hero_link,
            hero,
            r#"{"type": "registerUser", "username": "ray", "userId": "hero-1", "role": "hero"}"#,
        )
        .await;
        handle_text_frame(
            &state,
            &uplifter_link,
            uplifter,
            r#"{"type": "registerUser", "username": "sunny", "userId": "up-1", "role": "uplifter", "rating": 4.5}"#,
        )
        .await;

        let request = format!(
            r#"{{"type": "requestCall", "callerName": "ray", "roomId": "room-7", "calleeConnectionId": "{uplifter}", "initialMood": 2}}"#
        );
        handle_text_frame(&state, &hero_link, hero, &request).await;

        let ring = expect_frame(&mut uplifter_rx, "incomingCall").await;
        match ring {
            ServerEvent::IncomingCall {
                caller_name,
                caller_connection_id,
                ..
            } => {
                assert_eq!(caller_name, "ray");
                assert_eq!(caller_connection_id, hero);
            }
            other => panic!("unexpected event {other:?}"),
        }

        let registry_state = state.registry.state().await.unwrap();
        assert_eq!(registry_state.active_call_count, 1);
        assert_eq!(
            registry_state.participant(hero).unwrap().presence,
            Presence::Busy
        );
        assert_eq!(
            registry_state.participant(uplifter).unwrap().role,
            Role::Uplifter
        );
    }
}
