//! Integration tests for the call lifecycle.
//!
//! Drives the spawned registry actor through its public handle with
//! channel-backed connection handles, asserting on the frames each side
//! receives and on the durable records the lifecycle leaves behind.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::sync::Arc;
use std::time::Duration;

use call_controller::actors::{
    ActorMetrics, CallRequest, ConnectionActorHandle, FeedbackSubmission, Registration,
    RegistryActor, RegistryActorHandle, RegistrySettings,
};
use call_controller::events::{Presence, Role, ServerEvent};
use call_controller::settlement::SettlementService;
use call_controller::store::memory::{
    MemoryProfileStore, MemorySessionStore, MemorySubscriptionStore,
};
use call_controller::store::{
    ProfileRecord, ProfileStore, SessionStatus, SessionStore, SubscriptionRecord,
    SubscriptionStore,
};
use common::types::{ConnectionId, UserId};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

// ============================================================================
// Fixture
// ============================================================================

struct Harness {
    registry: RegistryActorHandle,
    sessions: Arc<MemorySessionStore>,
    subscriptions: Arc<MemorySubscriptionStore>,
    profiles: Arc<MemoryProfileStore>,
}

fn spawn_harness(settings: RegistrySettings) -> Harness {
    let sessions = Arc::new(MemorySessionStore::new());
    let subscriptions = Arc::new(MemorySubscriptionStore::new());
    let profiles = Arc::new(MemoryProfileStore::new());
    let settlement = Arc::new(SettlementService::new(
        Arc::clone(&sessions) as Arc<dyn SessionStore>,
        Arc::clone(&subscriptions) as Arc<dyn SubscriptionStore>,
        Arc::clone(&profiles) as Arc<dyn ProfileStore>,
        settings.store_timeout,
    ));
    let (registry, _task) = RegistryActor::spawn(
        settings,
        Arc::clone(&sessions) as Arc<dyn SessionStore>,
        settlement,
        CancellationToken::new(),
        ActorMetrics::new(),
    );
    Harness {
        registry,
        sessions,
        subscriptions,
        profiles,
    }
}

/// A fake socket: the registry delivers into the channel, the test reads
/// the other end.
async fn connect(harness: &Harness) -> (ConnectionId, mpsc::Receiver<ServerEvent>) {
    let connection_id = ConnectionId::new();
    let (sender, receiver) = mpsc::channel(64);
    let link = ConnectionActorHandle::new(connection_id, sender, harness.registry.child_token());
    harness.registry.attach(link).await.unwrap();
    (connection_id, receiver)
}

async fn register(
    harness: &Harness,
    connection_id: ConnectionId,
    username: &str,
    user_id: &str,
    role: Role,
) {
    harness
        .registry
        .register(
            connection_id,
            Registration {
                username: username.to_string(),
                user_id: user_id.to_string(),
                role,
                rating: 0.0,
                avatar: String::new(),
            },
        )
        .await
        .unwrap();
}

async fn expect_frame(receiver: &mut mpsc::Receiver<ServerEvent>, kind: &str) -> ServerEvent {
    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), receiver.recv())
            .await
            .unwrap_or_else(|_| panic!("timed out waiting for {kind}"))
            .expect("event channel closed");
        if event.kind() == kind {
            return event;
        }
    }
}

/// Wait until the session row reaches the given status.
async fn wait_for_status(
    sessions: &MemorySessionStore,
    session_id: common::types::SessionId,
    status: SessionStatus,
) {
    for _ in 0..400 {
        if sessions.session(session_id).await.unwrap().status == status {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    let actual = sessions.session(session_id).await.unwrap().status;
    panic!("session never reached {status:?}, still {actual:?}");
}

async fn live_session_id(harness: &Harness) -> common::types::SessionId {
    for _ in 0..400 {
        let state = harness.registry.state().await.unwrap();
        if let Some(session_id) = state.calls.first().and_then(|call| call.session_id) {
            return session_id;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("no live session appeared");
}

fn hero_subscription(bundle: i64) -> SubscriptionRecord {
    SubscriptionRecord {
        user_id: UserId::new("hero-1"),
        weekly_balance: 0,
        weekly_expires_at: None,
        weekly_unlimited: false,
        bundle_balance: bundle,
    }
}

// ============================================================================
// Happy path
// ============================================================================

#[tokio::test]
async fn full_call_journey_with_feedback() {
    let harness = spawn_harness(RegistrySettings::default());
    harness.subscriptions.insert(hero_subscription(3)).await;
    harness
        .profiles
        .insert(ProfileRecord {
            user_id: UserId::new("uplifter-1"),
            rating: 4.0,
            flag_count: 0,
        })
        .await;

    let (hero, mut hero_rx) = connect(&harness).await;
    let (uplifter, mut uplifter_rx) = connect(&harness).await;
    register(&harness, hero, "ray", "hero-1", Role::Hero).await;
    register(&harness, uplifter, "sunny", "uplifter-1", Role::Uplifter).await;

    // Hero calls the uplifter
    harness
        .registry
        .request_call(
            hero,
            CallRequest {
                caller_name: "ray".to_string(),
                room_id: "room-7".to_string(),
                callee: uplifter,
                initial_mood: 2.0,
            },
        )
        .await
        .unwrap();

    let ring = expect_frame(&mut uplifter_rx, "incomingCall").await;
    match ring {
        ServerEvent::IncomingCall {
            caller_name,
            room_id,
            caller_connection_id,
        } => {
            assert_eq!(caller_name, "ray");
            assert_eq!(room_id, "room-7");
            assert_eq!(caller_connection_id, hero);
        }
        other => panic!("unexpected event {other:?}"),
    }
    let session_id = live_session_id(&harness).await;

    // Uplifter accepts; only the hero is told
    harness.registry.accept_call(uplifter).await.unwrap();
    expect_frame(&mut hero_rx, "callAccepted").await;

    // Hero submits feedback, which settles the session and ends the call
    harness
        .registry
        .submit_feedback(
            hero,
            FeedbackSubmission {
                final_mood: 4.0,
                feedback_text: "felt better".to_string(),
                rating_given: 6.0,
                inappropriate: false,
            },
        )
        .await
        .unwrap();

    expect_frame(&mut hero_rx, "feedbackAccepted").await;
    expect_frame(&mut hero_rx, "reenterQueue").await;
    expect_frame(&mut uplifter_rx, "reenterQueue").await;

    // Roster is free again
    let state = harness.registry.state().await.unwrap();
    assert_eq!(state.active_call_count, 0);
    assert_eq!(state.participant(hero).unwrap().presence, Presence::Online);
    assert_eq!(
        state.participant(uplifter).unwrap().presence,
        Presence::Online
    );

    // Session row carries the feedback
    let session = harness.sessions.session(session_id).await.unwrap();
    assert_eq!(session.status, SessionStatus::Completed);
    assert_eq!(session.final_mood, Some(4.0));
    assert_eq!(session.feedback_text.as_deref(), Some("felt better"));
    assert_eq!(session.rating_given, Some(6.0));
    assert!(session.ended_at.is_some());

    // One bundle call consumed
    let subscription = harness
        .subscriptions
        .subscription(&UserId::new("hero-1"))
        .await
        .unwrap();
    assert_eq!(subscription.bundle_balance, 2);

    // Rating averages and rounds: (4 + 6) / 2 = 5
    let profile = harness
        .profiles
        .profile(&UserId::new("uplifter-1"))
        .await
        .unwrap();
    assert!((profile.rating - 5.0).abs() < f64::EPSILON);
}

#[tokio::test]
async fn decline_frees_both_for_another_call() {
    let harness = spawn_harness(RegistrySettings::default());
    let (hero, mut hero_rx) = connect(&harness).await;
    let (uplifter, mut uplifter_rx) = connect(&harness).await;
    register(&harness, hero, "ray", "hero-1", Role::Hero).await;
    register(&harness, uplifter, "sunny", "uplifter-1", Role::Uplifter).await;

    let request = CallRequest {
        caller_name: "ray".to_string(),
        room_id: "room-7".to_string(),
        callee: uplifter,
        initial_mood: 2.0,
    };

    harness
        .registry
        .request_call(hero, request.clone())
        .await
        .unwrap();
    expect_frame(&mut uplifter_rx, "incomingCall").await;
    let first_session = live_session_id(&harness).await;

    harness.registry.decline_call(uplifter).await.unwrap();
    expect_frame(&mut hero_rx, "callDeclined").await;
    wait_for_status(&harness.sessions, first_session, SessionStatus::Declined).await;

    // Both parties are free; a second attempt rings again
    harness.registry.request_call(hero, request).await.unwrap();
    expect_frame(&mut uplifter_rx, "incomingCall").await;

    let state = harness.registry.state().await.unwrap();
    assert_eq!(state.active_call_count, 1);
    assert_eq!(harness.sessions.create_calls(), 2);
}

// ============================================================================
// Settlement races
// ============================================================================

#[tokio::test]
async fn racing_end_triggers_settle_once() {
    let harness = spawn_harness(RegistrySettings::default());
    harness.subscriptions.insert(hero_subscription(5)).await;
    let (hero, _hero_rx) = connect(&harness).await;
    let (uplifter, mut uplifter_rx) = connect(&harness).await;
    register(&harness, hero, "ray", "hero-1", Role::Hero).await;
    register(&harness, uplifter, "sunny", "uplifter-1", Role::Uplifter).await;

    harness
        .registry
        .request_call(
            hero,
            CallRequest {
                caller_name: "ray".to_string(),
                room_id: "room-7".to_string(),
                callee: uplifter,
                initial_mood: 2.0,
            },
        )
        .await
        .unwrap();
    expect_frame(&mut uplifter_rx, "incomingCall").await;
    let session_id = live_session_id(&harness).await;
    harness.registry.accept_call(uplifter).await.unwrap();

    // Both sides race to end; the registry serializes them, so exactly one
    // wins and one gets the no-active-call refusal
    let hero_end = {
        let registry = harness.registry.clone();
        tokio::spawn(async move { registry.end_call(hero).await })
    };
    let uplifter_end = {
        let registry = harness.registry.clone();
        tokio::spawn(async move { registry.end_call(uplifter).await })
    };

    let results = [hero_end.await.unwrap(), uplifter_end.await.unwrap()];
    let wins = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(wins, 1, "exactly one end wins: {results:?}");

    wait_for_status(&harness.sessions, session_id, SessionStatus::Completed).await;
    assert_eq!(harness.sessions.settle_calls(), 1);

    // One deduction, not two
    let subscription = harness
        .subscriptions
        .subscription(&UserId::new("hero-1"))
        .await
        .unwrap();
    assert_eq!(subscription.bundle_balance, 4);
}

#[tokio::test]
async fn weekly_window_is_consumed_before_bundle() {
    let harness = spawn_harness(RegistrySettings::default());
    harness
        .subscriptions
        .insert(SubscriptionRecord {
            user_id: UserId::new("hero-1"),
            weekly_balance: 2,
            weekly_expires_at: Some(chrono::Utc::now() + chrono::Duration::days(3)),
            weekly_unlimited: false,
            bundle_balance: 5,
        })
        .await;
    let (hero, _hero_rx) = connect(&harness).await;
    let (uplifter, mut uplifter_rx) = connect(&harness).await;
    register(&harness, hero, "ray", "hero-1", Role::Hero).await;
    register(&harness, uplifter, "sunny", "uplifter-1", Role::Uplifter).await;

    harness
        .registry
        .request_call(
            hero,
            CallRequest {
                caller_name: "ray".to_string(),
                room_id: "room-7".to_string(),
                callee: uplifter,
                initial_mood: 2.0,
            },
        )
        .await
        .unwrap();
    expect_frame(&mut uplifter_rx, "incomingCall").await;
    let session_id = live_session_id(&harness).await;
    harness.registry.accept_call(uplifter).await.unwrap();
    harness.registry.end_call(hero).await.unwrap();

    wait_for_status(&harness.sessions, session_id, SessionStatus::Completed).await;

    let subscription = harness
        .subscriptions
        .subscription(&UserId::new("hero-1"))
        .await
        .unwrap();
    assert_eq!(subscription.weekly_balance, 1, "weekly window pays first");
    assert_eq!(subscription.bundle_balance, 5, "bundle untouched");
}

// ============================================================================
// Presence broadcasting
// ============================================================================

#[tokio::test]
async fn snapshots_track_roster_and_call_counts() {
    let harness = spawn_harness(RegistrySettings::default());

    // A socket that never registers still watches the roster
    let (_watcher, mut watcher_rx) = connect(&harness).await;
    let (hero, _hero_rx) = connect(&harness).await;
    let (uplifter, mut uplifter_rx) = connect(&harness).await;

    register(&harness, hero, "ray", "hero-1", Role::Hero).await;
    let first = expect_frame(&mut watcher_rx, "presenceSnapshot").await;
    match first {
        ServerEvent::PresenceSnapshot {
            online_count,
            active_call_count,
            ..
        } => {
            assert_eq!(online_count, 1);
            assert_eq!(active_call_count, 0);
        }
        other => panic!("unexpected event {other:?}"),
    }

    register(&harness, uplifter, "sunny", "uplifter-1", Role::Uplifter).await;
    expect_frame(&mut watcher_rx, "presenceSnapshot").await;

    harness
        .registry
        .request_call(
            hero,
            CallRequest {
                caller_name: "ray".to_string(),
                room_id: "room-7".to_string(),
                callee: uplifter,
                initial_mood: 2.0,
            },
        )
        .await
        .unwrap();
    expect_frame(&mut uplifter_rx, "incomingCall").await;

    // A ringing (not yet accepted) call already counts as active
    let busy = loop {
        match expect_frame(&mut watcher_rx, "presenceSnapshot").await {
            ServerEvent::PresenceSnapshot {
                active_call_count: 1,
                participants,
                ..
            } => break participants,
            _ => {}
        }
    };
    assert!(busy
        .iter()
        .all(|participant| participant.presence == Presence::Busy));

    harness.registry.end_call(hero).await.unwrap();
    loop {
        match expect_frame(&mut watcher_rx, "presenceSnapshot").await {
            ServerEvent::PresenceSnapshot {
                active_call_count: 0,
                participants,
                ..
            } => {
                assert!(participants
                    .iter()
                    .all(|participant| participant.presence == Presence::Online));
                break;
            }
            _ => {}
        }
    }
}

// ============================================================================
// Shutdown
// ============================================================================

#[tokio::test]
async fn shutdown_cancels_links_and_leaves_sessions_for_reconciliation() {
    let harness = spawn_harness(RegistrySettings::default());
    let (hero, _hero_rx) = connect(&harness).await;
    let (uplifter, mut uplifter_rx) = connect(&harness).await;
    register(&harness, hero, "ray", "hero-1", Role::Hero).await;
    register(&harness, uplifter, "sunny", "uplifter-1", Role::Uplifter).await;

    harness
        .registry
        .request_call(
            hero,
            CallRequest {
                caller_name: "ray".to_string(),
                room_id: "room-7".to_string(),
                callee: uplifter,
                initial_mood: 2.0,
            },
        )
        .await
        .unwrap();
    expect_frame(&mut uplifter_rx, "incomingCall").await;
    let session_id = live_session_id(&harness).await;
    harness.registry.accept_call(uplifter).await.unwrap();

    let observer = {
        let (sender, _receiver) = mpsc::channel(8);
        let link = ConnectionActorHandle::new(
            ConnectionId::new(),
            sender,
            harness.registry.child_token(),
        );
        harness.registry.attach(link.clone()).await.unwrap();
        link
    };

    harness.registry.cancel();
    tokio::time::sleep(Duration::from_millis(100)).await;

    // Shutdown cancels the outbound actors but does not settle live calls;
    // the row stays Ongoing for reconciliation
    assert!(observer.is_cancelled());
    let session = harness.sessions.session(session_id).await.unwrap();
    assert_eq!(session.status, SessionStatus::Ongoing);
    assert_eq!(harness.sessions.settle_calls(), 0);
}
