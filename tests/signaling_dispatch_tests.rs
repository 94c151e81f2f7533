//! Routing tests for the inbound signaling dispatcher.

mod support;

use call_session::{
    CallId, CallSession, CallState, ConversationTarget, MediaKind, SessionConfig, SessionContext,
    SessionDescription, SignalingDispatcher, SignalingEvent,
};
use std::sync::Arc;
use support::{MockChannel, MockEngine, MockMedia};

fn context(dispatcher: Arc<SignalingDispatcher>) -> SessionContext {
    SessionContext {
        media: MockMedia::new(),
        engine: MockEngine::new(),
        signaling: MockChannel::new(),
        dispatcher,
        call_log: None,
        config: SessionConfig::default(),
    }
}

#[tokio::test]
async fn created_ack_binds_the_pending_outgoing_session() {
    let dispatcher = Arc::new(SignalingDispatcher::new());
    let session = CallSession::outgoing(
        context(dispatcher.clone()),
        ConversationTarget::direct("conv-1", "bob"),
        MediaKind::Audio,
    );
    session.start_outgoing().await.unwrap();
    dispatcher.register_pending(session.clone()).await;

    dispatcher
        .dispatch(SignalingEvent::Created {
            call_id: CallId::new("srv-1"),
        })
        .await;

    assert_eq!(session.call_id().await, Some(CallId::new("srv-1")));
    assert_eq!(dispatcher.route_count().await, 1);

    // Events for the bound id now reach the session
    dispatcher
        .dispatch(SignalingEvent::Answer {
            call_id: CallId::new("srv-1"),
            description: SessionDescription::answer("v=0"),
        })
        .await;
    assert_eq!(session.state().await, CallState::Negotiating);
}

#[tokio::test]
async fn created_without_a_pending_call_is_dropped() {
    let dispatcher = Arc::new(SignalingDispatcher::new());
    dispatcher
        .dispatch(SignalingEvent::Created {
            call_id: CallId::new("srv-ghost"),
        })
        .await;
    assert_eq!(dispatcher.route_count().await, 0);
}

#[tokio::test]
async fn events_for_unknown_calls_are_dropped() {
    let dispatcher = Arc::new(SignalingDispatcher::new());

    // None of these may panic or create state
    dispatcher
        .dispatch(SignalingEvent::Answer {
            call_id: CallId::new("nope"),
            description: SessionDescription::answer("v=0"),
        })
        .await;
    dispatcher
        .dispatch(SignalingEvent::Ended {
            call_id: CallId::new("nope"),
        })
        .await;
    assert_eq!(dispatcher.route_count().await, 0);
}

#[tokio::test]
async fn teardown_removes_the_route() {
    let dispatcher = Arc::new(SignalingDispatcher::new());
    let session = CallSession::incoming(
        context(dispatcher.clone()),
        CallId::new("srv-2"),
        "alice",
        SessionDescription::offer("v=0"),
        MediaKind::Audio,
    );
    dispatcher
        .register(CallId::new("srv-2"), session.clone())
        .await;
    assert_eq!(dispatcher.route_count().await, 1);

    dispatcher
        .dispatch(SignalingEvent::Ended {
            call_id: CallId::new("srv-2"),
        })
        .await;
    assert_eq!(session.state().await, CallState::Ended);
    assert_eq!(dispatcher.route_count().await, 0);

    // Late duplicates for the dead call are silently dropped
    dispatcher
        .dispatch(SignalingEvent::Ended {
            call_id: CallId::new("srv-2"),
        })
        .await;
    assert_eq!(session.state().await, CallState::Ended);
}

#[tokio::test]
async fn abandoned_pending_session_is_cleared_on_teardown() {
    let dispatcher = Arc::new(SignalingDispatcher::new());
    let session = CallSession::outgoing(
        context(dispatcher.clone()),
        ConversationTarget::direct("conv-1", "bob"),
        MediaKind::Audio,
    );
    session.start_outgoing().await.unwrap();
    dispatcher.register_pending(session.clone()).await;

    session.end(0).await;

    // A stray ack after teardown must not bind the dead session
    dispatcher
        .dispatch(SignalingEvent::Created {
            call_id: CallId::new("srv-3"),
        })
        .await;
    assert_eq!(dispatcher.route_count().await, 0);
    assert_eq!(session.call_id().await, None);
}

#[tokio::test]
async fn registry_drops_offers_without_a_call_id() {
    let h = support::Harness::new();
    h.registry
        .handle_event(SignalingEvent::Offer {
            conversation_id: "conv-1".to_string(),
            callee_ids: vec!["me".to_string()],
            media_kind: MediaKind::Audio,
            description: SessionDescription::offer("v=0"),
            call_id: None,
        })
        .await
        .unwrap();
    assert!(h.registry.active().is_none());
}
