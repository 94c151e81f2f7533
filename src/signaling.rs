//! Signaling events and per-call dispatch
//!
//! The signaling channel is an at-least-once, server-relayed transport:
//! events may arrive duplicated, late, or for calls that no longer exist.
//! Everything inbound is decoded at this boundary into one closed tagged
//! enum and routed to the owning session by call id; events for foreign or
//! stale call ids are dropped, not errors.

use crate::session::CallSession;
use crate::types::{CallId, IceCandidate, MediaKind, SessionDescription};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;

/// Signaling errors
#[derive(Error, Debug)]
pub enum SignalingError {
    /// Outbound event could not be sent
    #[error("Publish failed: {0}")]
    PublishFailed(String),

    /// Inbound payload could not be decoded
    #[error("Malformed signaling payload: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Signaling event types exchanged between call participants and the
/// coordinating server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SignalingEvent {
    /// A call is being offered
    #[serde(rename = "call:offer")]
    Offer {
        /// Conversation the call belongs to
        conversation_id: String,
        /// Participants being rung
        callee_ids: Vec<String>,
        /// Audio or video
        media_kind: MediaKind,
        /// The offer description
        description: SessionDescription,
        /// Present once the server has assigned an id (inbound relays);
        /// absent on the caller's initial publish
        #[serde(default, skip_serializing_if = "Option::is_none")]
        call_id: Option<CallId>,
    },

    /// Server acknowledgment of an outgoing offer
    #[serde(rename = "call:created")]
    Created {
        /// The assigned call id
        call_id: CallId,
    },

    /// The callee's answer
    #[serde(rename = "call:answer")]
    Answer {
        /// Call identifier
        call_id: CallId,
        /// The answer description
        description: SessionDescription,
    },

    /// Connectivity candidate from the peer
    #[serde(rename = "call:ice-candidate")]
    IceCandidate {
        /// Call identifier
        call_id: CallId,
        /// The candidate
        candidate: IceCandidate,
    },

    /// Callee declined the call
    #[serde(rename = "call:decline")]
    Decline {
        /// Call identifier
        call_id: CallId,
    },

    /// A participant ended the call
    #[serde(rename = "call:end")]
    End {
        /// Call identifier
        call_id: CallId,
        /// Duration reported by the ending side
        duration_seconds: u64,
    },

    /// Server/peer confirmation that the call is over
    #[serde(rename = "call:ended")]
    Ended {
        /// Call identifier
        call_id: CallId,
    },

    /// Callee already has an active call
    #[serde(rename = "call:busy")]
    Busy {
        /// Call identifier
        call_id: CallId,
    },
}

impl SignalingEvent {
    /// Decode a raw inbound payload.
    ///
    /// # Errors
    ///
    /// [`SignalingError::Decode`] when the payload is not one of the known
    /// event shapes.
    pub fn from_json(payload: &str) -> Result<Self, SignalingError> {
        Ok(serde_json::from_str(payload)?)
    }

    /// The call id this event refers to, when it carries one
    #[must_use]
    pub fn call_id(&self) -> Option<&CallId> {
        match self {
            Self::Offer { call_id, .. } => call_id.as_ref(),
            Self::Created { call_id }
            | Self::Answer { call_id, .. }
            | Self::IceCandidate { call_id, .. }
            | Self::Decline { call_id }
            | Self::End { call_id, .. }
            | Self::Ended { call_id }
            | Self::Busy { call_id } => Some(call_id),
        }
    }
}

/// Helper to extract the event type for tracing
pub(crate) fn event_type(event: &SignalingEvent) -> &'static str {
    match event {
        SignalingEvent::Offer { .. } => "call:offer",
        SignalingEvent::Created { .. } => "call:created",
        SignalingEvent::Answer { .. } => "call:answer",
        SignalingEvent::IceCandidate { .. } => "call:ice-candidate",
        SignalingEvent::Decline { .. } => "call:decline",
        SignalingEvent::End { .. } => "call:end",
        SignalingEvent::Ended { .. } => "call:ended",
        SignalingEvent::Busy { .. } => "call:busy",
    }
}

/// Outbound signaling channel.
///
/// Implement this for the concrete transport (websocket, DHT, gossip).
/// Delivery is at-least-once; publishing is best-effort from the session's
/// point of view.
#[async_trait]
pub trait SignalingChannel: Send + Sync {
    /// Publish an event toward the server/peer
    async fn publish(&self, event: SignalingEvent) -> Result<(), SignalingError>;
}

/// Routes inbound signaling events to the owning in-memory session.
///
/// Holds at most one pre-acknowledgment outgoing session (no call id yet);
/// the `call:created` ack binds it into the routing table. Unregistration
/// happens at most once per call id, during session teardown.
pub struct SignalingDispatcher {
    routes: Mutex<HashMap<CallId, Arc<CallSession>>>,
    pending_outgoing: Mutex<Option<Arc<CallSession>>>,
}

impl SignalingDispatcher {
    /// Create an empty dispatcher
    #[must_use]
    pub fn new() -> Self {
        Self {
            routes: Mutex::new(HashMap::new()),
            pending_outgoing: Mutex::new(None),
        }
    }

    /// Register a session under a known call id (incoming calls)
    pub async fn register(&self, call_id: CallId, session: Arc<CallSession>) {
        tracing::debug!(call_id = %call_id, "Registering signaling route");
        self.routes.lock().await.insert(call_id, session);
    }

    /// Hold an outgoing session until the server assigns its call id
    pub async fn register_pending(&self, session: Arc<CallSession>) {
        *self.pending_outgoing.lock().await = Some(session);
    }

    /// Remove the route for a call id. Safe to call for ids that were
    /// never registered or were already removed.
    pub async fn unregister(&self, call_id: &CallId) {
        if self.routes.lock().await.remove(call_id).is_some() {
            tracing::debug!(call_id = %call_id, "Unregistered signaling route");
        }
    }

    /// Drop the pending outgoing slot if it holds the given session
    pub async fn clear_pending(&self, session: &Arc<CallSession>) {
        let mut pending = self.pending_outgoing.lock().await;
        if pending
            .as_ref()
            .is_some_and(|p| Arc::ptr_eq(p, session))
        {
            *pending = None;
        }
    }

    /// Number of live routes (diagnostics)
    pub async fn route_count(&self) -> usize {
        self.routes.lock().await.len()
    }

    /// Deliver an inbound event to the session it belongs to.
    ///
    /// `call:created` binds the pending outgoing session into the routing
    /// table. Everything else is looked up by call id; misses are dropped
    /// at trace level since duplicate and late delivery are expected.
    pub async fn dispatch(&self, event: SignalingEvent) {
        if let SignalingEvent::Created { ref call_id } = event {
            let pending = self.pending_outgoing.lock().await.take();
            match pending {
                Some(session) => {
                    self.routes
                        .lock()
                        .await
                        .insert(call_id.clone(), session.clone());
                    session.handle_signaling_event(event).await;
                }
                None => {
                    tracing::trace!(call_id = %call_id, "call:created with no pending outgoing call, dropping");
                }
            }
            return;
        }

        let Some(call_id) = event.call_id() else {
            tracing::trace!(event = event_type(&event), "Inbound event without call id, dropping");
            return;
        };

        let session = self.routes.lock().await.get(call_id).cloned();
        match session {
            Some(session) => session.handle_signaling_event(event).await,
            None => {
                tracing::trace!(
                    call_id = %call_id,
                    event = event_type(&event),
                    "Event for unknown or stale call, dropping"
                );
            }
        }
    }
}

impl Default for SignalingDispatcher {
    fn default() -> Self {
        Self::new()
    }
}
