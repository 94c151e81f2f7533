//! Call session types and data structures

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Opaque call identifier assigned by the signaling server.
///
/// Absent on an outgoing call until the server acknowledges it with
/// `call:created`; present from the start for an incoming call.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CallId(pub String);

impl CallId {
    /// Wrap a server-assigned identifier
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the identifier as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CallId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for CallId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for CallId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Which side of the call this session is. Fixed at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallRole {
    /// This session created the offer
    Caller,
    /// This session answers an inbound offer
    Callee,
}

/// Kind of media negotiated for the call. Fixed at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    /// Audio only
    Audio,
    /// Audio and video
    Video,
}

impl MediaKind {
    /// Check if this kind carries a video track
    pub fn has_video(self) -> bool {
        matches!(self, Self::Video)
    }
}

/// Call session state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallState {
    /// Session created, media and negotiation not yet set up
    Initializing,
    /// Offer published, waiting for the remote answer (caller only)
    AwaitingAnswer,
    /// Inbound offer received, waiting for the user to accept (callee only)
    Ringing,
    /// Descriptions exchanged, connectivity being established
    Negotiating,
    /// Media is flowing
    Connected,
    /// Teardown in progress
    Ending,
    /// Call over, all resources released
    Ended,
    /// Unrecoverable setup error
    Failed,
}

impl CallState {
    /// Terminal states admit no further transitions
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Ended | Self::Failed)
    }

    /// States in which teardown has not yet begun
    pub fn teardown_eligible(self) -> bool {
        !matches!(self, Self::Ending | Self::Ended | Self::Failed)
    }
}

impl std::fmt::Display for CallState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Advisory transport health. Never drives teardown by itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionQuality {
    /// Transport healthy
    Good,
    /// Transient connectivity loss, expected to self-heal
    Poor,
    /// No connectivity
    Disconnected,
}

/// Why a call ended. Surfaced exactly once via [`SessionEvent::Ended`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EndReason {
    /// Local user hung up
    HungUp,
    /// Remote peer ended the call
    RemoteHangUp,
    /// Remote peer declined the call
    RemoteDeclined,
    /// Local user declined the incoming call
    LocalDeclined,
    /// Outgoing call was never answered within the timeout window
    NoAnswer,
    /// Incoming call was not accepted within the ringing window
    RingTimeout,
    /// Peer already had an active call
    Busy,
    /// Transport reported failed or closed
    TransportFailed,
    /// Local media could not be acquired
    MediaUnavailable,
    /// Offer/answer creation or description application failed
    NegotiationFailed,
}

/// Offer/answer discriminator for a session description
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    /// Initial description, created by the caller only
    Offer,
    /// Responding description, created by the callee only
    Answer,
}

/// A session description exchanged during negotiation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    /// Offer or answer
    pub kind: SdpKind,
    /// SDP payload
    pub sdp: String,
}

impl SessionDescription {
    /// Create an offer description
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    /// Create an answer description
    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// Connectivity candidate exchanged over signaling
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    /// Candidate string
    pub candidate: String,
    /// SDP media ID
    pub sdp_mid: Option<String>,
    /// SDP media line index
    pub sdp_mline_index: Option<u32>,
}

/// Who an outgoing call is addressed to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationTarget {
    /// Conversation the call belongs to
    pub conversation_id: String,
    /// Participants to ring
    pub callee_ids: Vec<String>,
}

impl ConversationTarget {
    /// Target a single peer within a conversation
    pub fn direct(conversation_id: impl Into<String>, callee_id: impl Into<String>) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            callee_ids: vec![callee_id.into()],
        }
    }
}

/// Notifications emitted by a call session for interested observers
/// (UI, logger, tests). Delivered over a broadcast channel so multiple
/// subscribers can coexist.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// A locally captured track is available
    LocalTrackReady {
        /// The track handle
        track: std::sync::Arc<crate::media::LocalTrack>,
    },
    /// The peer's media arrived
    RemoteTrackReady {
        /// The remote track reference
        track: crate::negotiation::RemoteTrack,
    },
    /// State machine transition
    StateChanged {
        /// Previous state
        from: CallState,
        /// New state
        to: CallState,
    },
    /// Advisory transport health changed
    QualityChanged(ConnectionQuality),
    /// The signaling server acknowledged an outgoing call
    CallIdAssigned(CallId),
    /// Terminal notification, emitted exactly once
    Ended {
        /// Why the call ended
        reason: EndReason,
        /// Call duration, when known
        duration_seconds: Option<u64>,
    },
}

/// Session policy configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// How long an outgoing call waits for an answer before ending with
    /// [`EndReason::NoAnswer`]
    pub answer_timeout_secs: u64,
    /// How long an incoming call rings before self-declining with
    /// [`EndReason::RingTimeout`]
    pub ring_timeout_secs: u64,
    /// Capacity of the session event broadcast channel
    pub event_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            answer_timeout_secs: 60,
            ring_timeout_secs: 60,
            event_capacity: 100,
        }
    }
}

impl SessionConfig {
    /// Answer timeout as a [`Duration`]
    pub fn answer_timeout(&self) -> Duration {
        Duration::from_secs(self.answer_timeout_secs)
    }

    /// Ring timeout as a [`Duration`]
    pub fn ring_timeout(&self) -> Duration {
        Duration::from_secs(self.ring_timeout_secs)
    }
}

/// Timestamps recorded over a session's lifetime
#[derive(Debug, Clone, Copy, Default)]
pub struct SessionTimestamps {
    /// When the session was created
    pub started_at: Option<DateTime<Utc>>,
    /// When the call reached [`CallState::Connected`]
    pub connected_at: Option<DateTime<Utc>>,
    /// When teardown completed
    pub ended_at: Option<DateTime<Utc>>,
}
