//! Negotiation engine adapter boundary
//!
//! Hides the underlying peer-to-peer media transport behind a small trait:
//! offer/answer creation, description application, candidate exchange,
//! track management, and two notification streams (connectivity changes
//! and remote track arrival). The session state machine treats every
//! failure here as input to its own error taxonomy.

use crate::media::LocalTrack;
use crate::types::{IceCandidate, MediaKind, SessionDescription};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;

/// Negotiation errors
#[derive(Error, Debug)]
pub enum NegotiationError {
    /// Offer/answer creation failed
    #[error("Failed to create description: {0}")]
    CreateFailed(String),

    /// A description could not be applied
    #[error("Description rejected: {0}")]
    DescriptionRejected(String),

    /// A connectivity candidate could not be parsed or applied
    #[error("Bad candidate: {0}")]
    BadCandidate(String),

    /// Track could not be attached or replaced
    #[error("Track operation failed: {0}")]
    TrackFailed(String),

    /// The engine (or its configuration fetch) could not be set up
    #[error("Setup failed: {0}")]
    SetupFailed(String),
}

/// Transport-level connectivity, as reported by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connectivity {
    /// Direct path established, media can flow
    Connected,
    /// Transient loss, may self-heal
    Disconnected,
    /// Unrecoverable transport failure
    Failed,
    /// Transport shut down
    Closed,
}

/// A track attached by the remote peer. The engine owns its lifecycle;
/// the session only holds a reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTrack {
    /// Engine-assigned track identifier
    pub id: String,
    /// Audio or video
    pub kind: MediaKind,
}

/// Notifications emitted by the engine while a call is live
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// Transport connectivity changed
    Connectivity(Connectivity),
    /// The peer's media arrived
    RemoteTrackAdded(RemoteTrack),
}

/// STUN/TURN server entry, fetched from an opaque configuration source
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    /// Server URLs
    pub urls: Vec<String>,
    /// Optional credential username
    pub username: Option<String>,
    /// Optional credential secret
    pub credential: Option<String>,
}

/// Opaque ICE configuration fetch (a collaborator REST call; the
/// credential provisioning itself is out of scope here)
#[async_trait]
pub trait IceServerProvider: Send + Sync {
    /// Fetch the ICE server list to configure a new engine with
    async fn fetch_ice_servers(&self) -> Result<Vec<IceServer>, NegotiationError>;
}

/// Peer-to-peer media negotiation engine for a single call.
///
/// All operations are asynchronous and may fail with platform, codec, or
/// network errors. `close` is idempotent. Exactly one side creates the
/// offer; the other only ever creates an answer.
#[async_trait]
pub trait NegotiationEngine: Send + Sync {
    /// Create the initial offer description
    async fn create_offer(&self) -> Result<SessionDescription, NegotiationError>;

    /// Create the answering description (requires an applied remote offer)
    async fn create_answer(&self) -> Result<SessionDescription, NegotiationError>;

    /// Apply a locally created description
    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), NegotiationError>;

    /// Apply the remote peer's description
    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), NegotiationError>;

    /// Apply a remote connectivity candidate. Must only be called after a
    /// remote description has been applied.
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), NegotiationError>;

    /// Attach a locally captured track to the session
    async fn add_track(&self, track: Arc<LocalTrack>) -> Result<(), NegotiationError>;

    /// Replace an attached track in place on its existing sender, without
    /// renegotiation
    async fn replace_track(
        &self,
        old: &LocalTrack,
        new: Arc<LocalTrack>,
    ) -> Result<(), NegotiationError>;

    /// Shut the engine down, releasing the transport. Idempotent.
    async fn close(&self);

    /// Subscribe to connectivity and remote-track notifications
    fn subscribe(&self) -> broadcast::Receiver<TransportEvent>;
}

/// Creates one [`NegotiationEngine`] per call from the fetched ICE
/// configuration
#[async_trait]
pub trait NegotiationEngineFactory: Send + Sync {
    /// Create a fresh engine for a new call
    async fn create(
        &self,
        ice_servers: &[IceServer],
    ) -> Result<Arc<dyn NegotiationEngine>, NegotiationError>;
}
