//! Real-time call session orchestration
//!
//! This library manages the lifecycle of one-to-one audio and video calls:
//! media acquisition, offer/answer negotiation, candidate exchange,
//! connection health, and deterministic teardown. It features:
//!
//! - **Explicit State Machine**: Every transition validated and observable
//! - **Ordering Tolerance**: Candidates arriving before the remote
//!   description are buffered and flushed in arrival order
//! - **Idempotent Teardown**: Every end path converges on one cleanup
//!   routine; concurrent triggers are safe
//! - **Single Active Call**: A device-wide registry rejects or busy-signals
//!   overlapping calls
//! - **Pluggable Transports**: Media, negotiation, and signaling are trait
//!   seams the application wires in
//!
//! # Examples
//!
//! ```rust,no_run
//! use call_session::{CallRegistry, ConversationTarget, MediaKind};
//! use std::sync::Arc;
//!
//! # async fn example(
//! #     media: Arc<dyn call_session::MediaSource>,
//! #     engines: Arc<dyn call_session::NegotiationEngineFactory>,
//! #     ice: Arc<dyn call_session::IceServerProvider>,
//! #     signaling: Arc<dyn call_session::SignalingChannel>,
//! # ) -> Result<(), call_session::SessionError> {
//! let registry = CallRegistry::builder(media, engines, ice, signaling).build();
//!
//! // Place a video call
//! let session = registry
//!     .start_outgoing(
//!         ConversationTarget::direct("conv-1", "frank-grace-henry-iris"),
//!         MediaKind::Video,
//!     )
//!     .await?;
//!
//! // Later: hang up
//! session.end(42).await;
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::panic)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::all)]
#![allow(clippy::pedantic)]
#![allow(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

/// Core call types and data structures
pub mod types;

/// Local media track handles and the capture source seam
pub mod media;

/// Negotiation engine seam and transport events
pub mod negotiation;

/// Signaling protocol events, the outbound channel seam, and the inbound
/// dispatcher
pub mod signaling;

/// Per-call session state machine
pub mod session;

/// Device-wide registry enforcing the single-active-call policy
pub mod registry;

/// Call history recording
pub mod history;

// Re-export main types at crate root
pub use history::{CallLogEntry, CallLogSink, CallOutcome};
pub use media::{FacingMode, LocalTrack, MediaError, MediaSource};
pub use negotiation::{
    Connectivity, IceServer, IceServerProvider, NegotiationEngine, NegotiationEngineFactory,
    NegotiationError, RemoteTrack, TransportEvent,
};
pub use registry::{CallRegistry, CallRegistryBuilder};
pub use session::{CallSession, SessionContext, SessionError};
pub use signaling::{SignalingChannel, SignalingDispatcher, SignalingError, SignalingEvent};
pub use types::*;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::history::{CallLogEntry, CallLogSink, CallOutcome};
    pub use crate::media::{FacingMode, LocalTrack, MediaSource};
    pub use crate::negotiation::{
        IceServerProvider, NegotiationEngine, NegotiationEngineFactory,
    };
    pub use crate::registry::CallRegistry;
    pub use crate::session::{CallSession, SessionError};
    pub use crate::signaling::{SignalingChannel, SignalingDispatcher, SignalingEvent};
    pub use crate::types::{
        CallId, CallRole, CallState, ConnectionQuality, ConversationTarget, EndReason, MediaKind,
        SessionConfig, SessionEvent,
    };
}
