//! Media source collaborator boundary
//!
//! The session manager does not capture media itself; it consumes the
//! capability contract of a device-facing media source and owns the
//! resulting track handles for the lifetime of the call.

use crate::types::MediaKind;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

/// Media-related errors
#[derive(Error, Debug)]
pub enum MediaError {
    /// Permission denied or no capture device available
    #[error("Media unavailable: {0}")]
    Unavailable(String),

    /// No device satisfies the requested constraints (e.g. no second camera)
    #[error("No such device: {0}")]
    NoDevice(String),
}

/// Camera facing mode for video capture
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FacingMode {
    /// User-facing camera
    Front,
    /// Environment-facing camera
    Back,
}

impl FacingMode {
    /// The other camera
    pub fn opposite(self) -> Self {
        match self {
            Self::Front => Self::Back,
            Self::Back => Self::Front,
        }
    }
}

/// A locally captured media track.
///
/// Exclusively owned by the session that acquired it. The enabled flag is
/// what mute/video-off toggles flip; stopping releases the underlying
/// capture and is idempotent.
#[derive(Debug)]
pub struct LocalTrack {
    /// Track identifier
    pub id: Uuid,
    /// Audio or video
    pub kind: MediaKind,
    /// Camera facing, video tracks only
    pub facing: Option<FacingMode>,
    enabled: AtomicBool,
    stopped: AtomicBool,
}

impl LocalTrack {
    /// Create a new enabled track
    pub fn new(kind: MediaKind, facing: Option<FacingMode>) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            facing,
            enabled: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
        }
    }

    /// Whether the track is currently producing media
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Flip the enabled flag, returning the new enabled state
    pub fn toggle_enabled(&self) -> bool {
        // fetch_xor returns the previous value
        !self.enabled.fetch_xor(true, Ordering::SeqCst)
    }

    /// Release the underlying capture. Returns `true` only for the call
    /// that actually performed the stop.
    pub fn stop(&self) -> bool {
        let first = !self.stopped.swap(true, Ordering::SeqCst);
        if first {
            tracing::debug!(track_id = %self.id, kind = ?self.kind, "Local track stopped");
        }
        first
    }

    /// Whether the track has been released
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

/// Device-facing media source.
///
/// Implementations wrap platform capture APIs. All operations are
/// asynchronous and may fail; the session maps failures into its own
/// error taxonomy.
#[async_trait]
pub trait MediaSource: Send + Sync {
    /// Acquire the local tracks for a call: one audio track, plus one video
    /// track with the given facing mode when `kind` carries video.
    async fn acquire_tracks(
        &self,
        kind: MediaKind,
        facing: FacingMode,
    ) -> Result<Vec<Arc<LocalTrack>>, MediaError>;

    /// Acquire a single replacement video track with the given facing mode,
    /// used for in-call camera switching.
    async fn acquire_video_track(
        &self,
        facing: FacingMode,
    ) -> Result<Arc<LocalTrack>, MediaError>;
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_toggle_is_involution() {
        let track = LocalTrack::new(MediaKind::Audio, None);
        assert!(track.is_enabled());

        assert!(!track.toggle_enabled());
        assert!(!track.is_enabled());

        assert!(track.toggle_enabled());
        assert!(track.is_enabled());
    }

    #[test]
    fn test_stop_is_idempotent() {
        let track = LocalTrack::new(MediaKind::Video, Some(FacingMode::Front));
        assert!(!track.is_stopped());

        assert!(track.stop());
        assert!(track.is_stopped());

        // Second stop is a no-op
        assert!(!track.stop());
        assert!(track.is_stopped());
    }

    #[test]
    fn test_facing_mode_opposite() {
        assert_eq!(FacingMode::Front.opposite(), FacingMode::Back);
        assert_eq!(FacingMode::Back.opposite(), FacingMode::Front);
    }
}
