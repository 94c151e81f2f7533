//! Call session state machine
//!
//! One [`CallSession`] owns one call's lifecycle: it mediates between the
//! negotiation engine and the signaling channel, resolves event-ordering
//! races, and guarantees idempotent teardown of every acquired resource.
//!
//! All mutation goes through a single async mutex, so handlers for the two
//! independent input sources (signaling events and transport callbacks)
//! never run concurrently against the same session. Teardown is guarded by
//! the state machine itself: the first trigger path to run moves the state
//! to `Ending` and every later one observes an ineligible state and no-ops.

use crate::history::{CallLogEntry, CallLogSink};
use crate::media::{FacingMode, LocalTrack, MediaSource};
use crate::negotiation::{Connectivity, NegotiationEngine, RemoteTrack, TransportEvent};
use crate::registry::ActiveSlot;
use crate::signaling::{SignalingChannel, SignalingDispatcher, SignalingEvent};
use crate::types::{
    CallId, CallRole, CallState, ConnectionQuality, ConversationTarget, EndReason, IceCandidate,
    MediaKind, SessionConfig, SessionDescription, SessionEvent, SessionTimestamps,
};
use chrono::Utc;
use std::collections::VecDeque;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, Mutex};
use tokio::task::AbortHandle;
use uuid::Uuid;

/// Call session errors
#[derive(Error, Debug)]
pub enum SessionError {
    /// Permission denied or no capture device; fatal to setup
    #[error("Media unavailable: {0}")]
    MediaUnavailable(String),

    /// Offer/answer creation or description application failed; fatal
    #[error("Negotiation setup failed: {0}")]
    NegotiationSetupFailed(String),

    /// Best-effort outbound event could not be sent; non-fatal
    #[error("Signaling publish failed: {0}")]
    SignalingPublishFailed(String),

    /// A control call was made in a state that does not permit it. The
    /// session state is left untouched.
    #[error("Operation '{operation}' not permitted in state {state}")]
    InvalidStateTransition {
        /// The rejected operation
        operation: &'static str,
        /// The state the session was in
        state: CallState,
    },

    /// A remote candidate could not be parsed; dropped, never escalated
    #[error("Malformed remote candidate: {0}")]
    MalformedCandidate(String),

    /// Another call is already active on this device
    #[error("Another call is already active")]
    Busy,
}

impl From<crate::media::MediaError> for SessionError {
    fn from(err: crate::media::MediaError) -> Self {
        Self::MediaUnavailable(err.to_string())
    }
}

impl From<crate::negotiation::NegotiationError> for SessionError {
    fn from(err: crate::negotiation::NegotiationError) -> Self {
        match err {
            crate::negotiation::NegotiationError::BadCandidate(c) => Self::MalformedCandidate(c),
            other => Self::NegotiationSetupFailed(other.to_string()),
        }
    }
}

impl From<crate::signaling::SignalingError> for SessionError {
    fn from(err: crate::signaling::SignalingError) -> Self {
        Self::SignalingPublishFailed(err.to_string())
    }
}

/// Collaborators wired into a session at construction
pub struct SessionContext {
    /// Device-facing media source
    pub media: Arc<dyn MediaSource>,
    /// Per-call negotiation engine
    pub engine: Arc<dyn NegotiationEngine>,
    /// Outbound signaling channel
    pub signaling: Arc<dyn SignalingChannel>,
    /// Inbound event router, for route cleanup on teardown
    pub dispatcher: Arc<SignalingDispatcher>,
    /// Fire-and-forget call history sink
    pub call_log: Option<Arc<dyn CallLogSink>>,
    /// Timer and channel policy
    pub config: SessionConfig,
}

struct SessionInner {
    state: CallState,
    call_id: Option<CallId>,
    pending_offer: Option<SessionDescription>,
    local_tracks: Vec<Arc<LocalTrack>>,
    remote_tracks: Vec<RemoteTrack>,
    pending_remote_candidates: VecDeque<IceCandidate>,
    remote_description_applied: bool,
    quality: ConnectionQuality,
    timestamps: SessionTimestamps,
    duration_seconds: Option<u64>,
    reported_duration: Option<u64>,
    answer_timer: Option<AbortHandle>,
    ring_timer: Option<AbortHandle>,
}

impl SessionInner {
    fn new(
        state: CallState,
        call_id: Option<CallId>,
        pending_offer: Option<SessionDescription>,
    ) -> Self {
        Self {
            state,
            call_id,
            pending_offer,
            local_tracks: Vec::new(),
            remote_tracks: Vec::new(),
            pending_remote_candidates: VecDeque::new(),
            remote_description_applied: false,
            quality: ConnectionQuality::Good,
            timestamps: SessionTimestamps {
                started_at: Some(Utc::now()),
                connected_at: None,
                ended_at: None,
            },
            duration_seconds: None,
            reported_duration: None,
            answer_timer: None,
            ring_timer: None,
        }
    }
}

/// One call's session manager.
///
/// Created per call (outgoing on user action, incoming from an inbound
/// offer) and discarded after teardown; terminal states admit no restart.
pub struct CallSession {
    pub(crate) key: Uuid,
    role: CallRole,
    media_kind: MediaKind,
    target: Option<ConversationTarget>,
    remote_peer: String,
    ctx: SessionContext,
    slot: parking_lot::Mutex<Option<ActiveSlot>>,
    events: broadcast::Sender<SessionEvent>,
    inner: Mutex<SessionInner>,
}

impl CallSession {
    /// Create a caller-side session in `Initializing`. Call
    /// [`start_outgoing`](Self::start_outgoing) to drive it. Must be
    /// created inside a tokio runtime.
    pub fn outgoing(
        ctx: SessionContext,
        target: ConversationTarget,
        media_kind: MediaKind,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(ctx.config.event_capacity);
        let remote_peer = target
            .callee_ids
            .first()
            .cloned()
            .unwrap_or_else(|| target.conversation_id.clone());
        let session = Arc::new(Self {
            key: Uuid::new_v4(),
            role: CallRole::Caller,
            media_kind,
            target: Some(target),
            remote_peer,
            ctx,
            slot: parking_lot::Mutex::new(None),
            events,
            inner: Mutex::new(SessionInner::new(CallState::Initializing, None, None)),
        });
        session.spawn_transport_pump();
        session
    }

    /// Create a callee-side session in `Ringing` from an inbound offer.
    /// The ring timer is armed immediately; the session self-declines if
    /// the user neither accepts nor declines within the ringing window.
    pub fn incoming(
        ctx: SessionContext,
        call_id: CallId,
        caller_id: impl Into<String>,
        offer: SessionDescription,
        media_kind: MediaKind,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(ctx.config.event_capacity);
        let session = Arc::new(Self {
            key: Uuid::new_v4(),
            role: CallRole::Callee,
            media_kind,
            target: None,
            remote_peer: caller_id.into(),
            ctx,
            slot: parking_lot::Mutex::new(None),
            events,
            inner: Mutex::new(SessionInner::new(
                CallState::Ringing,
                Some(call_id),
                Some(offer),
            )),
        });
        session.spawn_transport_pump();
        session.with_fresh_inner(|s, inner| s.arm_ring_timer(inner));
        session
    }

    // Constructor-only helper: the inner mutex is uncontended on a fresh
    // session, so try_lock cannot fail here.
    fn with_fresh_inner(self: &Arc<Self>, f: impl FnOnce(&Arc<Self>, &mut SessionInner)) {
        if let Ok(mut inner) = self.inner.try_lock() {
            f(self, &mut inner);
        }
    }

    /// Which side of the call this is
    pub fn role(&self) -> CallRole {
        self.role
    }

    /// Audio or video call
    pub fn media_kind(&self) -> MediaKind {
        self.media_kind
    }

    /// The remote participant (callee for outgoing, caller for incoming)
    pub fn remote_peer(&self) -> &str {
        &self.remote_peer
    }

    /// Current state
    pub async fn state(&self) -> CallState {
        self.inner.lock().await.state
    }

    /// Server-assigned call id, once known
    pub async fn call_id(&self) -> Option<CallId> {
        self.inner.lock().await.call_id.clone()
    }

    /// Advisory connection quality
    pub async fn connection_quality(&self) -> ConnectionQuality {
        self.inner.lock().await.quality
    }

    /// Locally owned track handles
    pub async fn local_tracks(&self) -> Vec<Arc<LocalTrack>> {
        self.inner.lock().await.local_tracks.clone()
    }

    /// References to tracks the peer has attached
    pub async fn remote_tracks(&self) -> Vec<RemoteTrack> {
        self.inner.lock().await.remote_tracks.clone()
    }

    /// Lifecycle timestamps
    pub async fn timestamps(&self) -> SessionTimestamps {
        self.inner.lock().await.timestamps
    }

    /// Recorded call duration, set during teardown
    pub async fn duration_seconds(&self) -> Option<u64> {
        self.inner.lock().await.duration_seconds
    }

    /// Number of candidates buffered waiting for the remote description
    pub async fn buffered_candidates(&self) -> usize {
        self.inner.lock().await.pending_remote_candidates.len()
    }

    /// Subscribe to session notifications
    #[must_use]
    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub(crate) fn attach_slot(&self, slot: ActiveSlot) {
        *self.slot.lock() = Some(slot);
    }

    /// Acquire local media, produce and publish the offer, and start
    /// waiting for the remote answer.
    ///
    /// # Errors
    ///
    /// `MediaUnavailable` or `NegotiationSetupFailed` on setup failure; in
    /// both cases the session transitions to `Failed` and emits a terminal
    /// `Ended` event before returning.
    #[tracing::instrument(skip(self), fields(session = %self.key))]
    pub async fn start_outgoing(self: &Arc<Self>) -> Result<(), SessionError> {
        {
            let inner = self.inner.lock().await;
            if self.role != CallRole::Caller || inner.state != CallState::Initializing {
                return Err(SessionError::InvalidStateTransition {
                    operation: "start_outgoing",
                    state: inner.state,
                });
            }
        }

        // Media acquisition runs without the session lock; teardown can
        // win the race and the outcome is re-checked afterwards.
        let tracks = match self
            .ctx
            .media
            .acquire_tracks(self.media_kind, FacingMode::Front)
            .await
        {
            Ok(tracks) => tracks,
            Err(e) => {
                tracing::warn!(session = %self.key, error = %e, "Local media acquisition failed");
                self.fail_setup(EndReason::MediaUnavailable).await;
                return Err(SessionError::MediaUnavailable(e.to_string()));
            }
        };

        let mut inner = self.inner.lock().await;
        if !inner.state.teardown_eligible() {
            // Torn down while acquisition was in flight: release the fresh
            // tracks instead of attaching them.
            for track in &tracks {
                track.stop();
            }
            return Ok(());
        }

        for track in &tracks {
            if let Err(e) = self.ctx.engine.add_track(track.clone()).await {
                for track in &tracks {
                    track.stop();
                }
                drop(inner);
                self.fail_setup(EndReason::NegotiationFailed).await;
                return Err(SessionError::NegotiationSetupFailed(e.to_string()));
            }
        }
        inner.local_tracks = tracks.clone();
        for track in tracks {
            let _ = self.events.send(SessionEvent::LocalTrackReady { track });
        }

        let offer = match self.ctx.engine.create_offer().await {
            Ok(offer) => offer,
            Err(e) => {
                drop(inner);
                self.fail_setup(EndReason::NegotiationFailed).await;
                return Err(SessionError::NegotiationSetupFailed(e.to_string()));
            }
        };
        if let Err(e) = self.ctx.engine.set_local_description(offer.clone()).await {
            drop(inner);
            self.fail_setup(EndReason::NegotiationFailed).await;
            return Err(SessionError::NegotiationSetupFailed(e.to_string()));
        }

        // Best-effort: if the offer never leaves the device the answer
        // timer ends the call with NoAnswer.
        let target = self.target.clone().unwrap_or_else(|| ConversationTarget {
            conversation_id: self.remote_peer.clone(),
            callee_ids: vec![self.remote_peer.clone()],
        });
        if let Err(e) = self
            .ctx
            .signaling
            .publish(SignalingEvent::Offer {
                conversation_id: target.conversation_id,
                callee_ids: target.callee_ids,
                media_kind: self.media_kind,
                description: offer,
                call_id: None,
            })
            .await
        {
            tracing::warn!(session = %self.key, error = %e, "Failed to publish call offer");
        }

        self.transition(&mut inner, CallState::AwaitingAnswer);
        self.arm_answer_timer(&mut inner);
        Ok(())
    }

    /// Accept the inbound offer: apply it as the remote description, flush
    /// any buffered candidates, acquire local media, and publish the
    /// answer. Valid exactly once, from `Ringing`.
    ///
    /// # Errors
    ///
    /// `InvalidStateTransition` on a second accept or a caller-side
    /// session; `MediaUnavailable`/`NegotiationSetupFailed` on setup
    /// failure (the session transitions to `Failed`).
    #[tracing::instrument(skip(self), fields(session = %self.key))]
    pub async fn accept(self: &Arc<Self>) -> Result<(), SessionError> {
        {
            let mut inner = self.inner.lock().await;
            if self.role != CallRole::Callee || inner.state != CallState::Ringing {
                return Err(SessionError::InvalidStateTransition {
                    operation: "accept",
                    state: inner.state,
                });
            }
            let Some(offer) = inner.pending_offer.take() else {
                return Err(SessionError::InvalidStateTransition {
                    operation: "accept",
                    state: inner.state,
                });
            };

            if let Err(e) = self.ctx.engine.set_remote_description(offer).await {
                drop(inner);
                self.fail_setup(EndReason::NegotiationFailed).await;
                return Err(SessionError::NegotiationSetupFailed(e.to_string()));
            }
            inner.remote_description_applied = true;
            self.flush_pending_candidates(&mut inner).await;

            if let Some(timer) = inner.ring_timer.take() {
                timer.abort();
            }
            // Entering Negotiating here also rejects a racing second accept
            // while media acquisition below is still in flight.
            self.transition(&mut inner, CallState::Negotiating);
        }

        let tracks = match self
            .ctx
            .media
            .acquire_tracks(self.media_kind, FacingMode::Front)
            .await
        {
            Ok(tracks) => tracks,
            Err(e) => {
                tracing::warn!(session = %self.key, error = %e, "Local media acquisition failed");
                self.fail_setup(EndReason::MediaUnavailable).await;
                return Err(SessionError::MediaUnavailable(e.to_string()));
            }
        };

        let mut inner = self.inner.lock().await;
        if !inner.state.teardown_eligible() {
            for track in &tracks {
                track.stop();
            }
            return Ok(());
        }

        for track in &tracks {
            if let Err(e) = self.ctx.engine.add_track(track.clone()).await {
                for track in &tracks {
                    track.stop();
                }
                drop(inner);
                self.fail_setup(EndReason::NegotiationFailed).await;
                return Err(SessionError::NegotiationSetupFailed(e.to_string()));
            }
        }
        inner.local_tracks = tracks.clone();
        for track in tracks {
            let _ = self.events.send(SessionEvent::LocalTrackReady { track });
        }

        let answer = match self.ctx.engine.create_answer().await {
            Ok(answer) => answer,
            Err(e) => {
                drop(inner);
                self.fail_setup(EndReason::NegotiationFailed).await;
                return Err(SessionError::NegotiationSetupFailed(e.to_string()));
            }
        };
        if let Err(e) = self.ctx.engine.set_local_description(answer.clone()).await {
            drop(inner);
            self.fail_setup(EndReason::NegotiationFailed).await;
            return Err(SessionError::NegotiationSetupFailed(e.to_string()));
        }

        match inner.call_id.clone() {
            Some(call_id) => {
                if let Err(e) = self
                    .ctx
                    .signaling
                    .publish(SignalingEvent::Answer {
                        call_id,
                        description: answer,
                    })
                    .await
                {
                    tracing::warn!(session = %self.key, error = %e, "Failed to publish call answer");
                }
            }
            None => {
                tracing::warn!(session = %self.key, "Incoming session without call id, answer not published");
            }
        }
        Ok(())
    }

    /// Decline the inbound call without ever acquiring media.
    ///
    /// # Errors
    ///
    /// `InvalidStateTransition` unless the session is a ringing callee.
    #[tracing::instrument(skip(self), fields(session = %self.key))]
    pub async fn decline(self: &Arc<Self>) -> Result<(), SessionError> {
        let call_id = {
            let inner = self.inner.lock().await;
            if self.role != CallRole::Callee || inner.state != CallState::Ringing {
                return Err(SessionError::InvalidStateTransition {
                    operation: "decline",
                    state: inner.state,
                });
            }
            inner.call_id.clone()
        };

        if let Some(call_id) = call_id {
            if let Err(e) = self
                .ctx
                .signaling
                .publish(SignalingEvent::Decline { call_id })
                .await
            {
                tracing::warn!(session = %self.key, error = %e, "Failed to publish call decline");
            }
        }
        self.teardown(EndReason::LocalDeclined, None).await;
        Ok(())
    }

    /// Locally end the call. Publishes `call:end` best-effort; a publish
    /// failure never blocks local teardown. Safe to call repeatedly.
    #[tracing::instrument(skip(self), fields(session = %self.key))]
    pub async fn end(self: &Arc<Self>, duration_seconds: u64) {
        let (state, call_id) = {
            let mut inner = self.inner.lock().await;
            // The locally reported figure is authoritative over the
            // elapsed-time fallback, even when a racing remote hang-up
            // reaches teardown first.
            if inner.reported_duration.is_none() {
                inner.reported_duration = Some(duration_seconds);
            }
            (inner.state, inner.call_id.clone())
        };
        if !state.teardown_eligible() {
            return;
        }

        if let Some(call_id) = call_id {
            if let Err(e) = self
                .ctx
                .signaling
                .publish(SignalingEvent::End {
                    call_id,
                    duration_seconds,
                })
                .await
            {
                tracing::warn!(session = %self.key, error = %e, "Failed to publish call:end");
            }
        }
        self.teardown(EndReason::HungUp, Some(duration_seconds)).await;
    }

    /// Flip the audio track's enabled flag. Returns the new muted state;
    /// a no-op returning `false` when the call has no audio track.
    pub async fn toggle_mute(&self) -> bool {
        let inner = self.inner.lock().await;
        match inner
            .local_tracks
            .iter()
            .find(|t| t.kind == MediaKind::Audio)
        {
            Some(track) => !track.toggle_enabled(),
            None => false,
        }
    }

    /// Flip the video track's enabled flag. Returns the new video-off
    /// state; a no-op returning `false` on an audio-only call.
    pub async fn toggle_video(&self) -> bool {
        let inner = self.inner.lock().await;
        match inner
            .local_tracks
            .iter()
            .find(|t| t.kind == MediaKind::Video)
        {
            Some(track) => !track.toggle_enabled(),
            None => false,
        }
    }

    /// Replace the active video track with one captured from the opposite
    /// camera, in place on the existing sender (no renegotiation). If the
    /// media source cannot supply the replacement, the old track is left
    /// untouched and session state is unchanged.
    ///
    /// # Errors
    ///
    /// `InvalidStateTransition` when there is no active video track;
    /// `MediaUnavailable` when no alternate camera exists;
    /// `NegotiationSetupFailed` when the engine refuses the replacement.
    #[tracing::instrument(skip(self), fields(session = %self.key))]
    pub async fn switch_camera(self: &Arc<Self>) -> Result<FacingMode, SessionError> {
        let (old, facing) = {
            let inner = self.inner.lock().await;
            if !inner.state.teardown_eligible() {
                return Err(SessionError::InvalidStateTransition {
                    operation: "switch_camera",
                    state: inner.state,
                });
            }
            let Some(old) = inner
                .local_tracks
                .iter()
                .find(|t| t.kind == MediaKind::Video)
                .cloned()
            else {
                return Err(SessionError::InvalidStateTransition {
                    operation: "switch_camera",
                    state: inner.state,
                });
            };
            (old.clone(), old.facing.unwrap_or(FacingMode::Front).opposite())
        };

        // Acquired without the lock; nothing is altered on failure
        let new = self
            .ctx
            .media
            .acquire_video_track(facing)
            .await
            .map_err(|e| SessionError::MediaUnavailable(e.to_string()))?;

        let mut inner = self.inner.lock().await;
        if !inner.state.teardown_eligible() {
            new.stop();
            return Err(SessionError::InvalidStateTransition {
                operation: "switch_camera",
                state: inner.state,
            });
        }
        if let Err(e) = self.ctx.engine.replace_track(&old, new.clone()).await {
            new.stop();
            return Err(SessionError::NegotiationSetupFailed(e.to_string()));
        }

        if let Some(slot) = inner
            .local_tracks
            .iter_mut()
            .find(|t| Arc::ptr_eq(t, &old))
        {
            *slot = new.clone();
        }
        old.stop();
        tracing::info!(session = %self.key, facing = ?facing, "Camera switched");
        let _ = self.events.send(SessionEvent::LocalTrackReady { track: new });
        Ok(facing)
    }

    /// Single entry point for all inbound signaling events for this call.
    ///
    /// Never fails: duplicate, late, and malformed input maps to logged
    /// no-ops or internal state transitions.
    pub async fn handle_signaling_event(self: &Arc<Self>, event: SignalingEvent) {
        match event {
            SignalingEvent::Created { call_id } => {
                let mut inner = self.inner.lock().await;
                if inner.state.teardown_eligible() && inner.call_id.is_none() {
                    tracing::info!(session = %self.key, call_id = %call_id, "Call id assigned");
                    inner.call_id = Some(call_id.clone());
                    let _ = self.events.send(SessionEvent::CallIdAssigned(call_id));
                }
            }
            SignalingEvent::Answer { description, .. } => self.on_remote_answer(description).await,
            SignalingEvent::IceCandidate { candidate, .. } => {
                self.on_remote_candidate(candidate).await;
            }
            SignalingEvent::Decline { .. } => self.teardown(EndReason::RemoteDeclined, None).await,
            SignalingEvent::End { .. } | SignalingEvent::Ended { .. } => {
                self.teardown(EndReason::RemoteHangUp, None).await;
            }
            SignalingEvent::Busy { .. } => self.teardown(EndReason::Busy, None).await,
            SignalingEvent::Offer { .. } => {
                tracing::trace!(session = %self.key, "Offer delivered to existing session, dropping");
            }
        }
    }

    async fn on_remote_answer(self: &Arc<Self>, description: SessionDescription) {
        let mut inner = self.inner.lock().await;
        match inner.state {
            CallState::AwaitingAnswer => {}
            CallState::Negotiating | CallState::Connected => {
                // Re-delivery under at-least-once semantics; the remote
                // description is already applied.
                tracing::debug!(session = %self.key, "Duplicate answer dropped");
                return;
            }
            state => {
                tracing::trace!(session = %self.key, state = %state, "Answer in inapplicable state, dropping");
                return;
            }
        }

        if let Err(e) = self.ctx.engine.set_remote_description(description).await {
            tracing::warn!(session = %self.key, error = %e, "Failed to apply remote answer");
            drop(inner);
            self.fail_setup(EndReason::NegotiationFailed).await;
            return;
        }
        inner.remote_description_applied = true;
        self.flush_pending_candidates(&mut inner).await;
        if let Some(timer) = inner.answer_timer.take() {
            timer.abort();
        }
        self.transition(&mut inner, CallState::Negotiating);
    }

    async fn on_remote_candidate(&self, candidate: IceCandidate) {
        let mut inner = self.inner.lock().await;
        if !inner.state.teardown_eligible() {
            return;
        }
        if inner.remote_description_applied {
            if let Err(e) = self.ctx.engine.add_ice_candidate(candidate).await {
                // Malformed candidates are dropped, never fatal
                tracing::warn!(session = %self.key, error = %e, "Dropping remote candidate");
            }
        } else {
            inner.pending_remote_candidates.push_back(candidate);
            tracing::trace!(
                session = %self.key,
                buffered = inner.pending_remote_candidates.len(),
                "Candidate buffered ahead of remote description"
            );
        }
    }

    // Invariant: called immediately after the remote description has been
    // applied; drains in arrival order.
    async fn flush_pending_candidates(&self, inner: &mut SessionInner) {
        while let Some(candidate) = inner.pending_remote_candidates.pop_front() {
            if let Err(e) = self.ctx.engine.add_ice_candidate(candidate).await {
                tracing::warn!(session = %self.key, error = %e, "Dropping buffered candidate");
            }
        }
    }

    fn spawn_transport_pump(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let mut rx = self.ctx.engine.subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        let Some(session) = weak.upgrade() else { break };
                        session.handle_transport_event(event).await;
                        if session.state().await.is_terminal() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Transport event stream lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    async fn handle_transport_event(self: &Arc<Self>, event: TransportEvent) {
        match event {
            TransportEvent::Connectivity(Connectivity::Connected) => {
                let mut inner = self.inner.lock().await;
                if inner.state == CallState::Negotiating {
                    self.mark_connected(&mut inner);
                } else if inner.state == CallState::Connected
                    && inner.quality != ConnectionQuality::Good
                {
                    inner.quality = ConnectionQuality::Good;
                    let _ = self
                        .events
                        .send(SessionEvent::QualityChanged(ConnectionQuality::Good));
                }
            }
            TransportEvent::Connectivity(Connectivity::Disconnected) => {
                // Advisory only: transient hiccups self-heal and must not
                // end the call.
                let mut inner = self.inner.lock().await;
                if inner.state.teardown_eligible() && inner.quality != ConnectionQuality::Poor {
                    inner.quality = ConnectionQuality::Poor;
                    let _ = self
                        .events
                        .send(SessionEvent::QualityChanged(ConnectionQuality::Poor));
                }
            }
            TransportEvent::Connectivity(Connectivity::Failed | Connectivity::Closed) => {
                self.teardown(EndReason::TransportFailed, None).await;
            }
            TransportEvent::RemoteTrackAdded(track) => {
                let mut inner = self.inner.lock().await;
                if !inner.state.teardown_eligible() {
                    return;
                }
                if !inner.remote_tracks.iter().any(|t| t.id == track.id) {
                    inner.remote_tracks.push(track.clone());
                    let _ = self.events.send(SessionEvent::RemoteTrackReady { track });
                }
                if inner.state == CallState::Negotiating {
                    self.mark_connected(&mut inner);
                }
            }
        }
    }

    fn mark_connected(&self, inner: &mut SessionInner) {
        if let Some(timer) = inner.answer_timer.take() {
            timer.abort();
        }
        if let Some(timer) = inner.ring_timer.take() {
            timer.abort();
        }
        inner.timestamps.connected_at = Some(Utc::now());
        if inner.quality != ConnectionQuality::Good {
            inner.quality = ConnectionQuality::Good;
            let _ = self
                .events
                .send(SessionEvent::QualityChanged(ConnectionQuality::Good));
        }
        self.transition(inner, CallState::Connected);
    }

    fn arm_answer_timer(self: &Arc<Self>, inner: &mut SessionInner) {
        let weak = Arc::downgrade(self);
        let timeout = self.ctx.config.answer_timeout();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let Some(session) = weak.upgrade() else { return };
            // Remove our own abort handle first so teardown never aborts
            // the task that is running it.
            let fire = {
                let mut inner = session.inner.lock().await;
                inner.answer_timer = None;
                inner.state == CallState::AwaitingAnswer
            };
            if fire {
                tracing::info!(session = %session.key, "No answer within timeout window");
                session.teardown(EndReason::NoAnswer, None).await;
            }
        });
        inner.answer_timer = Some(handle.abort_handle());
    }

    fn arm_ring_timer(self: &Arc<Self>, inner: &mut SessionInner) {
        let weak = Arc::downgrade(self);
        let timeout = self.ctx.config.ring_timeout();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let Some(session) = weak.upgrade() else { return };
            let (fire, call_id) = {
                let mut inner = session.inner.lock().await;
                inner.ring_timer = None;
                (inner.state == CallState::Ringing, inner.call_id.clone())
            };
            if !fire {
                return;
            }
            tracing::info!(session = %session.key, "Ringing window elapsed, self-declining");
            if let Some(call_id) = call_id {
                if let Err(e) = session
                    .ctx
                    .signaling
                    .publish(SignalingEvent::Decline { call_id })
                    .await
                {
                    tracing::warn!(session = %session.key, error = %e, "Failed to publish self-decline");
                }
            }
            session.teardown(EndReason::RingTimeout, None).await;
        });
        inner.ring_timer = Some(handle.abort_handle());
    }

    fn transition(&self, inner: &mut SessionInner, to: CallState) {
        let from = inner.state;
        if from == to {
            return;
        }
        inner.state = to;
        tracing::debug!(
            session = %self.key,
            old_state = ?from,
            new_state = ?to,
            "Call state transition"
        );
        let _ = self.events.send(SessionEvent::StateChanged { from, to });
    }

    pub(crate) async fn fail_setup(self: &Arc<Self>, reason: EndReason) {
        self.teardown_with(CallState::Failed, reason, None).await;
    }

    async fn teardown(self: &Arc<Self>, reason: EndReason, duration: Option<u64>) {
        self.teardown_with(CallState::Ended, reason, duration).await;
    }

    // Idempotent teardown, guarded by the state machine: the first trigger
    // path to run moves the state to Ending; every later invocation
    // observes an ineligible state and becomes a no-op.
    async fn teardown_with(
        self: &Arc<Self>,
        final_state: CallState,
        reason: EndReason,
        duration: Option<u64>,
    ) {
        let (call_id, tracks) = {
            let mut inner = self.inner.lock().await;
            if !inner.state.teardown_eligible() {
                return;
            }
            self.transition(&mut inner, CallState::Ending);
            if let Some(timer) = inner.answer_timer.take() {
                timer.abort();
            }
            if let Some(timer) = inner.ring_timer.take() {
                timer.abort();
            }
            inner.pending_remote_candidates.clear();
            (inner.call_id.clone(), std::mem::take(&mut inner.local_tracks))
        };

        // Local tracks are released exactly once; track stop is itself
        // idempotent.
        for track in &tracks {
            track.stop();
        }

        self.ctx.engine.close().await;

        if let Some(ref call_id) = call_id {
            self.ctx.dispatcher.unregister(call_id).await;
        }
        self.ctx.dispatcher.clear_pending(self).await;
        self.release_slot();

        let (duration, ended_at) = {
            let mut inner = self.inner.lock().await;
            let now = Utc::now();
            inner.timestamps.ended_at = Some(now);
            let duration = duration.or(inner.reported_duration).or_else(|| {
                inner
                    .timestamps
                    .connected_at
                    .map(|connected| (now - connected).num_seconds().max(0) as u64)
            });
            inner.duration_seconds = duration;
            inner.remote_tracks.clear();
            self.transition(&mut inner, final_state);
            (duration, now)
        };

        if let (Some(sink), Some(call_id)) = (self.ctx.call_log.clone(), call_id) {
            let this = Arc::clone(self);
            // Fire-and-forget: the history sink must never delay teardown.
            // The duration is read at record time so a local end() that
            // lost the teardown race to a remote hang-up still gets its
            // reported figure into the log.
            tokio::spawn(async move {
                let duration_seconds = {
                    let mut inner = this.inner.lock().await;
                    if let Some(reported) = inner.reported_duration {
                        inner.duration_seconds = Some(reported);
                    }
                    inner.duration_seconds.unwrap_or(0)
                };
                sink.record(CallLogEntry {
                    call_id,
                    remote_peer: this.remote_peer.clone(),
                    duration_seconds,
                    outcome: reason.into(),
                    ended_at,
                })
                .await;
            });
        }

        tracing::info!(
            session = %self.key,
            reason = ?reason,
            final_state = ?final_state,
            "Call torn down"
        );
        let _ = self.events.send(SessionEvent::Ended {
            reason,
            duration_seconds: duration,
        });
    }

    fn release_slot(&self) {
        let slot = self.slot.lock().take();
        if let Some(slot) = slot {
            let mut active = slot.lock();
            if active.as_ref().is_some_and(|entry| entry.key == self.key) {
                *active = None;
            }
        }
    }
}

impl std::fmt::Debug for CallSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallSession")
            .field("key", &self.key)
            .field("role", &self.role)
            .field("media_kind", &self.media_kind)
            .field("remote_peer", &self.remote_peer)
            .finish_non_exhaustive()
    }
}
