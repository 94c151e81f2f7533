//! Device-wide call registry
//!
//! One [`CallRegistry`] per device enforces the single-active-call policy:
//! at most one non-terminal session exists at a time. The registry is the
//! entry point for both directions of call setup and the funnel for raw
//! inbound signaling.

use crate::history::CallLogSink;
use crate::media::MediaSource;
use crate::negotiation::{IceServerProvider, NegotiationEngineFactory};
use crate::session::{CallSession, SessionContext, SessionError};
use crate::signaling::{SignalingChannel, SignalingDispatcher, SignalingEvent};
use crate::types::{
    CallId, ConversationTarget, EndReason, MediaKind, SessionConfig, SessionDescription,
};
use std::sync::Arc;
use uuid::Uuid;

pub(crate) struct ActiveCall {
    pub(crate) key: Uuid,
    pub(crate) session: Arc<CallSession>,
}

// Shared between the registry and each session so teardown can vacate the
// slot without going back through the registry.
pub(crate) type ActiveSlot = Arc<parking_lot::Mutex<Option<ActiveCall>>>;

/// Builder for [`CallRegistry`]
pub struct CallRegistryBuilder {
    media: Arc<dyn MediaSource>,
    engine_factory: Arc<dyn NegotiationEngineFactory>,
    ice_provider: Arc<dyn IceServerProvider>,
    signaling: Arc<dyn SignalingChannel>,
    call_log: Option<Arc<dyn CallLogSink>>,
    config: SessionConfig,
}

impl CallRegistryBuilder {
    /// Record finished calls to the given sink
    #[must_use]
    pub fn with_call_log(mut self, sink: Arc<dyn CallLogSink>) -> Self {
        self.call_log = Some(sink);
        self
    }

    /// Override timer and channel policy
    #[must_use]
    pub fn with_config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    /// Finish building
    #[must_use]
    pub fn build(self) -> CallRegistry {
        CallRegistry {
            media: self.media,
            engine_factory: self.engine_factory,
            ice_provider: self.ice_provider,
            signaling: self.signaling,
            dispatcher: Arc::new(SignalingDispatcher::new()),
            call_log: self.call_log,
            config: self.config,
            active: Arc::new(parking_lot::Mutex::new(None)),
        }
    }
}

/// Creates sessions, enforces the one-active-call invariant, and routes
/// inbound signaling to the session it belongs to.
pub struct CallRegistry {
    media: Arc<dyn MediaSource>,
    engine_factory: Arc<dyn NegotiationEngineFactory>,
    ice_provider: Arc<dyn IceServerProvider>,
    signaling: Arc<dyn SignalingChannel>,
    dispatcher: Arc<SignalingDispatcher>,
    call_log: Option<Arc<dyn CallLogSink>>,
    config: SessionConfig,
    active: ActiveSlot,
}

impl CallRegistry {
    /// Start configuring a registry
    pub fn builder(
        media: Arc<dyn MediaSource>,
        engine_factory: Arc<dyn NegotiationEngineFactory>,
        ice_provider: Arc<dyn IceServerProvider>,
        signaling: Arc<dyn SignalingChannel>,
    ) -> CallRegistryBuilder {
        CallRegistryBuilder {
            media,
            engine_factory,
            ice_provider,
            signaling,
            call_log: None,
            config: SessionConfig::default(),
        }
    }

    /// The inbound event router, for wiring up the transport subscription
    #[must_use]
    pub fn dispatcher(&self) -> Arc<SignalingDispatcher> {
        Arc::clone(&self.dispatcher)
    }

    /// The currently active session, if any
    #[must_use]
    pub fn active(&self) -> Option<Arc<CallSession>> {
        self.active.lock().as_ref().map(|entry| Arc::clone(&entry.session))
    }

    /// Place an outgoing call.
    ///
    /// On success the returned session is in `AwaitingAnswer` and owns the
    /// active slot. Setup failures leave no active call behind.
    ///
    /// # Errors
    ///
    /// `Busy` when another call is live, `NegotiationSetupFailed` when the
    /// transport cannot be provisioned, plus whatever
    /// [`CallSession::start_outgoing`] reports.
    #[tracing::instrument(skip(self))]
    pub async fn start_outgoing(
        &self,
        target: ConversationTarget,
        media_kind: MediaKind,
    ) -> Result<Arc<CallSession>, SessionError> {
        self.ensure_idle().await?;

        let session = self.provision(None).await.map(
            |ctx| CallSession::outgoing(ctx, target, media_kind),
        )?;
        if let Err(err) = self.occupy_slot(&session) {
            // Lost a setup race after provisioning: release the fresh
            // session's transport before reporting busy.
            session.fail_setup(EndReason::Busy).await;
            return Err(err);
        }
        self.dispatcher.register_pending(Arc::clone(&session)).await;

        // On failure the session has already torn itself down, vacating
        // the slot and the pending route.
        session.start_outgoing().await?;
        Ok(session)
    }

    /// Admit an inbound offer as a ringing session, or reject it with
    /// `call:busy` when a call is already live.
    ///
    /// # Errors
    ///
    /// `Busy` when another call is live (the busy event has already been
    /// published), `NegotiationSetupFailed` when the transport cannot be
    /// provisioned.
    #[tracing::instrument(skip(self, offer), fields(call_id = %call_id))]
    pub async fn handle_incoming_offer(
        &self,
        call_id: CallId,
        caller_id: impl Into<String> + std::fmt::Debug,
        media_kind: MediaKind,
        offer: SessionDescription,
    ) -> Result<Arc<CallSession>, SessionError> {
        if let Err(err) = self.ensure_idle().await {
            tracing::info!(call_id = %call_id, "Rejecting inbound call, another call is active");
            self.publish_busy(&call_id).await;
            return Err(err);
        }

        let session = self.provision(Some(&call_id)).await.map(|ctx| {
            CallSession::incoming(ctx, call_id.clone(), caller_id, offer, media_kind)
        })?;
        if let Err(err) = self.occupy_slot(&session) {
            // Lost a setup race after provisioning: tear the ringing
            // session down (cancelling its ring timer and closing its
            // transport) and signal busy like the fast-path rejection.
            session.fail_setup(EndReason::Busy).await;
            self.publish_busy(&call_id).await;
            return Err(err);
        }
        self.dispatcher.register(call_id, Arc::clone(&session)).await;
        Ok(session)
    }

    /// Funnel for raw inbound signaling: inbound offers become new ringing
    /// sessions, everything else is routed to the session it names.
    ///
    /// # Errors
    ///
    /// Propagates [`handle_incoming_offer`](Self::handle_incoming_offer)
    /// failures; routed events never fail.
    pub async fn handle_event(&self, event: SignalingEvent) -> Result<(), SessionError> {
        match event {
            SignalingEvent::Offer {
                conversation_id,
                media_kind,
                description,
                call_id: Some(call_id),
                ..
            } => {
                self.handle_incoming_offer(call_id, conversation_id, media_kind, description)
                    .await?;
                Ok(())
            }
            SignalingEvent::Offer { call_id: None, .. } => {
                tracing::warn!("Inbound offer without call id, dropping");
                Ok(())
            }
            other => {
                self.dispatcher.dispatch(other).await;
                Ok(())
            }
        }
    }

    async fn publish_busy(&self, call_id: &CallId) {
        if let Err(e) = self
            .signaling
            .publish(SignalingEvent::Busy {
                call_id: call_id.clone(),
            })
            .await
        {
            tracing::warn!(call_id = %call_id, error = %e, "Failed to publish call:busy");
        }
    }

    // Busy unless the slot is empty. A terminal session still parked in
    // the slot is stale (teardown normally vacates it) and is evicted.
    async fn ensure_idle(&self) -> Result<(), SessionError> {
        let current = self
            .active
            .lock()
            .as_ref()
            .map(|entry| (entry.key, Arc::clone(&entry.session)));
        if let Some((key, session)) = current {
            if session.state().await.is_terminal() {
                let mut active = self.active.lock();
                if active.as_ref().is_some_and(|entry| entry.key == key) {
                    tracing::debug!(session = %key, "Evicting stale terminal session");
                    *active = None;
                }
            } else {
                return Err(SessionError::Busy);
            }
        }
        Ok(())
    }

    async fn provision(&self, call_id: Option<&CallId>) -> Result<SessionContext, SessionError> {
        let ice_servers = self.ice_provider.fetch_ice_servers().await.map_err(|e| {
            tracing::warn!(error = %e, "ICE server fetch failed");
            SessionError::NegotiationSetupFailed(e.to_string())
        })?;
        let engine = self.engine_factory.create(&ice_servers).await.map_err(|e| {
            tracing::warn!(error = %e, ?call_id, "Negotiation engine creation failed");
            SessionError::NegotiationSetupFailed(e.to_string())
        })?;
        Ok(SessionContext {
            media: Arc::clone(&self.media),
            engine,
            signaling: Arc::clone(&self.signaling),
            dispatcher: Arc::clone(&self.dispatcher),
            call_log: self.call_log.clone(),
            config: self.config.clone(),
        })
    }

    fn occupy_slot(&self, session: &Arc<CallSession>) -> Result<(), SessionError> {
        session.attach_slot(Arc::clone(&self.active));
        let mut active = self.active.lock();
        if active.is_some() {
            // Lost a race with a concurrent setup
            return Err(SessionError::Busy);
        }
        *active = Some(ActiveCall {
            key: session.key,
            session: Arc::clone(session),
        });
        Ok(())
    }
}
