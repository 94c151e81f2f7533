//! Shared test doubles implementing the library's collaborator traits.
#![allow(dead_code)]

use async_trait::async_trait;
use call_session::{
    CallLogEntry, CallLogSink, FacingMode, IceCandidate, IceServer, IceServerProvider, LocalTrack,
    MediaError, MediaKind, MediaSource, NegotiationEngine, NegotiationEngineFactory,
    NegotiationError, SessionDescription, SignalingChannel, SignalingError, SignalingEvent,
    TransportEvent,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, Notify};

/// Media source returning synthetic tracks, with switches for failure
/// injection and a gate to hold acquisition mid-flight.
pub struct MockMedia {
    pub fail: AtomicBool,
    pub fail_switch: AtomicBool,
    pub gate: Mutex<Option<Arc<Notify>>>,
    pub acquired: Mutex<Vec<Arc<LocalTrack>>>,
}

impl MockMedia {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            fail: AtomicBool::new(false),
            fail_switch: AtomicBool::new(false),
            gate: Mutex::new(None),
            acquired: Mutex::new(Vec::new()),
        })
    }

    /// Make the next acquisition block until the returned notify fires.
    pub fn hold_acquisition(&self) -> Arc<Notify> {
        let notify = Arc::new(Notify::new());
        *self.gate.lock() = Some(notify.clone());
        notify
    }
}

#[async_trait]
impl MediaSource for MockMedia {
    async fn acquire_tracks(
        &self,
        kind: MediaKind,
        facing: FacingMode,
    ) -> Result<Vec<Arc<LocalTrack>>, MediaError> {
        let gate = self.gate.lock().take();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(MediaError::Unavailable("permission denied".into()));
        }
        let mut tracks = vec![Arc::new(LocalTrack::new(MediaKind::Audio, None))];
        if kind.has_video() {
            tracks.push(Arc::new(LocalTrack::new(MediaKind::Video, Some(facing))));
        }
        self.acquired.lock().extend(tracks.iter().cloned());
        Ok(tracks)
    }

    async fn acquire_video_track(
        &self,
        facing: FacingMode,
    ) -> Result<Arc<LocalTrack>, MediaError> {
        if self.fail_switch.load(Ordering::SeqCst) {
            return Err(MediaError::NoDevice("no alternate camera".into()));
        }
        let track = Arc::new(LocalTrack::new(MediaKind::Video, Some(facing)));
        self.acquired.lock().push(track.clone());
        Ok(track)
    }
}

/// Negotiation engine that records every call and lets tests inject
/// transport events.
pub struct MockEngine {
    pub ops: Mutex<Vec<String>>,
    pub candidates: Mutex<Vec<IceCandidate>>,
    pub added_tracks: Mutex<Vec<Arc<LocalTrack>>>,
    pub replaced: Mutex<Vec<(uuid::Uuid, Arc<LocalTrack>)>>,
    pub close_count: AtomicUsize,
    pub fail_create_offer: AtomicBool,
    pub fail_create_answer: AtomicBool,
    pub fail_set_remote: AtomicBool,
    pub fail_add_candidate: AtomicBool,
    pub fail_replace_track: AtomicBool,
    pub events: broadcast::Sender<TransportEvent>,
}

impl MockEngine {
    pub fn new() -> Arc<Self> {
        let (events, _) = broadcast::channel(64);
        Arc::new(Self {
            ops: Mutex::new(Vec::new()),
            candidates: Mutex::new(Vec::new()),
            added_tracks: Mutex::new(Vec::new()),
            replaced: Mutex::new(Vec::new()),
            close_count: AtomicUsize::new(0),
            fail_create_offer: AtomicBool::new(false),
            fail_create_answer: AtomicBool::new(false),
            fail_set_remote: AtomicBool::new(false),
            fail_add_candidate: AtomicBool::new(false),
            fail_replace_track: AtomicBool::new(false),
            events,
        })
    }

    pub fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }

    pub fn op_log(&self) -> Vec<String> {
        self.ops.lock().clone()
    }
}

#[async_trait]
impl NegotiationEngine for MockEngine {
    async fn create_offer(&self) -> Result<SessionDescription, NegotiationError> {
        self.ops.lock().push("create_offer".into());
        if self.fail_create_offer.load(Ordering::SeqCst) {
            return Err(NegotiationError::CreateFailed("offer".into()));
        }
        Ok(SessionDescription::offer("v=0 mock-offer"))
    }

    async fn create_answer(&self) -> Result<SessionDescription, NegotiationError> {
        self.ops.lock().push("create_answer".into());
        if self.fail_create_answer.load(Ordering::SeqCst) {
            return Err(NegotiationError::CreateFailed("answer".into()));
        }
        Ok(SessionDescription::answer("v=0 mock-answer"))
    }

    async fn set_local_description(
        &self,
        _description: SessionDescription,
    ) -> Result<(), NegotiationError> {
        self.ops.lock().push("set_local_description".into());
        Ok(())
    }

    async fn set_remote_description(
        &self,
        _description: SessionDescription,
    ) -> Result<(), NegotiationError> {
        self.ops.lock().push("set_remote_description".into());
        if self.fail_set_remote.load(Ordering::SeqCst) {
            return Err(NegotiationError::DescriptionRejected("remote".into()));
        }
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), NegotiationError> {
        self.ops.lock().push("add_ice_candidate".into());
        if self.fail_add_candidate.load(Ordering::SeqCst) {
            return Err(NegotiationError::BadCandidate(candidate.candidate));
        }
        self.candidates.lock().push(candidate);
        Ok(())
    }

    async fn add_track(&self, track: Arc<LocalTrack>) -> Result<(), NegotiationError> {
        self.ops.lock().push("add_track".into());
        self.added_tracks.lock().push(track);
        Ok(())
    }

    async fn replace_track(
        &self,
        old: &LocalTrack,
        new: Arc<LocalTrack>,
    ) -> Result<(), NegotiationError> {
        self.ops.lock().push("replace_track".into());
        if self.fail_replace_track.load(Ordering::SeqCst) {
            return Err(NegotiationError::TrackFailed("replace".into()));
        }
        self.replaced.lock().push((old.id, new));
        Ok(())
    }

    async fn close(&self) {
        self.close_count.fetch_add(1, Ordering::SeqCst);
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }
}

/// Factory handing out fresh mock engines and remembering each one so the
/// test can inspect it afterwards.
pub struct MockEngineFactory {
    pub engines: Mutex<Vec<Arc<MockEngine>>>,
    pub prime_fail_create_offer: AtomicBool,
    pub prime_fail_set_remote: AtomicBool,
}

impl MockEngineFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            engines: Mutex::new(Vec::new()),
            prime_fail_create_offer: AtomicBool::new(false),
            prime_fail_set_remote: AtomicBool::new(false),
        })
    }

    pub fn last_engine(&self) -> Arc<MockEngine> {
        self.engines
            .lock()
            .last()
            .cloned()
            .expect("no engine created yet")
    }
}

#[async_trait]
impl NegotiationEngineFactory for MockEngineFactory {
    async fn create(
        &self,
        _ice_servers: &[IceServer],
    ) -> Result<Arc<dyn NegotiationEngine>, NegotiationError> {
        let engine = MockEngine::new();
        if self.prime_fail_create_offer.load(Ordering::SeqCst) {
            engine.fail_create_offer.store(true, Ordering::SeqCst);
        }
        if self.prime_fail_set_remote.load(Ordering::SeqCst) {
            engine.fail_set_remote.store(true, Ordering::SeqCst);
        }
        self.engines.lock().push(engine.clone());
        Ok(engine)
    }
}

/// Static ICE configuration, with a gate to hold a fetch mid-flight.
pub struct MockIceProvider {
    pub gate: Mutex<Option<Arc<Notify>>>,
}

impl MockIceProvider {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            gate: Mutex::new(None),
        })
    }

    /// Make the next fetch block until the returned notify fires.
    pub fn hold_fetch(&self) -> Arc<Notify> {
        let notify = Arc::new(Notify::new());
        *self.gate.lock() = Some(notify.clone());
        notify
    }
}

#[async_trait]
impl IceServerProvider for MockIceProvider {
    async fn fetch_ice_servers(&self) -> Result<Vec<IceServer>, NegotiationError> {
        let gate = self.gate.lock().take();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        Ok(vec![IceServer {
            urls: vec!["stun:stun.example.org:3478".to_string()],
            username: None,
            credential: None,
        }])
    }
}

/// Signaling channel recording every published event.
pub struct MockChannel {
    pub published: Mutex<Vec<SignalingEvent>>,
    pub fail: AtomicBool,
}

impl MockChannel {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            published: Mutex::new(Vec::new()),
            fail: AtomicBool::new(false),
        })
    }

    pub fn published_types(&self) -> Vec<String> {
        self.published
            .lock()
            .iter()
            .map(|event| {
                serde_json::to_value(event)
                    .ok()
                    .and_then(|v| v["type"].as_str().map(str::to_string))
                    .unwrap_or_default()
            })
            .collect()
    }
}

#[async_trait]
impl SignalingChannel for MockChannel {
    async fn publish(&self, event: SignalingEvent) -> Result<(), SignalingError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(SignalingError::PublishFailed("offline".into()));
        }
        self.published.lock().push(event);
        Ok(())
    }
}

/// In-memory call history sink.
pub struct MemoryCallLog {
    pub entries: Mutex<Vec<CallLogEntry>>,
}

impl MemoryCallLog {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            entries: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl CallLogSink for MemoryCallLog {
    async fn record(&self, entry: CallLogEntry) {
        self.entries.lock().push(entry);
    }
}

/// Opt into log output for a test run via `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Everything a registry test needs, wired together.
pub struct Harness {
    pub media: Arc<MockMedia>,
    pub factory: Arc<MockEngineFactory>,
    pub ice: Arc<MockIceProvider>,
    pub channel: Arc<MockChannel>,
    pub call_log: Arc<MemoryCallLog>,
    pub registry: Arc<call_session::CallRegistry>,
}

impl Harness {
    pub fn new() -> Self {
        init_tracing();
        let media = MockMedia::new();
        let factory = MockEngineFactory::new();
        let ice = MockIceProvider::new();
        let channel = MockChannel::new();
        let call_log = MemoryCallLog::new();
        let registry = Arc::new(
            call_session::CallRegistry::builder(
                media.clone(),
                factory.clone(),
                ice.clone(),
                channel.clone(),
            )
            .with_call_log(call_log.clone())
            .build(),
        );
        Self {
            media,
            factory,
            ice,
            channel,
            call_log,
            registry,
        }
    }
}
