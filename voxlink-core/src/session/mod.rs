//! `LiveSession`: top-level lifecycle controller.
//!
//! ## Lifecycle
//!
//! ```text
//! LiveSession::new()                       state = Idle
//!     └─► start(backend, connector)        state = Connecting
//!           1. open output sink
//!           2. open microphone on the capture thread
//!           3. connect + handshake, wait for Open
//!           4. attach capture → transport, spawn session loop
//!                                          state = Active
//!     └─► stop() / CleanupHandle::cleanup  state = Closed (terminal)
//! ```
//!
//! ## Teardown order
//!
//! detach capture → silence playback → close transport → release microphone
//! → release output. Runs exactly once, whoever triggers it first: the
//! caller, the cleanup handle, a transport close/error, a microphone that
//! stops producing, or a failed start.
//!
//! The microphone is dropped on the capture thread, so the output is closed
//! from there once that has happened. Neither step blocks the caller.
//!
//! `stop()` may race an in-flight `start()`. Every resource is adopted into
//! the session under one lock that also checks the state, so a resource
//! acquired after teardown is released by `start()` itself, which then
//! returns `LiveError::Cancelled`.

pub mod config;
pub mod diagnostics;

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use crate::{
    audio::{AudioBackend, AudioSink},
    capture::{CaptureLink, CaptureStage},
    error::{LiveError, Result},
    ipc::events::{
        SessionState, SessionStatusEvent, SpeakingEvent, TranscriptEvent, TranscriptKind,
    },
    playback::{PlaybackEvent, PlaybackScheduler},
    transport::{Connector, InboundMessage, Transport, TransportEvent},
};

pub use config::SessionConfig;
pub use diagnostics::{DiagnosticsSnapshot, SessionDiagnostics};

/// Broadcast channel capacity for every event stream.
const BROADCAST_CAP: usize = 256;

/// One live audio session. Single use: once `Closed`, create a new one.
///
/// `LiveSession` is `Send + Sync`; all state sits behind interior
/// mutability.
pub struct LiveSession {
    config: SessionConfig,
    inner: Arc<SessionInner>,
}

struct SessionInner {
    state_tx: watch::Sender<SessionState>,
    resources: Mutex<SessionResources>,
    speaking_tx: broadcast::Sender<SpeakingEvent>,
    transcript_tx: broadcast::Sender<TranscriptEvent>,
    status_tx: broadcast::Sender<SessionStatusEvent>,
    transcript_seq: AtomicU64,
    diagnostics: Arc<SessionDiagnostics>,
}

/// Everything torn down on close. Fields fill in as `start()` progresses.
#[derive(Default)]
struct SessionResources {
    link: Option<Arc<CaptureLink>>,
    scheduler: Option<Arc<PlaybackScheduler>>,
    transport: Option<Arc<dyn Transport>>,
    capture: Option<CaptureStage>,
    sink: Option<Arc<dyn AudioSink>>,
}

impl SessionResources {
    fn absorb(&mut self, other: SessionResources) {
        self.link = other.link.or(self.link.take());
        self.scheduler = other.scheduler.or(self.scheduler.take());
        self.transport = other.transport.or(self.transport.take());
        self.capture = other.capture.or(self.capture.take());
        self.sink = other.sink.or(self.sink.take());
    }

    fn release(self) {
        let Self {
            link,
            scheduler,
            transport,
            capture,
            sink,
        } = self;
        if let Some(link) = &link {
            link.detach();
        }
        if let Some(scheduler) = &scheduler {
            let _ = scheduler.dispatch(PlaybackEvent::Shutdown);
        }
        if let Some(transport) = &transport {
            transport.close();
        }
        match (capture, sink) {
            (Some(capture), Some(sink)) => capture.stop_then(Box::new(move || sink.close())),
            (Some(capture), None) => capture.stop(),
            (None, Some(sink)) => sink.close(),
            (None, None) => {}
        }
    }
}

/// Returned by a successful `start()`. Tears the session down; safe to call
/// any number of times from any thread.
#[derive(Clone)]
pub struct CleanupHandle {
    inner: Arc<SessionInner>,
}

impl CleanupHandle {
    pub fn cleanup(&self) {
        self.inner.shutdown(None);
    }
}

impl std::fmt::Debug for CleanupHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CleanupHandle")
            .field("state", &*self.inner.state_tx.borrow())
            .finish()
    }
}

impl LiveSession {
    pub fn new(config: SessionConfig) -> Self {
        let (state_tx, _) = watch::channel(SessionState::Idle);
        let (speaking_tx, _) = broadcast::channel(BROADCAST_CAP);
        let (transcript_tx, _) = broadcast::channel(BROADCAST_CAP);
        let (status_tx, _) = broadcast::channel(BROADCAST_CAP);

        Self {
            config,
            inner: Arc::new(SessionInner {
                state_tx,
                resources: Mutex::new(SessionResources::default()),
                speaking_tx,
                transcript_tx,
                status_tx,
                transcript_seq: AtomicU64::new(0),
                diagnostics: Arc::new(SessionDiagnostics::default()),
            }),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn state(&self) -> SessionState {
        *self.inner.state_tx.borrow()
    }

    /// Agent speaking transitions.
    pub fn subscribe_speaking(&self) -> broadcast::Receiver<SpeakingEvent> {
        self.inner.speaking_tx.subscribe()
    }

    /// Transcript and end-of-turn pass-through.
    pub fn subscribe_transcripts(&self) -> broadcast::Receiver<TranscriptEvent> {
        self.inner.transcript_tx.subscribe()
    }

    /// State transitions.
    pub fn subscribe_status(&self) -> broadcast::Receiver<SessionStatusEvent> {
        self.inner.status_tx.subscribe()
    }

    pub fn diagnostics_snapshot(&self) -> DiagnosticsSnapshot {
        self.inner.diagnostics.snapshot()
    }

    /// Acquire devices, connect, and start streaming both ways.
    ///
    /// Resolves once the transport reports open, or on the first failure.
    /// On failure nothing stays held and the session is `Closed`.
    ///
    /// # Errors
    /// - `LiveError::AlreadyStarted` / `LiveError::SessionClosed` when not `Idle`.
    /// - `LiveError::Device` when no output (or input) device is usable.
    /// - `LiveError::Permission` when microphone access is denied. The
    ///   connector is never called in that case.
    /// - `LiveError::Connection` when the connection or handshake fails.
    /// - `LiveError::Cancelled` when `stop()` ran while this was in flight.
    pub async fn start(&self, backend: &dyn AudioBackend, connector: &dyn Connector) -> Result<CleanupHandle> {
        let began = self.inner.state_tx.send_if_modified(|state| {
            if *state == SessionState::Idle {
                *state = SessionState::Connecting;
                true
            } else {
                false
            }
        });
        if !began {
            return Err(match self.state() {
                SessionState::Closed => LiveError::SessionClosed,
                _ => LiveError::AlreadyStarted,
            });
        }
        self.inner.emit_status(SessionState::Connecting, None);

        match self.establish(backend, connector).await {
            Ok(()) => Ok(CleanupHandle {
                inner: Arc::clone(&self.inner),
            }),
            Err(LiveError::Cancelled) => {
                info!("session start cancelled by stop()");
                Err(LiveError::Cancelled)
            }
            Err(e) => {
                warn!(error = %e, "session start failed");
                self.inner.shutdown(Some(e.to_string()));
                Err(e)
            }
        }
    }

    /// Tear the session down. Idempotent; safe during an in-flight `start()`.
    pub fn stop(&self) {
        self.inner.shutdown(None);
    }

    async fn establish(&self, backend: &dyn AudioBackend, connector: &dyn Connector) -> Result<()> {
        let inner = &self.inner;
        let mut closed_rx = inner.state_tx.subscribe();

        // ── 1. Output ─────────────────────────────────────────────────────
        let sink = backend.open_output()?;
        inner.adopt(SessionResources {
            sink: Some(Arc::clone(&sink)),
            ..Default::default()
        })?;

        // ── 2. Microphone ─────────────────────────────────────────────────
        let link = Arc::new(CaptureLink::new());
        let mut capture = tokio::select! {
            res = CaptureStage::start(
                backend.input_opener(),
                self.config.normalized_frame_samples(),
                Arc::clone(&link),
                Arc::clone(&inner.diagnostics),
            ) => res?,
            _ = wait_closed(&mut closed_rx) => return Err(LiveError::Cancelled),
        };
        let mic_ended = capture.take_ended();
        inner.adopt(SessionResources {
            link: Some(Arc::clone(&link)),
            capture: Some(capture),
            ..Default::default()
        })?;

        // ── 3. Transport ──────────────────────────────────────────────────
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let transport = tokio::select! {
            res = connector.connect(&self.config, events_tx) => res?,
            _ = wait_closed(&mut closed_rx) => return Err(LiveError::Cancelled),
        };
        inner.adopt(SessionResources {
            transport: Some(Arc::clone(&transport)),
            ..Default::default()
        })?;

        tokio::select! {
            res = tokio::time::timeout(self.config.connect_timeout, wait_for_open(&mut events_rx)) => {
                res.map_err(|_| LiveError::Connection("transport never opened".into()))??;
            }
            _ = wait_closed(&mut closed_rx) => return Err(LiveError::Cancelled),
        }

        // ── 4. Wire up and go Active ──────────────────────────────────────
        let scheduler = PlaybackScheduler::new(
            sink,
            inner.speaking_tx.clone(),
            Arc::clone(&inner.diagnostics),
        );
        inner.activate(Arc::clone(&scheduler), &link, transport)?;

        tokio::spawn(run_session_loop(
            Arc::clone(inner),
            events_rx,
            scheduler,
            mic_ended,
        ));
        info!("live session active");
        Ok(())
    }
}

impl Drop for LiveSession {
    fn drop(&mut self) {
        self.inner.shutdown(None);
    }
}

impl SessionInner {
    /// Store freshly acquired resources, or release them if the session was
    /// closed meanwhile.
    fn adopt(&self, part: SessionResources) -> Result<()> {
        let mut resources = self.resources.lock();
        if self.state_tx.borrow().is_terminal() {
            drop(resources);
            part.release();
            return Err(LiveError::Cancelled);
        }
        resources.absorb(part);
        Ok(())
    }

    fn activate(
        &self,
        scheduler: Arc<PlaybackScheduler>,
        link: &CaptureLink,
        transport: Arc<dyn Transport>,
    ) -> Result<()> {
        let mut resources = self.resources.lock();
        let activated = self.state_tx.send_if_modified(|state| {
            if *state == SessionState::Connecting {
                *state = SessionState::Active;
                true
            } else {
                false
            }
        });
        if !activated {
            return Err(LiveError::Cancelled);
        }
        resources.scheduler = Some(scheduler);
        link.attach(transport);
        drop(resources);
        self.emit_status(SessionState::Active, None);
        Ok(())
    }

    /// Move to `Closed` and release everything. Only the first call acts.
    fn shutdown(&self, detail: Option<String>) {
        let closed_now = self.state_tx.send_if_modified(|state| {
            if state.is_terminal() {
                false
            } else {
                *state = SessionState::Closed;
                true
            }
        });
        if !closed_now {
            return;
        }

        let resources = std::mem::take(&mut *self.resources.lock());
        resources.release();

        let snap = self.diagnostics.snapshot();
        info!(
            frames_captured = snap.frames_captured,
            frames_sent = snap.frames_sent,
            frames_dropped = snap.frames_dropped,
            chunks_received = snap.chunks_received,
            chunks_scheduled = snap.chunks_scheduled,
            chunks_dropped = snap.chunks_dropped,
            interruptions = snap.interruptions,
            transcripts = snap.transcripts,
            detail = detail.as_deref().unwrap_or(""),
            "live session closed"
        );
        self.emit_status(SessionState::Closed, detail);
    }

    fn emit_status(&self, state: SessionState, detail: Option<String>) {
        let _ = self.status_tx.send(SessionStatusEvent { state, detail });
    }

    fn emit_transcript(&self, text: String, kind: TranscriptKind) {
        SessionDiagnostics::bump(&self.diagnostics.transcripts);
        let seq = self.transcript_seq.fetch_add(1, Ordering::Relaxed);
        let _ = self.transcript_tx.send(TranscriptEvent { seq, text, kind });
    }
}

/// Resolves once the session reaches `Closed`.
async fn wait_closed(rx: &mut watch::Receiver<SessionState>) {
    // The guard returned by `wait_for` is not `Send`; drop it right here.
    let _ = rx.wait_for(|s| s.is_terminal()).await;
}

async fn wait_for_open(events_rx: &mut mpsc::UnboundedReceiver<TransportEvent>) -> Result<()> {
    while let Some(event) = events_rx.recv().await {
        match event {
            TransportEvent::Open => return Ok(()),
            TransportEvent::Close(reason) => {
                return Err(LiveError::Connection(format!(
                    "closed before open: {}",
                    reason.unwrap_or_default()
                )))
            }
            TransportEvent::Error(cause) => return Err(LiveError::Connection(cause)),
            TransportEvent::Message(msg) => warn!(?msg, "message before open, dropped"),
        }
    }
    Err(LiveError::Connection("transport dropped before open".into()))
}

/// Resolves once the capture thread is gone; never without a receiver.
async fn capture_gone(ended: Option<oneshot::Receiver<()>>) {
    match ended {
        Some(ended) => {
            let _ = ended.await;
        }
        None => std::future::pending().await,
    }
}

/// Single dispatch point for everything the transport delivers.
async fn run_session_loop(
    inner: Arc<SessionInner>,
    mut events_rx: mpsc::UnboundedReceiver<TransportEvent>,
    scheduler: Arc<PlaybackScheduler>,
    mic_ended: Option<oneshot::Receiver<()>>,
) {
    let mut closed_rx = inner.state_tx.subscribe();
    let mic_gone = capture_gone(mic_ended);
    tokio::pin!(mic_gone);
    loop {
        let event = tokio::select! {
            event = events_rx.recv() => event,
            _ = &mut mic_gone => {
                // Teardown also ends the capture thread; only a live session reports it.
                let live = !inner.state_tx.borrow().is_terminal();
                if live {
                    warn!("microphone stopped producing audio");
                    inner.shutdown(Some(
                        LiveError::AudioStream("microphone input ended".into()).to_string(),
                    ));
                }
                break;
            }
            _ = wait_closed(&mut closed_rx) => break,
        };
        let Some(event) = event else {
            inner.shutdown(Some("transport dropped".into()));
            break;
        };

        match event {
            TransportEvent::Open => debug!("duplicate open ignored"),
            TransportEvent::Message(InboundMessage::Audio(chunk)) => {
                if let Err(e) = scheduler.dispatch(PlaybackEvent::Audio(chunk)) {
                    if e.is_fatal() {
                        inner.shutdown(Some(e.to_string()));
                        break;
                    }
                }
            }
            TransportEvent::Message(InboundMessage::Interrupted) => {
                let _ = scheduler.dispatch(PlaybackEvent::Interrupted);
            }
            TransportEvent::Message(InboundMessage::Transcript(text)) => {
                inner.emit_transcript(text, TranscriptKind::Text);
            }
            TransportEvent::Message(InboundMessage::TurnComplete) => {
                debug!("agent turn complete");
                inner.emit_transcript(String::new(), TranscriptKind::TurnComplete);
            }
            TransportEvent::Close(reason) => {
                info!(reason = ?reason, "transport closed");
                inner.shutdown(Some(match reason {
                    Some(reason) if !reason.is_empty() => format!("transport closed: {reason}"),
                    _ => "transport closed".into(),
                }));
                break;
            }
            TransportEvent::Error(cause) => {
                warn!(%cause, "transport error");
                inner.shutdown(Some(LiveError::Transport(cause).to_string()));
                break;
            }
        }
    }
    debug!("session loop finished");
}
