//! Microphone capture stage.
//!
//! ## Per iteration
//!
//! ```text
//! 1. Pull whatever the source has ready (non-blocking)
//! 2. Resample device rate → 16 kHz
//! 3. Cut fixed-size frames (frame_samples, power of two)
//! 4. Clamp + quantise to PCM16, base64-encode
//! 5. Hand to the attached transport (enqueue only)
//! ```
//!
//! The loop owns the `AudioSource` on its own thread. The source is opened
//! there too, since a cpal input stream cannot leave the thread it was
//! built on. For the same reason the microphone is released on that thread;
//! [`CaptureStage::stop_then`] queues work that must wait for it.
//!
//! A source that reports itself finished while the stage is still running
//! (device unplugged, end of a finite source) resolves the receiver from
//! [`CaptureStage::take_ended`].

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use crate::{
    audio::{resample::RateConverter, AudioSource, SourceOpener},
    buffering::chunk::{AudioFrame, EncodedChunk, INPUT_SAMPLE_RATE},
    error::{LiveError, Result},
    session::diagnostics::SessionDiagnostics,
    transport::Transport,
};

/// Samples pulled from the source per iteration.
const DRAIN_CHUNK: usize = 960;

/// Sleep when the source has nothing ready.
const EMPTY_SLEEP: Duration = Duration::from_millis(5);

/// Where captured frames go. Frames captured while detached are dropped.
#[derive(Default)]
pub struct CaptureLink {
    transport: Mutex<Option<Arc<dyn Transport>>>,
}

impl CaptureLink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach(&self, transport: Arc<dyn Transport>) {
        *self.transport.lock() = Some(transport);
    }

    pub fn detach(&self) {
        self.transport.lock().take();
    }

    pub fn is_attached(&self) -> bool {
        self.transport.lock().is_some()
    }

    /// Returns `true` if the frame was handed to a transport.
    ///
    /// Sends under the lock: once `detach` returns no frame is in flight.
    /// `Transport::send` only enqueues, so the hold is short.
    fn send(&self, chunk: EncodedChunk) -> bool {
        let attached = self.transport.lock();
        let Some(transport) = attached.as_ref() else {
            return false;
        };
        match transport.send(chunk) {
            Ok(()) => true,
            Err(e) => {
                debug!(error = %e, "frame not sent");
                false
            }
        }
    }
}

/// Work run on the capture thread once the source has been dropped.
pub type AfterRelease = Box<dyn FnOnce() + Send + 'static>;

enum ReleaseSlot {
    Pending(Option<AfterRelease>),
    Released,
}

/// Dropped last on the capture thread, after the source.
struct ReleaseGuard(Arc<Mutex<ReleaseSlot>>);

impl Drop for ReleaseGuard {
    fn drop(&mut self) {
        let queued = match std::mem::replace(&mut *self.0.lock(), ReleaseSlot::Released) {
            ReleaseSlot::Pending(queued) => queued,
            ReleaseSlot::Released => None,
        };
        if let Some(after) = queued {
            after();
        }
    }
}

/// Handle to a running capture thread.
pub struct CaptureStage {
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
    device_rate: u32,
    release: Arc<Mutex<ReleaseSlot>>,
    ended: Option<oneshot::Receiver<()>>,
}

impl CaptureStage {
    /// Spawn the capture thread, open the source on it and wait for the
    /// outcome.
    ///
    /// Dropping the returned future before it resolves is safe: the thread
    /// notices nobody is waiting and releases the source.
    ///
    /// # Errors
    /// Whatever the opener returned (`Permission`, `Device`), or
    /// `LiveError::Device` if the resampler cannot be built.
    pub async fn start(
        opener: SourceOpener,
        frame_samples: usize,
        link: Arc<CaptureLink>,
        diagnostics: Arc<SessionDiagnostics>,
    ) -> Result<Self> {
        let running = Arc::new(AtomicBool::new(true));
        let release = Arc::new(Mutex::new(ReleaseSlot::Pending(None)));
        let (open_tx, open_rx) = oneshot::channel::<Result<u32>>();
        let (ended_tx, ended_rx) = oneshot::channel::<()>();
        let thread_running = Arc::clone(&running);
        let thread_release = Arc::clone(&release);

        let thread = thread::Builder::new()
            .name("voxlink-capture".into())
            .spawn(move || {
                let _release = ReleaseGuard(thread_release);
                let opened = opener().and_then(|source| {
                    let converter = RateConverter::new(source.sample_rate(), INPUT_SAMPLE_RATE, DRAIN_CHUNK)?;
                    Ok((source, converter))
                });
                let (source, converter) = match opened {
                    Ok(opened) => opened,
                    Err(e) => {
                        let _ = open_tx.send(Err(e));
                        return;
                    }
                };
                if open_tx.send(Ok(source.sample_rate())).is_err() {
                    debug!("capture start abandoned, releasing source");
                    return;
                }
                let exhausted = run(CaptureLoop {
                    source,
                    converter,
                    frame_samples,
                    link,
                    running: thread_running,
                    diagnostics,
                });
                if exhausted {
                    let _ = ended_tx.send(());
                }
            })
            .map_err(LiveError::Io)?;

        let device_rate = match open_rx.await {
            Ok(Ok(rate)) => rate,
            Ok(Err(e)) => {
                running.store(false, Ordering::Release);
                return Err(e);
            }
            Err(_) => {
                running.store(false, Ordering::Release);
                return Err(LiveError::Device("capture thread died during open".into()));
            }
        };
        info!(device_rate, frame_samples, "microphone capture started");

        Ok(Self {
            running,
            thread: Some(thread),
            device_rate,
            release,
            ended: Some(ended_rx),
        })
    }

    pub fn device_rate(&self) -> u32 {
        self.device_rate
    }

    /// Resolves `Ok(())` when the source ran dry while the stage was
    /// running. Errors once the thread exits any other way. Only the first
    /// call returns a receiver.
    pub fn take_ended(&mut self) -> Option<oneshot::Receiver<()>> {
        self.ended.take()
    }

    /// Stop, then run `after` on the capture thread once the source is
    /// dropped. Runs `after` right away if the thread already let go.
    pub fn stop_then(&self, after: AfterRelease) {
        let run_now = match &mut *self.release.lock() {
            ReleaseSlot::Pending(queued) => {
                *queued = Some(after);
                None
            }
            ReleaseSlot::Released => Some(after),
        };
        self.stop();
        if let Some(after) = run_now {
            after();
        }
    }

    /// Signal the thread to exit; the source is released on that thread
    /// within one iteration. Does not block.
    pub fn stop(&self) {
        if self.running.swap(false, Ordering::AcqRel) {
            debug!("capture stop requested");
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
            && self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Stop and wait for the thread. Blocks; not for async contexts.
    pub fn join(mut self) {
        self.stop();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("capture thread panicked");
            }
        }
    }
}

impl Drop for CaptureStage {
    fn drop(&mut self) {
        self.stop();
    }
}

struct CaptureLoop {
    source: Box<dyn AudioSource>,
    converter: RateConverter,
    frame_samples: usize,
    link: Arc<CaptureLink>,
    running: Arc<AtomicBool>,
    diagnostics: Arc<SessionDiagnostics>,
}

/// Returns `true` when the source ran dry while the stage was running.
fn run(mut ctx: CaptureLoop) -> bool {
    let mut exhausted = false;
    let mut raw = vec![0f32; DRAIN_CHUNK];
    let mut pending: Vec<f32> = Vec::with_capacity(ctx.frame_samples * 2);

    while ctx.running.load(Ordering::Acquire) {
        let n = ctx.source.read(&mut raw);
        if n == 0 {
            if ctx.source.is_finished() {
                exhausted = true;
                break;
            }
            thread::sleep(EMPTY_SLEEP);
            continue;
        }

        pending.extend_from_slice(&ctx.converter.process(&raw[..n]));

        while pending.len() >= ctx.frame_samples {
            let frame = AudioFrame::from_f32(&pending[..ctx.frame_samples], INPUT_SAMPLE_RATE);
            pending.drain(..ctx.frame_samples);
            SessionDiagnostics::bump(&ctx.diagnostics.frames_captured);

            if ctx.link.send(frame.encode()) {
                SessionDiagnostics::bump(&ctx.diagnostics.frames_sent);
            } else {
                SessionDiagnostics::bump(&ctx.diagnostics.frames_dropped);
            }
        }
    }

    if !pending.is_empty() {
        debug!(samples = pending.len(), "discarding partial capture frame");
    }
    if exhausted {
        warn!("capture source ended while session still running");
    }
    info!("capture stopped");
    exhausted
}
