//! Gapless playback of inbound agent audio with barge-in.
//!
//! ## Scheduling rule
//!
//! ```text
//! start  = max(next_start_time, sink.current_time())
//! next_start_time = start + duration
//! ```
//!
//! Chunks arriving faster than real time queue back to back on the output
//! clock. A chunk arriving after its would-be start plays immediately
//! instead of being placed in the past.
//!
//! ## Serialization
//!
//! `next_start_time` and the active set live behind one mutex and are only
//! touched through [`PlaybackScheduler::dispatch`]. The inbound transport
//! path and sink completion callbacks both funnel through it, so an
//! interruption is fully applied before the next chunk reads the cursor.

use std::collections::HashMap;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::{
    audio::{AudioSink, HandleId, ScheduledBuffer},
    buffering::chunk::EncodedChunk,
    error::Result,
    ipc::events::SpeakingEvent,
    session::diagnostics::SessionDiagnostics,
};

/// Everything that can change scheduler state.
#[derive(Debug, Clone)]
pub enum PlaybackEvent {
    /// Inbound agent audio.
    Audio(EncodedChunk),
    /// The remote side reports the user talking over the agent.
    Interrupted,
    /// A scheduled buffer played to its end.
    Finished(HandleId),
    /// Session teardown: silence everything and refuse further audio.
    Shutdown,
}

/// One scheduled chunk on the sink's timeline.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlaybackHandle {
    pub id: HandleId,
    /// Output-clock start time (seconds).
    pub start: f64,
    pub duration: f64,
}

impl PlaybackHandle {
    pub fn end(&self) -> f64 {
        self.start + self.duration
    }
}

struct SchedulerState {
    next_start_time: f64,
    active: HashMap<HandleId, PlaybackHandle>,
    accepting: bool,
    speaking_seq: u64,
}

pub struct PlaybackScheduler {
    sink: Arc<dyn AudioSink>,
    state: Mutex<SchedulerState>,
    next_id: AtomicU64,
    speaking_tx: broadcast::Sender<SpeakingEvent>,
    diagnostics: Arc<SessionDiagnostics>,
}

impl PlaybackScheduler {
    pub fn new(
        sink: Arc<dyn AudioSink>,
        speaking_tx: broadcast::Sender<SpeakingEvent>,
        diagnostics: Arc<SessionDiagnostics>,
    ) -> Arc<Self> {
        Arc::new(Self {
            sink,
            state: Mutex::new(SchedulerState {
                next_start_time: 0.0,
                active: HashMap::new(),
                accepting: true,
                speaking_seq: 0,
            }),
            next_id: AtomicU64::new(1),
            speaking_tx,
            diagnostics,
        })
    }

    /// Single entry point for all scheduler mutations.
    ///
    /// # Errors
    /// `LiveError::Decode` for a malformed audio chunk (the chunk is dropped,
    /// the scheduler stays usable), or the sink's error if it refused the
    /// buffer.
    pub fn dispatch(self: &Arc<Self>, event: PlaybackEvent) -> Result<()> {
        match event {
            PlaybackEvent::Audio(chunk) => self.schedule_chunk(&chunk),
            PlaybackEvent::Interrupted => {
                SessionDiagnostics::bump(&self.diagnostics.interruptions);
                let mut state = self.state.lock();
                let stopped = self.stop_all(&mut state);
                info!(stopped, cursor = state.next_start_time, "playback interrupted");
                Ok(())
            }
            PlaybackEvent::Finished(id) => {
                let mut state = self.state.lock();
                if state.active.remove(&id).is_some() {
                    debug!(id, remaining = state.active.len(), "chunk finished");
                    if state.active.is_empty() {
                        self.emit_speaking(&mut state, false);
                    }
                }
                Ok(())
            }
            PlaybackEvent::Shutdown => {
                let mut state = self.state.lock();
                state.accepting = false;
                let stopped = self.stop_all(&mut state);
                debug!(stopped, "playback shut down");
                Ok(())
            }
        }
    }

    /// `true` iff at least one handle is pending or sounding.
    pub fn is_speaking(&self) -> bool {
        !self.state.lock().active.is_empty()
    }

    pub fn next_start_time(&self) -> f64 {
        self.state.lock().next_start_time
    }

    /// Active handles ordered by start time.
    pub fn active_handles(&self) -> Vec<PlaybackHandle> {
        let mut handles: Vec<_> = self.state.lock().active.values().copied().collect();
        handles.sort_by(|a, b| a.start.total_cmp(&b.start));
        handles
    }

    fn schedule_chunk(self: &Arc<Self>, chunk: &EncodedChunk) -> Result<()> {
        SessionDiagnostics::bump(&self.diagnostics.chunks_received);

        // Decode outside the lock; it is pure.
        let audio = match chunk.decode() {
            Ok(audio) => audio,
            Err(e) => {
                SessionDiagnostics::bump(&self.diagnostics.chunks_dropped);
                warn!(error = %e, format = %chunk.format(), "dropping malformed audio chunk");
                return Err(e);
            }
        };
        if audio.is_empty() {
            debug!("ignoring empty audio chunk");
            return Ok(());
        }
        let duration = audio.duration_secs();
        let sample_rate = audio.sample_rate;
        let samples: Arc<[f32]> = audio.samples.into();

        let mut state = self.state.lock();
        if !state.accepting {
            debug!("scheduler shut down, dropping chunk");
            return Ok(());
        }

        let now = self.sink.current_time();
        let start = state.next_start_time.max(now);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        let weak = Arc::downgrade(self);
        let buffer = ScheduledBuffer {
            id,
            samples,
            sample_rate,
            start_at: start,
            duration,
            on_ended: Box::new(move || {
                if let Some(scheduler) = weak.upgrade() {
                    let _ = scheduler.dispatch(PlaybackEvent::Finished(id));
                }
            }),
        };
        if let Err(e) = self.sink.schedule(buffer) {
            SessionDiagnostics::bump(&self.diagnostics.chunks_dropped);
            warn!(error = %e, "sink refused chunk");
            return Err(e);
        }

        state.next_start_time = start + duration;
        let was_idle = state.active.is_empty();
        state.active.insert(
            id,
            PlaybackHandle {
                id,
                start,
                duration,
            },
        );
        SessionDiagnostics::bump(&self.diagnostics.chunks_scheduled);
        debug!(
            id,
            start,
            duration,
            lead = start - now,
            active = state.active.len(),
            "chunk scheduled"
        );
        if was_idle {
            self.emit_speaking(&mut state, true);
        }
        Ok(())
    }

    /// Force-stop every active handle and pull the cursor back to "now".
    /// Returns how many handles were stopped.
    fn stop_all(&self, state: &mut SchedulerState) -> usize {
        let stopped = state.active.len();
        for id in state.active.keys() {
            self.sink.stop(*id);
        }
        state.active.clear();
        state.next_start_time = self.sink.current_time();
        if stopped > 0 {
            self.emit_speaking(state, false);
        }
        stopped
    }

    fn emit_speaking(&self, state: &mut SchedulerState, speaking: bool) {
        let seq = state.speaking_seq;
        state.speaking_seq += 1;
        let _ = self.speaking_tx.send(SpeakingEvent { seq, speaking });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::CompletionFn;
    use crate::buffering::chunk::{AudioFormat, AudioFrame, OUTPUT_SAMPLE_RATE};
    use crate::codec;
    use crate::error::LiveError;
    use approx::assert_abs_diff_eq;

    /// Sink with a hand-driven clock.
    #[derive(Default)]
    struct ManualSink {
        inner: Mutex<ManualInner>,
    }

    #[derive(Default)]
    struct ManualInner {
        now: f64,
        pending: Vec<(HandleId, f64, CompletionFn)>,
        stopped: Vec<HandleId>,
    }

    impl ManualSink {
        fn advance_to(&self, t: f64) {
            let due: Vec<CompletionFn> = {
                let mut inner = self.inner.lock();
                inner.now = t;
                let (due, keep) = std::mem::take(&mut inner.pending)
                    .into_iter()
                    .partition::<Vec<_>, _>(|(_, end, _)| *end <= t + 1e-9);
                inner.pending = keep;
                due.into_iter().map(|(_, _, cb)| cb).collect()
            };
            for cb in due {
                cb();
            }
        }
    }

    impl AudioSink for ManualSink {
        fn current_time(&self) -> f64 {
            self.inner.lock().now
        }

        fn schedule(&self, buffer: ScheduledBuffer) -> Result<()> {
            let end = buffer.start_at + buffer.duration;
            self.inner.lock().pending.push((buffer.id, end, buffer.on_ended));
            Ok(())
        }

        fn stop(&self, id: HandleId) {
            let mut inner = self.inner.lock();
            inner.pending.retain(|(pid, _, _)| *pid != id);
            inner.stopped.push(id);
        }

        fn close(&self) {}
    }

    fn agent_chunk(millis: u32) -> EncodedChunk {
        let samples = vec![0.1f32; (OUTPUT_SAMPLE_RATE / 1000 * millis) as usize];
        let frame = AudioFrame::from_f32(&samples, OUTPUT_SAMPLE_RATE);
        frame.encode()
    }

    fn setup(start: f64) -> (Arc<ManualSink>, Arc<PlaybackScheduler>, broadcast::Receiver<SpeakingEvent>) {
        let sink = Arc::new(ManualSink::default());
        sink.advance_to(start);
        let (tx, rx) = broadcast::channel(64);
        let scheduler = PlaybackScheduler::new(
            Arc::clone(&sink) as Arc<dyn AudioSink>,
            tx,
            Arc::new(SessionDiagnostics::default()),
        );
        (sink, scheduler, rx)
    }

    fn drain(rx: &mut broadcast::Receiver<SpeakingEvent>) -> Vec<bool> {
        std::iter::from_fn(|| rx.try_recv().ok())
            .map(|e| e.speaking)
            .collect()
    }

    #[test]
    fn burst_of_chunks_plays_back_to_back() {
        let (_sink, scheduler, mut rx) = setup(5.0);
        for _ in 0..3 {
            scheduler.dispatch(PlaybackEvent::Audio(agent_chunk(100))).unwrap();
        }
        let handles = scheduler.active_handles();
        assert_eq!(handles.len(), 3);
        assert_abs_diff_eq!(handles[0].start, 5.0, epsilon = 1e-9);
        assert_abs_diff_eq!(handles[1].start, 5.1, epsilon = 1e-9);
        assert_abs_diff_eq!(handles[2].start, 5.2, epsilon = 1e-9);
        for pair in handles.windows(2) {
            assert!(pair[1].start >= pair[0].end() - 1e-9);
        }
        assert_abs_diff_eq!(scheduler.next_start_time(), 5.3, epsilon = 1e-9);
        assert_eq!(drain(&mut rx), vec![true], "speaking fires once per transition");
    }

    #[test]
    fn late_chunk_starts_now_not_in_the_past() {
        let (sink, scheduler, _rx) = setup(0.0);
        scheduler.dispatch(PlaybackEvent::Audio(agent_chunk(100))).unwrap();
        sink.advance_to(0.5);
        scheduler.dispatch(PlaybackEvent::Audio(agent_chunk(100))).unwrap();
        let handles = scheduler.active_handles();
        assert_eq!(handles.len(), 1);
        assert_abs_diff_eq!(handles[0].start, 0.5, epsilon = 1e-9);
        assert_abs_diff_eq!(scheduler.next_start_time(), 0.6, epsilon = 1e-9);
    }

    #[test]
    fn natural_completion_clears_speaking_exactly_once() {
        let (sink, scheduler, mut rx) = setup(0.0);
        scheduler.dispatch(PlaybackEvent::Audio(agent_chunk(100))).unwrap();
        scheduler.dispatch(PlaybackEvent::Audio(agent_chunk(100))).unwrap();

        sink.advance_to(0.1);
        assert!(scheduler.is_speaking(), "second chunk still pending");
        sink.advance_to(0.2);
        assert!(!scheduler.is_speaking());
        assert_eq!(drain(&mut rx), vec![true, false]);

        // A duplicate completion is ignored.
        scheduler.dispatch(PlaybackEvent::Finished(1)).unwrap();
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn interruption_silences_and_resets_cursor_to_now() {
        let (sink, scheduler, mut rx) = setup(2.0);
        scheduler.dispatch(PlaybackEvent::Audio(agent_chunk(200))).unwrap();
        sink.advance_to(2.05);

        scheduler.dispatch(PlaybackEvent::Interrupted).unwrap();
        assert!(!scheduler.is_speaking());
        assert!(scheduler.active_handles().is_empty());
        assert_abs_diff_eq!(scheduler.next_start_time(), 2.05, epsilon = 1e-9);
        assert_eq!(sink.inner.lock().stopped, vec![1]);
        assert_eq!(drain(&mut rx), vec![true, false]);

        // The stopped chunk never reports completion.
        sink.advance_to(3.0);
        assert!(drain(&mut rx).is_empty());

        scheduler.dispatch(PlaybackEvent::Audio(agent_chunk(100))).unwrap();
        assert_abs_diff_eq!(scheduler.active_handles()[0].start, 3.0, epsilon = 1e-9);
    }

    #[test]
    fn interruption_while_idle_emits_nothing() {
        let (_sink, scheduler, mut rx) = setup(1.0);
        scheduler.dispatch(PlaybackEvent::Interrupted).unwrap();
        assert!(drain(&mut rx).is_empty());
        assert_abs_diff_eq!(scheduler.next_start_time(), 1.0, epsilon = 1e-9);
    }

    #[test]
    fn malformed_chunk_is_dropped_and_session_continues() {
        let (_sink, scheduler, _rx) = setup(0.0);
        let bad = EncodedChunk::new(AudioFormat::AGENT, codec::encode_base64(&[1, 2, 3]));
        let err = scheduler.dispatch(PlaybackEvent::Audio(bad)).unwrap_err();
        assert!(matches!(err, LiveError::Decode(_)));
        assert!(!scheduler.is_speaking());

        scheduler.dispatch(PlaybackEvent::Audio(agent_chunk(50))).unwrap();
        assert!(scheduler.is_speaking());
        let snap = scheduler.diagnostics.snapshot();
        assert_eq!(snap.chunks_received, 2);
        assert_eq!(snap.chunks_dropped, 1);
        assert_eq!(snap.chunks_scheduled, 1);
    }

    #[test]
    fn shutdown_refuses_later_audio() {
        let (_sink, scheduler, _rx) = setup(0.0);
        scheduler.dispatch(PlaybackEvent::Audio(agent_chunk(100))).unwrap();
        scheduler.dispatch(PlaybackEvent::Shutdown).unwrap();
        assert!(!scheduler.is_speaking());
        scheduler.dispatch(PlaybackEvent::Audio(agent_chunk(100))).unwrap();
        assert!(!scheduler.is_speaking());
    }
}
