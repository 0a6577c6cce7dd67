//! Audio capability seams and their platform implementations.
//!
//! The session never touches a device directly. It pulls microphone samples
//! from an [`AudioSource`] and schedules agent speech on an [`AudioSink`];
//! an [`AudioBackend`] hands out both. `CpalBackend` is the real one, tests
//! supply fakes with deterministic clocks.
//!
//! # Threading note
//!
//! `cpal::Stream` is `!Send` on most platforms (COM on Windows, CoreAudio on
//! macOS). Sources are therefore opened *on the capture thread* through a
//! [`SourceOpener`], and the cpal sink keeps its stream on a holder thread.

pub mod device;
#[cfg(feature = "audio-cpal")]
pub mod input;
#[cfg(feature = "audio-cpal")]
pub mod output;
pub mod resample;
pub mod wav;

use std::sync::Arc;

use crate::error::Result;

#[cfg(feature = "audio-cpal")]
pub use input::CpalSource;
#[cfg(feature = "audio-cpal")]
pub use output::CpalSink;
pub use wav::WavSource;

/// Identifier of one scheduled playback buffer, unique per scheduler.
pub type HandleId = u64;

/// Invoked once when a scheduled buffer finishes playing on its own.
pub type CompletionFn = Box<dyn FnOnce() + Send + 'static>;

/// Opens the microphone. Runs on the capture thread, which also drops the source.
pub type SourceOpener = Box<dyn FnOnce() -> Result<Box<dyn AudioSource>> + Send + 'static>;

/// Pull-style microphone input producing mono f32 samples.
pub trait AudioSource {
    /// Rate of the samples returned by [`AudioSource::read`] (Hz).
    fn sample_rate(&self) -> u32;

    /// Copy up to `buf.len()` available samples into `buf` without blocking.
    /// Returns the number written; `0` means nothing is ready yet.
    fn read(&mut self, buf: &mut [f32]) -> usize;

    /// `true` once the source can never produce another sample.
    fn is_finished(&self) -> bool {
        false
    }
}

/// A decoded buffer placed on the output timeline.
pub struct ScheduledBuffer {
    pub id: HandleId,
    /// Mono f32 samples at `sample_rate`.
    pub samples: Arc<[f32]>,
    pub sample_rate: u32,
    /// Output-clock time (seconds) at which the first sample sounds.
    pub start_at: f64,
    /// Length of the buffer in seconds.
    pub duration: f64,
    pub on_ended: CompletionFn,
}

impl std::fmt::Debug for ScheduledBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScheduledBuffer")
            .field("id", &self.id)
            .field("samples", &self.samples.len())
            .field("sample_rate", &self.sample_rate)
            .field("start_at", &self.start_at)
            .field("duration", &self.duration)
            .finish_non_exhaustive()
    }
}

/// Shared audio output with its own clock.
///
/// Contract:
/// - `on_ended` fires at most once, and never from inside `schedule` or `stop`.
/// - After `stop(id)` the buffer is silent immediately. Its `on_ended` may
///   still race in once; callers must tolerate unknown ids.
pub trait AudioSink: Send + Sync + 'static {
    /// Current output-clock time in seconds.
    fn current_time(&self) -> f64;

    fn schedule(&self, buffer: ScheduledBuffer) -> Result<()>;

    /// Cancel one buffer without running its completion.
    fn stop(&self, id: HandleId);

    /// Release the output device. Later `schedule` calls fail.
    fn close(&self);
}

/// Hands out the output sink and the microphone for one session.
pub trait AudioBackend: Send + Sync {
    /// # Errors
    /// `LiveError::Device` when no usable output exists.
    fn open_output(&self) -> Result<Arc<dyn AudioSink>>;

    /// Returns the opener run on the capture thread.
    ///
    /// The opener fails with `LiveError::Permission` when the host denies
    /// microphone access and `LiveError::Device` when there is no input.
    fn input_opener(&self) -> SourceOpener;
}

/// Default backend: system input and output through cpal.
#[cfg(feature = "audio-cpal")]
#[derive(Debug, Clone, Default)]
pub struct CpalBackend {
    pub preferred_input: Option<String>,
    pub preferred_output: Option<String>,
}

#[cfg(feature = "audio-cpal")]
impl AudioBackend for CpalBackend {
    fn open_output(&self) -> Result<Arc<dyn AudioSink>> {
        let sink = CpalSink::open(self.preferred_output.clone())?;
        Ok(Arc::new(sink))
    }

    fn input_opener(&self) -> SourceOpener {
        let preferred = self.preferred_input.clone();
        Box::new(move || {
            let source = CpalSource::open_with_preference(preferred.as_deref())?;
            Ok(Box::new(source) as Box<dyn AudioSource>)
        })
    }
}

/// Backend that plays through cpal but reads the microphone from a WAV file.
///
/// The file is followed by endless silence, so the call stays up after it
/// plays out; hang up with `stop()` or the cleanup handle.
#[cfg(feature = "audio-cpal")]
#[derive(Debug, Clone)]
pub struct WavInputBackend {
    pub path: std::path::PathBuf,
    pub preferred_output: Option<String>,
}

#[cfg(feature = "audio-cpal")]
impl AudioBackend for WavInputBackend {
    fn open_output(&self) -> Result<Arc<dyn AudioSink>> {
        let sink = CpalSink::open(self.preferred_output.clone())?;
        Ok(Arc::new(sink))
    }

    fn input_opener(&self) -> SourceOpener {
        let path = self.path.clone();
        Box::new(move || {
            let source = WavSource::open(&path)?;
            Ok(Box::new(source) as Box<dyn AudioSource>)
        })
    }
}
