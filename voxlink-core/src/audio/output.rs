//! Agent speech output via cpal.
//!
//! ## Timeline
//!
//! The sink owns an output clock: the number of frames the device has pulled,
//! divided by the device rate. Every scheduled buffer is pinned to an
//! absolute start frame on that clock, so two buffers whose times abut
//! (`start₂ = start₁ + duration₁`) map to abutting frame ranges with no gap
//! and no overlap, whatever the callback block size.
//!
//! ## Rate conversion
//!
//! Voices keep their source samples (24 kHz agent audio). The mixer reads
//! each one at a fractional position and interpolates linearly between
//! neighbouring samples, so there is no filter warm-up to trim and no tail
//! to flush. When a voice is queued exactly where another one ends, the
//! earlier voice borrows the first sample of the later one for its final
//! interpolation step and the join stays continuous.
//!
//! ## Threads
//!
//! - The cpal output callback (real-time) owns the [`Mixer`]. New and
//!   stopped voices reach it over a bounded crossbeam queue; it never takes
//!   a lock, so a busy `schedule` can not blank a block.
//! - Voices leave the mixer over a second queue to a holder thread, which
//!   owns the `!Send` stream, frees them and runs completion callbacks
//!   outside every sink lock.

use std::collections::HashMap;
use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    mpsc, Arc,
};
use std::thread;
use std::time::Duration;

use cpal::{
    traits::{DeviceTrait, StreamTrait},
    FromSample, Sample, SampleFormat, SizedSample, Stream, StreamConfig,
};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use super::{
    device::{select_device, DeviceDirection},
    AudioSink, CompletionFn, HandleId, ScheduledBuffer,
};
use crate::error::{LiveError, Result};

/// New and stopped voices waiting for the next callback.
const COMMAND_QUEUE_CAP: usize = 256;

/// Voices handed back from the callback to the holder thread.
const RETIRED_QUEUE_CAP: usize = 1024;

/// Voices the mixer can hold before its list reallocates.
const VOICE_CAPACITY: usize = 64;

/// How often the holder thread re-checks its running flag.
const HOLDER_POLL: Duration = Duration::from_millis(20);

enum MixCommand {
    Play(Voice),
    Stop(HandleId),
}

struct Voice {
    id: HandleId,
    /// Mono samples at the source rate.
    samples: Arc<[f32]>,
    /// Source samples advanced per device frame.
    step: f64,
    start_frame: u64,
    frames: u64,
    /// First sample of the voice queued right behind this one.
    next: Option<f32>,
}

impl Voice {
    /// Pin a source-rate buffer to the device frame clock.
    fn pin(
        id: HandleId,
        samples: Arc<[f32]>,
        sample_rate: u32,
        start_at: f64,
        duration: f64,
        device_rate: u32,
    ) -> Self {
        let rate = device_rate as f64;
        let start_frame = (start_at * rate).round().max(0.0) as u64;
        let end_frame = ((start_at + duration) * rate).round().max(0.0) as u64;
        Self {
            id,
            samples,
            step: sample_rate.max(1) as f64 / device_rate.max(1) as f64,
            start_frame,
            frames: end_frame.saturating_sub(start_frame),
            next: None,
        }
    }

    fn end_frame(&self) -> u64 {
        self.start_frame + self.frames
    }

    /// Interpolated value `offset` device frames into the voice.
    fn sample_at(&self, offset: u64) -> f32 {
        let Some(&last) = self.samples.last() else {
            return 0.0;
        };
        let pos = offset as f64 * self.step;
        let index = pos.floor() as usize;
        let frac = (pos - index as f64) as f32;
        let a = self.samples.get(index).copied().unwrap_or(last);
        let b = match self.samples.get(index + 1) {
            Some(&s) => s,
            None => self.next.unwrap_or(last),
        };
        a + (b - a) * frac
    }
}

/// Callback-side voice list. Lives inside the output callback.
struct Mixer {
    voices: Vec<Voice>,
    commands: Receiver<MixCommand>,
    retired: Sender<Voice>,
}

impl Mixer {
    fn new(commands: Receiver<MixCommand>, retired: Sender<Voice>) -> Self {
        Self {
            voices: Vec::with_capacity(VOICE_CAPACITY),
            commands,
            retired,
        }
    }

    /// Apply pending commands, then sum every voice overlapping
    /// `[base, base + mix.len())` into `mix` and retire the ones that end
    /// inside the block.
    fn render(&mut self, base: u64, mix: &mut [f32]) {
        while let Ok(command) = self.commands.try_recv() {
            match command {
                MixCommand::Play(voice) => self.admit(voice),
                MixCommand::Stop(id) => self.retire_where(|v| v.id == id),
            }
        }

        mix.fill(0.0);
        let block_end = base + mix.len() as u64;
        for voice in &self.voices {
            let from = voice.start_frame.max(base);
            let to = voice.end_frame().min(block_end);
            for frame in from..to {
                mix[(frame - base) as usize] += voice.sample_at(frame - voice.start_frame);
            }
        }
        self.retire_where(|v| v.end_frame() <= block_end);
    }

    fn admit(&mut self, voice: Voice) {
        if let Some(before) = self
            .voices
            .iter_mut()
            .find(|v| v.end_frame() == voice.start_frame)
        {
            before.next = voice.samples.first().copied();
        }
        self.voices.push(voice);
    }

    fn retire_where(&mut self, mut pred: impl FnMut(&Voice) -> bool) {
        let mut i = 0;
        while i < self.voices.len() {
            if pred(&self.voices[i]) {
                let voice = self.voices.swap_remove(i);
                // A full queue frees the voice here and loses its completion.
                let _ = self.retired.try_send(voice);
            } else {
                i += 1;
            }
        }
    }
}

struct SinkShared {
    device_rate: u32,
    frames_played: AtomicU64,
    commands: Sender<MixCommand>,
    completions: Mutex<HashMap<HandleId, CompletionFn>>,
    closed: AtomicBool,
}

/// cpal-backed [`AudioSink`]. `Send + Sync`; the stream itself stays on the
/// holder thread.
pub struct CpalSink {
    shared: Arc<SinkShared>,
    running: Arc<AtomicBool>,
}

impl CpalSink {
    /// Open the preferred output device (or the default) and start the clock.
    ///
    /// # Errors
    /// `LiveError::Device` when no output device can be opened.
    pub fn open(preferred_output: Option<String>) -> Result<Self> {
        let running = Arc::new(AtomicBool::new(true));
        let (open_tx, open_rx) = mpsc::channel::<Result<Arc<SinkShared>>>();
        let holder_running = Arc::clone(&running);

        thread::Builder::new()
            .name("voxlink-output".into())
            .spawn(move || {
                let (retired_tx, retired_rx) = crossbeam_channel::bounded(RETIRED_QUEUE_CAP);
                let (stream, shared) = match open_stream(preferred_output.as_deref(), retired_tx) {
                    Ok(opened) => opened,
                    Err(e) => {
                        let _ = open_tx.send(Err(e));
                        return;
                    }
                };
                let _ = open_tx.send(Ok(Arc::clone(&shared)));
                run_holder(&shared, &retired_rx, &holder_running);
                // Stream drops here, releasing the device on this thread.
                drop(stream);
                info!("output stream released");
            })
            .map_err(LiveError::Io)?;

        let shared = open_rx
            .recv()
            .map_err(|_| LiveError::Device("output thread died during open".into()))??;

        Ok(Self { shared, running })
    }
}

impl AudioSink for CpalSink {
    fn current_time(&self) -> f64 {
        self.shared.frames_played.load(Ordering::Acquire) as f64 / self.shared.device_rate as f64
    }

    fn schedule(&self, buffer: ScheduledBuffer) -> Result<()> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(LiveError::Device("output closed".into()));
        }
        let ScheduledBuffer {
            id,
            samples,
            sample_rate,
            start_at,
            duration,
            on_ended,
        } = buffer;
        let voice = Voice::pin(id, samples, sample_rate, start_at, duration, self.shared.device_rate);
        debug!(
            id,
            start_frame = voice.start_frame,
            frames = voice.frames,
            "voice queued"
        );

        self.shared.completions.lock().insert(id, on_ended);
        match self.shared.commands.try_send(MixCommand::Play(voice)) {
            Ok(()) => Ok(()),
            Err(e) => {
                self.shared.completions.lock().remove(&id);
                Err(LiveError::AudioStream(match e {
                    TrySendError::Full(_) => "output queue full".into(),
                    TrySendError::Disconnected(_) => "output callback gone".into(),
                }))
            }
        }
    }

    fn stop(&self, id: HandleId) {
        self.shared.completions.lock().remove(&id);
        if self.shared.commands.try_send(MixCommand::Stop(id)).is_err() {
            warn!(id, "stop not delivered to output callback");
        }
    }

    fn close(&self) {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.running.store(false, Ordering::Release);
        self.shared.completions.lock().clear();
    }
}

impl Drop for CpalSink {
    fn drop(&mut self) {
        self.close();
    }
}

fn open_stream(
    preferred: Option<&str>,
    retired_tx: Sender<Voice>,
) -> Result<(Stream, Arc<SinkShared>)> {
    let host = cpal::default_host();
    let device = select_device(&host, DeviceDirection::Output, preferred)
        .map_err(|e| LiveError::Device(e.to_string()))?
        .ok_or_else(|| LiveError::Device("no output device found".into()))?;

    let supported = device
        .default_output_config()
        .map_err(|e| LiveError::Device(e.to_string()))?;
    let config: StreamConfig = supported.config();
    info!(
        device = device.name().unwrap_or_default().as_str(),
        sample_rate = config.sample_rate.0,
        channels = config.channels,
        "opening output device"
    );

    let (commands_tx, commands_rx) = crossbeam_channel::bounded(COMMAND_QUEUE_CAP);
    let shared = Arc::new(SinkShared {
        device_rate: config.sample_rate.0,
        frames_played: AtomicU64::new(0),
        commands: commands_tx,
        completions: Mutex::new(HashMap::new()),
        closed: AtomicBool::new(false),
    });
    let mixer = Mixer::new(commands_rx, retired_tx);

    let stream = match supported.sample_format() {
        SampleFormat::F32 => build_mix_stream::<f32>(&device, &config, &shared, mixer),
        SampleFormat::I16 => build_mix_stream::<i16>(&device, &config, &shared, mixer),
        SampleFormat::U16 => build_mix_stream::<u16>(&device, &config, &shared, mixer),
        fmt => Err(LiveError::Device(format!(
            "unsupported output sample format: {fmt:?}"
        ))),
    }?;
    stream
        .play()
        .map_err(|e| LiveError::Device(e.to_string()))?;

    Ok((stream, shared))
}

fn build_mix_stream<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    shared: &Arc<SinkShared>,
    mut mixer: Mixer,
) -> Result<Stream>
where
    T: SizedSample + FromSample<f32>,
{
    let ch = config.channels.max(1) as usize;
    let shared = Arc::clone(shared);
    let mut mix: Vec<f32> = Vec::with_capacity(8192);

    device
        .build_output_stream(
            config,
            move |data: &mut [T], _info| {
                let frames = data.len() / ch;
                let base = shared.frames_played.load(Ordering::Acquire);
                mix.resize(frames, 0.0);
                mixer.render(base, &mut mix);

                for (frame, value) in data.chunks_exact_mut(ch).zip(mix.iter()) {
                    let sample = T::from_sample(value.clamp(-1.0, 1.0));
                    frame.fill(sample);
                }
                shared
                    .frames_played
                    .fetch_add(frames as u64, Ordering::AcqRel);
            },
            |err| error!("output stream error: {err}"),
            None,
        )
        .map_err(|e| LiveError::Device(e.to_string()))
}

fn run_holder(shared: &SinkShared, retired_rx: &Receiver<Voice>, running: &AtomicBool) {
    loop {
        match retired_rx.recv_timeout(HOLDER_POLL) {
            Ok(voice) => {
                let callback = shared.completions.lock().remove(&voice.id);
                drop(voice);
                if let Some(callback) = callback {
                    callback();
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                if !running.load(Ordering::Acquire) {
                    break;
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
}
