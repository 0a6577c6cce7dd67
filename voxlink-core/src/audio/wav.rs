//! WAV file replayed as a microphone, paced to wall-clock time.
//!
//! Handy for scripted calls and for exercising the full session without a
//! physical input device.
//!
//! Once the file is played out the source keeps delivering silence at the
//! same pace. The session stays up, the far end hears the utterance end,
//! and the agent's reply still plays.

use std::path::Path;
use std::time::Instant;

use hound::{SampleFormat, WavReader};
use tracing::info;

use super::AudioSource;
use crate::error::{LiveError, Result};

pub struct WavSource {
    /// Whole file, downmixed to mono f32.
    samples: Vec<f32>,
    sample_rate: u32,
    position: usize,
    /// Set on the first `read`; pacing is measured from here.
    started_at: Option<Instant>,
}

impl WavSource {
    /// # Errors
    /// `LiveError::Device` when the file is missing or not a PCM WAV.
    pub fn open(path: &Path) -> Result<Self> {
        let mut reader = WavReader::open(path)
            .map_err(|e| LiveError::Device(format!("wav input {}: {e}", path.display())))?;
        let spec = reader.spec();
        let channels = spec.channels.max(1) as usize;

        let interleaved: Vec<f32> = match (spec.sample_format, spec.bits_per_sample) {
            (SampleFormat::Float, 32) => reader
                .samples::<f32>()
                .collect::<std::result::Result<_, _>>()
                .map_err(|e| LiveError::Device(format!("wav decode: {e}")))?,
            (SampleFormat::Int, bits @ 8..=32) => {
                let scale = (1i64 << (bits - 1)) as f32;
                reader
                    .samples::<i32>()
                    .map(|s| s.map(|v| v as f32 / scale))
                    .collect::<std::result::Result<_, _>>()
                    .map_err(|e| LiveError::Device(format!("wav decode: {e}")))?
            }
            (fmt, bits) => {
                return Err(LiveError::Device(format!(
                    "unsupported wav format: {fmt:?} {bits}-bit"
                )))
            }
        };

        Ok(Self::from_samples(
            downmix(&interleaved, channels),
            spec.sample_rate,
            path,
        ))
    }

    fn from_samples(samples: Vec<f32>, sample_rate: u32, path: &Path) -> Self {
        info!(
            path = %path.display(),
            sample_rate,
            seconds = samples.len() as f64 / sample_rate.max(1) as f64,
            "wav input loaded"
        );
        Self {
            samples,
            sample_rate,
            position: 0,
            started_at: None,
        }
    }
}

impl AudioSource for WavSource {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn read(&mut self, buf: &mut [f32]) -> usize {
        let started = *self.started_at.get_or_insert_with(Instant::now);
        let due = (started.elapsed().as_secs_f64() * self.sample_rate as f64) as usize;
        let n = due.saturating_sub(self.position).min(buf.len());
        for (i, out) in buf[..n].iter_mut().enumerate() {
            *out = self.samples.get(self.position + i).copied().unwrap_or(0.0);
        }
        let total = self.samples.len();
        if self.position < total && self.position + n >= total {
            info!("wav input played out, continuing with silence");
        }
        self.position += n;
        n
    }
}

fn downmix(interleaved: &[f32], channels: usize) -> Vec<f32> {
    if channels == 1 {
        return interleaved.to_vec();
    }
    interleaved
        .chunks_exact(channels)
        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
        .collect()
}
