//! Microphone capture via cpal.
//!
//! # Design constraints
//!
//! The cpal input callback runs on an OS audio thread at elevated priority.
//! It **must not** allocate after warm-up, block on a mutex, or perform I/O.
//! It downmixes to mono into a reused scratch buffer and writes into the SPSC
//! ring producer, whose `push_slice` is lock-free and allocation-free.
//! The capture thread drains the consumer through [`AudioSource::read`].
//!
//! A device that disappears mid-stream marks the source finished, which
//! ends the capture stage and with it the session.

use cpal::{
    traits::{DeviceTrait, StreamTrait},
    FromSample, Sample, SampleFormat, SizedSample, Stream, StreamConfig, StreamError,
};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use tracing::{error, info, warn};

use super::{
    device::{select_device, DeviceDirection},
    AudioSource,
};
use crate::{
    buffering::{create_audio_ring, AudioConsumer, AudioProducer, Consumer, Observer, Producer},
    error::{LiveError, Result},
};

/// Handle to an active microphone stream.
///
/// **Not `Send`**: create and drop it on the capture thread.
pub struct CpalSource {
    /// Kept alive so the stream is not dropped prematurely.
    _stream: Stream,
    consumer: AudioConsumer,
    /// Set to `false` to make the callback no-op.
    running: Arc<AtomicBool>,
    /// Set by the error callback when the device goes away.
    lost: Arc<AtomicBool>,
    /// Actual capture sample rate reported by the device (Hz).
    sample_rate: u32,
}

impl CpalSource {
    /// Open an input device by preferred name, otherwise fall back to the
    /// default input device and then the first available one.
    ///
    /// # Errors
    /// `LiveError::Permission` when the backend reports denied access,
    /// `LiveError::Device` when no input exists.
    pub fn open_with_preference(preferred_device_name: Option<&str>) -> Result<Self> {
        let host = cpal::default_host();
        let device = select_device(&host, DeviceDirection::Input, preferred_device_name)
            .map_err(|e| classify_input_error(e.to_string()))?
            .ok_or_else(|| LiveError::Device("no input device found".into()))?;

        info!(
            device = device.name().unwrap_or_default().as_str(),
            "opening input device"
        );

        let supported = device
            .default_input_config()
            .map_err(|e| classify_input_error(e.to_string()))?;

        let sample_rate = supported.sample_rate().0;
        let channels = supported.channels();
        info!(sample_rate, channels, "input config selected");

        let config: StreamConfig = supported.config();
        let (producer, consumer) = create_audio_ring();
        let running = Arc::new(AtomicBool::new(true));
        let lost = Arc::new(AtomicBool::new(false));
        let flags = StreamFlags {
            running: Arc::clone(&running),
            lost: Arc::clone(&lost),
        };

        let stream = match supported.sample_format() {
            SampleFormat::F32 => {
                build_downmix_stream::<f32>(&device, &config, producer, flags)
            }
            SampleFormat::I16 => {
                build_downmix_stream::<i16>(&device, &config, producer, flags)
            }
            SampleFormat::U16 => {
                build_downmix_stream::<u16>(&device, &config, producer, flags)
            }
            SampleFormat::U8 => {
                build_downmix_stream::<u8>(&device, &config, producer, flags)
            }
            fmt => {
                return Err(LiveError::AudioStream(format!(
                    "unsupported sample format: {fmt:?}"
                )))
            }
        }?;

        stream
            .play()
            .map_err(|e| classify_input_error(e.to_string()))?;

        Ok(Self {
            _stream: stream,
            consumer,
            running,
            lost,
            sample_rate,
        })
    }
}

impl AudioSource for CpalSource {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn read(&mut self, buf: &mut [f32]) -> usize {
        self.consumer.pop_slice(buf)
    }

    fn is_finished(&self) -> bool {
        self.lost.load(Ordering::Acquire) && self.consumer.is_empty()
    }
}

/// Shared between the source and its stream callbacks.
struct StreamFlags {
    running: Arc<AtomicBool>,
    lost: Arc<AtomicBool>,
}

impl Drop for CpalSource {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
        info!("input stream released");
    }
}

fn build_downmix_stream<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    mut producer: AudioProducer,
    flags: StreamFlags,
) -> Result<Stream>
where
    T: SizedSample,
    f32: FromSample<T>,
{
    let ch = config.channels.max(1) as usize;
    let mut mix_buf: Vec<f32> = Vec::with_capacity(4096);
    let StreamFlags { running, lost } = flags;

    device
        .build_input_stream(
            config,
            move |data: &[T], _info| {
                if !running.load(Ordering::Relaxed) {
                    return;
                }
                let frames = data.len() / ch;
                mix_buf.resize(frames, 0.0);
                for (f, out) in mix_buf.iter_mut().enumerate() {
                    let base = f * ch;
                    let sum: f32 = data[base..base + ch]
                        .iter()
                        .map(|s| s.to_sample::<f32>())
                        .sum();
                    *out = sum / ch as f32;
                }
                let written = producer.push_slice(&mix_buf);
                if written < mix_buf.len() {
                    warn!(
                        "ring buffer full: dropped {} input frames",
                        mix_buf.len() - written
                    );
                }
            },
            move |err| {
                error!("input stream error: {err}");
                if matches!(err, StreamError::DeviceNotAvailable) {
                    lost.store(true, Ordering::Release);
                }
            },
            None,
        )
        .map_err(|e| classify_input_error(e.to_string()))
}

/// Map a backend error message onto the session taxonomy.
///
/// cpal has no dedicated permission variant; hosts report denial through
/// backend-specific text.
pub(crate) fn classify_input_error(message: String) -> LiveError {
    let lowered = message.to_ascii_lowercase();
    let denied = ["permission", "denied", "not permitted", "unauthorized", "not authorized"]
        .iter()
        .any(|k| lowered.contains(k));
    if denied {
        LiveError::Permission(message)
    } else {
        LiveError::Device(message)
    }
}

#[cfg(test)]
mod tests {
    use super::classify_input_error;
    use crate::error::LiveError;

    #[test]
    fn denial_messages_map_to_permission() {
        assert!(matches!(
            classify_input_error("Access Denied by user".into()),
            LiveError::Permission(_)
        ));
        assert!(matches!(
            classify_input_error("Operation not permitted (os error 1)".into()),
            LiveError::Permission(_)
        ));
        assert!(matches!(
            classify_input_error("The requested device is no longer available".into()),
            LiveError::Device(_)
        ));
    }
}
