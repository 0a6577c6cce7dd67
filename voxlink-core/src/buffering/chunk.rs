//! Audio units that cross stage boundaries: raw capture frames and the
//! text-safe chunks that travel over the transport.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::codec;
use crate::error::{LiveError, Result};

/// Sample rate of microphone audio sent to the remote service (Hz).
pub const INPUT_SAMPLE_RATE: u32 = 16_000;

/// Sample rate of agent audio received from the remote service (Hz).
pub const OUTPUT_SAMPLE_RATE: u32 = 24_000;

/// Wire format tag of an encoded chunk: mono PCM16 at a fixed rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioFormat {
    pub sample_rate: u32,
}

impl AudioFormat {
    pub const CAPTURE: AudioFormat = AudioFormat {
        sample_rate: INPUT_SAMPLE_RATE,
    };
    pub const AGENT: AudioFormat = AudioFormat {
        sample_rate: OUTPUT_SAMPLE_RATE,
    };

    /// Wire tag, e.g. `"pcm16-mono-16kHz"`.
    pub fn tag(&self) -> String {
        if self.sample_rate % 1000 == 0 {
            format!("pcm16-mono-{}kHz", self.sample_rate / 1000)
        } else {
            format!("pcm16-mono-{}Hz", self.sample_rate)
        }
    }

    /// Parse a wire tag. Accepts `pcm16-mono-24kHz`, `pcm16-mono-22050Hz`
    /// and the MIME style `audio/pcm;rate=24000`.
    pub fn parse(tag: &str) -> Option<Self> {
        let tag = tag.trim();
        if let Some(rest) = tag.strip_prefix("pcm16-mono-") {
            let rate = if let Some(khz) = rest.strip_suffix("kHz") {
                khz.parse::<u32>().ok()?.checked_mul(1000)?
            } else {
                rest.strip_suffix("Hz")?.parse::<u32>().ok()?
            };
            return (rate > 0).then_some(Self { sample_rate: rate });
        }
        if tag.starts_with("audio/pcm") {
            let rate = tag
                .split(';')
                .filter_map(|p| p.trim().strip_prefix("rate="))
                .next()?
                .parse::<u32>()
                .ok()?;
            return (rate > 0).then_some(Self { sample_rate: rate });
        }
        None
    }
}

impl fmt::Display for AudioFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.tag())
    }
}

impl Serialize for AudioFormat {
    fn serialize<S: serde::Serializer>(&self, s: S) -> std::result::Result<S::Ok, S::Error> {
        s.serialize_str(&self.tag())
    }
}

impl<'de> Deserialize<'de> for AudioFormat {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(d)?;
        AudioFormat::parse(&raw)
            .ok_or_else(|| serde::de::Error::custom(format!("unknown audio format: {raw}")))
    }
}

/// One capture tick of mono PCM16 samples.
#[derive(Debug, Clone)]
pub struct AudioFrame {
    pub samples: Vec<i16>,
    pub sample_rate: u32,
    pub channels: u16,
}

impl AudioFrame {
    /// Build a frame from float samples, clamping and quantising each one.
    pub fn from_f32(samples: &[f32], sample_rate: u32) -> Self {
        Self {
            samples: codec::f32_to_i16_buffer(samples),
            sample_rate,
            channels: 1,
        }
    }

    pub fn duration_secs(&self) -> f64 {
        self.samples.len() as f64 / self.sample_rate as f64
    }

    /// Encode for the wire.
    pub fn encode(&self) -> EncodedChunk {
        EncodedChunk {
            format: AudioFormat {
                sample_rate: self.sample_rate,
            },
            data: codec::encode_base64(&codec::i16_to_le_bytes(&self.samples)),
        }
    }
}

/// Base64 PCM16 payload plus its format tag. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncodedChunk {
    format: AudioFormat,
    data: String,
}

impl EncodedChunk {
    pub fn new(format: AudioFormat, data: impl Into<String>) -> Self {
        Self {
            format,
            data: data.into(),
        }
    }

    pub fn format(&self) -> AudioFormat {
        self.format
    }

    pub fn data(&self) -> &str {
        &self.data
    }

    /// Decode to float samples in `[-1, 1]`.
    ///
    /// # Errors
    /// `LiveError::Decode` on bad base64 or an odd byte count.
    pub fn decode(&self) -> Result<DecodedAudio> {
        let bytes = codec::decode_base64(&self.data)?;
        let pcm = codec::le_bytes_to_i16(&bytes)?;
        if self.format.sample_rate == 0 {
            return Err(LiveError::Decode("zero sample rate".into()));
        }
        Ok(DecodedAudio {
            samples: codec::i16_to_f32_buffer(&pcm),
            sample_rate: self.format.sample_rate,
        })
    }
}

/// Decoded mono float audio ready for scheduling.
#[derive(Debug, Clone)]
pub struct DecodedAudio {
    /// Mono f32 samples in [-1.0, 1.0].
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl DecodedAudio {
    /// Returns the duration of this buffer in seconds.
    pub fn duration_secs(&self) -> f64 {
        self.samples.len() as f64 / self.sample_rate as f64
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}
