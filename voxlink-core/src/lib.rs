//! # voxlink-core
//!
//! Real-time, bidirectional voice session SDK.
//!
//! ## Architecture
//!
//! ```text
//! Microphone → AudioSource → CaptureStage(thread) → PCM16 + base64 → Transport.send
//!                                                                        │
//!                                                                     network
//!                                                                        │
//! Speaker ← AudioSink ← PlaybackScheduler::dispatch ← session loop ← TransportEvent
//!                              │
//!                    broadcast::Sender<SpeakingEvent>
//! ```
//!
//! The cpal callbacks never allocate or block. Network I/O stays on tokio
//! tasks; the capture thread only enqueues.

#![forbid(unsafe_code)]
#![warn(clippy::all)]

pub mod audio;
pub mod buffering;
pub mod capture;
pub mod codec;
pub mod error;
pub mod ipc;
pub mod playback;
pub mod session;
pub mod transport;

// Convenience re-exports for downstream crates
pub use audio::{AudioBackend, AudioSink, AudioSource};
pub use buffering::chunk::{AudioFormat, AudioFrame, EncodedChunk};
pub use error::{LiveError, Result};
pub use ipc::events::{
    SessionState, SessionStatusEvent, SpeakingEvent, TranscriptEvent, TranscriptKind,
};
pub use playback::{PlaybackEvent, PlaybackScheduler};
pub use session::{CleanupHandle, DiagnosticsSnapshot, LiveSession, SessionConfig};
pub use transport::{Connector, InboundMessage, Transport, TransportEvent, WsConnector};

#[cfg(feature = "audio-cpal")]
pub use audio::{CpalBackend, WavInputBackend};
