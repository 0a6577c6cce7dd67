//! Events broadcast by `LiveSession`.
//!
//! | Event | Subscription |
//! |-------|--------------|
//! | `SpeakingEvent` | `subscribe_speaking()` |
//! | `TranscriptEvent` | `subscribe_transcripts()` |
//! | `SessionStatusEvent` | `subscribe_status()` |

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Agent speaking
// ---------------------------------------------------------------------------

/// Fired exactly when the set of sounding playback handles flips between
/// empty and non-empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpeakingEvent {
    /// Monotonically increasing per session.
    pub seq: u64,
    pub speaking: bool,
}

// ---------------------------------------------------------------------------
// Transcript pass-through
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptEvent {
    pub seq: u64,
    /// Text as delivered by the remote service. Empty for `TurnComplete`.
    pub text: String,
    pub kind: TranscriptKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TranscriptKind {
    /// Transcript text fragment.
    Text,
    /// The remote side finished its turn.
    TurnComplete,
}

// ---------------------------------------------------------------------------
// Session status
// ---------------------------------------------------------------------------

/// Emitted on every session state transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatusEvent {
    pub state: SessionState,
    /// Optional human-readable detail (e.g. the error that closed the session).
    pub detail: Option<String>,
}

/// Lifecycle of one session. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    /// Created, `start()` not yet called.
    Idle,
    /// Devices acquired or being acquired, transport handshake in flight.
    Connecting,
    /// Transport open, audio flowing both ways.
    Active,
    /// Torn down. Start a fresh session to call again.
    Closed,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        self == SessionState::Closed
    }
}
