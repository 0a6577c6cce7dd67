use thiserror::Error;

/// All errors produced by voxlink-core.
#[derive(Debug, Error)]
pub enum LiveError {
    #[error("microphone access denied: {0}")]
    Permission(String),

    #[error("audio device error: {0}")]
    Device(String),

    #[error("audio stream error: {0}")]
    AudioStream(String),

    #[error("connection failed: {0}")]
    Connection(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("malformed audio chunk: {0}")]
    Decode(String),

    #[error("session already started")]
    AlreadyStarted,

    #[error("session is closed")]
    SessionClosed,

    #[error("session start cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl LiveError {
    /// `true` for errors that end the session (everything but a dropped chunk).
    pub fn is_fatal(&self) -> bool {
        !matches!(self, LiveError::Decode(_))
    }
}

pub type Result<T> = std::result::Result<T, LiveError>;
