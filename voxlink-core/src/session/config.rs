use std::time::Duration;

/// Default live audio endpoint (WebSocket).
pub const DEFAULT_ENDPOINT: &str = "wss://live.voxlink.dev/v1/session";

/// Configuration for one `LiveSession`.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// WebSocket URL of the live audio service.
    pub endpoint: String,
    /// Caller-supplied credential, appended as `key=` to the endpoint.
    pub api_key: String,
    pub model: String,
    /// Prebuilt voice the agent speaks with. Default: `"Kore"`.
    pub voice: String,
    /// Persona / system instructions sent in the setup message.
    pub instructions: String,
    /// Capture frame length in samples at 16 kHz. Power of two. Default: 4096.
    pub frame_samples: usize,
    /// Upper bound on connect + handshake. Default: 10 s.
    pub connect_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.into(),
            api_key: String::new(),
            model: "live-audio-native".into(),
            voice: "Kore".into(),
            instructions: String::new(),
            frame_samples: 4096,
            connect_timeout: Duration::from_secs(10),
        }
    }
}

impl SessionConfig {
    /// Endpoint with the credential attached.
    pub fn connect_url(&self) -> String {
        if self.api_key.is_empty() {
            return self.endpoint.clone();
        }
        let sep = if self.endpoint.contains('?') { '&' } else { '?' };
        format!("{}{sep}key={}", self.endpoint, self.api_key)
    }

    /// Capture frame size rounded up to the next power of two (min 256).
    pub fn normalized_frame_samples(&self) -> usize {
        self.frame_samples.clamp(256, 1 << 16).next_power_of_two()
    }
}
