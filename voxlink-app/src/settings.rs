//! Persistent call settings (JSON file in the app data directory).

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use voxlink_core::session::config::DEFAULT_ENDPOINT;
use voxlink_core::SessionConfig;

pub const ENV_API_KEY: &str = "VOXLINK_API_KEY";
pub const ENV_ENDPOINT: &str = "VOXLINK_ENDPOINT";

const DEFAULT_VOICE: &str = "Kore";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct AppSettings {
    pub endpoint: String,
    pub api_key: Option<String>,
    pub model: String,
    pub voice: String,
    pub instructions: String,
    pub preferred_input_device: Option<String>,
    pub preferred_output_device: Option<String>,
    pub frame_samples: usize,
    pub connect_timeout_secs: u64,
}

impl Default for AppSettings {
    fn default() -> Self {
        let session = SessionConfig::default();
        Self {
            endpoint: DEFAULT_ENDPOINT.into(),
            api_key: None,
            model: session.model,
            voice: DEFAULT_VOICE.into(),
            instructions: "You are a friendly voice assistant. Speak naturally and keep answers short."
                .into(),
            preferred_input_device: None,
            preferred_output_device: None,
            frame_samples: session.frame_samples,
            connect_timeout_secs: session.connect_timeout.as_secs(),
        }
    }
}

impl AppSettings {
    pub fn normalize(&mut self) {
        self.endpoint = self.endpoint.trim().to_string();
        if self.endpoint.is_empty() {
            self.endpoint = DEFAULT_ENDPOINT.into();
        }
        self.api_key = trimmed(self.api_key.take());
        self.model = self.model.trim().to_string();
        if self.model.is_empty() {
            self.model = SessionConfig::default().model;
        }
        self.voice = self.voice.trim().to_string();
        if self.voice.is_empty() {
            self.voice = DEFAULT_VOICE.into();
        }
        self.instructions = self.instructions.trim().to_string();
        self.preferred_input_device = trimmed(self.preferred_input_device.take());
        self.preferred_output_device = trimmed(self.preferred_output_device.take());
        self.frame_samples = self.frame_samples.clamp(256, 1 << 16).next_power_of_two();
        self.connect_timeout_secs = self.connect_timeout_secs.clamp(1, 120);
    }

    /// Overlay credentials and endpoint from the environment.
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(key) = lookup(ENV_API_KEY) {
            self.api_key = Some(key);
        }
        if let Some(endpoint) = lookup(ENV_ENDPOINT) {
            self.endpoint = endpoint;
        }
        self.normalize();
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            endpoint: self.endpoint.clone(),
            api_key: self.api_key.clone().unwrap_or_default(),
            model: self.model.clone(),
            voice: self.voice.clone(),
            instructions: self.instructions.clone(),
            frame_samples: self.frame_samples,
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
        }
    }
}

fn trimmed(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

pub fn default_settings_path() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var_os("APPDATA")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."))
            .join("Lattice Labs")
            .join("Voxlink")
            .join("settings.json")
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var_os("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                std::env::var_os("HOME")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from("/tmp"))
                    .join(".local")
                    .join("share")
            })
            .join("voxlink")
            .join("settings.json")
    }
}

pub fn load_settings(path: &Path) -> AppSettings {
    let mut settings = fs::read_to_string(path)
        .ok()
        .and_then(|raw| serde_json::from_str::<AppSettings>(&raw).ok())
        .unwrap_or_default();
    settings.normalize();
    settings
}

pub fn save_settings(path: &Path, settings: &AppSettings) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(settings).map_err(std::io::Error::other)?;
    fs::write(path, json)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = load_settings(&dir.path().join("nope.json"));
        assert_eq!(settings.voice, "Kore");
        assert_eq!(settings.frame_samples, 4096);
        assert!(settings.api_key.is_none());
    }

    #[test]
    fn partial_file_keeps_defaults_and_normalizes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(
            &path,
            r#"{"voice":"  ","apiKey":"  ","frameSamples":5000,"connectTimeoutSecs":0,"preferredInputDevice":" USB Mic "}"#,
        )
        .unwrap();

        let settings = load_settings(&path);
        assert_eq!(settings.voice, "Kore");
        assert!(settings.api_key.is_none());
        assert_eq!(settings.frame_samples, 8192);
        assert_eq!(settings.connect_timeout_secs, 1);
        assert_eq!(settings.preferred_input_device.as_deref(), Some("USB Mic"));
        assert_eq!(settings.endpoint, DEFAULT_ENDPOINT);
    }

    #[test]
    fn save_then_load_preserves_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("settings.json");
        let mut settings = AppSettings {
            voice: "Puck".into(),
            instructions: "Answer in Bengali.".into(),
            ..AppSettings::default()
        };
        settings.normalize();
        save_settings(&path, &settings).unwrap();

        let loaded = load_settings(&path);
        assert_eq!(loaded.voice, "Puck");
        assert_eq!(loaded.instructions, "Answer in Bengali.");
    }

    #[test]
    fn env_overrides_credentials() {
        let mut settings = AppSettings::default();
        settings.apply_env_overrides(|key| match key {
            ENV_API_KEY => Some(" secret ".into()),
            ENV_ENDPOINT => Some("wss://staging.example/live".into()),
            _ => None,
        });
        let config = settings.session_config();
        assert_eq!(config.api_key, "secret");
        assert_eq!(config.connect_url(), "wss://staging.example/live?key=secret");
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
    }
}
