//! Audio device enumeration for both directions.

use serde::{Deserialize, Serialize};

/// Which side of the call a device serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceDirection {
    Input,
    Output,
}

/// Metadata about an audio device.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    /// Human-readable device name reported by the OS.
    pub name: String,
    pub direction: DeviceDirection,
    /// Whether this is the system default for its direction.
    pub is_default: bool,
    /// Input that most likely records system output rather than a voice.
    /// Picking one of these makes the agent hear itself.
    pub is_loopback_like: bool,
}

const LOOPBACK_KEYWORDS: &[&str] = &[
    "stereo mix",
    "what u hear",
    "what you hear",
    "loopback",
    "monitor of",
    "wave out",
];

/// Heuristic for capture devices that mirror the speaker output.
pub fn is_loopback_like_name(name: &str) -> bool {
    let lowered = name.trim().to_ascii_lowercase();
    LOOPBACK_KEYWORDS.iter().any(|k| lowered.contains(k))
}

/// Order a device list: defaults first, loopback-like inputs last, then by name.
pub fn sort_devices(list: &mut [DeviceInfo]) {
    list.sort_by_key(|d| (!d.is_default, d.is_loopback_like, d.name.to_ascii_lowercase()));
}

/// Input devices, default first.
pub fn list_input_devices() -> Vec<DeviceInfo> {
    list_devices(DeviceDirection::Input)
}

/// Output devices, default first.
pub fn list_output_devices() -> Vec<DeviceInfo> {
    list_devices(DeviceDirection::Output)
}

#[cfg(feature = "audio-cpal")]
type DeviceIter = Box<dyn Iterator<Item = cpal::Device>>;

#[cfg(feature = "audio-cpal")]
fn enumerate(host: &cpal::Host, direction: DeviceDirection) -> Result<DeviceIter, cpal::DevicesError> {
    use cpal::traits::HostTrait;

    Ok(match direction {
        DeviceDirection::Input => Box::new(host.input_devices()?) as DeviceIter,
        DeviceDirection::Output => Box::new(host.output_devices()?) as DeviceIter,
    })
}

#[cfg(feature = "audio-cpal")]
fn default_device(host: &cpal::Host, direction: DeviceDirection) -> Option<cpal::Device> {
    use cpal::traits::HostTrait;

    match direction {
        DeviceDirection::Input => host.default_input_device(),
        DeviceDirection::Output => host.default_output_device(),
    }
}

/// Enumerate one direction on the default host. Empty when the host
/// cannot enumerate or the cpal backend is compiled out.
#[cfg(feature = "audio-cpal")]
pub fn list_devices(direction: DeviceDirection) -> Vec<DeviceInfo> {
    use cpal::traits::DeviceTrait;

    let host = cpal::default_host();
    let default_name = default_device(&host, direction).and_then(|d| d.name().ok());
    let devices = match enumerate(&host, direction) {
        Ok(devices) => devices,
        Err(e) => {
            tracing::warn!(?direction, "device enumeration failed: {e}");
            return Vec::new();
        }
    };

    let mut list: Vec<DeviceInfo> = devices
        .enumerate()
        .map(|(idx, device)| {
            let name = device.name().unwrap_or_else(|_| format!("Device {}", idx + 1));
            describe(name, direction, default_name.as_deref())
        })
        .collect();
    sort_devices(&mut list);
    list
}

/// Resolve the device to open: the preferred name if present, else the
/// host default, else the first one enumerated.
#[cfg(feature = "audio-cpal")]
pub(crate) fn select_device(
    host: &cpal::Host,
    direction: DeviceDirection,
    preferred: Option<&str>,
) -> Result<Option<cpal::Device>, cpal::DevicesError> {
    use cpal::traits::DeviceTrait;

    if let Some(name) = preferred {
        match enumerate(host, direction)?.find(|d| d.name().is_ok_and(|n| n == name)) {
            Some(device) => return Ok(Some(device)),
            None => tracing::warn!(?direction, "preferred device '{name}' not found, falling back"),
        }
    }
    if let Some(device) = default_device(host, direction) {
        return Ok(Some(device));
    }
    tracing::warn!(?direction, "no default device, trying the first available");
    Ok(enumerate(host, direction)?.next())
}

#[cfg(not(feature = "audio-cpal"))]
pub fn list_devices(_direction: DeviceDirection) -> Vec<DeviceInfo> {
    Vec::new()
}

#[cfg_attr(not(feature = "audio-cpal"), allow(dead_code))]
fn describe(name: String, direction: DeviceDirection, default_name: Option<&str>) -> DeviceInfo {
    DeviceInfo {
        is_default: default_name == Some(name.as_str()),
        is_loopback_like: direction == DeviceDirection::Input && is_loopback_like_name(&name),
        name,
        direction,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(name: &str, is_default: bool) -> DeviceInfo {
        let default_name = is_default.then_some(name);
        describe(name.into(), DeviceDirection::Input, default_name)
    }

    #[test]
    fn detects_common_loopback_names() {
        assert!(is_loopback_like_name("Stereo Mix (Realtek Audio)"));
        assert!(is_loopback_like_name("Monitor of Built-in Audio"));
        assert!(!is_loopback_like_name("MacBook Pro Microphone"));
    }

    #[test]
    fn default_sorts_first_and_loopback_last() {
        let mut list = vec![
            info("Stereo Mix", false),
            info("USB Mic", false),
            info("Built-in Microphone", true),
        ];
        sort_devices(&mut list);
        let names: Vec<_> = list.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, ["Built-in Microphone", "USB Mic", "Stereo Mix"]);
    }

    #[test]
    fn outputs_are_never_flagged_as_loopback() {
        let device = describe("Monitor of Speakers".into(), DeviceDirection::Output, None);
        assert!(!device.is_loopback_like);
        assert!(!device.is_default);
    }

    #[test]
    fn serializes_direction_lowercase() {
        let json = serde_json::to_value(info("USB Mic", true)).unwrap();
        assert_eq!(json["direction"], "input");
        assert_eq!(json["isDefault"], true);
    }
}
