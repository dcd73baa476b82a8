//! Audio device enumeration.

use serde::{Deserialize, Serialize};

/// Direction of an audio endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    Input,
    Output,
}

/// Metadata about an audio device.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    /// Human-readable device name reported by the OS.
    pub name: String,
    pub kind: DeviceKind,
    /// Whether this is the system default for its direction.
    pub is_default: bool,
    /// Input that likely captures system output (the call would hear itself).
    pub is_loopback_like: bool,
    /// Best guess for the caller's microphone. Always false for outputs.
    pub is_recommended: bool,
}

const LOOPBACK_KEYWORDS: &[&str] = &[
    "stereo mix",
    "wave out",
    "what u hear",
    "what you hear",
    "loopback",
    "virtual output",
    "monitor of",
    "mix stereo",
    "speakers (",
    "headphones (",
];

const MIC_POSITIVE_KEYWORDS: &[&str] = &[
    "microphone",
    "mic",
    "array",
    "headset",
    "input",
    "line in",
    "usb",
    "webcam",
];

/// Whether an input name looks like a capture of system output.
pub fn is_loopback_like_name(name: &str) -> bool {
    let lowered = name.trim().to_ascii_lowercase();
    LOOPBACK_KEYWORDS.iter().any(|k| lowered.contains(k))
}

/// Score an input name as a speech microphone. Higher is better.
pub fn mic_preference_score(name: &str) -> i32 {
    let lowered = name.trim().to_ascii_lowercase();
    let mut score = if is_loopback_like_name(&lowered) { -16 } else { 8 };
    if MIC_POSITIVE_KEYWORDS.iter().any(|k| lowered.contains(k)) {
        score += 6;
    }
    if lowered.contains("default") {
        score += 1;
    }
    score
}

/// Mark the best microphone and order the list: recommended first, then
/// real microphones, then defaults, then by name.
pub fn rank_inputs(mut list: Vec<DeviceInfo>) -> Vec<DeviceInfo> {
    if let Some(best) = list
        .iter_mut()
        .max_by_key(|d| mic_preference_score(&d.name) + if d.is_default { 2 } else { 0 })
    {
        best.is_recommended = !best.is_loopback_like;
    }
    list.sort_by_key(|d| {
        (
            !d.is_recommended,
            d.is_loopback_like,
            !d.is_default,
            d.name.to_ascii_lowercase(),
        )
    });
    list
}

/// List audio input devices, best microphone first.
///
/// Returns an empty `Vec` when enumeration fails and there is no default.
#[cfg(feature = "audio-cpal")]
pub fn list_input_devices() -> Vec<DeviceInfo> {
    use cpal::traits::{DeviceTrait, HostTrait};

    let host = cpal::default_host();
    let default_name = host.default_input_device().and_then(|d| d.name().ok());

    match host.input_devices() {
        Ok(devices) => {
            let list = devices
                .enumerate()
                .map(|(idx, device)| {
                    let name = device
                        .name()
                        .unwrap_or_else(|_| format!("Input Device {}", idx + 1));
                    DeviceInfo {
                        is_default: default_name.as_deref() == Some(name.as_str()),
                        is_loopback_like: is_loopback_like_name(&name),
                        kind: DeviceKind::Input,
                        is_recommended: false,
                        name,
                    }
                })
                .collect();
            rank_inputs(list)
        }
        Err(e) => {
            tracing::warn!("failed to enumerate input devices: {e}");
            host.default_input_device()
                .map(|device| {
                    let name = device
                        .name()
                        .unwrap_or_else(|_| "Default Input Device".to_string());
                    let is_loopback_like = is_loopback_like_name(&name);
                    vec![DeviceInfo {
                        name,
                        kind: DeviceKind::Input,
                        is_default: true,
                        is_loopback_like,
                        is_recommended: !is_loopback_like,
                    }]
                })
                .unwrap_or_default()
        }
    }
}

/// List audio output devices, default first.
#[cfg(feature = "audio-cpal")]
pub fn list_output_devices() -> Vec<DeviceInfo> {
    use cpal::traits::{DeviceTrait, HostTrait};

    let host = cpal::default_host();
    let default_name = host.default_output_device().and_then(|d| d.name().ok());

    let mut list: Vec<DeviceInfo> = match host.output_devices() {
        Ok(devices) => devices
            .enumerate()
            .map(|(idx, device)| {
                let name = device
                    .name()
                    .unwrap_or_else(|_| format!("Output Device {}", idx + 1));
                DeviceInfo {
                    is_default: default_name.as_deref() == Some(name.as_str()),
                    kind: DeviceKind::Output,
                    is_loopback_like: false,
                    is_recommended: false,
                    name,
                }
            })
            .collect(),
        Err(e) => {
            tracing::warn!("failed to enumerate output devices: {e}");
            Vec::new()
        }
    };
    list.sort_by_key(|d| (!d.is_default, d.name.to_ascii_lowercase()));
    list
}

#[cfg(not(feature = "audio-cpal"))]
pub fn list_input_devices() -> Vec<DeviceInfo> {
    vec![]
}

#[cfg(not(feature = "audio-cpal"))]
pub fn list_output_devices() -> Vec<DeviceInfo> {
    vec![]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(name: &str, is_default: bool) -> DeviceInfo {
        DeviceInfo {
            name: name.to_string(),
            kind: DeviceKind::Input,
            is_default,
            is_loopback_like: is_loopback_like_name(name),
            is_recommended: false,
        }
    }

    #[test]
    fn detects_common_loopback_names() {
        assert!(is_loopback_like_name("Stereo Mix (Realtek Audio)"));
        assert!(is_loopback_like_name("Monitor of Built-in Audio"));
        assert!(!is_loopback_like_name("USB Headset Microphone"));
    }

    #[test]
    fn scores_mic_higher_than_loopback() {
        let mic = mic_preference_score("Microphone Array (USB PnP Audio Device)");
        let loopback = mic_preference_score("Stereo Mix (Realtek Audio)");
        assert!(mic > loopback);
    }

    #[test]
    fn default_loopback_does_not_win_over_microphone() {
        let ranked = rank_inputs(vec![
            input("Stereo Mix (Realtek Audio)", true),
            input("USB Microphone", false),
        ]);
        assert_eq!(ranked[0].name, "USB Microphone");
        assert!(ranked[0].is_recommended);
        assert!(!ranked[1].is_recommended);
    }

    #[test]
    fn only_loopback_inputs_get_no_recommendation() {
        let ranked = rank_inputs(vec![input("Stereo Mix", true)]);
        assert!(!ranked[0].is_recommended);
    }
}
