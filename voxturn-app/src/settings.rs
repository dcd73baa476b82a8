//! Persistent host settings (JSON file in the app data directory).

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use voxturn_core::{
    services::HttpServiceConfig, EnergyVadConfig, EngineConfig, Persona, StageTimeouts, VoiceId,
};

pub const DEFAULT_PERSONA: &str = "helpful";
pub const DEFAULT_VOICE: &str = "en-US-JennyNeural";

const HELPFUL_PROMPT: &str = "You are a helpful female assistant named Lily. You have a calm, \
empathetic demeanor. Your voice is warm and patient, and you give clear, concise and accurate \
answers. You avoid jargon unless the user explicitly asks for technical detail. Keep replies \
short enough to be spoken aloud.";

const CONCISE_PROMPT: &str = "You are a concise voice assistant. Answer in one or two plain \
sentences that read well when spoken.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceBackend {
    /// Offline echo services, no network.
    Stub,
    /// Ollama for inference, OpenAI-compatible audio endpoints for STT/TTS.
    Http,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct ServiceSettings {
    pub backend: ServiceBackend,
    pub inference: HttpServiceConfig,
    pub transcription: HttpServiceConfig,
    pub synthesis: HttpServiceConfig,
    /// Transcripts reported below this confidence are rejected.
    pub min_transcript_confidence: Option<f32>,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            backend: ServiceBackend::Stub,
            inference: HttpServiceConfig {
                base_url: "http://localhost:11434".into(),
                model: "llama3.2".into(),
                ..HttpServiceConfig::default()
            },
            transcription: HttpServiceConfig {
                base_url: "http://localhost:8000".into(),
                model: "whisper-1".into(),
                ..HttpServiceConfig::default()
            },
            synthesis: HttpServiceConfig {
                base_url: "http://localhost:8000".into(),
                model: "tts-1".into(),
                ..HttpServiceConfig::default()
            },
            min_transcript_confidence: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct AppSettings {
    pub input_device: Option<String>,
    pub output_device: Option<String>,
    /// Key into `personas`.
    pub persona: String,
    /// Persona key → system prompt.
    pub personas: BTreeMap<String, String>,
    pub voice: String,
    pub services: ServiceSettings,

    pub silence_timeout_ms: u64,
    pub min_utterance_ms: u64,
    /// `0` disables the cap.
    pub max_utterance_ms: u64,
    pub hangup_timeout_ms: u64,
    pub still_there_enabled: bool,
    pub still_there_window_ms: u64,
    pub still_there_prompt: String,
    pub trailing_pad_frames: u32,
    pub vad_rms_threshold: f32,
    pub vad_amplitude_gate: f32,
    pub vad_hangover_frames: u32,

    pub transcribe_timeout_ms: u64,
    pub infer_timeout_ms: u64,
    pub synthesize_timeout_ms: u64,
    pub playback_slack_ms: u64,
    pub history_window: usize,
    pub fallback_reply: String,
    pub max_consecutive_failures: u32,
    pub mute_while_speaking: bool,

    /// `None` uses [`default_store_path`].
    pub store_path: Option<String>,
    pub history_enabled: bool,
    pub retention_days: usize,
}

impl Default for AppSettings {
    fn default() -> Self {
        let engine = EngineConfig::default();
        Self {
            input_device: None,
            output_device: None,
            persona: DEFAULT_PERSONA.into(),
            personas: default_personas(),
            voice: DEFAULT_VOICE.into(),
            services: ServiceSettings::default(),
            silence_timeout_ms: 800,
            min_utterance_ms: 300,
            max_utterance_ms: 30_000,
            hangup_timeout_ms: 120_000,
            still_there_enabled: true,
            still_there_window_ms: 15_000,
            still_there_prompt: engine.still_there_prompt,
            trailing_pad_frames: 2,
            vad_rms_threshold: engine.vad.rms_threshold,
            vad_amplitude_gate: engine.vad.amplitude_gate,
            vad_hangover_frames: engine.vad.hangover_frames,
            transcribe_timeout_ms: 15_000,
            infer_timeout_ms: 30_000,
            synthesize_timeout_ms: 20_000,
            playback_slack_ms: 2_000,
            history_window: engine.history_window,
            fallback_reply: engine.fallback_reply,
            max_consecutive_failures: engine.max_consecutive_failures,
            mute_while_speaking: true,
            store_path: None,
            history_enabled: true,
            retention_days: 90,
        }
    }
}

fn default_personas() -> BTreeMap<String, String> {
    BTreeMap::from([
        (DEFAULT_PERSONA.to_string(), HELPFUL_PROMPT.to_string()),
        ("concise".to_string(), CONCISE_PROMPT.to_string()),
    ])
}

impl AppSettings {
    pub fn normalize(&mut self) {
        let defaults = AppSettings::default();

        self.input_device = normalize_optional(self.input_device.take());
        self.output_device = normalize_optional(self.output_device.take());
        self.store_path = normalize_optional(self.store_path.take());
        self.services.inference.api_key = normalize_optional(self.services.inference.api_key.take());
        self.services.transcription.api_key =
            normalize_optional(self.services.transcription.api_key.take());
        self.services.synthesis.api_key = normalize_optional(self.services.synthesis.api_key.take());
        self.services.min_transcript_confidence = self
            .services
            .min_transcript_confidence
            .map(|c| c.clamp(0.0, 1.0));

        self.personas = normalize_personas(&self.personas);
        self.persona = normalize_key(&self.persona);
        if !self.personas.contains_key(&self.persona) {
            self.persona = if self.personas.contains_key(DEFAULT_PERSONA) {
                DEFAULT_PERSONA.into()
            } else {
                self.personas.keys().next().cloned().unwrap_or_default()
            };
        }
        self.voice = non_empty_or(&self.voice, DEFAULT_VOICE);

        self.silence_timeout_ms = self.silence_timeout_ms.clamp(90, 5_000);
        self.max_utterance_ms = match self.max_utterance_ms {
            0 => 0,
            ms => ms.clamp(1_000, 120_000),
        };
        self.min_utterance_ms = self.min_utterance_ms.min(5_000);
        if self.max_utterance_ms > 0 {
            self.min_utterance_ms = self.min_utterance_ms.min(self.max_utterance_ms);
        }
        self.hangup_timeout_ms = self.hangup_timeout_ms.clamp(5_000, 3_600_000);
        self.still_there_window_ms = self.still_there_window_ms.clamp(1_000, 120_000);
        self.still_there_prompt = non_empty_or(&self.still_there_prompt, &defaults.still_there_prompt);
        self.trailing_pad_frames = self.trailing_pad_frames.min(10);

        self.vad_rms_threshold = clamp_finite(self.vad_rms_threshold, 0.0005, 0.5, defaults.vad_rms_threshold);
        self.vad_amplitude_gate =
            clamp_finite(self.vad_amplitude_gate, 0.0, 0.1, defaults.vad_amplitude_gate);
        self.vad_hangover_frames = self.vad_hangover_frames.min(20);

        self.transcribe_timeout_ms = self.transcribe_timeout_ms.clamp(500, 120_000);
        self.infer_timeout_ms = self.infer_timeout_ms.clamp(500, 120_000);
        self.synthesize_timeout_ms = self.synthesize_timeout_ms.clamp(500, 120_000);
        self.playback_slack_ms = self.playback_slack_ms.min(30_000);
        self.history_window = self.history_window.min(50);
        self.fallback_reply = non_empty_or(&self.fallback_reply, &defaults.fallback_reply);
        self.max_consecutive_failures = self.max_consecutive_failures.min(100);
        self.retention_days = self.retention_days.min(3_650);
    }

    /// Apply `VOXTURN_*` overrides from the process environment.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    fn apply_overrides_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(persona) = lookup("VOXTURN_PERSONA") {
            self.persona = persona;
        }
        if let Some(voice) = lookup("VOXTURN_VOICE") {
            self.voice = voice;
        }
        if let Some(backend) = lookup("VOXTURN_SERVICES") {
            match backend.trim().to_ascii_lowercase().as_str() {
                "http" => self.services.backend = ServiceBackend::Http,
                "stub" => self.services.backend = ServiceBackend::Stub,
                _ => {}
            }
        }
        if let Some(url) = lookup("VOXTURN_OLLAMA_URL") {
            self.services.inference.base_url = url;
        }
        if let Some(model) = lookup("VOXTURN_OLLAMA_MODEL") {
            self.services.inference.model = model;
        }
        if let Some(url) = lookup("VOXTURN_AUDIO_API_URL") {
            self.services.transcription.base_url = url.clone();
            self.services.synthesis.base_url = url;
        }
        if let Some(key) = lookup("VOXTURN_OPENAI_API_KEY") {
            self.services.transcription.api_key = Some(key.clone());
            self.services.synthesis.api_key = Some(key);
        }
        if let Some(ms) = lookup("VOXTURN_HANGUP_TIMEOUT_MS").and_then(|v| v.trim().parse().ok()) {
            self.hangup_timeout_ms = ms;
        }
        if let Some(path) = lookup("VOXTURN_DATABASE_PATH") {
            self.store_path = Some(path);
        }
    }

    /// Engine configuration for the next call.
    pub fn engine_config(&self) -> EngineConfig {
        let ms = Duration::from_millis;
        EngineConfig {
            vad: EnergyVadConfig {
                amplitude_gate: self.vad_amplitude_gate,
                rms_threshold: self.vad_rms_threshold,
                hangover_frames: self.vad_hangover_frames,
            },
            silence_timeout: ms(self.silence_timeout_ms),
            min_utterance: ms(self.min_utterance_ms),
            max_utterance: ms(self.max_utterance_ms),
            hangup_timeout: ms(self.hangup_timeout_ms),
            still_there_window: self
                .still_there_enabled
                .then(|| ms(self.still_there_window_ms)),
            trailing_pad_frames: self.trailing_pad_frames,
            stage_timeouts: StageTimeouts {
                transcribe: ms(self.transcribe_timeout_ms),
                infer: ms(self.infer_timeout_ms),
                synthesize: ms(self.synthesize_timeout_ms),
            },
            playback_slack: ms(self.playback_slack_ms),
            history_window: self.history_window,
            fallback_reply: self.fallback_reply.clone(),
            still_there_prompt: self.still_there_prompt.clone(),
            max_consecutive_failures: self.max_consecutive_failures,
            mute_while_speaking: self.mute_while_speaking,
            ..EngineConfig::default()
        }
    }

    /// Resolve a persona key (or the configured default) to its prompt.
    pub fn persona_for(&self, key: Option<&str>) -> Result<Persona> {
        let key = key.map(normalize_key).unwrap_or_else(|| self.persona.clone());
        let prompt = self.personas.get(&key).ok_or_else(|| {
            let known: Vec<&str> = self.personas.keys().map(String::as_str).collect();
            anyhow!("unknown persona '{key}' (known: {})", known.join(", "))
        })?;
        Ok(Persona::new(key, prompt.clone()))
    }

    pub fn voice_for(&self, voice: Option<&str>) -> VoiceId {
        VoiceId::new(non_empty_or(voice.unwrap_or(&self.voice), &self.voice))
    }

    pub fn store_path(&self) -> PathBuf {
        self.store_path
            .as_deref()
            .map(PathBuf::from)
            .unwrap_or_else(default_store_path)
    }
}

fn normalize_optional(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn normalize_key(raw: &str) -> String {
    raw.trim().to_ascii_lowercase().replace([' ', '-'], "_")
}

fn non_empty_or(raw: &str, fallback: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        fallback.into()
    } else {
        trimmed.into()
    }
}

fn clamp_finite(value: f32, min: f32, max: f32, fallback: f32) -> f32 {
    if value.is_finite() {
        value.clamp(min, max)
    } else {
        fallback
    }
}

fn normalize_personas(raw: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    for (key, prompt) in raw {
        let key = normalize_key(key);
        let prompt = prompt.trim();
        if key.is_empty() || prompt.is_empty() {
            continue;
        }
        out.entry(key).or_insert_with(|| prompt.to_string());
    }
    if out.is_empty() {
        return default_personas();
    }
    out
}

fn data_dir() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var_os("APPDATA")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."))
            .join("voxturn")
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
            .join("voxturn")
    }
}

pub fn default_settings_path() -> PathBuf {
    data_dir().join("settings.json")
}

pub fn default_store_path() -> PathBuf {
    data_dir().join("conversations.db")
}

/// Missing or unreadable files fall back to defaults.
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
    fn defaults_survive_normalize() {
        let mut settings = AppSettings::default();
        settings.normalize();
        assert_eq!(settings.persona, DEFAULT_PERSONA);
        assert_eq!(settings.voice, DEFAULT_VOICE);
        assert_eq!(settings.silence_timeout_ms, 800);
        assert_eq!(settings.hangup_timeout_ms, 120_000);
        assert!(settings.personas.contains_key("helpful"));
    }

    #[test]
    fn normalize_clamps_out_of_range_values() {
        let mut settings = AppSettings {
            silence_timeout_ms: 1,
            hangup_timeout_ms: 10,
            max_utterance_ms: 500,
            min_utterance_ms: 9_000,
            vad_rms_threshold: f32::NAN,
            trailing_pad_frames: 99,
            fallback_reply: "   ".into(),
            input_device: Some("  ".into()),
            ..AppSettings::default()
        };
        settings.normalize();
        assert_eq!(settings.silence_timeout_ms, 90);
        assert_eq!(settings.hangup_timeout_ms, 5_000);
        assert_eq!(settings.max_utterance_ms, 1_000);
        assert_eq!(settings.min_utterance_ms, 1_000);
        assert_eq!(settings.vad_rms_threshold, AppSettings::default().vad_rms_threshold);
        assert_eq!(settings.trailing_pad_frames, 10);
        assert!(!settings.fallback_reply.trim().is_empty());
        assert_eq!(settings.input_device, None);
    }

    #[test]
    fn unknown_persona_falls_back_to_default() {
        let mut settings = AppSettings {
            persona: "Pirate Captain".into(),
            ..AppSettings::default()
        };
        settings.normalize();
        assert_eq!(settings.persona, DEFAULT_PERSONA);
    }

    #[test]
    fn persona_keys_are_normalized() {
        let mut settings = AppSettings {
            personas: BTreeMap::from([
                ("Best Friend".to_string(), "Be upbeat.".to_string()),
                ("empty".to_string(), "  ".to_string()),
            ]),
            persona: "best-friend".into(),
            ..AppSettings::default()
        };
        settings.normalize();
        assert_eq!(settings.persona, "best_friend");
        assert_eq!(settings.personas.len(), 1);
        let persona = settings.persona_for(None).unwrap();
        assert_eq!(persona.system_prompt, "Be upbeat.");
        assert!(settings.persona_for(Some("nobody")).is_err());
    }

    #[test]
    fn partial_json_fills_in_defaults() {
        let raw = r#"{ "hangupTimeoutMs": 30000, "services": { "backend": "http" } }"#;
        let mut settings: AppSettings = serde_json::from_str(raw).unwrap();
        settings.normalize();
        assert_eq!(settings.hangup_timeout_ms, 30_000);
        assert_eq!(settings.services.backend, ServiceBackend::Http);
        assert_eq!(settings.services.inference.model, "llama3.2");
        assert_eq!(settings.voice, DEFAULT_VOICE);
    }

    #[test]
    fn env_overrides_take_precedence() {
        let mut settings = AppSettings::default();
        settings.apply_overrides_from(|key| match key {
            "VOXTURN_VOICE" => Some("en-GB-SoniaNeural".into()),
            "VOXTURN_SERVICES" => Some("HTTP".into()),
            "VOXTURN_HANGUP_TIMEOUT_MS" => Some("60000".into()),
            "VOXTURN_OPENAI_API_KEY" => Some("sk-test".into()),
            _ => None,
        });
        assert_eq!(settings.voice, "en-GB-SoniaNeural");
        assert_eq!(settings.services.backend, ServiceBackend::Http);
        assert_eq!(settings.hangup_timeout_ms, 60_000);
        assert_eq!(settings.services.synthesis.api_key.as_deref(), Some("sk-test"));
        assert_eq!(settings.services.inference.api_key, None);
    }

    #[test]
    fn engine_config_reflects_settings() {
        let settings = AppSettings::default();
        let config = settings.engine_config();
        assert_eq!(config.silence_timeout, Duration::from_millis(800));
        assert_eq!(config.still_there_window, Some(Duration::from_secs(15)));
        assert_eq!(config.trailing_pad_frames, 2);

        let assembler = config.assembler_config();
        assert_eq!(assembler.hangup_frames, 4_000);
        assert_eq!(assembler.confirm_frames, Some(500));

        let disabled = AppSettings {
            still_there_enabled: false,
            ..AppSettings::default()
        };
        assert_eq!(disabled.engine_config().still_there_window, None);
    }

    #[test]
    fn save_then_load_keeps_values() {
        let path = std::env::temp_dir()
            .join(format!("voxturn-settings-{}", uuid::Uuid::new_v4()))
            .join("settings.json");
        let settings = AppSettings {
            voice: "en-AU-NatashaNeural".into(),
            history_window: 3,
            ..AppSettings::default()
        };
        save_settings(&path, &settings).unwrap();
        let loaded = load_settings(&path);
        assert_eq!(loaded.voice, "en-AU-NatashaNeural");
        assert_eq!(loaded.history_window, 3);
        let _ = fs::remove_dir_all(path.parent().unwrap());
    }

    #[test]
    fn missing_file_loads_defaults() {
        let loaded = load_settings(Path::new("/nonexistent/voxturn/settings.json"));
        assert_eq!(loaded.persona, DEFAULT_PERSONA);
    }
}
