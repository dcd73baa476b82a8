//! HTTP service adapters.
//!
//! - [`OllamaInference`]: `POST {base}/api/chat`, non-streaming.
//! - [`OpenAiTranscriber`]: `POST {base}/v1/audio/transcriptions`, multipart WAV.
//! - [`OpenAiSynthesizer`]: `POST {base}/v1/audio/speech`, WAV response.
//!
//! Timeouts are owned by the pipeline; the client timeout here is only a
//! backstop for connections the pipeline has already given up on.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{multipart, Client, RequestBuilder, Response};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{HistoryEntry, InferenceService, SynthesisService, Transcript, TranscriptionService};
use crate::buffering::frame::AudioClip;
use crate::error::ServiceError;
use crate::session::{Persona, VoiceId};

/// Endpoint settings shared by every adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct HttpServiceConfig {
    pub base_url: String,
    pub model: String,
    pub api_key: Option<String>,
    #[serde(with = "millis")]
    pub request_timeout: Duration,
}

impl Default for HttpServiceConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:11434".into(),
            model: "llama3".into(),
            api_key: None,
            request_timeout: Duration::from_secs(60),
        }
    }
}

impl HttpServiceConfig {
    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }

    fn client(&self) -> Result<Client, ServiceError> {
        Client::builder()
            .timeout(self.request_timeout)
            .build()
            .map_err(|e| ServiceError::Unavailable(format!("http client init: {e}")))
    }

    fn authorize(&self, req: RequestBuilder) -> RequestBuilder {
        match self.api_key.as_deref() {
            Some(key) if !key.is_empty() => req.bearer_auth(key),
            _ => req,
        }
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

async fn send(req: RequestBuilder) -> Result<Response, ServiceError> {
    let resp = req
        .send()
        .await
        .map_err(|e| ServiceError::Unavailable(e.to_string()))?;
    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        warn!(%status, "service returned error status");
        return Err(ServiceError::Rejected(format!("{status}: {body}")));
    }
    Ok(resp)
}

// ---------------------------------------------------------------------------
// Inference
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
struct OllamaMessage {
    role: String,
    content: String,
}

#[derive(Debug, Serialize)]
struct OllamaChatRequest {
    model: String,
    messages: Vec<OllamaMessage>,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct OllamaChatResponse {
    message: Option<OllamaMessage>,
}

/// Chat completion against an Ollama server.
pub struct OllamaInference {
    config: HttpServiceConfig,
    client: Client,
}

impl OllamaInference {
    pub fn new(config: HttpServiceConfig) -> Result<Self, ServiceError> {
        let client = config.client()?;
        Ok(Self { config, client })
    }

    fn build_messages(prompt: &str, persona: &Persona, history: &[HistoryEntry]) -> Vec<OllamaMessage> {
        let mut messages = Vec::with_capacity(history.len() * 2 + 2);
        messages.push(OllamaMessage {
            role: "system".into(),
            content: persona.system_prompt.clone(),
        });
        for entry in history {
            messages.push(OllamaMessage {
                role: "user".into(),
                content: entry.user.clone(),
            });
            messages.push(OllamaMessage {
                role: "assistant".into(),
                content: entry.assistant.clone(),
            });
        }
        messages.push(OllamaMessage {
            role: "user".into(),
            content: prompt.to_string(),
        });
        messages
    }
}

#[async_trait]
impl InferenceService for OllamaInference {
    async fn infer(
        &self,
        prompt: &str,
        persona: &Persona,
        history: &[HistoryEntry],
    ) -> Result<String, ServiceError> {
        let body = OllamaChatRequest {
            model: self.config.model.clone(),
            messages: Self::build_messages(prompt, persona, history),
            stream: false,
        };
        let req = self
            .config
            .authorize(self.client.post(self.config.endpoint("/api/chat")))
            .json(&body);
        let resp: OllamaChatResponse = send(req)
            .await?
            .json()
            .await
            .map_err(|e| ServiceError::Malformed(e.to_string()))?;

        let reply = resp
            .message
            .map(|m| m.content.trim().to_string())
            .unwrap_or_default();
        if reply.is_empty() {
            return Err(ServiceError::Empty);
        }
        debug!(chars = reply.len(), "ollama reply received");
        Ok(reply)
    }
}

// ---------------------------------------------------------------------------
// Transcription
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct TranscriptionResponse {
    text: String,
}

/// OpenAI-compatible speech-to-text (Whisper servers, faster-whisper, ...).
pub struct OpenAiTranscriber {
    config: HttpServiceConfig,
    client: Client,
    min_confidence: Option<f32>,
}

impl OpenAiTranscriber {
    pub fn new(config: HttpServiceConfig) -> Result<Self, ServiceError> {
        let client = config.client()?;
        Ok(Self {
            config,
            client,
            min_confidence: None,
        })
    }

    pub fn with_min_confidence(mut self, threshold: f32) -> Self {
        self.min_confidence = Some(threshold);
        self
    }
}

#[async_trait]
impl TranscriptionService for OpenAiTranscriber {
    async fn transcribe(&self, audio: &AudioClip) -> Result<Transcript, ServiceError> {
        let wav = audio
            .to_wav_bytes()
            .map_err(|e| ServiceError::Rejected(format!("wav encode: {e}")))?;
        let part = multipart::Part::bytes(wav)
            .file_name("utterance.wav")
            .mime_str("audio/wav")
            .map_err(|e| ServiceError::Rejected(e.to_string()))?;
        let form = multipart::Form::new()
            .part("file", part)
            .text("model", self.config.model.clone())
            .text("response_format", "json");

        let req = self
            .config
            .authorize(
                self.client
                    .post(self.config.endpoint("/v1/audio/transcriptions")),
            )
            .multipart(form);
        let resp: TranscriptionResponse = send(req)
            .await?
            .json()
            .await
            .map_err(|e| ServiceError::Malformed(e.to_string()))?;

        Ok(Transcript::new(resp.text.trim(), None))
    }

    fn min_confidence(&self) -> Option<f32> {
        self.min_confidence
    }
}

// ---------------------------------------------------------------------------
// Synthesis
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct SpeechRequest<'a> {
    model: &'a str,
    input: &'a str,
    voice: &'a str,
    response_format: &'a str,
}

/// OpenAI-compatible text-to-speech returning WAV.
pub struct OpenAiSynthesizer {
    config: HttpServiceConfig,
    client: Client,
}

impl OpenAiSynthesizer {
    pub fn new(config: HttpServiceConfig) -> Result<Self, ServiceError> {
        let client = config.client()?;
        Ok(Self { config, client })
    }
}

#[async_trait]
impl SynthesisService for OpenAiSynthesizer {
    async fn synthesize(&self, text: &str, voice: &VoiceId) -> Result<AudioClip, ServiceError> {
        let body = SpeechRequest {
            model: &self.config.model,
            input: text,
            voice: voice.as_str(),
            response_format: "wav",
        };
        let req = self
            .config
            .authorize(self.client.post(self.config.endpoint("/v1/audio/speech")))
            .json(&body);
        let bytes = send(req)
            .await?
            .bytes()
            .await
            .map_err(|e| ServiceError::Unavailable(e.to_string()))?;

        let clip = AudioClip::from_wav_bytes(&bytes)
            .map_err(|e| ServiceError::Malformed(format!("wav decode: {e}")))?;
        if clip.is_empty() {
            return Err(ServiceError::Empty);
        }
        Ok(clip)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_joins_without_double_slash() {
        let config = HttpServiceConfig {
            base_url: "http://localhost:8000/".into(),
            ..HttpServiceConfig::default()
        };
        assert_eq!(
            config.endpoint("/v1/audio/speech"),
            "http://localhost:8000/v1/audio/speech"
        );
    }

    #[test]
    fn chat_messages_wrap_history_between_system_and_prompt() {
        let persona = Persona::new("helpful", "You are Lily.");
        let history = vec![HistoryEntry {
            user: "hi".into(),
            assistant: "hello".into(),
        }];
        let messages = OllamaInference::build_messages("how are you", &persona, &history);
        let roles: Vec<&str> = messages.iter().map(|m| m.role.as_str()).collect();
        assert_eq!(roles, ["system", "user", "assistant", "user"]);
        assert_eq!(messages[0].content, "You are Lily.");
        assert_eq!(messages[3].content, "how are you");
    }

    #[test]
    fn config_timeout_is_millis_in_json() {
        let json = serde_json::json!({ "model": "whisper-1", "requestTimeout": 1500 });
        let config: HttpServiceConfig = serde_json::from_value(json).unwrap();
        assert_eq!(config.request_timeout, Duration::from_millis(1500));
        assert_eq!(config.base_url, "http://localhost:11434");
    }
}
