//! **Transcription Service** — convert a finalized capture into best-effort text.
//!
//! The contract is "never raise": a missing endpoint, a non-2xx status or a
//! transport error all degrade to a fixed placeholder string so the turn can
//! continue into the dialogue pipeline.

use crate::capture::CapturedAudio;
use crate::config::AssistantConfig;
use crate::error::{VoiceError, VoiceResult};
use async_trait::async_trait;
use std::time::Duration;
use tracing::warn;

/// Placeholder returned when no transcription endpoint is configured.
pub const TRANSCRIPTION_UNAVAILABLE: &str = "(transcription unavailable - ASR not configured)";
/// Returned on a non-2xx response from the transcription endpoint.
pub const TRANSCRIPTION_FAILED: &str = "(transcription failed)";
/// Returned on a transport or decode error.
pub const TRANSCRIPTION_ERROR: &str = "(transcription error)";

/// Backend for converting captured audio to text. Never raises.
#[async_trait]
pub trait TranscribeBackend: Send + Sync {
    async fn transcribe(&self, audio: &CapturedAudio) -> String;
}

/// Placeholder transcription: returns a fixed or scripted string.
/// Use when no endpoint is configured, or to drive tests without audio.
#[derive(Debug, Default)]
pub struct PlaceholderTranscriber {
    /// If set, return this instead of the unavailable message.
    pub response: Option<String>,
}

impl PlaceholderTranscriber {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_response(s: impl Into<String>) -> Self {
        Self {
            response: Some(s.into()),
        }
    }
}

#[async_trait]
impl TranscribeBackend for PlaceholderTranscriber {
    async fn transcribe(&self, _audio: &CapturedAudio) -> String {
        match &self.response {
            Some(r) => r.clone(),
            None => TRANSCRIPTION_UNAVAILABLE.to_string(),
        }
    }
}

/// Production transcription: multipart upload of the WAV take to a configured endpoint.
/// Accepts `{"transcript": ...}` or `{"text": ...}` in the response.
pub struct HttpTranscriber {
    url: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl HttpTranscriber {
    pub fn new(url: impl Into<String>, api_key: Option<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            url: url.into(),
            api_key,
            client,
        }
    }

    async fn upload(&self, audio: &CapturedAudio) -> VoiceResult<String> {
        let part = reqwest::multipart::Part::bytes(audio.wav.clone())
            .file_name(audio.file_name.clone())
            .mime_str("audio/wav")
            .map_err(|e| VoiceError::Transcription(e.to_string()))?;
        let form = reqwest::multipart::Form::new().part("file", part);

        let mut req = self.client.post(&self.url).multipart(form);
        if let Some(ref key) = self.api_key {
            req = req.bearer_auth(key);
        }
        let res = req
            .send()
            .await
            .map_err(|e| VoiceError::Transcription(e.to_string()))?;

        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            warn!("transcription endpoint returned {}: {}", status, body);
            return Ok(TRANSCRIPTION_FAILED.to_string());
        }

        let json: serde_json::Value = res
            .json()
            .await
            .map_err(|e| VoiceError::Transcription(e.to_string()))?;
        let text = json
            .get("transcript")
            .or_else(|| json.get("text"))
            .and_then(|t| t.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| json.to_string());
        Ok(text)
    }
}

#[async_trait]
impl TranscribeBackend for HttpTranscriber {
    async fn transcribe(&self, audio: &CapturedAudio) -> String {
        match self.upload(audio).await {
            Ok(text) => text,
            Err(e) => {
                warn!("transcription failed: {}", e);
                TRANSCRIPTION_ERROR.to_string()
            }
        }
    }
}

/// Pick the transcription backend for the given config: HTTP when an endpoint is
/// configured, otherwise the fixed placeholder.
pub fn transcriber_from_config(config: &AssistantConfig) -> Box<dyn TranscribeBackend> {
    match config.asr_url.as_deref() {
        Some(url) => Box::new(HttpTranscriber::new(url, config.asr_api_key.clone())),
        None => Box::new(PlaceholderTranscriber::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn placeholder_returns_fixed_text() {
        let t = PlaceholderTranscriber::new();
        let audio = CapturedAudio::silence(100);
        assert_eq!(t.transcribe(&audio).await, TRANSCRIPTION_UNAVAILABLE);
    }

    #[tokio::test]
    async fn placeholder_with_scripted_response() {
        let t = PlaceholderTranscriber::with_response("I have a fever");
        let audio = CapturedAudio::silence(100);
        assert_eq!(t.transcribe(&audio).await, "I have a fever");
    }

    #[test]
    fn unconfigured_asr_selects_placeholder() {
        let config = AssistantConfig::default();
        let backend = transcriber_from_config(&config);
        // A placeholder backend always yields the fixed string.
        let audio = CapturedAudio::silence(50);
        let text = tokio_test::block_on(backend.transcribe(&audio));
        assert_eq!(text, TRANSCRIPTION_UNAVAILABLE);
    }
}
