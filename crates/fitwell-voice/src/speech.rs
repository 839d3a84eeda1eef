//! **Speech Synthesis Chain** — render text to audible speech through an ordered
//! list of providers with silent fallthrough.
//!
//! Providers are declarative descriptors (`applicable` predicate + `synthesize`)
//! iterated uniformly: the first applicable provider that synthesizes *and* plays
//! wins; every network, decode or playback error is logged and treated as
//! "provider declined". The final local provider always succeeds, so `speak`
//! never errors — the session's auto-resume loop depends on that contract.
//! Only one audio stream plays at a time; starting playback stops the current one.

use crate::config::AssistantConfig;
use crate::error::{VoiceError, VoiceResult};
use async_trait::async_trait;
use base64::Engine;
use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

const ELEVEN_API_BASE: &str = "https://api.elevenlabs.io/v1/text-to-speech";

/// Which provider a request explicitly asks for, if any.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    Premium,
    Neural,
    Generic,
    Local,
}

/// One synthesis request.
#[derive(Debug, Clone, Default)]
pub struct SpeakRequest {
    pub text: String,
    pub lang: Option<String>,
    pub voice: Option<String>,
    /// Explicit provider selection; `None` lets configuration decide.
    pub provider: Option<ProviderKind>,
}

impl SpeakRequest {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }

    pub fn with_lang(mut self, lang: impl Into<String>) -> Self {
        self.lang = Some(lang.into());
        self
    }

    pub fn with_provider(mut self, provider: ProviderKind) -> Self {
        self.provider = Some(provider);
        self
    }
}

/// One entry in the provider chain.
#[async_trait]
pub trait SynthProvider: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether this provider should be attempted for the request.
    fn applicable(&self, req: &SpeakRequest) -> bool;

    /// Synthesize audio bytes (WAV/MP3). Empty bytes mean "nothing to play"
    /// and still count as success.
    async fn synthesize(&self, req: &SpeakRequest) -> VoiceResult<Vec<u8>>;
}

/// Premium voice provider (ElevenLabs wire shape): raw text in, binary audio out.
/// Applicable when explicitly requested or when key and voice id are both configured.
pub struct PremiumVoice {
    api_key: Option<String>,
    voice_id: Option<String>,
    client: reqwest::Client,
}

impl PremiumVoice {
    pub fn new(api_key: Option<String>, voice_id: Option<String>) -> Self {
        Self {
            api_key,
            voice_id,
            client: http_client(),
        }
    }

    fn configured(&self) -> bool {
        self.api_key.is_some() && self.voice_id.is_some()
    }
}

#[async_trait]
impl SynthProvider for PremiumVoice {
    fn name(&self) -> &'static str {
        "premium"
    }

    fn applicable(&self, req: &SpeakRequest) -> bool {
        req.provider == Some(ProviderKind::Premium) || self.configured()
    }

    async fn synthesize(&self, req: &SpeakRequest) -> VoiceResult<Vec<u8>> {
        let key = self
            .api_key
            .as_deref()
            .ok_or_else(|| VoiceError::Synthesis("premium voice has no API key".to_string()))?;
        let voice = req
            .voice
            .as_deref()
            .or(self.voice_id.as_deref())
            .ok_or_else(|| VoiceError::Synthesis("premium voice has no voice id".to_string()))?;

        let url = format!("{}/{}", ELEVEN_API_BASE, voice);
        let res = self
            .client
            .post(&url)
            .header("xi-api-key", key)
            .json(&serde_json::json!({"text": req.text}))
            .send()
            .await
            .map_err(|e| VoiceError::Synthesis(e.to_string()))?;

        if !res.status().is_success() {
            return Err(VoiceError::Synthesis(format!(
                "premium voice returned {}",
                res.status()
            )));
        }
        let content_type = response_content_type(&res);
        if !content_type.starts_with("audio/") {
            return Err(VoiceError::Synthesis(format!(
                "premium voice returned unexpected content-type {}",
                content_type
            )));
        }
        let bytes = res
            .bytes()
            .await
            .map_err(|e| VoiceError::Synthesis(e.to_string()))?;
        Ok(bytes.to_vec())
    }
}

/// HTTP TTS provider covering the self-hosted neural and generic endpoints.
/// Request: `{text, voice?, lang?, format?}`. Response: binary `audio/*`, or JSON
/// with inline base64 `audio`, or a downloadable `url`.
pub struct HttpTtsProvider {
    kind: ProviderKind,
    name: &'static str,
    url: Option<String>,
    api_key: Option<String>,
    /// Neural endpoints accept an explicit audio format selection.
    send_format: bool,
    client: reqwest::Client,
}

impl HttpTtsProvider {
    /// Self-hosted neural provider (Coqui-compatible).
    pub fn neural(url: Option<String>, api_key: Option<String>) -> Self {
        Self {
            kind: ProviderKind::Neural,
            name: "neural",
            url,
            api_key,
            send_format: true,
            client: http_client(),
        }
    }

    /// Generic HTTP provider.
    pub fn generic(url: Option<String>, api_key: Option<String>) -> Self {
        Self {
            kind: ProviderKind::Generic,
            name: "generic",
            url,
            api_key,
            send_format: false,
            client: http_client(),
        }
    }
}

#[async_trait]
impl SynthProvider for HttpTtsProvider {
    fn name(&self) -> &'static str {
        self.name
    }

    fn applicable(&self, req: &SpeakRequest) -> bool {
        req.provider == Some(self.kind) || self.url.is_some()
    }

    async fn synthesize(&self, req: &SpeakRequest) -> VoiceResult<Vec<u8>> {
        let url = self
            .url
            .as_deref()
            .ok_or_else(|| VoiceError::Synthesis(format!("{} TTS has no endpoint", self.name)))?;

        let mut payload = serde_json::json!({"text": req.text});
        if let Some(ref voice) = req.voice {
            payload["voice"] = serde_json::json!(voice);
        }
        if let Some(ref lang) = req.lang {
            payload["lang"] = serde_json::json!(lang);
        }
        if self.send_format {
            payload["format"] = serde_json::json!("wav");
        }

        let mut request = self.client.post(url).json(&payload);
        if let Some(ref key) = self.api_key {
            request = request.bearer_auth(key);
        }
        let res = request
            .send()
            .await
            .map_err(|e| VoiceError::Synthesis(e.to_string()))?;
        if !res.status().is_success() {
            return Err(VoiceError::Synthesis(format!(
                "{} TTS returned {}",
                self.name,
                res.status()
            )));
        }

        let content_type = response_content_type(&res);
        if content_type.starts_with("audio/") {
            let bytes = res
                .bytes()
                .await
                .map_err(|e| VoiceError::Synthesis(e.to_string()))?;
            return Ok(bytes.to_vec());
        }

        if content_type.contains("application/json") {
            let json: serde_json::Value = res
                .json()
                .await
                .map_err(|e| VoiceError::Synthesis(e.to_string()))?;
            if let Some(audio) = json.get("audio").and_then(|a| a.as_str()) {
                return base64::engine::general_purpose::STANDARD
                    .decode(audio)
                    .map_err(|e| VoiceError::Synthesis(format!("bad base64 audio: {}", e)));
            }
            if let Some(audio_url) = json.get("url").and_then(|u| u.as_str()) {
                let downloaded = self
                    .client
                    .get(audio_url)
                    .send()
                    .await
                    .map_err(|e| VoiceError::Synthesis(e.to_string()))?;
                let bytes = downloaded
                    .bytes()
                    .await
                    .map_err(|e| VoiceError::Synthesis(e.to_string()))?;
                return Ok(bytes.to_vec());
            }
            return Err(VoiceError::Synthesis(format!(
                "{} TTS JSON response missing audio/url",
                self.name
            )));
        }

        Err(VoiceError::Synthesis(format!(
            "{} TTS returned unexpected content-type {}",
            self.name, content_type
        )))
    }
}

/// Last-resort provider: always applicable, always succeeds. Logs the text and
/// returns empty audio so the pipeline settles even with no network and no voices.
pub struct LocalSpeech;

#[async_trait]
impl SynthProvider for LocalSpeech {
    fn name(&self) -> &'static str {
        "local"
    }

    fn applicable(&self, _req: &SpeakRequest) -> bool {
        true
    }

    async fn synthesize(&self, req: &SpeakRequest) -> VoiceResult<Vec<u8>> {
        info!(target: "fitwell::speech", "local fallback speaking: {}", req.text);
        Ok(Vec::new())
    }
}

fn http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(60))
        .build()
        .unwrap_or_else(|_| reqwest::Client::new())
}

fn response_content_type(res: &reqwest::Response) -> String {
    res.headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_ascii_lowercase()
}

/// Playback target for synthesized audio. `play` resolves when the sound has
/// finished (or been stopped); `stop` is idempotent and safe with nothing playing.
#[async_trait]
pub trait AudioSink: Send + Sync {
    async fn play(&self, bytes: Vec<u8>) -> VoiceResult<()>;
    fn stop(&self);
    fn is_playing(&self) -> bool;
}

struct PlayCmd {
    bytes: Vec<u8>,
    ack: oneshot::Sender<VoiceResult<()>>,
}

/// Rodio-backed sink. The output stream is !Send, so it lives on a dedicated
/// thread; commands arrive over a channel and completion is acked per play.
pub struct RodioSink {
    cmd_tx: mpsc::UnboundedSender<PlayCmd>,
    sink: Arc<rodio::Sink>,
}

impl RodioSink {
    pub fn new() -> VoiceResult<Self> {
        let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel::<PlayCmd>();
        let (ready_tx, ready_rx) = std::sync::mpsc::channel::<Result<Arc<rodio::Sink>, String>>();

        thread::spawn(move || {
            let (stream, handle) = match rodio::OutputStream::try_default() {
                Ok(pair) => pair,
                Err(e) => {
                    let _ = ready_tx.send(Err(e.to_string()));
                    return;
                }
            };
            let sink = match rodio::Sink::try_new(&handle) {
                Ok(s) => Arc::new(s),
                Err(e) => {
                    let _ = ready_tx.send(Err(e.to_string()));
                    return;
                }
            };
            if ready_tx.send(Ok(Arc::clone(&sink))).is_err() {
                return;
            }
            // Keep the stream alive for as long as commands can arrive.
            let _stream = stream;
            while let Some(cmd) = cmd_rx.blocking_recv() {
                // One stream at a time: clear anything still queued.
                sink.stop();
                let source = match rodio::Decoder::new(Cursor::new(cmd.bytes)) {
                    Ok(s) => s,
                    Err(e) => {
                        let _ = cmd
                            .ack
                            .send(Err(VoiceError::Playback(format!("decode failed: {}", e))));
                        continue;
                    }
                };
                sink.append(source);
                sink.sleep_until_end();
                let _ = cmd.ack.send(Ok(()));
            }
        });

        let sink = ready_rx
            .recv_timeout(Duration::from_secs(5))
            .map_err(|e| VoiceError::Playback(e.to_string()))?
            .map_err(VoiceError::Playback)?;
        Ok(Self { cmd_tx, sink })
    }
}

#[async_trait]
impl AudioSink for RodioSink {
    async fn play(&self, bytes: Vec<u8>) -> VoiceResult<()> {
        if bytes.is_empty() {
            return Ok(());
        }
        let (ack_tx, ack_rx) = oneshot::channel();
        self.cmd_tx
            .send(PlayCmd {
                bytes,
                ack: ack_tx,
            })
            .map_err(|_| VoiceError::Playback("playback thread gone".to_string()))?;
        ack_rx
            .await
            .map_err(|_| VoiceError::Playback("playback thread gone".to_string()))?
    }

    fn stop(&self) {
        self.sink.stop();
    }

    fn is_playing(&self) -> bool {
        !self.sink.empty()
    }
}

/// Silent sink for tests and headless runs. Records every played buffer.
#[derive(Default)]
pub struct NullSink {
    plays: Mutex<Vec<Vec<u8>>>,
    stops: AtomicUsize,
}

impl NullSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn play_count(&self) -> usize {
        self.plays.lock().map(|p| p.len()).unwrap_or(0)
    }

    pub fn stop_count(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AudioSink for NullSink {
    async fn play(&self, bytes: Vec<u8>) -> VoiceResult<()> {
        if let Ok(mut plays) = self.plays.lock() {
            plays.push(bytes);
        }
        Ok(())
    }

    fn stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
    }

    fn is_playing(&self) -> bool {
        false
    }
}

/// The ordered provider chain plus its playback sink.
pub struct SpeechChain {
    providers: Vec<Box<dyn SynthProvider>>,
    sink: Arc<dyn AudioSink>,
}

impl SpeechChain {
    pub fn new(providers: Vec<Box<dyn SynthProvider>>, sink: Arc<dyn AudioSink>) -> Self {
        Self { providers, sink }
    }

    /// Standard chain: premium, neural, generic, local, in that order.
    pub fn from_config(config: &AssistantConfig, sink: Arc<dyn AudioSink>) -> Self {
        let providers: Vec<Box<dyn SynthProvider>> = vec![
            Box::new(PremiumVoice::new(
                config.premium_api_key.clone(),
                config.premium_voice_id.clone(),
            )),
            Box::new(HttpTtsProvider::neural(
                config.neural_tts_url.clone(),
                config.neural_tts_api_key.clone(),
            )),
            Box::new(HttpTtsProvider::generic(
                config.generic_tts_url.clone(),
                config.generic_tts_api_key.clone(),
            )),
            Box::new(LocalSpeech),
        ];
        Self::new(providers, sink)
    }

    /// Speak the request through the chain. Never errors; returns the name of the
    /// provider that completed, or `None` if even the local fallback was skipped
    /// (empty text).
    pub async fn speak(&self, req: &SpeakRequest) -> Option<&'static str> {
        if req.text.trim().is_empty() {
            return None;
        }
        for provider in &self.providers {
            if !provider.applicable(req) {
                continue;
            }
            match provider.synthesize(req).await {
                Ok(bytes) => {
                    if bytes.is_empty() {
                        return Some(provider.name());
                    }
                    match self.sink.play(bytes).await {
                        Ok(()) => return Some(provider.name()),
                        Err(e) => {
                            warn!("{} playback failed, falling through: {}", provider.name(), e);
                        }
                    }
                }
                Err(e) => {
                    warn!("{} synthesis declined: {}", provider.name(), e);
                }
            }
        }
        None
    }

    /// Stop any current playback. Idempotent.
    pub fn stop(&self) {
        self.sink.stop();
    }

    pub fn is_playing(&self) -> bool {
        self.sink.is_playing()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FailingProvider {
        name: &'static str,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl SynthProvider for FailingProvider {
        fn name(&self) -> &'static str {
            self.name
        }

        fn applicable(&self, _req: &SpeakRequest) -> bool {
            true
        }

        async fn synthesize(&self, _req: &SpeakRequest) -> VoiceResult<Vec<u8>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(VoiceError::Synthesis("simulated failure".to_string()))
        }
    }

    #[tokio::test]
    async fn chain_falls_through_to_local_and_resolves() {
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));
        let chain = SpeechChain::new(
            vec![
                Box::new(FailingProvider {
                    name: "premium",
                    calls: Arc::clone(&first),
                }),
                Box::new(FailingProvider {
                    name: "neural",
                    calls: Arc::clone(&second),
                }),
                Box::new(LocalSpeech),
            ],
            Arc::new(NullSink::new()),
        );

        let used = chain.speak(&SpeakRequest::new("hello")).await;
        assert_eq!(used, Some("local"));
        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn inapplicable_providers_are_skipped() {
        // Unconfigured premium/neural/generic providers decline without being called.
        let config = AssistantConfig::default();
        let chain = SpeechChain::from_config(&config, Arc::new(NullSink::new()));
        let used = chain.speak(&SpeakRequest::new("hi there")).await;
        assert_eq!(used, Some("local"));
    }

    #[tokio::test]
    async fn explicit_request_makes_provider_applicable() {
        let premium = PremiumVoice::new(None, None);
        let req = SpeakRequest::new("x").with_provider(ProviderKind::Premium);
        assert!(premium.applicable(&req));
        assert!(!premium.applicable(&SpeakRequest::new("x")));

        let neural = HttpTtsProvider::neural(None, None);
        assert!(neural.applicable(&SpeakRequest::new("x").with_provider(ProviderKind::Neural)));
        assert!(!neural.applicable(&SpeakRequest::new("x")));
    }

    #[tokio::test]
    async fn empty_text_is_a_noop() {
        let chain = SpeechChain::new(vec![Box::new(LocalSpeech)], Arc::new(NullSink::new()));
        assert_eq!(chain.speak(&SpeakRequest::new("   ")).await, None);
    }

    #[test]
    fn null_sink_stop_is_idempotent() {
        let sink = NullSink::new();
        sink.stop();
        sink.stop();
        assert_eq!(sink.stop_count(), 2);
        assert!(!sink.is_playing());
    }
}
