//! Assistant configuration loaded once at session start.
//!
//! Endpoints and keys for transcription, dialogue, the TTS provider chain and the
//! service action backend. Absence of any URL activates that component's offline
//! or mock fallback instead of failing. Components never read ambient globals;
//! the session passes this value in at construction.

use std::time::Duration;

/// Safety cutoff for a single capture. The session force-stops recording when the
/// same capture is still active after this long.
pub const DEFAULT_CAPTURE_TIMEOUT: Duration = Duration::from_secs(12);

/// Configuration for one assistant session.
///
/// | Env | Default | Description |
/// |-----|---------|-------------|
/// | FITWELL_ASR_URL / FITWELL_ASR_API_KEY | unset | Transcription endpoint; unset => placeholder text |
/// | FITWELL_LLM_URL / FITWELL_LLM_API_KEY | a0 LLM | Dialogue endpoint |
/// | FITWELL_ELEVEN_API_KEY / FITWELL_ELEVEN_VOICE_ID | unset | Premium voice provider |
/// | FITWELL_COQUI_TTS_URL / FITWELL_COQUI_API_KEY | unset | Self-hosted neural TTS |
/// | FITWELL_TTS_URL / FITWELL_TTS_API_KEY | unset | Generic HTTP TTS |
/// | FITWELL_API_BASE / FITWELL_API_KEY | unset | Action backend; unset => deterministic mock |
/// | FITWELL_LANGUAGE | en | Default language code |
/// | FITWELL_AUTO_LISTEN | true | Reopen the mic after the assistant finishes speaking |
/// | FITWELL_CAPTURE_TIMEOUT_SECS | 12 | Capture safety timeout |
#[derive(Debug, Clone)]
pub struct AssistantConfig {
    pub asr_url: Option<String>,
    pub asr_api_key: Option<String>,
    pub dialogue_url: String,
    pub dialogue_api_key: Option<String>,
    pub premium_api_key: Option<String>,
    pub premium_voice_id: Option<String>,
    pub neural_tts_url: Option<String>,
    pub neural_tts_api_key: Option<String>,
    pub generic_tts_url: Option<String>,
    pub generic_tts_api_key: Option<String>,
    pub actions_base_url: Option<String>,
    pub actions_api_key: Option<String>,
    pub language: String,
    pub auto_listen: bool,
    pub capture_timeout: Duration,
    /// Languages for which the premium voice is requested explicitly when configured
    /// (under-served / right-to-left locales by default).
    pub premium_languages: Vec<String>,
}

const DEFAULT_DIALOGUE_URL: &str = "https://api.a0.dev/ai/llm";

impl Default for AssistantConfig {
    fn default() -> Self {
        Self {
            asr_url: None,
            asr_api_key: None,
            dialogue_url: DEFAULT_DIALOGUE_URL.to_string(),
            dialogue_api_key: None,
            premium_api_key: None,
            premium_voice_id: None,
            neural_tts_url: None,
            neural_tts_api_key: None,
            generic_tts_url: None,
            generic_tts_api_key: None,
            actions_base_url: None,
            actions_api_key: None,
            language: "en".to_string(),
            auto_listen: true,
            capture_timeout: DEFAULT_CAPTURE_TIMEOUT,
            premium_languages: vec!["ur".to_string()],
        }
    }
}

impl AssistantConfig {
    /// Load from environment. Unset or invalid values fall back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            asr_url: env_opt_string("FITWELL_ASR_URL"),
            asr_api_key: env_opt_string("FITWELL_ASR_API_KEY"),
            dialogue_url: env_opt_string("FITWELL_LLM_URL")
                .unwrap_or_else(|| DEFAULT_DIALOGUE_URL.to_string()),
            dialogue_api_key: env_opt_string("FITWELL_LLM_API_KEY"),
            premium_api_key: env_opt_string("FITWELL_ELEVEN_API_KEY"),
            premium_voice_id: env_opt_string("FITWELL_ELEVEN_VOICE_ID"),
            neural_tts_url: env_opt_string("FITWELL_COQUI_TTS_URL"),
            neural_tts_api_key: env_opt_string("FITWELL_COQUI_API_KEY"),
            generic_tts_url: env_opt_string("FITWELL_TTS_URL"),
            generic_tts_api_key: env_opt_string("FITWELL_TTS_API_KEY"),
            actions_base_url: env_opt_string("FITWELL_API_BASE"),
            actions_api_key: env_opt_string("FITWELL_API_KEY"),
            language: env_opt_string("FITWELL_LANGUAGE").unwrap_or(defaults.language),
            auto_listen: env_bool("FITWELL_AUTO_LISTEN", true),
            capture_timeout: env_opt_string("FITWELL_CAPTURE_TIMEOUT_SECS")
                .and_then(|s| s.parse::<u64>().ok())
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_CAPTURE_TIMEOUT),
            premium_languages: defaults.premium_languages,
        }
    }

    /// True when the premium voice provider has both a key and a voice id.
    pub fn premium_configured(&self) -> bool {
        self.premium_api_key.is_some() && self.premium_voice_id.is_some()
    }

    /// True when the premium voice should be requested explicitly for `lang`.
    pub fn prefers_premium_for(&self, lang: &str) -> bool {
        self.premium_configured() && self.premium_languages.iter().any(|l| l == lang)
    }
}

fn env_opt_string(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn env_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(v) => matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes"),
        Err(_) => default,
    }
}
