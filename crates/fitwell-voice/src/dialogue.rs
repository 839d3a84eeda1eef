//! **Dialogue Client** — send the running conversation to the dialogue model and
//! parse a structured `DialogueResult`.
//!
//! The endpoint receives `{messages, schema}` where `schema` declares the result
//! shape. The response carries either `schema_data` (preferred) or a raw
//! `completion` string that is parsed as JSON with a plain-text chat fallback.
//! All failures (non-2xx, transport, malformed body) surface as
//! `VoiceError::Dialogue` so the session applies one uniform apology path.

use crate::error::{VoiceError, VoiceResult};
use crate::types::{DialogueResult, Turn};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, warn};

const SYSTEM_PROMPT: &str = "You are Fitwell Assistant, a friendly and safe healthcare voice assistant for patients.\n\
- Always prioritize referring the user to a General Practitioner (GP) for initial evaluation. Only recommend a specialist or emergency services when the symptoms clearly and unambiguously indicate one.\n\
- When giving guidance, be empathetic, concise, and include a brief safety disclaimer. Do NOT provide definitive diagnoses.\n\
- Do NOT include raw JSON, code blocks, or action templates inside the visible reply text. Structured data (suggested services, action templates, awaitingConfirmation) must be returned via the JSON schema only. The reply must be human-friendly and suitable for speaking aloud.\n\
- When the user mentions symptoms, medicines, labs, or appointments, produce a plain-language reply and also populate the structured fields (mode: 'service', suggestedServices, action, awaitingConfirmation) so the client can render and execute actions.";

/// JSON schema of the structured `DialogueResult` the endpoint is asked to fill.
static RESPONSE_SCHEMA: Lazy<serde_json::Value> = Lazy::new(|| {
    serde_json::json!({
        "type": "object",
        "properties": {
            "reply": {"type": "string"},
            "mode": {"type": "string", "enum": ["chat", "service"]},
            "suggestedServices": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "id": {"type": "string"},
                        "type": {"type": "string", "enum": ["doctor", "lab", "pharmacy", "appointment", "other"]},
                        "title": {"type": "string"},
                        "description": {"type": "string"},
                        "actionTemplate": {
                            "type": "object",
                            "properties": {
                                "type": {"type": "string", "enum": ["book_doctor", "book_lab", "order_medicine", "other"]},
                                "params": {"type": "object"}
                            }
                        }
                    }
                }
            },
            "awaitingConfirmation": {"type": "boolean"},
            "action": {
                "type": "object",
                "properties": {
                    "type": {"type": "string", "enum": ["book_doctor", "book_lab", "order_medicine", "other"]},
                    "params": {"type": "object"}
                }
            }
        }
    })
});

/// Backend that turns user text plus conversation history into a `DialogueResult`.
#[async_trait]
pub trait DialogueBackend: Send + Sync {
    async fn respond(&self, user_text: &str, history: &[Turn]) -> VoiceResult<DialogueResult>;
}

/// Production dialogue client for a schema-aware LLM endpoint.
pub struct HttpDialogue {
    url: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl HttpDialogue {
    pub fn new(url: impl Into<String>, api_key: Option<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            url: url.into(),
            api_key,
            client,
        }
    }

    fn build_messages(user_text: &str, history: &[Turn]) -> Vec<serde_json::Value> {
        let mut messages = Vec::with_capacity(history.len() + 2);
        messages.push(serde_json::json!({"role": "system", "content": SYSTEM_PROMPT}));
        for turn in history {
            messages.push(serde_json::json!({"role": turn.role.as_str(), "content": turn.text}));
        }
        messages.push(serde_json::json!({"role": "user", "content": user_text}));
        messages
    }

    fn parse_response(data: serde_json::Value) -> DialogueResult {
        // Preferred: structured result attached under schema_data.
        if let Some(schema_data) = data.get("schema_data") {
            match serde_json::from_value::<DialogueResult>(schema_data.clone()) {
                Ok(mut parsed) => {
                    if parsed.reply.is_empty() {
                        parsed.reply = data
                            .get("completion")
                            .and_then(|c| c.as_str())
                            .unwrap_or_default()
                            .to_string();
                    }
                    return parsed;
                }
                Err(e) => debug!("schema_data did not parse as DialogueResult: {}", e),
            }
        }

        // Fallback: the completion itself may be JSON; otherwise treat it as chat text.
        let completion = data
            .get("completion")
            .or_else(|| data.get("completion_text"))
            .and_then(|c| c.as_str())
            .unwrap_or_default();
        match serde_json::from_str::<DialogueResult>(completion) {
            Ok(parsed) => parsed,
            Err(_) if !completion.is_empty() => DialogueResult::chat(completion),
            Err(_) => DialogueResult::chat("Sorry, I could not understand that."),
        }
    }
}

#[async_trait]
impl DialogueBackend for HttpDialogue {
    async fn respond(&self, user_text: &str, history: &[Turn]) -> VoiceResult<DialogueResult> {
        let payload = serde_json::json!({
            "messages": Self::build_messages(user_text, history),
            "schema": &*RESPONSE_SCHEMA,
        });

        let mut req = self.client.post(&self.url).json(&payload);
        if let Some(ref key) = self.api_key {
            req = req.bearer_auth(key);
        }
        let res = req
            .send()
            .await
            .map_err(|e| VoiceError::Dialogue(e.to_string()))?;

        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            warn!("dialogue endpoint returned {}: {}", status, body);
            return Err(VoiceError::Dialogue(format!("status {}", status)));
        }

        let data: serde_json::Value = res
            .json()
            .await
            .map_err(|e| VoiceError::Dialogue(e.to_string()))?;
        Ok(Self::parse_response(data))
    }
}

/// Scripted dialogue backend: pops canned results and records received inputs.
/// Use for tests and offline demos. An empty queue yields a dialogue error.
#[derive(Default)]
pub struct ScriptedDialogue {
    results: Mutex<VecDeque<VoiceResult<DialogueResult>>>,
    inputs: Mutex<Vec<String>>,
}

impl ScriptedDialogue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, result: DialogueResult) {
        if let Ok(mut q) = self.results.lock() {
            q.push_back(Ok(result));
        }
    }

    /// Queue a failure for the next invocation.
    pub fn push_error(&self, message: impl Into<String>) {
        if let Ok(mut q) = self.results.lock() {
            q.push_back(Err(VoiceError::Dialogue(message.into())));
        }
    }

    /// Every user text this backend has been invoked with, in order.
    pub fn received_inputs(&self) -> Vec<String> {
        self.inputs.lock().map(|i| i.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl DialogueBackend for ScriptedDialogue {
    async fn respond(&self, user_text: &str, _history: &[Turn]) -> VoiceResult<DialogueResult> {
        if let Ok(mut inputs) = self.inputs.lock() {
            inputs.push(user_text.to_string());
        }
        self.results
            .lock()
            .ok()
            .and_then(|mut q| q.pop_front())
            .unwrap_or_else(|| Err(VoiceError::Dialogue("no scripted result".to_string())))
    }
}
