//! **Session State Machine** — owns the conversation log and orchestrates
//! capture, transcription, dialogue, confirmation gating, action execution and
//! speech, with the auto-resume loop that makes the assistant conversational.
//!
//! All state lives behind one cooperative mutex; every operation is a method on
//! the shared inner, so cross-calls are ordinary calls and no callback cells are
//! needed. Audio playback is the exception: inner methods only *queue* the text
//! to speak, and the lock is released before the chain plays it, so a concurrent
//! `start_listening` can take the lock and cut the assistant off mid-sentence.
//! Per turn the pipeline stays linear: transcription strictly precedes the
//! confirmation/dialogue branch, which precedes synthesis, which precedes the
//! auto-resumed capture. The only cancellation is the capture safety timer;
//! correctness elsewhere relies on capture-identity checks and on clearing
//! confirmation state before dispatching the dependent action.

use crate::actions::{ActionBackend, HttpActionClient};
use crate::capture::{CaptureBackend, MicCapture};
use crate::config::AssistantConfig;
use crate::dialogue::{DialogueBackend, HttpDialogue};
use crate::speech::{AudioSink, ProviderKind, SpeakRequest, SpeechChain};
use crate::transcribe::{transcriber_from_config, TranscribeBackend};
use crate::types::{ActionOutcome, Role, ServiceAction, SuggestedService, Turn};
use futures::future::BoxFuture;
use futures::FutureExt;
use once_cell::sync::Lazy;
use regex::Regex;
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

const GREETING: &str =
    "Hi, I'm Fitwell, your voice healthcare assistant. Tell me how you're feeling or ask a health question.";
const PERMISSION_NEEDED: &str = "I need permission to access the microphone.";
const CAPTURE_FAILED: &str = "I couldn't capture the audio.";
const DIALOGUE_APOLOGY: &str = "Sorry, I couldn't process that right now.";
const DECLINE_ACK: &str = "Okay, I will not proceed with that.";
const ACTION_IN_PROGRESS: &str = "Okay, I am booking that for you now...";
const NO_ACTION_TEMPLATE: &str = "No action template available for that service.";

static POSITIVE_LEXICON: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b(yes|yeah|yep|sure|please|affirmative|do it|confirm)\b").unwrap()
});
static NEGATIVE_LEXICON: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(no|not now|cancel|don't|dont|nope)\b").unwrap());

/// How a transcript reads as an answer to a pending confirmation question.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confirmation {
    Positive,
    Negative,
    Unclear,
}

/// Classify a transcript against the confirmation lexicons (case-insensitive,
/// word-boundary matching; positive wins over negative).
pub fn classify_confirmation(transcript: &str) -> Confirmation {
    let lc = transcript.to_lowercase();
    if POSITIVE_LEXICON.is_match(&lc) {
        Confirmation::Positive
    } else if NEGATIVE_LEXICON.is_match(&lc) {
        Confirmation::Negative
    } else {
        Confirmation::Unclear
    }
}

/// Observable session changes, emitted for UIs and logs.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    TurnAppended(Turn),
    RecordingChanged(bool),
    ProcessingChanged(bool),
    ConfirmationChanged(bool),
}

/// The pluggable component set behind one session.
pub struct SessionBackends {
    pub capture: Arc<dyn CaptureBackend>,
    pub transcriber: Arc<dyn TranscribeBackend>,
    pub dialogue: Arc<dyn DialogueBackend>,
    pub actions: Arc<dyn ActionBackend>,
    pub speech: SpeechChain,
}

impl SessionBackends {
    /// Default wiring for the given config: microphone capture, HTTP-or-placeholder
    /// transcription, HTTP dialogue, HTTP-or-mock actions, the standard TTS chain.
    pub fn from_config(config: &AssistantConfig, sink: Arc<dyn AudioSink>) -> Self {
        Self {
            capture: Arc::new(MicCapture::default()),
            transcriber: Arc::from(transcriber_from_config(config)),
            dialogue: Arc::new(HttpDialogue::new(
                config.dialogue_url.clone(),
                config.dialogue_api_key.clone(),
            )),
            actions: Arc::new(HttpActionClient::from_config(config)),
            speech: SpeechChain::from_config(config, sink),
        }
    }
}

/// Speech queued by a pipeline step, played after the session lock is released.
struct PendingSpeech {
    request: SpeakRequest,
    chain: Arc<SpeechChain>,
    resume: bool,
}

/// Play queued speech, then reopen the microphone if the queuing step asked for
/// it. Runs with the session lock released so playback stays interruptible.
fn deliver_speech(
    session: &Arc<Mutex<SessionInner>>,
    pending: Option<PendingSpeech>,
) -> BoxFuture<'_, ()> {
    async move {
        let Some(pending) = pending else { return };
        let used = pending.chain.speak(&pending.request).await;
        debug!("spoke via {:?}", used);
        if pending.resume {
            session.lock().await.start_listening().await;
        }
    }
    .boxed()
}

struct SessionInner {
    config: AssistantConfig,
    capture: Arc<dyn CaptureBackend>,
    transcriber: Arc<dyn TranscribeBackend>,
    dialogue: Arc<dyn DialogueBackend>,
    actions: Arc<dyn ActionBackend>,
    speech: Arc<SpeechChain>,

    turns: Vec<Turn>,
    recording: bool,
    processing: bool,
    auto_listen: bool,
    language: String,
    awaiting_confirmation: bool,
    pending_action: Option<ServiceAction>,
    last_suggested: Vec<SuggestedService>,

    // Capture identity: a monotonically increasing id per take, so a stale safety
    // timer can never finalize a capture it did not arm.
    capture_seq: u64,
    active_capture: Option<u64>,

    self_ref: Weak<Mutex<SessionInner>>,
    event_tx: mpsc::UnboundedSender<SessionEvent>,
    event_rx: Option<mpsc::UnboundedReceiver<SessionEvent>>,
}

impl SessionInner {
    fn push_turn(&mut self, turn: Turn) {
        self.turns.push(turn.clone());
        let _ = self.event_tx.send(SessionEvent::TurnAppended(turn));
    }

    fn push_assistant(&mut self, text: impl Into<String>) {
        self.push_turn(Turn::new(Role::Assistant, text));
    }

    fn set_recording(&mut self, on: bool) {
        if self.recording != on {
            self.recording = on;
            let _ = self.event_tx.send(SessionEvent::RecordingChanged(on));
        }
    }

    fn set_processing(&mut self, on: bool) {
        if self.processing != on {
            self.processing = on;
            let _ = self.event_tx.send(SessionEvent::ProcessingChanged(on));
        }
    }

    /// The single writer of the confirmation pair: `awaiting_confirmation` is
    /// true exactly when a pending action is stored.
    fn set_confirmation(&mut self, action: Option<ServiceAction>) {
        let awaiting = action.is_some();
        self.pending_action = action;
        if self.awaiting_confirmation != awaiting {
            self.awaiting_confirmation = awaiting;
            let _ = self
                .event_tx
                .send(SessionEvent::ConfirmationChanged(awaiting));
        }
    }

    async fn start_listening(&mut self) {
        if self.recording {
            debug!("start_listening ignored: already recording");
            return;
        }
        // Let the user interrupt the assistant mid-sentence.
        self.speech.stop();

        if !self.capture.request_permission().await {
            self.push_assistant(PERMISSION_NEEDED);
            return;
        }
        if let Err(e) = self.capture.begin().await {
            warn!("capture start failed: {}", e);
            self.set_recording(false);
            return;
        }

        self.capture_seq += 1;
        let capture_id = self.capture_seq;
        self.active_capture = Some(capture_id);
        self.set_recording(true);
        info!("listening (capture {})", capture_id);

        // Safety cutoff: force-stop this capture if it is still the active one
        // when the timer fires. A manual stop/restart changes the id, so a stale
        // timer is a no-op.
        let weak = self.self_ref.clone();
        let timeout = self.config.capture_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let Some(session) = weak.upgrade() else { return };
            let pending = {
                let mut inner = session.lock().await;
                if inner.active_capture == Some(capture_id) {
                    warn!("capture {} hit the safety timeout, stopping", capture_id);
                    inner.finalize_capture(capture_id).await
                } else {
                    None
                }
            };
            deliver_speech(&session, pending).await;
        });
    }

    async fn stop_listening(&mut self) -> Option<PendingSpeech> {
        match self.active_capture {
            Some(capture_id) => self.finalize_capture(capture_id).await,
            None => {
                self.set_recording(false);
                None
            }
        }
    }

    async fn finalize_capture(&mut self, capture_id: u64) -> Option<PendingSpeech> {
        if self.active_capture != Some(capture_id) {
            debug!("stale stop for capture {}, ignoring", capture_id);
            return None;
        }
        self.active_capture = None;
        self.set_recording(false);

        let audio = match self.capture.finish().await {
            Ok(audio) => audio,
            Err(e) => {
                warn!("capture finalize failed: {}", e);
                None
            }
        };
        let Some(audio) = audio else {
            self.push_assistant(CAPTURE_FAILED);
            return None;
        };

        self.set_processing(true);
        let transcript = self.transcriber.transcribe(&audio).await;
        self.set_processing(false);

        self.push_turn(Turn::new(Role::User, transcript.clone()));

        if self.awaiting_confirmation {
            if let Some(action) = self.pending_action.clone() {
                match classify_confirmation(&transcript) {
                    Confirmation::Positive => {
                        return self.execute_pending_action(action).await;
                    }
                    Confirmation::Negative => {
                        self.push_assistant(DECLINE_ACK);
                        self.set_confirmation(None);
                        return None;
                    }
                    // Neither lexicon matched: treat as ordinary dialogue input and
                    // let the dialogue result overwrite the pending state.
                    Confirmation::Unclear => {}
                }
            }
        }

        self.process_user_text(transcript).await
    }

    async fn send_text(&mut self, text: &str) -> Option<PendingSpeech> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return None;
        }
        self.push_turn(Turn::new(Role::User, trimmed));
        self.process_user_text(trimmed.to_string()).await
    }

    /// Dialogue pipeline. The user turn has already been appended; the history
    /// sent to the model excludes it because the dialogue client appends the new
    /// text itself.
    async fn process_user_text(&mut self, text: String) -> Option<PendingSpeech> {
        self.set_processing(true);
        let history_end = self.turns.len().saturating_sub(1);
        let result = self
            .dialogue
            .respond(&text, &self.turns[..history_end])
            .await;
        self.set_processing(false);

        match result {
            Ok(res) => {
                self.push_turn(
                    Turn::new(Role::Assistant, res.reply.clone())
                        .with_services(res.suggested_services.clone()),
                );
                self.last_suggested = res.suggested_services;
                // Set both or clear both, never one without the other.
                if res.awaiting_confirmation && res.action.is_some() {
                    self.set_confirmation(res.action);
                } else {
                    self.set_confirmation(None);
                }
                self.queue_speech(res.reply)
            }
            Err(e) => {
                warn!("dialogue failed: {}", e);
                self.push_assistant(DIALOGUE_APOLOGY);
                // Confirmation state intentionally untouched.
                None
            }
        }
    }

    /// Queue text for the provider chain. Blank text queues nothing (and so
    /// never reopens the microphone); the auto-resume decision is captured here
    /// and honored after playback settles.
    fn queue_speech(&mut self, text: String) -> Option<PendingSpeech> {
        if text.trim().is_empty() {
            return None;
        }
        let mut request = SpeakRequest::new(text).with_lang(self.language.clone());
        if self.config.prefers_premium_for(&self.language) {
            request = request.with_provider(ProviderKind::Premium);
        }
        Some(PendingSpeech {
            request,
            chain: Arc::clone(&self.speech),
            resume: self.auto_listen,
        })
    }

    async fn execute_pending_action(&mut self, action: ServiceAction) -> Option<PendingSpeech> {
        // Clear before dispatch: a stray repeated confirmation must not re-trigger.
        self.set_confirmation(None);
        self.set_processing(true);
        self.push_assistant(ACTION_IN_PROGRESS);

        let outcome = match self.actions.execute(&action).await {
            Ok(outcome) => outcome,
            Err(e) => ActionOutcome::failure(e.to_string()),
        };
        let text = if outcome.success {
            format!(
                "All set! Your booking/order is confirmed. Reference: {}.",
                outcome.reference()
            )
        } else {
            format!(
                "I couldn't complete the booking: {}",
                outcome.error.as_deref().unwrap_or("unknown error")
            )
        };
        self.push_assistant(text.clone());
        self.set_processing(false);
        self.queue_speech(text)
    }

    async fn execute_suggested_service(
        &mut self,
        service: SuggestedService,
    ) -> Option<PendingSpeech> {
        let Some(template) = service.action_template else {
            self.push_assistant(NO_ACTION_TEMPLATE);
            return None;
        };
        self.set_confirmation(Some(template));
        let question = format!("Do you want me to {}?", service.title.to_lowercase());
        self.push_assistant(question.clone());
        self.queue_speech(question)
    }

    async fn shutdown(&mut self) {
        self.speech.stop();
        if self.active_capture.take().is_some() {
            self.set_recording(false);
            if let Err(e) = self.capture.finish().await {
                debug!("capture release on shutdown failed: {}", e);
            }
        }
    }
}

/// One assistant session, from greeting to teardown.
///
/// Cheap to clone handles are not provided; the session itself is the shared
/// handle (all operations take `&self` and serialize on the inner mutex).
pub struct VoiceSession {
    inner: Arc<Mutex<SessionInner>>,
}

impl VoiceSession {
    /// Build a session with default backends wired from the config.
    pub fn new(config: AssistantConfig, sink: Arc<dyn AudioSink>) -> Self {
        let backends = SessionBackends::from_config(&config, sink);
        Self::with_backends(config, backends)
    }

    /// Build a session from environment configuration.
    pub fn from_env(sink: Arc<dyn AudioSink>) -> Self {
        Self::new(AssistantConfig::from_env(), sink)
    }

    /// Build a session with explicit backends (tests, headless demos).
    pub fn with_backends(config: AssistantConfig, backends: SessionBackends) -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let inner = Arc::new_cyclic(|weak: &Weak<Mutex<SessionInner>>| {
            let mut inner = SessionInner {
                language: config.language.clone(),
                auto_listen: config.auto_listen,
                config,
                capture: backends.capture,
                transcriber: backends.transcriber,
                dialogue: backends.dialogue,
                actions: backends.actions,
                speech: Arc::new(backends.speech),
                turns: Vec::new(),
                recording: false,
                processing: false,
                awaiting_confirmation: false,
                pending_action: None,
                last_suggested: Vec::new(),
                capture_seq: 0,
                active_capture: None,
                self_ref: weak.clone(),
                event_tx,
                event_rx: Some(event_rx),
            };
            inner.push_turn(Turn::new(Role::Assistant, GREETING));
            Mutex::new(inner)
        });
        Self { inner }
    }

    /// Start capturing voice input. Stops any in-progress speech first and arms
    /// the capture safety timer.
    pub async fn start_listening(&self) {
        self.inner.lock().await.start_listening().await;
    }

    /// Stop capturing and run the transcript through the confirmation policy or
    /// the dialogue pipeline. No-op (beyond clearing the flag) with no capture.
    pub async fn stop_listening(&self) {
        let pending = self.inner.lock().await.stop_listening().await;
        deliver_speech(&self.inner, pending).await;
    }

    /// Typed-input entry point. Blank text is a no-op.
    pub async fn send_text(&self, text: &str) {
        let pending = self.inner.lock().await.send_text(text).await;
        deliver_speech(&self.inner, pending).await;
    }

    /// Ask for confirmation of a suggested service, speaking the question.
    pub async fn execute_suggested_service(&self, service: SuggestedService) {
        let pending = self
            .inner
            .lock()
            .await
            .execute_suggested_service(service)
            .await;
        deliver_speech(&self.inner, pending).await;
    }

    /// Execute an action immediately (UI button or confirmed pending action).
    pub async fn execute_pending_action(&self, action: ServiceAction) {
        let pending = self.inner.lock().await.execute_pending_action(action).await;
        deliver_speech(&self.inner, pending).await;
    }

    pub async fn toggle_auto_listen(&self) -> bool {
        let mut inner = self.inner.lock().await;
        inner.auto_listen = !inner.auto_listen;
        inner.auto_listen
    }

    pub async fn set_language(&self, language: impl Into<String>) {
        self.inner.lock().await.language = language.into();
    }

    /// Snapshot of the conversation log.
    pub async fn turns(&self) -> Vec<Turn> {
        self.inner.lock().await.turns.clone()
    }

    pub async fn is_recording(&self) -> bool {
        self.inner.lock().await.recording
    }

    pub async fn is_processing(&self) -> bool {
        self.inner.lock().await.processing
    }

    pub async fn awaiting_confirmation(&self) -> bool {
        self.inner.lock().await.awaiting_confirmation
    }

    pub async fn pending_action(&self) -> Option<ServiceAction> {
        self.inner.lock().await.pending_action.clone()
    }

    pub async fn last_suggested_services(&self) -> Vec<SuggestedService> {
        self.inner.lock().await.last_suggested.clone()
    }

    pub async fn auto_listen(&self) -> bool {
        self.inner.lock().await.auto_listen
    }

    /// Take the event receiver. Callable once; later calls return `None`.
    pub async fn take_event_receiver(&self) -> Option<mpsc::UnboundedReceiver<SessionEvent>> {
        self.inner.lock().await.event_rx.take()
    }

    /// End the session: stop speech, release any active capture.
    pub async fn shutdown(&self) {
        self.inner.lock().await.shutdown().await;
    }
}
