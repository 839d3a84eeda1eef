//! End-to-end session flows with scripted backends: capture, transcription,
//! dialogue, confirmation gating, action execution and the auto-resume loop.

use async_trait::async_trait;
use fitwell_voice::{
    ActionKind, AssistantConfig, AudioSink, CaptureBackend, CapturedAudio, DialogueResult,
    HttpActionClient, NullSink, PlaceholderTranscriber, Role, ScriptedCapture, ScriptedDialogue,
    ServiceAction, ServiceCategory, SessionBackends, SessionEvent, SpeakRequest, SpeechChain,
    SuggestedService, SynthProvider, TranscribeBackend, VoiceResult, VoiceSession,
    TRANSCRIPTION_UNAVAILABLE,
};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Transcriber that replays a queue of transcripts, one per capture.
#[derive(Default)]
struct ScriptedTranscriber {
    transcripts: Mutex<VecDeque<String>>,
}

impl ScriptedTranscriber {
    fn new() -> Self {
        Self::default()
    }

    fn push(&self, text: &str) {
        self.transcripts.lock().unwrap().push_back(text.to_string());
    }
}

#[async_trait]
impl TranscribeBackend for ScriptedTranscriber {
    async fn transcribe(&self, _audio: &CapturedAudio) -> String {
        self.transcripts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| "(empty)".to_string())
    }
}

struct Rig {
    session: VoiceSession,
    capture: Arc<ScriptedCapture>,
    transcriber: Arc<ScriptedTranscriber>,
    dialogue: Arc<ScriptedDialogue>,
}

fn rig_with(config: AssistantConfig) -> Rig {
    let capture = Arc::new(ScriptedCapture::new());
    let transcriber = Arc::new(ScriptedTranscriber::new());
    let dialogue = Arc::new(ScriptedDialogue::new());
    let backends = SessionBackends {
        capture: Arc::clone(&capture) as Arc<dyn CaptureBackend>,
        transcriber: Arc::clone(&transcriber) as Arc<dyn TranscribeBackend>,
        dialogue: Arc::clone(&dialogue) as Arc<dyn fitwell_voice::DialogueBackend>,
        actions: Arc::new(HttpActionClient::new(None, None)),
        speech: SpeechChain::from_config(&config, Arc::new(NullSink::new())),
    };
    Rig {
        session: VoiceSession::with_backends(config, backends),
        capture,
        transcriber,
        dialogue,
    }
}

fn rig() -> Rig {
    let config = AssistantConfig {
        auto_listen: false,
        ..AssistantConfig::default()
    };
    rig_with(config)
}

fn lab_action() -> ServiceAction {
    ServiceAction::new(ActionKind::BookLab).with_param("tests", serde_json::json!(["CBC"]))
}

fn service_result(reply: &str) -> DialogueResult {
    DialogueResult {
        reply: reply.to_string(),
        awaiting_confirmation: true,
        action: Some(lab_action()),
        suggested_services: vec![SuggestedService {
            id: "svc1".to_string(),
            category: ServiceCategory::Lab,
            title: "Book a CBC lab test".to_string(),
            description: None,
            action_template: Some(lab_action()),
        }],
        ..DialogueResult::chat("")
    }
}

/// Drive one full voice turn: listen, then stop, with the given transcript queued.
async fn voice_turn(rig: &Rig, transcript: &str) {
    rig.transcriber.push(transcript);
    rig.session.start_listening().await;
    rig.session.stop_listening().await;
}

#[tokio::test]
async fn greeting_opens_the_conversation() {
    let r = rig();
    let turns = r.session.turns().await;
    assert_eq!(turns.len(), 1);
    assert_eq!(turns[0].role, Role::Assistant);
    assert!(turns[0].text.contains("Fitwell"));
}

#[tokio::test]
async fn symptom_chat_runs_the_full_pipeline() {
    let r = rig();
    r.dialogue.push(DialogueResult::chat(
        "That sounds uncomfortable. Rest and fluids help; see a GP if it persists.",
    ));

    voice_turn(&r, "I have a headache").await;

    let turns = r.session.turns().await;
    assert_eq!(turns.len(), 3);
    assert_eq!(turns[1].role, Role::User);
    assert_eq!(turns[1].text, "I have a headache");
    assert_eq!(turns[2].role, Role::Assistant);
    assert!(turns[2].text.contains("GP"));
    assert!(!r.session.awaiting_confirmation().await);
    assert_eq!(r.dialogue.received_inputs(), vec!["I have a headache"]);
    assert!(!r.session.is_recording().await);
    assert!(!r.session.is_processing().await);
}

#[tokio::test]
async fn confirmed_service_action_executes_and_reports_reference() {
    let r = rig();
    r.dialogue
        .push(service_result("I can book a CBC lab test. Shall I?"));

    voice_turn(&r, "I need a blood test").await;
    assert!(r.session.awaiting_confirmation().await);
    assert_eq!(
        r.session.pending_action().await.map(|a| a.kind),
        Some(ActionKind::BookLab)
    );

    voice_turn(&r, "yes please").await;

    assert!(!r.session.awaiting_confirmation().await);
    assert!(r.session.pending_action().await.is_none());
    let turns = r.session.turns().await;
    let texts: Vec<&str> = turns.iter().map(|t| t.text.as_str()).collect();
    assert!(texts.contains(&"Okay, I am booking that for you now..."));
    let done = texts
        .iter()
        .find(|t| t.starts_with("All set!"))
        .expect("completion turn");
    assert!(done.contains("mock-lab-"));
    // The confirmation itself never reaches the dialogue model.
    assert_eq!(r.dialogue.received_inputs(), vec!["I need a blood test"]);
}

#[tokio::test]
async fn declined_confirmation_is_acknowledged_and_cleared() {
    let r = rig();
    r.dialogue.push(service_result("Shall I book it?"));

    voice_turn(&r, "I need a blood test").await;
    voice_turn(&r, "no thanks").await;

    assert!(!r.session.awaiting_confirmation().await);
    let turns = r.session.turns().await;
    assert_eq!(
        turns.last().unwrap().text,
        "Okay, I will not proceed with that."
    );
    assert_eq!(r.dialogue.received_inputs(), vec!["I need a blood test"]);
}

#[tokio::test]
async fn unclear_answer_falls_through_to_dialogue() {
    let r = rig();
    r.dialogue.push(service_result("Shall I book it?"));
    r.dialogue
        .push(DialogueResult::chat("Could you clarify what you'd like?"));

    voice_turn(&r, "I need a blood test").await;
    voice_turn(&r, "my left arm also hurts").await;

    // The dialogue saw the unclear answer, and its chat reply cleared the pending action.
    assert_eq!(
        r.dialogue.received_inputs(),
        vec!["I need a blood test", "my left arm also hurts"]
    );
    assert!(!r.session.awaiting_confirmation().await);
}

#[tokio::test]
async fn dialogue_failure_apologizes_and_preserves_confirmation() {
    let r = rig();
    r.dialogue.push(service_result("Shall I book it?"));
    r.dialogue.push_error("upstream 500");

    voice_turn(&r, "I need a blood test").await;
    voice_turn(&r, "hmm let me think").await;

    let turns = r.session.turns().await;
    assert_eq!(
        turns.last().unwrap().text,
        "Sorry, I couldn't process that right now."
    );
    // A failed exchange must not wipe the question the user still owes an answer to.
    assert!(r.session.awaiting_confirmation().await);
    assert_eq!(
        r.session.pending_action().await.map(|a| a.kind),
        Some(ActionKind::BookLab)
    );
}

#[tokio::test]
async fn denied_permission_reports_without_recording() {
    let config = AssistantConfig {
        auto_listen: false,
        ..AssistantConfig::default()
    };
    let capture = Arc::new(ScriptedCapture::denied());
    let backends = SessionBackends {
        capture: Arc::clone(&capture) as Arc<dyn CaptureBackend>,
        transcriber: Arc::new(ScriptedTranscriber::new()),
        dialogue: Arc::new(ScriptedDialogue::new()),
        actions: Arc::new(HttpActionClient::new(None, None)),
        speech: SpeechChain::from_config(&config, Arc::new(NullSink::new())),
    };
    let session = VoiceSession::with_backends(config, backends);

    session.start_listening().await;

    assert!(!session.is_recording().await);
    assert_eq!(capture.begin_count(), 0);
    assert_eq!(
        session.turns().await.last().unwrap().text,
        "I need permission to access the microphone."
    );
}

#[tokio::test]
async fn failed_capture_reports_without_invoking_dialogue() {
    let r = rig();
    r.capture.push_result(None);

    r.session.start_listening().await;
    r.session.stop_listening().await;

    assert_eq!(
        r.session.turns().await.last().unwrap().text,
        "I couldn't capture the audio."
    );
    assert!(r.dialogue.received_inputs().is_empty());
}

#[tokio::test]
async fn stop_without_active_capture_is_a_noop() {
    let r = rig();
    r.session.stop_listening().await;
    assert_eq!(r.capture.finish_count(), 0);
    assert_eq!(r.session.turns().await.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn safety_timer_force_stops_a_stuck_capture() {
    let r = rig();
    r.transcriber.push("hello there");
    r.dialogue.push(DialogueResult::chat("Hi! How can I help?"));

    r.session.start_listening().await;
    assert!(r.session.is_recording().await);

    // Never stopped manually; the cutoff finalizes the take.
    tokio::time::sleep(std::time::Duration::from_secs(13)).await;

    assert!(!r.session.is_recording().await);
    assert_eq!(r.capture.finish_count(), 1);
    let turns = r.session.turns().await;
    assert_eq!(turns[1].text, "hello there");
    assert_eq!(turns[2].text, "Hi! How can I help?");
}

#[tokio::test(start_paused = true)]
async fn stale_safety_timer_does_not_refire() {
    let r = rig();
    r.transcriber.push("quick question");
    r.dialogue.push(DialogueResult::chat("Go ahead."));

    r.session.start_listening().await;
    r.session.stop_listening().await;
    assert_eq!(r.capture.finish_count(), 1);

    // The timer armed by start_listening fires against a finished capture id.
    tokio::time::sleep(std::time::Duration::from_secs(13)).await;
    assert_eq!(r.capture.finish_count(), 1);
    assert_eq!(r.session.turns().await.len(), 3);
}

#[tokio::test(start_paused = true)]
async fn restarted_capture_is_finalized_exactly_once() {
    let r = rig();
    r.transcriber.push("first take");
    r.transcriber.push("second take");
    r.dialogue.push(DialogueResult::chat("Got it."));
    r.dialogue.push(DialogueResult::chat("Got that too."));

    r.session.start_listening().await;
    r.session.stop_listening().await;
    r.session.start_listening().await;

    // The first capture's timer sees a changed id; only the second capture's own
    // timer finalizes it.
    tokio::time::sleep(std::time::Duration::from_secs(13)).await;
    assert_eq!(r.capture.finish_count(), 2);
    assert!(!r.session.is_recording().await);
    let turns = r.session.turns().await;
    assert_eq!(turns.len(), 5);
    assert_eq!(turns[3].text, "second take");
}

#[tokio::test]
async fn auto_listen_reopens_the_microphone_after_speaking() {
    let config = AssistantConfig {
        auto_listen: true,
        ..AssistantConfig::default()
    };
    let r = rig_with(config);
    r.dialogue.push(DialogueResult::chat("Noted. Anything else?"));

    voice_turn(&r, "log my weight").await;

    // One take for the user turn, one reopened after the reply was spoken.
    assert_eq!(r.capture.begin_count(), 2);
    assert!(r.session.is_recording().await);
    r.session.shutdown().await;
    assert!(!r.session.is_recording().await);
}

#[tokio::test]
async fn blank_typed_input_is_ignored() {
    let r = rig();
    r.session.send_text("").await;
    r.session.send_text("   ").await;
    assert_eq!(r.session.turns().await.len(), 1);
    assert!(r.dialogue.received_inputs().is_empty());
}

/// Provider that always produces a few bytes, so the sink actually plays.
struct ToneProvider;

#[async_trait]
impl SynthProvider for ToneProvider {
    fn name(&self) -> &'static str {
        "tone"
    }

    fn applicable(&self, _req: &SpeakRequest) -> bool {
        true
    }

    async fn synthesize(&self, _req: &SpeakRequest) -> VoiceResult<Vec<u8>> {
        Ok(vec![0u8; 16])
    }
}

/// Sink whose playback runs until stopped (or a 5 s ceiling), like real audio.
#[derive(Default)]
struct SlowSink {
    stop_signal: tokio::sync::Notify,
    playing: AtomicBool,
    stops: AtomicUsize,
}

#[async_trait]
impl AudioSink for SlowSink {
    async fn play(&self, _bytes: Vec<u8>) -> VoiceResult<()> {
        self.playing.store(true, Ordering::SeqCst);
        let _ = tokio::time::timeout(Duration::from_secs(5), self.stop_signal.notified()).await;
        self.playing.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
        self.stop_signal.notify_one();
    }

    fn is_playing(&self) -> bool {
        self.playing.load(Ordering::SeqCst)
    }
}

#[tokio::test]
async fn start_listening_interrupts_in_progress_speech() {
    let config = AssistantConfig {
        auto_listen: false,
        ..AssistantConfig::default()
    };
    let sink = Arc::new(SlowSink::default());
    let dialogue = Arc::new(ScriptedDialogue::new());
    dialogue.push(DialogueResult::chat(
        "Here is a long answer about hydration and rest.",
    ));
    let backends = SessionBackends {
        capture: Arc::new(ScriptedCapture::new()),
        transcriber: Arc::new(ScriptedTranscriber::new()),
        dialogue: Arc::clone(&dialogue) as Arc<dyn fitwell_voice::DialogueBackend>,
        actions: Arc::new(HttpActionClient::new(None, None)),
        speech: SpeechChain::new(
            vec![Box::new(ToneProvider)],
            Arc::clone(&sink) as Arc<dyn AudioSink>,
        ),
    };
    let session = Arc::new(VoiceSession::with_backends(config, backends));

    // The reply starts playing in the background and would run for seconds.
    let speaking = {
        let session = Arc::clone(&session);
        tokio::spawn(async move { session.send_text("tell me about fever care").await })
    };
    tokio::time::timeout(Duration::from_secs(2), async {
        while !sink.is_playing() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("playback never started");

    // Opening the mic must cut the assistant off instead of waiting it out.
    tokio::time::timeout(Duration::from_millis(500), session.start_listening())
        .await
        .expect("start_listening blocked behind playback");

    assert!(sink.stops.load(Ordering::SeqCst) >= 1);
    assert!(session.is_recording().await);
    speaking.await.expect("speaking task");
    assert!(!sink.is_playing());
}

#[tokio::test]
async fn unconfigured_transcription_still_reaches_the_dialogue() {
    let config = AssistantConfig {
        auto_listen: false,
        ..AssistantConfig::default()
    };
    let dialogue = Arc::new(ScriptedDialogue::new());
    dialogue.push(DialogueResult::chat("Could you type that instead?"));
    let backends = SessionBackends {
        capture: Arc::new(ScriptedCapture::new()),
        transcriber: Arc::new(PlaceholderTranscriber::new()),
        dialogue: Arc::clone(&dialogue) as Arc<dyn fitwell_voice::DialogueBackend>,
        actions: Arc::new(HttpActionClient::new(None, None)),
        speech: SpeechChain::from_config(&config, Arc::new(NullSink::new())),
    };
    let session = VoiceSession::with_backends(config, backends);

    session.start_listening().await;
    session.stop_listening().await;

    let turns = session.turns().await;
    assert_eq!(turns[1].text, TRANSCRIPTION_UNAVAILABLE);
    assert_eq!(
        dialogue.received_inputs(),
        vec![TRANSCRIPTION_UNAVAILABLE.to_string()]
    );
}

#[tokio::test]
async fn typed_input_bypasses_the_confirmation_policy() {
    let r = rig();
    r.dialogue.push(service_result("Shall I book it?"));
    r.dialogue.push(DialogueResult::chat("Sure thing."));

    voice_turn(&r, "I need a blood test").await;
    r.session.send_text("yes").await;

    // Typed text always goes to the dialogue model, never the yes/no lexicons.
    assert_eq!(
        r.dialogue.received_inputs(),
        vec!["I need a blood test", "yes"]
    );
    assert!(!r.session.awaiting_confirmation().await);
}

#[tokio::test]
async fn suggested_service_without_template_is_refused() {
    let r = rig();
    let service = SuggestedService {
        id: "svc9".to_string(),
        category: ServiceCategory::Other,
        title: "General advice".to_string(),
        description: None,
        action_template: None,
    };
    r.session.execute_suggested_service(service).await;
    assert!(!r.session.awaiting_confirmation().await);
    assert_eq!(
        r.session.turns().await.last().unwrap().text,
        "No action template available for that service."
    );
}

#[tokio::test]
async fn suggested_service_with_template_asks_for_confirmation() {
    let r = rig();
    let service = SuggestedService {
        id: "svc1".to_string(),
        category: ServiceCategory::Lab,
        title: "Book a CBC Lab Test".to_string(),
        description: None,
        action_template: Some(lab_action()),
    };
    r.session.execute_suggested_service(service).await;

    assert!(r.session.awaiting_confirmation().await);
    assert_eq!(
        r.session.turns().await.last().unwrap().text,
        "Do you want me to book a cbc lab test?"
    );
}

#[tokio::test]
async fn events_mirror_the_conversation() {
    let r = rig();
    let mut events = r.session.take_event_receiver().await.expect("receiver");
    assert!(r.session.take_event_receiver().await.is_none());

    r.dialogue.push(DialogueResult::chat("Hello!"));
    r.session.send_text("hi").await;

    let mut appended = 0;
    let mut processing_flips = 0;
    while let Ok(event) = events.try_recv() {
        match event {
            SessionEvent::TurnAppended(_) => appended += 1,
            SessionEvent::ProcessingChanged(_) => processing_flips += 1,
            _ => {}
        }
    }
    // Greeting, user turn, assistant turn; processing toggled on and off.
    assert_eq!(appended, 3);
    assert!(processing_flips >= 2);
}

#[tokio::test]
async fn suggested_services_are_carried_on_the_assistant_turn() {
    let r = rig();
    r.dialogue.push(service_result("I can book that."));

    voice_turn(&r, "I need a blood test").await;

    let turns = r.session.turns().await;
    let assistant = turns.last().unwrap();
    assert_eq!(assistant.suggested_services.len(), 1);
    assert_eq!(assistant.suggested_services[0].title, "Book a CBC lab test");
    assert_eq!(r.session.last_suggested_services().await.len(), 1);
}
