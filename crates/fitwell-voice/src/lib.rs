//! # Fitwell Voice - Conversational Healthcare Assistant
//!
//! This crate implements a voice-driven assistant session: microphone capture,
//! transcription, a schema-aware dialogue model, a multi-provider speech chain
//! and confirmed service actions (doctor/lab bookings, medicine orders), tied
//! together by an auto-resume loop that keeps the conversation hands-free.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                       Voice Session                          │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐        │
//! │  │   Capture    │→ │ Transcribe   │→ │ Confirmation │        │
//! │  │    (cpal)    │  │ (multipart)  │  │    policy    │        │
//! │  └──────────────┘  └──────────────┘  └──────┬───────┘        │
//! │         ↑                            yes/no │ unclear        │
//! │         │ auto-resume        ┌──────────────┼───────┐        │
//! │  ┌──────┴───────┐            ▼              ▼       │        │
//! │  │ Speech chain │←──── Action executor   Dialogue ──┘        │
//! │  │   (rodio)    │      (book / order)     (LLM)              │
//! │  └──────────────┘                                            │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every external component sits behind a trait (`CaptureBackend`,
//! `TranscribeBackend`, `DialogueBackend`, `ActionBackend`, `SynthProvider`,
//! `AudioSink`), with scripted implementations for tests and offline runs.

pub mod actions;
pub mod capture;
pub mod config;
pub mod dialogue;
pub mod error;
pub mod session;
pub mod speech;
pub mod transcribe;
pub mod types;

pub use actions::{ActionBackend, HttpActionClient};
pub use capture::{CaptureBackend, CapturedAudio, MicCapture, MicConfig, ScriptedCapture};
pub use config::AssistantConfig;
pub use dialogue::{DialogueBackend, HttpDialogue, ScriptedDialogue};
pub use error::{VoiceError, VoiceResult};
pub use session::{
    classify_confirmation, Confirmation, SessionBackends, SessionEvent, VoiceSession,
};
pub use speech::{
    AudioSink, HttpTtsProvider, LocalSpeech, NullSink, PremiumVoice, ProviderKind, RodioSink,
    SpeakRequest, SpeechChain, SynthProvider,
};
pub use transcribe::{
    transcriber_from_config, HttpTranscriber, PlaceholderTranscriber, TranscribeBackend,
    TRANSCRIPTION_ERROR, TRANSCRIPTION_FAILED, TRANSCRIPTION_UNAVAILABLE,
};
pub use types::{
    ActionKind, ActionOutcome, DialogueMode, DialogueResult, Role, ServiceAction,
    ServiceCategory, SuggestedService, Turn,
};
