//! Error types for the voice assistant session

use thiserror::Error;

/// Result type alias for voice operations
pub type VoiceResult<T> = Result<T, VoiceError>;

/// Errors that can occur across the assistant pipeline.
///
/// Externally-facing failures are absorbed at each component boundary and turned
/// into conversational turns; nothing here is fatal to a session. Permission
/// denial never surfaces here at all: `CaptureBackend::request_permission`
/// answers with a bool and the session turns a refusal into an assistant turn.
#[derive(Error, Debug)]
pub enum VoiceError {
    #[error("Audio capture error: {0}")]
    Capture(String),

    #[error("Transcription error: {0}")]
    Transcription(String),

    #[error("Dialogue error: {0}")]
    Dialogue(String),

    #[error("Speech synthesis error: {0}")]
    Synthesis(String),

    #[error("Audio playback error: {0}")]
    Playback(String),

    #[error("Service action error: {0}")]
    Action(String),
}
