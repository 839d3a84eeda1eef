//! Assistant Demo — the full session loop with whatever backends are configured.
//!
//! - **ASR**: HTTP endpoint if `FITWELL_ASR_URL` is set, else a placeholder transcript.
//! - **Dialogue**: `FITWELL_LLM_URL` (defaults to the a0 LLM endpoint).
//! - **TTS**: ElevenLabs / Coqui / generic chain per config, else silent local fallback.
//! - **Actions**: `FITWELL_API_BASE` if set, else deterministic mocks.
//!
//! Press Enter on an empty line to toggle the microphone; type text to send it
//! directly; `quit` exits.

use fitwell_voice::{
    AssistantConfig, AudioSink, NullSink, RodioSink, SessionEvent, VoiceSession,
};
use std::io::{BufRead, Write};
use std::sync::Arc;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let _ = dotenvy::dotenv();
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = AssistantConfig::from_env();
    info!("Fitwell assistant demo");
    info!("Set FITWELL_ASR_URL / FITWELL_LLM_API_KEY / FITWELL_ELEVEN_API_KEY in .env for live backends.");
    info!("Empty line toggles the mic, text lines go straight to the assistant, 'quit' exits.\n");

    let sink: Arc<dyn AudioSink> = match RodioSink::new() {
        Ok(s) => Arc::new(s),
        Err(e) => {
            warn!("no audio output, running silent: {}", e);
            Arc::new(NullSink::new())
        }
    };
    let session = Arc::new(VoiceSession::new(config, sink));

    if let Some(mut events) = session.take_event_receiver().await {
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    SessionEvent::TurnAppended(turn) => {
                        println!("[{}] {}", turn.role.as_str(), turn.text);
                        for svc in &turn.suggested_services {
                            println!("    -> {}", svc.title);
                        }
                    }
                    SessionEvent::RecordingChanged(on) => {
                        println!("(mic {})", if on { "on" } else { "off" });
                    }
                    SessionEvent::ConfirmationChanged(true) => {
                        println!("(awaiting confirmation)");
                    }
                    _ => {}
                }
            }
        });
    }

    let stdin = std::io::stdin();
    let mut lines = stdin.lock().lines();
    loop {
        print!("> ");
        std::io::stdout().flush()?;
        let Some(line) = lines.next() else { break };
        let line = line?;
        let trimmed = line.trim();
        if trimmed == "quit" {
            break;
        }
        if trimmed.is_empty() {
            if session.is_recording().await {
                session.stop_listening().await;
            } else {
                session.start_listening().await;
            }
        } else {
            session.send_text(trimmed).await;
        }
    }

    session.shutdown().await;
    Ok(())
}
