//! Audio capture behind a small backend seam.
//!
//! `MicCapture` records from the default input device via CPAL on a dedicated
//! thread (the stream is !Send on some platforms) and finalizes the take to WAV
//! bytes. `ScriptedCapture` replays canned audio for tests and headless demos.
//! The session owns capture *identity*; a backend only starts and stops takes.

use crate::error::{VoiceError, VoiceResult};
use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::StreamConfig;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::Duration;
use tracing::{info, warn};

/// A finalized capture, ready for upload to the transcription service.
#[derive(Debug, Clone)]
pub struct CapturedAudio {
    /// 16-bit mono WAV bytes.
    pub wav: Vec<u8>,
    pub sample_rate: u32,
    pub duration: Duration,
    /// Filename reported in the multipart upload.
    pub file_name: String,
}

impl CapturedAudio {
    /// Encode f32 PCM (mono) into a `CapturedAudio`.
    pub fn from_pcm(samples: &[f32], sample_rate: u32) -> Self {
        let duration = Duration::from_secs_f64(samples.len() as f64 / sample_rate as f64);
        Self {
            wav: encode_wav(samples, sample_rate),
            sample_rate,
            duration,
            file_name: "recording.wav".to_string(),
        }
    }

    /// Silent clip of the given length. Handy for scripted captures.
    pub fn silence(millis: u64) -> Self {
        let sample_rate = 16_000u32;
        let samples = vec![0.0f32; (sample_rate as u64 * millis / 1000) as usize];
        Self::from_pcm(&samples, sample_rate)
    }
}

/// Encode f32 PCM (mono) to 16-bit WAV bytes.
fn encode_wav(samples: &[f32], sample_rate: u32) -> Vec<u8> {
    let data_len = samples.len() * 2;
    let mut buf = Vec::with_capacity(44 + data_len);
    // RIFF header
    buf.extend_from_slice(b"RIFF");
    buf.extend_from_slice(&(36 + data_len as u32).to_le_bytes());
    buf.extend_from_slice(b"WAVE");
    // fmt subchunk
    buf.extend_from_slice(b"fmt ");
    buf.extend_from_slice(&16u32.to_le_bytes());
    buf.extend_from_slice(&1u16.to_le_bytes()); // PCM
    buf.extend_from_slice(&1u16.to_le_bytes()); // mono
    buf.extend_from_slice(&sample_rate.to_le_bytes());
    buf.extend_from_slice(&(sample_rate * 2).to_le_bytes()); // byte rate
    buf.extend_from_slice(&2u16.to_le_bytes()); // block align
    buf.extend_from_slice(&16u16.to_le_bytes()); // bits per sample
    // data subchunk
    buf.extend_from_slice(b"data");
    buf.extend_from_slice(&(data_len as u32).to_le_bytes());
    for &s in samples {
        let i = (s.clamp(-1.0, 1.0) * 32767.0).round() as i16;
        buf.extend_from_slice(&i.to_le_bytes());
    }
    buf
}

/// Backend that records one take at a time.
#[async_trait]
pub trait CaptureBackend: Send + Sync {
    /// Whether recording is authorized. Native check: an input device exists.
    async fn request_permission(&self) -> bool;

    /// Start recording. Errors if a take is already in progress.
    async fn begin(&self) -> VoiceResult<()>;

    /// Stop recording and return the take. `None` means no usable audio.
    async fn finish(&self) -> VoiceResult<Option<CapturedAudio>>;
}

/// Capture settings for the default microphone.
#[derive(Debug, Clone)]
pub struct MicConfig {
    /// Sample rate in Hz (default 16000).
    pub sample_rate: u32,
    /// Chunk size in samples handed over by the device callback (default 480 = 30ms).
    pub buffer_size: usize,
}

impl Default for MicConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16_000,
            buffer_size: 480,
        }
    }
}

struct ActiveTake {
    stop: Arc<AtomicBool>,
    done_rx: mpsc::Receiver<Vec<f32>>,
    thread: thread::JoinHandle<()>,
}

/// Default-microphone capture via CPAL.
pub struct MicCapture {
    config: MicConfig,
    active: Mutex<Option<ActiveTake>>,
}

impl MicCapture {
    pub fn new(config: MicConfig) -> Self {
        Self {
            config,
            active: Mutex::new(None),
        }
    }

    fn take_active(&self) -> Option<ActiveTake> {
        self.active.lock().ok().and_then(|mut a| a.take())
    }
}

impl Default for MicCapture {
    fn default() -> Self {
        Self::new(MicConfig::default())
    }
}

#[async_trait]
impl CaptureBackend for MicCapture {
    async fn request_permission(&self) -> bool {
        cpal::default_host().default_input_device().is_some()
    }

    async fn begin(&self) -> VoiceResult<()> {
        let mut active = self
            .active
            .lock()
            .map_err(|e| VoiceError::Capture(e.to_string()))?;
        if active.is_some() {
            return Err(VoiceError::Capture("capture already in progress".to_string()));
        }

        let stop = Arc::new(AtomicBool::new(false));
        let (done_tx, done_rx) = mpsc::channel::<Vec<f32>>();
        let config = self.config.clone();
        let stop_flag = Arc::clone(&stop);

        // The cpal stream lives and dies on this thread.
        let handle = thread::spawn(move || {
            let Some(device) = cpal::default_host().default_input_device() else {
                warn!("MicCapture: no input device");
                let _ = done_tx.send(Vec::new());
                return;
            };
            let stream_config = StreamConfig {
                channels: 1,
                sample_rate: cpal::SampleRate(config.sample_rate),
                buffer_size: cpal::BufferSize::Fixed(config.buffer_size as u32),
            };
            let (chunk_tx, chunk_rx) = mpsc::channel::<Vec<f32>>();
            let stream = device.build_input_stream(
                &stream_config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    let _ = chunk_tx.send(data.to_vec());
                },
                |err| warn!("MicCapture: stream error: {}", err),
                None,
            );
            let stream = match stream {
                Ok(s) => s,
                Err(e) => {
                    warn!("MicCapture: failed to open stream: {}", e);
                    let _ = done_tx.send(Vec::new());
                    return;
                }
            };
            if let Err(e) = stream.play() {
                warn!("MicCapture: failed to start stream: {}", e);
                let _ = done_tx.send(Vec::new());
                return;
            }
            info!("MicCapture: recording ({} Hz)", config.sample_rate);

            let mut samples: Vec<f32> = Vec::new();
            while !stop_flag.load(Ordering::SeqCst) {
                match chunk_rx.recv_timeout(Duration::from_millis(30)) {
                    Ok(chunk) => samples.extend_from_slice(&chunk),
                    Err(mpsc::RecvTimeoutError::Timeout) => {}
                    Err(mpsc::RecvTimeoutError::Disconnected) => break,
                }
            }
            drop(stream);
            // Drain whatever the callback delivered before the stream closed.
            while let Ok(chunk) = chunk_rx.try_recv() {
                samples.extend_from_slice(&chunk);
            }
            let _ = done_tx.send(samples);
        });

        *active = Some(ActiveTake {
            stop,
            done_rx,
            thread: handle,
        });
        Ok(())
    }

    async fn finish(&self) -> VoiceResult<Option<CapturedAudio>> {
        let Some(take) = self.take_active() else {
            return Ok(None);
        };
        take.stop.store(true, Ordering::SeqCst);
        let sample_rate = self.config.sample_rate;

        let samples = tokio::task::spawn_blocking(move || {
            let samples = take
                .done_rx
                .recv_timeout(Duration::from_secs(2))
                .unwrap_or_default();
            let _ = take.thread.join();
            samples
        })
        .await
        .map_err(|e| VoiceError::Capture(e.to_string()))?;

        if samples.is_empty() {
            return Ok(None);
        }
        Ok(Some(CapturedAudio::from_pcm(&samples, sample_rate)))
    }
}

/// Scripted capture backend: replays a queue of canned takes and counts calls.
/// Use for tests and for exercising the session loop without a microphone.
pub struct ScriptedCapture {
    results: Mutex<VecDeque<Option<CapturedAudio>>>,
    permission: bool,
    begins: AtomicUsize,
    finishes: AtomicUsize,
}

impl ScriptedCapture {
    pub fn new() -> Self {
        Self {
            results: Mutex::new(VecDeque::new()),
            permission: true,
            begins: AtomicUsize::new(0),
            finishes: AtomicUsize::new(0),
        }
    }

    /// Backend that reports recording as unauthorized.
    pub fn denied() -> Self {
        Self {
            permission: false,
            ..Self::new()
        }
    }

    /// Queue the next `finish` result (`None` simulates a failed take).
    pub fn push_result(&self, result: Option<CapturedAudio>) {
        if let Ok(mut q) = self.results.lock() {
            q.push_back(result);
        }
    }

    pub fn begin_count(&self) -> usize {
        self.begins.load(Ordering::SeqCst)
    }

    pub fn finish_count(&self) -> usize {
        self.finishes.load(Ordering::SeqCst)
    }
}

impl Default for ScriptedCapture {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CaptureBackend for ScriptedCapture {
    async fn request_permission(&self) -> bool {
        self.permission
    }

    async fn begin(&self) -> VoiceResult<()> {
        self.begins.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn finish(&self) -> VoiceResult<Option<CapturedAudio>> {
        self.finishes.fetch_add(1, Ordering::SeqCst);
        let queued = self.results.lock().ok().and_then(|mut q| q.pop_front());
        Ok(queued.unwrap_or_else(|| Some(CapturedAudio::silence(500))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wav_header_is_well_formed() {
        let audio = CapturedAudio::from_pcm(&[0.0, 0.5, -0.5, 1.0], 16_000);
        assert_eq!(&audio.wav[0..4], b"RIFF");
        assert_eq!(&audio.wav[8..12], b"WAVE");
        assert_eq!(audio.wav.len(), 44 + 4 * 2);
        // data subchunk length
        let data_len = u32::from_le_bytes(audio.wav[40..44].try_into().unwrap());
        assert_eq!(data_len, 8);
    }

    #[test]
    fn silence_duration_matches() {
        let audio = CapturedAudio::silence(250);
        assert_eq!(audio.sample_rate, 16_000);
        assert_eq!(audio.duration, Duration::from_millis(250));
    }

    #[tokio::test]
    async fn scripted_capture_replays_queue() {
        let capture = ScriptedCapture::new();
        capture.push_result(None);
        capture.begin().await.unwrap();
        assert!(capture.finish().await.unwrap().is_none());
        // Empty queue falls back to silence
        capture.begin().await.unwrap();
        assert!(capture.finish().await.unwrap().is_some());
        assert_eq!(capture.begin_count(), 2);
        assert_eq!(capture.finish_count(), 2);
    }
}
