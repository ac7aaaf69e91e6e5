//! Speech-to-text transcription using whisper-rs.
//!
//! Voice files are decoded to 16KHz mono PCM with ffmpeg, then run through
//! a Whisper model loaded once at startup.

use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use thiserror::Error;
use tracing::{debug, info};
use whisper_rs::{FullParams, SamplingStrategy, WhisperContext, WhisperContextParameters};

use crate::relay::generator::truncate;

#[derive(Debug, Error)]
pub enum TranscriptionError {
    #[error("no transcription model configured")]
    Unavailable,
    #[error("model file not found: {0:?}")]
    ModelNotFound(PathBuf),
    #[error("failed to load Whisper model: {0}")]
    ModelLoad(String),
    #[error("audio conversion failed: {0}")]
    Decode(String),
    #[error("Whisper transcription failed: {0}")]
    Model(String),
    #[error("transcription timed out")]
    Timeout,
    #[error("transcription task failed: {0}")]
    Task(String),
}

/// Converts a local audio file to text.
pub trait SpeechToText: Send + Sync {
    fn transcribe_file(&self, path: &Path) -> Result<String, TranscriptionError>;
}

/// Whisper transcription engine.
pub struct Whisper {
    ctx: WhisperContext,
    language: String,
}

impl Whisper {
    /// Load a Whisper model from a ggml .bin file.
    ///
    /// `language` is a hint such as "en"; `None` lets Whisper detect it.
    pub fn new(model_path: &Path, language: Option<&str>) -> Result<Self, TranscriptionError> {
        info!("Loading Whisper model from {:?}", model_path);

        if !model_path.exists() {
            return Err(TranscriptionError::ModelNotFound(model_path.to_path_buf()));
        }

        let path_str = model_path
            .to_str()
            .ok_or_else(|| TranscriptionError::ModelLoad("model path is not valid UTF-8".into()))?;
        let ctx = WhisperContext::new_with_params(path_str, WhisperContextParameters::default())
            .map_err(|e| TranscriptionError::ModelLoad(e.to_string()))?;

        info!("Whisper model loaded successfully");
        Ok(Self {
            ctx,
            language: language.unwrap_or("auto").to_string(),
        })
    }

    /// Transcribe raw 16KHz mono f32 samples.
    pub fn transcribe_pcm(&self, samples: &[f32]) -> Result<String, TranscriptionError> {
        let mut state = self
            .ctx
            .create_state()
            .map_err(|e| TranscriptionError::Model(format!("failed to create state: {e}")))?;

        let mut params = FullParams::new(SamplingStrategy::Greedy { best_of: 1 });
        params.set_language(Some(&self.language));
        params.set_translate(false);
        params.set_no_timestamps(true);
        params.set_single_segment(false);
        params.set_print_progress(false);

        state
            .full(params, samples)
            .map_err(|e| TranscriptionError::Model(e.to_string()))?;

        let mut text = String::new();
        for segment in state.as_iter() {
            if let Ok(s) = segment.to_str() {
                text.push_str(s);
                text.push(' ');
            }
        }

        let text = text.trim().to_string();
        info!("Transcribed: \"{}\"", truncate(&text, 100));
        Ok(text)
    }
}

impl SpeechToText for Whisper {
    fn transcribe_file(&self, path: &Path) -> Result<String, TranscriptionError> {
        let samples = decode_to_pcm(path)?;
        self.transcribe_pcm(&samples)
    }
}

/// Decode any ffmpeg-readable audio file to 16KHz mono f32 PCM samples.
fn decode_to_pcm(path: &Path) -> Result<Vec<f32>, TranscriptionError> {
    if !path.exists() {
        return Err(TranscriptionError::Decode(format!("audio file not found: {:?}", path)));
    }
    debug!("Decoding {:?}", path);

    let output = Command::new("ffmpeg")
        .arg("-i")
        .arg(path)
        .args([
            "-ar", "16000",
            "-ac", "1",
            "-f", "s16le",
            "-acodec", "pcm_s16le",
            "pipe:1",
        ])
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .map_err(|e| TranscriptionError::Decode(format!("failed to run ffmpeg: {e}")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(TranscriptionError::Decode(format!("ffmpeg failed: {}", stderr.trim())));
    }

    let samples = pcm_s16le_to_f32(&output.stdout);
    if samples.is_empty() {
        return Err(TranscriptionError::Decode("no audio samples decoded".into()));
    }

    debug!("Decoded {} samples", samples.len());
    Ok(samples)
}

fn pcm_s16le_to_f32(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(2)
        .map(|chunk| i16::from_le_bytes([chunk[0], chunk[1]]) as f32 / 32768.0)
        .collect()
}
