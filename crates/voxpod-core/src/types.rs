//! Shared types for the voxpod TTS worker.
//!
//! The job request/response schema lives here so that clients can depend on
//! it without pulling in tokio, reqwest, or the storage SDK.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

// ─── Defaults ──────────────────────────────────────────────────────────────

pub const DEFAULT_MODEL_PATH: &str = "microsoft/VibeVoice-Realtime-0.5B";
pub const DEFAULT_VOICE_KEY: &str = "en-Emma_woman";
pub const DEFAULT_INFERENCE_STEPS: u32 = 5;
pub const DEFAULT_VOICES_DIR: &str = "./demo/voices/streaming_model";

/// File extension of serialized voice presets.
pub const PRESET_EXTENSION: &str = "pt";

// ─── Compute device ────────────────────────────────────────────────────────

/// Device the model is placed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComputeDevice {
    Cuda { index: Option<u32> },
    Mps,
    Cpu,
}

impl ComputeDevice {
    /// Whether reduced precision and accelerated attention should be tried.
    pub fn is_accelerated(&self) -> bool {
        matches!(self, Self::Cuda { .. })
    }
}

impl fmt::Display for ComputeDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cuda { index: None } => f.write_str("cuda"),
            Self::Cuda { index: Some(i) } => write!(f, "cuda:{i}"),
            Self::Mps => f.write_str("mps"),
            Self::Cpu => f.write_str("cpu"),
        }
    }
}

impl FromStr for ComputeDevice {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_ascii_lowercase();
        match s.as_str() {
            "cuda" | "gpu" => Ok(Self::Cuda { index: None }),
            "mps" => Ok(Self::Mps),
            "cpu" => Ok(Self::Cpu),
            other => {
                if let Some(idx) = other.strip_prefix("cuda:") {
                    let index = idx
                        .parse::<u32>()
                        .map_err(|_| format!("invalid CUDA device index '{idx}'"))?;
                    Ok(Self::Cuda { index: Some(index) })
                } else {
                    Err(format!(
                        "unknown compute device '{other}'; expected cuda, cuda:N, mps, or cpu"
                    ))
                }
            }
        }
    }
}

// ─── Output format ─────────────────────────────────────────────────────────

/// Audio container the caller wants back.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum OutputFormat {
    Wav,
    #[default]
    Mp3,
    Ogg,
    Opus,
    Flac,
    Aac,
    Webm,
}

impl OutputFormat {
    pub const ALL: [OutputFormat; 7] = [
        Self::Wav,
        Self::Mp3,
        Self::Ogg,
        Self::Opus,
        Self::Flac,
        Self::Aac,
        Self::Webm,
    ];

    /// Name as it appears in job input and response metadata.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Wav => "wav",
            Self::Mp3 => "mp3",
            Self::Ogg => "ogg",
            Self::Opus => "opus",
            Self::Flac => "flac",
            Self::Aac => "aac",
            Self::Webm => "webm",
        }
    }

    /// Muxer name passed to the transcoder's `-f` flag.
    pub fn muxer(&self) -> &'static str {
        match self {
            Self::Aac => "adts",
            other => other.as_str(),
        }
    }

    /// Extension used for uploaded objects.
    pub fn extension(&self) -> &'static str {
        self.as_str()
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            Self::Wav => "audio/wav",
            Self::Mp3 => "audio/mpeg",
            Self::Ogg => "audio/ogg",
            Self::Opus => "audio/opus",
            Self::Flac => "audio/flac",
            Self::Aac => "audio/aac",
            Self::Webm => "audio/webm",
        }
    }

    /// True when the format is the container the model output is already in.
    pub fn is_source_container(&self) -> bool {
        *self == Self::Wav
    }

    fn supported_list() -> String {
        Self::ALL
            .iter()
            .map(|f| f.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OutputFormat {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|f| f.as_str() == lower)
            .ok_or_else(|| ValidationError::UnsupportedFormat {
                format: s.to_string(),
                supported: Self::supported_list(),
            })
    }
}

// ─── Job request ───────────────────────────────────────────────────────────

/// Envelope delivered by the job dispatcher.
#[derive(Debug, Clone, Deserialize)]
pub struct Job {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub input: serde_json::Value,
}

/// Raw job input, before validation.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct JobInput {
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub reference_audio: Option<String>,
    #[serde(default)]
    pub voice_key: Option<String>,
    #[serde(default)]
    pub output_format: Option<String>,
}

/// A job input that passed validation and is ready for synthesis.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TtsRequest {
    pub text: String,
    /// Accepted for compatibility; synthesis does not use it.
    pub reference_audio: Option<String>,
    /// `None` means "use the service default".
    pub voice_key: Option<String>,
    pub output_format: OutputFormat,
}

impl JobInput {
    /// Parse a loosely-typed job payload.
    pub fn from_value(value: serde_json::Value) -> Result<Self, ValidationError> {
        serde_json::from_value(value).map_err(|e| ValidationError::InvalidInput(e.to_string()))
    }

    /// Check required fields and normalize optional ones.
    pub fn validate(self) -> Result<TtsRequest, ValidationError> {
        let text = match self.text {
            Some(t) if !t.trim().is_empty() => t,
            _ => return Err(ValidationError::MissingText),
        };

        let output_format = match self.output_format.as_deref() {
            None | Some("") => OutputFormat::default(),
            Some(f) => f.parse()?,
        };

        let voice_key = self.voice_key.filter(|k| !k.trim().is_empty());

        Ok(TtsRequest {
            text,
            reference_audio: self.reference_audio,
            voice_key,
            output_format,
        })
    }
}

impl TtsRequest {
    /// Length of the submitted text in characters.
    pub fn text_length(&self) -> usize {
        self.text.chars().count()
    }
}

// ─── Job response ──────────────────────────────────────────────────────────

/// Descriptive fields attached to every successful job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobMetadata {
    pub text_length: usize,
    pub voice_key: String,
    pub model_path: String,
    pub format: String,
}

/// Where the encoded audio ended up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AudioPayload {
    /// Time-limited signed URL to the uploaded object.
    #[serde(rename = "audio_url")]
    Url(String),
    /// Inline base64 payload.
    #[serde(rename = "audio_base64")]
    Base64(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSuccess {
    pub metadata: JobMetadata,
    #[serde(flatten)]
    pub audio: AudioPayload,
}

/// What a job returns: success with audio, or an error string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum JobOutput {
    Success(JobSuccess),
    Error { error: String },
}

impl JobOutput {
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            error: message.into(),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error { .. })
    }

    pub fn error_message(&self) -> Option<&str> {
        match self {
            Self::Error { error } => Some(error),
            Self::Success(_) => None,
        }
    }

    pub fn metadata(&self) -> Option<&JobMetadata> {
        match self {
            Self::Success(s) => Some(&s.metadata),
            Self::Error { .. } => None,
        }
    }

    pub fn audio_base64(&self) -> Option<&str> {
        match self {
            Self::Success(JobSuccess {
                audio: AudioPayload::Base64(b),
                ..
            }) => Some(b),
            _ => None,
        }
    }

    pub fn audio_url(&self) -> Option<&str> {
        match self {
            Self::Success(JobSuccess {
                audio: AudioPayload::Url(u),
                ..
            }) => Some(u),
            _ => None,
        }
    }
}
