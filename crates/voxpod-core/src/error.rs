//! Error taxonomy shared by every voxpod component.

use serde::Serialize;

/// Message returned when a job carries no usable text.
pub const NO_TEXT_MESSAGE: &str = "No text provided for TTS.";

/// Broad classification of a failure, independent of its message.
///
/// Callers use this to decide between retrying a job and giving up on the
/// process without inspecting error strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The job payload was malformed or incomplete.
    Validation,
    /// The model rejected the input or failed during generation.
    ModelFailure,
    /// The external transcoder could not be run or exited non-zero.
    TranscodeFailure,
    /// Object-storage configuration or upload failed.
    StorageFailure,
    /// Process configuration could not be parsed.
    Config,
    /// One-time initialization failed; no job can succeed in this process.
    Startup,
}

impl ErrorKind {
    /// Whether resubmitting the same job might succeed.
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::ModelFailure | Self::StorageFailure)
    }

    /// Whether the process should stop serving after this error.
    pub fn is_fatal(self) -> bool {
        matches!(self, Self::Config | Self::Startup)
    }
}

/// Rejection of a job payload at the request boundary.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("No text provided for TTS.")]
    MissingText,

    #[error("Invalid job input: {0}")]
    InvalidInput(String),

    #[error("Unsupported output format '{format}'; supported: {supported}")]
    UnsupportedFormat { format: String, supported: String },
}
