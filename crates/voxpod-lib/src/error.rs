//! Error type for every stage of a TTS job.

use std::path::PathBuf;

use voxpod_core::error::{ErrorKind, ValidationError};

use crate::backend::BackendError;

/// Failure of a job stage or of process initialization.
///
/// `Display` is the text placed in a job's `{"error": ...}` output, so
/// external diagnostics (transcoder stderr, worker responses, storage
/// errors) are carried through verbatim.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("Voice preset '{0}' not found.")]
    VoiceNotFound(String),

    #[error("failed to read voice preset '{key}' from {}: {source}", .path.display())]
    PresetRead {
        key: String,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{0}")]
    Model(#[from] BackendError),

    #[error("TTS service not initialized.")]
    NotInitialized,

    #[error("FFmpeg conversion failed: {stderr}")]
    Transcode { stderr: String },

    #[error("failed to run transcoder {}: {source}", .program.display())]
    TranscoderIo {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{0}")]
    Storage(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("{0}")]
    Startup(String),

    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl ServiceError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) | Self::VoiceNotFound(_) => ErrorKind::Validation,
            Self::PresetRead { .. } | Self::Model(_) | Self::NotInitialized | Self::Task(_) => {
                ErrorKind::ModelFailure
            }
            Self::Transcode { .. } | Self::TranscoderIo { .. } => ErrorKind::TranscodeFailure,
            Self::Storage(_) => ErrorKind::StorageFailure,
            Self::Config(_) => ErrorKind::Config,
            Self::Startup(_) => ErrorKind::Startup,
        }
    }

    /// Whether this error means the process can no longer serve jobs.
    pub fn is_fatal(&self) -> bool {
        self.kind().is_fatal()
    }
}
