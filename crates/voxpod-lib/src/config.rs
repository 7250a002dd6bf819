//! Process configuration, read once at start and immutable afterwards.

use std::path::PathBuf;
use std::time::Duration;

use voxpod_core::types::{
    ComputeDevice, DEFAULT_INFERENCE_STEPS, DEFAULT_MODEL_PATH, DEFAULT_VOICE_KEY,
    DEFAULT_VOICES_DIR,
};

use crate::error::ServiceError;

pub const DEFAULT_WORKER_URL: &str = "http://127.0.0.1:3055";
pub const DEFAULT_READY_TIMEOUT_SECS: u64 = 600;
pub const DEFAULT_FFMPEG: &str = "ffmpeg";

/// Model and voice settings.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub model_path: String,
    pub device: ComputeDevice,
    pub inference_steps: u32,
    pub default_voice_key: String,
    pub voices_dir: PathBuf,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            model_path: DEFAULT_MODEL_PATH.into(),
            device: ComputeDevice::Cuda { index: None },
            inference_steps: DEFAULT_INFERENCE_STEPS,
            default_voice_key: DEFAULT_VOICE_KEY.into(),
            voices_dir: PathBuf::from(DEFAULT_VOICES_DIR),
        }
    }
}

impl ServiceConfig {
    /// Identifier reported in job metadata: the last component of the
    /// checkpoint path (`microsoft/VibeVoice-Realtime-0.5B` → `VibeVoice-Realtime-0.5B`).
    pub fn model_id(&self) -> String {
        self.model_path
            .trim_end_matches(['/', '\\'])
            .rsplit(['/', '\\'])
            .next()
            .unwrap_or_default()
            .to_string()
    }
}

/// Where the model-hosting worker lives and how to start it.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub url: String,
    /// Sidecar to spawn; `None` means the worker is managed externally.
    pub command: Option<PathBuf>,
    pub ready_timeout: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_WORKER_URL.into(),
            command: None,
            ready_timeout: Duration::from_secs(DEFAULT_READY_TIMEOUT_SECS),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TranscodeConfig {
    pub ffmpeg_path: PathBuf,
}

impl Default for TranscodeConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: PathBuf::from(DEFAULT_FFMPEG),
        }
    }
}

/// Object storage settings. Storage mode is on iff `bucket_name` is set.
#[derive(Debug, Clone, Default)]
pub struct StorageConfig {
    pub bucket_name: Option<String>,
    pub endpoint_url: Option<String>,
}

impl StorageConfig {
    pub fn enabled(&self) -> bool {
        self.bucket_name.is_some()
    }
}

#[derive(Debug, Clone, Default)]
pub struct AppConfig {
    pub service: ServiceConfig,
    pub worker: WorkerConfig,
    pub transcode: TranscodeConfig,
    pub storage: StorageConfig,
}

impl AppConfig {
    /// Read configuration from the process environment.
    pub fn from_env() -> Result<Self, ServiceError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build configuration from an arbitrary variable source. Empty values
    /// count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ServiceError> {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        let defaults = Self::default();

        let device = match get("MODEL_DEVICE") {
            Some(d) => d.parse().map_err(ServiceError::Config)?,
            None => defaults.service.device,
        };

        let inference_steps = match get("INFERENCE_STEPS") {
            Some(s) => parse_steps(&s)?,
            None => defaults.service.inference_steps,
        };

        let ready_timeout = match get("MODEL_WORKER_READY_TIMEOUT_SECS") {
            Some(s) => Duration::from_secs(s.trim().parse().map_err(|_| {
                ServiceError::Config(format!("MODEL_WORKER_READY_TIMEOUT_SECS must be an integer, got '{s}'"))
            })?),
            None => defaults.worker.ready_timeout,
        };

        Ok(Self {
            service: ServiceConfig {
                model_path: get("MODEL_PATH").unwrap_or(defaults.service.model_path),
                device,
                inference_steps,
                default_voice_key: get("DEFAULT_VOICE").unwrap_or(defaults.service.default_voice_key),
                voices_dir: get("VOICES_DIR")
                    .map(PathBuf::from)
                    .unwrap_or(defaults.service.voices_dir),
            },
            worker: WorkerConfig {
                url: get("MODEL_WORKER_URL").unwrap_or(defaults.worker.url),
                command: get("MODEL_WORKER_CMD").map(PathBuf::from),
                ready_timeout,
            },
            transcode: TranscodeConfig {
                ffmpeg_path: get("FFMPEG_PATH")
                    .map(PathBuf::from)
                    .unwrap_or(defaults.transcode.ffmpeg_path),
            },
            storage: StorageConfig {
                bucket_name: get("BUCKET_NAME"),
                endpoint_url: get("BUCKET_ENDPOINT_URL"),
            },
        })
    }
}

/// Parse a denoising step count; zero is rejected.
pub fn parse_steps(s: &str) -> Result<u32, ServiceError> {
    match s.trim().parse::<u32>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(ServiceError::Config(format!(
            "INFERENCE_STEPS must be a positive integer, got '{s}'"
        ))),
    }
}
