//! Job entry point.
//!
//! The first job in a process initializes the [`TtsService`]; concurrent
//! first jobs wait on the same initialization. Startup runs on its own
//! blocking task, so a job that is dropped mid-startup leaves the load
//! running for the next caller to pick up. Every later job goes straight to:
//!
//! ```text
//! validate → infer (blocking pool) → transcode → publish
//! ```
//!
//! Per-job failures become `{"error": ...}` outputs. Only initialization
//! failures are returned as `Err`, since the process cannot serve anything
//! after them.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, OnceCell};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use voxpod_core::types::{Job, JobInput, JobMetadata, JobOutput, JobSuccess};

use crate::backend::SpeechBackend;
use crate::config::{AppConfig, DEFAULT_READY_TIMEOUT_SECS, ServiceConfig};
use crate::error::ServiceError;
use crate::inference::TtsService;
use crate::publish::ResultPublisher;
use crate::transcode::Transcoder;
use crate::worker::WorkerBackend;

pub struct Handler {
    config: ServiceConfig,
    ready_timeout: Duration,
    backend: Arc<dyn SpeechBackend>,
    transcoder: Transcoder,
    publisher: ResultPublisher,
    service: OnceCell<Arc<TtsService>>,
    startup: Mutex<Option<JoinHandle<Result<TtsService, ServiceError>>>>,
}

impl Handler {
    pub fn new(
        config: ServiceConfig,
        backend: Arc<dyn SpeechBackend>,
        transcoder: Transcoder,
        publisher: ResultPublisher,
    ) -> Self {
        Self {
            config,
            ready_timeout: Duration::from_secs(DEFAULT_READY_TIMEOUT_SECS),
            backend,
            transcoder,
            publisher,
            service: OnceCell::new(),
            startup: Mutex::new(None),
        }
    }

    /// How long initialization waits for the compute device.
    pub fn with_ready_timeout(mut self, timeout: Duration) -> Self {
        self.ready_timeout = timeout;
        self
    }

    /// Wire up the HTTP worker backend, ffmpeg and the configured publisher.
    /// Must be called from within a Tokio runtime.
    pub async fn from_config(config: &AppConfig) -> Result<Self, ServiceError> {
        let backend = WorkerBackend::new(config.worker.url.clone())
            .map_err(|e| ServiceError::Startup(e.to_string()))?;
        let publisher = ResultPublisher::from_config(&config.storage).await;
        Ok(Self::new(
            config.service.clone(),
            Arc::new(backend),
            Transcoder::from_config(&config.transcode),
            publisher,
        )
        .with_ready_timeout(config.worker.ready_timeout))
    }

    pub fn is_ready(&self) -> bool {
        self.service.initialized()
    }

    /// The initialized service, if the first job has completed startup.
    pub fn service(&self) -> Result<&Arc<TtsService>, ServiceError> {
        self.service.get().ok_or(ServiceError::NotInitialized)
    }

    /// Initialize on first use. A failed attempt leaves the handler
    /// uninitialized and the next job retries.
    pub async fn ensure_ready(&self) -> Result<&Arc<TtsService>, ServiceError> {
        if let Some(service) = self.service.get() {
            return Ok(service);
        }

        let mut startup = self.startup.lock().await;
        if let Some(service) = self.service.get() {
            return Ok(service);
        }

        let task = startup.get_or_insert_with(|| {
            info!("initializing tts service");
            let backend = self.backend.clone();
            let config = self.config.clone();
            let timeout = self.ready_timeout;
            tokio::task::spawn_blocking(move || {
                TtsService::initialize(backend.as_ref(), &config, timeout)
            })
        });
        // A caller dropped while waiting here leaves the task in `startup`.
        let result = task.await;
        *startup = None;

        let service = Arc::new(result??);
        Ok(self.service.get_or_init(|| async move { service }).await)
    }

    /// Run one job.
    pub async fn handle(&self, job: Job) -> Result<JobOutput, ServiceError> {
        let service = self.ensure_ready().await.inspect_err(|e| {
            error!("initialization failed: {e}");
        })?;
        let job_id = job.id.unwrap_or_else(|| "-".into());

        let t0 = Instant::now();
        match self.run(service, job.input).await {
            Ok(output) => {
                info!("job {job_id} completed in {:?}", t0.elapsed());
                Ok(output)
            }
            Err(e) if e.is_fatal() => {
                error!("job {job_id}: fatal: {e}");
                Err(e)
            }
            Err(e) => {
                error!("job {job_id} failed ({:?}): {e}", e.kind());
                Ok(JobOutput::error(e.to_string()))
            }
        }
    }

    async fn run(
        &self,
        service: &Arc<TtsService>,
        input: serde_json::Value,
    ) -> Result<JobOutput, ServiceError> {
        let request = JobInput::from_value(input)?.validate()?;
        if let Some(reference) = &request.reference_audio {
            debug!("reference_audio supplied ({} chars), not used", reference.len());
        }
        let format = request.output_format;

        let synthesis = {
            let service = service.clone();
            let text = request.text.clone();
            let voice = request.voice_key.clone();
            tokio::task::spawn_blocking(move || service.infer(&text, voice.as_deref())).await??
        };

        let audio = self.transcoder.convert(synthesis.wav, format).await?;
        let audio = self.publisher.publish(audio, format).await?;

        Ok(JobOutput::Success(JobSuccess {
            metadata: JobMetadata {
                text_length: request.text_length(),
                voice_key: synthesis.voice_key,
                model_path: service.model_id().to_string(),
                format: format.to_string(),
            },
            audio,
        }))
    }
}
