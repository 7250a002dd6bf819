//! Inference service: text plus a cached voice in, WAV bytes out.
//!
//! Built once per process by [`TtsService::initialize`]:
//!
//! ```text
//! wait for device → discover presets → load processor/model → warm default voice
//! ```
//!
//! After that the service is shared read-only; the only interior mutation
//! is the preset cache filling in voices on first use.

use std::time::{Duration, Instant};

use tracing::{debug, info};

use voxpod_core::wav;

use crate::backend::{
    GenerationParams, LoadOptions, SpeechBackend, SpeechModel, SpeechProcessor,
};
use crate::config::ServiceConfig;
use crate::error::ServiceError;
use crate::loader;
use crate::presets::VoicePresetCache;

/// Result of one generation call.
#[derive(Debug, Clone)]
pub struct Synthesis {
    /// Mono 16-bit WAV container.
    pub wav: Vec<u8>,
    /// Voice that was actually used.
    pub voice_key: String,
    pub samples: usize,
}

pub struct TtsService {
    model_id: String,
    processor: Box<dyn SpeechProcessor>,
    model: Box<dyn SpeechModel>,
    load_options: LoadOptions,
    presets: VoicePresetCache,
    params: GenerationParams,
}

impl TtsService {
    /// Bring up the model and voice presets. Blocking; any error is fatal.
    pub fn initialize(
        backend: &dyn SpeechBackend,
        config: &ServiceConfig,
        ready_timeout: Duration,
    ) -> Result<Self, ServiceError> {
        let t0 = Instant::now();

        backend.wait_until_ready(ready_timeout).map_err(|e| {
            ServiceError::Startup(format!("compute device did not become ready: {e}"))
        })?;

        let presets = VoicePresetCache::discover(&config.voices_dir, &config.default_voice_key)?;
        let loaded = loader::load(backend, config)?;

        let service = Self {
            model_id: config.model_id(),
            processor: loaded.processor,
            model: loaded.model,
            load_options: loaded.options,
            presets,
            params: GenerationParams::default(),
        };

        service
            .presets
            .ensure_cached(service.presets.default_key(), service.model.as_ref())
            .map_err(|e| ServiceError::Startup(format!("failed to load default voice: {e}")))?;

        info!(
            "tts service ready in {:?} (model {}, default voice {})",
            t0.elapsed(),
            service.model_id,
            service.presets.default_key()
        );
        Ok(service)
    }

    /// Identifier reported in job metadata.
    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    pub fn load_options(&self) -> &LoadOptions {
        &self.load_options
    }

    pub fn presets(&self) -> &VoicePresetCache {
        &self.presets
    }

    /// Voice that a job asking for `requested` will be synthesized with.
    pub fn resolve_voice<'a>(&'a self, requested: Option<&'a str>) -> &'a str {
        self.presets.resolve(requested)
    }

    /// Synthesize `text` with `voice_key` (or the default voice).
    pub fn infer(&self, text: &str, voice_key: Option<&str>) -> Result<Synthesis, ServiceError> {
        let t0 = Instant::now();
        let voice = self.resolve_voice(voice_key).to_string();
        let prompt = self.presets.ensure_cached(&voice, self.model.as_ref())?;

        let inputs = self
            .processor
            .process_with_cached_prompt(text.trim(), &prompt)?;
        let waveform = self.model.generate(&inputs, &self.params, &prompt)?;

        debug!(
            "generated {} samples for {} chars with {voice} in {:?}",
            waveform.len(),
            inputs.text.len(),
            t0.elapsed()
        );

        Ok(Synthesis {
            wav: wav::encode_waveform(&waveform),
            voice_key: voice,
            samples: waveform.len(),
        })
    }
}
