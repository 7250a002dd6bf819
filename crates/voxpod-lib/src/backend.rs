//! Call contract of the pretrained streaming speech model.
//!
//! The model library itself (tokenizer, language model, diffusion head) is
//! an external collaborator. This module pins down the narrow surface the
//! engine relies on:
//!
//! ```text
//! SpeechBackend::load_processor / load_model   (once per process)
//!     → SpeechModel::configure_scheduler, set_inference_steps
//!     → SpeechModel::load_prefilled            (once per voice)
//!     → SpeechProcessor::process_with_cached_prompt
//!     → SpeechModel::generate                   (once per job)
//! ```
//!
//! All calls are blocking; the engine runs them on the blocking pool.

use std::time::Duration;

use serde::Serialize;

/// Failure reported by a backend implementation.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    /// The backend could not be reached at all.
    #[error("model worker unreachable: {0}")]
    Unavailable(String),

    /// The backend answered with an error.
    #[error("model worker returned {status}: {body}")]
    Rejected { status: u16, body: String },

    /// The backend answered with something we cannot interpret.
    #[error("invalid model worker response: {0}")]
    InvalidResponse(String),

    #[error("{0}")]
    Other(String),
}

// ─── Load-time options ─────────────────────────────────────────────────────

/// Numeric precision of model weights.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Dtype {
    Bfloat16,
    Float32,
}

/// Attention kernel used by the language model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AttnImplementation {
    #[serde(rename = "flash_attention_2")]
    FlashAttention2,
    Sdpa,
}

impl AttnImplementation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FlashAttention2 => "flash_attention_2",
            Self::Sdpa => "sdpa",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LoadOptions {
    pub dtype: Dtype,
    pub device_map: String,
    pub attn_implementation: AttnImplementation,
}

/// Noise scheduler variant installed after the model is constructed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SchedulerConfig {
    pub algorithm_type: String,
    pub beta_schedule: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            algorithm_type: "sde-dpmsolver++".into(),
            beta_schedule: "squaredcos_cap_v2".into(),
        }
    }
}

// ─── Per-job types ─────────────────────────────────────────────────────────

/// Fixed decoding parameters for every generation call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GenerationParams {
    pub cfg_scale: f32,
    pub do_sample: bool,
    pub temperature: f32,
    pub top_p: f32,
    pub refresh_negative: bool,
    /// `None` lets the model decide where to stop.
    pub max_new_tokens: Option<usize>,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            cfg_scale: 1.5,
            do_sample: false,
            temperature: 1.0,
            top_p: 1.0,
            refresh_negative: true,
            max_new_tokens: None,
        }
    }
}

/// Opaque prefilled decoder state for one voice, resident on the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrefilledState {
    pub key: String,
    /// Backend-assigned reference to the device-resident state.
    pub handle: String,
    pub size_bytes: usize,
}

/// Model inputs assembled by the processor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModelInputs {
    pub text: String,
    pub cached_prompt: String,
    pub padding: bool,
    pub return_tensors: String,
    pub return_attention_mask: bool,
}

// ─── Traits ────────────────────────────────────────────────────────────────

/// Entry point of a model library: builds the processor and the model.
pub trait SpeechBackend: Send + Sync {
    /// Block until the compute device is initialized and the backend can
    /// accept load requests.
    fn wait_until_ready(&self, timeout: Duration) -> Result<(), BackendError>;

    fn load_processor(&self, model_path: &str) -> Result<Box<dyn SpeechProcessor>, BackendError>;

    fn load_model(
        &self,
        model_path: &str,
        options: &LoadOptions,
    ) -> Result<Box<dyn SpeechModel>, BackendError>;
}

pub trait SpeechProcessor: Send + Sync {
    fn process_with_cached_prompt(
        &self,
        text: &str,
        prompt: &PrefilledState,
    ) -> Result<ModelInputs, BackendError>;
}

pub trait SpeechModel: Send + Sync {
    fn configure_scheduler(&mut self, config: &SchedulerConfig) -> Result<(), BackendError>;

    fn set_inference_steps(&mut self, steps: u32) -> Result<(), BackendError>;

    /// Move a serialized voice preset onto the device.
    fn load_prefilled(&self, key: &str, bytes: Vec<u8>) -> Result<PrefilledState, BackendError>;

    /// Run generation and return the raw waveform.
    ///
    /// Implementations must leave `prompt` untouched so that it can be reused
    /// by later jobs.
    fn generate(
        &self,
        inputs: &ModelInputs,
        params: &GenerationParams,
        prompt: &PrefilledState,
    ) -> Result<Vec<f32>, BackendError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generation_params_are_deterministic() {
        let p = GenerationParams::default();
        assert!(!p.do_sample);
        assert_eq!(p.cfg_scale, 1.5);
        assert!(p.refresh_negative);
        assert_eq!(p.max_new_tokens, None);
    }

    #[test]
    fn load_options_serialize_like_the_model_library() {
        let opts = LoadOptions {
            dtype: Dtype::Bfloat16,
            device_map: "cuda".into(),
            attn_implementation: AttnImplementation::FlashAttention2,
        };
        let v = serde_json::to_value(&opts).unwrap();
        assert_eq!(v["dtype"], "bfloat16");
        assert_eq!(v["attn_implementation"], "flash_attention_2");
        assert_eq!(v["device_map"], "cuda");
    }

    #[test]
    fn scheduler_defaults() {
        let s = SchedulerConfig::default();
        assert_eq!(s.algorithm_type, "sde-dpmsolver++");
        assert_eq!(s.beta_schedule, "squaredcos_cap_v2");
    }
}
