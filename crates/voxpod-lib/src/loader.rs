//! One-time construction of the processor and the generation model.

use tracing::{info, warn};

use voxpod_core::types::ComputeDevice;

use crate::backend::{
    AttnImplementation, Dtype, LoadOptions, SchedulerConfig, SpeechBackend, SpeechModel,
    SpeechProcessor,
};
use crate::config::ServiceConfig;
use crate::error::ServiceError;

/// Processor and model, ready for generation.
pub struct LoadedModel {
    pub processor: Box<dyn SpeechProcessor>,
    pub model: Box<dyn SpeechModel>,
    /// Options the model was actually loaded with (after any fallback).
    pub options: LoadOptions,
}

/// Preferred load options for a device: bf16 + flash attention on CUDA,
/// fp32 + SDPA everywhere else.
pub fn preferred_options(device: ComputeDevice) -> LoadOptions {
    if device.is_accelerated() {
        LoadOptions {
            dtype: Dtype::Bfloat16,
            device_map: device.to_string(),
            attn_implementation: AttnImplementation::FlashAttention2,
        }
    } else {
        LoadOptions {
            dtype: Dtype::Float32,
            device_map: device.to_string(),
            attn_implementation: AttnImplementation::Sdpa,
        }
    }
}

/// Load processor and model, then install the scheduler and step count.
///
/// If the model fails to load with the preferred attention kernel, one more
/// attempt is made with SDPA. Every error returned here is fatal.
pub fn load(backend: &dyn SpeechBackend, config: &ServiceConfig) -> Result<LoadedModel, ServiceError> {
    let path = config.model_path.as_str();

    info!("loading processor from {path}");
    let processor = backend
        .load_processor(path)
        .map_err(|e| ServiceError::Startup(format!("failed to load processor from {path}: {e}")))?;

    let primary = preferred_options(config.device);
    info!(
        "loading model: device_map={}, dtype={:?}, attn_implementation={}",
        primary.device_map,
        primary.dtype,
        primary.attn_implementation.as_str()
    );

    let (mut model, options) = match backend.load_model(path, &primary) {
        Ok(model) => (model, primary),
        Err(e) if primary.attn_implementation != AttnImplementation::Sdpa => {
            warn!(
                "error loading model with {}, falling back to sdpa: {e}",
                primary.attn_implementation.as_str()
            );
            let fallback = LoadOptions {
                attn_implementation: AttnImplementation::Sdpa,
                ..primary
            };
            let model = backend.load_model(path, &fallback).map_err(|e| {
                ServiceError::Startup(format!("failed to load model from {path} with sdpa: {e}"))
            })?;
            info!("model loaded with sdpa");
            (model, fallback)
        }
        Err(e) => {
            return Err(ServiceError::Startup(format!(
                "failed to load model from {path}: {e}"
            )));
        }
    };

    let scheduler = SchedulerConfig::default();
    model
        .configure_scheduler(&scheduler)
        .map_err(|e| ServiceError::Startup(format!("failed to configure noise scheduler: {e}")))?;
    model
        .set_inference_steps(config.inference_steps)
        .map_err(|e| ServiceError::Startup(format!("failed to set inference steps: {e}")))?;
    info!(
        "scheduler {} / {}, {} inference steps",
        scheduler.algorithm_type, scheduler.beta_schedule, config.inference_steps
    );

    Ok(LoadedModel {
        processor,
        model,
        options,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeBackend;

    fn config(device: ComputeDevice) -> ServiceConfig {
        ServiceConfig {
            device,
            inference_steps: 7,
            ..Default::default()
        }
    }

    #[test]
    fn cuda_prefers_bf16_flash() {
        let opts = preferred_options(ComputeDevice::Cuda { index: None });
        assert_eq!(opts.dtype, Dtype::Bfloat16);
        assert_eq!(opts.attn_implementation, AttnImplementation::FlashAttention2);
        assert_eq!(opts.device_map, "cuda");
    }

    #[test]
    fn cpu_and_mps_are_portable() {
        for device in [ComputeDevice::Cpu, ComputeDevice::Mps] {
            let opts = preferred_options(device);
            assert_eq!(opts.dtype, Dtype::Float32);
            assert_eq!(opts.attn_implementation, AttnImplementation::Sdpa);
        }
    }

    #[test]
    fn configures_scheduler_and_steps() {
        let backend = FakeBackend::default();
        let loaded = load(&backend, &config(ComputeDevice::Cpu)).unwrap();
        assert_eq!(loaded.options.attn_implementation, AttnImplementation::Sdpa);
        let events = backend.events();
        assert!(events.contains(&"scheduler:sde-dpmsolver++/squaredcos_cap_v2".to_string()));
        assert!(events.contains(&"steps:7".to_string()));
        assert_eq!(backend.model_loads(), 1);
    }

    #[test]
    fn falls_back_to_sdpa_when_flash_fails() {
        let backend = FakeBackend::default().rejecting_attn(AttnImplementation::FlashAttention2);
        let loaded = load(&backend, &config(ComputeDevice::Cuda { index: None })).unwrap();
        assert_eq!(loaded.options.attn_implementation, AttnImplementation::Sdpa);
        assert_eq!(loaded.options.dtype, Dtype::Bfloat16);
        assert_eq!(backend.model_loads(), 2);
    }

    #[test]
    fn sdpa_failure_is_fatal() {
        let backend = FakeBackend::default().rejecting_attn(AttnImplementation::Sdpa);
        let err = load(&backend, &config(ComputeDevice::Cpu)).err().unwrap();
        assert!(err.is_fatal());
        assert_eq!(backend.model_loads(), 1);
    }
}
