//! In-memory backend and object store for tests.
//!
//! **Note:** not part of the stable API. Exposed so that integration tests
//! and downstream crates can drive the handler without a model worker or a
//! storage bucket.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::backend::{
    AttnImplementation, BackendError, GenerationParams, LoadOptions, ModelInputs, PrefilledState,
    SchedulerConfig, SpeechBackend, SpeechModel, SpeechProcessor,
};
use crate::error::ServiceError;
use crate::publish::ObjectStore;

#[derive(Default)]
struct Shared {
    events: Mutex<Vec<String>>,
    model_loads: AtomicUsize,
    prefill_calls: AtomicUsize,
    generate_calls: AtomicUsize,
    last_inputs: Mutex<Option<ModelInputs>>,
}

impl Shared {
    fn record(&self, event: impl Into<String>) {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event.into());
    }
}

/// A short deterministic waveform.
pub fn tone(samples: usize) -> Vec<f32> {
    (0..samples).map(|i| (i as f32 * 0.05).sin() * 0.5).collect()
}

/// Backend that records calls and generates a fixed waveform.
#[derive(Clone)]
pub struct FakeBackend {
    shared: Arc<Shared>,
    reject_attn: Option<AttnImplementation>,
    generate_error: Option<String>,
    never_ready: bool,
    ready_delay: Duration,
    waveform: Arc<Vec<f32>>,
}

impl Default for FakeBackend {
    fn default() -> Self {
        Self {
            shared: Arc::default(),
            reject_attn: None,
            generate_error: None,
            never_ready: false,
            ready_delay: Duration::ZERO,
            waveform: Arc::new(tone(2_400)),
        }
    }
}

impl FakeBackend {
    /// Fail any model load that asks for `attn`.
    pub fn rejecting_attn(mut self, attn: AttnImplementation) -> Self {
        self.reject_attn = Some(attn);
        self
    }

    /// Fail every generation call with `message`.
    pub fn failing_generation(mut self, message: impl Into<String>) -> Self {
        self.generate_error = Some(message.into());
        self
    }

    /// Never report the device as ready.
    pub fn never_ready(mut self) -> Self {
        self.never_ready = true;
        self
    }

    /// Block in `wait_until_ready` for `delay` before answering.
    pub fn with_ready_delay(mut self, delay: Duration) -> Self {
        self.ready_delay = delay;
        self
    }

    pub fn with_waveform(mut self, waveform: Vec<f32>) -> Self {
        self.waveform = Arc::new(waveform);
        self
    }

    pub fn events(&self) -> Vec<String> {
        self.shared
            .events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn model_loads(&self) -> usize {
        self.shared.model_loads.load(Ordering::SeqCst)
    }

    pub fn prefill_calls(&self) -> usize {
        self.shared.prefill_calls.load(Ordering::SeqCst)
    }

    pub fn generate_calls(&self) -> usize {
        self.shared.generate_calls.load(Ordering::SeqCst)
    }

    pub fn last_inputs(&self) -> Option<ModelInputs> {
        self.shared
            .last_inputs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

impl SpeechBackend for FakeBackend {
    fn wait_until_ready(&self, timeout: Duration) -> Result<(), BackendError> {
        std::thread::sleep(self.ready_delay);
        self.shared.record("ready");
        if self.never_ready {
            return Err(BackendError::Unavailable(format!(
                "device not ready after {}s",
                timeout.as_secs()
            )));
        }
        Ok(())
    }

    fn load_processor(&self, model_path: &str) -> Result<Box<dyn SpeechProcessor>, BackendError> {
        self.shared.record(format!("processor:{model_path}"));
        Ok(Box::new(FakeProcessor))
    }

    fn load_model(
        &self,
        model_path: &str,
        options: &LoadOptions,
    ) -> Result<Box<dyn SpeechModel>, BackendError> {
        self.shared.model_loads.fetch_add(1, Ordering::SeqCst);
        self.shared.record(format!(
            "model:{model_path}:{}",
            options.attn_implementation.as_str()
        ));
        if self.reject_attn == Some(options.attn_implementation) {
            return Err(BackendError::Rejected {
                status: 500,
                body: format!("{} is not available", options.attn_implementation.as_str()),
            });
        }
        Ok(Box::new(FakeModel {
            shared: self.shared.clone(),
            generate_error: self.generate_error.clone(),
            waveform: self.waveform.clone(),
        }))
    }
}

struct FakeProcessor;

impl SpeechProcessor for FakeProcessor {
    fn process_with_cached_prompt(
        &self,
        text: &str,
        prompt: &PrefilledState,
    ) -> Result<ModelInputs, BackendError> {
        Ok(ModelInputs {
            text: text.to_string(),
            cached_prompt: prompt.handle.clone(),
            padding: true,
            return_tensors: "pt".into(),
            return_attention_mask: true,
        })
    }
}

/// Model half of [`FakeBackend`]; also usable on its own.
pub struct FakeModel {
    shared: Arc<Shared>,
    generate_error: Option<String>,
    waveform: Arc<Vec<f32>>,
}

impl Default for FakeModel {
    fn default() -> Self {
        Self {
            shared: Arc::default(),
            generate_error: None,
            waveform: Arc::new(tone(2_400)),
        }
    }
}

impl FakeModel {
    pub fn prefill_calls(&self) -> usize {
        self.shared.prefill_calls.load(Ordering::SeqCst)
    }
}

impl SpeechModel for FakeModel {
    fn configure_scheduler(&mut self, config: &SchedulerConfig) -> Result<(), BackendError> {
        self.shared.record(format!(
            "scheduler:{}/{}",
            config.algorithm_type, config.beta_schedule
        ));
        Ok(())
    }

    fn set_inference_steps(&mut self, steps: u32) -> Result<(), BackendError> {
        self.shared.record(format!("steps:{steps}"));
        Ok(())
    }

    fn load_prefilled(&self, key: &str, bytes: Vec<u8>) -> Result<PrefilledState, BackendError> {
        let n = self.shared.prefill_calls.fetch_add(1, Ordering::SeqCst);
        self.shared.record(format!("prefill:{key}"));
        Ok(PrefilledState {
            key: key.to_string(),
            handle: format!("voice-{n}"),
            size_bytes: bytes.len(),
        })
    }

    fn generate(
        &self,
        inputs: &ModelInputs,
        params: &GenerationParams,
        prompt: &PrefilledState,
    ) -> Result<Vec<f32>, BackendError> {
        self.shared.generate_calls.fetch_add(1, Ordering::SeqCst);
        self.shared.record(format!(
            "generate:{}:cfg={}:sample={}",
            prompt.key, params.cfg_scale, params.do_sample
        ));
        *self
            .shared
            .last_inputs
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(inputs.clone());
        match &self.generate_error {
            Some(message) => Err(BackendError::Other(message.clone())),
            None => Ok(self.waveform.as_ref().clone()),
        }
    }
}

/// Object store that keeps uploads in memory and signs fake URLs.
#[derive(Clone, Default)]
pub struct MemoryStore {
    objects: Arc<Mutex<HashMap<String, (Vec<u8>, String)>>>,
    fail_with: Option<String>,
}

impl MemoryStore {
    /// Fail every upload with `message`.
    pub fn failing(message: impl Into<String>) -> Self {
        Self {
            fail_with: Some(message.into()),
            ..Self::default()
        }
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<_> = self
            .objects
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        keys.sort();
        keys
    }

    /// Body and content type of an uploaded object.
    pub fn get(&self, key: &str) -> Option<(Vec<u8>, String)> {
        self.objects
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned()
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn put(&self, key: &str, body: Vec<u8>, content_type: &str) -> Result<(), ServiceError> {
        if let Some(message) = &self.fail_with {
            return Err(ServiceError::Storage(message.clone()));
        }
        self.objects
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.to_string(), (body, content_type.to_string()));
        Ok(())
    }

    async fn presign_get(&self, key: &str, expires_in: Duration) -> Result<String, ServiceError> {
        Ok(format!(
            "https://storage.test/bucket/{key}?X-Amz-Expires={}",
            expires_in.as_secs()
        ))
    }
}
