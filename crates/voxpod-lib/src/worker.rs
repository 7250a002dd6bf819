//! HTTP client for the model-hosting worker.
//!
//! The worker owns the device-resident processor, model and voice states;
//! this side only holds opaque handles. Every call is blocking and must run
//! off the async executor (the engine uses `spawn_blocking`): requests are
//! sent with the async client and driven to completion on the runtime
//! captured at construction.

use std::time::{Duration, Instant};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tracing::{debug, info};

use crate::backend::{
    BackendError, GenerationParams, LoadOptions, ModelInputs, PrefilledState, SchedulerConfig,
    SpeechBackend, SpeechModel, SpeechProcessor,
};

const HEALTH_POLL: Duration = Duration::from_millis(500);
const HEALTH_REQUEST_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Clone)]
struct WorkerClient {
    http: reqwest::Client,
    base_url: String,
    runtime: Handle,
}

#[derive(Deserialize)]
struct Ack {
    ok: bool,
    #[serde(default)]
    detail: Option<String>,
}

#[derive(Deserialize)]
struct HandleResponse {
    handle: String,
}

impl WorkerClient {
    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    /// Send `request` and return the body of a 2xx response.
    fn exchange(&self, request: reqwest::RequestBuilder) -> Result<Vec<u8>, BackendError> {
        self.runtime.block_on(async {
            let resp = request
                .send()
                .await
                .map_err(|e| BackendError::Unavailable(e.to_string()))?;
            let status = resp.status();
            if !status.is_success() {
                let body = resp.text().await.unwrap_or_default();
                return Err(BackendError::Rejected {
                    status: status.as_u16(),
                    body,
                });
            }
            resp.bytes()
                .await
                .map(|b| b.to_vec())
                .map_err(|e| BackendError::Unavailable(e.to_string()))
        })
    }

    fn post_json<B: Serialize + ?Sized, R: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<R, BackendError> {
        let bytes = self.exchange(self.http.post(self.url(path)).json(body))?;
        serde_json::from_slice(&bytes)
            .map_err(|e| BackendError::InvalidResponse(format!("{path}: {e}")))
    }

    fn post_ack<B: Serialize + ?Sized>(&self, path: &str, body: &B) -> Result<(), BackendError> {
        let ack: Ack = self.post_json(path, body)?;
        if ack.ok {
            Ok(())
        } else {
            Err(BackendError::Other(
                ack.detail.unwrap_or_else(|| format!("{path} was not acknowledged")),
            ))
        }
    }
}

/// [`SpeechBackend`] backed by a worker at `base_url`.
#[derive(Clone)]
pub struct WorkerBackend {
    client: WorkerClient,
}

impl WorkerBackend {
    /// Must be called from within a Tokio runtime.
    pub fn new(base_url: impl Into<String>) -> Result<Self, BackendError> {
        let runtime = Handle::try_current()
            .map_err(|e| BackendError::Other(format!("no async runtime available: {e}")))?;
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Ok(Self {
            client: WorkerClient {
                http: reqwest::Client::new(),
                base_url,
                runtime,
            },
        })
    }

    pub fn base_url(&self) -> &str {
        &self.client.base_url
    }
}

#[derive(Serialize)]
struct LoadRequest<'a> {
    model_path: &'a str,
    #[serde(flatten)]
    options: &'a LoadOptions,
}

impl SpeechBackend for WorkerBackend {
    fn wait_until_ready(&self, timeout: Duration) -> Result<(), BackendError> {
        let url = self.client.url("/health");
        let deadline = Instant::now() + timeout;
        info!("waiting for model worker at {url}");

        loop {
            let probe = self.client.http.get(&url).timeout(HEALTH_REQUEST_TIMEOUT);
            match self.client.exchange(probe) {
                Ok(_) => {
                    info!("model worker ready");
                    return Ok(());
                }
                Err(e) => debug!("worker not ready yet: {e}"),
            }
            if Instant::now() >= deadline {
                return Err(BackendError::Unavailable(format!(
                    "{url} did not become ready within {}s",
                    timeout.as_secs()
                )));
            }
            std::thread::sleep(HEALTH_POLL);
        }
    }

    fn load_processor(&self, model_path: &str) -> Result<Box<dyn SpeechProcessor>, BackendError> {
        self.client
            .post_ack("/processor", &serde_json::json!({ "model_path": model_path }))?;
        Ok(Box::new(WorkerProcessor))
    }

    fn load_model(
        &self,
        model_path: &str,
        options: &LoadOptions,
    ) -> Result<Box<dyn SpeechModel>, BackendError> {
        self.client
            .post_ack("/model", &LoadRequest { model_path, options })?;
        Ok(Box::new(WorkerModel {
            client: self.client.clone(),
        }))
    }
}

/// Tokenization happens on the worker; this only assembles the request.
struct WorkerProcessor;

impl SpeechProcessor for WorkerProcessor {
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

struct WorkerModel {
    client: WorkerClient,
}

#[derive(Serialize)]
struct SamplingConfig {
    do_sample: bool,
    temperature: f32,
    top_p: f32,
}

#[derive(Serialize)]
struct GenerateRequest<'a> {
    #[serde(flatten)]
    inputs: &'a ModelInputs,
    cfg_scale: f32,
    generation_config: SamplingConfig,
    refresh_negative: bool,
    max_new_tokens: Option<usize>,
}

impl SpeechModel for WorkerModel {
    fn configure_scheduler(&mut self, config: &SchedulerConfig) -> Result<(), BackendError> {
        self.client.post_ack("/model/scheduler", config)
    }

    fn set_inference_steps(&mut self, steps: u32) -> Result<(), BackendError> {
        self.client
            .post_ack("/model/inference_steps", &serde_json::json!({ "num_steps": steps }))
    }

    fn load_prefilled(&self, key: &str, bytes: Vec<u8>) -> Result<PrefilledState, BackendError> {
        let size_bytes = bytes.len();
        let request = self
            .client
            .http
            .post(self.client.url("/voices"))
            .query(&[("key", key)])
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(bytes);
        let body = self.client.exchange(request)?;
        let resp: HandleResponse = serde_json::from_slice(&body)
            .map_err(|e| BackendError::InvalidResponse(format!("/voices: {e}")))?;
        Ok(PrefilledState {
            key: key.to_string(),
            handle: resp.handle,
            size_bytes,
        })
    }

    fn generate(
        &self,
        inputs: &ModelInputs,
        params: &GenerationParams,
        prompt: &PrefilledState,
    ) -> Result<Vec<f32>, BackendError> {
        if inputs.cached_prompt != prompt.handle {
            return Err(BackendError::Other(format!(
                "inputs were prepared for a different voice state than {}",
                prompt.key
            )));
        }
        let request = GenerateRequest {
            inputs,
            cfg_scale: params.cfg_scale,
            generation_config: SamplingConfig {
                do_sample: params.do_sample,
                temperature: params.temperature,
                top_p: params.top_p,
            },
            refresh_negative: params.refresh_negative,
            max_new_tokens: params.max_new_tokens,
        };
        let body = self
            .client
            .exchange(self.client.http.post(self.client.url("/generate")).json(&request))?;
        decode_samples(&body)
    }
}

/// Little-endian `f32` samples.
pub fn decode_samples(bytes: &[u8]) -> Result<Vec<f32>, BackendError> {
    if bytes.len() % 4 != 0 {
        return Err(BackendError::InvalidResponse(format!(
            "waveform length {} is not a multiple of 4",
            bytes.len()
        )));
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}
