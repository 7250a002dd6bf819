//! voxpod CLI: serverless TTS worker.
//!
//! ```text
//! voxpod serve [--host 0.0.0.0] [--port 8000] [--warm]
//! voxpod run --job job.json [--out speech.mp3]
//! voxpod speak "hello world" [--voice en-Carter_man] [--format wav] [--server http://localhost:8000]
//! voxpod health [--server ...]
//! ```
//!
//! Every engine setting can be given as a flag or through its environment
//! variable (`MODEL_PATH`, `BUCKET_NAME`, ...).

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use base64::Engine;
use clap::{Args, Parser, Subcommand};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use voxpod_lib::config::AppConfig;
use voxpod_lib::manager::WorkerManager;
use voxpod_lib::voxpod_core::types::{Job, JobOutput};
use voxpod_lib::{Handler, ServiceError, server};

/// voxpod: text-to-speech job worker
#[derive(Parser)]
#[command(name = "voxpod", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve the job API
    Serve {
        /// Listen port
        #[arg(long, env = "PORT", default_value = "8000")]
        port: u16,
        /// Listen host
        #[arg(long, default_value = "0.0.0.0")]
        host: String,
        /// Load the model before accepting jobs
        #[arg(long)]
        warm: bool,
        #[command(flatten)]
        config: ConfigArgs,
    },
    /// Run a single job in-process and print its output
    Run {
        /// Job file: `{"input": {...}}` or a bare input object
        #[arg(long)]
        job: PathBuf,
        /// Write inline audio here
        #[arg(long)]
        out: Option<PathBuf>,
        #[command(flatten)]
        config: ConfigArgs,
    },
    /// Submit text to a running server
    Speak {
        text: String,
        #[arg(long)]
        voice: Option<String>,
        #[arg(long, default_value = "mp3")]
        format: String,
        #[arg(long, default_value = "http://localhost:8000")]
        server: String,
    },
    /// Show server readiness
    Health {
        #[arg(long, default_value = "http://localhost:8000")]
        server: String,
    },
}

#[derive(Args)]
struct ConfigArgs {
    /// Model checkpoint
    #[arg(long, env = "MODEL_PATH")]
    model_path: Option<String>,
    /// cuda, cuda:N, mps or cpu
    #[arg(long, env = "MODEL_DEVICE")]
    device: Option<String>,
    /// Denoising steps per generation
    #[arg(long, env = "INFERENCE_STEPS")]
    inference_steps: Option<String>,
    #[arg(long, env = "DEFAULT_VOICE")]
    default_voice: Option<String>,
    /// Directory of `.pt` voice presets
    #[arg(long, env = "VOICES_DIR")]
    voices_dir: Option<String>,
    /// Model worker base URL
    #[arg(long, env = "MODEL_WORKER_URL")]
    worker_url: Option<String>,
    /// Spawn this model worker sidecar
    #[arg(long, env = "MODEL_WORKER_CMD")]
    worker_cmd: Option<String>,
    #[arg(long, env = "MODEL_WORKER_READY_TIMEOUT_SECS")]
    worker_ready_timeout: Option<String>,
    #[arg(long, env = "FFMPEG_PATH")]
    ffmpeg: Option<String>,
    /// Upload results to this bucket instead of returning them inline
    #[arg(long, env = "BUCKET_NAME")]
    bucket: Option<String>,
    #[arg(long, env = "BUCKET_ENDPOINT_URL")]
    bucket_endpoint: Option<String>,
}

impl ConfigArgs {
    fn into_config(self) -> Result<AppConfig, ServiceError> {
        AppConfig::from_lookup(|name| match name {
            "MODEL_PATH" => self.model_path.clone(),
            "MODEL_DEVICE" => self.device.clone(),
            "INFERENCE_STEPS" => self.inference_steps.clone(),
            "DEFAULT_VOICE" => self.default_voice.clone(),
            "VOICES_DIR" => self.voices_dir.clone(),
            "MODEL_WORKER_URL" => self.worker_url.clone(),
            "MODEL_WORKER_CMD" => self.worker_cmd.clone(),
            "MODEL_WORKER_READY_TIMEOUT_SECS" => self.worker_ready_timeout.clone(),
            "FFMPEG_PATH" => self.ffmpeg.clone(),
            "BUCKET_NAME" => self.bucket.clone(),
            "BUCKET_ENDPOINT_URL" => self.bucket_endpoint.clone(),
            _ => None,
        })
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Command::Serve {
            port,
            host,
            warm,
            config,
        } => serve(&host, port, warm, config).await,
        Command::Run { job, out, config } => run(&job, out.as_deref(), config).await,
        Command::Speak {
            text,
            voice,
            format,
            server,
        } => {
            let input = serde_json::json!({
                "text": text,
                "voice_key": voice,
                "output_format": format,
            });
            print_response(
                reqwest::Client::new()
                    .post(format!("{server}/runsync"))
                    .json(&serde_json::json!({ "input": input })),
            )
            .await
        }
        Command::Health { server } => {
            print_response(reqwest::Client::new().get(format!("{server}/health"))).await
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn serve(host: &str, port: u16, warm: bool, config: ConfigArgs) -> Result<()> {
    let config = config.into_config().context("invalid configuration")?;
    let listener = tokio::net::TcpListener::bind((host, port))
        .await
        .with_context(|| format!("failed to bind {host}:{port}"))?;

    let workers = WorkerManager::default();
    workers
        .start(&config.worker)
        .await
        .context("failed to start model worker")?;

    let result = async {
        let handler = Arc::new(Handler::from_config(&config).await?);
        if warm {
            handler.ensure_ready().await?;
        }
        server::serve(listener, handler).await
    }
    .await;

    workers.stop().await;
    Ok(result?)
}

async fn run(job_path: &Path, out: Option<&Path>, config: ConfigArgs) -> Result<()> {
    let config = config.into_config().context("invalid configuration")?;
    let job = read_job(job_path).await?;

    let workers = WorkerManager::default();
    workers
        .start(&config.worker)
        .await
        .context("failed to start model worker")?;
    let result = async { Handler::from_config(&config).await?.handle(job).await }.await;
    workers.stop().await;
    let output = result.context("job could not be run")?;

    println!("{}", serde_json::to_string_pretty(&output)?);
    if let Some(path) = out {
        write_audio(&output, path).await?;
    }
    Ok(())
}

async fn read_job(path: &Path) -> Result<Job> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))?;
    let value: serde_json::Value = serde_json::from_str(&raw)
        .with_context(|| format!("{} is not valid JSON", path.display()))?;
    if value.get("input").is_some() {
        serde_json::from_value(value).context("malformed job envelope")
    } else {
        Ok(Job {
            id: None,
            input: value,
        })
    }
}

async fn write_audio(output: &JobOutput, path: &Path) -> Result<()> {
    if let Some(b64) = output.audio_base64() {
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(b64)
            .context("inline audio is not valid base64")?;
        tokio::fs::write(path, &bytes)
            .await
            .with_context(|| format!("failed to write {}", path.display()))?;
        info!("wrote {} bytes to {}", bytes.len(), path.display());
    } else if let Some(url) = output.audio_url() {
        warn!("audio was uploaded, not writing {}: {url}", path.display());
    }
    Ok(())
}

async fn print_response(request: reqwest::RequestBuilder) -> Result<()> {
    let resp = request.send().await.context("request to server failed")?;
    let status = resp.status();
    println!("{}", resp.text().await.unwrap_or_default());
    if !status.is_success() {
        bail!("server returned {status}");
    }
    Ok(())
}
