//! Model worker lifecycle: spawns and monitors the inference sidecar.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::process::Child;
use tokio::sync::Mutex;

use crate::config::WorkerConfig;
use crate::error::ServiceError;

struct RunningWorker {
    child: Child,
    program: PathBuf,
}

/// Owns the sidecar process when this process is responsible for it.
#[derive(Clone, Default)]
pub struct WorkerManager {
    worker: Arc<Mutex<Option<RunningWorker>>>,
}

impl WorkerManager {
    /// Spawn `config.command` bound to the host and port of `config.url`.
    ///
    /// Does nothing when no command is configured or a worker started by
    /// this manager is still alive. Readiness is left to the backend's
    /// health poll.
    pub async fn start(&self, config: &WorkerConfig) -> Result<(), ServiceError> {
        let Some(command) = &config.command else {
            tracing::info!("using externally managed model worker at {}", config.url);
            return Ok(());
        };
        if self.is_running().await {
            return Ok(());
        }

        let (host, port) = host_port(&config.url)?;
        let binary = resolve_sidecar(command)?;

        let mut child = tokio::process::Command::new(&binary)
            .args(["--host", &host, "--port", &port.to_string()])
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                ServiceError::Startup(format!("failed to spawn {}: {e}", binary.display()))
            })?;
        tracing::info!(
            "spawned model worker {} on {host}:{port} (pid {:?})",
            binary.display(),
            child.id()
        );

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                use tokio::io::{AsyncBufReadExt, BufReader};
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!("[worker] {line}");
                }
            });
        }

        *self.worker.lock().await = Some(RunningWorker {
            child,
            program: binary,
        });
        Ok(())
    }

    pub async fn is_running(&self) -> bool {
        let mut guard = self.worker.lock().await;
        let alive = match guard.as_mut() {
            Some(w) => matches!(w.child.try_wait(), Ok(None)),
            None => false,
        };
        if !alive {
            if let Some(w) = guard.take() {
                tracing::warn!("model worker {} has exited", w.program.display());
            }
        }
        alive
    }

    pub async fn stop(&self) {
        if let Some(mut w) = self.worker.lock().await.take() {
            tracing::info!("stopping model worker {}", w.program.display());
            let _ = w.child.kill().await;
        }
    }

    /// Best-effort kill for contexts that cannot await.
    pub fn stop_sync(&self) {
        if let Ok(mut guard) = self.worker.try_lock() {
            if let Some(mut w) = guard.take() {
                let _ = w.child.start_kill();
            }
        }
    }
}

/// Host and port of an `http://host:port` URL; port defaults to 80.
fn host_port(url: &str) -> Result<(String, u16), ServiceError> {
    let invalid = || ServiceError::Config(format!("invalid MODEL_WORKER_URL '{url}'"));
    let rest = url.strip_prefix("http://").ok_or_else(invalid)?;
    let authority = rest.split('/').next().unwrap_or_default();
    match authority.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() => {
            Ok((host.to_string(), port.parse().map_err(|_| invalid())?))
        }
        None if !authority.is_empty() => Ok((authority.to_string(), 80)),
        _ => Err(invalid()),
    }
}

/// Look for the sidecar next to the executable, then fall back to `PATH`.
fn resolve_sidecar(command: &Path) -> Result<PathBuf, ServiceError> {
    if command.components().count() > 1 {
        return Ok(command.to_path_buf());
    }

    let exe = std::env::current_exe()
        .map_err(|e| ServiceError::Startup(format!("cannot determine executable path: {e}")))?;
    if let Some(exe_dir) = exe.parent() {
        let bundled = exe_dir.join(command);
        if bundled.is_file() {
            return Ok(bundled);
        }
        let bundled_exe = bundled.with_extension("exe");
        if bundled_exe.is_file() {
            return Ok(bundled_exe);
        }
    }

    Ok(command.to_path_buf())
}
