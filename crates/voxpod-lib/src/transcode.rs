//! WAV → target container via an external ffmpeg process.
//!
//! The WAV bytes are piped to stdin and the encoded stream is read back from
//! stdout; nothing touches disk. `wav` output is returned unchanged without
//! spawning anything.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Instant;

use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

use voxpod_core::types::OutputFormat;

use crate::config::TranscodeConfig;
use crate::error::ServiceError;

#[derive(Debug, Clone)]
pub struct Transcoder {
    program: PathBuf,
}

impl Default for Transcoder {
    fn default() -> Self {
        Self::from_config(&TranscodeConfig::default())
    }
}

impl Transcoder {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    pub fn from_config(config: &TranscodeConfig) -> Self {
        Self::new(&config.ffmpeg_path)
    }

    /// Arguments passed to the encoder for `format`.
    pub fn args(format: OutputFormat) -> [&'static str; 8] {
        [
            "-hide_banner",
            "-loglevel",
            "error",
            "-i",
            "pipe:0",
            "-f",
            format.muxer(),
            "pipe:1",
        ]
    }

    /// Re-encode `wav` as `format`.
    ///
    /// A non-zero exit yields [`ServiceError::Transcode`] carrying the
    /// encoder's stderr.
    pub async fn convert(&self, wav: Vec<u8>, format: OutputFormat) -> Result<Vec<u8>, ServiceError> {
        if format.is_source_container() {
            return Ok(wav);
        }

        let t0 = Instant::now();
        let io_err = |source| ServiceError::TranscoderIo {
            program: self.program.clone(),
            source,
        };

        let mut child = Command::new(&self.program)
            .args(Self::args(format))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(io_err)?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| io_err(std::io::Error::other("stdin not captured")))?;
        let input_len = wav.len();
        let writer = tokio::spawn(async move {
            let result = stdin.write_all(&wav).await;
            drop(stdin);
            result
        });

        let output = child.wait_with_output().await.map_err(io_err)?;
        let written = writer.await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            warn!("{} exited with {}: {stderr}", self.program.display(), output.status);
            return Err(ServiceError::Transcode { stderr });
        }
        // A clean exit on partial input would be truncated audio.
        input_written(written).map_err(io_err)?;

        debug!(
            "transcoded {input_len} bytes of wav to {} bytes of {format} in {:?}",
            output.stdout.len(),
            t0.elapsed()
        );
        Ok(output.stdout)
    }
}

/// The encoder may exit before draining stdin, in which case its exit
/// status decides. Any other write failure means it saw partial input.
fn input_written(result: std::io::Result<()>) -> std::io::Result<()> {
    match result {
        Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => Ok(()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[cfg(unix)]
    fn script(dir: &Path, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join("fake-ffmpeg");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[tokio::test]
    async fn wav_is_passthrough() {
        let t = Transcoder::new("/nonexistent/ffmpeg");
        let out = t.convert(b"RIFFdata".to_vec(), OutputFormat::Wav).await.unwrap();
        assert_eq!(out, b"RIFFdata");
    }

    #[tokio::test]
    async fn missing_program_is_io_error() {
        let t = Transcoder::new("/nonexistent/ffmpeg");
        let err = t.convert(vec![0; 16], OutputFormat::Mp3).await.unwrap_err();
        assert!(matches!(err, ServiceError::TranscoderIo { .. }));
        assert!(!err.is_fatal());
    }

    #[test]
    fn only_broken_pipe_is_tolerated() {
        use std::io::{Error, ErrorKind};
        assert!(input_written(Ok(())).is_ok());
        assert!(input_written(Err(Error::from(ErrorKind::BrokenPipe))).is_ok());
        let err = input_written(Err(Error::from(ErrorKind::WriteZero))).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::WriteZero);
    }

    #[test]
    fn aac_goes_through_adts() {
        let args = Transcoder::args(OutputFormat::Aac);
        assert_eq!(&args[5..], &["-f", "adts", "pipe:1"]);
        assert_eq!(&args[3..5], &["-i", "pipe:0"]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn pipes_stdin_to_stdout() {
        let dir = tempfile::tempdir().unwrap();
        let t = Transcoder::new(script(dir.path(), "cat"));
        let input: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        let out = t.convert(input.clone(), OutputFormat::Mp3).await.unwrap();
        assert_eq!(out, input);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failure_carries_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let t = Transcoder::new(script(
            dir.path(),
            "echo 'pipe:0: Invalid data found when processing input' >&2\nexit 1",
        ));
        let err = t.convert(vec![0; 100_000], OutputFormat::Ogg).await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "FFmpeg conversion failed: pipe:0: Invalid data found when processing input"
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn passes_muxer_argument() {
        let dir = tempfile::tempdir().unwrap();
        let t = Transcoder::new(script(dir.path(), "echo \"$@\" >&2\nexit 3"));
        let err = t.convert(vec![0; 8], OutputFormat::Opus).await.unwrap_err();
        assert!(err.to_string().ends_with("-f opus pipe:1"));
    }
}
