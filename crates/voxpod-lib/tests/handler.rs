//! End-to-end job handling against the in-memory backend and object store.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use serde_json::json;

use voxpod_lib::config::ServiceConfig;
use voxpod_lib::publish::ResultPublisher;
use voxpod_lib::testing::{FakeBackend, MemoryStore};
use voxpod_lib::transcode::Transcoder;
use voxpod_lib::voxpod_core::types::{Job, JobOutput};
use voxpod_lib::voxpod_core::wav::{SAMPLE_RATE, parse_wav_header};
use voxpod_lib::Handler;

struct Fixture {
    _voices: tempfile::TempDir,
    backend: FakeBackend,
    handler: Handler,
}

fn voices(names: &[&str]) -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    for name in names {
        std::fs::write(dir.path().join(format!("{name}.pt")), format!("prefill:{name}")).unwrap();
    }
    dir
}

fn fixture_with(
    names: &[&str],
    backend: FakeBackend,
    transcoder: Transcoder,
    publisher: ResultPublisher,
) -> Fixture {
    let dir = voices(names);
    let config = ServiceConfig {
        voices_dir: dir.path().to_path_buf(),
        ..Default::default()
    };
    let handler = Handler::new(config, Arc::new(backend.clone()), transcoder, publisher)
        .with_ready_timeout(Duration::from_secs(1));
    Fixture {
        _voices: dir,
        backend,
        handler,
    }
}

fn fixture() -> Fixture {
    fixture_with(
        &["en-Emma_woman", "en-Carter_man"],
        FakeBackend::default(),
        Transcoder::new("/nonexistent/ffmpeg"),
        ResultPublisher::inline(),
    )
}

fn job(input: serde_json::Value) -> Job {
    Job { id: None, input }
}

fn decode(output: &JobOutput) -> Vec<u8> {
    let b64 = output.audio_base64().expect("inline audio");
    base64::engine::general_purpose::STANDARD.decode(b64).unwrap()
}

#[cfg(unix)]
fn script(dir: &Path, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;
    let path = dir.join("ffmpeg");
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

#[tokio::test]
async fn missing_text_returns_error_output() {
    let f = fixture();
    for input in [
        json!({}),
        json!({"text": ""}),
        json!({"text": "  \n\t"}),
        json!({"text": null, "voice_key": "en-Emma_woman"}),
    ] {
        let out = f.handler.handle(job(input)).await.unwrap();
        assert_eq!(
            serde_json::to_value(&out).unwrap(),
            json!({"error": "No text provided for TTS."})
        );
    }
    assert_eq!(f.backend.generate_calls(), 0);
}

#[tokio::test]
async fn wav_job_returns_inline_audio() {
    let f = fixture();
    let out = f
        .handler
        .handle(job(json!({"text": "Hello world", "output_format": "wav"})))
        .await
        .unwrap();

    let meta = out.metadata().unwrap();
    assert_eq!(meta.text_length, 11);
    assert_eq!(meta.voice_key, "en-Emma_woman");
    assert_eq!(meta.model_path, "VibeVoice-Realtime-0.5B");
    assert_eq!(meta.format, "wav");
    assert!(out.audio_url().is_none());

    let wav = decode(&out);
    let header = parse_wav_header(&wav).unwrap();
    assert_eq!(header.sample_rate, SAMPLE_RATE);
    assert_eq!(header.channels, 1);
    assert_eq!(header.bits_per_sample, 16);
    assert_eq!(header.data_len, 2_400 * 2);
}

#[tokio::test]
async fn requested_voice_is_used_and_reported() {
    let f = fixture();
    let out = f
        .handler
        .handle(job(json!({
            "text": "Good morning",
            "voice_key": "en-Carter_man",
            "output_format": "wav",
        })))
        .await
        .unwrap();
    assert_eq!(out.metadata().unwrap().voice_key, "en-Carter_man");
    assert!(f
        .backend
        .events()
        .contains(&"generate:en-Carter_man:cfg=1.5:sample=false".to_string()));
}

#[tokio::test]
async fn unknown_voice_falls_back_to_default() {
    let f = fixture();
    let out = f
        .handler
        .handle(job(json!({"text": "Hi", "voice_key": "xx-Nobody", "output_format": "wav"})))
        .await
        .unwrap();
    assert_eq!(out.metadata().unwrap().voice_key, "en-Emma_woman");
    assert_eq!(f.backend.prefill_calls(), 1);
}

#[tokio::test]
async fn reference_audio_is_accepted() {
    let f = fixture();
    let out = f
        .handler
        .handle(job(json!({
            "text": "Hi",
            "reference_audio": "UklGRg==",
            "output_format": "wav",
        })))
        .await
        .unwrap();
    assert!(!out.is_error());
}

#[tokio::test]
async fn unsupported_format_is_job_error() {
    let f = fixture();
    let out = f
        .handler
        .handle(job(json!({"text": "Hi", "output_format": "midi"})))
        .await
        .unwrap();
    assert!(out.error_message().unwrap().contains("midi"));
}

#[tokio::test]
async fn bucket_mode_returns_presigned_url() {
    let store = MemoryStore::default();
    let f = fixture_with(
        &["en-Emma_woman"],
        FakeBackend::default(),
        Transcoder::new("/nonexistent/ffmpeg"),
        ResultPublisher::with_store(Arc::new(store.clone())),
    );
    let out = f
        .handler
        .handle(job(json!({"text": "Stored", "output_format": "wav"})))
        .await
        .unwrap();

    let url = out.audio_url().unwrap();
    assert!(out.audio_base64().is_none());
    let keys = store.keys();
    assert_eq!(keys.len(), 1);
    assert!(keys[0].ends_with(".wav"));
    assert!(url.contains(&keys[0]));
    assert!(url.contains("X-Amz-Expires=3600"));

    let (body, content_type) = store.get(&keys[0]).unwrap();
    assert_eq!(content_type, "audio/wav");
    assert!(parse_wav_header(&body).is_ok());

    let value = serde_json::to_value(&out).unwrap();
    assert!(value.get("audio_base64").is_none());
    assert_eq!(value["metadata"]["format"], "wav");
}

#[tokio::test]
async fn storage_failure_is_job_error() {
    let f = fixture_with(
        &["en-Emma_woman"],
        FakeBackend::default(),
        Transcoder::new("/nonexistent/ffmpeg"),
        ResultPublisher::with_store(Arc::new(MemoryStore::failing("NoSuchBucket"))),
    );
    let out = f
        .handler
        .handle(job(json!({"text": "Hi", "output_format": "wav"})))
        .await
        .unwrap();
    assert_eq!(out.error_message(), Some("NoSuchBucket"));
    assert!(f.handler.is_ready());
}

#[tokio::test]
async fn model_failure_is_job_error() {
    let f = fixture_with(
        &["en-Emma_woman"],
        FakeBackend::default().failing_generation("CUDA out of memory"),
        Transcoder::new("/nonexistent/ffmpeg"),
        ResultPublisher::inline(),
    );
    let out = f
        .handler
        .handle(job(json!({"text": "Hi", "output_format": "wav"})))
        .await
        .unwrap();
    assert_eq!(out.error_message(), Some("CUDA out of memory"));
}

#[cfg(unix)]
#[tokio::test]
async fn mp3_goes_through_transcoder() {
    let bin = tempfile::tempdir().unwrap();
    let f = fixture_with(
        &["en-Emma_woman"],
        FakeBackend::default(),
        Transcoder::new(script(bin.path(), "cat")),
        ResultPublisher::inline(),
    );
    let out = f
        .handler
        .handle(job(json!({"text": "Hello", "output_format": "MP3"})))
        .await
        .unwrap();
    assert_eq!(out.metadata().unwrap().format, "mp3");
    // the passthrough script echoes the WAV back
    assert!(parse_wav_header(&decode(&out)).is_ok());
}

#[cfg(unix)]
#[tokio::test]
async fn transcoder_failure_does_not_poison_process() {
    let bin = tempfile::tempdir().unwrap();
    let f = fixture_with(
        &["en-Emma_woman"],
        FakeBackend::default(),
        Transcoder::new(script(
            bin.path(),
            "echo 'Unknown encoder' >&2\nexit 1",
        )),
        ResultPublisher::inline(),
    );

    let failed = f
        .handler
        .handle(job(json!({"text": "Hello", "output_format": "ogg"})))
        .await
        .unwrap();
    assert_eq!(
        failed.error_message(),
        Some("FFmpeg conversion failed: Unknown encoder")
    );

    let ok = f
        .handler
        .handle(job(json!({"text": "Hello", "output_format": "wav"})))
        .await
        .unwrap();
    assert!(!ok.is_error());
    assert_eq!(f.backend.model_loads(), 1);
}

#[tokio::test]
async fn empty_voices_directory_is_fatal() {
    let f = fixture_with(
        &[],
        FakeBackend::default(),
        Transcoder::new("/nonexistent/ffmpeg"),
        ResultPublisher::inline(),
    );
    let err = f
        .handler
        .handle(job(json!({"text": "Hi"})))
        .await
        .unwrap_err();
    assert!(err.is_fatal());
    assert!(err.to_string().contains("No voice preset (.pt) files found"));
    assert!(!f.handler.is_ready());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_first_jobs_load_model_once() {
    let f = Arc::new(fixture());
    let mut tasks = Vec::new();
    for i in 0..4 {
        let f = f.clone();
        tasks.push(tokio::spawn(async move {
            f.handler
                .handle(job(json!({"text": format!("job {i}"), "output_format": "wav"})))
                .await
        }));
    }
    for task in tasks {
        let out = task.await.unwrap().unwrap();
        assert!(!out.is_error());
    }
    assert_eq!(f.backend.model_loads(), 1);
    assert_eq!(f.backend.generate_calls(), 4);
    assert_eq!(f.backend.prefill_calls(), 1);
}
