//! voxpod-lib: TTS job engine.
//!
//! Model warm start, voice preset cache, inference, ffmpeg transcoding,
//! result publishing, the job handler and its HTTP API.
//! Depends on voxpod-core for job types and WAV encoding.

pub mod backend;
pub mod config;
pub mod error;
pub mod handler;
pub mod inference;
pub mod loader;
pub mod manager;
pub mod presets;
pub mod publish;
pub mod server;
pub mod transcode;
pub mod worker;

#[doc(hidden)]
pub mod testing;

pub use error::ServiceError;
pub use handler::Handler;

// Re-export voxpod-core for convenience
pub use voxpod_core;
