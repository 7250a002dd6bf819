//! voxpod-core: job schema, error taxonomy, and wave codec.
//!
//! No async runtime, no I/O, no platform dependencies.

pub mod error;
pub mod types;
pub mod wav;
