//! Encoding modules for loopcast

pub mod ffmpeg;
pub mod manifest;

pub use ffmpeg::{build_ffmpeg_command, StreamEncodeParams};
pub use manifest::{render_manifest, write_manifest};
