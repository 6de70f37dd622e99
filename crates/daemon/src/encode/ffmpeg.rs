//! FFmpeg command construction for the live output.
//!
//! One invocation concatenates the files listed in the batch manifest and
//! publishes them to the configured sink with fixed low-latency settings.

use crate::config::EncoderConfig;
use std::path::{Path, PathBuf};
use std::process::Command;

/// Encoding parameters shared by every batch.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamEncodeParams {
    /// Encoder executable
    pub ffmpeg_path: PathBuf,
    pub video_codec: String,
    pub preset: String,
    pub tune: String,
    /// Target and ceiling bitrate in kbit/s
    pub bitrate_kbps: u32,
    /// Rate control buffer in kbit
    pub bufsize_kbps: u32,
    /// Muxer for the network sink (flv for rtmp)
    pub output_format: String,
}

impl From<&EncoderConfig> for StreamEncodeParams {
    fn from(cfg: &EncoderConfig) -> Self {
        Self {
            ffmpeg_path: cfg.ffmpeg_path.clone(),
            video_codec: cfg.video_codec.clone(),
            preset: cfg.preset.clone(),
            tune: cfg.tune.clone(),
            bitrate_kbps: cfg.bitrate_kbps,
            bufsize_kbps: cfg.bufsize_kbps,
            output_format: cfg.output_format.clone(),
        }
    }
}

impl Default for StreamEncodeParams {
    fn default() -> Self {
        Self::from(&EncoderConfig::default())
    }
}

/// Build the encoder command for one batch.
///
/// Creates a Command configured with:
/// - concat demuxer input reading `manifest_path` (unsafe paths allowed, the
///   manifest carries absolute paths)
/// - video codec, preset and tune from `params`
/// - constant target bitrate with matching maxrate and the configured buffer
/// - the configured muxer writing to `sink_url`
///
/// An empty `tune` leaves the flag out.
pub fn build_ffmpeg_command(
    params: &StreamEncodeParams,
    manifest_path: &Path,
    sink_url: &str,
) -> Command {
    let mut cmd = Command::new(&params.ffmpeg_path);

    cmd.arg("-hide_banner").arg("-nostdin");

    // Input: every file of the batch through the concat demuxer
    cmd.arg("-f").arg("concat");
    cmd.arg("-safe").arg("0");
    cmd.arg("-i").arg(manifest_path);

    cmd.arg("-c:v").arg(&params.video_codec);
    cmd.arg("-preset").arg(&params.preset);
    if !params.tune.is_empty() {
        cmd.arg("-tune").arg(&params.tune);
    }

    let bitrate = format!("{}k", params.bitrate_kbps);
    cmd.arg("-b:v").arg(&bitrate);
    cmd.arg("-maxrate").arg(&bitrate);
    cmd.arg("-bufsize").arg(format!("{}k", params.bufsize_kbps));

    cmd.arg("-f").arg(&params.output_format);
    cmd.arg(sink_url);

    cmd
}
