//! Viewer sampler: counts established connections on listening stream ports.
//!
//! Connection data comes from the kernel's `/proc/net/tcp` tables. Each
//! sample is a fresh [`ViewerCounts`] map owned by the caller.

use crate::config::ViewersConfig;
use crate::metrics::{SharedStatus, ViewerCounts};
use std::collections::HashSet;
use std::ops::Range;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[cfg(target_os = "linux")]
const PROC_NET_TABLES: &[&str] = &["/proc/net/tcp", "/proc/net/tcp6"];

/// Errors raised by the viewer sampler
#[derive(Debug, Error)]
pub enum SamplerError {
    #[error("viewer sampling is not supported on this platform")]
    Unsupported,

    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// TCP socket state as encoded in `/proc/net/tcp`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpState {
    Established,
    Listen,
    Other(u8),
}

impl TcpState {
    fn from_code(code: u8) -> Self {
        match code {
            0x01 => TcpState::Established,
            0x0A => TcpState::Listen,
            other => TcpState::Other(other),
        }
    }
}

/// One row of a `/proc/net/tcp` table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SocketEntry {
    pub local_port: u16,
    pub state: TcpState,
}

/// Parse the text of `/proc/net/tcp` or `/proc/net/tcp6`.
///
/// The header line and malformed rows are skipped.
pub fn parse_proc_net_tcp(text: &str) -> Vec<SocketEntry> {
    text.lines()
        .skip(1)
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let _slot = fields.next()?;
            let local = fields.next()?;
            let _remote = fields.next()?;
            let state = fields.next()?;

            let (_, port_hex) = local.rsplit_once(':')?;
            let local_port = u16::from_str_radix(port_hex, 16).ok()?;
            let state = u8::from_str_radix(state, 16).ok()?;

            Some(SocketEntry {
                local_port,
                state: TcpState::from_code(state),
            })
        })
        .collect()
}

/// Viewer count per listening port in `ports`.
///
/// A port gets an entry only if something listens on it; the value is the
/// number of established sockets whose local port matches.
pub fn count_viewers(entries: &[SocketEntry], ports: Range<u16>) -> ViewerCounts {
    let listening: HashSet<u16> = entries
        .iter()
        .filter(|e| e.state == TcpState::Listen && ports.contains(&e.local_port))
        .map(|e| e.local_port)
        .collect();

    let mut counts: ViewerCounts = listening.iter().map(|&port| (port, 0)).collect();
    for entry in entries {
        if entry.state == TcpState::Established {
            if let Some(count) = counts.get_mut(&entry.local_port) {
                *count += 1;
            }
        }
    }
    counts
}

/// Take one viewer sample for `ports`.
#[cfg(target_os = "linux")]
pub async fn sample_viewers(ports: Range<u16>) -> Result<ViewerCounts, SamplerError> {
    let mut entries = Vec::new();
    for (i, path) in PROC_NET_TABLES.iter().enumerate() {
        match tokio::fs::read_to_string(path).await {
            Ok(text) => entries.extend(parse_proc_net_tcp(&text)),
            // The IPv6 table is absent when IPv6 is disabled
            Err(e) if i > 0 && e.kind() == std::io::ErrorKind::NotFound => {}
            Err(source) => {
                return Err(SamplerError::Io {
                    path: path.to_string(),
                    source,
                })
            }
        }
    }
    Ok(count_viewers(&entries, ports))
}

/// Take one viewer sample for `ports`.
#[cfg(not(target_os = "linux"))]
pub async fn sample_viewers(_ports: Range<u16>) -> Result<ViewerCounts, SamplerError> {
    Err(SamplerError::Unsupported)
}

/// Sample every `check_interval` until cancelled.
///
/// Each sample is logged and, when `sink` is given, published into the
/// status snapshot. A failing first sample is returned as an error; later
/// failures are logged and the sampler keeps going.
pub async fn run_sampler(
    settings: &ViewersConfig,
    sink: Option<SharedStatus>,
    cancel: CancellationToken,
) -> Result<(), SamplerError> {
    let ports = settings.port_start..settings.port_end;
    info!(
        port_start = settings.port_start,
        port_end = settings.port_end,
        interval_secs = settings.check_interval_secs,
        "viewer sampler started"
    );

    let mut first = true;
    loop {
        match sample_viewers(ports.clone()).await {
            Ok(counts) => {
                info!(viewers = ?counts, "current viewers per port");
                if let Some(status) = &sink {
                    status.write().await.viewers = counts;
                }
            }
            Err(e) if first => return Err(e),
            Err(e) => warn!(error = %e, "viewer sample failed"),
        }
        first = false;

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(settings.check_interval()) => {}
        }
    }

    debug!("viewer sampler stopped");
    Ok(())
}
