// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context};
use clap::Parser;
use serde::Deserialize;

use crate::classes;

/// Edge video-analytics agent.
#[derive(Debug, Parser)]
#[command(name = "kestrel", version, about)]
pub struct Cli {
    /// Path to the agent configuration file (TOML).
    #[arg(long, env = "KESTREL_CONFIG", default_value = "kestrel.toml")]
    pub config: PathBuf,

    /// Log format override (json or text).
    #[arg(long, env = "KESTREL_LOG_FORMAT")]
    pub log_format: Option<String>,

    /// Log level override (trace, debug, info, warn, error).
    #[arg(long, env = "KESTREL_LOG_LEVEL")]
    pub log_level: Option<String>,
}

/// Parsed agent configuration file.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AgentConfig {
    pub device: DeviceConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    pub source: SourceConfig,
    pub ai: AiConfig,
    pub relay: RelayConfig,
    #[serde(default)]
    pub fsm: FsmConfig,
    pub store: StoreConfig,
    pub status: StatusConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeviceConfig {
    /// Stable identifier for this edge device; embedded in session ids.
    pub id: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct LoggingConfig {
    /// trace, debug, info, warn, error.
    pub level: String,
    /// json or text.
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info".to_owned(), format: "json".to_owned() }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SourceConfig {
    /// Network camera URL. Mutually exclusive with `device`.
    pub url: Option<String>,
    /// Local capture device path (e.g. /dev/video0).
    pub device: Option<String>,
    pub width: u32,
    pub height: u32,
    /// Target capture rate written into shared memory.
    pub fps: u32,
    /// Filesystem path of the shared-memory socket.
    pub shm_socket: PathBuf,
    /// Shared-memory segment size.
    pub shm_size_mib: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AiConfig {
    /// Model path forwarded to the worker in the handshake.
    pub model_path: String,
    /// Model input geometry.
    pub width: u32,
    pub height: u32,
    pub confidence_threshold: f32,
    /// Class whitelist; empty means all classes.
    #[serde(default)]
    pub classes: Vec<String>,
    pub idle_fps: u32,
    pub active_fps: u32,
    pub worker_host: String,
    pub worker_port: u16,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RelayConfig {
    pub host: String,
    pub port: u16,
    /// RTSP mount for the always-on live view.
    pub live_path: String,
    /// RTSP mount recorded during sessions.
    pub record_path: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct FsmConfig {
    pub dwell_ms: u64,
    pub silence_ms: u64,
    pub post_roll_ms: u64,
}

impl Default for FsmConfig {
    fn default() -> Self {
        Self { dwell_ms: 500, silence_ms: 3000, post_roll_ms: 5000 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StoreConfig {
    /// Base URL of the session store API.
    pub base_url: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StatusConfig {
    pub port: u16,
    #[serde(default = "default_status_host")]
    pub host: String,
}

fn default_status_host() -> String {
    "0.0.0.0".to_owned()
}

impl AgentConfig {
    /// Read and validate a configuration file.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let config: Self = toml::from_str(&text)
            .with_context(|| format!("parsing config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate cross-field constraints after parsing.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.device.id.is_empty() {
            bail!("device.id must not be empty");
        }

        match (&self.source.url, &self.source.device) {
            (Some(_), Some(_)) => bail!("source.url and source.device are mutually exclusive"),
            (None, None) => bail!("one of source.url or source.device is required"),
            _ => {}
        }
        if self.source.width == 0 || self.source.height == 0 {
            bail!("source geometry must be non-zero");
        }
        if self.source.fps == 0 {
            bail!("source.fps must be non-zero");
        }

        // The segment must absorb at least three seconds of raw I420 frames.
        let required = shm_min_bytes(self.source.fps, self.source.width, self.source.height);
        let configured = self.source.shm_size_mib * 1024 * 1024;
        if configured < required {
            bail!(
                "source.shm_size_mib too small: {configured} bytes < {required} required \
                 for 3s at {}x{}@{}fps",
                self.source.width,
                self.source.height,
                self.source.fps
            );
        }

        if self.ai.width == 0 || self.ai.height == 0 {
            bail!("ai geometry must be non-zero");
        }
        if !(0.0..=1.0).contains(&self.ai.confidence_threshold) {
            bail!("ai.confidence_threshold must be within [0, 1]");
        }
        if self.ai.idle_fps == 0 || self.ai.active_fps == 0 {
            bail!("ai.idle_fps and ai.active_fps must be non-zero");
        }
        classes::validate_filter(&self.ai.classes).context("ai.classes")?;

        if self.relay.live_path.is_empty() || self.relay.record_path.is_empty() {
            bail!("relay paths must not be empty");
        }
        if self.relay.live_path == self.relay.record_path {
            bail!("relay.live_path and relay.record_path must differ");
        }

        if self.store.base_url.is_empty() {
            bail!("store.base_url must not be empty");
        }

        Ok(())
    }

    pub fn dwell(&self) -> Duration {
        Duration::from_millis(self.fsm.dwell_ms)
    }

    pub fn silence(&self) -> Duration {
        Duration::from_millis(self.fsm.silence_ms)
    }

    pub fn post_roll(&self) -> Duration {
        Duration::from_millis(self.fsm.post_roll_ms)
    }

    pub fn worker_addr(&self) -> String {
        format!("{}:{}", self.ai.worker_host, self.ai.worker_port)
    }

    pub fn rtsp_url(&self, path: &str) -> String {
        format!("rtsp://{}:{}/{}", self.relay.host, self.relay.port, path)
    }
}

/// Minimum shared-memory size: 3 s · fps · width · height · 1.5 bytes
/// (4:2:0 planar frames).
pub fn shm_min_bytes(fps: u32, width: u32, height: u32) -> u64 {
    3 * u64::from(fps) * u64::from(width) * u64::from(height) * 3 / 2
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
