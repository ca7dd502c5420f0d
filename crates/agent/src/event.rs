// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use bytes::Bytes;
use serde::Serialize;

use crate::detect::Detection;

/// Filtered inference outcome published on the `ai.detection` topic.
#[derive(Debug, Clone, Serialize)]
pub struct DetectionEvent {
    /// At least one detection survived the class/confidence filter.
    pub relevant: bool,
    pub detections: Vec<Detection>,
    /// Max confidence among surviving detections, 0 when none survived.
    pub score: f32,
    pub meta: ResultMeta,
}

/// Metadata carried alongside each result.
#[derive(Debug, Clone, Serialize)]
pub struct ResultMeta {
    pub seq: u64,
    pub ts_iso: String,
}

/// Liveness tick published on `ai.keepalive` when no detection traffic has
/// flowed for a while.
#[derive(Debug, Clone, Serialize)]
pub struct KeepaliveEvent {
    pub ts_iso: String,
}

/// One captured frame with metadata, as handed from capture to the AI path.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Monotonically increasing per capture run.
    pub seq: u64,
    pub ts_iso: String,
    pub ts_mono_ns: u64,
    pub width: u32,
    pub height: u32,
    pub pix_fmt: PixelFormat,
    pub data: Bytes,
}

/// Pixel layouts the capture path can produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    Rgb,
}

impl PixelFormat {
    pub fn channels(self) -> u32 {
        match self {
            Self::Rgb => 3,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Rgb => "RGB",
        }
    }
}

impl Frame {
    /// Payload length must equal `width * height * channels`.
    pub fn payload_matches_geometry(&self) -> bool {
        self.data.len() as u64
            == u64::from(self.width) * u64::from(self.height) * u64::from(self.pix_fmt.channels())
    }
}

/// Capture cadence requested by the session machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureMode {
    Idle,
    Active,
}

/// Side effects issued by session transitions, executed by the orchestrator
/// in dispatch order.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    OpenSession { start_ts: String },
    CloseSession { end_ts: String, post_roll_sec: f64 },
    StartPublisher,
    StopPublisher,
    SetCaptureMode(CaptureMode),
}

/// Return the current UTC time as an ISO-8601 string with millisecond
/// precision, matching what the wire protocol and store expect.
pub fn now_iso() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

/// Current UTC time as milliseconds since the Unix epoch.
pub fn now_epoch_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
