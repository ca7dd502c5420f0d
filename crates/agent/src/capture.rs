// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Frame capture: a second GStreamer child attaches to the shared-memory
//! socket, rescales to the model's input geometry, and streams raw RGB
//! frames over its stdout. The parent slices that byte stream into frames
//! and forwards them with metadata.
//!
//! Switching between the idle and active cadence restarts the child; the
//! in-progress frame is discarded so no partial frame crosses a transition.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::Instant;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::AgentConfig;
use crate::event::{now_iso, CaptureMode, Frame, PixelFormat};
use crate::supervisor::{self, SpawnSpec, StdoutMode};

const STOP_GRACE: std::time::Duration = std::time::Duration::from_millis(500);

/// Everything the capture child needs, lifted out of the full config.
#[derive(Debug, Clone)]
pub struct CaptureSettings {
    pub shm_socket: std::path::PathBuf,
    pub src_width: u32,
    pub src_height: u32,
    pub src_fps: u32,
    /// Model input geometry.
    pub width: u32,
    pub height: u32,
    pub idle_fps: u32,
    pub active_fps: u32,
}

impl CaptureSettings {
    pub fn from_config(config: &AgentConfig) -> Self {
        Self {
            shm_socket: config.source.shm_socket.clone(),
            src_width: config.source.width,
            src_height: config.source.height,
            src_fps: config.source.fps,
            width: config.ai.width,
            height: config.ai.height,
            idle_fps: config.ai.idle_fps,
            active_fps: config.ai.active_fps,
        }
    }

    pub fn fps_for(&self, mode: CaptureMode) -> u32 {
        match mode {
            CaptureMode::Idle => self.idle_fps,
            CaptureMode::Active => self.active_fps,
        }
    }

    /// Bytes per emitted RGB frame.
    pub fn frame_len(&self) -> usize {
        self.width as usize * self.height as usize * 3
    }
}

/// Build the gst-launch argument vector for one capture cadence.
pub fn pipeline_args(settings: &CaptureSettings, mode: CaptureMode) -> Vec<String> {
    let fps = settings.fps_for(mode);
    vec![
        // -q keeps progress chatter off stdout; stdout carries frames.
        "-q".to_owned(),
        "shmsrc".to_owned(),
        format!("socket-path={}", settings.shm_socket.display()),
        "is-live=true".to_owned(),
        "do-timestamp=true".to_owned(),
        "!".to_owned(),
        format!(
            "video/x-raw,format=I420,width={},height={},framerate={}/1",
            settings.src_width, settings.src_height, settings.src_fps
        ),
        "!".to_owned(),
        "videorate".to_owned(),
        "drop-only=true".to_owned(),
        "!".to_owned(),
        format!("video/x-raw,framerate={fps}/1"),
        "!".to_owned(),
        "videoscale".to_owned(),
        "!".to_owned(),
        "videoconvert".to_owned(),
        "!".to_owned(),
        format!(
            "video/x-raw,format=RGB,width={},height={}",
            settings.width, settings.height
        ),
        "!".to_owned(),
        "fdsink".to_owned(),
        "fd=1".to_owned(),
    ]
}

/// Handle used to switch the capture cadence.
#[derive(Clone)]
pub struct CaptureControl {
    mode_tx: watch::Sender<CaptureMode>,
}

impl CaptureControl {
    /// Request a cadence. Always restarts the child pipeline, which also
    /// recovers a capture child that died since the last switch.
    pub fn set_mode(&self, mode: CaptureMode) {
        let _ = self.mode_tx.send(mode);
    }
}

/// Create the control handle and its receiving half for [`run`].
pub fn control() -> (CaptureControl, watch::Receiver<CaptureMode>) {
    let (mode_tx, mode_rx) = watch::channel(CaptureMode::Idle);
    (CaptureControl { mode_tx }, mode_rx)
}

/// Read exact-size frames from the child's stdout until EOF or error.
pub async fn pump_frames<R>(
    mut reader: R,
    settings: &CaptureSettings,
    seq: &AtomicU64,
    frames: &mpsc::Sender<Frame>,
) -> anyhow::Result<()>
where
    R: AsyncRead + Unpin,
{
    let frame_len = settings.frame_len();
    loop {
        let mut buf = vec![0u8; frame_len];
        reader.read_exact(&mut buf).await?;
        let frame = Frame {
            seq: seq.fetch_add(1, Ordering::Relaxed),
            ts_iso: now_iso(),
            ts_mono_ns: mono_ns(),
            width: settings.width,
            height: settings.height,
            pix_fmt: PixelFormat::Rgb,
            data: Bytes::from(buf),
        };
        if frames.send(frame).await.is_err() {
            return Ok(());
        }
    }
}

/// Run the capture child until shutdown.
///
/// A dead child is not respawned on its own; the next cadence switch brings
/// it back (the session machine switches cadence on every activity change).
pub async fn run(
    settings: CaptureSettings,
    frames: mpsc::Sender<Frame>,
    mut mode_rx: watch::Receiver<CaptureMode>,
    shutdown: CancellationToken,
) {
    // Sequence survives child restarts so downstream consumers never see
    // the counter move backwards.
    let seq = AtomicU64::new(0);

    loop {
        let mode = *mode_rx.borrow_and_update();
        let spec = SpawnSpec::new("gst-launch-1.0", pipeline_args(&settings, mode))
            .with_stdout(StdoutMode::Raw);

        let mut handle = match supervisor::spawn(spec) {
            Ok(handle) => handle,
            Err(e) => {
                warn!(target: "capture", error = %format!("{e:#}"), "failed to spawn capture child");
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    result = mode_rx.changed() => {
                        if result.is_err() {
                            return;
                        }
                        continue;
                    }
                }
            }
        };
        let Some(stdout) = handle.take_stdout() else {
            warn!(target: "capture", "capture child has no stdout pipe");
            handle.stop(STOP_GRACE).await;
            return;
        };
        info!(target: "capture", ?mode, fps = settings.fps_for(mode), pid = handle.pid(), "capture running");

        tokio::select! {
            _ = shutdown.cancelled() => {
                handle.stop(STOP_GRACE).await;
                return;
            }
            result = mode_rx.changed() => {
                // Cadence switch: stop cleanly, discard any partial frame,
                // respawn at the new rate.
                handle.stop(STOP_GRACE).await;
                if result.is_err() {
                    return;
                }
            }
            result = pump_frames(stdout, &settings, &seq, &frames) => {
                if let Err(e) = result {
                    debug!(target: "capture", error = %e, "frame stream ended");
                }
                let status = handle.wait().await;
                warn!(
                    target: "capture",
                    code = ?status.code,
                    signal = ?status.signal,
                    "capture child exited, awaiting next cadence switch"
                );
                // Park until a cadence switch or shutdown.
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    result = mode_rx.changed() => {
                        if result.is_err() {
                            return;
                        }
                    }
                }
            }
        }
    }
}

/// Nanoseconds from a process-stable monotonic origin.
fn mono_ns() -> u64 {
    static ORIGIN: OnceLock<Instant> = OnceLock::new();
    ORIGIN.get_or_init(Instant::now).elapsed().as_nanos() as u64
}

#[cfg(test)]
#[path = "capture_tests.rs"]
mod tests;
