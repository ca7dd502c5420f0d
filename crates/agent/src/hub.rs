// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Always-on camera hub: one long-lived GStreamer child decodes the camera
//! source and writes raw I420 frames into the shared-memory socket. The hub
//! is the segment's only writer; capture and publisher attach as readers.

use std::path::Path;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::SourceConfig;
use crate::supervisor::{self, SpawnSpec, StdoutMode};

const READY_POLL: Duration = Duration::from_millis(100);
const READY_TIMEOUT: Duration = Duration::from_millis(2500);
const RESTART_DELAY: Duration = Duration::from_secs(2);
const STOP_GRACE: Duration = Duration::from_secs(2);

/// How readiness was established.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// The child logged its transition to the playing state.
    Playing,
    /// The shared-memory socket appeared on disk.
    Socket,
    /// Neither signal arrived in time; assumed ready.
    Timeout,
}

/// Build the gst-launch argument vector for the hub pipeline.
///
/// The pipeline is deliberately minimal: decode, color-convert, scale,
/// rate-limit, shared-memory sink.
pub fn pipeline_args(source: &SourceConfig) -> Vec<String> {
    let mut args: Vec<String> = Vec::new();

    match (&source.url, &source.device) {
        (Some(url), _) => {
            args.push("rtspsrc".to_owned());
            args.push(format!("location={url}"));
            args.push("latency=0".to_owned());
            args.push("!".to_owned());
            args.push("decodebin".to_owned());
        }
        (None, Some(device)) => {
            args.push("v4l2src".to_owned());
            args.push(format!("device={device}"));
        }
        // Config validation rejects this before the hub exists.
        (None, None) => {}
    }

    args.extend(
        [
            "!",
            "videoconvert",
            "!",
            "videoscale",
            "!",
            "videorate",
        ]
        .map(str::to_owned),
    );
    args.push("!".to_owned());
    args.push(format!(
        "video/x-raw,format=I420,width={},height={},framerate={}/1",
        source.width, source.height, source.fps
    ));
    args.push("!".to_owned());
    args.push("shmsink".to_owned());
    args.push(format!("socket-path={}", source.shm_socket.display()));
    args.push(format!("shm-size={}", source.shm_size_mib * 1024 * 1024));
    args.push("wait-for-connection=false".to_owned());
    args.push("sync=true".to_owned());

    args
}

/// Wait until the pipeline looks ready: a "PLAYING" log line or the socket
/// file existing, whichever comes first. Falls through after the timeout.
pub async fn await_ready(socket: &Path, lines: &mut mpsc::Receiver<String>) -> Readiness {
    let deadline = tokio::time::Instant::now() + READY_TIMEOUT;
    let mut poll = tokio::time::interval(READY_POLL);
    let mut lines_open = true;

    loop {
        tokio::select! {
            _ = tokio::time::sleep_until(deadline) => return Readiness::Timeout,
            line = lines.recv(), if lines_open => {
                match line {
                    Some(l) if l.contains("PLAYING") => return Readiness::Playing,
                    Some(_) => {}
                    None => lines_open = false,
                }
            }
            _ = poll.tick() => {
                if socket.exists() {
                    return Readiness::Socket;
                }
            }
        }
    }
}

/// Run the hub until shutdown, restarting the child after unexpected exits.
pub async fn run(source: SourceConfig, shutdown: CancellationToken) {
    loop {
        let (line_tx, mut line_rx) = mpsc::channel(64);
        let spec = SpawnSpec::new("gst-launch-1.0", pipeline_args(&source))
            .with_stdout(StdoutMode::Lines(line_tx.clone()))
            .with_stderr(line_tx);

        let handle = match supervisor::spawn(spec) {
            Ok(handle) => handle,
            Err(e) => {
                warn!(target: "hub", error = %format!("{e:#}"), "failed to spawn camera hub");
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = tokio::time::sleep(RESTART_DELAY) => continue,
                }
            }
        };

        let readiness = await_ready(&source.shm_socket, &mut line_rx).await;
        match readiness {
            Readiness::Timeout => {
                warn!(target: "hub", "readiness signals absent, assuming pipeline is up")
            }
            _ => info!(target: "hub", ?readiness, pid = handle.pid(), "camera hub ready"),
        }

        // Keep draining child output so the pipe never fills.
        let drain = tokio::spawn(async move { while line_rx.recv().await.is_some() {} });

        tokio::select! {
            _ = shutdown.cancelled() => {
                handle.stop(STOP_GRACE).await;
                drain.abort();
                return;
            }
            status = handle.wait() => {
                warn!(
                    target: "hub",
                    code = ?status.code,
                    signal = ?status.signal,
                    "camera hub exited unexpectedly, restarting"
                );
            }
        }
        drain.abort();

        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = tokio::time::sleep(RESTART_DELAY) => {}
        }
    }
}

#[cfg(test)]
#[path = "hub_tests.rs"]
mod tests;
