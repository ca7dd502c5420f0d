// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! On-demand RTSP publisher.
//!
//! Reads the shared-memory socket, encodes H.264, and pushes to the media
//! relay. While `desired-running` is set, unexpected exits trigger respawns
//! with capped exponential backoff. `stop` clears the flag *before* the
//! first signal so the exit handler can never race a restart in behind an
//! explicit stop.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::event::now_epoch_ms;
use crate::supervisor::{self, ChildHandle, ExitStatus, SpawnSpec};

/// Grace period between SIGINT and SIGKILL on explicit stop.
pub const STOP_GRACE: Duration = Duration::from_secs(2);

/// H.264 encoders in probe order; hardware first, software fallback last.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoder {
    NvH264,
    Vaapi,
    V4l2,
    X264,
}

impl Encoder {
    pub fn element(self) -> &'static str {
        match self {
            Self::NvH264 => "nvh264enc",
            Self::Vaapi => "vaapih264enc",
            Self::V4l2 => "v4l2h264enc",
            Self::X264 => "x264enc",
        }
    }

    /// Pipeline fragment for this encoder.
    fn args(self) -> Vec<String> {
        match self {
            Self::NvH264 => vec!["nvh264enc".to_owned(), "preset=low-latency-hq".to_owned()],
            Self::Vaapi => vec!["vaapih264enc".to_owned()],
            Self::V4l2 => vec!["v4l2h264enc".to_owned()],
            Self::X264 => vec![
                "x264enc".to_owned(),
                "tune=zerolatency".to_owned(),
                "speed-preset=ultrafast".to_owned(),
                "key-int-max=30".to_owned(),
            ],
        }
    }
}

/// Pick a working encoder. Probed once per process; every later publisher
/// start reuses the cached choice.
pub fn choose_encoder() -> Encoder {
    static CHOICE: OnceLock<Encoder> = OnceLock::new();
    *CHOICE.get_or_init(|| {
        for candidate in [Encoder::NvH264, Encoder::Vaapi, Encoder::V4l2] {
            if element_exists(candidate.element()) {
                info!(target: "publisher", encoder = candidate.element(), "hardware encoder selected");
                return candidate;
            }
        }
        info!(target: "publisher", encoder = "x264enc", "falling back to software encoding");
        Encoder::X264
    })
}

fn element_exists(name: &str) -> bool {
    std::process::Command::new("gst-inspect-1.0")
        .arg("--exists")
        .arg(name)
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

/// Shared-memory geometry and the RTSP target for one publisher instance.
#[derive(Debug, Clone)]
pub struct PublisherSettings {
    pub shm_socket: PathBuf,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    /// Full push URL, e.g. `rtsp://relay:8554/cam-01/record`.
    pub url: String,
}

/// Build the gst-launch command for the push pipeline.
pub fn rtsp_command(settings: &PublisherSettings, encoder: Encoder) -> (String, Vec<String>) {
    let mut args = vec![
        "shmsrc".to_owned(),
        format!("socket-path={}", settings.shm_socket.display()),
        "is-live=true".to_owned(),
        "do-timestamp=true".to_owned(),
        "!".to_owned(),
        format!(
            "video/x-raw,format=I420,width={},height={},framerate={}/1",
            settings.width, settings.height, settings.fps
        ),
        "!".to_owned(),
        "videoconvert".to_owned(),
        "!".to_owned(),
    ];
    args.extend(encoder.args());
    args.extend(
        [
            "!",
            "h264parse",
            "!",
            "rtspclientsink",
        ]
        .map(str::to_owned),
    );
    args.push(format!("location={}", settings.url));
    args.push("protocols=tcp".to_owned());
    args.push("latency=50".to_owned());
    ("gst-launch-1.0".to_owned(), args)
}

/// Backoff before restart attempt `attempt` (0-based): capped doubling.
pub fn restart_delay(attempt: u32) -> Duration {
    let ms = 500u64.saturating_mul(1u64 << attempt.min(4));
    Duration::from_millis(ms.min(5000))
}

/// Externally observable publisher state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PubState {
    Idle,
    Starting,
    Running,
    Stopping,
}

impl PubState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
        }
    }
}

/// Point-in-time copy for the status surface.
#[derive(Debug, Clone)]
pub struct StreamSnapshot {
    pub state: PubState,
    pub running: bool,
    pub started_at_ms: Option<u64>,
    pub last_stopped_at_ms: Option<u64>,
    pub last_exit: Option<ExitStatus>,
}

struct Inner {
    name: &'static str,
    program: String,
    args: Vec<String>,
    desired: AtomicBool,
    task_active: AtomicBool,
    attempt: AtomicU32,
    state: Mutex<PubState>,
    current: Mutex<Option<Arc<ChildHandle>>>,
    started_at_ms: Mutex<Option<u64>>,
    last_stopped_at_ms: Mutex<Option<u64>>,
    last_exit: Mutex<Option<ExitStatus>>,
    shutdown: CancellationToken,
}

/// One supervised push-stream instance. The agent runs two: `live` and
/// `record`, differing only in the RTSP path.
#[derive(Clone)]
pub struct Publisher {
    inner: Arc<Inner>,
}

impl Publisher {
    pub fn new(name: &'static str, program: String, args: Vec<String>, shutdown: CancellationToken) -> Self {
        Self {
            inner: Arc::new(Inner {
                name,
                program,
                args,
                desired: AtomicBool::new(false),
                task_active: AtomicBool::new(false),
                attempt: AtomicU32::new(0),
                state: Mutex::new(PubState::Idle),
                current: Mutex::new(None),
                started_at_ms: Mutex::new(None),
                last_stopped_at_ms: Mutex::new(None),
                last_exit: Mutex::new(None),
                shutdown,
            }),
        }
    }

    /// Build the standard RTSP publisher for `settings`.
    pub fn rtsp(name: &'static str, settings: &PublisherSettings, shutdown: CancellationToken) -> Self {
        let (program, args) = rtsp_command(settings, choose_encoder());
        Self::new(name, program, args, shutdown)
    }

    /// Begin publishing. Resets the restart counter; a second call while
    /// running is a no-op.
    pub fn start(&self) {
        self.inner.desired.store(true, Ordering::SeqCst);
        self.inner.attempt.store(0, Ordering::SeqCst);
        if self.inner.task_active.swap(true, Ordering::SeqCst) {
            return;
        }
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            supervise(&inner).await;
            inner.task_active.store(false, Ordering::SeqCst);
        });
    }

    /// Stop publishing. Clears `desired-running` before signaling so the
    /// supervise loop cannot restart after the kill.
    pub async fn stop(&self, grace: Duration) {
        self.inner.desired.store(false, Ordering::SeqCst);
        let child = self.inner.current.lock().clone();
        let Some(child) = child else {
            return;
        };
        *self.inner.state.lock() = PubState::Stopping;
        child.stop(grace).await;
        // The supervise loop records the exit and settles the state.
    }

    pub fn is_running(&self) -> bool {
        *self.inner.state.lock() == PubState::Running
    }

    pub fn snapshot(&self) -> StreamSnapshot {
        let state = *self.inner.state.lock();
        StreamSnapshot {
            state,
            running: state == PubState::Running,
            started_at_ms: *self.inner.started_at_ms.lock(),
            last_stopped_at_ms: *self.inner.last_stopped_at_ms.lock(),
            last_exit: *self.inner.last_exit.lock(),
        }
    }
}

async fn supervise(inner: &Inner) {
    loop {
        if !inner.desired.load(Ordering::SeqCst) || inner.shutdown.is_cancelled() {
            break;
        }

        *inner.state.lock() = PubState::Starting;
        let spec = SpawnSpec::new(inner.program.clone(), inner.args.clone());
        let child = match supervisor::spawn(spec) {
            Ok(handle) => Arc::new(handle),
            Err(e) => {
                warn!(target: "publisher", stream = inner.name, error = %format!("{e:#}"), "spawn failed");
                *inner.state.lock() = PubState::Idle;
                if !backoff(inner).await {
                    break;
                }
                continue;
            }
        };
        // A stop may have landed while the spawn was in flight; the child
        // must not outlive the cleared flag.
        if !inner.desired.load(Ordering::SeqCst) || inner.shutdown.is_cancelled() {
            let status = child.stop(STOP_GRACE).await;
            *inner.last_exit.lock() = Some(status);
            *inner.last_stopped_at_ms.lock() = Some(now_epoch_ms());
            break;
        }
        info!(target: "publisher", stream = inner.name, pid = child.pid(), "publisher started");
        *inner.current.lock() = Some(Arc::clone(&child));
        *inner.started_at_ms.lock() = Some(now_epoch_ms());
        *inner.state.lock() = PubState::Running;

        let status = tokio::select! {
            status = child.wait() => status,
            _ = inner.shutdown.cancelled() => child.stop(STOP_GRACE).await,
        };
        *inner.current.lock() = None;
        *inner.last_exit.lock() = Some(status);
        *inner.last_stopped_at_ms.lock() = Some(now_epoch_ms());
        *inner.state.lock() = PubState::Idle;

        if !inner.desired.load(Ordering::SeqCst) || inner.shutdown.is_cancelled() {
            info!(target: "publisher", stream = inner.name, "publisher stopped");
            break;
        }

        warn!(
            target: "publisher",
            stream = inner.name,
            code = ?status.code,
            signal = ?status.signal,
            "publisher exited unexpectedly, restarting"
        );
        if !backoff(inner).await {
            break;
        }
    }
    *inner.state.lock() = PubState::Idle;
}

/// Sleep out the restart backoff. Returns `false` when the wait was cut
/// short by stop/shutdown.
async fn backoff(inner: &Inner) -> bool {
    let attempt = inner.attempt.fetch_add(1, Ordering::SeqCst);
    let delay = restart_delay(attempt);
    tokio::select! {
        _ = inner.shutdown.cancelled() => false,
        _ = tokio::time::sleep(delay) => inner.desired.load(Ordering::SeqCst),
    }
}

#[cfg(test)]
#[path = "publisher_tests.rs"]
mod tests;
