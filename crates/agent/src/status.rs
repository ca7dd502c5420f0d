// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Shared status snapshot plus the manager request channel.
//!
//! Components never write the snapshot directly: they send
//! [`StatusUpdate`]s down one queue and a single task applies them, so the
//! HTTP surface always reads an internally consistent copy.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::event::{now_epoch_ms, now_iso};

/// Pipeline manager lifecycle, as shown under `manager.state`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl ManagerState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
        }
    }
}

/// Runtime class-filter override, surfaced under `manager.overrides`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OverrideInfo {
    pub classes: Vec<String>,
    pub applied_ts: String,
}

/// One state change flowing into the snapshot.
#[derive(Debug, Clone)]
pub enum StatusUpdate {
    Manager(ManagerState),
    ManagerStarted,
    ManagerStopped,
    Overrides(Vec<String>),
    /// Liveness signal from the AI path (keepalive or any result).
    Heartbeat,
    /// A relevant detection was observed.
    Detection,
    SessionOpened(String),
    SessionClosed,
}

/// The reader-writer snapshot structure.
pub struct StatusState {
    pub started_at_iso: String,
    pub started_at_ms: u64,
    manager: RwLock<ManagerState>,
    last_start_ts: RwLock<Option<String>>,
    last_stop_ts: RwLock<Option<String>>,
    overrides: RwLock<Option<OverrideInfo>>,
    heartbeat_ts: RwLock<Option<String>>,
    detections_total: AtomicU64,
    last_detection_ts: RwLock<Option<String>>,
    session_active: AtomicBool,
    current_session: RwLock<Option<String>>,
    last_session: RwLock<Option<String>>,
}

impl StatusState {
    pub fn new() -> Self {
        Self {
            started_at_iso: now_iso(),
            started_at_ms: now_epoch_ms(),
            manager: RwLock::new(ManagerState::Stopped),
            last_start_ts: RwLock::new(None),
            last_stop_ts: RwLock::new(None),
            overrides: RwLock::new(None),
            heartbeat_ts: RwLock::new(None),
            detections_total: AtomicU64::new(0),
            last_detection_ts: RwLock::new(None),
            session_active: AtomicBool::new(false),
            current_session: RwLock::new(None),
            last_session: RwLock::new(None),
        }
    }

    pub fn apply(&self, update: StatusUpdate) {
        match update {
            StatusUpdate::Manager(state) => *self.manager.write() = state,
            StatusUpdate::ManagerStarted => *self.last_start_ts.write() = Some(now_iso()),
            StatusUpdate::ManagerStopped => *self.last_stop_ts.write() = Some(now_iso()),
            StatusUpdate::Overrides(classes) => {
                *self.overrides.write() = Some(OverrideInfo { classes, applied_ts: now_iso() });
            }
            StatusUpdate::Heartbeat => *self.heartbeat_ts.write() = Some(now_iso()),
            StatusUpdate::Detection => {
                self.detections_total.fetch_add(1, Ordering::Relaxed);
                *self.last_detection_ts.write() = Some(now_iso());
            }
            StatusUpdate::SessionOpened(id) => {
                self.session_active.store(true, Ordering::Release);
                *self.current_session.write() = Some(id);
            }
            StatusUpdate::SessionClosed => {
                self.session_active.store(false, Ordering::Release);
                let current = self.current_session.write().take();
                if current.is_some() {
                    *self.last_session.write() = current;
                }
            }
        }
    }

    pub fn manager_state(&self) -> ManagerState {
        *self.manager.read()
    }

    pub fn last_start_ts(&self) -> Option<String> {
        self.last_start_ts.read().clone()
    }

    pub fn last_stop_ts(&self) -> Option<String> {
        self.last_stop_ts.read().clone()
    }

    pub fn overrides(&self) -> Option<OverrideInfo> {
        self.overrides.read().clone()
    }

    pub fn heartbeat_ts(&self) -> Option<String> {
        self.heartbeat_ts.read().clone()
    }

    pub fn detections_total(&self) -> u64 {
        self.detections_total.load(Ordering::Relaxed)
    }

    pub fn last_detection_ts(&self) -> Option<String> {
        self.last_detection_ts.read().clone()
    }

    pub fn session_active(&self) -> bool {
        self.session_active.load(Ordering::Acquire)
    }

    pub fn current_session(&self) -> Option<String> {
        self.current_session.read().clone()
    }

    pub fn last_session(&self) -> Option<String> {
        self.last_session.read().clone()
    }

    pub fn uptime_ms(&self) -> u64 {
        now_epoch_ms().saturating_sub(self.started_at_ms)
    }
}

impl Default for StatusState {
    fn default() -> Self {
        Self::new()
    }
}

/// Apply updates from the single status queue until shutdown.
pub async fn run_updater(
    state: Arc<StatusState>,
    mut updates: mpsc::Receiver<StatusUpdate>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            update = updates.recv() => match update {
                Some(update) => state.apply(update),
                None => return,
            },
        }
    }
}

/// Readiness predicates `POST /control/start` can block on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitKind {
    Child,
    Heartbeat,
    Detection,
    Session,
}

impl std::str::FromStr for WaitKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "child" => Ok(Self::Child),
            "heartbeat" => Ok(Self::Heartbeat),
            "detection" => Ok(Self::Detection),
            "session" => Ok(Self::Session),
            other => Err(format!("unknown wait predicate: {other:?}")),
        }
    }
}

/// Requests from the control surface to the orchestrator.
pub enum ManagerRequest {
    Start(oneshot::Sender<anyhow::Result<()>>),
    Stop(oneshot::Sender<anyhow::Result<()>>),
}

/// Sender half handed to the HTTP surface.
#[derive(Clone)]
pub struct ManagerHandle {
    tx: mpsc::Sender<ManagerRequest>,
}

impl ManagerHandle {
    pub fn new(tx: mpsc::Sender<ManagerRequest>) -> Self {
        Self { tx }
    }

    pub async fn start(&self) -> anyhow::Result<()> {
        let (reply, response) = oneshot::channel();
        self.tx
            .send(ManagerRequest::Start(reply))
            .await
            .map_err(|_| anyhow::anyhow!("manager is gone"))?;
        response.await.map_err(|_| anyhow::anyhow!("manager dropped the request"))?
    }

    pub async fn stop(&self) -> anyhow::Result<()> {
        let (reply, response) = oneshot::channel();
        self.tx
            .send(ManagerRequest::Stop(reply))
            .await
            .map_err(|_| anyhow::anyhow!("manager is gone"))?;
        response.await.map_err(|_| anyhow::anyhow!("manager dropped the request"))?
    }
}

#[cfg(test)]
#[path = "status_tests.rs"]
mod tests;
