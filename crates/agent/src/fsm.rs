// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Session lifecycle state machine.
//!
//! Dwell rejects flicker before a session opens; the silence window
//! tolerates brief gaps; post-roll keeps the session (and the publisher)
//! alive long enough to capture the tail of an event, and permits re-entry
//! to ACTIVE without bouncing the RTSP stream.
//!
//! The machine is synchronous and pure over `(event, now)`; the async
//! select-loop in [`run`] feeds it bus events and its own timer deadlines.
//! Every transition cancels the timers its new state does not prescribe
//! before arming new ones, so a late firing from an obsolete state can
//! never act.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::bus::Subscription;
use crate::event::{now_iso, CaptureMode, Command, DetectionEvent, KeepaliveEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsmState {
    Idle,
    Dwell,
    Active,
    Closing,
}

impl FsmState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Dwell => "dwell",
            Self::Active => "active",
            Self::Closing => "closing",
        }
    }
}

/// Events the machine consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsmEvent {
    Detection { relevant: bool },
    Keepalive,
    DwellElapsed,
    SilenceElapsed,
    PostRollElapsed,
}

impl FsmEvent {
    fn as_str(self) -> &'static str {
        match self {
            Self::Detection { relevant: true } => "detection",
            Self::Detection { relevant: false } => "detection-irrelevant",
            Self::Keepalive => "keepalive",
            Self::DwellElapsed => "dwell-elapsed",
            Self::SilenceElapsed => "silence-elapsed",
            Self::PostRollElapsed => "post-roll-elapsed",
        }
    }
}

/// Which timer a deadline belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    Dwell,
    Silence,
    PostRoll,
}

#[derive(Debug, Clone, Copy)]
pub struct FsmTimings {
    pub dwell: Duration,
    pub silence: Duration,
    pub post_roll: Duration,
}

impl Default for FsmTimings {
    fn default() -> Self {
        Self {
            dwell: Duration::from_millis(500),
            silence: Duration::from_secs(3),
            post_roll: Duration::from_secs(5),
        }
    }
}

pub struct SessionFsm {
    state: FsmState,
    timings: FsmTimings,
    dwell_deadline: Option<Instant>,
    silence_deadline: Option<Instant>,
    post_roll_deadline: Option<Instant>,
}

impl SessionFsm {
    pub fn new(timings: FsmTimings) -> Self {
        Self {
            state: FsmState::Idle,
            timings,
            dwell_deadline: None,
            silence_deadline: None,
            post_roll_deadline: None,
        }
    }

    pub fn state(&self) -> FsmState {
        self.state
    }

    /// The next timer to fire, if the current state prescribes one.
    pub fn next_deadline(&self) -> Option<(TimerKind, Instant)> {
        match self.state {
            FsmState::Idle => None,
            FsmState::Dwell => self.dwell_deadline.map(|d| (TimerKind::Dwell, d)),
            FsmState::Active => self.silence_deadline.map(|d| (TimerKind::Silence, d)),
            FsmState::Closing => self.post_roll_deadline.map(|d| (TimerKind::PostRoll, d)),
        }
    }

    /// Apply one event, returning the commands the transition issues, in
    /// dispatch order.
    pub fn handle(&mut self, event: FsmEvent, now: Instant) -> Vec<Command> {
        use FsmEvent::*;
        use FsmState::*;

        let relevant = matches!(event, Detection { relevant: true });
        let quiet = matches!(event, Detection { relevant: false } | Keepalive);

        let (next, commands): (FsmState, Vec<Command>) = match (self.state, event) {
            (Idle, _) if relevant => {
                self.dwell_deadline = Some(now + self.timings.dwell);
                (Dwell, vec![])
            }
            (Dwell, _) if relevant => {
                self.dwell_deadline = Some(now + self.timings.dwell);
                (Dwell, vec![])
            }
            (Dwell, DwellElapsed) => {
                self.dwell_deadline = None;
                self.silence_deadline = Some(now + self.timings.silence);
                (
                    Active,
                    vec![
                        Command::OpenSession { start_ts: now_iso() },
                        Command::StartPublisher,
                        Command::SetCaptureMode(CaptureMode::Active),
                    ],
                )
            }
            (Dwell, _) if quiet => {
                self.dwell_deadline = None;
                (Idle, vec![])
            }
            (Active, _) if relevant => {
                self.silence_deadline = Some(now + self.timings.silence);
                (Active, vec![])
            }
            (Active, SilenceElapsed) => {
                self.silence_deadline = None;
                self.post_roll_deadline = Some(now + self.timings.post_roll);
                (Closing, vec![Command::SetCaptureMode(CaptureMode::Idle)])
            }
            (Closing, _) if relevant => {
                // Re-entry: the publisher keeps running; only the capture
                // cadence is restored.
                self.post_roll_deadline = None;
                self.silence_deadline = Some(now + self.timings.silence);
                (Active, vec![Command::SetCaptureMode(CaptureMode::Active)])
            }
            (Closing, PostRollElapsed) => {
                self.post_roll_deadline = None;
                (
                    Idle,
                    vec![
                        Command::StopPublisher,
                        Command::CloseSession {
                            end_ts: now_iso(),
                            post_roll_sec: self.timings.post_roll.as_secs_f64(),
                        },
                    ],
                )
            }
            // Quiet traffic changes nothing in IDLE, ACTIVE, or CLOSING,
            // and stale timer events from a departed state are ignored.
            (state, _) => (state, vec![]),
        };

        if next != self.state {
            info!(
                target: "fsm",
                "{} → {} ({})",
                self.state.as_str(),
                next.as_str(),
                event.as_str()
            );
        }
        self.state = next;
        commands
    }
}

/// Run the machine on its own task, consuming bus events and dispatching
/// commands sequentially; the machine does not advance while a command
/// dispatch is in flight.
pub async fn run(
    mut fsm: SessionFsm,
    detections: Subscription<DetectionEvent>,
    keepalives: Subscription<KeepaliveEvent>,
    commands: mpsc::Sender<Command>,
    shutdown: CancellationToken,
) {
    loop {
        let deadline = fsm.next_deadline();
        let event = tokio::select! {
            _ = shutdown.cancelled() => return,
            event = detections.recv() => FsmEvent::Detection { relevant: event.relevant },
            _ = keepalives.recv() => FsmEvent::Keepalive,
            kind = fire_at(deadline) => match kind {
                TimerKind::Dwell => FsmEvent::DwellElapsed,
                TimerKind::Silence => FsmEvent::SilenceElapsed,
                TimerKind::PostRoll => FsmEvent::PostRollElapsed,
            },
        };
        for command in fsm.handle(event, Instant::now()) {
            if commands.send(command).await.is_err() {
                return;
            }
        }
    }
}

async fn fire_at(deadline: Option<(TimerKind, Instant)>) -> TimerKind {
    match deadline {
        Some((kind, at)) => {
            tokio::time::sleep_until(at).await;
            kind
        }
        None => std::future::pending().await,
    }
}

#[cfg(test)]
#[path = "fsm_tests.rs"]
mod tests;
