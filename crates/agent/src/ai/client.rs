// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! TCP client for the remote inference worker.
//!
//! One task owns the socket and serializes all outbound traffic. Flow
//! control is a single credit: at most one frame is ever in flight, and a
//! frame offered while the credit is out replaces the pending one
//! (latest-wins; the slot never grows into a queue). Reconnection walks a
//! stepped backoff and replays the handshake with the last known
//! parameters.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use parking_lot::Mutex;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpSocket, TcpStream};
use tokio::sync::{watch, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bus::Topic;
use crate::event::{now_epoch_ms, Frame};

use super::proto::{request, response, End, Frame as WireFrame, Heartbeat, Init, Result as WorkerResult};
use super::wire;

pub const INIT_TIMEOUT: Duration = Duration::from_secs(5);
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(2);
pub const SILENCE_TIMEOUT: Duration = Duration::from_secs(10);

/// Reconnect backoff steps; the last entry repeats.
pub const BACKOFF_STEPS: [Duration; 5] = [
    Duration::from_millis(500),
    Duration::from_secs(2),
    Duration::from_secs(5),
    Duration::from_secs(10),
    Duration::from_secs(30),
];

/// Results fan out on a small bounded topic; steady state never fills it.
const RESULT_INBOX: usize = 8;

/// Connection lifecycle, observable through [`AiClient::state_watch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Disconnected,
    Connecting,
    Connected,
    Ready,
    Shutdown,
}

impl ClientState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Ready => "ready",
            Self::Shutdown => "shutdown",
        }
    }
}

/// Handshake arguments; re-sent verbatim on every reconnect.
#[derive(Debug, Clone)]
pub struct InitParams {
    pub model_path: String,
    pub width: u32,
    pub height: u32,
    pub confidence_threshold: f32,
    pub classes_filter: Vec<String>,
}

impl InitParams {
    fn to_wire(&self) -> Init {
        Init {
            model_path: self.model_path.clone(),
            width: self.width,
            height: self.height,
            confidence_threshold: self.confidence_threshold,
            classes_filter: self.classes_filter.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Worker endpoint as `host:port`.
    pub addr: String,
    /// Prefix for generated stream identifiers.
    pub stream_prefix: String,
    pub init: InitParams,
}

struct Shared {
    /// Latest-wins slot: capacity one, newest frame only.
    pending: Mutex<Option<Frame>>,
    wakeup: Notify,
    state_tx: watch::Sender<ClientState>,
    results: Topic<WorkerResult>,
    dropped: AtomicU64,
    tx: AtomicU64,
    rx: AtomicU64,
    last_seq: AtomicU64,
}

/// Handle to the inference client. Cheap to clone.
#[derive(Clone)]
pub struct AiClient {
    shared: Arc<Shared>,
}

impl AiClient {
    pub fn new() -> Self {
        let (state_tx, _) = watch::channel(ClientState::Disconnected);
        Self {
            shared: Arc::new(Shared {
                pending: Mutex::new(None),
                wakeup: Notify::new(),
                state_tx,
                results: Topic::new("ai.results", RESULT_INBOX),
                dropped: AtomicU64::new(0),
                tx: AtomicU64::new(0),
                rx: AtomicU64::new(0),
                last_seq: AtomicU64::new(0),
            }),
        }
    }

    /// Offer a frame for inference. While a frame is in flight (or the
    /// client is between connections) this replaces any pending frame; the
    /// replaced one is dropped and counted. A frame that does not advance
    /// the sequence is dropped instead.
    pub fn send_frame(&self, frame: Frame) {
        let mut slot = self.shared.pending.lock();
        if let Some(old) = slot.as_ref() {
            if frame.seq <= old.seq {
                warn!(
                    target: "ai",
                    seq = frame.seq,
                    pending = old.seq,
                    "sequence did not advance, dropping offered frame"
                );
                self.shared.dropped.fetch_add(1, Ordering::Relaxed);
                return;
            }
            self.shared.dropped.fetch_add(1, Ordering::Relaxed);
        }
        *slot = Some(frame);
        drop(slot);
        self.shared.wakeup.notify_one();
    }

    /// Subscribe to worker results.
    pub fn subscribe_results(&self) -> crate::bus::Subscription<WorkerResult> {
        self.shared.results.subscribe()
    }

    pub fn state(&self) -> ClientState {
        *self.shared.state_tx.borrow()
    }

    pub fn state_watch(&self) -> watch::Receiver<ClientState> {
        self.shared.state_tx.subscribe()
    }

    /// Frames discarded by latest-wins replacement or sequence regression.
    pub fn dropped_frames(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }

    /// Envelopes sent and received across all connections.
    pub fn counters(&self) -> (u64, u64) {
        (self.shared.tx.load(Ordering::Relaxed), self.shared.rx.load(Ordering::Relaxed))
    }

    pub fn last_sent_seq(&self) -> u64 {
        self.shared.last_seq.load(Ordering::Relaxed)
    }

    fn set_state(&self, state: ClientState) {
        let _ = self.shared.state_tx.send(state);
    }

    /// Run the connection loop until shutdown.
    pub async fn run(&self, config: ClientConfig, shutdown: CancellationToken) {
        let mut backoff_idx = 0usize;
        loop {
            if shutdown.is_cancelled() {
                break;
            }
            self.set_state(ClientState::Connecting);
            let stream = tokio::select! {
                _ = shutdown.cancelled() => break,
                result = connect(&config.addr) => match result {
                    Ok(stream) => stream,
                    Err(e) => {
                        debug!(target: "ai", error = %format!("{e:#}"), "worker connect failed");
                        self.set_state(ClientState::Disconnected);
                        if !wait_backoff(&mut backoff_idx, &shutdown).await {
                            break;
                        }
                        continue;
                    }
                },
            };
            self.set_state(ClientState::Connected);

            match self.drive_connection(stream, &config, &mut backoff_idx, &shutdown).await {
                ConnEnd::Shutdown => break,
                ConnEnd::Failed => {}
            }
            self.set_state(ClientState::Disconnected);
            if !wait_backoff(&mut backoff_idx, &shutdown).await {
                break;
            }
        }
        self.set_state(ClientState::Shutdown);
    }

    /// Drive one connection: handshake, then the steady-state loop.
    async fn drive_connection(
        &self,
        stream: TcpStream,
        config: &ClientConfig,
        backoff_idx: &mut usize,
        shutdown: &CancellationToken,
    ) -> ConnEnd {
        let stream_id = fresh_stream_id(&config.stream_prefix);
        let (mut reader, mut writer) = stream.into_split();

        let init = wire::request(&stream_id, request::Kind::Init(config.init.to_wire()));
        if let Err(e) = wire::write_envelope(&mut writer, &init).await {
            warn!(target: "ai", error = %format!("{e:#}"), "handshake send failed");
            return ConnEnd::Failed;
        }
        self.shared.tx.fetch_add(1, Ordering::Relaxed);

        let init_ok = tokio::select! {
            _ = shutdown.cancelled() => return ConnEnd::Shutdown,
            result = tokio::time::timeout(INIT_TIMEOUT, wire::read_envelope(&mut reader)) => result,
        };
        let init_ok = match init_ok {
            Err(_) => {
                warn!(target: "ai", "no InitOk within {INIT_TIMEOUT:?}, resetting connection");
                return ConnEnd::Failed;
            }
            Ok(Err(e)) => {
                warn!(target: "ai", error = %format!("{e:#}"), "handshake read failed");
                return ConnEnd::Failed;
            }
            Ok(Ok(envelope)) => match as_init_ok(envelope) {
                Some(ok) => ok,
                None => {
                    warn!(target: "ai", "unexpected message during handshake, resetting connection");
                    return ConnEnd::Failed;
                }
            },
        };
        self.shared.rx.fetch_add(1, Ordering::Relaxed);
        info!(
            target: "ai",
            stream_id,
            runtime = %init_ok.runtime,
            model = %init_ok.model_id,
            providers = ?init_ok.providers,
            "worker ready"
        );
        self.set_state(ClientState::Ready);
        *backoff_idx = 0;

        // Inbound frames are pumped by their own task so the select-loop
        // can never cancel a read mid-prefix and desync the framing.
        let (inbound_tx, inbound_rx) = tokio::sync::mpsc::channel(8);
        let pump = tokio::spawn(async move {
            loop {
                let result = wire::read_envelope(&mut reader).await;
                let failed = result.is_err();
                if inbound_tx.send(result).await.is_err() || failed {
                    break;
                }
            }
        });

        let end = self.steady_state(inbound_rx, &mut writer, &stream_id, shutdown).await;
        pump.abort();
        end
    }

    /// Steady-state loop. Holds the invariant `credit XOR in-flight`.
    async fn steady_state(
        &self,
        mut inbound: tokio::sync::mpsc::Receiver<anyhow::Result<super::proto::Envelope>>,
        writer: &mut OwnedWriteHalf,
        stream_id: &str,
        shutdown: &CancellationToken,
    ) -> ConnEnd {
        let mut credit = true;
        let mut inflight: Option<u64> = None;
        let mut last_sent: Option<u64> = None;
        let mut last_inbound = tokio::time::Instant::now();
        let mut heartbeat = tokio::time::interval_at(
            tokio::time::Instant::now() + HEARTBEAT_INTERVAL,
            HEARTBEAT_INTERVAL,
        );

        loop {
            // Send path runs only while the credit is held.
            if credit {
                let frame = self.shared.pending.lock().take();
                if let Some(frame) = frame {
                    if last_sent.is_some_and(|sent| frame.seq <= sent) {
                        warn!(
                            target: "ai",
                            seq = frame.seq,
                            last = last_sent,
                            "sequence did not advance, dropping pending frame"
                        );
                        self.shared.dropped.fetch_add(1, Ordering::Relaxed);
                        continue;
                    }
                    let envelope =
                        wire::request(stream_id, request::Kind::Frame(frame_to_wire(&frame)));
                    if let Err(e) = wire::write_envelope(writer, &envelope).await {
                        warn!(target: "ai", error = %format!("{e:#}"), "frame send failed");
                        return ConnEnd::Failed;
                    }
                    credit = false;
                    inflight = Some(frame.seq);
                    last_sent = Some(frame.seq);
                    self.shared.last_seq.store(frame.seq, Ordering::Relaxed);
                    self.shared.tx.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
            }

            tokio::select! {
                _ = shutdown.cancelled() => {
                    // Polite close; failure is irrelevant at this point.
                    let end = wire::request(stream_id, request::Kind::End(End {}));
                    let _ = wire::write_envelope(writer, &end).await;
                    return ConnEnd::Shutdown;
                }
                _ = self.shared.wakeup.notified() => {}
                _ = heartbeat.tick() => {
                    let (tx, rx) = self.counters();
                    let envelope = wire::heartbeat(stream_id, Heartbeat {
                        last_frame_id: self.shared.last_seq.load(Ordering::Relaxed),
                        tx,
                        rx,
                    });
                    if let Err(e) = wire::write_envelope(writer, &envelope).await {
                        warn!(target: "ai", error = %format!("{e:#}"), "heartbeat send failed");
                        return ConnEnd::Failed;
                    }
                    self.shared.tx.fetch_add(1, Ordering::Relaxed);
                }
                _ = tokio::time::sleep_until(last_inbound + SILENCE_TIMEOUT) => {
                    warn!(target: "ai", "no inbound traffic for {SILENCE_TIMEOUT:?}, resetting connection");
                    return ConnEnd::Failed;
                }
                result = inbound.recv() => {
                    let envelope = match result {
                        Some(Ok(envelope)) => envelope,
                        Some(Err(e)) => {
                            warn!(target: "ai", error = %format!("{e:#}"), "connection lost");
                            return ConnEnd::Failed;
                        }
                        None => {
                            warn!(target: "ai", "inbound pump ended, resetting connection");
                            return ConnEnd::Failed;
                        }
                    };
                    last_inbound = tokio::time::Instant::now();
                    self.shared.rx.fetch_add(1, Ordering::Relaxed);

                    match classify(envelope) {
                        Inbound::Result(result) => {
                            // A result both delivers detections and returns
                            // the credit.
                            if inflight == Some(result.seq) {
                                self.shared.results.publish(result);
                            } else {
                                warn!(
                                    target: "ai",
                                    seq = result.seq,
                                    inflight = ?inflight,
                                    "result for unknown sequence, dropping"
                                );
                            }
                            inflight = None;
                            credit = true;
                        }
                        Inbound::Credit => {
                            // Explicit credit return without a result.
                            inflight = None;
                            credit = true;
                        }
                        Inbound::Error { code, message } => {
                            warn!(target: "ai", code, message = %message, "worker error");
                        }
                        Inbound::Quiet => {}
                        Inbound::Protocol => {
                            warn!(target: "ai", "unexpected envelope kind, resetting connection");
                            return ConnEnd::Failed;
                        }
                    }
                }
            }
        }
    }
}

impl Default for AiClient {
    fn default() -> Self {
        Self::new()
    }
}

enum ConnEnd {
    Shutdown,
    Failed,
}

/// `{prefix}-{epoch-ms}-{random}`; fresh on every connect.
fn fresh_stream_id(prefix: &str) -> String {
    format!("{prefix}-{}-{:06x}", now_epoch_ms(), rand::random::<u32>() & 0x00ff_ffff)
}

/// What a steady-state inbound envelope means for the connection.
enum Inbound {
    Result(WorkerResult),
    /// Credit returned without a result.
    Credit,
    Error { code: i32, message: String },
    /// Refreshes the silence timer, nothing else (worker heartbeats,
    /// duplicate InitOk).
    Quiet,
    /// Inconsistent with the protocol; fatal to the connection.
    Protocol,
}

fn as_init_ok(envelope: super::proto::Envelope) -> Option<super::proto::InitOk> {
    use super::proto::envelope::Body;
    match envelope.body {
        Some(Body::Response(response)) => match response.kind {
            Some(response::Kind::InitOk(ok)) => Some(ok),
            _ => None,
        },
        _ => None,
    }
}

fn classify(envelope: super::proto::Envelope) -> Inbound {
    use super::proto::envelope::Body;
    match envelope.body {
        Some(Body::Response(response)) => match response.kind {
            Some(response::Kind::Result(result)) => Inbound::Result(result),
            Some(response::Kind::WindowUpdate(_)) => Inbound::Credit,
            Some(response::Kind::Error(e)) => Inbound::Error { code: e.code, message: e.message },
            Some(response::Kind::InitOk(_)) => Inbound::Quiet,
            None => Inbound::Protocol,
        },
        Some(Body::Heartbeat(_)) => Inbound::Quiet,
        _ => Inbound::Protocol,
    }
}

fn frame_to_wire(frame: &Frame) -> WireFrame {
    WireFrame {
        seq: frame.seq,
        ts_iso: frame.ts_iso.clone(),
        ts_mono_ns: frame.ts_mono_ns,
        width: frame.width,
        height: frame.height,
        pix_fmt: frame.pix_fmt.as_str().to_owned(),
        data: frame.data.to_vec(),
    }
}

async fn connect(addr: &str) -> anyhow::Result<TcpStream> {
    let mut last_err: Option<std::io::Error> = None;
    for resolved in tokio::net::lookup_host(addr).await.context("resolving worker address")? {
        let socket = if resolved.is_ipv4() { TcpSocket::new_v4() } else { TcpSocket::new_v6() }
            .context("creating socket")?;
        socket.set_keepalive(true).context("setting keepalive")?;
        match socket.connect(resolved).await {
            Ok(stream) => {
                stream.set_nodelay(true).context("setting nodelay")?;
                return Ok(stream);
            }
            Err(e) => last_err = Some(e),
        }
    }
    match last_err {
        Some(e) => Err(e).context(format!("connecting to {addr}")),
        None => anyhow::bail!("no addresses resolved for {addr}"),
    }
}

/// Sleep out the current backoff step and advance it. Returns `false` when
/// interrupted by shutdown.
async fn wait_backoff(idx: &mut usize, shutdown: &CancellationToken) -> bool {
    let delay = BACKOFF_STEPS[(*idx).min(BACKOFF_STEPS.len() - 1)];
    *idx += 1;
    tokio::select! {
        _ = shutdown.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

#[cfg(test)]
#[path = "client_tests.rs"]
mod tests;
