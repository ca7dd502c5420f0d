// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Composition root: wires every component, supervises their lifecycles,
//! and tears them down in reverse construction order on shutdown.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::ai::client::{AiClient, ClientConfig, InitParams};
use crate::ai::engine::{self, FilterConfig, SharedFilter};
use crate::bus::Bus;
use crate::capture::{self, CaptureControl, CaptureSettings};
use crate::config::{AgentConfig, Cli};
use crate::event::Command;
use crate::fsm::{self, FsmTimings, SessionFsm};
use crate::http::{self, App};
use crate::hub;
use crate::publisher::{Publisher, PublisherSettings, STOP_GRACE};
use crate::status::{
    self, ManagerHandle, ManagerRequest, ManagerState, StatusState, StatusUpdate,
};
use crate::store::{DetectionRecord, IngestJob, IngestMeta, StoreClient};

/// Pending ingest jobs; overflow drops the job, never stalls the executor.
const INGEST_QUEUE: usize = 16;

static PANICKED: AtomicBool = AtomicBool::new(false);

/// Initialize tracing from the config file with CLI/env overrides.
///
/// Uses `try_init` so it's safe to call multiple times (e.g. from tests).
pub fn init_tracing(cli: &Cli, config: &AgentConfig) {
    use tracing_subscriber::fmt;

    let level = cli.log_level.clone().unwrap_or_else(|| config.logging.level.clone());
    let format = cli.log_format.clone().unwrap_or_else(|| config.logging.format.clone());

    // Priority: explicit level > RUST_LOG > default ("info").
    let filter = if cli.log_level.is_none() && level == "info" {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&level))
    } else {
        EnvFilter::try_new(&level).unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let result = match format.as_str() {
        "json" => fmt::fmt().with_env_filter(filter).json().try_init(),
        _ => fmt::fmt().with_env_filter(filter).try_init(),
    };
    drop(result);
}

/// Run the agent to completion. Returns only after an orderly shutdown;
/// any error is an unrecoverable supervision failure.
pub async fn run(cli: Cli, config: AgentConfig) -> anyhow::Result<()> {
    init_tracing(&cli, &config);

    // reqwest is built against rustls without a baked-in provider.
    let _ = rustls::crypto::ring::default_provider().install_default();

    let shutdown = CancellationToken::new();
    install_panic_hook(shutdown.clone());

    // Status snapshot + its single update queue.
    let status_state = Arc::new(StatusState::new());
    let (status_tx, status_rx) = mpsc::channel(64);
    tokio::spawn(status::run_updater(Arc::clone(&status_state), status_rx, shutdown.clone()));

    let bus = Arc::new(Bus::new());
    let client = AiClient::new();
    let filter: SharedFilter = Arc::new(RwLock::new(FilterConfig::new(
        config.ai.confidence_threshold,
        config.ai.classes.iter().cloned(),
    )));
    let store = StoreClient::new(config.store.base_url.clone(), config.device.id.clone());

    let live = Publisher::rtsp(
        "live",
        &publisher_settings(&config, &config.relay.live_path),
        shutdown.clone(),
    );
    let record = Publisher::rtsp(
        "record",
        &publisher_settings(&config, &config.relay.record_path),
        shutdown.clone(),
    );

    // Status bridge: AI traffic and detections feed the snapshot.
    spawn_status_bridge(Arc::clone(&bus), status_tx.clone(), shutdown.clone());

    // Manager: owns the capture/inference pipeline, serves start/stop.
    let (manager_tx, manager_rx) = mpsc::channel(4);
    let manager = ManagerHandle::new(manager_tx);
    let manager_task = tokio::spawn(manager_loop(
        manager_rx,
        ManagerDeps {
            config: config.clone(),
            bus: Arc::clone(&bus),
            client: client.clone(),
            filter: Arc::clone(&filter),
            store: store.clone(),
            live: live.clone(),
            record: record.clone(),
            status_tx: status_tx.clone(),
        },
        shutdown.clone(),
    ));

    // Control/status HTTP surface.
    let app = Arc::new(App {
        status: Arc::clone(&status_state),
        status_tx: status_tx.clone(),
        manager: manager.clone(),
        filter: Arc::clone(&filter),
        live: live.clone(),
        record: record.clone(),
        client: client.clone(),
        control_lock: tokio::sync::Mutex::new(()),
    });
    let router = http::build_router(app);
    let addr = format!("{}:{}", config.status.host, config.status.port);
    let listener = TcpListener::bind(&addr).await?;
    info!("status listening on {}", listener.local_addr()?);
    {
        let sd = shutdown.clone();
        tokio::spawn(async move {
            let result =
                axum::serve(listener, router).with_graceful_shutdown(sd.cancelled_owned()).await;
            if let Err(e) = result {
                error!("status server error: {e}");
            }
        });
    }

    spawn_signal_handler(shutdown.clone());

    // The pipeline comes up with the agent; the control surface can stop
    // and restart it later.
    manager.start().await?;

    shutdown.cancelled().await;
    info!("shutting down");

    // The manager tears the pipeline down before its task ends; everything
    // else follows the cancelled token.
    let _ = manager_task.await;

    if PANICKED.load(Ordering::SeqCst) {
        anyhow::bail!("a component panicked; see log for the backtrace");
    }
    Ok(())
}

fn install_panic_hook(shutdown: CancellationToken) {
    let default = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        PANICKED.store(true, Ordering::SeqCst);
        default(info);
        shutdown.cancel();
    }));
}

fn publisher_settings(config: &AgentConfig, path: &str) -> PublisherSettings {
    PublisherSettings {
        shm_socket: config.source.shm_socket.clone(),
        width: config.source.width,
        height: config.source.height,
        fps: config.source.fps,
        url: config.rtsp_url(path),
    }
}

fn spawn_signal_handler(shutdown: CancellationToken) {
    tokio::spawn(async move {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()).ok();
        let mut sigint =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt()).ok();

        // First signal: graceful shutdown.
        tokio::select! {
            _ = async {
                if let Some(ref mut s) = sigterm { s.recv().await } else { std::future::pending().await }
            } => {
                info!("received SIGTERM");
            }
            _ = async {
                if let Some(ref mut s) = sigint { s.recv().await } else { std::future::pending().await }
            } => {
                info!("received SIGINT");
            }
        }
        shutdown.cancel();

        // Second signal: force exit.
        tokio::select! {
            _ = async {
                if let Some(ref mut s) = sigterm { s.recv().await } else { std::future::pending().await }
            } => {
                info!("received SIGTERM again, forcing exit");
            }
            _ = async {
                if let Some(ref mut s) = sigint { s.recv().await } else { std::future::pending().await }
            } => {
                info!("received SIGINT again, forcing exit");
            }
        }
        std::process::exit(130);
    });
}

/// Forward AI bus traffic into the status queue.
fn spawn_status_bridge(
    bus: Arc<Bus>,
    status_tx: mpsc::Sender<StatusUpdate>,
    shutdown: CancellationToken,
) {
    let detections = bus.detection.subscribe();
    let keepalives = bus.keepalive.subscribe();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                event = detections.recv() => {
                    let _ = status_tx.send(StatusUpdate::Heartbeat).await;
                    if event.relevant {
                        let _ = status_tx.send(StatusUpdate::Detection).await;
                    }
                }
                _ = keepalives.recv() => {
                    let _ = status_tx.send(StatusUpdate::Heartbeat).await;
                }
            }
        }
    });
}

struct ManagerDeps {
    config: AgentConfig,
    bus: Arc<Bus>,
    client: AiClient,
    filter: SharedFilter,
    store: StoreClient,
    live: Publisher,
    record: Publisher,
    status_tx: mpsc::Sender<StatusUpdate>,
}

/// A running pipeline: cancelling the token unwinds every task in it.
struct Pipeline {
    token: CancellationToken,
}

/// Serve start/stop requests; at most one pipeline exists at a time.
async fn manager_loop(
    mut requests: mpsc::Receiver<ManagerRequest>,
    deps: ManagerDeps,
    shutdown: CancellationToken,
) {
    let mut pipeline: Option<Pipeline> = None;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                if let Some(pipeline) = pipeline.take() {
                    stop_pipeline(&deps, pipeline).await;
                }
                return;
            }
            request = requests.recv() => match request {
                Some(ManagerRequest::Start(reply)) => {
                    if pipeline.is_none() {
                        pipeline = Some(start_pipeline(&deps, &shutdown).await);
                    }
                    let _ = reply.send(Ok(()));
                }
                Some(ManagerRequest::Stop(reply)) => {
                    if let Some(pipeline) = pipeline.take() {
                        stop_pipeline(&deps, pipeline).await;
                    }
                    let _ = reply.send(Ok(()));
                }
                None => return,
            },
        }
    }
}

async fn start_pipeline(deps: &ManagerDeps, shutdown: &CancellationToken) -> Pipeline {
    let _ = deps.status_tx.send(StatusUpdate::Manager(ManagerState::Starting)).await;
    let token = shutdown.child_token();
    let config = &deps.config;

    // Hub first: it owns the shared-memory segment everything reads.
    tokio::spawn(hub::run(config.source.clone(), token.clone()));

    // Frame capture, starting at the idle cadence.
    let (capture_control, mode_rx) = capture::control();
    let (frame_tx, frame_rx) = mpsc::channel(2);
    tokio::spawn(capture::run(
        CaptureSettings::from_config(config),
        frame_tx,
        mode_rx,
        token.clone(),
    ));

    // Worker client.
    let client_config = ClientConfig {
        addr: config.worker_addr(),
        stream_prefix: config.device.id.clone(),
        init: InitParams {
            model_path: config.ai.model_path.clone(),
            width: config.ai.width,
            height: config.ai.height,
            confidence_threshold: config.ai.confidence_threshold,
            classes_filter: config.ai.classes.clone(),
        },
    };
    {
        let client = deps.client.clone();
        let token = token.clone();
        tokio::spawn(async move { client.run(client_config, token).await });
    }

    // Engine bridges capture → client and client → bus.
    tokio::spawn(engine::run(
        frame_rx,
        deps.client.subscribe_results(),
        deps.client.clone(),
        Arc::clone(&deps.bus),
        Arc::clone(&deps.filter),
        token.clone(),
    ));

    // Session machine and its command executor.
    let (command_tx, command_rx) = mpsc::channel(16);
    tokio::spawn(fsm::run(
        SessionFsm::new(FsmTimings {
            dwell: config.dwell(),
            silence: config.silence(),
            post_roll: config.post_roll(),
        }),
        deps.bus.detection.subscribe(),
        deps.bus.keepalive.subscribe(),
        command_tx,
        token.clone(),
    ));
    spawn_command_executor(deps, command_rx, capture_control, token.clone());

    // Live view runs for the whole pipeline lifetime.
    deps.live.start();

    let _ = deps.status_tx.send(StatusUpdate::Manager(ManagerState::Running)).await;
    let _ = deps.status_tx.send(StatusUpdate::ManagerStarted).await;
    info!("pipeline started");

    Pipeline { token }
}

async fn stop_pipeline(deps: &ManagerDeps, pipeline: Pipeline) {
    let _ = deps.status_tx.send(StatusUpdate::Manager(ManagerState::Stopping)).await;

    // Publishers first (they hold RTSP sessions), then the reverse of
    // construction for everything on the token.
    deps.record.stop(STOP_GRACE).await;
    deps.live.stop(STOP_GRACE).await;
    pipeline.token.cancel();

    let _ = deps.status_tx.send(StatusUpdate::Manager(ManagerState::Stopped)).await;
    let _ = deps.status_tx.send(StatusUpdate::ManagerStopped).await;
    info!("pipeline stopped");
}

/// Execute session-machine commands in dispatch order and feed the store.
fn spawn_command_executor(
    deps: &ManagerDeps,
    mut commands: mpsc::Receiver<Command>,
    capture: CaptureControl,
    token: CancellationToken,
) {
    let store = deps.store.clone();
    let record = deps.record.clone();
    let status_tx = deps.status_tx.clone();
    let stream_path = deps.config.relay.record_path.clone();
    let detections = deps.bus.detection.subscribe();

    // Dedicated ingester so slow uploads never delay command dispatch.
    let (ingest_tx, mut ingest_rx) = mpsc::channel::<IngestJob>(INGEST_QUEUE);
    {
        let store = store.clone();
        let token = token.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => return,
                    job = ingest_rx.recv() => match job {
                        Some(job) => {
                            if let Err(e) = store.ingest(&job).await {
                                warn!(target: "store", error = %format!("{e:#}"), "ingest dropped after retries");
                            }
                        }
                        None => return,
                    },
                }
            }
        });
    }

    // Legacy detection-only batch flushes ride alongside ingestion.
    let (batch_tx, batch_rx) = mpsc::channel::<DetectionRecord>(64);
    tokio::spawn(crate::store::run_batcher(store.clone(), batch_rx, token.clone()));

    tokio::spawn(async move {
        let mut session: Option<String> = None;
        loop {
            tokio::select! {
                _ = token.cancelled() => return,
                command = commands.recv() => {
                    let Some(command) = command else { return };
                    match command {
                        Command::OpenSession { start_ts } => {
                            match store.open(&stream_path, &start_ts).await {
                                Ok(id) => {
                                    info!(target: "fsm", session = %id, "session opened");
                                    let _ = status_tx.send(StatusUpdate::SessionOpened(id.clone())).await;
                                    session = Some(id);
                                }
                                Err(e) => {
                                    // The agent carries on; the session is
                                    // tracked locally without a store id.
                                    warn!(target: "store", error = %format!("{e:#}"), "session open failed");
                                    let id = store.next_session_id();
                                    let _ = status_tx.send(StatusUpdate::SessionOpened(id.clone())).await;
                                    session = Some(id);
                                }
                            }
                        }
                        Command::CloseSession { end_ts, post_roll_sec } => {
                            if let Some(id) = session.take() {
                                if let Err(e) = store.close(&id, &end_ts, Some(post_roll_sec)).await {
                                    warn!(target: "store", session = %id, error = %format!("{e:#}"), "session close failed");
                                }
                                let _ = status_tx.send(StatusUpdate::SessionClosed).await;
                            }
                        }
                        Command::StartPublisher => record.start(),
                        Command::StopPublisher => record.stop(STOP_GRACE).await,
                        Command::SetCaptureMode(mode) => capture.set_mode(mode),
                    }
                }
                event = detections.recv() => {
                    if !event.relevant {
                        continue;
                    }
                    let flush_record = DetectionRecord {
                        session_id: session.clone(),
                        capture_ts: event.meta.ts_iso.clone(),
                        detections: event.detections.clone(),
                    };
                    let _ = batch_tx.try_send(flush_record);

                    if let Some(id) = &session {
                        let job = IngestJob {
                            meta: IngestMeta {
                                session_id: id.clone(),
                                seq_no: event.meta.seq,
                                capture_ts: event.meta.ts_iso.clone(),
                                detections: event.detections.clone(),
                            },
                            frame_jpeg: None,
                        };
                        if ingest_tx.try_send(job).is_err() {
                            warn!(target: "store", "ingest queue full, dropping job");
                        }
                    }
                }
            }
        }
    });
}
