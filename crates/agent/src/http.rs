// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Status and control HTTP surface.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::{mpsc, Mutex};
use tower_http::cors::CorsLayer;

use crate::ai::client::AiClient;
use crate::ai::engine::SharedFilter;
use crate::classes;
use crate::error::ErrorCode;
use crate::publisher::{Publisher, StreamSnapshot};
use crate::status::{ManagerHandle, StatusState, StatusUpdate, WaitKind};

const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_millis(7000);
const WAIT_POLL: Duration = Duration::from_millis(100);

/// Everything the handlers need.
pub struct App {
    pub status: Arc<StatusState>,
    pub status_tx: mpsc::Sender<StatusUpdate>,
    pub manager: ManagerHandle,
    pub filter: SharedFilter,
    pub live: Publisher,
    pub record: Publisher,
    pub client: AiClient,
    /// Serializes control calls; a stop issued mid-start waits here until
    /// the start settles.
    pub control_lock: Mutex<()>,
}

pub type SharedApp = Arc<App>;

pub fn build_router(app: SharedApp) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/status", get(status))
        .route("/control/start", post(control_start))
        .route("/control/stop", post(control_stop))
        .route("/config/classes", get(get_classes).put(put_classes))
        .route("/config/classes/catalog", get(get_catalog))
        .layer(CorsLayer::permissive())
        .with_state(app)
}

fn error_response(code: ErrorCode, message: impl std::fmt::Display) -> Response {
    let status =
        StatusCode::from_u16(code.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(json!({ "error": code.as_str(), "message": message.to_string() })))
        .into_response()
}

fn stream_json(snapshot: &StreamSnapshot, include_last_stop: bool) -> serde_json::Value {
    let mut value = json!({
        "running": snapshot.running,
        "state": snapshot.state.as_str(),
        "startedAt": snapshot.started_at_ms,
    });
    if include_last_stop {
        value["lastStoppedAt"] = json!(snapshot.last_stopped_at_ms);
        value["lastExit"] = match snapshot.last_exit {
            Some(exit) => json!({ "code": exit.code, "signal": exit.signal }),
            None => serde_json::Value::Null,
        };
    }
    value
}

/// Assemble the full status document.
pub fn snapshot(app: &App) -> serde_json::Value {
    let status = &app.status;
    json!({
        "manager": {
            "state": status.manager_state().as_str(),
            "lastStartTs": status.last_start_ts(),
            "lastStopTs": status.last_stop_ts(),
            "overrides": status.overrides(),
        },
        "agent": {
            "startedAt": status.started_at_iso,
            "uptimeMs": status.uptime_ms(),
            "heartbeatTs": status.heartbeat_ts(),
            "ai": { "state": app.client.state().as_str() },
            "detections": {
                "total": status.detections_total(),
                "lastDetectionTs": status.last_detection_ts(),
                "droppedFrames": app.client.dropped_frames(),
            },
            "session": {
                "active": status.session_active(),
                "currentSessionId": status.current_session(),
                "lastSessionId": status.last_session(),
            },
            "streams": {
                "live": stream_json(&app.live.snapshot(), false),
                "record": stream_json(&app.record.snapshot(), true),
            },
        },
    })
}

// -- Handlers -----------------------------------------------------------------

/// `GET /healthz`
async fn healthz() -> impl IntoResponse {
    Json(json!({ "ok": true }))
}

/// `GET /status`
async fn status(State(app): State<SharedApp>) -> impl IntoResponse {
    Json(snapshot(&app))
}

#[derive(Debug, Deserialize)]
struct StartParams {
    wait: Option<String>,
    #[serde(rename = "timeoutMs")]
    timeout_ms: Option<u64>,
}

/// `POST /control/start` — begin the pipeline, optionally blocking until a
/// readiness predicate holds. A timed-out wait returns the current snapshot
/// with `wait_satisfied=false`; the start itself is not cancelled.
async fn control_start(
    State(app): State<SharedApp>,
    Query(params): Query<StartParams>,
) -> Response {
    let wait = match params.wait.as_deref().map(str::parse::<WaitKind>).transpose() {
        Ok(wait) => wait,
        Err(e) => return error_response(ErrorCode::BadRequest, e),
    };
    let timeout = params.timeout_ms.map(Duration::from_millis).unwrap_or(DEFAULT_WAIT_TIMEOUT);

    {
        let _guard = app.control_lock.lock().await;
        if let Err(e) = app.manager.start().await {
            return error_response(ErrorCode::Internal, format!("{e:#}"));
        }
    }

    let satisfied = match wait {
        None => true,
        Some(kind) => wait_for(&app, kind, timeout).await,
    };
    let mut body = snapshot(&app);
    body["wait_satisfied"] = json!(satisfied);
    Json(body).into_response()
}

/// `POST /control/stop`
async fn control_stop(State(app): State<SharedApp>) -> Response {
    let _guard = app.control_lock.lock().await;
    if let Err(e) = app.manager.stop().await {
        return error_response(ErrorCode::Internal, format!("{e:#}"));
    }
    drop(_guard);
    Json(snapshot(&app)).into_response()
}

/// Poll until the predicate holds or the timeout passes.
async fn wait_for(app: &App, kind: WaitKind, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    let heartbeat_baseline = app.status.heartbeat_ts();
    let detections_baseline = app.status.detections_total();

    loop {
        let satisfied = match kind {
            WaitKind::Child => {
                app.status.manager_state() == crate::status::ManagerState::Running
            }
            WaitKind::Heartbeat => app.status.heartbeat_ts() != heartbeat_baseline,
            WaitKind::Detection => app.status.detections_total() > detections_baseline,
            WaitKind::Session => app.status.session_active(),
        };
        if satisfied {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(WAIT_POLL).await;
    }
}

/// `GET /config/classes`
async fn get_classes(State(app): State<SharedApp>) -> impl IntoResponse {
    let mut classes: Vec<String> = app.filter.read().classes.iter().cloned().collect();
    classes.sort();
    Json(json!({ "classes": classes }))
}

#[derive(Debug, Deserialize)]
struct ClassesBody {
    classes: Vec<String>,
}

/// `PUT /config/classes` — override the class filter at runtime. Takes
/// effect at the next filter evaluation; in-flight results are untouched.
async fn put_classes(
    State(app): State<SharedApp>,
    Json(body): Json<ClassesBody>,
) -> Response {
    if let Err(e) = classes::validate_filter(&body.classes) {
        return error_response(ErrorCode::BadRequest, e);
    }
    app.filter.write().classes = body.classes.iter().cloned().collect();
    let _ = app.status_tx.send(StatusUpdate::Overrides(body.classes.clone())).await;
    Json(json!({ "classes": body.classes })).into_response()
}

/// `GET /config/classes/catalog`
async fn get_catalog() -> impl IntoResponse {
    Json(json!({ "classes": classes::CATALOG.as_slice() }))
}

#[cfg(test)]
#[path = "http_tests.rs"]
mod tests;
