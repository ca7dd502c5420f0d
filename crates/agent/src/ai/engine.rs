// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Glue between frame capture, the worker client, and the event bus.
//!
//! Frames flow straight through to the client (which applies latest-wins).
//! Results come back, get filtered by class and confidence, and leave as
//! `ai.detection` events; prolonged silence turns into `ai.keepalive`.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::bus::{Bus, Subscription};
use crate::detect::{BBox, Detection};
use crate::event::{now_iso, DetectionEvent, Frame, KeepaliveEvent, ResultMeta};

use super::client::AiClient;
use super::proto;

/// Emit a keepalive after this much detection-traffic silence.
pub const KEEPALIVE_AFTER: Duration = Duration::from_secs(2);

/// Runtime-adjustable result filter.
#[derive(Debug, Clone)]
pub struct FilterConfig {
    pub confidence_threshold: f32,
    /// Empty set accepts all classes.
    pub classes: HashSet<String>,
}

impl FilterConfig {
    pub fn new(confidence_threshold: f32, classes: impl IntoIterator<Item = String>) -> Self {
        Self { confidence_threshold, classes: classes.into_iter().collect() }
    }
}

/// Shared handle so the control surface can swap the filter atomically.
pub type SharedFilter = Arc<RwLock<FilterConfig>>;

/// Keep the detections that pass the filter. Pure.
pub fn apply_filter(detections: Vec<Detection>, filter: &FilterConfig) -> Vec<Detection> {
    detections
        .into_iter()
        .filter(|d| {
            d.conf >= filter.confidence_threshold
                && (filter.classes.is_empty() || filter.classes.contains(&d.cls))
        })
        .collect()
}

/// Max confidence among surviving detections; 0 for none.
pub fn score(detections: &[Detection]) -> f32 {
    detections.iter().map(|d| d.conf).fold(0.0, f32::max)
}

/// Convert wire detections, dropping any that violate the geometry or
/// confidence invariants.
pub fn convert_detections(wire: Vec<proto::Detection>) -> Vec<Detection> {
    wire.into_iter()
        .filter_map(|d| {
            let Some(bbox) = d.bbox else {
                warn!(target: "ai", cls = %d.cls, "detection without bbox, dropping");
                return None;
            };
            let detection = Detection {
                cls: d.cls,
                conf: d.conf,
                bbox: BBox { x: bbox.x, y: bbox.y, w: bbox.w, h: bbox.h },
                track_id: d.track_id,
            };
            if !detection.is_valid() {
                warn!(
                    target: "ai",
                    cls = %detection.cls,
                    conf = detection.conf,
                    "detection outside normalized bounds, dropping"
                );
                return None;
            }
            Some(detection)
        })
        .collect()
}

/// Run the engine until shutdown.
pub async fn run(
    mut frames: mpsc::Receiver<Frame>,
    results: Subscription<proto::Result>,
    client: AiClient,
    bus: Arc<Bus>,
    filter: SharedFilter,
    shutdown: CancellationToken,
) {
    let mut last_traffic = tokio::time::Instant::now();

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            frame = frames.recv() => {
                match frame {
                    Some(frame) => client.send_frame(frame),
                    None => return,
                }
            }
            result = results.recv() => {
                last_traffic = tokio::time::Instant::now();
                let detections = convert_detections(result.detections);
                let surviving = apply_filter(detections, &filter.read());
                let event = DetectionEvent {
                    relevant: !surviving.is_empty(),
                    score: score(&surviving),
                    meta: ResultMeta { seq: result.seq, ts_iso: result.ts_iso },
                    detections: surviving,
                };
                bus.detection.publish(event);
            }
            _ = tokio::time::sleep_until(last_traffic + KEEPALIVE_AFTER) => {
                bus.keepalive.publish(KeepaliveEvent { ts_iso: now_iso() });
                last_traffic = tokio::time::Instant::now();
            }
        }
    }
}

#[cfg(test)]
#[path = "engine_tests.rs"]
mod tests;
