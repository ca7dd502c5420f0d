// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! HTTP client for the session store.
//!
//! Session open/close are fire-and-log: a failure leaves an orphaned
//! session upstream but never stops the agent. Ingestion is the
//! authoritative path and retries with linear backoff; the legacy
//! detection-only batcher drops its batch on flush failure.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::Context;
use bytes::Bytes;
use reqwest::multipart;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::detect::Detection;
use crate::event::now_epoch_ms;

pub const INGEST_ATTEMPTS: u32 = 3;
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
/// Linear retry backoff unit: `attempt * RETRY_BASE` plus jitter.
pub const RETRY_BASE: Duration = Duration::from_millis(500);
const RETRY_JITTER_MS: u64 = 100;

pub const BATCH_MAX: usize = 50;
pub const BATCH_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct OpenBody<'a> {
    session_id: &'a str,
    dev_id: &'a str,
    stream_path: &'a str,
    start_ts: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<&'a str>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CloseBody<'a> {
    session_id: &'a str,
    end_ts: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    post_roll_sec: Option<f64>,
}

/// JSON `meta` part of an ingest request.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestMeta {
    pub session_id: String,
    pub seq_no: u64,
    pub capture_ts: String,
    pub detections: Vec<Detection>,
}

/// One ingestion unit: metadata plus an optional representative JPEG.
#[derive(Debug, Clone)]
pub struct IngestJob {
    pub meta: IngestMeta,
    pub frame_jpeg: Option<Bytes>,
}

/// Legacy detection-only record for the batched flush path.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectionRecord {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub capture_ts: String,
    pub detections: Vec<Detection>,
}

/// Client for the session store REST API.
#[derive(Clone)]
pub struct StoreClient {
    base_url: String,
    device_id: String,
    client: reqwest::Client,
    counter: std::sync::Arc<AtomicU64>,
    retry_base: Duration,
}

impl StoreClient {
    pub fn new(base_url: impl Into<String>, device_id: impl Into<String>) -> Self {
        let _ = rustls::crypto::ring::default_provider().install_default();
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            base_url: base_url.into(),
            device_id: device_id.into(),
            client,
            counter: std::sync::Arc::new(AtomicU64::new(0)),
            retry_base: RETRY_BASE,
        }
    }

    /// Shrink the retry backoff (tests).
    pub fn with_retry_base(mut self, base: Duration) -> Self {
        self.retry_base = base;
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Mint the next session identifier: `sess_{device}_{epoch-ms}_{n}`.
    /// Unique process-wide by the counter; unique globally by device + time.
    pub fn next_session_id(&self) -> String {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        format!("sess_{}_{}_{}", self.device_id, now_epoch_ms(), n)
    }

    /// Open a session; returns the generated identifier.
    pub async fn open(&self, stream_path: &str, start_ts: &str) -> anyhow::Result<String> {
        let session_id = self.next_session_id();
        let body = OpenBody {
            session_id: &session_id,
            dev_id: &self.device_id,
            stream_path,
            start_ts,
            reason: None,
        };
        self.client
            .post(self.url("/sessions/open"))
            .json(&body)
            .send()
            .await
            .context("posting session open")?
            .error_for_status()
            .context("session open rejected")?;
        Ok(session_id)
    }

    /// Finalize a session.
    pub async fn close(
        &self,
        session_id: &str,
        end_ts: &str,
        post_roll_sec: Option<f64>,
    ) -> anyhow::Result<()> {
        let body = CloseBody { session_id, end_ts, post_roll_sec };
        self.client
            .post(self.url("/sessions/close"))
            .json(&body)
            .send()
            .await
            .context("posting session close")?
            .error_for_status()
            .context("session close rejected")?;
        Ok(())
    }

    /// Multipart ingest with up to three attempts and linear backoff.
    pub async fn ingest(&self, job: &IngestJob) -> anyhow::Result<()> {
        let mut last_err = None;
        for attempt in 1..=INGEST_ATTEMPTS {
            match self.ingest_once(job).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    debug!(target: "store", attempt, error = %format!("{e:#}"), "ingest attempt failed");
                    last_err = Some(e);
                }
            }
            if attempt < INGEST_ATTEMPTS {
                let backoff = self.retry_base * attempt
                    + Duration::from_millis(rand::random::<u64>() % RETRY_JITTER_MS);
                tokio::time::sleep(backoff).await;
            }
        }
        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("ingest failed")))
    }

    async fn ingest_once(&self, job: &IngestJob) -> anyhow::Result<()> {
        let meta = serde_json::to_string(&job.meta).context("serializing ingest meta")?;
        let mut form = multipart::Form::new().part(
            "meta",
            multipart::Part::text(meta)
                .mime_str("application/json")
                .context("meta part mime")?,
        );
        if let Some(jpeg) = &job.frame_jpeg {
            form = form.part(
                "frame",
                multipart::Part::bytes(jpeg.to_vec())
                    .file_name("frame.jpg")
                    .mime_str("image/jpeg")
                    .context("frame part mime")?,
            );
        }
        self.client
            .post(self.url("/ingest"))
            .multipart(form)
            .send()
            .await
            .context("posting ingest")?
            .error_for_status()
            .context("ingest rejected")?;
        Ok(())
    }

    /// Post one legacy detection batch. No retries: callers drop on failure.
    pub async fn flush_batch(&self, batch: &[DetectionRecord]) -> anyhow::Result<()> {
        self.client
            .post(self.url("/detections"))
            .json(&serde_json::json!({ "items": batch }))
            .send()
            .await
            .context("posting detection batch")?
            .error_for_status()
            .context("detection batch rejected")?;
        Ok(())
    }
}

/// Bounded accumulator for the legacy flush path.
pub struct Batch<T> {
    items: Vec<T>,
    max: usize,
}

impl<T> Batch<T> {
    pub fn new(max: usize) -> Self {
        Self { items: Vec::new(), max }
    }

    /// Add an item; returns the full batch when the size bound is reached.
    pub fn push(&mut self, item: T) -> Option<Vec<T>> {
        self.items.push(item);
        if self.items.len() >= self.max {
            Some(std::mem::take(&mut self.items))
        } else {
            None
        }
    }

    /// Drain whatever has accumulated.
    pub fn take(&mut self) -> Vec<T> {
        std::mem::take(&mut self.items)
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Run the legacy batcher: flush on size or interval, whichever comes
/// first; a failed flush drops the batch.
pub async fn run_batcher(
    store: StoreClient,
    mut records: mpsc::Receiver<DetectionRecord>,
    shutdown: CancellationToken,
) {
    let mut batch = Batch::new(BATCH_MAX);
    let mut tick = tokio::time::interval(BATCH_INTERVAL);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                flush(&store, batch.take()).await;
                return;
            }
            record = records.recv() => {
                match record {
                    Some(record) => {
                        if let Some(full) = batch.push(record) {
                            flush(&store, full).await;
                        }
                    }
                    None => {
                        flush(&store, batch.take()).await;
                        return;
                    }
                }
            }
            _ = tick.tick() => {
                if !batch.is_empty() {
                    flush(&store, batch.take()).await;
                }
            }
        }
    }
}

async fn flush(store: &StoreClient, batch: Vec<DetectionRecord>) {
    if batch.is_empty() {
        return;
    }
    let size = batch.len();
    if let Err(e) = store.flush_batch(&batch).await {
        warn!(target: "store", size, error = %format!("{e:#}"), "detection batch dropped");
    }
}

#[cfg(test)]
#[path = "store_tests.rs"]
mod tests;
