// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::path::PathBuf;

use tokio::sync::mpsc;

use super::*;
use crate::config::SourceConfig;

fn network_source() -> SourceConfig {
    SourceConfig {
        url: Some("rtsp://10.0.0.2:554/main".to_owned()),
        device: None,
        width: 1280,
        height: 720,
        fps: 12,
        shm_socket: PathBuf::from("/tmp/kestrel-shm"),
        shm_size_mib: 64,
    }
}

#[test]
fn network_pipeline_args() {
    let args = pipeline_args(&network_source());
    assert_eq!(args[0], "rtspsrc");
    assert!(args.contains(&"location=rtsp://10.0.0.2:554/main".to_owned()));
    assert!(args.contains(&"decodebin".to_owned()));
    assert!(args.contains(&"video/x-raw,format=I420,width=1280,height=720,framerate=12/1".to_owned()));
    assert!(args.contains(&"socket-path=/tmp/kestrel-shm".to_owned()));
    assert!(args.contains(&format!("shm-size={}", 64 * 1024 * 1024)));
    assert!(args.contains(&"wait-for-connection=false".to_owned()));
}

#[test]
fn local_device_pipeline_args() {
    let mut source = network_source();
    source.url = None;
    source.device = Some("/dev/video0".to_owned());
    let args = pipeline_args(&source);
    assert_eq!(args[0], "v4l2src");
    assert!(args.contains(&"device=/dev/video0".to_owned()));
    assert!(!args.contains(&"rtspsrc".to_owned()));
}

#[tokio::test]
async fn ready_on_playing_log_line() {
    let (tx, mut rx) = mpsc::channel(4);
    tx.send("Setting pipeline to PLAYING ...".to_owned()).await.ok();
    let readiness = await_ready(&PathBuf::from("/nonexistent/socket"), &mut rx).await;
    assert_eq!(readiness, Readiness::Playing);
}

#[tokio::test]
async fn ready_on_socket_existence() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let socket = dir.path().join("shm");
    std::fs::write(&socket, b"")?;
    let (_tx, mut rx) = mpsc::channel::<String>(4);
    let readiness = await_ready(&socket, &mut rx).await;
    assert_eq!(readiness, Readiness::Socket);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn readiness_times_out_and_assumes_ready() {
    let (_tx, mut rx) = mpsc::channel::<String>(4);
    let readiness = await_ready(&PathBuf::from("/nonexistent/socket"), &mut rx).await;
    assert_eq!(readiness, Readiness::Timeout);
}
