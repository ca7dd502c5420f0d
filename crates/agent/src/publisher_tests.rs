// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use super::*;

fn sleeper(shutdown: CancellationToken) -> Publisher {
    Publisher::new(
        "record",
        "sh".to_owned(),
        vec!["-c".to_owned(), "sleep 30".to_owned()],
        shutdown,
    )
}

async fn wait_running(publisher: &Publisher, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if publisher.is_running() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

#[test]
fn restart_delay_is_capped_doubling() {
    assert_eq!(restart_delay(0), Duration::from_millis(500));
    assert_eq!(restart_delay(1), Duration::from_millis(1000));
    assert_eq!(restart_delay(2), Duration::from_millis(2000));
    assert_eq!(restart_delay(3), Duration::from_millis(4000));
    assert_eq!(restart_delay(4), Duration::from_millis(5000));
    assert_eq!(restart_delay(10), Duration::from_millis(5000));
}

#[test]
fn rtsp_command_shape() {
    let settings = PublisherSettings {
        shm_socket: "/tmp/kestrel-shm".into(),
        width: 1280,
        height: 720,
        fps: 12,
        url: "rtsp://relay:8554/cam-01/record".to_owned(),
    };
    let (program, args) = rtsp_command(&settings, Encoder::X264);
    assert_eq!(program, "gst-launch-1.0");
    assert_eq!(args[0], "shmsrc");
    assert!(args.contains(&"x264enc".to_owned()));
    assert!(args.contains(&"h264parse".to_owned()));
    assert!(args.contains(&"location=rtsp://relay:8554/cam-01/record".to_owned()));
    assert!(args.contains(&"protocols=tcp".to_owned()));
    assert!(args.contains(&"latency=50".to_owned()));
}

#[test]
fn hardware_encoders_precede_software_fallback() {
    assert_eq!(Encoder::NvH264.element(), "nvh264enc");
    assert_eq!(Encoder::X264.element(), "x264enc");
}

#[tokio::test]
async fn start_then_stop_leaves_idle_without_restart() -> anyhow::Result<()> {
    let shutdown = CancellationToken::new();
    let publisher = sleeper(shutdown.clone());

    publisher.start();
    assert!(wait_running(&publisher, Duration::from_secs(2)).await);

    publisher.stop(Duration::from_secs(2)).await;
    // Allow the supervise loop to observe the exit.
    tokio::time::sleep(Duration::from_millis(200)).await;

    let snapshot = publisher.snapshot();
    assert_eq!(snapshot.state, PubState::Idle);
    assert!(!snapshot.running);
    assert!(snapshot.last_exit.is_some());

    // No restart may happen after an explicit stop.
    tokio::time::sleep(Duration::from_millis(700)).await;
    assert!(!publisher.is_running());
    shutdown.cancel();
    Ok(())
}

#[tokio::test]
async fn external_kill_triggers_auto_restart() -> anyhow::Result<()> {
    let shutdown = CancellationToken::new();
    let publisher = sleeper(shutdown.clone());

    publisher.start();
    assert!(wait_running(&publisher, Duration::from_secs(2)).await);
    let first_pid = publisher.inner.current.lock().clone().map(|c| c.pid());

    // Simulate a crash.
    if let Some(child) = publisher.inner.current.lock().clone() {
        child.signal(nix::sys::signal::Signal::SIGKILL);
    }

    // First restart is due within 500 ms plus spawn time.
    assert!(wait_running(&publisher, Duration::from_secs(2)).await);
    let second_pid = publisher.inner.current.lock().clone().map(|c| c.pid());
    assert_ne!(first_pid, second_pid);

    publisher.stop(Duration::from_secs(2)).await;
    shutdown.cancel();
    Ok(())
}

#[tokio::test]
async fn stop_while_idle_is_noop() {
    let shutdown = CancellationToken::new();
    let publisher = sleeper(shutdown.clone());
    publisher.stop(Duration::from_millis(100)).await;
    assert_eq!(publisher.snapshot().state, PubState::Idle);
    shutdown.cancel();
}
