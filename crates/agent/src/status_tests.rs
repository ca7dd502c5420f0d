// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;

#[test]
fn fresh_state_is_stopped_and_sessionless() {
    let state = StatusState::new();
    assert_eq!(state.manager_state(), ManagerState::Stopped);
    assert!(!state.session_active());
    assert_eq!(state.detections_total(), 0);
    assert!(state.current_session().is_none());
    assert!(state.heartbeat_ts().is_none());
}

#[test]
fn detection_updates_counter_and_timestamp() {
    let state = StatusState::new();
    state.apply(StatusUpdate::Detection);
    state.apply(StatusUpdate::Detection);
    assert_eq!(state.detections_total(), 2);
    assert!(state.last_detection_ts().is_some());
}

#[test]
fn session_open_close_tracks_current_and_last() {
    let state = StatusState::new();
    state.apply(StatusUpdate::SessionOpened("sess_cam_1_0".to_owned()));
    assert!(state.session_active());
    assert_eq!(state.current_session().as_deref(), Some("sess_cam_1_0"));
    assert!(state.last_session().is_none());

    state.apply(StatusUpdate::SessionClosed);
    assert!(!state.session_active());
    assert!(state.current_session().is_none());
    assert_eq!(state.last_session().as_deref(), Some("sess_cam_1_0"));

    // A second close is harmless and keeps the last session id.
    state.apply(StatusUpdate::SessionClosed);
    assert_eq!(state.last_session().as_deref(), Some("sess_cam_1_0"));
}

#[test]
fn overrides_record_the_application_time() {
    let state = StatusState::new();
    state.apply(StatusUpdate::Overrides(vec!["person".to_owned()]));
    let info = state.overrides();
    assert!(info.is_some());
    let info = info.map(|o| o.classes).unwrap_or_default();
    assert_eq!(info, vec!["person".to_owned()]);
}

#[test]
fn wait_kind_parses_known_predicates() {
    assert_eq!("child".parse::<WaitKind>(), Ok(WaitKind::Child));
    assert_eq!("heartbeat".parse::<WaitKind>(), Ok(WaitKind::Heartbeat));
    assert_eq!("detection".parse::<WaitKind>(), Ok(WaitKind::Detection));
    assert_eq!("session".parse::<WaitKind>(), Ok(WaitKind::Session));
    assert!("banana".parse::<WaitKind>().is_err());
}

#[tokio::test]
async fn updater_applies_queued_updates_in_order() -> anyhow::Result<()> {
    let state = std::sync::Arc::new(StatusState::new());
    let (tx, rx) = mpsc::channel(16);
    let shutdown = CancellationToken::new();
    tokio::spawn(run_updater(std::sync::Arc::clone(&state), rx, shutdown.clone()));

    tx.send(StatusUpdate::Manager(ManagerState::Starting)).await?;
    tx.send(StatusUpdate::Manager(ManagerState::Running)).await?;
    tx.send(StatusUpdate::ManagerStarted).await?;
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    assert_eq!(state.manager_state(), ManagerState::Running);
    assert!(state.last_start_ts().is_some());
    shutdown.cancel();
    Ok(())
}
