// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Protocol tests against an in-process mock inference worker.

use std::time::Duration;

use bytes::Bytes;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use kestrel::ai::client::{AiClient, ClientConfig, ClientState, InitParams};
use kestrel::ai::proto::{envelope::Body, request, response, BBox, Detection, Envelope, InitOk, Result as WorkerResult};
use kestrel::ai::wire;
use kestrel::event::{Frame, PixelFormat};

fn client_config(addr: std::net::SocketAddr) -> ClientConfig {
    ClientConfig {
        addr: addr.to_string(),
        stream_prefix: "cam-01".to_owned(),
        init: InitParams {
            model_path: "/models/yolo.onnx".to_owned(),
            width: 4,
            height: 4,
            confidence_threshold: 0.4,
            classes_filter: vec!["person".to_owned()],
        },
    }
}

fn frame(seq: u64) -> Frame {
    Frame {
        seq,
        ts_iso: "2026-08-01T10:00:00.000Z".to_owned(),
        ts_mono_ns: seq * 83_000_000,
        width: 4,
        height: 4,
        pix_fmt: PixelFormat::Rgb,
        data: Bytes::from(vec![7u8; 48]),
    }
}

fn result_for(seq: u64) -> response::Kind {
    response::Kind::Result(WorkerResult {
        seq,
        ts_iso: "2026-08-01T10:00:00.050Z".to_owned(),
        detections: vec![Detection {
            cls: "person".to_owned(),
            conf: 0.9,
            bbox: Some(BBox { x: 0.5, y: 0.5, w: 0.2, h: 0.4 }),
            track_id: None,
        }],
        latency: None,
    })
}

/// Accept one connection, answer the handshake, and forward every
/// subsequent inbound envelope to `seen`. Replies to frames are driven by
/// the `replies` channel: each received frame seq is echoed there and a
/// result is sent only when `auto_reply`.
async fn serve_connection(
    socket: TcpStream,
    seen: mpsc::Sender<Envelope>,
    auto_reply: bool,
) -> anyhow::Result<String> {
    let (mut reader, mut writer) = socket.into_split();

    let first = wire::read_envelope(&mut reader).await?;
    let stream_id = first.stream_id.clone();
    anyhow::ensure!(
        matches!(
            first.body,
            Some(Body::Request(ref r)) if matches!(r.kind, Some(request::Kind::Init(_)))
        ),
        "first message must be Init"
    );
    seen.send(first).await.ok();

    let init_ok = wire::response(
        &stream_id,
        response::Kind::InitOk(InitOk {
            runtime: "onnxruntime".to_owned(),
            model_id: "yolo-v8n".to_owned(),
            providers: vec!["cpu".to_owned()],
            max_frame_bytes: 50 * 1024 * 1024,
            preprocess: None,
        }),
    );
    wire::write_envelope(&mut writer, &init_ok).await?;

    loop {
        let envelope = wire::read_envelope(&mut reader).await?;
        let frame_seq = match &envelope.body {
            Some(Body::Request(r)) => match &r.kind {
                Some(request::Kind::Frame(f)) => Some(f.seq),
                _ => None,
            },
            _ => None,
        };
        seen.send(envelope).await.ok();
        if auto_reply {
            if let Some(seq) = frame_seq {
                let reply = wire::response(&stream_id, result_for(seq));
                wire::write_envelope(&mut writer, &reply).await?;
            }
        }
    }
}

async fn wait_for_state(client: &AiClient, want: ClientState, timeout: Duration) -> bool {
    let mut watch = client.state_watch();
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if *watch.borrow() == want {
            return true;
        }
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            return false;
        }
        if tokio::time::timeout(remaining, watch.changed()).await.is_err() {
            return *watch.borrow() == want;
        }
    }
}

fn frame_seq(envelope: &Envelope) -> Option<u64> {
    match &envelope.body {
        Some(Body::Request(r)) => match &r.kind {
            Some(request::Kind::Frame(f)) => Some(f.seq),
            _ => None,
        },
        _ => None,
    }
}

fn is_heartbeat(envelope: &Envelope) -> bool {
    matches!(envelope.body, Some(Body::Heartbeat(_)))
}

#[tokio::test]
async fn handshake_then_frames_flow_with_single_credit() -> anyhow::Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let (seen_tx, mut seen) = mpsc::channel(64);
    tokio::spawn(async move {
        if let Ok((socket, _)) = listener.accept().await {
            let _ = serve_connection(socket, seen_tx, true).await;
        }
    });

    let client = AiClient::new();
    let results = client.subscribe_results();
    let shutdown = CancellationToken::new();
    {
        let client = client.clone();
        let config = client_config(addr);
        let shutdown = shutdown.clone();
        tokio::spawn(async move { client.run(config, shutdown).await });
    }

    assert!(wait_for_state(&client, ClientState::Ready, Duration::from_secs(2)).await);

    // Init was the first message on the wire.
    let init = seen.recv().await.ok_or_else(|| anyhow::anyhow!("no init"))?;
    match init.body {
        Some(Body::Request(r)) => match r.kind {
            Some(request::Kind::Init(i)) => {
                assert_eq!(i.model_path, "/models/yolo.onnx");
                assert_eq!(i.classes_filter, vec!["person".to_owned()]);
            }
            other => anyhow::bail!("unexpected kind: {other:?}"),
        },
        other => anyhow::bail!("unexpected body: {other:?}"),
    }

    // Each frame is answered and returns the credit for the next.
    client.send_frame(frame(1));
    let result = results.recv().await;
    assert_eq!(result.seq, 1);

    client.send_frame(frame(2));
    let result = results.recv().await;
    assert_eq!(result.seq, 2);

    // The worker saw strictly increasing sequence numbers.
    let mut sent = Vec::new();
    while let Ok(envelope) = seen.try_recv() {
        if let Some(seq) = frame_seq(&envelope) {
            sent.push(seq);
        }
    }
    assert_eq!(sent, vec![1, 2]);
    assert_eq!(client.dropped_frames(), 0);

    shutdown.cancel();
    assert!(wait_for_state(&client, ClientState::Shutdown, Duration::from_secs(2)).await);
    Ok(())
}

#[tokio::test]
async fn stalled_worker_triggers_latest_wins_drops() -> anyhow::Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let (seen_tx, mut seen) = mpsc::channel(64);
    // No replies: the credit never comes back after the first frame.
    tokio::spawn(async move {
        if let Ok((socket, _)) = listener.accept().await {
            let _ = serve_connection(socket, seen_tx, false).await;
        }
    });

    let client = AiClient::new();
    let shutdown = CancellationToken::new();
    {
        let client = client.clone();
        let config = client_config(addr);
        let shutdown = shutdown.clone();
        tokio::spawn(async move { client.run(config, shutdown).await });
    }
    assert!(wait_for_state(&client, ClientState::Ready, Duration::from_secs(2)).await);
    let _init = seen.recv().await;

    // First frame takes the credit and goes out.
    client.send_frame(frame(1));
    let first = seen.recv().await.ok_or_else(|| anyhow::anyhow!("no frame"))?;
    assert_eq!(frame_seq(&first), Some(1));

    // Twelve more land in the pending slot; eleven get replaced.
    for seq in 2..=13 {
        client.send_frame(frame(seq));
    }
    assert_eq!(client.dropped_frames(), 11);

    // Nothing else was sent while the credit was out (heartbeats aside).
    tokio::time::sleep(Duration::from_millis(100)).await;
    while let Ok(envelope) = seen.try_recv() {
        assert!(is_heartbeat(&envelope), "unexpected send while stalled: {envelope:?}");
    }

    shutdown.cancel();
    Ok(())
}

#[tokio::test]
async fn disconnect_triggers_rehandshake_with_fresh_stream_id() -> anyhow::Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let (seen_tx, mut seen) = mpsc::channel(64);

    // First connection dies right after InitOk; second one stays up.
    tokio::spawn(async move {
        if let Ok((socket, _)) = listener.accept().await {
            let (mut reader, mut writer) = socket.into_split();
            if let Ok(init) = wire::read_envelope(&mut reader).await {
                let stream_id = init.stream_id.clone();
                seen_tx.send(init).await.ok();
                let ok = wire::response(
                    &stream_id,
                    response::Kind::InitOk(InitOk::default()),
                );
                let _ = wire::write_envelope(&mut writer, &ok).await;
            }
            // Drop the connection.
        }
        if let Ok((socket, _)) = listener.accept().await {
            let _ = serve_connection(socket, seen_tx, true).await;
        }
    });

    let client = AiClient::new();
    let shutdown = CancellationToken::new();
    {
        let client = client.clone();
        let config = client_config(addr);
        let shutdown = shutdown.clone();
        tokio::spawn(async move { client.run(config, shutdown).await });
    }

    let first_init = seen.recv().await.ok_or_else(|| anyhow::anyhow!("no first init"))?;
    // After the drop, the client backs off (500 ms) and re-handshakes.
    let second_init = tokio::time::timeout(Duration::from_secs(5), seen.recv())
        .await?
        .ok_or_else(|| anyhow::anyhow!("no second init"))?;

    assert_ne!(first_init.stream_id, second_init.stream_id);
    assert!(second_init.stream_id.starts_with("cam-01-"));
    // Same handshake parameters on both connections.
    let params = |envelope: &Envelope| match &envelope.body {
        Some(Body::Request(r)) => match &r.kind {
            Some(request::Kind::Init(i)) => Some((i.model_path.clone(), i.classes_filter.clone())),
            _ => None,
        },
        _ => None,
    };
    assert_eq!(params(&first_init), params(&second_init));

    assert!(wait_for_state(&client, ClientState::Ready, Duration::from_secs(5)).await);

    // The revived connection carries frames again.
    let results = client.subscribe_results();
    client.send_frame(frame(100));
    let result = tokio::time::timeout(Duration::from_secs(2), results.recv()).await?;
    assert_eq!(result.seq, 100);

    shutdown.cancel();
    Ok(())
}

#[tokio::test]
async fn heartbeats_flow_while_idle() -> anyhow::Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let (seen_tx, mut seen) = mpsc::channel(64);
    tokio::spawn(async move {
        if let Ok((socket, _)) = listener.accept().await {
            let _ = serve_connection(socket, seen_tx, true).await;
        }
    });

    let client = AiClient::new();
    let shutdown = CancellationToken::new();
    {
        let client = client.clone();
        let config = client_config(addr);
        let shutdown = shutdown.clone();
        tokio::spawn(async move { client.run(config, shutdown).await });
    }
    assert!(wait_for_state(&client, ClientState::Ready, Duration::from_secs(2)).await);
    let _init = seen.recv().await;

    // With no frames offered, a heartbeat arrives within ~2 s.
    let envelope = tokio::time::timeout(Duration::from_millis(3500), seen.recv())
        .await?
        .ok_or_else(|| anyhow::anyhow!("no heartbeat"))?;
    assert!(is_heartbeat(&envelope), "expected heartbeat, got {envelope:?}");

    shutdown.cancel();
    Ok(())
}

#[tokio::test]
async fn worker_that_never_answers_init_is_abandoned() -> anyhow::Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    // Accept and say nothing.
    let accepted = std::sync::Arc::new(std::sync::atomic::AtomicU32::new(0));
    {
        let accepted = std::sync::Arc::clone(&accepted);
        tokio::spawn(async move {
            loop {
                if let Ok((socket, _)) = listener.accept().await {
                    accepted.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                    // Hold the socket open without replying.
                    tokio::spawn(async move {
                        let _keep = socket;
                        tokio::time::sleep(Duration::from_secs(30)).await;
                    });
                }
            }
        });
    }

    let client = AiClient::new();
    let shutdown = CancellationToken::new();
    {
        let client = client.clone();
        let config = client_config(addr);
        let shutdown = shutdown.clone();
        tokio::spawn(async move { client.run(config, shutdown).await });
    }

    // Never reaches READY without an InitOk.
    assert!(!wait_for_state(&client, ClientState::Ready, Duration::from_millis(1500)).await);
    shutdown.cancel();
    Ok(())
}
