// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use prost::Message;

use super::super::proto::{request, response, BBox, Detection, Frame, Heartbeat, Init, MsgType, Result as WorkerResult};
use super::*;

fn sample_frame() -> Envelope {
    request(
        "edge-1700000000000-abc123",
        request::Kind::Frame(Frame {
            seq: 42,
            ts_iso: "2026-08-01T10:00:00.000Z".to_owned(),
            ts_mono_ns: 123_456_789,
            width: 2,
            height: 1,
            pix_fmt: "RGB".to_owned(),
            data: vec![0, 1, 2, 3, 4, 5],
        }),
    )
}

fn sample_result() -> Envelope {
    response(
        "edge-1700000000000-abc123",
        response::Kind::Result(WorkerResult {
            seq: 42,
            ts_iso: "2026-08-01T10:00:00.120Z".to_owned(),
            detections: vec![Detection {
                cls: "person".to_owned(),
                conf: 0.92,
                bbox: Some(BBox { x: 0.5, y: 0.5, w: 0.25, h: 0.5 }),
                track_id: Some("t1".to_owned()),
            }],
            latency: None,
        }),
    )
}

#[test]
fn framed_round_trip_is_exact() -> anyhow::Result<()> {
    for envelope in [sample_frame(), sample_result()] {
        let framed = encode(&envelope)?;
        let payload = &framed[4..];
        let decoded = decode(payload)?;
        assert_eq!(decoded, envelope);
        // Re-encoding the decoded message reproduces the original bytes.
        let reframed = encode(&decoded)?;
        assert_eq!(reframed, framed);
    }
    Ok(())
}

#[test]
fn prefix_is_little_endian_payload_length() -> anyhow::Result<()> {
    let framed = encode(&sample_frame())?;
    let len = u32::from_le_bytes([framed[0], framed[1], framed[2], framed[3]]) as usize;
    assert_eq!(len, framed.len() - 4);
    Ok(())
}

#[test]
fn foreign_protocol_version_is_rejected() {
    let mut envelope = sample_frame();
    envelope.protocol_version = 2;
    assert!(validate(&envelope).is_err());
    assert!(encode(&envelope).is_err());
}

#[test]
fn msg_type_body_mismatch_is_rejected() {
    let mut envelope = sample_frame();
    envelope.msg_type = MsgType::Result as i32;
    assert!(validate(&envelope).is_err());

    let mut envelope = sample_result();
    envelope.msg_type = MsgType::Heartbeat as i32;
    assert!(validate(&envelope).is_err());
}

#[test]
fn missing_body_is_rejected() {
    let envelope = Envelope {
        protocol_version: PROTOCOL_VERSION,
        stream_id: "s".to_owned(),
        msg_type: MsgType::Init as i32,
        body: None,
    };
    assert!(validate(&envelope).is_err());
}

#[test]
fn builders_derive_consistent_msg_types() {
    let init = request("s", request::Kind::Init(Init::default()));
    assert_eq!(init.msg_type(), MsgType::Init);
    let hb = heartbeat("s", Heartbeat { last_frame_id: 9, tx: 10, rx: 8 });
    assert_eq!(hb.msg_type(), MsgType::Heartbeat);
    assert!(validate(&init).is_ok());
    assert!(validate(&hb).is_ok());
}

#[test]
fn payload_at_exactly_max_is_accepted() -> anyhow::Result<()> {
    // Pad a valid envelope with one unknown length-delimited field
    // (field 100) until the payload is exactly the maximum.
    let mut payload = heartbeat("s", Heartbeat::default()).encode_to_vec();
    let pad = MAX_PAYLOAD_BYTES - payload.len() - 2 - 4;
    payload.extend_from_slice(&[0xa2, 0x06]); // tag 100, wire type 2
    prost::encoding::encode_varint(pad as u64, &mut payload);
    payload.extend(std::iter::repeat_n(0u8, pad));
    assert_eq!(payload.len(), MAX_PAYLOAD_BYTES);
    let decoded = decode(&payload)?;
    assert_eq!(decoded.msg_type(), MsgType::Heartbeat);
    Ok(())
}

#[test]
fn payload_over_max_is_rejected() {
    let payload = vec![0u8; MAX_PAYLOAD_BYTES + 1];
    assert!(decode(&payload).is_err());
}

#[test]
fn empty_payload_is_rejected() {
    assert!(decode(&[]).is_err());
}

#[tokio::test]
async fn socket_round_trip() -> anyhow::Result<()> {
    let (mut a, mut b) = tokio::io::duplex(1 << 16);
    let envelope = sample_result();
    write_envelope(&mut a, &envelope).await?;
    let received = read_envelope(&mut b).await?;
    assert_eq!(received, envelope);
    Ok(())
}

#[tokio::test]
async fn oversized_length_prefix_terminates_read() -> anyhow::Result<()> {
    use tokio::io::AsyncWriteExt;

    let (mut a, mut b) = tokio::io::duplex(64);
    let bad_len = (MAX_PAYLOAD_BYTES as u32 + 1).to_le_bytes();
    a.write_all(&bad_len).await?;
    assert!(read_envelope(&mut b).await.is_err());

    let (mut a, mut b) = tokio::io::duplex(64);
    a.write_all(&0u32.to_le_bytes()).await?;
    assert!(read_envelope(&mut b).await.is_err());
    Ok(())
}
