// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Length-prefixed framing for the inference protocol.
//!
//! Every message is `[u32 little-endian payload length][payload]` where the
//! payload is one serialized [`Envelope`]. Violations — zero or oversized
//! lengths, undecodable payloads, a foreign protocol version, or a
//! `msg_type` inconsistent with the carried body — are fatal to the
//! connection that produced them.

use anyhow::{bail, Context};
use bytes::Bytes;
use prost::Message;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::proto::{envelope::Body, request, response, Envelope, Heartbeat, MsgType, Request, Response};

pub const PROTOCOL_VERSION: u32 = 1;
/// Inclusive payload bound: 50 MiB.
pub const MAX_PAYLOAD_BYTES: usize = 50 * 1024 * 1024;

/// Build a request envelope; the message type is derived from the body so
/// the two can never disagree.
pub fn request(stream_id: &str, kind: request::Kind) -> Envelope {
    let msg_type = match kind {
        request::Kind::Init(_) => MsgType::Init,
        request::Kind::Frame(_) => MsgType::Frame,
        request::Kind::End(_) => MsgType::End,
    };
    Envelope {
        protocol_version: PROTOCOL_VERSION,
        stream_id: stream_id.to_owned(),
        msg_type: msg_type as i32,
        body: Some(Body::Request(Request { kind: Some(kind) })),
    }
}

/// Build a response envelope (used by workers and test doubles).
pub fn response(stream_id: &str, kind: response::Kind) -> Envelope {
    let msg_type = match kind {
        response::Kind::InitOk(_) => MsgType::InitOk,
        response::Kind::Result(_) => MsgType::Result,
        response::Kind::WindowUpdate(_) => MsgType::WindowUpdate,
        response::Kind::Error(_) => MsgType::Error,
    };
    Envelope {
        protocol_version: PROTOCOL_VERSION,
        stream_id: stream_id.to_owned(),
        msg_type: msg_type as i32,
        body: Some(Body::Response(Response { kind: Some(kind) })),
    }
}

/// Build a heartbeat envelope.
pub fn heartbeat(stream_id: &str, heartbeat: Heartbeat) -> Envelope {
    Envelope {
        protocol_version: PROTOCOL_VERSION,
        stream_id: stream_id.to_owned(),
        msg_type: MsgType::Heartbeat as i32,
        body: Some(Body::Heartbeat(heartbeat)),
    }
}

/// Check version and msg_type/body agreement.
pub fn validate(envelope: &Envelope) -> anyhow::Result<()> {
    if envelope.protocol_version != PROTOCOL_VERSION {
        bail!("unsupported protocol version {}", envelope.protocol_version);
    }
    let msg_type = envelope.msg_type();
    let consistent = match (&envelope.body, msg_type) {
        (Some(Body::Request(Request { kind: Some(kind) })), t) => matches!(
            (kind, t),
            (request::Kind::Init(_), MsgType::Init)
                | (request::Kind::Frame(_), MsgType::Frame)
                | (request::Kind::End(_), MsgType::End)
        ),
        (Some(Body::Response(Response { kind: Some(kind) })), t) => matches!(
            (kind, t),
            (response::Kind::InitOk(_), MsgType::InitOk)
                | (response::Kind::Result(_), MsgType::Result)
                | (response::Kind::WindowUpdate(_), MsgType::WindowUpdate)
                | (response::Kind::Error(_), MsgType::Error)
        ),
        (Some(Body::Heartbeat(_)), MsgType::Heartbeat) => true,
        _ => false,
    };
    if !consistent {
        bail!("msg_type {msg_type:?} inconsistent with payload");
    }
    Ok(())
}

/// Serialize an envelope into one framed message.
pub fn encode(envelope: &Envelope) -> anyhow::Result<Bytes> {
    validate(envelope)?;
    let payload = envelope.encode_to_vec();
    if payload.is_empty() || payload.len() > MAX_PAYLOAD_BYTES {
        bail!("payload length {} outside [1, {MAX_PAYLOAD_BYTES}]", payload.len());
    }
    let mut framed = Vec::with_capacity(4 + payload.len());
    framed.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    framed.extend_from_slice(&payload);
    Ok(Bytes::from(framed))
}

/// Decode and validate one payload (without the length prefix).
pub fn decode(payload: &[u8]) -> anyhow::Result<Envelope> {
    if payload.is_empty() || payload.len() > MAX_PAYLOAD_BYTES {
        bail!("payload length {} outside [1, {MAX_PAYLOAD_BYTES}]", payload.len());
    }
    let envelope = Envelope::decode(payload).context("decoding envelope")?;
    validate(&envelope)?;
    Ok(envelope)
}

/// Read one framed envelope from the socket.
pub async fn read_envelope<R>(reader: &mut R) -> anyhow::Result<Envelope>
where
    R: AsyncRead + Unpin,
{
    let mut prefix = [0u8; 4];
    reader.read_exact(&mut prefix).await.context("reading length prefix")?;
    let len = u32::from_le_bytes(prefix) as usize;
    if len == 0 || len > MAX_PAYLOAD_BYTES {
        bail!("framed length {len} outside [1, {MAX_PAYLOAD_BYTES}]");
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await.context("reading payload")?;
    decode(&payload)
}

/// Write one framed envelope to the socket.
pub async fn write_envelope<W>(writer: &mut W, envelope: &Envelope) -> anyhow::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let framed = encode(envelope)?;
    writer.write_all(&framed).await.context("writing envelope")?;
    writer.flush().await.context("flushing envelope")?;
    Ok(())
}

#[cfg(test)]
#[path = "wire_tests.rs"]
mod tests;
