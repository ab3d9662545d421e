//! Socket.IO v4 packet codec (Engine.IO v4 text frames).
//!
//! A frame is one Engine.IO type digit, optionally followed (for type `4`,
//! "message") by one Socket.IO type digit and a JSON payload:
//!
//! ```text
//! 0{"sid":"…","pingInterval":25000}   open
//! 2 / 3                                ping / pong
//! 40{"token":"…"}                      namespace connect (client) / ack (server)
//! 41                                   namespace disconnect
//! 42["newMessage",{…}]                 event
//! 44{"message":"…"}                    connect error
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{Error, Result};

pub const PONG: &str = "3";

pub const EVENT_JOIN: &str = "join";
pub const EVENT_NEW_MESSAGE: &str = "newMessage";
pub const EVENT_SEND_MESSAGE: &str = "sendMessage";

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct IncomingEvent {
    pub event_type: String,
    pub data: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    Open(Value),
    Close,
    Ping,
    Pong,
    Noop,
    Connect(Value),
    Disconnect,
    Event(IncomingEvent),
    ConnectError(String),
}

pub fn decode(frame: &str) -> Result<Packet> {
    let mut chars = frame.chars();
    let eio = chars
        .next()
        .ok_or_else(|| Error::Protocol("empty frame".into()))?;
    let rest = chars.as_str();
    match eio {
        '0' => Ok(Packet::Open(parse_json_or_null(rest)?)),
        '1' => Ok(Packet::Close),
        '2' => Ok(Packet::Ping),
        '3' => Ok(Packet::Pong),
        '6' => Ok(Packet::Noop),
        '4' => decode_socket(rest),
        other => Err(Error::Protocol(format!("unknown engine.io packet type {other:?}"))),
    }
}

fn decode_socket(frame: &str) -> Result<Packet> {
    let mut chars = frame.chars();
    let kind = chars
        .next()
        .ok_or_else(|| Error::Protocol("empty socket.io packet".into()))?;
    // Namespace prefix ("/ns,") is never used by this server; the default
    // namespace carries no prefix.
    let payload = chars.as_str();
    match kind {
        '0' => Ok(Packet::Connect(parse_json_or_null(payload)?)),
        '1' => Ok(Packet::Disconnect),
        '2' => decode_event(payload),
        '4' => {
            let v = parse_json_or_null(payload)?;
            let msg = v
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| v.to_string());
            Ok(Packet::ConnectError(msg))
        }
        other => Err(Error::Protocol(format!("unsupported socket.io packet type {other:?}"))),
    }
}

fn decode_event(payload: &str) -> Result<Packet> {
    // Acknowledgement ids may precede the array; strip them.
    let payload = payload.trim_start_matches(|c: char| c.is_ascii_digit());
    let arr: Vec<Value> = serde_json::from_str(payload)?;
    let mut it = arr.into_iter();
    let event_type = match it.next() {
        Some(Value::String(name)) => name,
        _ => return Err(Error::Protocol("event without a name".into())),
    };
    let data = it.next().unwrap_or(Value::Null);
    Ok(Packet::Event(IncomingEvent { event_type, data }))
}

fn parse_json_or_null(s: &str) -> Result<Value> {
    if s.is_empty() {
        Ok(Value::Null)
    } else {
        Ok(serde_json::from_str(s)?)
    }
}

/// How long the link may stay silent, from the open packet's
/// `pingInterval + pingTimeout` (milliseconds). `None` when the server sent neither.
pub fn heartbeat_window(open: &Value) -> Option<Duration> {
    let interval = open.get("pingInterval").and_then(Value::as_u64);
    let timeout = open.get("pingTimeout").and_then(Value::as_u64);
    if interval.is_none() && timeout.is_none() {
        return None;
    }
    let ms = interval.unwrap_or(0).saturating_add(timeout.unwrap_or(0));
    Some(Duration::from_millis(ms))
}

/// Namespace connect, carrying the credential as the auth payload.
pub fn encode_connect(token: Option<&str>) -> String {
    match token {
        Some(t) => format!("40{}", serde_json::json!({ "token": t })),
        None => "40".to_string(),
    }
}

pub fn encode_event(name: &str, data: &Value) -> String {
    format!("42{}", serde_json::json!([name, data]))
}
