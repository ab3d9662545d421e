//! Live Channel: the session's persistent Socket.IO connection.
//!
//! ```text
//! Disconnected --connect()--> Connecting --ack--> Joined
//!       ^                          |                 |
//!       +------ failure / disconnect() --------------+
//! ```
//!
//! The socket itself runs in a spawned driver task that owns the transport.
//! The driver never touches client state: it reports [`ChannelEvent`]s, and the
//! owner applies them through [`LiveChannel::handle`] on its own task. Every
//! connect attempt gets a new generation, so events from a released driver
//! are recognised and dropped.

mod ws;

pub use ws::{WsConnector, WsTransport};

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::{self, Instant};
use url::Url;

use crate::api::events::{self, Packet};
use crate::api::models::{self, Message};
use crate::sync::Publisher;
use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("send failed: {0}")]
    SendFailed(String),

    #[error("receive failed: {0}")]
    ReceiveFailed(String),
}

/// A connected, text-framed duplex link.
#[async_trait]
pub trait Transport: Send {
    async fn send(&mut self, frame: String) -> std::result::Result<(), TransportError>;

    /// Next text frame; `None` once the remote end closed the connection.
    async fn recv(&mut self) -> Option<std::result::Result<String, TransportError>>;

    async fn close(&mut self);
}

/// Opens transports. One call per connect attempt.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, url: &Url) -> std::result::Result<Box<dyn Transport>, TransportError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChannelState {
    #[default]
    Disconnected,
    Connecting,
    Joined,
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ChannelState::Disconnected => "disconnected",
            ChannelState::Connecting => "connecting",
            ChannelState::Joined => "joined",
        };
        f.write_str(s)
    }
}

const CONNECT_TIMEOUT: Duration = Duration::from_secs(20);

/// Reported by a driver task to the channel's owner.
#[derive(Debug)]
pub enum ChannelEvent {
    Joined { generation: u64 },
    Inbound { generation: u64, message: Message },
    Closed { generation: u64, reason: String },
}

impl ChannelEvent {
    fn generation(&self) -> u64 {
        match self {
            ChannelEvent::Joined { generation }
            | ChannelEvent::Inbound { generation, .. }
            | ChannelEvent::Closed { generation, .. } => *generation,
        }
    }
}

struct Link {
    outbound: mpsc::UnboundedSender<String>,
    identity_id: String,
}

pub struct LiveChannel {
    connector: Arc<dyn Connector>,
    url: Url,
    events: mpsc::UnboundedSender<ChannelEvent>,
    state: ChannelState,
    generation: u64,
    link: Option<Link>,
}

impl LiveChannel {
    pub fn new(connector: Arc<dyn Connector>, url: Url, events: mpsc::UnboundedSender<ChannelEvent>) -> Self {
        Self {
            connector,
            url,
            events,
            state: ChannelState::Disconnected,
            generation: 0,
            link: None,
        }
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    /// Open the connection for `identity_id`. A no-op unless disconnected.
    pub fn connect(&mut self, identity_id: &str, token: &str) -> bool {
        if self.state != ChannelState::Disconnected {
            log::debug!("Live channel already {}, ignoring connect", self.state);
            return false;
        }
        self.generation += 1;
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let driver = Driver {
            identity_id: identity_id.to_string(),
            token: token.to_string(),
            generation: self.generation,
            events: self.events.clone(),
            outbound: outbound_rx,
        };
        tokio::spawn(driver.run(self.connector.clone(), self.url.clone()));
        self.link = Some(Link { outbound, identity_id: identity_id.to_string() });
        self.state = ChannelState::Connecting;
        log::info!("Live channel connecting to {}", self.url);
        true
    }

    /// Apply a driver event. Returns an inbound message to hand to the synchronizer.
    pub fn handle(&mut self, event: ChannelEvent) -> Option<Message> {
        if event.generation() != self.generation || self.link.is_none() {
            log::debug!("Dropping event from released connection");
            return None;
        }
        match event {
            ChannelEvent::Joined { .. } => {
                if self.state == ChannelState::Connecting {
                    self.state = ChannelState::Joined;
                    if let Some(link) = &self.link {
                        log::info!("Live channel joined as {}", link.identity_id);
                    }
                }
                None
            }
            ChannelEvent::Inbound { message, .. } => {
                (self.state == ChannelState::Joined).then_some(message)
            }
            ChannelEvent::Closed { reason, .. } => {
                log::warn!("Live channel lost: {reason}");
                self.release();
                None
            }
        }
    }

    /// Release the transport. Reconnecting is up to the caller.
    pub fn disconnect(&mut self) {
        if self.link.is_some() {
            log::info!("Live channel disconnected");
        }
        self.release();
    }

    /// Fire-and-forget event to the server; only valid while joined.
    pub fn send(&self, msg: &Message) -> Result<()> {
        let link = match (&self.link, self.state) {
            (Some(link), ChannelState::Joined) => link,
            _ => {
                log::warn!("Dropping live send of {}: channel {}", msg.id, self.state);
                return Err(Error::ChannelUnavailable);
            }
        };
        let frame = events::encode_event(events::EVENT_SEND_MESSAGE, &msg.to_record());
        link.outbound.send(frame).map_err(|_| {
            log::warn!("Dropping live send of {}: driver gone", msg.id);
            Error::ChannelUnavailable
        })
    }

    fn release(&mut self) {
        // Dropping the sender ends the driver, which closes the transport.
        self.link = None;
        self.state = ChannelState::Disconnected;
        self.generation += 1;
    }
}

impl Publisher for LiveChannel {
    fn publish(&self, msg: &Message) -> Result<()> {
        self.send(msg)
    }
}

/// Owns one transport for one connect attempt.
struct Driver {
    identity_id: String,
    token: String,
    generation: u64,
    events: mpsc::UnboundedSender<ChannelEvent>,
    outbound: mpsc::UnboundedReceiver<String>,
}

impl Driver {
    async fn run(mut self, connector: Arc<dyn Connector>, url: Url) {
        let attempt = tokio::select! {
            res = time::timeout(CONNECT_TIMEOUT, connector.connect(&url)) => res,
            // Nothing is queued before the ack, so only a release ends this arm.
            None = self.outbound.recv() => {
                log::debug!("Connect abandoned, channel released");
                return;
            }
        };
        let reason = match attempt {
            Ok(Ok(mut transport)) => {
                let reason = self.pump(transport.as_mut()).await;
                transport.close().await;
                reason
            }
            Ok(Err(e)) => e.to_string(),
            Err(_) => "connect timed out".into(),
        };
        let _ = self.events.send(ChannelEvent::Closed { generation: self.generation, reason });
    }

    /// Shuttle frames until the link ends; returns why it ended.
    async fn pump(&mut self, transport: &mut dyn Transport) -> String {
        let mut joined = false;
        let mut heartbeat: Option<Duration> = None;
        let mut last_seen = Instant::now();
        loop {
            let deadline = heartbeat.map(|window| last_seen + window);
            tokio::select! {
                frame = transport.recv() => {
                    let text = match frame {
                        Some(Ok(text)) => text,
                        Some(Err(e)) => return e.to_string(),
                        None => return "closed by server".into(),
                    };
                    last_seen = Instant::now();
                    let packet = match events::decode(&text) {
                        Ok(p) => p,
                        Err(e) => {
                            log::debug!("Ignoring frame {text:?}: {e}");
                            continue;
                        }
                    };
                    let reply = match packet {
                        Packet::Open(info) => {
                            heartbeat = events::heartbeat_window(&info);
                            Some(events::encode_connect(Some(self.token.as_str())))
                        }
                        Packet::Ping => Some(events::PONG.to_string()),
                        Packet::Connect(_) if !joined => {
                            joined = true;
                            let _ = self.events.send(ChannelEvent::Joined { generation: self.generation });
                            Some(events::encode_event(events::EVENT_JOIN, &Value::String(self.identity_id.clone())))
                        }
                        Packet::Event(ev) if joined && ev.event_type == events::EVENT_NEW_MESSAGE => {
                            if let Ok(message) = models::message_from_value(ev.data) {
                                let _ = self.events.send(ChannelEvent::Inbound { generation: self.generation, message });
                            }
                            None
                        }
                        Packet::Event(ev) => {
                            log::debug!("Ignoring event {}", ev.event_type);
                            None
                        }
                        Packet::Disconnect | Packet::Close => return "disconnected by server".into(),
                        Packet::ConnectError(msg) => return format!("connect rejected: {msg}"),
                        Packet::Connect(_) | Packet::Pong | Packet::Noop => None,
                    };
                    if let Some(reply) = reply {
                        if let Err(e) = transport.send(reply).await {
                            return e.to_string();
                        }
                    }
                }
                out = self.outbound.recv() => match out {
                    Some(frame) => {
                        if let Err(e) = transport.send(frame).await {
                            return e.to_string();
                        }
                    }
                    None => return "released".into(),
                },
                _ = time::sleep_until(deadline.unwrap_or(last_seen)), if deadline.is_some() => {
                    return "ping timeout".into();
                }
            }
        }
    }
}
