//! In-memory collaborators for unit tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use tokio::sync::mpsc;
use url::Url;

use crate::api::models::{Message, Peer};
use crate::api::ChatApi;
use crate::channel::{Connector, Transport, TransportError};
use crate::sync::Publisher;
use crate::{Error, Result};

pub fn peer(id: &str) -> Peer {
    Peer { id: id.into(), display_name: format!("user {id}"), contact_info: format!("{id}@example.com") }
}

/// A message `secs` seconds after a fixed epoch.
pub fn msg(id: &str, sender: &str, recipient: &str, secs: i64) -> Message {
    Message {
        id: id.into(),
        sender_id: sender.into(),
        recipient_id: recipient.into(),
        content: format!("content of {id}"),
        timestamp: Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap(),
    }
}

#[derive(Default)]
struct FakeApiInner {
    users: Vec<Peer>,
    messages: Vec<Message>,
    users_error: Option<Error>,
    users_delay: Option<Duration>,
    messages_error: Option<Error>,
    post_error: Option<Error>,
    posted: Vec<(String, String)>,
}

/// Scripted [`ChatApi`]. Posts are echoed back as messages from `sender`
/// with ids `srv-1`, `srv-2`, ...
pub struct FakeApi {
    sender: String,
    inner: Mutex<FakeApiInner>,
    users_calls: AtomicUsize,
    messages_calls: AtomicUsize,
    post_calls: AtomicUsize,
}

impl FakeApi {
    pub fn new() -> Self {
        Self::with_sender("u1")
    }

    pub fn with_sender(sender: &str) -> Self {
        Self {
            sender: sender.into(),
            inner: Mutex::new(FakeApiInner::default()),
            users_calls: AtomicUsize::new(0),
            messages_calls: AtomicUsize::new(0),
            post_calls: AtomicUsize::new(0),
        }
    }

    pub fn set_users(&self, users: Vec<Peer>) {
        let mut inner = self.inner.lock().unwrap();
        inner.users = users;
        inner.users_error = None;
    }

    /// The next `users` call answers with the current list, but only after `delay`.
    pub fn delay_next_users(&self, delay: Duration) {
        self.inner.lock().unwrap().users_delay = Some(delay);
    }

    pub fn fail_users(&self, error: Error) {
        self.inner.lock().unwrap().users_error = Some(error);
    }

    pub fn set_messages(&self, messages: Vec<Message>) {
        let mut inner = self.inner.lock().unwrap();
        inner.messages = messages;
        inner.messages_error = None;
    }

    pub fn fail_messages(&self, error: Error) {
        self.inner.lock().unwrap().messages_error = Some(error);
    }

    pub fn fail_posts(&self, error: Error) {
        self.inner.lock().unwrap().post_error = Some(error);
    }

    pub fn posted(&self) -> Vec<(String, String)> {
        self.inner.lock().unwrap().posted.clone()
    }

    pub fn users_calls(&self) -> usize {
        self.users_calls.load(Ordering::SeqCst)
    }

    pub fn messages_calls(&self) -> usize {
        self.messages_calls.load(Ordering::SeqCst)
    }

    pub fn post_calls(&self) -> usize {
        self.post_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChatApi for FakeApi {
    async fn users(&self, _token: &str) -> Result<Vec<Peer>> {
        let (result, delay) = {
            let mut inner = self.inner.lock().unwrap();
            let result = match &inner.users_error {
                Some(e) => Err(e.clone()),
                None => Ok(inner.users.clone()),
            };
            (result, inner.users_delay.take())
        };
        self.users_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        result
    }

    async fn messages(&self, _token: &str) -> Result<Vec<Message>> {
        self.messages_calls.fetch_add(1, Ordering::SeqCst);
        let inner = self.inner.lock().unwrap();
        match &inner.messages_error {
            Some(e) => Err(e.clone()),
            None => Ok(inner.messages.clone()),
        }
    }

    async fn post_message(&self, _token: &str, recipient_id: &str, content: &str) -> Result<Message> {
        let n = self.post_calls.fetch_add(1, Ordering::SeqCst) + 1;
        let mut inner = self.inner.lock().unwrap();
        if let Some(e) = &inner.post_error {
            return Err(e.clone());
        }
        inner.posted.push((recipient_id.to_string(), content.to_string()));
        let mut sent = msg(&format!("srv-{n}"), &self.sender, recipient_id, 1_000 + n as i64);
        sent.content = content.to_string();
        Ok(sent)
    }
}

#[derive(Default)]
pub struct RecordingPublisher {
    published: Mutex<Vec<Message>>,
    unavailable: bool,
}

impl RecordingPublisher {
    pub fn unavailable() -> Self {
        Self { published: Mutex::new(Vec::new()), unavailable: true }
    }

    pub fn published(&self) -> Vec<Message> {
        self.published.lock().unwrap().clone()
    }
}

impl Publisher for RecordingPublisher {
    fn publish(&self, msg: &Message) -> Result<()> {
        if self.unavailable {
            return Err(Error::ChannelUnavailable);
        }
        self.published.lock().unwrap().push(msg.clone());
        Ok(())
    }
}

/// Client side of an in-memory connection.
pub struct FakeTransport {
    from_server: mpsc::UnboundedReceiver<String>,
    to_server: mpsc::UnboundedSender<String>,
}

#[async_trait]
impl Transport for FakeTransport {
    async fn send(&mut self, frame: String) -> std::result::Result<(), TransportError> {
        self.to_server
            .send(frame)
            .map_err(|_| TransportError::ConnectionClosed)
    }

    async fn recv(&mut self) -> Option<std::result::Result<String, TransportError>> {
        self.from_server.recv().await.map(Ok)
    }

    async fn close(&mut self) {
        self.from_server.close();
    }
}

/// Server side of an in-memory connection, driven by the test.
pub struct ServerEnd {
    to_client: mpsc::UnboundedSender<String>,
    from_client: mpsc::UnboundedReceiver<String>,
}

impl ServerEnd {
    pub fn send(&self, frame: &str) {
        let _ = self.to_client.send(frame.to_string());
    }

    /// Next frame from the client, `None` once it let go of the connection.
    pub async fn recv(&mut self) -> Option<String> {
        tokio::time::timeout(Duration::from_secs(2), self.from_client.recv())
            .await
            .expect("timed out waiting for a client frame")
    }

    /// Run the Engine.IO open / Socket.IO connect exchange and return the join frame.
    pub async fn handshake(&mut self) -> String {
        self.handshake_with(r#"0{"sid":"eio","pingInterval":25000,"pingTimeout":20000}"#)
            .await
    }

    pub async fn handshake_with(&mut self, open: &str) -> String {
        self.send(open);
        let connect = self.recv().await.expect("connect packet");
        assert!(connect.starts_with("40"), "unexpected frame {connect}");
        self.send(r#"40{"sid":"sock"}"#);
        self.recv().await.expect("join packet")
    }

    pub fn hang_up(&mut self) {
        self.from_client.close();
        let (tx, _) = mpsc::unbounded_channel();
        self.to_client = tx;
    }
}

/// Hands out [`FakeTransport`]s and queues their server ends.
pub struct FakeConnector {
    servers_tx: mpsc::UnboundedSender<ServerEnd>,
    servers_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<ServerEnd>>,
    connects: AtomicUsize,
    failures: Mutex<VecDeque<String>>,
    stall_next: AtomicBool,
    pending: Arc<AtomicUsize>,
}

/// Counts a connect attempt as pending until it is dropped.
struct PendingGuard(Arc<AtomicUsize>);

impl PendingGuard {
    fn new(count: &Arc<AtomicUsize>) -> Self {
        count.fetch_add(1, Ordering::SeqCst);
        Self(count.clone())
    }
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl FakeConnector {
    pub fn new() -> Self {
        let (servers_tx, servers_rx) = mpsc::unbounded_channel();
        Self {
            servers_tx,
            servers_rx: tokio::sync::Mutex::new(servers_rx),
            connects: AtomicUsize::new(0),
            failures: Mutex::new(VecDeque::new()),
            stall_next: AtomicBool::new(false),
            pending: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn fail_next_connect(&self, reason: &str) {
        self.failures.lock().unwrap().push_back(reason.to_string());
    }

    /// The next connect never completes on its own.
    pub fn stall_next_connect(&self) {
        self.stall_next.store(true, Ordering::SeqCst);
    }

    /// Connect attempts still in flight.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub async fn accept(&self) -> ServerEnd {
        let mut rx = self.servers_rx.lock().await;
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for a connection")
            .expect("connector dropped")
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(&self, _url: &Url) -> std::result::Result<Box<dyn Transport>, TransportError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if self.stall_next.swap(false, Ordering::SeqCst) {
            let _guard = PendingGuard::new(&self.pending);
            std::future::pending::<()>().await;
        }
        if let Some(reason) = self.failures.lock().unwrap().pop_front() {
            return Err(TransportError::ConnectionFailed(reason));
        }
        let (to_client, from_server) = mpsc::unbounded_channel();
        let (to_server, from_client) = mpsc::unbounded_channel();
        let _ = self.servers_tx.send(ServerEnd { to_client, from_client });
        Ok(Box::new(FakeTransport { from_server, to_server }))
    }
}

pub fn test_url() -> Url {
    Url::parse("ws://localhost:5000/socket.io/?EIO=4&transport=websocket").unwrap()
}
