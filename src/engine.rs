//! The client engine: one task that owns every component and applies all
//! mutations in the order events reach it.
//!
//! Fetches, POSTs and the socket run in spawned tasks. Their results come back
//! as queued events tagged with the generation they were issued under, so a
//! result that outlived its session or conversation is dropped instead of
//! applied. Renderers observe a [`View`] snapshot and drive the engine through
//! a [`ClientHandle`].

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use url::Url;

use crate::api::models::{Identity, Message, Peer};
use crate::api::ChatApi;
use crate::channel::{ChannelEvent, ChannelState, Connector, LiveChannel};
use crate::directory::{self, PeerDirectory};
use crate::history::HistoryLoader;
use crate::session::{Session, SessionStore};
use crate::storage::Storage;
use crate::sync::{Applied, ConversationSynchronizer, LoadTicket, OutgoingMessage};
use crate::{Error, Result, ValidationError};

/// Everything a renderer needs, republished after each change.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct View {
    pub authenticated: bool,
    pub loading: bool,
    pub identity: Option<Identity>,
    pub peers: Vec<Peer>,
    pub active_peer: Option<Peer>,
    pub messages: Vec<Message>,
    pub channel: ChannelState,
    pub last_error: Option<String>,
}

enum Command {
    SignIn(Session),
    SignOut,
    RefreshPeers(Option<oneshot::Sender<Result<Vec<Peer>>>>),
    SelectPeer(String),
    Send { content: String, reply: oneshot::Sender<Result<Message>> },
    Reconnect,
}

enum Completion {
    Peers { generation: u64, request: u64, result: Result<Vec<Peer>> },
    History { ticket: LoadTicket, result: Result<Vec<Message>> },
    Sent {
        generation: u64,
        outgoing: OutgoingMessage,
        result: Result<Message>,
        reply: oneshot::Sender<Result<Message>>,
    },
}

/// Cloneable front door to a running engine. The engine stops once every
/// handle is dropped.
#[derive(Clone)]
pub struct ClientHandle {
    commands: mpsc::UnboundedSender<Command>,
    view: watch::Receiver<View>,
}

impl ClientHandle {
    pub fn sign_in(&self, session: Session) {
        self.command(Command::SignIn(session));
    }

    pub fn sign_out(&self) {
        self.command(Command::SignOut);
    }

    pub fn refresh_peers(&self) {
        self.command(Command::RefreshPeers(None));
    }

    /// Refresh the peer list and resolve with it once the latest refresh landed.
    pub async fn reload_peers(&self) -> Result<Vec<Peer>> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::RefreshPeers(Some(reply)));
        rx.await
            .unwrap_or_else(|_| Err(Error::Network("client stopped".into())))
    }

    pub fn select_peer(&self, peer_id: &str) {
        self.command(Command::SelectPeer(peer_id.to_string()));
    }

    /// Reopen the live channel after it dropped. No-op while connecting or joined.
    pub fn reconnect(&self) {
        self.command(Command::Reconnect);
    }

    /// Send to the active peer; resolves once the server acknowledged (or refused) it.
    pub async fn send_message(&self, content: &str) -> Result<Message> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::Send { content: content.to_string(), reply });
        rx.await
            .unwrap_or_else(|_| Err(Error::Network("client stopped".into())))
    }

    pub fn view(&self) -> View {
        self.view.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<View> {
        self.view.clone()
    }

    fn command(&self, cmd: Command) {
        if self.commands.send(cmd).is_err() {
            log::warn!("Engine stopped, command dropped");
        }
    }
}

/// Start an engine on the current runtime.
pub fn spawn(
    api: Arc<dyn ChatApi>,
    connector: Arc<dyn Connector>,
    socket_url: Url,
    storage: Storage,
) -> (ClientHandle, JoinHandle<()>) {
    let (commands_tx, commands) = mpsc::unbounded_channel();
    let (completions_tx, completions) = mpsc::unbounded_channel();
    let (channel_tx, channel_events) = mpsc::unbounded_channel();
    let (view_tx, view_rx) = watch::channel(View::default());

    let engine = Engine {
        session: SessionStore::new(),
        directory: PeerDirectory::new(storage),
        history: HistoryLoader::new(api.clone()),
        channel: LiveChannel::new(connector, socket_url, channel_tx),
        sync: ConversationSynchronizer::new(),
        api,
        session_generation: 0,
        peers_request: 0,
        peers_loading: false,
        peer_waiters: Vec::new(),
        last_error: None,
        commands,
        completions_tx,
        completions,
        channel_events,
        view_tx,
    };
    let task = tokio::spawn(engine.run());
    (ClientHandle { commands: commands_tx, view: view_rx }, task)
}

struct Engine {
    session: SessionStore,
    directory: PeerDirectory,
    history: HistoryLoader,
    channel: LiveChannel,
    sync: ConversationSynchronizer,
    api: Arc<dyn ChatApi>,
    session_generation: u64,
    peers_request: u64,
    peers_loading: bool,
    peer_waiters: Vec<oneshot::Sender<Result<Vec<Peer>>>>,
    last_error: Option<String>,
    commands: mpsc::UnboundedReceiver<Command>,
    completions_tx: mpsc::UnboundedSender<Completion>,
    completions: mpsc::UnboundedReceiver<Completion>,
    channel_events: mpsc::UnboundedReceiver<ChannelEvent>,
    view_tx: watch::Sender<View>,
}

impl Engine {
    async fn run(mut self) {
        loop {
            tokio::select! {
                cmd = self.commands.recv() => match cmd {
                    Some(cmd) => self.on_command(cmd),
                    None => break,
                },
                Some(done) = self.completions.recv() => self.on_completion(done),
                Some(ev) = self.channel_events.recv() => {
                    if let Some(msg) = self.channel.handle(ev) {
                        self.sync.on_inbound(msg);
                    }
                }
            }
            self.publish();
        }
        // Shutting down is not a sign-out: the remembered peer survives.
        self.channel.disconnect();
        log::debug!("Engine stopped");
    }

    fn on_command(&mut self, cmd: Command) {
        match cmd {
            Command::SignIn(session) => self.start_session(session),
            Command::SignOut => self.end_session(),
            Command::RefreshPeers(reply) => {
                self.peer_waiters.extend(reply);
                self.refresh_peers();
            }
            Command::SelectPeer(peer_id) => self.select_peer(&peer_id),
            Command::Send { content, reply } => self.begin_send(&content, reply),
            Command::Reconnect => {
                if let Some(s) = self.session.current() {
                    self.channel.connect(&s.identity.id, &s.token);
                }
            }
        }
    }

    fn on_completion(&mut self, done: Completion) {
        match done {
            Completion::Peers { generation, request, result } => {
                if generation != self.session_generation {
                    log::debug!("Discarding peer list from an ended session");
                    return;
                }
                if request != self.peers_request {
                    log::debug!("Discarding superseded peer list {request}");
                    return;
                }
                self.peers_loading = false;
                match result {
                    Ok(peers) => {
                        self.directory.replace(peers);
                        self.settle_peer_waiters(Ok(self.directory.peers().to_vec()));
                        self.follow_selection();
                    }
                    Err(e) => {
                        self.settle_peer_waiters(Err(e.clone()));
                        self.fail("Loading peers", e);
                    }
                }
            }
            Completion::History { ticket, result } => {
                if let Applied::Failed(e) = self.sync.apply_history(ticket, result) {
                    self.fail("Loading history", e);
                }
            }
            Completion::Sent { generation, outgoing, result, reply } => {
                if generation != self.session_generation {
                    let _ = reply.send(result);
                    return;
                }
                let result = self.sync.complete_send(&outgoing.key, result, &self.channel);
                if let Err(e) = &result {
                    self.fail("Sending", e.clone());
                }
                let _ = reply.send(result);
            }
        }
    }

    fn start_session(&mut self, session: Session) {
        let was_present = self.session.is_present();
        if !self.session.set(Some(session.clone())) {
            log::debug!("Session credential updated");
            return;
        }
        if was_present {
            self.teardown();
        }
        self.session_generation += 1;
        self.last_error = None;
        log::info!("Signed in as {}", session.identity.id);

        self.directory.warm(&session.identity.id);
        self.channel.connect(&session.identity.id, &session.token);
        self.refresh_peers();
    }

    fn end_session(&mut self) {
        if !self.session.set(None) {
            return;
        }
        self.session_generation += 1;
        self.teardown();
        log::info!("Signed out");
    }

    fn teardown(&mut self) {
        self.settle_peer_waiters(Err(ValidationError::NotAuthenticated.into()));
        self.channel.disconnect();
        self.directory.invalidate();
        self.sync.deactivate();
        self.peers_loading = false;
    }

    fn refresh_peers(&mut self) {
        let Some(session) = self.session.current() else {
            log::warn!("Peer refresh requested without a session");
            self.settle_peer_waiters(Err(ValidationError::NotAuthenticated.into()));
            return;
        };
        self.peers_loading = true;
        self.peers_request += 1;
        let api = self.api.clone();
        let tx = self.completions_tx.clone();
        let generation = self.session_generation;
        let request = self.peers_request;
        tokio::spawn(async move {
            let result = directory::fetch_peers(api.as_ref(), &session.token, &session.identity.id).await;
            let _ = tx.send(Completion::Peers { generation, request, result });
        });
    }

    fn select_peer(&mut self, peer_id: &str) {
        if !self.session.is_present() {
            log::warn!("Peer selection requested without a session");
            return;
        }
        match self.directory.select(peer_id).map(|p| p.id.clone()) {
            Some(id) => self.activate(&id),
            None => {
                self.sync.deactivate();
                self.last_error = Some(format!("unknown peer {peer_id}"));
            }
        }
    }

    /// Keep the active conversation in line with the directory's selection.
    fn follow_selection(&mut self) {
        let selected = self.directory.selected().map(|p| p.id.clone());
        let active = self.sync.active_key().map(|k| k.peer_id.clone());
        match (selected, active) {
            (Some(sel), Some(act)) if sel == act => {}
            (Some(sel), _) => self.activate(&sel),
            (None, Some(_)) => self.sync.deactivate(),
            (None, None) => {}
        }
    }

    fn activate(&mut self, peer_id: &str) {
        let Some(session) = self.session.current() else {
            return;
        };
        let ticket = self.sync.activate(&session.identity.id, peer_id);
        let loader = self.history.clone();
        let tx = self.completions_tx.clone();
        tokio::spawn(async move {
            let result = loader.load(&session.token, &ticket.key).await;
            let _ = tx.send(Completion::History { ticket, result });
        });
    }

    fn begin_send(&mut self, content: &str, reply: oneshot::Sender<Result<Message>>) {
        let Some(session) = self.session.current() else {
            let _ = reply.send(Err(ValidationError::NotAuthenticated.into()));
            return;
        };
        let outgoing = match self.sync.prepare_send(content) {
            Ok(outgoing) => outgoing,
            Err(e) => {
                let _ = reply.send(Err(e));
                return;
            }
        };
        let api = self.api.clone();
        let tx = self.completions_tx.clone();
        let generation = self.session_generation;
        tokio::spawn(async move {
            let result = api
                .post_message(&session.token, &outgoing.key.peer_id, &outgoing.content)
                .await;
            let _ = tx.send(Completion::Sent { generation, outgoing, result, reply });
        });
    }

    fn settle_peer_waiters(&mut self, result: Result<Vec<Peer>>) {
        for waiter in self.peer_waiters.drain(..) {
            let _ = waiter.send(result.clone());
        }
    }

    /// Report a failed operation. A rejected credential ends the session.
    fn fail(&mut self, what: &str, e: Error) {
        log::warn!("{what} failed: {e}");
        self.last_error = Some(e.to_string());
        if e.is_unauthorized() {
            self.end_session();
        }
    }

    fn publish(&self) {
        let view = View {
            authenticated: self.session.is_present(),
            loading: self.peers_loading || self.sync.is_loading(),
            identity: self.session.identity(),
            peers: self.directory.peers().to_vec(),
            active_peer: self.sync.active_key().and_then(|k| {
                self.directory.peers().iter().find(|p| p.id == k.peer_id).cloned()
            }),
            messages: self.sync.messages().to_vec(),
            channel: self.channel.state(),
            last_error: self.last_error.clone(),
        };
        self.view_tx.send_if_modified(|current| {
            if *current == view {
                false
            } else {
                *current = view;
                true
            }
        });
    }
}
