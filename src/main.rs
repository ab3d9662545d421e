use std::collections::HashSet;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

use chatline::api::client::ApiClient;
use chatline::api::models::Peer;
use chatline::app::AppState;
use chatline::channel::WsConnector;
use chatline::directory::PeerDirectory;
use chatline::session::Session;
use chatline::storage::Storage;
use chatline::{utils, ClientHandle, Error, Result, ValidationError, View};

/// chatline - one-to-one realtime chat from the terminal
#[derive(Parser)]
#[command(name = "chatline")]
#[command(about = "One-to-one realtime chat from the terminal", long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Sign in and remember the credential
    Login {
        /// Server URL (e.g. http://localhost:5000)
        #[arg(long)]
        server: String,
        #[arg(long)]
        email: String,
        #[arg(long)]
        password: String,
    },

    /// Create an account
    Register {
        #[arg(long)]
        server: String,
        #[arg(long)]
        username: String,
        #[arg(long)]
        email: String,
        #[arg(long)]
        password: String,
    },

    /// Forget the stored credential and cached peers
    Logout,

    /// List the peers you can message
    Peers,

    /// Open a live conversation
    Chat {
        /// Peer id to open right away
        peer: Option<String>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match run(cli.command).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(command: Commands) -> Result<()> {
    let mut state = AppState::load();
    match command {
        Commands::Login { server, email, password } => {
            let base_url = utils::normalize_url(&server);
            let client = ApiClient::new(&base_url, state.timeout())?;
            let token = client.login(&email, &password).await?;
            let identity = client.me(&token).await?;
            state.base_url = base_url;
            state.token = Some(token);
            state.save()?;
            println!("Signed in as {} <{}>", identity.display_name, identity.contact_info);
        }
        Commands::Register { server, username, email, password } => {
            let client = ApiClient::new(&utils::normalize_url(&server), state.timeout())?;
            client.register(&username, &email, &password).await?;
            println!("Account created, you can log in now.");
        }
        Commands::Logout => {
            state.token = None;
            state.save()?;
            open_storage()?.clear()?;
            println!("Signed out.");
        }
        Commands::Peers => {
            let (client, session) = restore(&mut state).await?;
            let mut directory = PeerDirectory::new(open_storage()?);
            let peers = directory
                .refresh(&client, &session.token, &session.identity.id)
                .await?
                .to_vec();
            let selected = directory.selected().map(|p| p.id.clone());
            if peers.is_empty() {
                println!("Nobody else is registered yet.");
            }
            for p in peers {
                let mark = if selected.as_deref() == Some(p.id.as_str()) { '*' } else { ' ' };
                println!("{mark} {:<24} {:<20} {}", p.id, p.display_name, p.contact_info);
            }
        }
        Commands::Chat { peer } => chat(&mut state, peer).await?,
    }
    Ok(())
}

/// Resolve the persisted credential into a session.
async fn restore(state: &mut AppState) -> Result<(ApiClient, Session)> {
    let token = match (&state.token, state.is_configured()) {
        (Some(token), true) => token.clone(),
        _ => return Err(ValidationError::NotAuthenticated.into()),
    };
    let client = ApiClient::new(&state.base_url, state.timeout())?;
    match client.me(&token).await {
        Ok(identity) => Ok((client, Session { identity, token })),
        Err(Error::Unauthorized) => {
            state.token = None;
            let _ = state.save();
            Err(Error::Unauthorized)
        }
        Err(e) => Err(e),
    }
}

fn open_storage() -> Result<Storage> {
    let opened = match AppState::data_path() {
        Some(path) => Storage::open(&path),
        None => Err(Error::Storage("no data directory".into())),
    };
    opened.or_else(|e| {
        log::warn!("Local cache unavailable ({e}), using memory");
        Storage::open_in_memory()
    })
}

async fn chat(state: &mut AppState, peer: Option<String>) -> Result<()> {
    let (client, session) = restore(state).await?;
    let socket_url = utils::socket_url(client.base_url())?;
    let self_id = session.identity.id.clone();
    let (handle, task) = chatline::spawn(Arc::new(client), Arc::new(WsConnector), socket_url, open_storage()?);

    let mut view = handle.subscribe();
    handle.sign_in(session);
    let ready = view
        .wait_for(|v| v.authenticated && !v.loading)
        .await
        .map(|v| v.clone())
        .map_err(|_| Error::Network("client stopped".into()))?;
    if let Some(peer) = peer {
        handle.select_peer(&peer);
    } else if ready.active_peer.is_none() {
        print_peers(&ready.peers);
        println!("Pick a peer with /peer <id>.");
    }

    let printer = tokio::spawn(render(handle.subscribe(), self_id));
    let signed_out = read_input(&handle).await;

    printer.abort();
    drop(view);
    drop(handle);
    let _ = task.await;
    if signed_out {
        state.token = None;
        state.save()?;
        println!("Signed out.");
    }
    Ok(())
}

/// Returns true when the user signed out.
async fn read_input(handle: &ClientHandle) -> bool {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let line = line.trim_end();
        match line.split_once(' ').unwrap_or((line, "")) {
            ("/quit", _) => break,
            ("/logout", _) => {
                handle.sign_out();
                return true;
            }
            ("/peers", _) => match handle.reload_peers().await {
                Ok(peers) => print_peers(&peers),
                Err(e) => eprintln!("! {e}"),
            },
            ("/peer", id) if !id.trim().is_empty() => handle.select_peer(id.trim()),
            ("/reconnect", _) => handle.reconnect(),
            _ => {
                if let Err(e) = handle.send_message(line).await {
                    eprintln!("! {e}");
                }
            }
        }
    }
    false
}

fn print_peers(peers: &[Peer]) {
    for p in peers {
        println!("  {:<24} {}", p.id, p.display_name);
    }
}

/// Print the conversation as it grows.
async fn render(mut view: tokio::sync::watch::Receiver<View>, self_id: String) {
    let mut shown: HashSet<String> = HashSet::new();
    let mut peer_id: Option<String> = None;
    let mut channel = None;
    let mut last_error: Option<String> = None;
    loop {
        {
            let v = view.borrow_and_update();
            let active = v.active_peer.as_ref().map(|p| p.id.clone());
            if active != peer_id {
                shown.clear();
                if let Some(p) = &v.active_peer {
                    println!("-- chatting with {} --", p.display_name);
                }
                peer_id = active;
            }
            if channel != Some(v.channel) {
                println!("-- live channel {} --", v.channel);
                channel = Some(v.channel);
            }
            if v.last_error.is_some() && v.last_error != last_error {
                eprintln!("! {}", v.last_error.as_deref().unwrap_or_default());
            }
            last_error = v.last_error.clone();
            for m in &v.messages {
                if shown.insert(m.id.clone()) {
                    let who = if m.sender_id == self_id {
                        "you"
                    } else {
                        v.active_peer.as_ref().map(|p| p.display_name.as_str()).unwrap_or("?")
                    };
                    println!("[{}] {who}: {}", m.timestamp.format("%H:%M"), m.content);
                }
            }
        }
        if view.changed().await.is_err() {
            break;
        }
    }
}
