//! The relay server: login handshake, identity tracking, and broadcast
//! routing.
//!
//! Each accepted connection runs on its own task and owns its socket. The
//! relay's shared state is an indexed map of connection records (guarding
//! the set-once identity) plus a Tokio `broadcast` channel for fan-out:
//! delivering through the channel means a concurrent connect or disconnect
//! can never corrupt an in-flight broadcast, and every subscriber at send
//! time receives exactly one copy. A failing client closes only its own
//! connection; the relay and its other clients keep running.

use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use anyhow::{Context, Result, bail};
use thiserror::Error;
use tokio::{
    io::{AsyncBufReadExt, BufReader, Lines},
    net::{
        TcpListener, TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    select, signal,
    sync::{Mutex, broadcast, oneshot},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    cli::ServerArgs,
    command::{AdminCommand, ConsoleInput, Role},
    console::{self, Flow},
    payload::{self, Payload},
};

/// Port the server listens on when none is given on the command line.
pub const DEFAULT_PORT: u16 = 5555;

type ConnectionId = u64;

/// Events fanned out to every connection task.
#[derive(Debug, Clone)]
enum RelayEvent {
    /// A fully formatted line to deliver to every client.
    Deliver(String),
    /// The relay is closing; every connection shuts down.
    Shutdown,
}

/// The relay server. Owns the listening socket while started and the shared
/// connection state for its whole lifetime.
pub struct Relay {
    port: u16,
    state: Arc<RelayState>,
    acceptor: Option<Acceptor>,
}

struct Acceptor {
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl Relay {
    pub fn new(port: u16) -> Self {
        Self {
            port,
            state: Arc::new(RelayState::new()),
            acceptor: None,
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn is_listening(&self) -> bool {
        self.acceptor.is_some()
    }

    pub async fn connection_count(&self) -> usize {
        self.state.connection_count().await
    }

    /// Binds the listening socket and starts accepting connections.
    ///
    /// A bind failure leaves the relay stopped; the operator can change the
    /// port and issue `#start` again.
    pub async fn start(&mut self) -> Result<()> {
        if self.acceptor.is_some() {
            bail!("Already listening for connections.");
        }
        let listener = TcpListener::bind(("0.0.0.0", self.port))
            .await
            .with_context(|| format!("could not listen for clients on port {}", self.port))?;
        // Binding port 0 picks an ephemeral port; report the real one.
        self.port = listener
            .local_addr()
            .context("listener has no local address")?
            .port();

        let (shutdown, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(accept_loop(listener, Arc::clone(&self.state), shutdown_rx));
        self.acceptor = Some(Acceptor { shutdown, task });
        info!("Server listening for connections on port {}", self.port);
        Ok(())
    }

    /// Stops accepting new connections. Existing clients stay connected.
    pub async fn stop(&mut self) -> Result<()> {
        let Some(acceptor) = self.acceptor.take() else {
            bail!("Not currently listening for connections.");
        };
        let _ = acceptor.shutdown.send(());
        let _ = acceptor.task.await;
        info!("Server has stopped listening for connections.");
        Ok(())
    }

    /// Closes the relay: stops listening and disconnects every client,
    /// unconditionally. Teardown errors are not actionable and are
    /// swallowed.
    pub async fn shutdown(&mut self) {
        if self.acceptor.is_some() {
            let _ = self.stop().await;
        }
        self.state.shutdown_connections();
        self.state.clear_connections().await;
        info!("Server closed.");
    }

    /// Changes the listening port. Only allowed while the relay is fully
    /// closed: not listening and no client connections.
    pub async fn set_port(&mut self, port: u16) -> Result<()> {
        if self.is_listening() || self.connection_count().await > 0 {
            bail!("You must close the server before setting a new port.");
        }
        self.port = port;
        Ok(())
    }

    /// Broadcasts an operator message to every client.
    pub fn send_server_message(&self, text: &str) {
        self.state.deliver(payload::server_broadcast(text));
    }

    /// Routes one operator console line: an administrative command, or chat
    /// text broadcast to every client and echoed locally.
    pub async fn submit_operator_line(&mut self, line: &str) -> Result<Flow> {
        match ConsoleInput::interpret(line, Role::Server) {
            Ok(ConsoleInput::Text(text)) => {
                console::write_stdout(&payload::server_broadcast(&text)).await?;
                self.send_server_message(&text);
                Ok(Flow::Continue)
            }
            Ok(ConsoleInput::Command(command)) => self.apply_command(command).await,
            Err(err) => {
                console::write_stderr(&format!("!!! {err}")).await?;
                Ok(Flow::Continue)
            }
        }
    }

    async fn apply_command(&mut self, command: AdminCommand) -> Result<Flow> {
        match command {
            AdminCommand::Quit => {
                self.shutdown().await;
                return Ok(Flow::Terminate);
            }
            AdminCommand::Stop => report(self.stop().await).await?,
            AdminCommand::Close => self.shutdown().await,
            AdminCommand::Start => report(self.start().await).await?,
            AdminCommand::SetPort(port) => report(self.set_port(port).await).await?,
            AdminCommand::GetPort => {
                console::write_stdout(&format!("*** Current port: {}", self.port)).await?;
            }
            AdminCommand::Logoff
            | AdminCommand::SetHost(_)
            | AdminCommand::Login
            | AdminCommand::GetHost => {
                // The interpreter never yields these for the server role.
                warn!(?command, "client-only command reached the server console");
            }
        }
        Ok(Flow::Continue)
    }
}

/// Displays a guard or transport failure on the operator console without
/// tearing anything down.
async fn report(result: Result<()>) -> std::io::Result<()> {
    if let Err(err) = result {
        console::write_stderr(&format!("!!! {err:#}")).await?;
    }
    Ok(())
}

/// Runs the server console: starts the relay, then services operator input
/// until `#quit`, stdin EOF, or ctrl-c.
pub async fn run(args: ServerArgs) -> Result<()> {
    let mut relay = Relay::new(args.port);
    report(relay.start().await).await?;

    let mut input = BufReader::new(tokio::io::stdin()).lines();
    loop {
        select! {
            line = input.next_line() => {
                match line? {
                    Some(line) => {
                        let line = line.trim_end();
                        if line.is_empty() {
                            continue;
                        }
                        if let Flow::Terminate = relay.submit_operator_line(line).await? {
                            break;
                        }
                    }
                    None => {
                        relay.shutdown().await;
                        break;
                    }
                }
            }
            ctrl_c = signal::ctrl_c() => {
                if let Err(error) = ctrl_c {
                    warn!(?error, "ctrl-c handler failed");
                }
                relay.shutdown().await;
                break;
            }
        }
    }
    Ok(())
}

/// Violations of the login handshake, answered with a diagnostic payload
/// and a close.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
enum LoginError {
    #[error("login can only be sent as the first message")]
    AlreadyLoggedIn,
    #[error("identity cannot be empty")]
    EmptyIdentity,
}

/// Per-connection bookkeeping owned by the relay.
///
/// `identity` is absent until the handshake succeeds and is set at most
/// once for the life of the connection.
#[derive(Debug, Default, Clone)]
struct ConnectionRecord {
    identity: Option<String>,
}

struct RelayState {
    connections: Mutex<HashMap<ConnectionId, ConnectionRecord>>,
    broadcaster: broadcast::Sender<RelayEvent>,
    next_id: AtomicU64,
}

impl RelayState {
    fn new() -> Self {
        // Fan-out buffers a modest number of lines before lagging clients skip.
        let (broadcaster, _) = broadcast::channel(128);
        Self {
            connections: Mutex::new(HashMap::new()),
            broadcaster,
            next_id: AtomicU64::new(1),
        }
    }

    fn next_id(&self) -> ConnectionId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    async fn track(&self, id: ConnectionId) {
        let mut connections = self.connections.lock().await;
        connections.insert(id, ConnectionRecord::default());
    }

    /// Stores the identity for a connection, enforcing the
    /// first-login-only rule. On rejection the stored identity is
    /// unchanged.
    async fn login(&self, id: ConnectionId, identity: &str) -> Result<(), LoginError> {
        if identity.is_empty() {
            return Err(LoginError::EmptyIdentity);
        }
        let mut connections = self.connections.lock().await;
        let record = connections.entry(id).or_default();
        if record.identity.is_some() {
            return Err(LoginError::AlreadyLoggedIn);
        }
        record.identity = Some(identity.to_string());
        Ok(())
    }

    async fn identity_of(&self, id: ConnectionId) -> Option<String> {
        let connections = self.connections.lock().await;
        connections.get(&id).and_then(|record| record.identity.clone())
    }

    async fn remove(&self, id: ConnectionId) -> Option<ConnectionRecord> {
        let mut connections = self.connections.lock().await;
        connections.remove(&id)
    }

    async fn clear_connections(&self) {
        self.connections.lock().await.clear();
    }

    async fn connection_count(&self) -> usize {
        self.connections.lock().await.len()
    }

    fn deliver(&self, line: String) {
        if self.broadcaster.send(RelayEvent::Deliver(line)).is_err() {
            debug!("no connections to deliver to");
        }
    }

    fn shutdown_connections(&self) {
        let _ = self.broadcaster.send(RelayEvent::Shutdown);
    }

    fn subscribe(&self) -> broadcast::Receiver<RelayEvent> {
        self.broadcaster.subscribe()
    }
}

async fn accept_loop(
    listener: TcpListener,
    state: Arc<RelayState>,
    mut shutdown: oneshot::Receiver<()>,
) {
    loop {
        select! {
            _ = &mut shutdown => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => spawn_connection(stream, peer, &state),
                Err(err) => warn!(error = ?err, "failed to accept connection"),
            },
        }
    }
}

fn spawn_connection(stream: TcpStream, peer: SocketAddr, state: &Arc<RelayState>) {
    let state = Arc::clone(state);
    tokio::spawn(async move {
        if let Err(err) = handle_connection(stream, peer, state).await {
            // One bad client never takes the relay down with it.
            debug!(%peer, error = ?err, "client connection closed with error");
        }
    });
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    state: Arc<RelayState>,
) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    let id = state.next_id();
    state.track(id).await;
    let mut inbox = state.subscribe();
    info!(%peer, "A new client has connected to the server.");

    let outcome = connection_loop(&state, id, &mut lines, &mut writer, &mut inbox).await;

    if let Some(record) = state.remove(id).await {
        match record.identity {
            Some(identity) => info!(%peer, identity, "client has disconnected"),
            None => info!(%peer, "unauthenticated client has disconnected"),
        }
    }
    outcome
}

async fn connection_loop(
    state: &RelayState,
    id: ConnectionId,
    lines: &mut Lines<BufReader<OwnedReadHalf>>,
    writer: &mut OwnedWriteHalf,
    inbox: &mut broadcast::Receiver<RelayEvent>,
) -> Result<()> {
    loop {
        select! {
            inbound = lines.next_line() => {
                match inbound? {
                    Some(line) => {
                        if !handle_inbound_line(state, id, &line, writer).await? {
                            break;
                        }
                    }
                    None => break,
                }
            }
            event = inbox.recv() => {
                if !handle_relay_event(event, writer).await? {
                    break;
                }
            }
        }
    }
    Ok(())
}

/// The core protocol step for one inbound payload. Returns `false` when the
/// connection must close.
async fn handle_inbound_line(
    state: &RelayState,
    id: ConnectionId,
    line: &str,
    writer: &mut OwnedWriteHalf,
) -> Result<bool> {
    if line.is_empty() {
        return Ok(true);
    }
    match Payload::decode(line) {
        Payload::Login { identity } => match state.login(id, &identity).await {
            Ok(()) => {
                info!(identity, "client has logged on");
                Ok(true)
            }
            Err(violation) => reject(writer, &violation.to_string()).await,
        },
        Payload::Chat { text } => match state.identity_of(id).await {
            Some(identity) => {
                debug!(identity, text, "routing chat line");
                state.deliver(payload::tagged_broadcast(&identity, &text));
                Ok(true)
            }
            // Chat before login is a protocol violation, not routable input.
            None => reject(writer, "you must log in before sending messages").await,
        },
    }
}

/// Sends a diagnostic to the offending client and signals the connection to
/// close. Best effort: the connection is going away regardless.
async fn reject(writer: &mut OwnedWriteHalf, reason: &str) -> Result<bool> {
    let line = format!("ERROR - {reason}. Terminating connection.");
    if let Err(err) = payload::write_line(writer, &line).await {
        debug!(error = ?err, "failed to deliver protocol error before close");
    }
    Ok(false)
}

async fn handle_relay_event(
    event: Result<RelayEvent, broadcast::error::RecvError>,
    writer: &mut OwnedWriteHalf,
) -> Result<bool> {
    match event {
        Ok(RelayEvent::Deliver(line)) => {
            if let Err(err) = payload::write_line(writer, &line).await {
                debug!(error = ?err, "failed to deliver line to client");
                return Ok(false);
            }
            Ok(true)
        }
        Ok(RelayEvent::Shutdown) => Ok(false),
        Err(broadcast::error::RecvError::Lagged(skipped)) => {
            warn!(skipped, "client fell behind on broadcasts");
            Ok(true)
        }
        Err(broadcast::error::RecvError::Closed) => Ok(false),
    }
}
