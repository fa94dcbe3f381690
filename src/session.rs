//! The client session: one outbound connection, its identity, and the
//! console command handling around it.
//!
//! A session is driven by exactly one task. The console loop multiplexes
//! stdin and server traffic with `select!`, so the two event sources can
//! never race on the session state. Inbound broadcast lines are already
//! formatted by the relay and are displayed verbatim.

use anyhow::{Context, Result, bail};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    select, signal,
};
use tracing::{debug, warn};

use crate::{
    cli::ClientArgs,
    command::{AdminCommand, ConsoleInput, Role},
    console::{self, Flow},
    payload::{self, Payload},
};

/// A client session. `host` and `port` are mutable only while disconnected;
/// the identity is fixed for the life of the session.
pub struct Session {
    host: String,
    port: u16,
    identity: String,
    conn: Option<Connection>,
}

struct Connection {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

/// What the server half of the connection produced.
#[derive(Debug)]
pub enum InboundEvent {
    /// A formatted broadcast line to display.
    Line(String),
    /// The peer closed the connection cleanly.
    Closed,
    /// The transport failed mid-session.
    Failed(std::io::Error),
}

impl Session {
    pub fn new(identity: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            identity: identity.into(),
            conn: None,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn is_connected(&self) -> bool {
        self.conn.is_some()
    }

    /// Opens the connection and performs the login handshake.
    ///
    /// The `login:` payload goes out before anything else on the wire; the
    /// relay treats the first payload on a fresh connection specially. A
    /// connect failure leaves the session disconnected.
    pub async fn connect(&mut self) -> Result<()> {
        if self.conn.is_some() {
            bail!("You are already logged in.");
        }
        let stream = TcpStream::connect((self.host.as_str(), self.port))
            .await
            .with_context(|| format!("could not connect to {}:{}", self.host, self.port))?;
        let (reader, mut writer) = stream.into_split();

        let login = Payload::Login {
            identity: self.identity.clone(),
        };
        payload::write_line(&mut writer, &login.encode())
            .await
            .context("could not send login to server")?;

        self.conn = Some(Connection {
            lines: BufReader::new(reader).lines(),
            writer,
        });
        console::write_stdout(&format!("*** {} has logged on.", self.identity)).await?;
        Ok(())
    }

    /// Closes the connection. The session is disconnected as soon as this
    /// returns; it does not wait on the peer.
    pub async fn disconnect(&mut self) -> Result<()> {
        let Some(mut conn) = self.conn.take() else {
            bail!("You are not connected to a server.");
        };
        // Best-effort close; the connection is gone either way.
        if let Err(error) = conn.writer.shutdown().await {
            debug!(?error, "failed to shut down client writer cleanly");
        }
        console::write_stdout("*** Your connection has closed.").await?;
        Ok(())
    }

    /// Routes one console line: chat text goes to the server, `#`-commands
    /// act on the session.
    pub async fn submit_line(&mut self, line: &str) -> Result<Flow> {
        match ConsoleInput::interpret(line, Role::Client) {
            Ok(ConsoleInput::Text(text)) => self.send_chat(&text).await,
            Ok(ConsoleInput::Command(command)) => self.apply_command(command).await,
            Err(err) => {
                console::write_stderr(&format!("!!! {err}")).await?;
                Ok(Flow::Continue)
            }
        }
    }

    async fn send_chat(&mut self, text: &str) -> Result<Flow> {
        let Some(conn) = self.conn.as_mut() else {
            console::write_stderr("!!! You are not connected to a server.").await?;
            return Ok(Flow::Continue);
        };
        if let Err(error) = payload::write_line(&mut conn.writer, text).await {
            // A mid-stream send failure is unrecoverable; the protocol has
            // no way to resynchronize after a lost message.
            debug!(?error, "send failed");
            console::write_stderr("!!! Could not send message to server. Terminating client.")
                .await?;
            return self.terminate().await;
        }
        Ok(Flow::Continue)
    }

    async fn apply_command(&mut self, command: AdminCommand) -> Result<Flow> {
        match command {
            AdminCommand::Quit => return self.terminate().await,
            AdminCommand::Logoff => {
                if let Err(err) = self.disconnect().await {
                    console::write_stderr(&format!("!!! {err}")).await?;
                }
            }
            AdminCommand::Login => {
                if self.is_connected() {
                    console::write_stderr("!!! You are already logged in.").await?;
                } else if let Err(err) = self.connect().await {
                    console::write_stderr(&format!("!!! {err:#}")).await?;
                }
            }
            AdminCommand::SetHost(host) => {
                if self.is_connected() {
                    console::write_stderr("!!! You must log off before setting another host.")
                        .await?;
                } else {
                    self.host = host;
                }
            }
            AdminCommand::SetPort(port) => {
                if self.is_connected() {
                    console::write_stderr("!!! You must log off before setting another port.")
                        .await?;
                } else {
                    self.port = port;
                }
            }
            AdminCommand::GetHost => {
                console::write_stdout(&format!("*** Current host: {}", self.host)).await?;
            }
            AdminCommand::GetPort => {
                console::write_stdout(&format!("*** Current port: {}", self.port)).await?;
            }
            AdminCommand::Stop | AdminCommand::Close | AdminCommand::Start => {
                // The interpreter never yields these for the client role.
                warn!(?command, "server-only command reached the client console");
            }
        }
        Ok(Flow::Continue)
    }

    /// Ends the session: best-effort close, then hands control back to the
    /// caller, which performs process exit.
    pub async fn terminate(&mut self) -> Result<Flow> {
        if self.is_connected() {
            let _ = self.disconnect().await;
        }
        Ok(Flow::Terminate)
    }

    /// Waits for the next inbound event. Pends forever while disconnected,
    /// so it can ride in a `select!` alongside console input.
    pub async fn next_inbound(&mut self) -> InboundEvent {
        match self.conn.as_mut() {
            Some(conn) => match conn.lines.next_line().await {
                Ok(Some(line)) => InboundEvent::Line(line),
                Ok(None) => InboundEvent::Closed,
                Err(error) => InboundEvent::Failed(error),
            },
            None => std::future::pending().await,
        }
    }

    /// Applies one inbound event to the session.
    pub async fn handle_inbound(&mut self, event: InboundEvent) -> Result<Flow> {
        match event {
            InboundEvent::Line(line) => {
                console::write_stdout(&line).await?;
                Ok(Flow::Continue)
            }
            InboundEvent::Closed => {
                // Peer-initiated close: notice only, no auto-reconnect.
                self.conn = None;
                console::write_stdout("*** Your connection has closed.").await?;
                Ok(Flow::Continue)
            }
            InboundEvent::Failed(error) => {
                debug!(?error, "connection failed");
                self.conn = None;
                console::write_stderr("!!! The server has shut down. Terminating client.").await?;
                self.terminate().await
            }
        }
    }
}

/// Runs the client console: connects, then multiplexes stdin and server
/// traffic until the session terminates.
pub async fn run(args: ClientArgs) -> Result<()> {
    let mut session = Session::new(args.identity, args.host, args.port);
    session.connect().await?;

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
                        if let Flow::Terminate = session.submit_line(line).await? {
                            break;
                        }
                    }
                    None => {
                        let _ = session.terminate().await?;
                        break;
                    }
                }
            }
            event = session.next_inbound() => {
                if let Flow::Terminate = session.handle_inbound(event).await? {
                    break;
                }
            }
            ctrl_c = signal::ctrl_c() => {
                if let Err(error) = ctrl_c {
                    warn!(?error, "ctrl-c handler failed");
                }
                let _ = session.terminate().await?;
                break;
            }
        }
    }
    Ok(())
}
