//! Console command classification.
//!
//! Both consoles share the same grammar: a line whose first character is
//! [`COMMAND_MARKER`] is an administrative command, anything else is chat
//! text. The recognized vocabulary differs by [`Role`]:
//!
//! - Client: `#quit`, `#logoff`, `#sethost <host>`, `#setport <port>`,
//!   `#login`, `#gethost`, `#getport`
//! - Server: `#quit`, `#stop`, `#close`, `#setport <port>`, `#start`,
//!   `#getport`
//!
//! `#sethost`/`#setport` are prefix-matched with the remainder of the line
//! as their argument; every other command is an exact match. Matching is
//! case-sensitive. A marker line outside the active vocabulary is an error
//! the caller displays and discards; it never affects connection state.

use thiserror::Error;

/// First character that distinguishes commands from chat text.
pub const COMMAND_MARKER: char = '#';

/// Which command vocabulary is active for a console.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

/// An administrative command, already validated against the active role.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdminCommand {
    Quit,
    Logoff,
    SetHost(String),
    SetPort(u16),
    Login,
    GetHost,
    GetPort,
    Stop,
    Close,
    Start,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CommandError {
    #[error("malformed {command} command: {reason}")]
    Malformed {
        command: &'static str,
        reason: String,
    },
    #[error("unknown command: {0}")]
    Unknown(String),
}

/// One console line, classified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleInput {
    Command(AdminCommand),
    Text(String),
}

impl ConsoleInput {
    /// Classifies a console line for the given role.
    ///
    /// Lines that do not start with [`COMMAND_MARKER`] pass through
    /// untouched as chat text and are never interpreted here.
    pub fn interpret(line: &str, role: Role) -> Result<Self, CommandError> {
        if !line.starts_with(COMMAND_MARKER) {
            return Ok(Self::Text(line.to_string()));
        }
        parse_command(line, role).map(Self::Command)
    }
}

fn parse_command(line: &str, role: Role) -> Result<AdminCommand, CommandError> {
    if let Some(argument) = prefix_argument(line, "#setport") {
        return parse_port(argument).map(AdminCommand::SetPort);
    }
    if role == Role::Client {
        if let Some(argument) = prefix_argument(line, "#sethost") {
            return parse_host(argument).map(AdminCommand::SetHost);
        }
    }

    match (line, role) {
        ("#quit", _) => Ok(AdminCommand::Quit),
        ("#getport", _) => Ok(AdminCommand::GetPort),
        ("#logoff", Role::Client) => Ok(AdminCommand::Logoff),
        ("#login", Role::Client) => Ok(AdminCommand::Login),
        ("#gethost", Role::Client) => Ok(AdminCommand::GetHost),
        ("#stop", Role::Server) => Ok(AdminCommand::Stop),
        ("#close", Role::Server) => Ok(AdminCommand::Close),
        ("#start", Role::Server) => Ok(AdminCommand::Start),
        _ => Err(CommandError::Unknown(line.to_string())),
    }
}

/// Matches `<token>` or `<token> <argument>`, returning the trimmed
/// argument. `#setportx` does not match `#setport`.
fn prefix_argument<'a>(line: &'a str, token: &str) -> Option<&'a str> {
    let rest = line.strip_prefix(token)?;
    if rest.is_empty() || rest.starts_with(' ') {
        Some(rest.trim())
    } else {
        None
    }
}

fn parse_port(argument: &str) -> Result<u16, CommandError> {
    if argument.is_empty() {
        return Err(CommandError::Malformed {
            command: "#setport",
            reason: "missing port number".to_string(),
        });
    }
    argument.parse().map_err(|_| CommandError::Malformed {
        command: "#setport",
        reason: format!("'{argument}' is not a valid port number"),
    })
}

fn parse_host(argument: &str) -> Result<String, CommandError> {
    if argument.is_empty() {
        return Err(CommandError::Malformed {
            command: "#sethost",
            reason: "missing host name".to_string(),
        });
    }
    Ok(argument.to_string())
}
