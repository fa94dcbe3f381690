//! Wire payloads and broadcast line formats.
//!
//! Framing is one payload per newline-terminated line, which keeps the
//! protocol usable from netcat-style tools. The payload variant is decided
//! by a fixed prefix on the line, never by inspecting anything else: a line
//! starting with [`LOGIN_PREFIX`] is the login handshake, every other line
//! is chat text.

use std::io;

use tokio::io::{AsyncWrite, AsyncWriteExt};

/// Prefix that tags the one-shot login handshake payload.
pub const LOGIN_PREFIX: &str = "login:";

/// Tag prepended to operator-originated broadcasts.
pub const SERVER_TAG: &str = "SERVER MESSAGE";

/// A payload received from a client connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    /// The handshake. Valid only as the first payload on a connection.
    Login { identity: String },
    /// Chat text, opaque to the relay beyond identity tagging.
    Chat { text: String },
}

impl Payload {
    /// Classifies one inbound line. Total: every line is one of the two
    /// variants.
    pub fn decode(line: &str) -> Self {
        match line.strip_prefix(LOGIN_PREFIX) {
            Some(identity) => Self::Login {
                identity: identity.to_string(),
            },
            None => Self::Chat {
                text: line.to_string(),
            },
        }
    }

    pub fn encode(&self) -> String {
        match self {
            Self::Login { identity } => format!("{LOGIN_PREFIX}{identity}"),
            Self::Chat { text } => text.clone(),
        }
    }
}

/// Formats a chat line for broadcast, tagged with the sender's identity.
pub fn tagged_broadcast(identity: &str, text: &str) -> String {
    format!("{identity}> {text}")
}

/// Formats an operator-originated broadcast line.
pub fn server_broadcast(text: &str) -> String {
    format!("{SERVER_TAG}> {text}")
}

/// Writes one payload line, newline-delimited, and flushes so peers get
/// timely updates.
pub async fn write_line<W>(writer: &mut W, line: &str) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await
}
