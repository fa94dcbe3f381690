//! A line-oriented multi-client chat relay.
//!
//! Clients connect to the relay over TCP and introduce themselves with a
//! one-shot `login:<identity>` handshake, sent as the very first payload on
//! the connection. After that, every line a client sends is re-broadcast to
//! all connected clients (the sender included) tagged with the sender's
//! identity. Both programs expose a terminal console whose `#`-prefixed
//! lines are administrative commands; everything else is chat text.
//!
//! Each module focuses on a concrete responsibility:
//!
//! - [`cli`] parses the command-line interface for server and client modes.
//! - [`command`] classifies console lines against the role-specific
//!   administrative command vocabulary.
//! - [`payload`] defines the wire payload variants and broadcast line
//!   formats.
//! - [`relay`] accepts TCP connections, runs the login handshake, and fans
//!   chat lines out over a Tokio `broadcast` channel.
//! - [`session`] drives one client connection, multiplexing stdin and
//!   server traffic for a terminal user.
//!
//! Integration and unit tests use this crate directly to exercise the relay
//! state machine and wire protocol.

pub mod cli;
pub mod command;
pub mod console;
pub mod payload;
pub mod relay;
pub mod session;
