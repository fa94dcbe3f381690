use clap::{Args, Parser, Subcommand};

use crate::relay::DEFAULT_PORT;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the relay server, accepting client connections.
    Server(ServerArgs),
    /// Connect to a relay server and chat.
    Client(ClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServerArgs {
    /// Port to listen on. Use 0 for an ephemeral port.
    #[arg(default_value_t = DEFAULT_PORT)]
    pub port: u16,
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Identity announced to the server in the login handshake.
    #[arg(long)]
    pub identity: String,

    /// Host name of the relay server.
    #[arg(long, default_value = "localhost")]
    pub host: String,

    /// Port the relay server listens on.
    #[arg(long, default_value_t = DEFAULT_PORT)]
    pub port: u16,
}
