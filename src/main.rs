use anyhow::Result;
use clap::Parser;

use chat_relay::{
    cli::{Cli, Command},
    relay, session,
};

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Command::Server(args) => relay::run(args).await?,
        Command::Client(args) => session::run(args).await?,
    }

    Ok(())
}
