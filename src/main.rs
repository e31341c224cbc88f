//! Chat broker entry point: parses CLI configuration, initializes
//! logging, and runs the listener until the process is killed.

use std::sync::Arc;

use anyhow::Result;
use clap::Parser;

use chat_broker::config::Cli;
use chat_broker::history::History;
use chat_broker::listener;
use chat_broker::registry::Registry;

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_secs()
        .init();

    let cli = Cli::parse();
    let registry = Arc::new(Registry::new());
    let history = Arc::new(History::new());

    listener::run(&cli.listen, registry, history).await
}
