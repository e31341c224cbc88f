//! CLI configuration. No subcommands: the broker has one mode.

use clap::Parser;

#[derive(Debug, Parser)]
#[command(name = "chat-broker", about = "Real-time multi-user chat broker", version)]
pub struct Cli {
    /// Address to listen on, e.g. `0.0.0.0:8080`.
    #[arg(long, default_value = "0.0.0.0:8080")]
    pub listen: String,
}
