use std::{net::SocketAddr, path::PathBuf};

use clap::{Args, Parser, Subcommand};

use crate::registry::BystanderPolicy;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the relay, routing chat between connected clients.
    Relay(RelayArgs),
    /// Connect to a relay and chat, optionally in secret.
    Client(ClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct RelayArgs {
    /// Socket address the relay should bind to. Use 0 for an ephemeral port.
    #[arg(long, default_value = "127.0.0.1:3000")]
    pub listen: SocketAddr,

    /// Whether clients outside a private exchange see its ciphertext.
    #[arg(long, value_enum, default_value_t = BystanderPolicy::Suppress)]
    pub bystanders: BystanderPolicy,
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Address of the relay to connect to.
    #[arg(long, default_value = "127.0.0.1:3000")]
    pub server: SocketAddr,

    /// Username to register. Prompted for after connecting when omitted.
    #[arg(long)]
    pub username: Option<String>,

    /// File holding this client's secret key; created on first use.
    #[arg(long)]
    pub key_file: Option<PathBuf>,
}
