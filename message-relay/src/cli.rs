use std::{net::SocketAddr, path::PathBuf};

use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the message relay, accepting local TCP connections.
    Broker(BrokerArgs),
    /// Connect to a relay, send stdin lines and print relayed messages.
    Client(ClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct BrokerArgs {
    /// Socket address the relay should bind to. Use port 0 for an ephemeral port.
    #[arg(long, default_value = "127.0.0.1:5150")]
    pub listen: SocketAddr,

    /// Diagnostic log file. Defaults to MessageRelayLogs.txt under the local data dir.
    #[arg(long, conflicts_with = "no_log_file")]
    pub log_file: Option<PathBuf>,

    /// Only log through tracing, without a diagnostic log file.
    #[arg(long)]
    pub no_log_file: bool,

    /// Seconds a client gets to answer a relayed message.
    #[arg(long, default_value_t = 30)]
    pub send_timeout_secs: u64,
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Address of the relay to connect to.
    #[arg(long, default_value = "127.0.0.1:5150")]
    pub server: SocketAddr,

    /// Key each stdin line is sent under.
    #[arg(long, default_value = "Echo")]
    pub key: String,

    /// Seconds to wait between connection attempts.
    #[arg(long, default_value_t = 10)]
    pub retry_secs: u64,
}
