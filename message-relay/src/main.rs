use std::{sync::Arc, time::Duration};

use anyhow::Result;
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{info, warn};

use message_relay::{
    broker::{Broker, BrokerConfig},
    cli::{BrokerArgs, Cli, Command},
    client,
    diagnostics::DiagnosticLog,
};

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

fn diagnostic_log(args: &BrokerArgs) -> DiagnosticLog {
    if args.no_log_file {
        return DiagnosticLog::disabled();
    }
    let path = args
        .log_file
        .clone()
        .unwrap_or_else(DiagnosticLog::default_path);
    DiagnosticLog::open(path)
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Command::Broker(args) => {
            let log = diagnostic_log(&args);
            if let Some(path) = log.path() {
                info!("diagnostic log at {}", path.display());
            }
            let config = BrokerConfig {
                send_timeout: Duration::from_secs(args.send_timeout_secs),
                log: Arc::new(log),
                ..BrokerConfig::default()
            };

            let listener = TcpListener::bind(args.listen).await?;
            let broker = Broker::new(listener, config);
            let addr = broker.local_addr()?;
            // Printed on stdout so scripts can discover an ephemeral port.
            println!("broker listening on {addr}");
            if let Err(err) = broker.run_until_ctrl_c().await {
                warn!("broker exited with error: {err:?}");
                return Err(err);
            }
        }
        Command::Client(args) => client::run(args).await?,
    }

    Ok(())
}
