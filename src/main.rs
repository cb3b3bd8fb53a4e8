//! objbroker daemon - the broker process every bus client connects to.
//!
//! Serves the length-prefixed TCP protocol until Ctrl-C.

use clap::Parser;
use objbroker::broker::Broker;
use objbroker::ipc::BrokerServer;
use objbroker::Config;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(name = "objbroker-daemon")]
#[command(about = "Message broker for cross-process object proxies")]
struct Args {
    /// Address to listen on (overrides the config file)
    #[arg(short, long, env = "OBJBROKER_LISTEN")]
    listen: Option<String>,

    /// JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => Config::from_json_file(path)?,
        None => Config::default(),
    };
    if let Some(listen) = args.listen {
        config.broker.listen_addr = listen;
    }

    objbroker::observability::init_tracing_with(&config.observability);

    let broker = Arc::new(Broker::new());
    let server = Arc::new(BrokerServer::bind(broker.clone(), config.broker.clone()).await?);
    tracing::info!("objbroker daemon starting on {}", server.local_addr());

    let serving = server.clone();
    let task = tokio::spawn(async move { serving.serve().await });

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown signal received");
    server.shutdown();
    task.await??;

    let stats = broker.stats();
    tracing::info!(
        "broker stopped: {} clients still attached, {} messages forwarded",
        stats.connected_clients,
        stats.messages_forwarded
    );
    Ok(())
}
