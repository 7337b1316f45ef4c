//! PubSubSQL Server CLI
//!
//! A thin wrapper around the pubsubsql-serve library.

use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use pubsubsql_serve::{Engine, EngineConfig, PubSubServer};

#[derive(Parser)]
#[command(name = "pubsubsql-server")]
#[command(about = "In-memory SQL tables with filtered change subscriptions")]
#[command(after_help = "\
EXAMPLES:
    # Listen on the default port
    pubsubsql-server

    # Local only, never drop pending notifications
    pubsubsql-server --host 127.0.0.1 --port 9000 --max-pending 0
")]
struct Args {
    /// Port to listen on
    #[arg(short, long, default_value = "7777")]
    port: u16,

    /// Host to bind to
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    /// Pending notification batches kept per subscriber before the oldest
    /// is dropped. Default 10000. Use 0 for unlimited.
    #[arg(long, default_value = "10000")]
    max_pending: usize,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();

    let max_pending = if args.max_pending == 0 {
        None
    } else {
        Some(args.max_pending)
    };
    log::info!(
        "Max pending notifications per subscriber: {}",
        max_pending.map_or("unlimited".to_string(), |n| n.to_string())
    );

    let engine = Arc::new(Engine::with_config(
        EngineConfig::default().with_max_pending(max_pending),
    ));
    let server = PubSubServer::new(engine);

    let addr: SocketAddr = format!("{}:{}", args.host, args.port).parse()?;
    println!("Starting server on ws://{}", addr);
    server.listen(addr).await?;
    Ok(())
}
