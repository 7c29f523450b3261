//! Tessera key directory binary.
//!
//! # Usage
//!
//! ```bash
//! # In-memory store (development)
//! tessera-server --bind 127.0.0.1:5001
//!
//! # Durable store
//! tessera-server --bind 0.0.0.0:5001 --database /var/lib/tessera/bundles.redb
//! ```

use clap::Parser;
use tessera_server::{
    BundleStore, DirectoryConfig, MemoryBundleStore, RedbBundleStore, Server, ServerError,
    ServerRuntimeConfig,
};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Tessera key directory
#[derive(Parser, Debug)]
#[command(name = "tessera-server")]
#[command(about = "Prekey bundle directory for Tessera sessions")]
#[command(version)]
struct Args {
    /// Address to bind to
    #[arg(short, long, default_value = "0.0.0.0:5001")]
    bind: String,

    /// Path to the bundle database; bundles are kept in memory when omitted
    #[arg(short, long)]
    database: Option<String>,

    /// Cap on unused one-time prekeys per device
    #[arg(long = "max-one-time-prekeys", default_value = "200")]
    max_one_time_pre_keys: usize,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();

    tracing::info!("Tessera key directory starting");
    tracing::info!("Binding to {}", args.bind);

    let config = ServerRuntimeConfig {
        bind_address: args.bind,
        database_path: args.database,
        directory: DirectoryConfig { max_one_time_pre_keys: args.max_one_time_pre_keys },
    };

    match config.database_path.clone() {
        Some(path) => {
            tracing::info!("Opening bundle database at {path}");
            serve(config, RedbBundleStore::open(&path)?).await?;
        },
        None => {
            tracing::warn!("No database path provided - bundles are kept in memory only");
            tracing::warn!("This is NOT suitable for production use!");
            serve(config, MemoryBundleStore::new()).await?;
        },
    }

    Ok(())
}

async fn serve<S: BundleStore>(config: ServerRuntimeConfig, store: S) -> Result<(), ServerError> {
    let server = Server::bind(config, store).await?;

    tracing::info!("Server listening on {}", server.local_addr()?);

    server.run().await
}
