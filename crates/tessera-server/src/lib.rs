//! Tessera key directory service.
//!
//! Stores device identity keys, signed prekeys and one-time prekeys, and
//! hands out prekey bundles so that a peer can start an encrypted session
//! with a device that is offline.
//!
//! # Components
//!
//! - [`KeyDirectory`]: registration, grant, top-up and revocation logic
//! - [`BundleStore`]: atomic record persistence, in memory
//!   ([`MemoryBundleStore`]) or on disk ([`RedbBundleStore`])
//! - [`api::router`]: HTTP routes over a directory
//! - [`Server`]: Tokio/axum runtime binding the routes to a socket

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod api;
mod bundle_error;
mod directory;
mod error;
pub mod storage;

use std::net::SocketAddr;

use axum::Router;
pub use bundle_error::BundleError;
pub use directory::{DEFAULT_MAX_ONE_TIME_PRE_KEYS, DirectoryConfig, KeyDirectory};
pub use error::ServerError;
pub use storage::{BundleStore, DeviceBundle, MemoryBundleStore, RedbBundleStore, StorageError};
use tokio::net::TcpListener;

/// Path prefix the directory routes are mounted under.
pub const API_PREFIX: &str = "/api/keys";

/// Server configuration for the production runtime.
#[derive(Debug, Clone)]
pub struct ServerRuntimeConfig {
    /// Address to bind to (e.g., "0.0.0.0:5001")
    pub bind_address: String,
    /// Path to the bundle database; `None` keeps bundles in memory
    pub database_path: Option<String>,
    /// Directory limits
    pub directory: DirectoryConfig,
}

impl Default for ServerRuntimeConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:5001".to_string(),
            database_path: None,
            directory: DirectoryConfig::default(),
        }
    }
}

/// Full application router: directory routes under [`API_PREFIX`].
pub fn app<S: BundleStore>(directory: KeyDirectory<S>) -> Router {
    Router::new().nest(API_PREFIX, api::router(directory))
}

/// Key directory server.
pub struct Server<S: BundleStore> {
    listener: TcpListener,
    directory: KeyDirectory<S>,
}

impl<S: BundleStore> Server<S> {
    /// Bind the listener and set up a directory over `store`.
    pub async fn bind(config: ServerRuntimeConfig, store: S) -> Result<Self, ServerError> {
        let addr: SocketAddr = config
            .bind_address
            .parse()
            .map_err(|e| ServerError::Config(format!("invalid bind address: {e}")))?;
        let listener = TcpListener::bind(addr).await?;
        let directory = KeyDirectory::new(store, config.directory);

        Ok(Self { listener, directory })
    }

    /// Serve requests until the process is stopped or the listener fails.
    pub async fn run(self) -> Result<(), ServerError> {
        tracing::info!("Server starting on {}", self.listener.local_addr()?);

        axum::serve(self.listener, app(self.directory)).await?;

        Ok(())
    }

    /// Local address the server is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.listener.local_addr()?)
    }
}
