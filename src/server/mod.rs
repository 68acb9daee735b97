//! HTTP server module
//!
//! The composition root: builds the session registry, the artifact store and
//! the chunk ingestor from configuration, then serves the upload API on a
//! `hyper` HTTP/1.1 listener.
//!
//! # Example
//!
//! ```no_run
//! use chunk_uploadr::config::Config;
//! use chunk_uploadr::server::Server;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::load("config.yaml")?;
//! let server = Server::new(config).await?;
//! println!("Listening on {}", server.local_addr());
//! server.run().await?;
//! # Ok(())
//! # }
//! ```

pub mod handler;

use crate::config::{Config, ConfigError};
use crate::metrics::server::MetricsServer;
use crate::router::UploadRouter;
use crate::upload::{ChunkIngestor, LocalArtifactStore, SessionRegistry};
use handler::AppState;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

/// Server errors
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("Failed to bind to address: {0}")]
    BindError(String),

    #[error("Invalid configuration: {0}")]
    ConfigError(#[from] ConfigError),

    #[error("Upload directory unavailable: {0}")]
    StorageError(#[source] std::io::Error),

    #[error("Server error: {0}")]
    RuntimeError(String),
}

/// Chunked upload HTTP server
pub struct Server {
    config: Arc<Config>,
    listener: TcpListener,
    local_addr: SocketAddr,
    ingestor: Arc<ChunkIngestor>,
}

impl Server {
    /// Build the upload stack from `config` and bind the listener.
    ///
    /// Port 0 lets the OS pick a port; see [`Server::local_addr`].
    pub async fn new(config: Config) -> Result<Self, ServerError> {
        config.validate()?;

        let store = LocalArtifactStore::new(&config.storage.upload_dir)
            .map_err(ServerError::StorageError)?
            .with_sync_on_close(config.storage.sync_on_finalize);
        let ingestor = ChunkIngestor::new(Arc::new(SessionRegistry::new()), Arc::new(store));

        Self::with_ingestor(config, Arc::new(ingestor)).await
    }

    /// Bind a server around an existing ingestor
    pub async fn with_ingestor(
        config: Config,
        ingestor: Arc<ChunkIngestor>,
    ) -> Result<Self, ServerError> {
        let addr = config.server.socket_addr()?;

        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ServerError::BindError(format!("Failed to bind to {}: {}", addr, e)))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| ServerError::BindError(format!("Failed to get local address: {}", e)))?;

        info!("Server bound to {}", local_addr);

        Ok(Self {
            config: Arc::new(config),
            listener,
            local_addr,
            ingestor,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn ingestor(&self) -> Arc<ChunkIngestor> {
        Arc::clone(&self.ingestor)
    }

    /// Serve until Ctrl-C
    pub async fn run(self) -> Result<(), ServerError> {
        self.run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for shutdown signal: {}", e);
                std::future::pending::<()>().await;
            }
        })
        .await
    }

    /// Serve until `shutdown` resolves.
    ///
    /// Each connection runs on its own task; a failing connection is logged
    /// and never stops the accept loop.
    pub async fn run_until<F>(self, shutdown: F) -> Result<(), ServerError>
    where
        F: Future<Output = ()>,
    {
        let mut metrics_server = self.start_metrics().await;
        let reaper = self.spawn_reaper();

        let state = Arc::new(AppState {
            ingestor: Arc::clone(&self.ingestor),
            router: UploadRouter::new(&self.config.server.upload_path),
        });

        info!(
            "Accepting chunk uploads on {}{}",
            self.local_addr, self.config.server.upload_path
        );

        tokio::pin!(shutdown);
        loop {
            let (stream, peer_addr) = tokio::select! {
                _ = &mut shutdown => break,
                accepted = self.listener.accept() => match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        error!("Failed to accept connection: {}", e);
                        continue;
                    }
                },
            };

            let state = Arc::clone(&state);
            tokio::spawn(async move {
                let service = service_fn(move |req| handler::handle_request(req, Arc::clone(&state)));

                if let Err(e) = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await
                {
                    error!("Error serving connection from {}: {}", peer_addr, e);
                }
            });
        }

        info!("Shutting down server");
        if let Some(reaper) = reaper {
            reaper.abort();
        }
        if let Some(metrics_server) = metrics_server.as_mut() {
            metrics_server.shutdown().await;
        }
        if !self.ingestor.registry().is_empty() {
            warn!(
                sessions = self.ingestor.registry().len(),
                "Unfinished uploads are dropped on shutdown"
            );
        }

        Ok(())
    }

    async fn start_metrics(&self) -> Option<MetricsServer> {
        if !self.config.metrics.enabled {
            return None;
        }

        let addr = SocketAddr::new(self.local_addr.ip(), self.config.metrics.port);
        let mut server = MetricsServer::new(&addr.to_string());
        match server.start().await {
            Ok(_) => Some(server),
            Err(e) => {
                // Uploads keep working without a scrape endpoint
                warn!("Failed to start metrics server on {}: {}", addr, e);
                None
            }
        }
    }

    fn spawn_reaper(&self) -> Option<tokio::task::JoinHandle<()>> {
        let max_idle = self.config.upload.session_idle_timeout()?;
        let period = self.config.upload.reap_interval();
        let ingestor = Arc::clone(&self.ingestor);

        info!(
            idle_timeout_secs = max_idle.as_secs(),
            interval_secs = period.as_secs(),
            "Idle session expiry enabled"
        );

        Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                interval.tick().await;
                ingestor.reap_idle(max_idle).await;
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{MetricsConfig, ServerConfig, StorageConfig, UploadConfig};

    fn test_config(upload_dir: &std::path::Path) -> Config {
        Config {
            server: ServerConfig {
                address: "127.0.0.1:0".into(),
                upload_path: "/upload".into(),
            },
            storage: StorageConfig {
                upload_dir: upload_dir.display().to_string(),
                sync_on_finalize: false,
            },
            upload: UploadConfig::default(),
            metrics: MetricsConfig {
                enabled: false,
                port: 0,
            },
        }
    }

    #[tokio::test]
    async fn test_server_creation() {
        let dir = tempfile::tempdir().unwrap();
        let server = Server::new(test_config(dir.path())).await.unwrap();
        assert!(server.local_addr().port() > 0);
        assert!(server.ingestor().registry().is_empty());
    }

    #[tokio::test]
    async fn test_server_rejects_invalid_address() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.server.address = "invalid".into();
        assert!(Server::new(config).await.is_err());
    }

    #[tokio::test]
    async fn test_run_until_returns_on_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let server = Server::new(test_config(dir.path())).await.unwrap();
        server.run_until(async {}).await.unwrap();
    }
}
