//! Chunk Uploadr Library
//!
//! Reassembles large files uploaded as a sequence of ordered HTTP chunks.
//!
//! # Features
//!
//! - **Ordered Reassembly**: Each upload accepts exactly the next expected chunk
//! - **Per-Upload Locking**: Chunks of one upload are serialized, different uploads never contend
//! - **Idempotent Retry**: A failed chunk write is rolled back so the same chunk can be resent
//! - **Idle Expiry**: Abandoned uploads are discarded after a configurable timeout
//!
//! # Example
//!
//! ```no_run
//! use chunk_uploadr::{config::Config, server::Server};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("config.yaml")?;
//!     let server = Server::new(config).await?;
//!     server.run().await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod metrics;
pub mod router;
pub mod server;
pub mod upload;

// Re-export commonly used types
pub use config::Config;
pub use server::Server;
pub use upload::{ChunkIngestor, ChunkRequest, SessionRegistry, UploadError};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
