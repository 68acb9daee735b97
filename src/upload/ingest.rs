//! Chunk ingestion
//!
//! Processes one chunk end to end: look up (or create) the session, take its
//! lock, check the chunk index, append the payload and then advance or
//! finalize the session.
//!
//! # Flow
//!
//! 1. `get_or_create` the session; new sessions always expect chunk 0
//! 2. Lock the session; if it was retired meanwhile, start over
//! 3. Reject any index other than the expected one
//! 4. Chunk 0 creates (or truncates) the artifact
//! 5. Stream the payload into the artifact
//! 6. Advance, and on the last chunk close the artifact and drop the session
//!
//! A failed copy never advances the session. The artifact is cut back to the
//! length it had after the previous chunk, so resubmitting the same chunk
//! produces exactly the bytes a failure-free run would have.
//!
//! # Example
//!
//! ```no_run
//! use bytes::Bytes;
//! use chunk_uploadr::upload::{ChunkIngestor, ChunkRequest, LocalArtifactStore, SessionRegistry};
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = Arc::new(LocalArtifactStore::new("./uploads")?);
//! let ingestor = ChunkIngestor::new(Arc::new(SessionRegistry::new()), store);
//!
//! let request = ChunkRequest::new("a.bin", 1, 0)?;
//! let payload = futures::stream::iter(vec![Ok::<_, std::io::Error>(Bytes::from("AAA"))]);
//! let receipt = ingestor.ingest(&request, payload).await?;
//! assert!(receipt.complete);
//! # Ok(())
//! # }
//! ```

use super::registry::SessionRegistry;
use super::session::{SessionSnapshot, UploadSession};
use super::storage::{ArtifactHandle, ArtifactStore};
use super::UploadError;
use crate::metrics;
use bytes::Bytes;
use chrono::Utc;
use futures::{Stream, StreamExt};
use serde::Serialize;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, error, info, warn};

/// Identifying fields of one chunk request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkRequest {
    pub identifier: String,
    pub total_chunks: u64,
    pub chunk_index: u64,
}

impl ChunkRequest {
    /// Build a request, checking the fields against each other
    pub fn new(
        identifier: impl Into<String>,
        total_chunks: u64,
        chunk_index: u64,
    ) -> Result<Self, UploadError> {
        let identifier = identifier.into();

        if identifier.is_empty() {
            return Err(UploadError::MalformedRequest("file name is empty".into()));
        }
        if total_chunks == 0 {
            return Err(UploadError::MalformedRequest(
                "total chunks must be positive".into(),
            ));
        }
        if chunk_index >= total_chunks {
            return Err(UploadError::MalformedRequest(format!(
                "chunk {} out of range for {} chunks",
                chunk_index, total_chunks
            )));
        }

        Ok(Self {
            identifier,
            total_chunks,
            chunk_index,
        })
    }

    /// Build a request from raw field values as they arrive on the wire
    pub fn parse(
        identifier: Option<&str>,
        total_chunks: Option<&str>,
        chunk_index: Option<&str>,
    ) -> Result<Self, UploadError> {
        let (identifier, total_chunks, chunk_index) = match (identifier, total_chunks, chunk_index)
        {
            (Some(id), Some(total), Some(index)) if !id.is_empty() => (id, total, index),
            _ => return Err(UploadError::MalformedRequest("missing headers".into())),
        };

        let total_chunks = total_chunks.trim().parse::<u64>().map_err(|_| {
            UploadError::MalformedRequest(format!("invalid total chunks '{}'", total_chunks))
        })?;
        let chunk_index = chunk_index.trim().parse::<u64>().map_err(|_| {
            UploadError::MalformedRequest(format!("invalid chunk index '{}'", chunk_index))
        })?;

        Self::new(identifier, total_chunks, chunk_index)
    }
}

/// Outcome of an accepted chunk
#[derive(Debug, Clone, Serialize)]
pub struct ChunkReceipt {
    pub identifier: String,
    pub chunk: u64,
    pub bytes_written: u64,
    /// Index the session expects next; equals the total once complete
    pub expected_chunk: u64,
    pub complete: bool,
    /// Location of the reassembled file, set once complete
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact_path: Option<PathBuf>,
}

/// Applies chunk requests to upload sessions
pub struct ChunkIngestor {
    registry: Arc<SessionRegistry>,
    store: Arc<dyn ArtifactStore>,
}

impl ChunkIngestor {
    pub fn new(registry: Arc<SessionRegistry>, store: Arc<dyn ArtifactStore>) -> Self {
        Self { registry, store }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Ingest one chunk
    #[tracing::instrument(
        name = "upload.chunk",
        skip(self, request, payload),
        fields(
            upload.identifier = %request.identifier,
            upload.chunk = request.chunk_index,
            upload.total_chunks = request.total_chunks
        )
    )]
    pub async fn ingest<S, E>(
        &self,
        request: &ChunkRequest,
        payload: S,
    ) -> Result<ChunkReceipt, UploadError>
    where
        S: Stream<Item = Result<Bytes, E>> + Send,
        E: Into<Box<dyn std::error::Error + Send + Sync>> + Send,
    {
        let start_time = Instant::now();
        let result = self.ingest_locked(request, payload).await;
        let duration = start_time.elapsed();

        match &result {
            Ok(receipt) => {
                metrics::record_chunk_accepted(receipt.bytes_written, duration.as_secs_f64())
            }
            Err(e) => metrics::record_chunk_rejected(e.kind().as_str(), duration.as_secs_f64()),
        }
        metrics::set_active_sessions(self.registry.len());

        result
    }

    async fn ingest_locked<S, E>(
        &self,
        request: &ChunkRequest,
        payload: S,
    ) -> Result<ChunkReceipt, UploadError>
    where
        S: Stream<Item = Result<Bytes, E>> + Send,
        E: Into<Box<dyn std::error::Error + Send + Sync>> + Send,
    {
        let identifier = request.identifier.as_str();
        let chunk = request.chunk_index;
        let mut session = self.acquire(request).await;

        if chunk != session.expected_chunk() {
            warn!(
                expected = session.expected_chunk(),
                received = chunk,
                "Rejected out-of-order chunk"
            );
            return Err(UploadError::OutOfOrderChunk {
                identifier: identifier.to_string(),
                expected: session.expected_chunk(),
                received: chunk,
            });
        }

        if request.total_chunks != session.total_chunks() {
            warn!(
                session_total = session.total_chunks(),
                declared_total = request.total_chunks,
                "Declared total differs from session, keeping session total"
            );
        }

        if chunk == 0 {
            session.detach();
            let handle = self.store.create(identifier).await.map_err(|source| {
                error!(error = %source, "Failed to create artifact");
                UploadError::StorageUnavailable {
                    identifier: identifier.to_string(),
                    source,
                }
            })?;
            session.attach(handle);
        }

        let committed = session.committed_bytes();
        let needs_rollback = session.is_dirty();
        session.mark_dirty();
        let handle = match session.handle_mut() {
            Some(handle) => handle,
            None => {
                error!("Session has no open artifact");
                return Err(UploadError::StorageUnavailable {
                    identifier: identifier.to_string(),
                    source: io::Error::new(io::ErrorKind::NotFound, "artifact is not open"),
                });
            }
        };

        // A previous attempt may have been cancelled mid-copy
        if needs_rollback {
            debug!(committed_bytes = committed, "Discarding bytes of an interrupted attempt");
            handle
                .truncate(committed)
                .await
                .map_err(|source| write_failure(request, source))?;
        }

        let (written, copied) = copy_payload(handle, payload).await;

        if let Err(source) = copied {
            error!(
                error = %source,
                bytes_written = written,
                "Failed to write chunk"
            );
            self.rollback(&mut session, request, committed).await;
            return Err(write_failure(request, source));
        }

        session.advance(written);
        let expected_chunk = session.expected_chunk();

        if !session.is_final_chunk(chunk) {
            debug!(
                bytes_written = written,
                expected_chunk = expected_chunk,
                "Accepted chunk"
            );
            return Ok(ChunkReceipt {
                identifier: identifier.to_string(),
                chunk,
                bytes_written: written,
                expected_chunk,
                complete: false,
                artifact_path: None,
            });
        }

        let artifact_path = self.store.artifact_path(identifier);
        let total_bytes = session.committed_bytes();
        let handle = session.retire();
        // Out of the registry before the close await, so a dropped request
        // cannot leave a retired session behind
        self.registry.delete(identifier);
        let closed = match handle {
            Some(handle) => handle.close().await,
            None => Ok(()),
        };

        if let Err(source) = closed {
            error!(error = %source, "Failed to close artifact");
            return Err(UploadError::FinalizeFailure {
                identifier: identifier.to_string(),
                source,
            });
        }

        metrics::record_upload_completed();
        info!(
            path = %artifact_path.display(),
            total_bytes = total_bytes,
            "Upload completed"
        );

        Ok(ChunkReceipt {
            identifier: identifier.to_string(),
            chunk,
            bytes_written: written,
            expected_chunk,
            complete: true,
            artifact_path: Some(artifact_path),
        })
    }

    /// Lock the live session for `request`, creating it if needed
    async fn acquire(&self, request: &ChunkRequest) -> OwnedMutexGuard<UploadSession> {
        let mut attempt = 0u32;
        loop {
            let (session, _) =
                self.registry
                    .get_or_create(&request.identifier, request.total_chunks, 0);
            let guard = session.lock_owned().await;
            if !guard.is_retired() {
                return guard;
            }
            attempt += 1;
            debug!(
                identifier = %request.identifier,
                attempt = attempt,
                "Session retired while waiting, retrying"
            );
        }
    }

    /// Undo a failed copy so the same chunk can be resubmitted
    async fn rollback(
        &self,
        session: &mut UploadSession,
        request: &ChunkRequest,
        committed: u64,
    ) {
        if request.chunk_index == 0 {
            // Back to pending: no file may outlive the failed first chunk
            session.detach();
            if let Err(e) = self.store.discard(&request.identifier).await {
                warn!(error = %e, "Failed to remove partial artifact");
            }
            return;
        }

        if let Some(handle) = session.handle_mut() {
            match handle.truncate(committed).await {
                Ok(()) => session.mark_clean(),
                Err(e) => error!(
                    error = %e,
                    committed_bytes = committed,
                    "Failed to roll back partial chunk, will retry on next attempt"
                ),
            }
        }
    }

    /// Cancel an upload: the session leaves the registry and its partial
    /// artifact is removed
    #[tracing::instrument(name = "upload.abort", skip(self))]
    pub async fn abort(&self, identifier: &str) -> Result<SessionSnapshot, UploadError> {
        let session = self
            .registry
            .get(identifier)
            .ok_or_else(|| UploadError::SessionNotFound(identifier.to_string()))?;
        let mut session = session.lock_owned().await;
        if session.is_retired() {
            return Err(UploadError::SessionNotFound(identifier.to_string()));
        }

        let snapshot = session.snapshot();
        self.retire(&mut session, identifier).await;

        metrics::record_sessions_reaped(1);
        metrics::set_active_sessions(self.registry.len());
        info!(
            expected_chunk = snapshot.expected_chunk,
            total_chunks = snapshot.total_chunks,
            "Upload aborted"
        );

        Ok(snapshot)
    }

    /// Retire every session idle for longer than `max_idle`.
    ///
    /// Sessions whose lock is held (a chunk is being written) are skipped.
    /// Returns the identifiers that were reaped.
    pub async fn reap_idle(&self, max_idle: Duration) -> Vec<String> {
        let max_idle = match chrono::Duration::from_std(max_idle) {
            Ok(d) => d,
            Err(_) => return Vec::new(),
        };
        let cutoff = Utc::now() - max_idle;

        let mut reaped = Vec::new();
        for (identifier, session) in self.registry.sessions() {
            let mut session = match session.try_lock_owned() {
                Ok(guard) => guard,
                Err(_) => continue,
            };
            if session.is_retired() || session.last_activity() > cutoff {
                continue;
            }

            self.retire(&mut session, &identifier).await;
            reaped.push(identifier);
        }

        if !reaped.is_empty() {
            metrics::record_sessions_reaped(reaped.len());
            info!(count = reaped.len(), "Reaped idle upload sessions");
        }
        metrics::set_active_sessions(self.registry.len());

        reaped
    }

    /// Retire a session without completing it. The caller holds its lock.
    async fn retire(&self, session: &mut UploadSession, identifier: &str) {
        // Pending sessions never opened the artifact; a file under this name
        // belongs to an earlier, completed upload.
        if let Some(handle) = session.retire() {
            drop(handle);
            if let Err(e) = self.store.discard(identifier).await {
                warn!(identifier = identifier, error = %e, "Failed to remove partial artifact");
            }
        }
        self.registry.delete(identifier);
    }
}

fn write_failure(request: &ChunkRequest, source: io::Error) -> UploadError {
    UploadError::WriteFailure {
        identifier: request.identifier.clone(),
        chunk: request.chunk_index,
        source,
    }
}

/// Copy the whole payload into `handle`.
///
/// Returns the bytes appended, which on failure is the prefix written before
/// the error.
async fn copy_payload<S, E>(handle: &mut dyn ArtifactHandle, payload: S) -> (u64, io::Result<()>)
where
    S: Stream<Item = Result<Bytes, E>> + Send,
    E: Into<Box<dyn std::error::Error + Send + Sync>> + Send,
{
    futures::pin_mut!(payload);
    let mut written = 0u64;

    while let Some(frame) = payload.next().await {
        let data = match frame {
            Ok(data) => data,
            Err(e) => return (written, Err(io::Error::new(io::ErrorKind::Other, e))),
        };
        if let Err(e) = handle.append(&data).await {
            return (written, Err(e));
        }
        written += data.len() as u64;
    }

    (written, Ok(()))
}
