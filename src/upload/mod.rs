//! Upload module
//!
//! Chunked upload reassembly: the session registry, the per-chunk ingest
//! path and the storage backend the chunks are appended to.

use serde::Serialize;
use std::io;
use thiserror::Error;

pub mod ingest;
pub mod registry;
pub mod session;
pub mod storage;

pub use ingest::{ChunkIngestor, ChunkReceipt, ChunkRequest};
pub use registry::SessionRegistry;
pub use session::{SessionSnapshot, SessionState, UploadSession};
pub use storage::{ArtifactHandle, ArtifactStore, LocalArtifactStore};

/// Upload errors
#[derive(Error, Debug)]
pub enum UploadError {
    #[error("malformed request: {0}")]
    MalformedRequest(String),

    #[error("invalid chunk, expected {expected}, got {received}")]
    OutOfOrderChunk {
        identifier: String,
        expected: u64,
        received: u64,
    },

    #[error("failed to create file for '{identifier}': {source}")]
    StorageUnavailable {
        identifier: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to write chunk {chunk} of '{identifier}': {source}")]
    WriteFailure {
        identifier: String,
        chunk: u64,
        #[source]
        source: io::Error,
    },

    #[error("failed to finalize '{identifier}': {source}")]
    FinalizeFailure {
        identifier: String,
        #[source]
        source: io::Error,
    },

    #[error("no upload in progress for '{0}'")]
    SessionNotFound(String),
}

/// Machine-readable error kind, as reported to clients
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    MalformedRequest,
    OutOfOrderChunk,
    StorageUnavailable,
    WriteFailure,
    FinalizeFailure,
    SessionNotFound,
}

impl ErrorKind {
    /// Stable label used in responses, logs and metrics
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::MalformedRequest => "MALFORMED_REQUEST",
            ErrorKind::OutOfOrderChunk => "OUT_OF_ORDER_CHUNK",
            ErrorKind::StorageUnavailable => "STORAGE_UNAVAILABLE",
            ErrorKind::WriteFailure => "WRITE_FAILURE",
            ErrorKind::FinalizeFailure => "FINALIZE_FAILURE",
            ErrorKind::SessionNotFound => "SESSION_NOT_FOUND",
        }
    }
}

impl UploadError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            UploadError::MalformedRequest(_) => ErrorKind::MalformedRequest,
            UploadError::OutOfOrderChunk { .. } => ErrorKind::OutOfOrderChunk,
            UploadError::StorageUnavailable { .. } => ErrorKind::StorageUnavailable,
            UploadError::WriteFailure { .. } => ErrorKind::WriteFailure,
            UploadError::FinalizeFailure { .. } => ErrorKind::FinalizeFailure,
            UploadError::SessionNotFound(_) => ErrorKind::SessionNotFound,
        }
    }

    /// Client errors leave session state untouched and are never retried by
    /// the server; everything else is an environment failure.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::MalformedRequest | ErrorKind::OutOfOrderChunk | ErrorKind::SessionNotFound
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_out_of_order_message_carries_both_indices() {
        let err = UploadError::OutOfOrderChunk {
            identifier: "b.bin".into(),
            expected: 0,
            received: 1,
        };
        assert_eq!(err.to_string(), "invalid chunk, expected 0, got 1");
        assert_eq!(err.kind(), ErrorKind::OutOfOrderChunk);
        assert!(err.is_client_error());
    }

    #[test]
    fn test_storage_errors_are_server_errors() {
        let err = UploadError::WriteFailure {
            identifier: "a.bin".into(),
            chunk: 2,
            source: io::Error::new(io::ErrorKind::Other, "disk full"),
        };
        assert!(!err.is_client_error());
        assert_eq!(err.kind().as_str(), "WRITE_FAILURE");
    }

    #[test]
    fn test_kind_serializes_screaming_snake_case() {
        let json = serde_json::to_string(&ErrorKind::StorageUnavailable).unwrap();
        assert_eq!(json, "\"STORAGE_UNAVAILABLE\"");
    }
}
