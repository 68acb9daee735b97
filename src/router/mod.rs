//! Upload API Router
//!
//! Maps incoming requests to upload operations and extracts the chunk
//! headers into a [`ChunkRequest`].
//!
//! # Routes
//!
//! | Method | Path | Operation |
//! |---|---|---|
//! | `POST`, `PUT` | `{upload_path}` | Upload one chunk |
//! | `GET` | `/uploads/{identifier}` | Session status |
//! | `DELETE` | `/uploads/{identifier}` | Abort upload |
//! | `GET` | `/health` | Health check |

use crate::upload::{ChunkRequest, UploadError};
use hyper::{HeaderMap, Method};
use percent_encoding::percent_decode_str;

/// Upload identifier header
pub const HEADER_FILE_NAME: &str = "x-file-name";

/// Declared number of chunks header
pub const HEADER_TOTAL_CHUNKS: &str = "x-total-chunks";

/// Zero-based chunk index header
pub const HEADER_CURRENT_CHUNK: &str = "x-current-chunk";

/// Prefix of the per-session routes
pub const SESSIONS_PREFIX: &str = "/uploads/";

/// Upload API operations
#[derive(Debug, Clone, PartialEq)]
pub enum UploadOperation {
    /// GET /health
    Health,
    /// POST|PUT {upload_path}
    UploadChunk,
    /// GET /uploads/{identifier}
    SessionStatus { identifier: String },
    /// DELETE /uploads/{identifier}
    AbortUpload { identifier: String },
    /// Anything else
    NotFound,
}

/// Request router for the upload API
#[derive(Debug, Clone)]
pub struct UploadRouter {
    upload_path: String,
}

impl UploadRouter {
    pub fn new(upload_path: &str) -> Self {
        Self {
            upload_path: upload_path.trim_end_matches('/').to_string(),
        }
    }

    /// Resolve a request to an operation
    pub fn route(&self, method: &Method, path: &str) -> UploadOperation {
        let trimmed = if path.len() > 1 {
            path.trim_end_matches('/')
        } else {
            path
        };

        if trimmed == "/health" {
            return match *method {
                Method::GET => UploadOperation::Health,
                _ => UploadOperation::NotFound,
            };
        }

        if trimmed == self.upload_path {
            return match *method {
                Method::POST | Method::PUT => UploadOperation::UploadChunk,
                _ => UploadOperation::NotFound,
            };
        }

        if let Some(raw) = path.strip_prefix(SESSIONS_PREFIX) {
            let identifier = match percent_decode_str(raw).decode_utf8() {
                Ok(id) if !id.is_empty() => id.into_owned(),
                _ => return UploadOperation::NotFound,
            };
            return match *method {
                Method::GET => UploadOperation::SessionStatus { identifier },
                Method::DELETE => UploadOperation::AbortUpload { identifier },
                _ => UploadOperation::NotFound,
            };
        }

        UploadOperation::NotFound
    }
}

/// Extract the chunk fields from request headers
pub fn parse_chunk_headers(headers: &HeaderMap) -> Result<ChunkRequest, UploadError> {
    let header = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());

    ChunkRequest::parse(
        header(HEADER_FILE_NAME),
        header(HEADER_TOTAL_CHUNKS),
        header(HEADER_CURRENT_CHUNK),
    )
}
