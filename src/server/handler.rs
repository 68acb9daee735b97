//! HTTP request handling
//!
//! Turns hyper requests into upload operations and upload results into JSON
//! responses. Errors carry their machine-readable kind; ordering errors also
//! carry the expected and received chunk indices.

use crate::router::{parse_chunk_headers, UploadOperation, UploadRouter};
use crate::upload::{ChunkIngestor, ChunkReceipt, ErrorKind, UploadError};
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::{body::Incoming, Request, Response, StatusCode};
use serde::Serialize;
use std::convert::Infallible;
use std::sync::Arc;
use tracing::{info, warn, Instrument};

/// Shared state of the request handlers
pub struct AppState {
    pub ingestor: Arc<ChunkIngestor>,
    pub router: UploadRouter,
}

#[derive(Serialize)]
struct ChunkAccepted {
    message: &'static str,
    #[serde(flatten)]
    receipt: ChunkReceipt,
}

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorKind,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    expected: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    received: Option<u64>,
}

impl From<&UploadError> for ErrorBody {
    fn from(err: &UploadError) -> Self {
        let (expected, received) = match err {
            UploadError::OutOfOrderChunk {
                expected, received, ..
            } => (Some(*expected), Some(*received)),
            _ => (None, None),
        };
        Self {
            error: err.kind(),
            message: err.to_string(),
            expected,
            received,
        }
    }
}

/// HTTP status for an upload error kind
pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::MalformedRequest | ErrorKind::OutOfOrderChunk => StatusCode::BAD_REQUEST,
        ErrorKind::SessionNotFound => StatusCode::NOT_FOUND,
        ErrorKind::StorageUnavailable | ErrorKind::WriteFailure | ErrorKind::FinalizeFailure => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

/// Handle one HTTP request
pub async fn handle_request(
    req: Request<Incoming>,
    state: Arc<AppState>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let request_id = uuid::Uuid::new_v4();
    let span = tracing::info_span!(
        "http.request",
        request_id = %request_id,
        http.method = %req.method(),
        http.path = %req.uri().path()
    );

    Ok(dispatch(req, state).instrument(span).await)
}

async fn dispatch(req: Request<Incoming>, state: Arc<AppState>) -> Response<Full<Bytes>> {
    match state.router.route(req.method(), req.uri().path()) {
        UploadOperation::Health => {
            build_response(StatusCode::OK, "text/plain", Bytes::from_static(b"ok"))
        }
        UploadOperation::UploadChunk => upload_chunk(req, &state.ingestor).await,
        UploadOperation::SessionStatus { identifier } => {
            match state.ingestor.registry().snapshot(&identifier).await {
                Some(snapshot) => json_response(StatusCode::OK, &snapshot),
                None => error_response(&UploadError::SessionNotFound(identifier)),
            }
        }
        UploadOperation::AbortUpload { identifier } => {
            match state.ingestor.abort(&identifier).await {
                Ok(snapshot) => json_response(StatusCode::OK, &snapshot),
                Err(e) => error_response(&e),
            }
        }
        UploadOperation::NotFound => build_response(
            StatusCode::NOT_FOUND,
            "text/plain",
            Bytes::from_static(b"Not Found"),
        ),
    }
}

async fn upload_chunk(req: Request<Incoming>, ingestor: &ChunkIngestor) -> Response<Full<Bytes>> {
    let request = match parse_chunk_headers(req.headers()) {
        Ok(request) => request,
        Err(e) => {
            warn!(error = %e, "Rejected chunk request");
            crate::metrics::record_chunk_rejected(e.kind().as_str(), 0.0);
            return error_response(&e);
        }
    };

    let payload = req.into_body().into_data_stream();
    match ingestor.ingest(&request, payload).await {
        Ok(receipt) => {
            if receipt.complete {
                info!(identifier = %receipt.identifier, "Upload assembled");
            }
            json_response(
                StatusCode::OK,
                &ChunkAccepted {
                    message: "chunk uploaded successfully",
                    receipt,
                },
            )
        }
        Err(e) => error_response(&e),
    }
}

fn error_response(err: &UploadError) -> Response<Full<Bytes>> {
    json_response(status_for(err.kind()), &ErrorBody::from(err))
}

fn json_response<T: Serialize>(status: StatusCode, body: &T) -> Response<Full<Bytes>> {
    match serde_json::to_vec(body) {
        Ok(json) => build_response(status, "application/json", Bytes::from(json)),
        Err(e) => build_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "text/plain",
            Bytes::from(format!("Failed to encode response: {}", e)),
        ),
    }
}

fn build_response(
    status: StatusCode,
    content_type: &'static str,
    body: Bytes,
) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}
