//! HTTP API Integration Tests
//!
//! Runs a real server on an ephemeral port and talks to it with reqwest.
//!
//! ## Test Coverage
//!
//! - Chunk upload through `POST /upload`
//! - Error kinds and status codes
//! - Session status and abort endpoints
//! - Health and unknown routes

use chunk_uploadr::config::{Config, MetricsConfig, ServerConfig, StorageConfig, UploadConfig};
use chunk_uploadr::server::Server;
use serde_json::Value;
use std::net::SocketAddr;
use tempfile::TempDir;
use tokio::sync::oneshot;

/// Running server plus the directory it writes into
struct TestEnv {
    addr: SocketAddr,
    client: reqwest::Client,
    upload_dir: TempDir,
    shutdown_tx: Option<oneshot::Sender<()>>,
    server_handle: Option<tokio::task::JoinHandle<()>>,
}

impl TestEnv {
    async fn start() -> Self {
        let upload_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let config = Config {
            server: ServerConfig {
                address: "127.0.0.1:0".into(),
                upload_path: "/upload".into(),
            },
            storage: StorageConfig {
                upload_dir: upload_dir.path().display().to_string(),
                sync_on_finalize: false,
            },
            upload: UploadConfig::default(),
            metrics: MetricsConfig {
                enabled: false,
                port: 0,
            },
        };

        let server = Server::new(config).await.expect("Server should start");
        let addr = server.local_addr();
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let server_handle = tokio::spawn(async move {
            let _ = server
                .run_until(async {
                    let _ = shutdown_rx.await;
                })
                .await;
        });

        Self {
            addr,
            client: reqwest::Client::new(),
            upload_dir,
            shutdown_tx: Some(shutdown_tx),
            server_handle: Some(server_handle),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    async fn send_chunk(
        &self,
        name: &str,
        total: u64,
        current: u64,
        data: &'static [u8],
    ) -> reqwest::Response {
        self.client
            .post(self.url("/upload"))
            .header("X-File-Name", name)
            .header("X-Total-Chunks", total.to_string())
            .header("X-Current-Chunk", current.to_string())
            .body(data)
            .send()
            .await
            .expect("Request should complete")
    }

    fn artifact(&self, name: &str) -> Vec<u8> {
        std::fs::read(self.upload_dir.path().join(name)).expect("Artifact should exist")
    }

    async fn stop(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.server_handle.take() {
            let _ = handle.await;
        }
    }
}

// ============================================================================
// TEST: Chunk upload
// ============================================================================

#[tokio::test]
async fn test_upload_three_chunks() {
    let env = TestEnv::start().await;

    for (index, data) in [&b"AAA"[..], b"BBB", b"CC"].into_iter().enumerate() {
        let response = env.send_chunk("a.bin", 3, index as u64, data).await;
        assert_eq!(response.status(), 200);

        let json: Value = response.json().await.unwrap();
        assert_eq!(json["message"], "chunk uploaded successfully");
        assert_eq!(json["chunk"], index as u64);
        assert_eq!(json["complete"], index == 2);
    }

    assert_eq!(env.artifact("a.bin"), b"AAABBBCC");
    env.stop().await;
}

#[tokio::test]
async fn test_put_is_accepted() {
    let env = TestEnv::start().await;

    let response = env
        .client
        .put(env.url("/upload"))
        .header("X-File-Name", "put.bin")
        .header("X-Total-Chunks", "1")
        .header("X-Current-Chunk", "0")
        .body("via put")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    assert_eq!(env.artifact("put.bin"), b"via put");
    env.stop().await;
}

#[tokio::test]
async fn test_out_of_order_returns_400_with_indices() {
    let env = TestEnv::start().await;

    let response = env.send_chunk("b.bin", 2, 1, b"late").await;
    assert_eq!(response.status(), 400);

    let json: Value = response.json().await.unwrap();
    assert_eq!(json["error"], "OUT_OF_ORDER_CHUNK");
    assert_eq!(json["expected"], 0);
    assert_eq!(json["received"], 1);

    assert_eq!(env.send_chunk("b.bin", 2, 0, b"early-").await.status(), 200);
    assert_eq!(env.send_chunk("b.bin", 2, 1, b"late").await.status(), 200);
    assert_eq!(env.artifact("b.bin"), b"early-late");
    env.stop().await;
}

#[tokio::test]
async fn test_missing_headers_returns_400() {
    let env = TestEnv::start().await;

    let response = env
        .client
        .post(env.url("/upload"))
        .header("X-File-Name", "nohdr.bin")
        .body("data")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 400);
    let json: Value = response.json().await.unwrap();
    assert_eq!(json["error"], "MALFORMED_REQUEST");
    env.stop().await;
}

#[tokio::test]
async fn test_non_numeric_chunk_returns_400() {
    let env = TestEnv::start().await;

    let response = env
        .client
        .post(env.url("/upload"))
        .header("X-File-Name", "bad.bin")
        .header("X-Total-Chunks", "two")
        .header("X-Current-Chunk", "0")
        .body("data")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 400);
    env.stop().await;
}

// ============================================================================
// TEST: Session endpoints
// ============================================================================

#[tokio::test]
async fn test_session_status_and_abort() {
    let env = TestEnv::start().await;

    assert_eq!(env.send_chunk("s.bin", 3, 0, b"head").await.status(), 200);

    let status: Value = env
        .client
        .get(env.url("/uploads/s.bin"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(status["identifier"], "s.bin");
    assert_eq!(status["state"], "active");
    assert_eq!(status["expected_chunk"], 1);
    assert_eq!(status["committed_bytes"], 4);

    let response = env
        .client
        .delete(env.url("/uploads/s.bin"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert!(!env.upload_dir.path().join("s.bin").exists());

    let response = env
        .client
        .get(env.url("/uploads/s.bin"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);
    let json: Value = response.json().await.unwrap();
    assert_eq!(json["error"], "SESSION_NOT_FOUND");
    env.stop().await;
}

#[tokio::test]
async fn test_abort_unknown_session_returns_404() {
    let env = TestEnv::start().await;

    let response = env
        .client
        .delete(env.url("/uploads/ghost.bin"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);
    env.stop().await;
}

// ============================================================================
// TEST: Misc routes
// ============================================================================

#[tokio::test]
async fn test_health() {
    let env = TestEnv::start().await;

    let response = env.client.get(env.url("/health")).send().await.unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.unwrap(), "ok");
    env.stop().await;
}

#[tokio::test]
async fn test_unknown_route_returns_404() {
    let env = TestEnv::start().await;

    let response = env.client.get(env.url("/nowhere")).send().await.unwrap();
    assert_eq!(response.status(), 404);
    env.stop().await;
}
