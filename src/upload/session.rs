//! Upload session state
//!
//! One [`UploadSession`] exists per in-flight upload. It is only ever touched
//! through the mutex the registry wraps it in, so every method here assumes
//! the caller holds that lock.

use super::storage::ArtifactHandle;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Observable phase of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Registered, chunk 0 not yet accepted, no artifact open
    Pending,
    /// Chunk 0 accepted, artifact open
    Active,
    /// Left the registry (finalized, aborted or reaped)
    Retired,
}

/// Reassembly state of one upload
pub struct UploadSession {
    identifier: String,
    total_chunks: u64,
    expected_chunk: u64,
    committed_bytes: u64,
    handle: Option<Box<dyn ArtifactHandle>>,
    dirty: bool,
    retired: bool,
    created_at: DateTime<Utc>,
    last_activity: DateTime<Utc>,
}

impl UploadSession {
    pub fn new(identifier: &str, total_chunks: u64, expected_chunk: u64) -> Self {
        let now = Utc::now();
        Self {
            identifier: identifier.to_string(),
            total_chunks,
            expected_chunk,
            committed_bytes: 0,
            handle: None,
            dirty: false,
            retired: false,
            created_at: now,
            last_activity: now,
        }
    }

    pub fn total_chunks(&self) -> u64 {
        self.total_chunks
    }

    /// Index the next accepted chunk must carry
    pub fn expected_chunk(&self) -> u64 {
        self.expected_chunk
    }

    /// Artifact length after the last accepted chunk
    pub fn committed_bytes(&self) -> u64 {
        self.committed_bytes
    }

    pub fn last_activity(&self) -> DateTime<Utc> {
        self.last_activity
    }

    pub fn state(&self) -> SessionState {
        if self.retired {
            SessionState::Retired
        } else if self.handle.is_some() {
            SessionState::Active
        } else {
            SessionState::Pending
        }
    }

    pub fn is_retired(&self) -> bool {
        self.retired
    }

    /// Whether `chunk` is the last chunk of this upload
    pub fn is_final_chunk(&self, chunk: u64) -> bool {
        chunk + 1 == self.total_chunks
    }

    pub fn touch(&mut self) {
        self.last_activity = Utc::now();
    }

    /// Install a freshly created artifact, replacing any earlier one
    pub fn attach(&mut self, handle: Box<dyn ArtifactHandle>) {
        self.handle = Some(handle);
        self.committed_bytes = 0;
        self.dirty = false;
    }

    /// Drop the artifact without closing it
    pub fn detach(&mut self) -> Option<Box<dyn ArtifactHandle>> {
        self.committed_bytes = 0;
        self.dirty = false;
        self.handle.take()
    }

    /// Whether the artifact may hold bytes past `committed_bytes`, left by a
    /// failed or cancelled copy
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    pub fn mark_clean(&mut self) {
        self.dirty = false;
    }

    pub fn handle_mut(&mut self) -> Option<&mut (dyn ArtifactHandle + 'static)> {
        self.handle.as_deref_mut()
    }

    /// Record an accepted chunk of `bytes` bytes
    pub fn advance(&mut self, bytes: u64) {
        self.expected_chunk += 1;
        self.committed_bytes += bytes;
        self.dirty = false;
        self.touch();
    }

    /// Mark the session as gone from the registry and hand back its artifact
    pub fn retire(&mut self) -> Option<Box<dyn ArtifactHandle>> {
        self.retired = true;
        self.handle.take()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            identifier: self.identifier.clone(),
            state: self.state(),
            total_chunks: self.total_chunks,
            expected_chunk: self.expected_chunk,
            committed_bytes: self.committed_bytes,
            created_at: self.created_at,
            last_activity: self.last_activity,
        }
    }
}

impl std::fmt::Debug for UploadSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UploadSession")
            .field("identifier", &self.identifier)
            .field("total_chunks", &self.total_chunks)
            .field("expected_chunk", &self.expected_chunk)
            .field("committed_bytes", &self.committed_bytes)
            .field("state", &self.state())
            .finish()
    }
}

/// Point-in-time view of a session, safe to hand out of the lock
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub identifier: String,
    pub state: SessionState,
    pub total_chunks: u64,
    pub expected_chunk: u64,
    pub committed_bytes: u64,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}
