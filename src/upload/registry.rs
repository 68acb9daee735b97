//! Session registry
//!
//! Concurrency-safe map from upload identifier to its [`UploadSession`].
//!
//! Uses a `DashMap` so uploads with different identifiers never contend on a
//! global lock. Each session sits behind its own `tokio::sync::Mutex`, which
//! is held across the payload copy; shard guards of the map are never held
//! across an `.await`.

use super::session::{SessionSnapshot, UploadSession};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// A session shared between the registry and in-flight chunk requests
pub type SharedSession = Arc<Mutex<UploadSession>>;

/// Registry of in-flight uploads
#[derive(Default)]
pub struct SessionRegistry {
    sessions: DashMap<String, SharedSession>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the session for `identifier`, creating it if absent.
    ///
    /// A new session starts with `total_chunks` and `expected_chunk =
    /// seed_chunk`. An existing session is returned unchanged. The boolean is
    /// `true` when the session already existed. Check and insert happen under
    /// one shard lock, so concurrent callers for the same unseen identifier
    /// all end up with the same session.
    pub fn get_or_create(
        &self,
        identifier: &str,
        total_chunks: u64,
        seed_chunk: u64,
    ) -> (SharedSession, bool) {
        match self.sessions.entry(identifier.to_string()) {
            Entry::Occupied(occupied) => (Arc::clone(occupied.get()), true),
            Entry::Vacant(vacant) => {
                let session = Arc::new(Mutex::new(UploadSession::new(
                    identifier,
                    total_chunks,
                    seed_chunk,
                )));
                vacant.insert(Arc::clone(&session));

                tracing::debug!(
                    identifier = identifier,
                    total_chunks = total_chunks,
                    "Created upload session"
                );

                (session, false)
            }
        }
    }

    pub fn get(&self, identifier: &str) -> Option<SharedSession> {
        self.sessions
            .get(identifier)
            .map(|entry| Arc::clone(entry.value()))
    }

    /// Remove the session for `identifier`; removing an unknown key is a no-op
    pub fn delete(&self, identifier: &str) {
        self.sessions.remove(identifier);
    }

    pub fn contains(&self, identifier: &str) -> bool {
        self.sessions.contains_key(identifier)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// All registered sessions, collected so no shard lock outlives the call
    pub fn sessions(&self) -> Vec<(String, SharedSession)> {
        self.sessions
            .iter()
            .map(|entry| (entry.key().clone(), Arc::clone(entry.value())))
            .collect()
    }

    /// Snapshot of a session, taken under its lock
    pub async fn snapshot(&self, identifier: &str) -> Option<SessionSnapshot> {
        let session = self.get(identifier)?;
        let session = session.lock().await;
        if session.is_retired() {
            return None;
        }
        Some(session.snapshot())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_or_create_creates_once() {
        let registry = SessionRegistry::new();

        let (first, existed) = registry.get_or_create("a.bin", 3, 0);
        assert!(!existed);

        let (second, existed) = registry.get_or_create("a.bin", 7, 2);
        assert!(existed);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_existing_session_is_unchanged() {
        let registry = SessionRegistry::new();
        registry.get_or_create("a.bin", 3, 0);
        let (session, _) = registry.get_or_create("a.bin", 9, 5);

        let session = session.lock().await;
        assert_eq!(session.total_chunks(), 3);
        assert_eq!(session.expected_chunk(), 0);
    }

    #[test]
    fn test_seed_chunk_is_used_on_creation() {
        let registry = SessionRegistry::new();
        let (session, _) = registry.get_or_create("late.bin", 4, 2);
        assert_eq!(session.try_lock().unwrap().expected_chunk(), 2);
    }

    #[test]
    fn test_delete_is_idempotent() {
        let registry = SessionRegistry::new();
        registry.get_or_create("a.bin", 1, 0);

        registry.delete("a.bin");
        registry.delete("a.bin");
        registry.delete("never-existed");

        assert!(!registry.contains("a.bin"));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_snapshot() {
        let registry = SessionRegistry::new();
        registry.get_or_create("a.bin", 3, 0);

        let snapshot = registry.snapshot("a.bin").await.unwrap();
        assert_eq!(snapshot.identifier, "a.bin");
        assert_eq!(snapshot.total_chunks, 3);
        assert!(registry.snapshot("missing").await.is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_get_or_create_single_session() {
        let registry = Arc::new(SessionRegistry::new());

        let tasks: Vec<_> = (0..32)
            .map(|i| {
                let registry = Arc::clone(&registry);
                tokio::spawn(async move { registry.get_or_create("race.bin", 4, i % 4) })
            })
            .collect();

        let mut created = 0;
        let mut sessions = Vec::new();
        for task in tasks {
            let (session, existed) = task.await.unwrap();
            if !existed {
                created += 1;
            }
            sessions.push(session);
        }

        assert_eq!(created, 1);
        assert!(sessions.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
        assert_eq!(registry.len(), 1);
    }
}
