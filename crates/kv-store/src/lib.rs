//! Key-value store abstraction backing the job registry, template cache, and
//! pipeline metrics (spec.md §3 "shared key-value store").
//!
//! [`KeyValueStore`] is the seam between the rest of the core and whatever
//! actually holds state: [`RedisStore`] talks to a real Redis deployment,
//! [`InMemoryStore`] is a test double with identical semantics, modeled after
//! the `Arc<RwLock<HashMap>>` pattern the controller crate uses for its rate
//! limiter.

mod memory;
mod redis_store;

pub use memory::InMemoryStore;
pub use redis_store::RedisStore;

use std::time::Duration;

use async_trait::async_trait;
use scan_core::CoreResult;

/// A generic key-value/list/set store. All operations are namespaced by
/// whatever key prefix the caller chooses; this trait does not impose one.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> CoreResult<Option<Vec<u8>>>;

    async fn set(&self, key: &str, value: Vec<u8>) -> CoreResult<()>;

    async fn set_with_ttl(&self, key: &str, value: Vec<u8>, ttl: Duration) -> CoreResult<()>;

    async fn delete(&self, key: &str) -> CoreResult<()>;

    async fn exists(&self, key: &str) -> CoreResult<bool>;

    /// Append a value to the end of a list (RPUSH semantics).
    async fn list_append(&self, key: &str, value: Vec<u8>) -> CoreResult<()>;

    /// Inclusive `[start, stop]` range over a list, Redis `LRANGE` semantics
    /// (negative indices count from the end).
    async fn list_range(&self, key: &str, start: isize, stop: isize) -> CoreResult<Vec<Vec<u8>>>;

    /// Trim a list to the inclusive `[start, stop]` range, discarding
    /// everything outside it (used to cap ring-buffered scan logs).
    async fn list_trim(&self, key: &str, start: isize, stop: isize) -> CoreResult<()>;

    async fn list_len(&self, key: &str) -> CoreResult<usize>;

    async fn set_add(&self, key: &str, member: &str) -> CoreResult<()>;

    async fn set_members(&self, key: &str) -> CoreResult<Vec<String>>;

    /// List all keys matching a glob-style pattern. Used sparingly (startup
    /// recovery scans only) since it is O(n) on most backends.
    async fn scan_keys(&self, pattern: &str) -> CoreResult<Vec<String>>;
}

#[cfg(test)]
mod contract_tests {
    //! Tests run against [`InMemoryStore`] that any real implementation
    //! (including [`RedisStore`]) must also satisfy.
    use std::time::Duration;

    use super::*;

    async fn exercise(store: &dyn KeyValueStore) {
        assert_eq!(store.get("missing").await.unwrap(), None);

        store.set("k", b"v1".to_vec()).await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some(b"v1".to_vec()));
        assert!(store.exists("k").await.unwrap());

        store.delete("k").await.unwrap();
        assert!(!store.exists("k").await.unwrap());

        for i in 0..5 {
            store.list_append("log", vec![i]).await.unwrap();
        }
        assert_eq!(store.list_len("log").await.unwrap(), 5);
        let all = store.list_range("log", 0, -1).await.unwrap();
        assert_eq!(all, vec![vec![0], vec![1], vec![2], vec![3], vec![4]]);

        store.list_trim("log", 2, -1).await.unwrap();
        assert_eq!(store.list_range("log", 0, -1).await.unwrap(), vec![vec![2], vec![3], vec![4]]);

        store.set_add("children", "a").await.unwrap();
        store.set_add("children", "b").await.unwrap();
        store.set_add("children", "a").await.unwrap();
        let mut members = store.set_members("children").await.unwrap();
        members.sort();
        assert_eq!(members, vec!["a".to_string(), "b".to_string()]);

        let keys = store.scan_keys("log*").await.unwrap();
        assert_eq!(keys, vec!["log".to_string()]);
    }

    #[tokio::test]
    async fn in_memory_store_satisfies_contract() {
        let store = InMemoryStore::new();
        exercise(&store).await;
    }

    #[tokio::test]
    async fn ttl_entries_are_stored_alongside_value() {
        let store = InMemoryStore::new();
        store
            .set_with_ttl("temp", b"v".to_vec(), Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(store.get("temp").await.unwrap(), Some(b"v".to_vec()));
    }
}
