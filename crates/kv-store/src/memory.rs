use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use scan_core::CoreResult;
use tokio::sync::RwLock;

use crate::KeyValueStore;

struct Entry {
    value: Vec<u8>,
    expires_at: Option<Instant>,
}

/// In-process [`KeyValueStore`] used by tests and local dry-runs. Mirrors the
/// `Arc<RwLock<HashMap>>` structure the controller crate's rate limiter uses.
#[derive(Default)]
pub struct InMemoryStore {
    scalars: Arc<RwLock<HashMap<String, Entry>>>,
    lists: Arc<RwLock<HashMap<String, Vec<Vec<u8>>>>>,
    sets: Arc<RwLock<HashMap<String, HashSet<String>>>>,
}

impl InMemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn is_live(entry: &Entry) -> bool {
        entry.expires_at.is_none_or(|at| at > Instant::now())
    }

    /// Resolve a Redis-style `[start, stop]` range (negative indices count
    /// from the end, both bounds inclusive) against a slice length.
    fn resolve_range(len: usize, start: isize, stop: isize) -> (usize, usize) {
        let len = len as isize;
        let norm = |i: isize| -> isize {
            if i < 0 {
                (len + i).max(0)
            } else {
                i.min(len)
            }
        };
        let start = norm(start);
        let stop = norm(stop).min(len - 1);
        if start > stop || len == 0 {
            (0, 0)
        } else {
            (start as usize, stop as usize + 1)
        }
    }
}

#[async_trait]
impl KeyValueStore for InMemoryStore {
    async fn get(&self, key: &str) -> CoreResult<Option<Vec<u8>>> {
        let map = self.scalars.read().await;
        Ok(map.get(key).filter(|e| Self::is_live(e)).map(|e| e.value.clone()))
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> CoreResult<()> {
        self.scalars.write().await.insert(
            key.to_string(),
            Entry { value, expires_at: None },
        );
        Ok(())
    }

    async fn set_with_ttl(&self, key: &str, value: Vec<u8>, ttl: Duration) -> CoreResult<()> {
        self.scalars.write().await.insert(
            key.to_string(),
            Entry { value, expires_at: Some(Instant::now() + ttl) },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> CoreResult<()> {
        self.scalars.write().await.remove(key);
        self.lists.write().await.remove(key);
        self.sets.write().await.remove(key);
        Ok(())
    }

    async fn exists(&self, key: &str) -> CoreResult<bool> {
        let map = self.scalars.read().await;
        Ok(map.get(key).is_some_and(Self::is_live)
            || self.lists.read().await.contains_key(key)
            || self.sets.read().await.contains_key(key))
    }

    async fn list_append(&self, key: &str, value: Vec<u8>) -> CoreResult<()> {
        self.lists.write().await.entry(key.to_string()).or_default().push(value);
        Ok(())
    }

    async fn list_range(&self, key: &str, start: isize, stop: isize) -> CoreResult<Vec<Vec<u8>>> {
        let lists = self.lists.read().await;
        let Some(values) = lists.get(key) else {
            return Ok(vec![]);
        };
        let (lo, hi) = Self::resolve_range(values.len(), start, stop);
        Ok(values[lo..hi].to_vec())
    }

    async fn list_trim(&self, key: &str, start: isize, stop: isize) -> CoreResult<()> {
        let mut lists = self.lists.write().await;
        if let Some(values) = lists.get_mut(key) {
            let (lo, hi) = Self::resolve_range(values.len(), start, stop);
            *values = values[lo..hi].to_vec();
        }
        Ok(())
    }

    async fn list_len(&self, key: &str) -> CoreResult<usize> {
        Ok(self.lists.read().await.get(key).map_or(0, Vec::len))
    }

    async fn set_add(&self, key: &str, member: &str) -> CoreResult<()> {
        self.sets
            .write()
            .await
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string());
        Ok(())
    }

    async fn set_members(&self, key: &str) -> CoreResult<Vec<String>> {
        Ok(self.sets.read().await.get(key).cloned().unwrap_or_default().into_iter().collect())
    }

    async fn scan_keys(&self, pattern: &str) -> CoreResult<Vec<String>> {
        let prefix = pattern.trim_end_matches('*');
        let scalars = self.scalars.read().await;
        let lists = self.lists.read().await;
        let sets = self.sets.read().await;

        let mut keys: Vec<String> = scalars
            .iter()
            .filter(|(_, e)| Self::is_live(e))
            .map(|(k, _)| k.clone())
            .chain(lists.keys().cloned())
            .chain(sets.keys().cloned())
            .filter(|k| k.starts_with(prefix))
            .collect();
        keys.sort();
        keys.dedup();
        Ok(keys)
    }
}
