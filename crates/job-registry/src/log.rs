//! Ring-buffered per-job log storage (spec.md §4.3): a bounded ring buffer
//! spilling to the KV store in fixed-size pages.

use kv_store::KeyValueStore;
use scan_core::{CoreResult, JobId};
use serde::{Deserialize, Serialize};

pub const PAGE_SIZE: usize = 64 * 1024;
pub const DEFAULT_CAP_BYTES: u64 = 8 * 1024 * 1024;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct LogMeta {
    /// Total bytes ever appended (monotonic; also the next-offset watermark).
    total_bytes: u64,
    /// Index of the oldest page still retained.
    first_page: u32,
    /// Index of the page the next append writes into.
    last_page: u32,
    /// Bytes used within `last_page`.
    last_page_len: u32,
}

impl Default for LogMeta {
    fn default() -> Self {
        Self { total_bytes: 0, first_page: 0, last_page: 0, last_page_len: 0 }
    }
}

fn meta_key(id: JobId) -> String {
    format!("joblog:{id}:meta")
}

fn page_key(id: JobId, page: u32) -> String {
    format!("joblog:{id}:{page}")
}

async fn load_meta(store: &dyn KeyValueStore, id: JobId) -> CoreResult<LogMeta> {
    match store.get(&meta_key(id)).await? {
        Some(bytes) => Ok(serde_json::from_slice(&bytes).unwrap_or_default()),
        None => Ok(LogMeta::default()),
    }
}

async fn save_meta(store: &dyn KeyValueStore, id: JobId, meta: LogMeta) -> CoreResult<()> {
    let bytes = serde_json::to_vec(&meta).expect("LogMeta always serializes");
    store.set(&meta_key(id), bytes).await
}

/// Append `chunk` to `id`'s log, evicting the oldest retained page(s) once
/// the retained window exceeds `cap_bytes`.
pub async fn append(store: &dyn KeyValueStore, id: JobId, chunk: &[u8], cap_bytes: u64) -> CoreResult<()> {
    let mut meta = load_meta(store, id).await?;
    let mut remaining = chunk;

    while !remaining.is_empty() {
        let space = PAGE_SIZE - meta.last_page_len as usize;
        let take = remaining.len().min(space);
        let (head, tail) = remaining.split_at(take);

        let key = page_key(id, meta.last_page);
        let mut page = store.get(&key).await?.unwrap_or_default();
        page.extend_from_slice(head);
        store.set(&key, page).await?;

        meta.last_page_len += take as u32;
        meta.total_bytes += take as u64;
        remaining = tail;

        if meta.last_page_len as usize == PAGE_SIZE {
            meta.last_page += 1;
            meta.last_page_len = 0;
        }
    }

    while meta.total_bytes - (meta.first_page as u64 * PAGE_SIZE as u64) > cap_bytes
        && meta.first_page < meta.last_page
    {
        store.delete(&page_key(id, meta.first_page)).await?;
        meta.first_page += 1;
    }

    save_meta(store, id, meta).await
}

/// Read all retained log bytes from `from_offset` (clamped up to the oldest
/// retained byte if the window has already evicted past it).
///
/// Returns the bytes and the next offset a caller should resume from.
pub async fn read(store: &dyn KeyValueStore, id: JobId, from_offset: u64) -> CoreResult<(Vec<u8>, u64)> {
    let meta = load_meta(store, id).await?;
    let retained_start = meta.first_page as u64 * PAGE_SIZE as u64;
    let start = from_offset.max(retained_start);

    let mut out = Vec::new();
    let mut page = (start / PAGE_SIZE as u64) as u32;
    let mut within = (start % PAGE_SIZE as u64) as usize;

    while page <= meta.last_page {
        let Some(bytes) = store.get(&page_key(id, page)).await? else {
            break;
        };
        if within < bytes.len() {
            out.extend_from_slice(&bytes[within..]);
        }
        within = 0;
        page += 1;
    }

    Ok((out, meta.total_bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use kv_store::InMemoryStore;

    #[tokio::test]
    async fn append_then_read_roundtrips() {
        let store = InMemoryStore::new();
        let id = JobId::new();
        append(&store, id, b"hello ", DEFAULT_CAP_BYTES).await.unwrap();
        append(&store, id, b"world", DEFAULT_CAP_BYTES).await.unwrap();

        let (bytes, next) = read(&store, id, 0).await.unwrap();
        assert_eq!(bytes, b"hello world");
        assert_eq!(next, 11);
    }

    #[tokio::test]
    async fn read_resumes_from_a_mid_stream_offset() {
        let store = InMemoryStore::new();
        let id = JobId::new();
        append(&store, id, b"0123456789", DEFAULT_CAP_BYTES).await.unwrap();

        let (bytes, next) = read(&store, id, 5).await.unwrap();
        assert_eq!(bytes, b"56789");
        assert_eq!(next, 10);
    }

    #[tokio::test]
    async fn log_spills_across_page_boundaries() {
        let store = InMemoryStore::new();
        let id = JobId::new();
        let chunk = vec![b'x'; PAGE_SIZE + 100];
        append(&store, id, &chunk, DEFAULT_CAP_BYTES).await.unwrap();

        let (bytes, next) = read(&store, id, 0).await.unwrap();
        assert_eq!(bytes.len(), PAGE_SIZE + 100);
        assert_eq!(next, (PAGE_SIZE + 100) as u64);
    }

    #[tokio::test]
    async fn ring_buffer_evicts_oldest_pages_past_cap() {
        let store = InMemoryStore::new();
        let id = JobId::new();
        let cap = (PAGE_SIZE * 2) as u64;

        for _ in 0..5 {
            append(&store, id, &vec![b'a'; PAGE_SIZE], cap).await.unwrap();
        }

        let (bytes, next) = read(&store, id, 0).await.unwrap();
        assert!(bytes.len() <= PAGE_SIZE * 2);
        assert_eq!(next, (PAGE_SIZE * 5) as u64);
    }
}
