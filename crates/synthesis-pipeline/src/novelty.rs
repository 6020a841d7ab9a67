//! Stage 1, second half: `partition_by_novelty` (spec.md §4.5 stage 1).
//!
//! Dedup against the CVE cache in KV so a CVE already seen by a prior run
//! doesn't re-enter `generate_template`.

use std::sync::Arc;

use kv_store::KeyValueStore;
use scan_core::{CoreResult, CveRecord};
use tracing::debug;

/// Filter `records` down to ones not already recorded in the CVE cache,
/// marking each survivor as seen so a concurrent or later run won't
/// re-admit it.
pub async fn partition_by_novelty(store: &dyn KeyValueStore, records: Vec<CveRecord>) -> CoreResult<Vec<CveRecord>> {
    let mut novel = Vec::with_capacity(records.len());
    for record in records {
        if store.exists(&record.kv_key()).await? {
            debug!(cve_id = %record.cve_id, "skipping already-seen CVE");
            continue;
        }
        store.set(&record.kv_key(), serde_json::to_vec(&record).unwrap_or_default()).await?;
        novel.push(record);
    }
    Ok(novel)
}
