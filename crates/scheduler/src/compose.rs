//! Group composition primitive (spec.md §4.4, §9 "avoid inheritance
//! hierarchies" for pipeline stage composition).
//!
//! A plain async function rather than a trait-object job tree: fans tasks
//! out concurrently and reports every outcome. The synthesis pipeline's
//! generate and validate stages compose this directly instead of
//! reimplementing the fan-out.

use std::future::Future;

use scan_core::CoreResult;

/// Run tasks concurrently with no ordering guarantee between them. Every
/// task runs to completion regardless of its siblings' outcomes; each
/// result is reported individually rather than short-circuiting the group.
pub async fn run_group<F, Fut, T>(tasks: Vec<F>) -> Vec<CoreResult<T>>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = CoreResult<T>>,
{
    let futures = tasks.into_iter().map(|t| t());
    futures::future::join_all(futures).await
}
