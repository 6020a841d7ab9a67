//! Background reaper: guarantees abandoned containers are destroyed even if
//! their owning Job never reaches a terminal state cleanly (spec.md §4.1 key
//! policy, §8 invariant 5).

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::runtime::{ContainerHandle, ContainerRuntime};

pub struct Reaper {
    runtime: Arc<dyn ContainerRuntime>,
    tracked: Mutex<HashMap<String, ContainerHandle>>,
}

impl Reaper {
    #[must_use]
    pub fn new(runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self { runtime, tracked: Mutex::new(HashMap::new()) }
    }

    /// Register a handle as live. Call immediately after a successful
    /// `launch`.
    pub async fn track(&self, handle: ContainerHandle) {
        self.tracked.lock().await.insert(handle.container_name.clone(), handle);
    }

    /// Deregister a handle once its job has reached a terminal state and its
    /// log stream has drained, or its `destroy` has already run.
    pub async fn untrack(&self, container_name: &str) {
        self.tracked.lock().await.remove(container_name);
    }

    /// Destroy every still-tracked container. Intended to run on process
    /// shutdown so no container outlives the process that launched it.
    pub async fn reap_all(&self) {
        let handles: Vec<ContainerHandle> = self.tracked.lock().await.drain().map(|(_, h)| h).collect();
        for handle in handles {
            match self.runtime.destroy(&handle).await {
                Ok(()) => info!(container_name = %handle.container_name, "reaped abandoned container"),
                Err(e) => warn!(container_name = %handle.container_name, error = %e, "failed to reap container"),
            }
        }
    }

    pub async fn tracked_count(&self) -> usize {
        self.tracked.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::Utc;
    use scan_core::CoreResult;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::runtime::{LaunchSpec, LogChunk};

    struct CountingRuntime {
        destroyed: AtomicUsize,
    }

    #[async_trait]
    impl ContainerRuntime for CountingRuntime {
        async fn launch(&self, _spec: LaunchSpec) -> CoreResult<ContainerHandle> {
            unreachable!("not exercised in this test")
        }

        async fn stream_logs(
            &self,
            _handle: &ContainerHandle,
            _since_offset: u64,
        ) -> CoreResult<(mpsc::Receiver<LogChunk>, CancellationToken)> {
            unreachable!("not exercised in this test")
        }

        async fn wait(&self, _handle: &ContainerHandle, _deadline: Duration) -> CoreResult<i64> {
            unreachable!("not exercised in this test")
        }

        async fn destroy(&self, _handle: &ContainerHandle) -> CoreResult<()> {
            self.destroyed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn handle(name: &str) -> ContainerHandle {
        ContainerHandle {
            container_name: name.to_string(),
            runtime_id: format!("rt-{name}"),
            target: "https://example.com".to_string(),
            start_time: Utc::now(),
        }
    }

    #[tokio::test]
    async fn reap_all_destroys_every_tracked_handle() {
        let runtime = Arc::new(CountingRuntime { destroyed: AtomicUsize::new(0) });
        let reaper = Reaper::new(runtime.clone());
        reaper.track(handle("a")).await;
        reaper.track(handle("b")).await;

        reaper.reap_all().await;

        assert_eq!(runtime.destroyed.load(Ordering::SeqCst), 2);
        assert_eq!(reaper.tracked_count().await, 0);
    }

    #[tokio::test]
    async fn untracked_handles_are_not_reaped() {
        let runtime = Arc::new(CountingRuntime { destroyed: AtomicUsize::new(0) });
        let reaper = Reaper::new(runtime.clone());
        reaper.track(handle("a")).await;
        reaper.untrack("a").await;

        reaper.reap_all().await;

        assert_eq!(runtime.destroyed.load(Ordering::SeqCst), 0);
    }
}
