//! Ambient observability gauges (spec.md §9 Non-goals: Prometheus scraping
//! itself belongs to the HTTP layer; this module only computes the numbers
//! such a layer would export).

use std::collections::HashMap;

use scheduler::Scheduler;

const QUEUE_NAMES: [&str; 5] = ["scans", "pipeline", "generate", "validate", "refine"];

/// Pending-item count per named queue (spec.md §5 "Backpressure").
#[must_use]
pub fn queue_depths(scheduler: &Scheduler) -> HashMap<&'static str, usize> {
    QUEUE_NAMES.iter().filter_map(|name| scheduler.queue(name).ok().map(|q| (*name, q.pending()))).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use config::QueueConcurrency;

    #[test]
    fn reports_all_five_named_queues() {
        let scheduler = Scheduler::new(&QueueConcurrency::default());
        let depths = queue_depths(&scheduler);
        assert_eq!(depths.len(), 5);
        assert_eq!(depths["scans"], 0);
    }
}
