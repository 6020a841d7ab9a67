//! Task Scheduler (C4): named concurrency-bounded queues, retry/backoff,
//! worker heartbeats, composition primitives, and the `run_scan` task
//! contract (spec.md §4, §5), grounded on the CLI adapter factory's
//! registry/health-monitor shape and the DAG executor's semaphore-bounded
//! wave execution and cancellation model.

mod backoff;
mod compose;
mod container_name;
mod heartbeat;
mod queue;
mod run_scan;
mod scheduler;

pub use backoff::BackoffPolicy;
pub use compose::run_group;
pub use heartbeat::{spawn_heartbeat, HEARTBEAT_INTERVAL};
pub use queue::{NamedQueue, QueueTicket, DEFAULT_SOFT_CAP};
pub use run_scan::{run_scan, ScanOutcome, ScanRequest};
pub use scheduler::Scheduler;

pub use container_name::allocate as allocate_container_name;
