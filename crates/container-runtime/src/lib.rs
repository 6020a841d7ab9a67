//! Container Runner (C1): launch, observe, log-stream, and tear down
//! isolated scanner invocations.

mod reaper;
mod runtime;
mod target;

pub use reaper::Reaper;
pub use runtime::{
    BollardRuntime, ContainerHandle, ContainerRuntime, LaunchSpec, LogChunk, LogSource,
    NetworkMode, ResourceLimits,
};
pub use target::validate_target;
