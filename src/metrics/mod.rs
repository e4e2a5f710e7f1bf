pub mod counters;
#[cfg(target_os = "linux")]
pub mod procfs_source;
pub mod sampler;

pub use counters::{CounterSource, MetricKind, MetricSource, ProcessCounters};
pub use sampler::{Sampler, SamplerHandle, SamplerState};
