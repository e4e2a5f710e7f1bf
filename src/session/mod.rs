pub mod helper;
pub mod orchestrator;

pub use helper::{HelperProcess, HelperSpec};
#[cfg(target_os = "linux")]
pub use orchestrator::KernelCollectors;
pub use orchestrator::{Collectors, Orchestrator, SessionReport};
