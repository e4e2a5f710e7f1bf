#[cfg(target_os = "linux")]
pub mod procfs_resolver;
pub mod resolver;
pub mod supervisor;

pub use resolver::{ProcessResolver, TargetProcess, TargetSelector};
pub use supervisor::{Supervisor, SupervisorReport, SupervisorState};
