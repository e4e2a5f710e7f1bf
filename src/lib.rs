pub mod cli;
pub mod config;
pub mod ebpf;
pub mod error;
pub mod metrics;
pub mod process;
pub mod session;
pub mod trace;

pub use error::{Result, TracerError};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
