use thiserror::Error;

#[derive(Error, Debug)]
pub enum TracerError {
    #[error("eBPF error: {0}")]
    EbpfError(String),

    #[error("Failed to load eBPF program: {0}")]
    ProgramLoadFailed(String),

    #[error("Failed to create clsact qdisc on {interface}: {source}")]
    QdiscFailed {
        interface: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to attach {filter} on {interface}: {reason}")]
    AttachFailed {
        interface: String,
        filter: String,
        reason: String,
    },

    #[error("Batch drain failed: {0}")]
    DrainFailed(#[source] std::io::Error),

    #[error("Counter read failed: {0}")]
    CounterReadFailed(String),

    #[error("Process not found: {0}")]
    ProcessNotFound(String),

    #[error("Target {selector} not found after {attempts} attempts")]
    DiscoveryExhausted { selector: String, attempts: u32 },

    #[error("Failed to spawn helper {name}: {source}")]
    HelperSpawnFailed {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Kernel version {version} is too old. Minimum required: {min_version}")]
    KernelVersionTooOld {
        version: String,
        min_version: String,
    },

    #[error("Unsupported feature on this system: {0}")]
    UnsupportedFeature(String),
}

pub type Result<T> = std::result::Result<T, TracerError>;
