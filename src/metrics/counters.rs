//! Counter sources
//!
//! [`ProcessCounters`] is the raw-counter collaborator for one target (or the
//! host). [`MetricKind`] picks a single field out of it, and [`MetricSource`]
//! binds the two into something a [`Sampler`](super::Sampler) can poll.

use crate::{Result, TracerError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IoCounters {
    pub read_bytes: u64,
    pub write_bytes: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryStats {
    pub virtual_bytes: u64,
    pub resident_bytes: u64,
    pub data_bytes: u64,
}

/// CPU time in clock ticks, as accounted by the kernel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CpuTimes {
    pub user: u64,
    pub system: u64,
    pub children_user: u64,
    pub children_system: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HostMemory {
    pub available_bytes: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpFamily {
    V4,
    V6,
}

/// Queue totals across every TCP socket of one address family.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TcpQueueSummary {
    pub tx_queue: u64,
    pub rx_queue: u64,
}

/// Raw counters for a resolved process and its host.
pub trait ProcessCounters: Send + Sync {
    fn read_io_counters(&self) -> Result<IoCounters>;

    fn read_memory_stats(&self) -> Result<MemoryStats>;

    fn read_cpu_times(&self) -> Result<CpuTimes>;

    fn read_host_memory(&self) -> Result<HostMemory>;

    fn read_tcp_queue_summary(&self, family: IpFamily) -> Result<TcpQueueSummary>;
}

/// Anything a sampler can poll for one raw value.
pub trait CounterSource: Send + Sync {
    fn read(&self) -> Result<u64>;
}

/// Metrics a session can sample, each with a stable sink name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MetricKind {
    #[serde(rename = "disk_read")]
    DiskRead,
    #[serde(rename = "disk_write")]
    DiskWrite,
    #[serde(rename = "memory")]
    VirtualMemory,
    #[serde(rename = "rss_memory")]
    ResidentMemory,
    #[serde(rename = "data_memory")]
    DataMemory,
    #[serde(rename = "u_time")]
    UserTime,
    #[serde(rename = "s_time")]
    SystemTime,
    #[serde(rename = "cu_time")]
    ChildrenUserTime,
    #[serde(rename = "cs_time")]
    ChildrenSystemTime,
    #[serde(rename = "memavailable")]
    MemAvailable,
    #[serde(rename = "TXQ")]
    TxQueue,
    #[serde(rename = "TXQ6")]
    TxQueueV6,
}

impl MetricKind {
    pub const ALL: [MetricKind; 12] = [
        MetricKind::DiskRead,
        MetricKind::DiskWrite,
        MetricKind::VirtualMemory,
        MetricKind::ResidentMemory,
        MetricKind::DataMemory,
        MetricKind::UserTime,
        MetricKind::SystemTime,
        MetricKind::ChildrenUserTime,
        MetricKind::ChildrenSystemTime,
        MetricKind::MemAvailable,
        MetricKind::TxQueue,
        MetricKind::TxQueueV6,
    ];

    pub const fn sink_name(&self) -> &'static str {
        match self {
            MetricKind::DiskRead => "disk_read",
            MetricKind::DiskWrite => "disk_write",
            MetricKind::VirtualMemory => "memory",
            MetricKind::ResidentMemory => "rss_memory",
            MetricKind::DataMemory => "data_memory",
            MetricKind::UserTime => "u_time",
            MetricKind::SystemTime => "s_time",
            MetricKind::ChildrenUserTime => "cu_time",
            MetricKind::ChildrenSystemTime => "cs_time",
            MetricKind::MemAvailable => "memavailable",
            MetricKind::TxQueue => "TXQ",
            MetricKind::TxQueueV6 => "TXQ6",
        }
    }

    /// Extract this metric's value from the counters.
    pub fn read(&self, counters: &dyn ProcessCounters) -> Result<u64> {
        let value = match self {
            MetricKind::DiskRead => counters.read_io_counters()?.read_bytes,
            MetricKind::DiskWrite => counters.read_io_counters()?.write_bytes,
            MetricKind::VirtualMemory => counters.read_memory_stats()?.virtual_bytes,
            MetricKind::ResidentMemory => counters.read_memory_stats()?.resident_bytes,
            MetricKind::DataMemory => counters.read_memory_stats()?.data_bytes,
            MetricKind::UserTime => counters.read_cpu_times()?.user,
            MetricKind::SystemTime => counters.read_cpu_times()?.system,
            MetricKind::ChildrenUserTime => counters.read_cpu_times()?.children_user,
            MetricKind::ChildrenSystemTime => counters.read_cpu_times()?.children_system,
            MetricKind::MemAvailable => counters.read_host_memory()?.available_bytes,
            MetricKind::TxQueue => counters.read_tcp_queue_summary(IpFamily::V4)?.tx_queue,
            MetricKind::TxQueueV6 => counters.read_tcp_queue_summary(IpFamily::V6)?.tx_queue,
        };
        Ok(value)
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.sink_name())
    }
}

impl FromStr for MetricKind {
    type Err = TracerError;

    fn from_str(s: &str) -> Result<Self> {
        MetricKind::ALL
            .iter()
            .find(|kind| kind.sink_name() == s)
            .copied()
            .ok_or_else(|| TracerError::ConfigError(format!("unknown metric: {}", s)))
    }
}

/// A metric bound to the counters of one session's target.
pub struct MetricSource {
    kind: MetricKind,
    counters: Arc<dyn ProcessCounters>,
}

impl MetricSource {
    pub fn new(kind: MetricKind, counters: Arc<dyn ProcessCounters>) -> Self {
        Self { kind, counters }
    }
}

impl CounterSource for MetricSource {
    fn read(&self) -> Result<u64> {
        self.kind.read(self.counters.as_ref())
    }
}
