//! Shared trace clock
//!
//! Kernel events are stamped with `bpf_ktime_get_ns`, i.e. CLOCK_MONOTONIC.
//! Userspace samples must land in the same domain so sinks can be compared.
//! The clock records the monotonic and wall time once per process run and
//! derives every later timestamp as `monotonic_base + (wall_now - wall_base)`.

use std::sync::OnceLock;
use std::time::{SystemTime, UNIX_EPOCH};

static SHARED: OnceLock<TraceClock> = OnceLock::new();

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TraceClock {
    monotonic_base: u64,
    wall_base: u64,
}

impl TraceClock {
    /// The process-wide clock. The epoch is captured on first use.
    pub fn shared() -> Self {
        *SHARED.get_or_init(Self::capture)
    }

    /// Capture a new epoch from the current monotonic and wall clocks.
    pub fn capture() -> Self {
        Self {
            monotonic_base: monotonic_ns(),
            wall_base: wall_ns(),
        }
    }

    pub fn from_bases(monotonic_base: u64, wall_base: u64) -> Self {
        Self {
            monotonic_base,
            wall_base,
        }
    }

    pub fn now_ns(&self) -> u64 {
        self.at(wall_ns())
    }

    /// Convert a wall-clock reading (ns since the Unix epoch) into the
    /// monotonic domain. Readings before the epoch map to the base.
    pub fn at(&self, wall_ns: u64) -> u64 {
        self.monotonic_base
            .saturating_add(wall_ns.saturating_sub(self.wall_base))
    }
}

fn wall_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

fn monotonic_ns() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: ts is a valid, writable timespec
    let ret = unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
    if ret != 0 {
        return 0;
    }
    (ts.tv_sec as u64) * 1_000_000_000 + ts.tv_nsec as u64
}
