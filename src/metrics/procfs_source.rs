//! procfs-backed counters
//!
//! Every read goes back to /proc. A read racing the target's exit fails with
//! a counter error, which the sampler treats as a skipped tick.

use super::counters::{
    CpuTimes, HostMemory, IoCounters, IpFamily, MemoryStats, ProcessCounters, TcpQueueSummary,
};
use crate::{Result, TracerError};
use procfs::process::Process;
use procfs::{Current, Meminfo, WithCurrentSystemInfo};

pub struct ProcfsCounters {
    pid: i32,
}

impl ProcfsCounters {
    pub fn new(pid: u32) -> Self {
        Self { pid: pid as i32 }
    }

    fn process(&self) -> Result<Process> {
        Process::new(self.pid).map_err(counter_error)
    }
}

impl ProcessCounters for ProcfsCounters {
    fn read_io_counters(&self) -> Result<IoCounters> {
        let io = self.process()?.io().map_err(counter_error)?;
        Ok(IoCounters {
            read_bytes: io.read_bytes,
            write_bytes: io.write_bytes,
        })
    }

    fn read_memory_stats(&self) -> Result<MemoryStats> {
        let process = self.process()?;
        let stat = process.stat().map_err(counter_error)?;
        let status = process.status().map_err(counter_error)?;
        Ok(MemoryStats {
            virtual_bytes: stat.vsize,
            resident_bytes: stat.rss_bytes().get(),
            data_bytes: status.vmdata.unwrap_or(0) * 1024,
        })
    }

    fn read_cpu_times(&self) -> Result<CpuTimes> {
        let stat = self.process()?.stat().map_err(counter_error)?;
        Ok(CpuTimes {
            user: stat.utime,
            system: stat.stime,
            children_user: stat.cutime.max(0) as u64,
            children_system: stat.cstime.max(0) as u64,
        })
    }

    fn read_host_memory(&self) -> Result<HostMemory> {
        let meminfo = Meminfo::current().map_err(counter_error)?;
        Ok(HostMemory {
            available_bytes: meminfo.mem_available.unwrap_or(meminfo.mem_free),
        })
    }

    fn read_tcp_queue_summary(&self, family: IpFamily) -> Result<TcpQueueSummary> {
        let entries = match family {
            IpFamily::V4 => procfs::net::tcp(),
            IpFamily::V6 => procfs::net::tcp6(),
        }
        .map_err(counter_error)?;

        Ok(entries
            .iter()
            .fold(TcpQueueSummary::default(), |mut summary, entry| {
                summary.tx_queue += entry.tx_queue as u64;
                summary.rx_queue += entry.rx_queue as u64;
                summary
            }))
    }
}

fn counter_error(e: procfs::ProcError) -> TracerError {
    TracerError::CounterReadFailed(e.to_string())
}
