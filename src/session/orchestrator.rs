//! One tracing session against one resolved process
//!
//! Everything a session runs (samplers, the packet drainer, helpers) is
//! spawned onto a single [`TaskTracker`] and observes the same cancellation
//! token. The session is over once the tracker has drained, which includes
//! helper reaping and probe teardown.

use super::helper::HelperProcess;
use crate::config::{Config, NetworkConfig};
use crate::ebpf::drain::PACKET_SINK;
use crate::ebpf::{run_drainer, Drainer, PacketProbe};
use crate::metrics::{MetricSource, ProcessCounters, Sampler};
use crate::process::TargetProcess;
use crate::trace::{MetricSink, SinkMode, TraceClock};
use crate::Result;
use std::fs;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

/// Builds the per-session collaborators that talk to the OS.
pub trait Collectors: Send + Sync {
    fn process_counters(&self, target: &TargetProcess) -> Result<Arc<dyn ProcessCounters>>;

    fn attach_probe(&self, network: &NetworkConfig) -> Result<Box<dyn PacketProbe>>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionReport {
    pub samplers: usize,
    pub probes: usize,
    pub helpers: usize,
}

pub struct Orchestrator {
    config: Arc<Config>,
    collectors: Arc<dyn Collectors>,
    clock: TraceClock,
}

impl Orchestrator {
    pub fn new(config: Arc<Config>, collectors: Arc<dyn Collectors>) -> Self {
        Self {
            config,
            collectors,
            clock: TraceClock::shared(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Start every task for `target`, run until `cancel` fires, and return
    /// only after all of them have finished. A startup failure tears down
    /// whatever had already started and aborts the session.
    pub async fn run_session(
        &self,
        target: &TargetProcess,
        mode: SinkMode,
        cancel: CancellationToken,
    ) -> Result<SessionReport> {
        let config = &self.config;
        let dir = &config.output_dir;
        fs::create_dir_all(dir)?;

        let counters = self.collectors.process_counters(target)?;
        let mut samplers = Vec::with_capacity(config.metrics.len());
        for kind in &config.metrics {
            let sink = MetricSink::open(dir, kind.sink_name(), mode)?;
            let source = Arc::new(MetricSource::new(*kind, Arc::clone(&counters)));
            samplers.push(Sampler::new(
                kind.sink_name(),
                config.sample_interval(),
                source,
                sink,
                self.clock,
            ));
        }

        let probe = match &config.network {
            Some(network) => {
                let sink = MetricSink::open(dir, PACKET_SINK, mode)?;
                let probe = self.collectors.attach_probe(network)?;
                Some((probe, sink, network))
            }
            None => None,
        };

        let mut helpers = Vec::with_capacity(config.helpers.len());
        for spec in &config.helpers {
            match HelperProcess::spawn(spec, target.pid, config.sample_interval(), dir, mode) {
                Ok(helper) => helpers.push(helper),
                Err(e) => {
                    warn!(helper = %spec.name, error = %e, "aborting session startup");
                    for helper in helpers {
                        helper.terminate(config.helper_grace()).await;
                    }
                    if let Some((probe, _, _)) = probe {
                        probe.detach();
                    }
                    return Err(e);
                }
            }
        }

        let report = SessionReport {
            samplers: samplers.len(),
            probes: usize::from(probe.is_some()),
            helpers: helpers.len(),
        };

        let tracker = TaskTracker::new();
        for sampler in samplers {
            tracker.spawn(sampler.run(cancel.clone()));
        }
        if let Some((probe, sink, network)) = probe {
            tracker.spawn(run_drainer(
                probe,
                Drainer::new(network.batch_size),
                sink,
                network.drain_interval(),
                cancel.clone(),
            ));
        }
        for helper in helpers {
            tracker.spawn(helper.supervise(cancel.clone(), config.helper_grace()));
        }
        tracker.close();

        info!(
            pid = target.pid,
            command = %target.command_name,
            mode = ?mode,
            samplers = report.samplers,
            probes = report.probes,
            helpers = report.helpers,
            "session started"
        );

        cancel.cancelled().await;
        info!(pid = target.pid, tasks = tracker.len(), "stopping session");
        tracker.wait().await;
        info!(pid = target.pid, "session stopped");

        Ok(report)
    }
}

/// Collectors backed by procfs and the kernel packet probe.
#[cfg(target_os = "linux")]
pub struct KernelCollectors {
    registry: Arc<crate::ebpf::QdiscRegistry<crate::ebpf::loader::AyaTc>>,
}

#[cfg(target_os = "linux")]
impl KernelCollectors {
    pub fn new() -> Self {
        Self {
            registry: Arc::new(crate::ebpf::QdiscRegistry::new(
                crate::ebpf::loader::AyaTc,
            )),
        }
    }
}

#[cfg(target_os = "linux")]
impl Default for KernelCollectors {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(target_os = "linux")]
impl Collectors for KernelCollectors {
    fn process_counters(&self, target: &TargetProcess) -> Result<Arc<dyn ProcessCounters>> {
        Ok(Arc::new(crate::metrics::procfs_source::ProcfsCounters::new(
            target.pid,
        )))
    }

    fn attach_probe(&self, network: &NetworkConfig) -> Result<Box<dyn PacketProbe>> {
        use crate::config::AttachMode;
        use crate::ebpf::loader::{KernelProbe, SocketCapture};

        Ok(match network.attach {
            AttachMode::Tc => Box::new(KernelProbe::attach(network, Arc::clone(&self.registry))?),
            AttachMode::Socket => Box::new(SocketCapture::attach(network)?),
        })
    }
}
