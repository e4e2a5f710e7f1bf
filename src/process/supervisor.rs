//! Process liveness supervisor
//!
//! Resolves the target, runs a session against it, and when the process
//! exits resolves again and starts the next session in append mode so the
//! sinks keep growing across restarts. External cancellation ends it from
//! any state.

use super::resolver::{ProcessResolver, TargetProcess, TargetSelector};
use crate::config::DiscoveryConfig;
use crate::session::Orchestrator;
use crate::trace::SinkMode;
use crate::{Result, TracerError};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Searching,
    Attached,
    Exited,
    Restarting,
    Terminating,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SupervisorReport {
    /// Sessions run, including the one interrupted by shutdown.
    pub sessions: usize,
}

pub struct Supervisor {
    selector: TargetSelector,
    resolver: Arc<dyn ProcessResolver>,
    orchestrator: Orchestrator,
    discovery: DiscoveryConfig,
    liveness_interval: Duration,
    state: watch::Sender<SupervisorState>,
}

impl Supervisor {
    pub fn new(
        selector: TargetSelector,
        resolver: Arc<dyn ProcessResolver>,
        orchestrator: Orchestrator,
    ) -> Self {
        let config = orchestrator.config();
        let discovery = config.discovery.clone();
        let liveness_interval = config.liveness_interval();
        let (state, _) = watch::channel(SupervisorState::Searching);
        Self {
            selector,
            resolver,
            orchestrator,
            discovery,
            liveness_interval,
            state,
        }
    }

    pub fn state(&self) -> watch::Receiver<SupervisorState> {
        self.state.subscribe()
    }

    fn set_state(&self, state: SupervisorState) {
        debug!(?state, "supervisor state");
        self.state.send_replace(state);
    }

    /// Run sessions until `shutdown` fires. Errors only when discovery runs
    /// out of attempts or a session fails to start.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<SupervisorReport> {
        let mut report = SupervisorReport::default();
        let mut mode = SinkMode::Fresh;

        loop {
            self.set_state(SupervisorState::Searching);
            let target = match self.search(&shutdown).await {
                Ok(Some(target)) => target,
                Ok(None) => {
                    self.set_state(SupervisorState::Terminating);
                    return Ok(report);
                }
                Err(e) => {
                    self.set_state(SupervisorState::Terminating);
                    return Err(e);
                }
            };

            self.set_state(SupervisorState::Attached);
            info!(pid = target.pid, command = %target.command_name, ?mode, "attached to target");

            let session = shutdown.child_token();
            let watcher = tokio::spawn(watch_liveness(
                Arc::clone(&self.resolver),
                target.clone(),
                self.liveness_interval,
                session.clone(),
            ));

            let outcome = self
                .orchestrator
                .run_session(&target, mode, session.clone())
                .await;
            session.cancel();
            let exited = watcher.await.unwrap_or(false);
            report.sessions += 1;

            if let Err(e) = outcome {
                error!(pid = target.pid, error = %e, "session failed");
                self.set_state(SupervisorState::Terminating);
                return Err(e);
            }

            if shutdown.is_cancelled() {
                self.set_state(SupervisorState::Terminating);
                info!(sessions = report.sessions, "supervisor stopped");
                return Ok(report);
            }

            if exited {
                self.set_state(SupervisorState::Exited);
                info!(pid = target.pid, "target exited, restarting in append mode");
            }
            self.set_state(SupervisorState::Restarting);
            mode = SinkMode::Append;
        }
    }

    /// Resolve the target with bounded retries. `Ok(None)` means shutdown
    /// arrived first.
    async fn search(&self, shutdown: &CancellationToken) -> Result<Option<TargetProcess>> {
        let attempts = self.discovery.attempts.max(1);

        for attempt in 1..=attempts {
            if shutdown.is_cancelled() {
                return Ok(None);
            }

            match self.resolver.resolve(&self.selector) {
                Ok(target) => return Ok(Some(target)),
                Err(e) => warn!(
                    target = %self.selector,
                    attempt,
                    attempts,
                    error = %e,
                    "target not found"
                ),
            }

            if attempt < attempts {
                tokio::select! {
                    _ = shutdown.cancelled() => return Ok(None),
                    _ = tokio::time::sleep(self.discovery.backoff()) => {}
                }
            }
        }

        Err(TracerError::DiscoveryExhausted {
            selector: self.selector.to_string(),
            attempts,
        })
    }
}

/// Poll the target until it disappears, then cancel `session`. Returns
/// whether the exit was observed.
async fn watch_liveness(
    resolver: Arc<dyn ProcessResolver>,
    target: TargetProcess,
    interval: Duration,
    session: CancellationToken,
) -> bool {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = session.cancelled() => return false,
            _ = ticker.tick() => {
                if !resolver.is_alive(&target) {
                    info!(pid = target.pid, "target process gone");
                    session.cancel();
                    return true;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, NetworkConfig};
    use crate::ebpf::PacketProbe;
    use crate::metrics::counters::{
        CpuTimes, HostMemory, IoCounters, IpFamily, MemoryStats, TcpQueueSummary,
    };
    use crate::metrics::ProcessCounters;
    use crate::session::Collectors;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct ZeroCounters;

    impl ProcessCounters for ZeroCounters {
        fn read_io_counters(&self) -> Result<IoCounters> {
            Ok(IoCounters::default())
        }
        fn read_memory_stats(&self) -> Result<MemoryStats> {
            Ok(MemoryStats::default())
        }
        fn read_cpu_times(&self) -> Result<CpuTimes> {
            Ok(CpuTimes::default())
        }
        fn read_host_memory(&self) -> Result<HostMemory> {
            Ok(HostMemory::default())
        }
        fn read_tcp_queue_summary(&self, _family: IpFamily) -> Result<TcpQueueSummary> {
            Ok(TcpQueueSummary::default())
        }
    }

    struct NoProbe;

    impl Collectors for NoProbe {
        fn process_counters(&self, _target: &TargetProcess) -> Result<Arc<dyn ProcessCounters>> {
            Ok(Arc::new(ZeroCounters))
        }
        fn attach_probe(&self, _network: &NetworkConfig) -> Result<Box<dyn PacketProbe>> {
            Err(TracerError::UnsupportedFeature("no probe".into()))
        }
    }

    /// Never finds anything.
    #[derive(Default)]
    struct Nowhere {
        lookups: AtomicUsize,
    }

    impl ProcessResolver for Nowhere {
        fn resolve(&self, selector: &TargetSelector) -> Result<TargetProcess> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            Err(TracerError::ProcessNotFound(selector.to_string()))
        }
        fn is_alive(&self, _target: &TargetProcess) -> bool {
            false
        }
    }

    fn supervisor(dir: &std::path::Path, resolver: Arc<dyn ProcessResolver>) -> Supervisor {
        let config = Config {
            output_dir: dir.to_path_buf(),
            discovery: DiscoveryConfig {
                attempts: 3,
                backoff_ms: 20,
            },
            ..Default::default()
        };
        let orchestrator = Orchestrator::new(Arc::new(config), Arc::new(NoProbe));
        Supervisor::new(TargetSelector::Name("nothing".into()), resolver, orchestrator)
    }

    #[tokio::test]
    async fn test_discovery_exhaustion_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = Arc::new(Nowhere::default());
        let supervisor = supervisor(dir.path(), resolver.clone());

        let err = supervisor.run(CancellationToken::new()).await.unwrap_err();
        assert!(matches!(
            err,
            TracerError::DiscoveryExhausted { attempts: 3, .. }
        ));
        assert_eq!(resolver.lookups.load(Ordering::SeqCst), 3);
        assert_eq!(*supervisor.state().borrow(), SupervisorState::Terminating);
    }

    #[tokio::test]
    async fn test_shutdown_during_search_ends_cleanly() {
        let dir = tempfile::tempdir().unwrap();
        let mut supervisor = supervisor(dir.path(), Arc::new(Nowhere::default()));
        supervisor.discovery.backoff_ms = 10_000;

        let shutdown = CancellationToken::new();
        let stopper = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            stopper.cancel();
        });

        let report = supervisor.run(shutdown).await.unwrap();
        assert_eq!(report.sessions, 0);
    }
}
