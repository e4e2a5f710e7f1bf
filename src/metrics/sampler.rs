//! Ticker-driven metric sampler
//!
//! Each tick reads the raw counter, stamps it with the shared trace clock and
//! appends it to the sink. Values are written as read: no deltas.

use super::counters::CounterSource;
use crate::trace::{MetricSink, TraceClock, TraceRecord};
use crate::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SamplerState {
    Idle,
    Running,
    Stopping,
    Stopped,
}

pub struct Sampler {
    metric: String,
    interval: Duration,
    source: Arc<dyn CounterSource>,
    sink: MetricSink,
    clock: TraceClock,
    last_timestamp: u64,
    state: watch::Sender<SamplerState>,
}

impl Sampler {
    pub fn new(
        metric: impl Into<String>,
        interval: Duration,
        source: Arc<dyn CounterSource>,
        sink: MetricSink,
        clock: TraceClock,
    ) -> Self {
        let (state, _) = watch::channel(SamplerState::Idle);
        Self {
            metric: metric.into(),
            interval,
            source,
            sink,
            clock,
            last_timestamp: 0,
            state,
        }
    }

    pub fn metric(&self) -> &str {
        &self.metric
    }

    pub fn state(&self) -> watch::Receiver<SamplerState> {
        self.state.subscribe()
    }

    /// Take one sample. Returns `Ok(false)` when the counter could not be
    /// read; the tick is skipped and nothing is written.
    pub fn tick(&mut self) -> Result<bool> {
        let value = match self.source.read() {
            Ok(value) => value,
            Err(e) => {
                debug!(metric = %self.metric, error = %e, "counter read failed, skipping tick");
                return Ok(false);
            }
        };

        // Never step backwards within a sink, even if the wall clock does.
        let timestamp = self.clock.now_ns().max(self.last_timestamp);
        self.last_timestamp = timestamp;

        self.sink.write(&TraceRecord::scalar(timestamp, value))?;
        Ok(true)
    }

    /// Run until `cancel` fires, then flush and close the sink. Returns the
    /// number of records written.
    pub async fn run(mut self, cancel: CancellationToken) -> u64 {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        self.state.send_replace(SamplerState::Running);
        debug!(metric = %self.metric, interval = ?self.interval, "sampler started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.tick() {
                        warn!(metric = %self.metric, error = %e, "failed to write sample");
                    }
                }
            }
        }

        self.state.send_replace(SamplerState::Stopping);
        let written = self.sink.written();
        if let Err(e) = self.sink.close() {
            warn!(metric = %self.metric, error = %e, "failed to close sink");
        }
        self.state.send_replace(SamplerState::Stopped);
        debug!(metric = %self.metric, records = written, "sampler stopped");
        written
    }

    /// Spawn the sampler on the current runtime.
    pub fn start(self) -> SamplerHandle {
        let cancel = CancellationToken::new();
        let state = self.state();
        let join = tokio::spawn(self.run(cancel.clone()));
        SamplerHandle {
            cancel,
            state,
            join,
        }
    }
}

/// A sampler running on its own task.
pub struct SamplerHandle {
    cancel: CancellationToken,
    state: watch::Receiver<SamplerState>,
    join: JoinHandle<u64>,
}

impl SamplerHandle {
    pub fn state(&self) -> SamplerState {
        *self.state.borrow()
    }

    /// Signal the sampler and wait for its sink to be closed.
    pub async fn stop(self) -> u64 {
        self.cancel.cancel();
        self.join.await.unwrap_or(0)
    }
}
