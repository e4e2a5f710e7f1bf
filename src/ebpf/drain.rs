//! Batch drain of the kernel packet map
//!
//! Each tick pulls every entry out of the map in bounded batches through a
//! fixed pair of preallocated buffers. How many entries a batch produced is
//! taken from the count the batch call reports; a zero key is ordinary data.

use super::PacketProbe;
use crate::trace::{MetricSink, TraceRecord};
use crate::{Result, TracerError};
use proctrace_common::PacketEvent;
use std::io;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const DEFAULT_BATCH_SIZE: usize = 4096;

/// Sink name for drained packet events.
pub const PACKET_SINK: &str = "packets";

/// Result of one batch call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Batch {
    /// Entries written to the front of the key/value buffers.
    pub count: usize,
    /// Cursor to resume from on the next call.
    pub next_cursor: u64,
    /// The map reported "no more entries". `count` entries are still valid.
    pub exhausted: bool,
}

/// A map supporting lookup-and-delete in batches.
pub trait BatchMap: Send {
    /// Move up to `keys.len()` entries into the buffers, starting after
    /// `cursor` (`None` = from the beginning).
    fn lookup_and_delete_batch(
        &mut self,
        cursor: Option<u64>,
        keys: &mut [u64],
        values: &mut [PacketEvent],
    ) -> io::Result<Batch>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainStats {
    pub batches: usize,
    pub records: usize,
    pub skipped: usize,
}

pub struct Drainer {
    keys: Vec<u64>,
    values: Vec<PacketEvent>,
}

impl Drainer {
    pub fn new(batch_size: usize) -> Self {
        let batch_size = batch_size.max(1);
        Self {
            keys: vec![0; batch_size],
            values: vec![PacketEvent::default(); batch_size],
        }
    }

    pub fn batch_size(&self) -> usize {
        self.keys.len()
    }

    /// Empty `map` into `sink`. A failing batch call ends this drain early;
    /// records already written are flushed either way.
    pub fn drain(&mut self, map: &mut dyn BatchMap, sink: &mut MetricSink) -> Result<DrainStats> {
        let mut stats = DrainStats::default();
        let outcome = self.drain_batches(map, sink, &mut stats);
        sink.flush()?;
        outcome.map(|()| stats)
    }

    fn drain_batches(
        &mut self,
        map: &mut dyn BatchMap,
        sink: &mut MetricSink,
        stats: &mut DrainStats,
    ) -> Result<()> {
        let mut cursor = None;

        loop {
            let batch = map
                .lookup_and_delete_batch(cursor, &mut self.keys, &mut self.values)
                .map_err(TracerError::DrainFailed)?;
            stats.batches += 1;

            let count = batch.count.min(self.keys.len());
            for (key, value) in self.keys[..count].iter().zip(&self.values[..count]) {
                match TraceRecord::from_packet(*key, value) {
                    Some(record) => {
                        sink.write(&record)?;
                        stats.records += 1;
                    }
                    None => stats.skipped += 1,
                }
            }

            if batch.exhausted {
                return Ok(());
            }
            if count == 0 {
                // Nothing returned and no end marker: bail rather than spin
                debug!("empty batch without end-of-map, ending drain");
                return Ok(());
            }
            cursor = Some(batch.next_cursor);
        }
    }
}

/// Drain `probe` on every tick until `cancel` fires, run one last drain,
/// then detach the probe and close the sink.
pub async fn run_drainer(
    mut probe: Box<dyn PacketProbe>,
    mut drainer: Drainer,
    mut sink: MetricSink,
    interval: Duration,
    cancel: CancellationToken,
) -> usize {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut total = DrainStats::default();

    let mut drain_once = |probe: &mut Box<dyn PacketProbe>, sink: &mut MetricSink| {
        match drainer.drain(probe.events(), sink) {
            Ok(stats) => {
                total.batches += stats.batches;
                total.records += stats.records;
                total.skipped += stats.skipped;
                if stats.records > 0 {
                    debug!(
                        records = stats.records,
                        batches = stats.batches,
                        "drained packet events"
                    );
                }
            }
            Err(e) => warn!(error = %e, "packet drain failed, retrying next tick"),
        }
    };

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => drain_once(&mut probe, &mut sink),
        }
    }

    drain_once(&mut probe, &mut sink);
    probe.detach();

    if total.skipped > 0 {
        warn!(skipped = total.skipped, "packet events with unknown direction dropped");
    }
    if let Err(e) = sink.close() {
        warn!(sink = PACKET_SINK, error = %e, "failed to close sink");
    }
    info!(records = total.records, batches = total.batches, "packet drainer stopped");
    total.records
}
