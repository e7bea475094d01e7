use std::sync::Arc;
use std::time::Duration;

use chrono::{Datelike, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::aggregate::HostByteAggregator;
use crate::store::TrafficStore;

/// Outcome of a single flush cycle.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FlushStats {
    pub hosts_flushed: usize,
    pub hosts_failed: usize,
    pub bytes_flushed: u64,
}

/// Drains the aggregator into monthly traffic buckets on a fixed interval.
///
/// Ticks never overlap: a flush runs to completion before the next tick is
/// honored, and missed ticks are skipped. The `(month, year)` bucket is
/// determined once per tick, so a snapshot straddling a month boundary is
/// attributed entirely to the month current when the tick fired.
pub struct PeriodicFlusher<S> {
    aggregator: Arc<HostByteAggregator>,
    store: S,
    interval: Duration,
}

impl<S: TrafficStore> PeriodicFlusher<S> {
    pub fn new(aggregator: Arc<HostByteAggregator>, store: S, interval: Duration) -> Self {
        Self {
            aggregator,
            store,
            interval,
        }
    }

    /// Flushes on every tick until the token is cancelled, then drains one
    /// final time so shutdown does not lose the current period's counters.
    pub async fn run(self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // Consume the immediate first tick.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    let now = Utc::now();
                    let stats = self.flush_once(now.month(), now.year()).await;
                    if stats.hosts_flushed > 0 || stats.hosts_failed > 0 {
                        info!(
                            hosts = stats.hosts_flushed,
                            failed = stats.hosts_failed,
                            bytes = stats.bytes_flushed,
                            "final flush on shutdown",
                        );
                    }
                    return;
                }
                _ = ticker.tick() => {
                    let now = Utc::now();
                    let stats = self.flush_once(now.month(), now.year()).await;
                    if stats.hosts_flushed > 0 || stats.hosts_failed > 0 {
                        info!(
                            hosts = stats.hosts_flushed,
                            failed = stats.hosts_failed,
                            bytes = stats.bytes_flushed,
                            month = now.month(),
                            year = now.year(),
                            "flushed traffic totals",
                        );
                    }
                }
            }
        }
    }

    /// Snapshots and resets the aggregator, then upserts each hostname's
    /// total into its `(month, year)` bucket.
    ///
    /// A failed upsert is isolated to its hostname: the error is logged, the
    /// delta is credited back to the aggregator so a later cycle retries it,
    /// and the remaining hostnames still flush.
    pub async fn flush_once(&self, month: u32, year: i32) -> FlushStats {
        let snapshot = self.aggregator.snapshot_and_reset();
        let mut stats = FlushStats::default();

        for (hostname, byte_count) in snapshot {
            if byte_count == 0 {
                continue;
            }

            match self.store.upsert_add(&hostname, month, year, byte_count).await {
                Ok(()) => {
                    stats.hosts_flushed += 1;
                    stats.bytes_flushed = stats.bytes_flushed.saturating_add(byte_count);
                }
                Err(e) => {
                    error!(
                        hostname = %hostname,
                        byte_count,
                        error = %e,
                        "upsert failed, retaining bytes for a later cycle",
                    );
                    self.aggregator.increment(&hostname, byte_count);
                    stats.hosts_failed += 1;
                }
            }
        }

        stats
    }
}
