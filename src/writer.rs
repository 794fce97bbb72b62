// =============================================================================
// Time-Series Writer (C4) — batches ticks and bars into a primary store with
// automatic fallback
// =============================================================================

use std::collections::VecDeque;

use anyhow::Result;
use parking_lot::RwLock;
use tracing::{error, warn};

use crate::types::{Bar, Tick};

/// Minimal persistence surface the writer needs. A real deployment wires a
/// database client here; tests use the in-memory implementation below.
pub trait TimeSeriesStore: Send + Sync {
    fn write_ticks(&self, ticks: &[Tick]) -> Result<()>;
    fn write_bars(&self, bars: &[Bar]) -> Result<()>;
}

/// In-memory store used for tests and as a last-resort fallback.
#[derive(Default)]
pub struct InMemoryStore {
    pub ticks: RwLock<Vec<Tick>>,
    pub bars: RwLock<Vec<Bar>>,
    /// When set, every write fails — used to exercise failover in tests.
    pub fail: std::sync::atomic::AtomicBool,
}

impl TimeSeriesStore for InMemoryStore {
    fn write_ticks(&self, ticks: &[Tick]) -> Result<()> {
        if self.fail.load(std::sync::atomic::Ordering::Relaxed) {
            anyhow::bail!("store unavailable");
        }
        self.ticks.write().extend(ticks.iter().cloned());
        Ok(())
    }

    fn write_bars(&self, bars: &[Bar]) -> Result<()> {
        if self.fail.load(std::sync::atomic::Ordering::Relaxed) {
            anyhow::bail!("store unavailable");
        }
        self.bars.write().extend(bars.iter().cloned());
        Ok(())
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct WriterStats {
    pub write_errors: u64,
    pub reconnects: u64,
    pub ts_dropped: u64,
}

struct Buffers {
    ticks: VecDeque<Tick>,
    bars: VecDeque<Bar>,
    last_flush: std::time::Instant,
    stats: WriterStats,
}

/// Batches ticks/bars in memory and flushes them to a primary store, falling
/// back to a secondary store on error, with hard-cap drop-oldest
/// back-pressure (§4.4).
pub struct TimeSeriesWriter {
    primary: Box<dyn TimeSeriesStore>,
    fallback: Box<dyn TimeSeriesStore>,
    batch_size: usize,
    flush_interval: std::time::Duration,
    max_queue_size: usize,
    buffers: RwLock<Buffers>,
}

impl TimeSeriesWriter {
    pub fn new(
        primary: Box<dyn TimeSeriesStore>,
        fallback: Box<dyn TimeSeriesStore>,
        batch_size: usize,
        flush_interval: std::time::Duration,
        max_queue_size: usize,
    ) -> Self {
        Self {
            primary,
            fallback,
            batch_size,
            flush_interval,
            max_queue_size,
            buffers: RwLock::new(Buffers {
                ticks: VecDeque::new(),
                bars: VecDeque::new(),
                last_flush: std::time::Instant::now(),
                stats: WriterStats::default(),
            }),
        }
    }

    pub fn enqueue_tick(&self, tick: Tick) {
        let mut b = self.buffers.write();
        if b.ticks.len() >= self.max_queue_size {
            b.ticks.pop_front();
            b.stats.ts_dropped += 1;
            warn!("tick buffer at capacity, dropped oldest record");
        }
        b.ticks.push_back(tick);
    }

    pub fn enqueue_bar(&self, bar: Bar) {
        let mut b = self.buffers.write();
        if b.bars.len() >= self.max_queue_size {
            b.bars.pop_front();
            b.stats.ts_dropped += 1;
            warn!("bar buffer at capacity, dropped oldest record");
        }
        b.bars.push_back(bar);
    }

    /// True when either trigger (size or age) has fired for either buffer.
    pub fn should_flush(&self) -> bool {
        let b = self.buffers.read();
        let size_trigger = b.ticks.len() >= self.batch_size || b.bars.len() >= self.batch_size;
        let age_trigger = b.last_flush.elapsed() >= self.flush_interval && (!b.ticks.is_empty() || !b.bars.is_empty());
        size_trigger || age_trigger
    }

    /// Attempt to flush both buffers. On failure of both stores, records are
    /// re-queued at the head, preserving order, for a later retry.
    pub fn flush(&self) {
        let (ticks, bars) = {
            let mut b = self.buffers.write();
            let ticks: Vec<Tick> = b.ticks.drain(..).collect();
            let bars: Vec<Bar> = b.bars.drain(..).collect();
            b.last_flush = std::time::Instant::now();
            (ticks, bars)
        };

        if !ticks.is_empty() {
            self.flush_ticks(ticks);
        }
        if !bars.is_empty() {
            self.flush_bars(bars);
        }
    }

    fn flush_ticks(&self, ticks: Vec<Tick>) {
        if self.primary.write_ticks(&ticks).is_ok() {
            return;
        }
        let mut b = self.buffers.write();
        b.stats.reconnects += 1;
        drop(b);
        warn!(count = ticks.len(), "primary store rejected tick batch, trying fallback");

        if self.fallback.write_ticks(&ticks).is_ok() {
            return;
        }

        error!(count = ticks.len(), "both stores failed for tick batch, re-queuing");
        let mut b = self.buffers.write();
        b.stats.write_errors += 1;
        for tick in ticks.into_iter().rev() {
            b.ticks.push_front(tick);
        }
    }

    fn flush_bars(&self, bars: Vec<Bar>) {
        if self.primary.write_bars(&bars).is_ok() {
            return;
        }
        let mut b = self.buffers.write();
        b.stats.reconnects += 1;
        drop(b);
        warn!(count = bars.len(), "primary store rejected bar batch, trying fallback");

        if self.fallback.write_bars(&bars).is_ok() {
            return;
        }

        error!(count = bars.len(), "both stores failed for bar batch, re-queuing");
        let mut b = self.buffers.write();
        b.stats.write_errors += 1;
        for bar in bars.into_iter().rev() {
            b.bars.push_front(bar);
        }
    }

    pub fn stats(&self) -> WriterStats {
        self.buffers.read().stats
    }

    pub fn queue_depth(&self) -> (usize, usize) {
        let b = self.buffers.read();
        (b.ticks.len(), b.bars.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use std::sync::atomic::Ordering;
    use std::sync::Arc;

    fn tick() -> Tick {
        Tick {
            exchange: "binance".into(),
            symbol: "BTCUSDT".into(),
            price: dec!(100),
            volume: dec!(1),
            bid: None,
            ask: None,
            source_ts_us: 0,
            ingest_ts_us: 0,
        }
    }

    #[test]
    fn size_trigger_fires_at_batch_size() {
        let primary = Box::new(InMemoryStore::default());
        let fallback = Box::new(InMemoryStore::default());
        let writer = TimeSeriesWriter::new(primary, fallback, 2, std::time::Duration::from_secs(60), 100);
        writer.enqueue_tick(tick());
        assert!(!writer.should_flush());
        writer.enqueue_tick(tick());
        assert!(writer.should_flush());
    }

    #[test]
    fn flush_writes_through_to_primary() {
        let primary = Arc::new(InMemoryStore::default());
        struct ArcStore(Arc<InMemoryStore>);
        impl TimeSeriesStore for ArcStore {
            fn write_ticks(&self, ticks: &[Tick]) -> Result<()> {
                self.0.write_ticks(ticks)
            }
            fn write_bars(&self, bars: &[Bar]) -> Result<()> {
                self.0.write_bars(bars)
            }
        }
        let writer = TimeSeriesWriter::new(
            Box::new(ArcStore(primary.clone())),
            Box::new(InMemoryStore::default()),
            10,
            std::time::Duration::from_secs(60),
            100,
        );
        writer.enqueue_tick(tick());
        writer.flush();
        assert_eq!(primary.ticks.read().len(), 1);
    }

    #[test]
    fn failover_to_fallback_when_primary_errors() {
        let primary = InMemoryStore::default();
        primary.fail.store(true, Ordering::Relaxed);
        let fallback = Arc::new(InMemoryStore::default());

        struct ArcStore(Arc<InMemoryStore>);
        impl TimeSeriesStore for ArcStore {
            fn write_ticks(&self, ticks: &[Tick]) -> Result<()> {
                self.0.write_ticks(ticks)
            }
            fn write_bars(&self, bars: &[Bar]) -> Result<()> {
                self.0.write_bars(bars)
            }
        }

        let writer = TimeSeriesWriter::new(
            Box::new(primary),
            Box::new(ArcStore(fallback.clone())),
            10,
            std::time::Duration::from_secs(60),
            100,
        );
        writer.enqueue_tick(tick());
        writer.flush();
        assert_eq!(fallback.ticks.read().len(), 1);
        assert_eq!(writer.stats().reconnects, 1);
    }

    #[test]
    fn both_stores_failing_requeues_at_head_preserving_order() {
        let primary = InMemoryStore::default();
        primary.fail.store(true, Ordering::Relaxed);
        let fallback = InMemoryStore::default();
        fallback.fail.store(true, Ordering::Relaxed);

        let writer = TimeSeriesWriter::new(Box::new(primary), Box::new(fallback), 10, std::time::Duration::from_secs(60), 100);
        writer.enqueue_tick(tick());
        writer.enqueue_tick(tick());
        writer.flush();
        assert_eq!(writer.queue_depth().0, 2);
        assert_eq!(writer.stats().write_errors, 1);
    }

    #[test]
    fn hard_cap_drops_oldest_record() {
        let writer = TimeSeriesWriter::new(
            Box::new(InMemoryStore::default()),
            Box::new(InMemoryStore::default()),
            1000,
            std::time::Duration::from_secs(60),
            2,
        );
        writer.enqueue_tick(tick());
        writer.enqueue_tick(tick());
        writer.enqueue_tick(tick());
        assert_eq!(writer.queue_depth().0, 2);
        assert_eq!(writer.stats().ts_dropped, 1);
    }
}
