// =============================================================================
// Stream Bus (C2) — durable, partitioned, replayable log of ticks
// =============================================================================
//
// One logical stream per (exchange, symbol). Each published entry gets a
// monotonically increasing `entry_id`. Readers register named consumer
// groups; within a group, an entry is delivered to exactly one consumer
// until acknowledged, and may be redelivered after a visibility timeout if
// never acknowledged.
//
// The reference realization here is in-process: the same
// `parking_lot::RwLock`-guarded-state pattern used elsewhere in this crate,
// behind a trait so a networked backend could later be substituted without
// touching callers.
// =============================================================================

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tracing::{info, warn};

use crate::types::Tick;

pub type EntryId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartPosition {
    Latest,
    Earliest,
    At(EntryId),
}

#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("bus unavailable")]
    Unavailable,
    #[error("unknown stream {0}")]
    UnknownStream(String),
}

#[derive(Debug, Clone)]
struct Entry {
    id: EntryId,
    tick: Tick,
}

struct PendingEntry {
    entry: Entry,
    delivered_at: Instant,
}

struct StreamLog {
    entries: VecDeque<Entry>,
    next_id: EntryId,
    retention: Duration,
    late_drops: u64,
}

impl StreamLog {
    fn new(retention: Duration) -> Self {
        Self {
            entries: VecDeque::new(),
            next_id: 0,
            retention,
            late_drops: 0,
        }
    }

    fn push(&mut self, tick: Tick) -> EntryId {
        let id = self.next_id;
        self.next_id += 1;
        self.entries.push_back(Entry { id, tick });
        id
    }

    fn prune_expired(&mut self, now_us: i64) {
        let retention_us = self.retention.as_micros() as i64;
        while let Some(front) = self.entries.front() {
            if now_us - front.tick.ingest_ts_us > retention_us {
                self.entries.pop_front();
                self.late_drops += 1;
            } else {
                break;
            }
        }
    }
}

struct ConsumerGroup {
    /// Per-stream read cursor: next entry_id not yet delivered.
    cursor: HashMap<String, EntryId>,
    /// Entries delivered but not yet acknowledged, keyed by (stream, entry_id).
    pending: HashMap<(String, EntryId), PendingEntry>,
}

impl ConsumerGroup {
    fn new() -> Self {
        Self {
            cursor: HashMap::new(),
            pending: HashMap::new(),
        }
    }
}

struct Inner {
    streams: HashMap<String, StreamLog>,
    groups: HashMap<String, ConsumerGroup>,
}

/// Durable, partitioned, replayable log of ticks with consumer-group
/// delivery semantics (§4.2).
pub struct StreamBus {
    inner: RwLock<Inner>,
    visibility_timeout: Duration,
    retention: Duration,
}

impl StreamBus {
    pub fn new(visibility_timeout: Duration, retention: Duration) -> Self {
        Self {
            inner: RwLock::new(Inner {
                streams: HashMap::new(),
                groups: HashMap::new(),
            }),
            visibility_timeout,
            retention,
        }
    }

    fn stream_key(exchange: &str, symbol: &str) -> String {
        format!("{exchange}:{symbol}")
    }

    /// Publish a tick onto its (exchange, symbol) stream.
    pub fn publish(&self, tick: Tick) -> Result<EntryId, BusError> {
        let key = Self::stream_key(&tick.exchange, &tick.symbol);
        let mut inner = self.inner.write();
        let retention = self.retention;
        let now_us = tick.ingest_ts_us;
        let log = inner
            .streams
            .entry(key)
            .or_insert_with(|| StreamLog::new(retention));
        log.prune_expired(now_us);
        Ok(log.push(tick))
    }

    /// Register (or re-open) a consumer group for the given streams.
    pub fn open(&self, group: &str, streams: &[String], start: StartPosition) {
        let mut guard = self.inner.write();
        let Inner { streams: stream_logs, groups } = &mut *guard;
        let entry = groups
            .entry(group.to_string())
            .or_insert_with(ConsumerGroup::new);

        for stream in streams {
            if entry.cursor.contains_key(stream) {
                continue;
            }
            let cursor = match start {
                StartPosition::Latest => stream_logs
                    .get(stream)
                    .map(|log| log.next_id)
                    .unwrap_or(0),
                StartPosition::Earliest => stream_logs
                    .get(stream)
                    .and_then(|log| log.entries.front())
                    .map(|e| e.id)
                    .unwrap_or(0),
                StartPosition::At(id) => id,
            };
            entry.cursor.insert(stream.clone(), cursor);
        }
        info!(group, streams = ?streams, "consumer group opened");
    }

    /// Poll up to `max_entries` across the group's registered streams,
    /// including any entries whose visibility timeout has lapsed.
    pub fn poll(
        &self,
        group: &str,
        streams: &[String],
        max_entries: usize,
    ) -> Result<Vec<(String, EntryId, Tick)>, BusError> {
        let mut guard = self.inner.write();
        let now = Instant::now();
        let visibility_timeout = self.visibility_timeout;

        let Inner { streams: stream_logs, groups } = &mut *guard;
        let Some(g) = groups.get_mut(group) else {
            return Err(BusError::Unavailable);
        };

        let mut out = Vec::with_capacity(max_entries);

        // Redeliver anything past its visibility timeout first.
        let expired: Vec<(String, EntryId)> = g
            .pending
            .iter()
            .filter(|(_, p)| now.duration_since(p.delivered_at) > visibility_timeout)
            .map(|(k, _)| k.clone())
            .collect();
        for key in expired {
            if out.len() >= max_entries {
                break;
            }
            if let Some(p) = g.pending.get_mut(&key) {
                p.delivered_at = now;
                out.push((key.0.clone(), p.entry.id, p.entry.tick.clone()));
            }
        }

        for stream in streams {
            if out.len() >= max_entries {
                break;
            }
            let Some(log) = stream_logs.get(stream) else {
                continue;
            };
            let cursor = *g.cursor.get(stream).unwrap_or(&0);
            for entry in log.entries.iter().filter(|e| e.id >= cursor) {
                if out.len() >= max_entries {
                    break;
                }
                g.pending.insert(
                    (stream.clone(), entry.id),
                    PendingEntry {
                        entry: entry.clone(),
                        delivered_at: now,
                    },
                );
                g.cursor.insert(stream.clone(), entry.id + 1);
                out.push((stream.clone(), entry.id, entry.tick.clone()));
            }
        }

        Ok(out)
    }

    /// Acknowledge an entry, removing it from the group's pending set.
    pub fn ack(&self, group: &str, stream: &str, entry_id: EntryId) {
        let mut inner = self.inner.write();
        if let Some(g) = inner.groups.get_mut(group) {
            g.pending.remove(&(stream.to_string(), entry_id));
        } else {
            warn!(group, stream, entry_id, "ack on unknown consumer group");
        }
    }

    /// Current lag (entries not yet acknowledged or not yet delivered) for a
    /// group across its registered streams — used by the control plane's
    /// health snapshot.
    pub fn lag(&self, group: &str) -> u64 {
        let inner = self.inner.read();
        let Some(g) = inner.groups.get(group) else {
            return 0;
        };
        let undelivered: u64 = g
            .cursor
            .iter()
            .map(|(stream, cursor)| {
                inner
                    .streams
                    .get(stream)
                    .map(|log| log.next_id.saturating_sub(*cursor))
                    .unwrap_or(0)
            })
            .sum();
        undelivered + g.pending.len() as u64
    }
}
