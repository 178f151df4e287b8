//! Gate timing and outcome metrics in `<cache>/metrics.json`.
//!
//! Each gate keeps two fixed-capacity ring buffers: durations in milliseconds
//! and pass/fail outcomes. Old samples fall off the front once capacity is
//! reached.

use std::collections::{BTreeMap, VecDeque};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::io::atomic::{read_json_or_default, write_json_atomic};
use crate::io::lock::LockDir;

pub const DEFAULT_CAPACITY: usize = 100;

/// Fixed-capacity FIFO that overwrites its oldest entry when full.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RingBuffer<T> {
    capacity: usize,
    items: VecDeque<T>,
}

impl<T> RingBuffer<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            items: VecDeque::with_capacity(capacity),
        }
    }

    pub fn push(&mut self, item: T) {
        while self.items.len() >= self.capacity {
            self.items.pop_front();
        }
        self.items.push_back(item);
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.items.iter()
    }
}

impl<T> Default for RingBuffer<T> {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

/// Samples for one gate.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GateSamples {
    pub durations_ms: RingBuffer<u64>,
    pub outcomes: RingBuffer<bool>,
}

impl GateSamples {
    /// Nearest-rank percentile of recorded durations; `p` in `0.0..=100.0`.
    pub fn percentile(&self, p: f64) -> Option<u64> {
        if self.durations_ms.is_empty() {
            return None;
        }
        let mut sorted: Vec<u64> = self.durations_ms.iter().copied().collect();
        sorted.sort_unstable();
        let p = p.clamp(0.0, 100.0);
        let rank = ((p / 100.0) * sorted.len() as f64).ceil() as usize;
        Some(sorted[rank.clamp(1, sorted.len()) - 1])
    }

    pub fn pass_rate(&self) -> Option<f64> {
        if self.outcomes.is_empty() {
            return None;
        }
        let passed = self.outcomes.iter().filter(|ok| **ok).count();
        Some(passed as f64 / self.outcomes.len() as f64)
    }
}

/// Everything persisted in `metrics.json`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    #[serde(default)]
    pub gates: BTreeMap<String, GateSamples>,
}

impl MetricsSnapshot {
    pub fn record(&mut self, gate: &str, duration: Duration, passed: bool, capacity: usize) {
        let samples = self
            .gates
            .entry(gate.to_string())
            .or_insert_with(|| GateSamples {
                durations_ms: RingBuffer::new(capacity),
                outcomes: RingBuffer::new(capacity),
            });
        samples.durations_ms.push(duration.as_millis() as u64);
        samples.outcomes.push(passed);
    }

    pub fn gate(&self, gate: &str) -> Option<&GateSamples> {
        self.gates.get(gate)
    }
}

/// Sink for gate measurements.
pub trait MetricsSink: Send + Sync {
    fn record(&self, gate: &str, duration: Duration, passed: bool) -> Result<()>;
}

/// Disk-backed collector; every record is a locked read-modify-write.
#[derive(Debug, Clone)]
pub struct MetricsStore {
    path: PathBuf,
    lock: LockDir,
    lock_timeout: Duration,
    capacity: usize,
}

impl MetricsStore {
    pub fn new(path: impl Into<PathBuf>, lock: LockDir, lock_timeout: Duration) -> Self {
        Self {
            path: path.into(),
            lock,
            lock_timeout,
            capacity: DEFAULT_CAPACITY,
        }
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }

    pub fn snapshot(&self) -> Result<MetricsSnapshot> {
        read_json_or_default(&self.path)
    }

    pub fn percentile(&self, gate: &str, p: f64) -> Result<Option<u64>> {
        Ok(self.snapshot()?.gate(gate).and_then(|s| s.percentile(p)))
    }

    pub fn pass_rate(&self, gate: &str) -> Result<Option<f64>> {
        Ok(self.snapshot()?.gate(gate).and_then(GateSamples::pass_rate))
    }
}

impl MetricsSink for MetricsStore {
    fn record(&self, gate: &str, duration: Duration, passed: bool) -> Result<()> {
        self.lock.with_lock("metrics:record", self.lock_timeout, || {
            let mut snapshot: MetricsSnapshot = read_json_or_default(&self.path)?;
            snapshot.record(gate, duration, passed, self.capacity);
            write_json_atomic(&self.path, &snapshot)
        })?;
        debug!(gate, duration_ms = duration.as_millis() as u64, passed, "gate metric recorded");
        Ok(())
    }
}

/// Discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn record(&self, _gate: &str, _duration: Duration, _passed: bool) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::config::LockConfig;

    #[test]
    fn ring_buffer_drops_oldest() {
        let mut ring = RingBuffer::new(3);
        for i in 0..5 {
            ring.push(i);
        }
        assert_eq!(ring.iter().copied().collect::<Vec<_>>(), vec![2, 3, 4]);
        assert_eq!(ring.len(), 3);
    }

    #[test]
    fn nearest_rank_percentiles() {
        let mut samples = GateSamples::default();
        for ms in [15, 20, 35, 40, 50] {
            samples.durations_ms.push(ms);
        }
        assert_eq!(samples.percentile(0.0), Some(15));
        assert_eq!(samples.percentile(30.0), Some(20));
        assert_eq!(samples.percentile(40.0), Some(20));
        assert_eq!(samples.percentile(50.0), Some(35));
        assert_eq!(samples.percentile(100.0), Some(50));
        assert_eq!(GateSamples::default().percentile(50.0), None);
    }

    #[test]
    fn pass_rate_counts_outcomes() {
        let mut snapshot = MetricsSnapshot::default();
        snapshot.record("lint", Duration::from_millis(10), true, 10);
        snapshot.record("lint", Duration::from_millis(10), false, 10);
        snapshot.record("lint", Duration::from_millis(10), true, 10);
        snapshot.record("lint", Duration::from_millis(10), true, 10);
        assert_eq!(snapshot.gate("lint").and_then(GateSamples::pass_rate), Some(0.75));
        assert!(snapshot.gate("tdd").is_none());
    }

    #[test]
    fn store_persists_and_caps_samples() {
        let temp = tempfile::tempdir().expect("tempdir");
        let lock = LockDir::new(temp.path().join("lock"), &LockConfig::default());
        let store = MetricsStore::new(temp.path().join("metrics.json"), lock, Duration::from_secs(5))
            .with_capacity(2);
        store.record("mutation", Duration::from_millis(100), true).expect("record");
        store.record("mutation", Duration::from_millis(300), false).expect("record");
        store.record("mutation", Duration::from_millis(200), false).expect("record");

        let snapshot = store.snapshot().expect("snapshot");
        let samples = snapshot.gate("mutation").expect("samples");
        assert_eq!(samples.durations_ms.len(), 2);
        assert_eq!(store.percentile("mutation", 100.0).expect("p100"), Some(300));
        assert_eq!(store.pass_rate("mutation").expect("rate"), Some(0.0));
    }
}
