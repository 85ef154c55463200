//! Rolling in-memory usage history per container.
//!
//! Samples live in a bounded ring per `(namespace, workload, container)` key:
//! at most `max_samples` entries or `max_age` of history, whichever evicts
//! first. Writers to distinct keys never contend; the map shards its locks
//! and aggregate queries only take the lock of the key they read.

use std::collections::VecDeque;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;

use crate::types::{ChannelStats, ContainerKey, UsageAggregate, UsageSample, UsageStats};

/// Windows with fewer samples than this are marked insufficient; callers
/// treat that as a veto for predictive actions.
pub const MIN_WINDOW_SAMPLES: usize = 5;

#[derive(Debug, Default)]
struct SampleRing {
    samples: VecDeque<UsageSample>,
}

/// Bounded time-series store with statistical window queries.
pub struct TimeSeriesStore {
    series: DashMap<ContainerKey, SampleRing>,
    max_samples: usize,
    max_age: Duration,
}

impl TimeSeriesStore {
    pub fn new(max_samples: usize, max_age: Duration) -> Self {
        Self {
            series: DashMap::new(),
            max_samples,
            max_age,
        }
    }

    /// Append one sample. O(1) amortised.
    ///
    /// Timestamps must be monotonically non-decreasing within a key; a sample
    /// older than the newest stored one is dropped to keep the ring ordered.
    pub fn record(&self, key: ContainerKey, sample: UsageSample) {
        let mut ring = self.series.entry(key).or_default();

        if let Some(last) = ring.samples.back() {
            if sample.timestamp < last.timestamp {
                return;
            }
        }
        ring.samples.push_back(sample);

        while ring.samples.len() > self.max_samples {
            ring.samples.pop_front();
        }
        let cutoff = sample.timestamp - chrono::Duration::from_std(self.max_age).unwrap_or_default();
        while ring
            .samples
            .front()
            .is_some_and(|s| s.timestamp < cutoff)
        {
            ring.samples.pop_front();
        }
    }

    /// Statistics over the trailing `window`, measured from `now`.
    /// O(k) in the samples inside the window.
    pub fn query(&self, key: &ContainerKey, window: Duration, now: DateTime<Utc>) -> UsageStats {
        let Some(ring) = self.series.get(key) else {
            return UsageStats {
                insufficient: true,
                ..Default::default()
            };
        };

        let cutoff = now - chrono::Duration::from_std(window).unwrap_or_default();
        let cpu: Vec<u64> = ring
            .samples
            .iter()
            .filter(|s| s.timestamp >= cutoff)
            .map(|s| s.cpu_millicores)
            .collect();
        let memory: Vec<u64> = ring
            .samples
            .iter()
            .filter(|s| s.timestamp >= cutoff)
            .map(|s| s.memory_bytes)
            .collect();

        UsageStats {
            count: cpu.len(),
            cpu: channel_stats(&cpu),
            memory: channel_stats(&memory),
            insufficient: cpu.len() < MIN_WINDOW_SAMPLES,
        }
    }

    /// Percentile `p` (0, 1] of the trailing window for both dimensions.
    /// `None` when the window is insufficient.
    pub fn percentile(
        &self,
        key: &ContainerKey,
        window: Duration,
        p: f64,
        now: DateTime<Utc>,
    ) -> Option<UsageAggregate> {
        let ring = self.series.get(key)?;
        let cutoff = now - chrono::Duration::from_std(window).unwrap_or_default();

        let mut cpu: Vec<u64> = Vec::new();
        let mut memory: Vec<u64> = Vec::new();
        for s in ring.samples.iter().filter(|s| s.timestamp >= cutoff) {
            cpu.push(s.cpu_millicores);
            memory.push(s.memory_bytes);
        }
        if cpu.len() < MIN_WINDOW_SAMPLES {
            return None;
        }

        cpu.sort_unstable();
        memory.sort_unstable();
        Some(UsageAggregate {
            cpu_millicores: percentile_of_sorted(&cpu, p),
            memory_bytes: percentile_of_sorted(&memory, p),
        })
    }

    /// Window samples as `(seconds_offset, value)` pairs for the predictor.
    pub fn series_for(
        &self,
        key: &ContainerKey,
        window: Duration,
        now: DateTime<Utc>,
    ) -> (Vec<(f64, f64)>, Vec<(f64, f64)>) {
        let Some(ring) = self.series.get(key) else {
            return (Vec::new(), Vec::new());
        };
        let cutoff = now - chrono::Duration::from_std(window).unwrap_or_default();

        let mut cpu = Vec::new();
        let mut memory = Vec::new();
        let origin = ring
            .samples
            .iter()
            .find(|s| s.timestamp >= cutoff)
            .map(|s| s.timestamp);
        let Some(origin) = origin else {
            return (cpu, memory);
        };
        for s in ring.samples.iter().filter(|s| s.timestamp >= cutoff) {
            let t = (s.timestamp - origin).num_milliseconds() as f64 / 1000.0;
            cpu.push((t, s.cpu_millicores as f64));
            memory.push((t, s.memory_bytes as f64));
        }
        (cpu, memory)
    }

    /// Drop history for a container that disappeared.
    pub fn evict(&self, key: &ContainerKey) {
        self.series.remove(key);
    }

    /// Number of tracked keys.
    pub fn len(&self) -> usize {
        self.series.len()
    }

    pub fn is_empty(&self) -> bool {
        self.series.is_empty()
    }
}

fn channel_stats(values: &[u64]) -> ChannelStats {
    if values.is_empty() {
        return ChannelStats::default();
    }
    let n = values.len() as f64;
    let mean = values.iter().map(|v| *v as f64).sum::<f64>() / n;
    let var = values
        .iter()
        .map(|v| {
            let d = *v as f64 - mean;
            d * d
        })
        .sum::<f64>()
        / n;
    ChannelStats {
        mean,
        stddev: var.sqrt(),
        min: *values.iter().min().unwrap(),
        max: *values.iter().max().unwrap(),
    }
}

/// Nearest-rank percentile on a sorted slice.
fn percentile_of_sorted(sorted: &[u64], p: f64) -> u64 {
    let p = p.clamp(0.0, 1.0);
    let rank = ((p * sorted.len() as f64).ceil() as usize).clamp(1, sorted.len());
    sorted[rank - 1]
}
