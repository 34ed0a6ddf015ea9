//! Per-source ingestion counters.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Cumulative counters for one source.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SourceStats {
    pub parsed: u64,
    pub saved: u64,
    pub errors: u64,
    pub run_count: u64,
    pub last_run_time: Option<DateTime<Utc>>,
    /// Running mean over all runs.
    #[serde(with = "duration_secs")]
    pub average_run_duration: Duration,
}

/// Point-in-time view of every source plus process totals.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    #[serde(with = "duration_secs")]
    pub uptime: Duration,
    pub total_parsed: u64,
    pub total_saved: u64,
    pub total_errors: u64,
    /// Saved records per second of uptime.
    pub records_per_sec: f64,
    pub sources: BTreeMap<String, SourceStats>,
}

#[derive(Debug)]
struct MetricsInner {
    started: Instant,
    sources: BTreeMap<String, SourceStats>,
}

/// Shared metrics recorder. Clones record into the same counters.
#[derive(Debug, Clone)]
pub struct MetricsRecorder {
    inner: Arc<RwLock<MetricsInner>>,
}

impl Default for MetricsRecorder {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsRecorder {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(MetricsInner {
                started: Instant::now(),
                sources: BTreeMap::new(),
            })),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, MetricsInner> {
        self.inner.read().unwrap_or_else(|poisoned| {
            tracing::warn!("Recovered from poisoned metrics lock");
            poisoned.into_inner()
        })
    }

    fn write(&self) -> RwLockWriteGuard<'_, MetricsInner> {
        self.inner.write().unwrap_or_else(|poisoned| {
            tracing::warn!("Recovered from poisoned metrics lock");
            poisoned.into_inner()
        })
    }

    /// Fold one source execution into its counters.
    pub fn record_run(
        &self,
        source: &str,
        parsed: u64,
        saved: u64,
        errors: u64,
        duration: Duration,
    ) {
        let mut inner = self.write();
        let stats = inner.sources.entry(source.to_string()).or_default();

        stats.parsed += parsed;
        stats.saved += saved;
        stats.errors += errors;

        let old_count = stats.run_count;
        stats.run_count += 1;
        stats.average_run_duration = running_average(
            stats.average_run_duration,
            old_count,
            duration,
        );
        stats.last_run_time = Some(Utc::now());
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let inner = self.read();
        let uptime = inner.started.elapsed();

        let (mut parsed, mut saved, mut errors) = (0, 0, 0);
        for stats in inner.sources.values() {
            parsed += stats.parsed;
            saved += stats.saved;
            errors += stats.errors;
        }

        let secs = uptime.as_secs_f64();
        MetricsSnapshot {
            uptime,
            total_parsed: parsed,
            total_saved: saved,
            total_errors: errors,
            records_per_sec: if secs > 0.0 { saved as f64 / secs } else { 0.0 },
            sources: inner.sources.clone(),
        }
    }

    pub fn source_snapshot(&self, source: &str) -> Option<SourceStats> {
        self.read().sources.get(source).cloned()
    }

    /// Forget every counter and restart the uptime clock.
    pub fn reset(&self) {
        let mut inner = self.write();
        inner.sources.clear();
        inner.started = Instant::now();
    }
}

/// `(old_avg * old_count + sample) / (old_count + 1)`.
fn running_average(old_avg: Duration, old_count: u64, sample: Duration) -> Duration {
    let total = old_avg.as_secs_f64() * old_count as f64 + sample.as_secs_f64();
    Duration::from_secs_f64(total / (old_count + 1) as f64)
}

mod duration_secs {
    use std::time::Duration;

    use serde::Serializer;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }
}
