//! Operational metrics surface
//!
//! Aggregates live counters, latency histograms and a rolling window of
//! classified errors. Counters are monotonic; windows are explicitly
//! bounded in time.

use dream_common::classify::{ErrorType, Severity};
use dream_common::types::ArtifactSource;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Upper bounds of the fixed histogram buckets, in milliseconds
const LATENCY_BUCKETS_MS: &[u64] = &[
    1, 2, 5, 10, 25, 50, 100, 250, 500, 1_000, 2_500, 5_000, 10_000, 30_000, 60_000,
];

/// Rolling window for the error summary
const ERROR_WINDOW: Duration = Duration::from_secs(300);

const HISTOGRAM_STRIPES: usize = 8;

/// Fixed-bucket latency histogram with striped locks
pub struct LatencyHistogram {
    stripes: Vec<Mutex<Vec<u64>>>,
    next: AtomicU64,
}

impl Default for LatencyHistogram {
    fn default() -> Self {
        Self::new()
    }
}

impl LatencyHistogram {
    pub fn new() -> Self {
        Self {
            stripes: (0..HISTOGRAM_STRIPES)
                .map(|_| Mutex::new(vec![0u64; LATENCY_BUCKETS_MS.len() + 1]))
                .collect(),
            next: AtomicU64::new(0),
        }
    }

    pub fn record(&self, value_ms: u64) {
        let bucket = LATENCY_BUCKETS_MS
            .iter()
            .position(|upper| value_ms <= *upper)
            .unwrap_or(LATENCY_BUCKETS_MS.len());
        let stripe = (self.next.fetch_add(1, Ordering::Relaxed) as usize) % HISTOGRAM_STRIPES;
        self.stripes[stripe].lock()[bucket] += 1;
    }

    fn merged(&self) -> Vec<u64> {
        let mut merged = vec![0u64; LATENCY_BUCKETS_MS.len() + 1];
        for stripe in &self.stripes {
            for (slot, count) in stripe.lock().iter().enumerate() {
                merged[slot] += count;
            }
        }
        merged
    }

    /// Upper bound of the bucket containing the requested percentile
    pub fn percentile_ms(&self, percentile: f64) -> u64 {
        let merged = self.merged();
        let total: u64 = merged.iter().sum();
        if total == 0 {
            return 0;
        }
        let rank = ((percentile / 100.0) * total as f64).ceil() as u64;
        let mut seen = 0u64;
        for (bucket, count) in merged.iter().enumerate() {
            seen += count;
            if seen >= rank {
                return LATENCY_BUCKETS_MS
                    .get(bucket)
                    .copied()
                    .unwrap_or(u64::MAX);
            }
        }
        u64::MAX
    }

    pub fn snapshot(&self) -> HistogramSnapshot {
        HistogramSnapshot {
            p50_ms: self.percentile_ms(50.0),
            p95_ms: self.percentile_ms(95.0),
            p99_ms: self.percentile_ms(99.0),
            count: self.merged().iter().sum(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HistogramSnapshot {
    pub p50_ms: u64,
    pub p95_ms: u64,
    pub p99_ms: u64,
    pub count: u64,
}

/// Rolling error summary window
#[derive(Default)]
struct ErrorWindow {
    events: VecDeque<(Instant, ErrorType, Severity)>,
}

impl ErrorWindow {
    fn push(&mut self, error_type: ErrorType, severity: Severity) {
        let now = Instant::now();
        self.events.push_back((now, error_type, severity));
        while let Some((at, _, _)) = self.events.front() {
            if now.duration_since(*at) > ERROR_WINDOW {
                self.events.pop_front();
            } else {
                break;
            }
        }
    }

    fn summarize(&self) -> ErrorSummary {
        let now = Instant::now();
        let mut by_type: HashMap<String, u64> = HashMap::new();
        let mut by_severity: HashMap<String, u64> = HashMap::new();
        let mut total = 0u64;
        for (at, error_type, severity) in &self.events {
            if now.duration_since(*at) > ERROR_WINDOW {
                continue;
            }
            total += 1;
            *by_type.entry(error_type.as_str().to_string()).or_insert(0) += 1;
            let severity_key = format!("{severity:?}").to_lowercase();
            *by_severity.entry(severity_key).or_insert(0) += 1;
        }
        ErrorSummary {
            window_secs: ERROR_WINDOW.as_secs(),
            total,
            by_type,
            by_severity,
        }
    }
}

/// Error counts over the rolling window
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ErrorSummary {
    pub window_secs: u64,
    pub total: u64,
    pub by_type: HashMap<String, u64>,
    pub by_severity: HashMap<String, u64>,
}

/// Live counters for the whole gateway
pub struct MetricsSurface {
    requests: AtomicU64,
    cache_hits: AtomicU64,
    coalesced: AtomicU64,
    failures: AtomicU64,
    sources: Mutex<HashMap<ArtifactSource, u64>>,
    request_latency: LatencyHistogram,
    repair_attempts: LatencyHistogram,
    errors: Mutex<ErrorWindow>,
}

impl Default for MetricsSurface {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsSurface {
    pub fn new() -> Self {
        Self {
            requests: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            coalesced: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            sources: Mutex::new(HashMap::new()),
            request_latency: LatencyHistogram::new(),
            repair_attempts: LatencyHistogram::new(),
            errors: Mutex::new(ErrorWindow::default()),
        }
    }

    pub fn record_request(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_coalesced(&self) {
        self.coalesced.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_completion(&self, source: ArtifactSource, latency: Duration, repair_attempts: u32) {
        *self.sources.lock().entry(source).or_insert(0) += 1;
        self.request_latency.record(latency.as_millis() as u64);
        self.repair_attempts.record(repair_attempts as u64);
    }

    pub fn record_error(&self, error_type: ErrorType, severity: Severity) {
        self.errors.lock().push(error_type, severity);
    }

    pub fn errors_summary(&self) -> ErrorSummary {
        self.errors.lock().summarize()
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let sources = self
            .sources
            .lock()
            .iter()
            .map(|(source, count)| (source.to_string(), *count))
            .collect();
        StatsSnapshot {
            requests: self.requests.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            coalesced: self.coalesced.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            sources,
            request_latency: self.request_latency.snapshot(),
            repair_attempts: self.repair_attempts.snapshot(),
            errors: self.errors_summary(),
        }
    }
}

/// Aggregate counters exposed northbound
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StatsSnapshot {
    pub requests: u64,
    pub cache_hits: u64,
    pub coalesced: u64,
    pub failures: u64,
    pub sources: HashMap<String, u64>,
    pub request_latency: HistogramSnapshot,
    pub repair_attempts: HistogramSnapshot,
    pub errors: ErrorSummary,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn histogram_percentiles_bracket_recorded_values() {
        let histogram = LatencyHistogram::new();
        for _ in 0..90 {
            histogram.record(40);
        }
        for _ in 0..10 {
            histogram.record(900);
        }
        assert_eq!(histogram.percentile_ms(50.0), 50);
        assert_eq!(histogram.percentile_ms(99.0), 1_000);
    }

    #[test]
    fn empty_histogram_reports_zero() {
        let histogram = LatencyHistogram::new();
        assert_eq!(histogram.percentile_ms(50.0), 0);
        assert_eq!(histogram.snapshot().count, 0);
    }

    #[test]
    fn error_summary_counts_by_type_and_severity() {
        let surface = MetricsSurface::new();
        surface.record_error(ErrorType::Network, Severity::Medium);
        surface.record_error(ErrorType::Network, Severity::Medium);
        surface.record_error(ErrorType::RateLimit, Severity::High);

        let summary = surface.errors_summary();
        assert_eq!(summary.total, 3);
        assert_eq!(summary.by_type.get("network"), Some(&2));
        assert_eq!(summary.by_type.get("rate_limit"), Some(&1));
        assert_eq!(summary.by_severity.get("medium"), Some(&2));
    }

    #[test]
    fn snapshot_gathers_all_counters() {
        let surface = MetricsSurface::new();
        surface.record_request();
        surface.record_request();
        surface.record_cache_hit();
        surface.record_completion(ArtifactSource::Ai, Duration::from_millis(120), 0);
        surface.record_completion(
            ArtifactSource::LocalFallback,
            Duration::from_millis(15),
            2,
        );

        let snapshot = surface.snapshot();
        assert_eq!(snapshot.requests, 2);
        assert_eq!(snapshot.cache_hits, 1);
        assert_eq!(snapshot.sources.get("ai"), Some(&1));
        assert_eq!(snapshot.sources.get("local_fallback"), Some(&1));
        assert_eq!(snapshot.request_latency.count, 2);
    }
}
