use dashmap::DashMap;
use prometheus::{
    Encoder, Gauge, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts, Registry,
    TextEncoder,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use tracing::warn;

use crate::error::MetricsError;

const NAMESPACE: &str = "fitpulse";

struct NamedCounter {
    value: u64,
    exported: Option<IntCounter>,
}

// Aggregate for every timer sharing a name
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TimerStats {
    pub count: u64,
    pub last_ms: f64,
    pub total_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
    pub mean_ms: f64,
}

impl TimerStats {
    fn observe(&mut self, ms: f64) {
        if self.count == 0 {
            self.min_ms = ms;
            self.max_ms = ms;
        } else {
            self.min_ms = self.min_ms.min(ms);
            self.max_ms = self.max_ms.max(ms);
        }
        self.count += 1;
        self.last_ms = ms;
        self.total_ms += ms;
        self.mean_ms = self.total_ms / self.count as f64;
    }
}

/// Point-in-time copy of everything the registry holds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub uptime_seconds: u64,
    pub counters: BTreeMap<String, u64>,
    pub errors: BTreeMap<String, u64>,
    pub timers: BTreeMap<String, TimerStats>,
    pub in_flight_timers: usize,
}

/// Process-lifetime counters and timers.
///
/// Values live in `DashMap`s for the JSON snapshot and are mirrored into a
/// private prometheus `Registry` for the text exposition.
pub struct MetricsRegistry {
    started_at: Instant,
    counters: DashMap<String, NamedCounter>,
    errors: DashMap<String, u64>,
    timers: DashMap<String, TimerStats>,
    running: DashMap<(String, String), Instant>,
    registry: Registry,
    error_counter: Option<IntCounterVec>,
    timer_histogram: Option<HistogramVec>,
    uptime: Option<Gauge>,
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsRegistry {
    pub fn new() -> Self {
        let registry = Registry::new();

        let error_counter = register(
            &registry,
            IntCounterVec::new(
                Opts::new("errors_total", "Errors recorded by type").namespace(NAMESPACE),
                &["type"],
            ),
        );
        let timer_histogram = register(
            &registry,
            HistogramVec::new(
                HistogramOpts::new("timer_duration_seconds", "Timed operations in seconds")
                    .namespace(NAMESPACE),
                &["timer"],
            ),
        );
        let uptime = register(
            &registry,
            Gauge::with_opts(
                Opts::new("uptime_seconds", "Seconds since the process started")
                    .namespace(NAMESPACE),
            ),
        );

        Self {
            started_at: Instant::now(),
            counters: DashMap::new(),
            errors: DashMap::new(),
            timers: DashMap::new(),
            running: DashMap::new(),
            registry,
            error_counter,
            timer_histogram,
            uptime,
        }
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Add one to `name`, creating it on first use.
    pub fn increment_counter(&self, name: &str) {
        let mut counter = self
            .counters
            .entry(name.to_string())
            .or_insert_with(|| NamedCounter {
                value: 0,
                exported: self.export_counter(name),
            });
        counter.value += 1;
        if let Some(exported) = &counter.exported {
            exported.inc();
        }
    }

    // Counters whose sanitized names clash are still counted, just not exported
    fn export_counter(&self, name: &str) -> Option<IntCounter> {
        let opts = Opts::new(sanitize_metric_name(name), format!("Counter {name}"))
            .namespace(NAMESPACE);
        register(&self.registry, IntCounter::with_opts(opts))
    }

    pub fn record_error(&self, kind: &str) {
        *self.errors.entry(kind.to_string()).or_insert(0) += 1;
        if let Some(counter) = &self.error_counter {
            counter.with_label_values(&[kind]).inc();
        }
    }

    /// Start timing `name` for the caller-chosen `id`.
    ///
    /// Restarting a running `(name, id)` pair resets its start time.
    pub fn start_timer(&self, name: &str, id: &str) {
        self.running
            .insert((name.to_string(), id.to_string()), Instant::now());
    }

    /// Stop the `(name, id)` timer and fold its duration into `name`'s stats.
    pub fn end_timer(&self, name: &str, id: &str) -> Result<Duration, MetricsError> {
        let (_, started) = self
            .running
            .remove(&(name.to_string(), id.to_string()))
            .ok_or_else(|| MetricsError::TimerNotFound {
                name: name.to_string(),
                id: id.to_string(),
            })?;
        let elapsed = started.elapsed();
        self.record_duration(name, elapsed);
        Ok(elapsed)
    }

    pub fn record_duration(&self, name: &str, duration: Duration) {
        self.timers
            .entry(name.to_string())
            .or_default()
            .observe(duration.as_secs_f64() * 1_000.0);
        if let Some(histogram) = &self.timer_histogram {
            histogram
                .with_label_values(&[name])
                .observe(duration.as_secs_f64());
        }
    }

    pub fn counter(&self, name: &str) -> u64 {
        self.counters.get(name).map_or(0, |c| c.value)
    }

    /// Owned copy of all values. Later writes never show up in it.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            uptime_seconds: self.uptime().as_secs(),
            counters: self
                .counters
                .iter()
                .map(|e| (e.key().clone(), e.value().value))
                .collect(),
            errors: self
                .errors
                .iter()
                .map(|e| (e.key().clone(), *e.value()))
                .collect(),
            timers: self
                .timers
                .iter()
                .map(|e| (e.key().clone(), *e.value()))
                .collect(),
            in_flight_timers: self.running.len(),
        }
    }

    /// Prometheus text exposition of the registry.
    pub fn render_prometheus(&self) -> Result<String, prometheus::Error> {
        if let Some(uptime) = &self.uptime {
            uptime.set(self.uptime().as_secs_f64());
        }
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

fn register<T>(registry: &Registry, metric: Result<T, prometheus::Error>) -> Option<T>
where
    T: prometheus::core::Collector + Clone + 'static,
{
    let metric = match metric {
        Ok(metric) => metric,
        Err(e) => {
            warn!(error = %e, "Failed to create metric");
            return None;
        }
    };
    match registry.register(Box::new(metric.clone())) {
        Ok(()) => Some(metric),
        Err(e) => {
            warn!(error = %e, "Failed to register metric, it will not be exported");
            None
        }
    }
}

// Prometheus names allow [a-zA-Z_:][a-zA-Z0-9_:]*
pub fn sanitize_metric_name(name: &str) -> String {
    let mut out: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == ':' { c } else { '_' })
        .collect();
    if out.is_empty() || out.starts_with(|c: char| c.is_ascii_digit()) {
        out.insert(0, '_');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_start_at_zero_and_increment() {
        let metrics = MetricsRegistry::new();
        assert_eq!(metrics.counter("logins"), 0);
        metrics.increment_counter("logins");
        metrics.increment_counter("logins");
        assert_eq!(metrics.counter("logins"), 2);
    }

    #[test]
    fn ending_unknown_timer_is_an_error_value() {
        let metrics = MetricsRegistry::new();
        let err = metrics.end_timer("http_request", "nope").unwrap_err();
        assert_eq!(
            err,
            MetricsError::TimerNotFound {
                name: "http_request".into(),
                id: "nope".into()
            }
        );
        assert!(metrics.snapshot().timers.is_empty());
    }

    #[test]
    fn timers_with_different_ids_do_not_collide() {
        let metrics = MetricsRegistry::new();
        metrics.start_timer("http_request", "a");
        metrics.start_timer("http_request", "b");
        assert_eq!(metrics.snapshot().in_flight_timers, 2);

        metrics.end_timer("http_request", "a").unwrap();
        assert!(metrics.end_timer("http_request", "a").is_err());
        metrics.end_timer("http_request", "b").unwrap();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.timers["http_request"].count, 2);
        assert_eq!(snapshot.in_flight_timers, 0);
    }

    #[test]
    fn timer_stats_aggregate() {
        let metrics = MetricsRegistry::new();
        metrics.record_duration("query", Duration::from_millis(10));
        metrics.record_duration("query", Duration::from_millis(30));

        let stats = metrics.snapshot().timers["query"];
        assert_eq!(stats.count, 2);
        assert_eq!(stats.min_ms, 10.0);
        assert_eq!(stats.max_ms, 30.0);
        assert_eq!(stats.last_ms, 30.0);
        assert_eq!(stats.mean_ms, 20.0);
    }

    #[test]
    fn snapshot_is_a_copy() {
        let metrics = MetricsRegistry::new();
        metrics.increment_counter("posts_created");
        metrics.record_error("upstream_error");

        let first = metrics.snapshot();
        assert_eq!(first, metrics.snapshot());

        let mut mutated = first.clone();
        mutated.counters.insert("posts_created".into(), 999);
        mutated.errors.clear();
        assert_eq!(metrics.snapshot(), first);

        metrics.increment_counter("posts_created");
        assert_eq!(first.counters["posts_created"], 1);
        assert_eq!(metrics.snapshot().counters["posts_created"], 2);
    }

    #[test]
    fn renders_text_exposition() {
        let metrics = MetricsRegistry::new();
        metrics.increment_counter("http_requests_total");
        metrics.record_error("rate_limited");
        metrics.record_duration("http_request", Duration::from_millis(5));

        let text = metrics.render_prometheus().unwrap();
        assert!(text.contains("# TYPE fitpulse_http_requests_total counter"));
        assert!(text.contains("fitpulse_http_requests_total 1"));
        assert!(text.contains("fitpulse_errors_total{type=\"rate_limited\"} 1"));
        assert!(text.contains("# HELP fitpulse_uptime_seconds"));
        assert!(text.contains("fitpulse_timer_duration_seconds_count{timer=\"http_request\"} 1"));
    }

    #[test]
    fn odd_counter_names_are_sanitized() {
        assert_eq!(sanitize_metric_name("api.v1/posts"), "api_v1_posts");
        assert_eq!(sanitize_metric_name("2xx"), "_2xx");

        let metrics = MetricsRegistry::new();
        metrics.increment_counter("route /api/posts");
        assert_eq!(metrics.counter("route /api/posts"), 1);
        assert!(metrics.render_prometheus().unwrap().contains("fitpulse_route__api_posts 1"));
    }
}
