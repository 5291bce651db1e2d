//! Named async health probes with a bounded run time.
//!
//! Every run goes `Idle -> Running -> {Passed, Failed, TimedOut}`. Timeouts and
//! probe errors both count as failures in the aggregate, and are logged here so
//! callers only ever see a boolean.

use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, join_all};
use serde::Serialize;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::ProbeError;

pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(3);

pub type ProbeFuture = BoxFuture<'static, Result<bool, ProbeError>>;
type Probe = Arc<dyn Fn() -> ProbeFuture + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeOutcome {
    Passed,
    Failed,
    TimedOut,
}

impl ProbeOutcome {
    pub fn passed(self) -> bool {
        self == Self::Passed
    }
}

/// Result of running every registered probe.
///
/// With no probes registered the report is healthy (an empty AND) and
/// `checks` is empty, so the missing coverage is visible to whoever reads it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    pub checks: BTreeMap<String, bool>,
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        self.checks.values().all(|ok| *ok)
    }
}

pub struct HealthChecker {
    probes: DashMap<String, Probe>,
    timeout: Duration,
}

impl Default for HealthChecker {
    fn default() -> Self {
        Self::new(DEFAULT_PROBE_TIMEOUT)
    }
}

impl HealthChecker {
    pub fn new(timeout: Duration) -> Self {
        Self {
            probes: DashMap::new(),
            timeout,
        }
    }

    /// Register `probe` under `name`, replacing any earlier one.
    pub fn register_check<F, Fut>(&self, name: &str, probe: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<bool, ProbeError>> + Send + 'static,
    {
        let probe: Probe = Arc::new(move || probe().boxed());
        if self.probes.insert(name.to_string(), probe).is_some() {
            debug!(check = name, "Replaced health check");
        }
    }

    pub fn check_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.probes.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    pub async fn run_check(&self, name: &str) -> bool {
        self.run_check_outcome(name).await.passed()
    }

    /// Run one probe and report how it ended.
    ///
    /// An unknown name is a failure, never a pass.
    pub async fn run_check_outcome(&self, name: &str) -> ProbeOutcome {
        // clone the probe out so no shard lock is held across the await
        let probe = self.probes.get(name).map(|p| Arc::clone(p.value()));
        match probe {
            Some(probe) => self.run_probe(name, probe).await,
            None => {
                let err = ProbeError::NotRegistered(name.to_string());
                warn!(check = name, error = %err, "Health check failed");
                ProbeOutcome::Failed
            }
        }
    }

    /// Run every probe concurrently.
    pub async fn run_all_checks(&self) -> HealthReport {
        let probes: Vec<(String, Probe)> = self
            .probes
            .iter()
            .map(|e| (e.key().clone(), Arc::clone(e.value())))
            .collect();

        let results = join_all(probes.into_iter().map(|(name, probe)| async move {
            let outcome = self.run_probe(&name, probe).await;
            (name, outcome.passed())
        }))
        .await;

        HealthReport {
            checks: results.into_iter().collect(),
        }
    }

    async fn run_probe(&self, name: &str, probe: Probe) -> ProbeOutcome {
        let start = Instant::now();
        match tokio::time::timeout(self.timeout, probe()).await {
            Ok(Ok(true)) => ProbeOutcome::Passed,
            Ok(Ok(false)) => {
                warn!(
                    check = name,
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "Health check reported unhealthy"
                );
                ProbeOutcome::Failed
            }
            Ok(Err(e)) => {
                warn!(check = name, error = %e, "Health check failed");
                ProbeOutcome::Failed
            }
            Err(_) => {
                let err = ProbeError::Timeout(self.timeout);
                warn!(check = name, error = %err, "Health check timed out");
                ProbeOutcome::TimedOut
            }
        }
    }
}

// Probe that passes when GET `url` answers with a 2xx
pub fn http_probe(
    client: reqwest::Client,
    url: String,
) -> impl Fn() -> ProbeFuture + Send + Sync + 'static {
    move || {
        let client = client.clone();
        let url = url.clone();
        async move {
            let res = client
                .get(&url)
                .send()
                .await
                .map_err(|e| ProbeError::Failed(e.to_string()))?;
            Ok::<_, ProbeError>(res.status().is_success())
        }
        .boxed()
    }
}

// Probe that passes when a TCP connection to `addr` can be opened
pub fn tcp_probe(addr: String) -> impl Fn() -> ProbeFuture + Send + Sync + 'static {
    move || {
        let addr = addr.clone();
        async move {
            tokio::net::TcpStream::connect(&addr)
                .await
                .map(|_| true)
                .map_err(|e| ProbeError::Failed(e.to_string()))
        }
        .boxed()
    }
}

/// Checks whose result differs from the previous round, with their new state.
///
/// A check seen for the first time counts as previously healthy, so only
/// failures show up at startup.
pub fn state_changes<'a>(
    previous: &BTreeMap<String, bool>,
    current: &'a BTreeMap<String, bool>,
) -> Vec<(&'a str, bool)> {
    current
        .iter()
        .filter(|(name, healthy)| previous.get(*name).copied().unwrap_or(true) != **healthy)
        .map(|(name, healthy)| (name.as_str(), *healthy))
        .collect()
}

/// Run every check on an interval and log when a probe changes state.
pub async fn health_monitor(
    checker: Arc<HealthChecker>,
    check_interval: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = interval(check_interval);
    let mut last: BTreeMap<String, bool> = BTreeMap::new();

    info!(interval = ?check_interval, "Health monitor started");

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let report = checker.run_all_checks().await;
        for (name, healthy) in state_changes(&last, &report.checks) {
            if healthy {
                info!(check = %name, "Check is now healthy");
            } else {
                warn!(check = %name, "Check is now unhealthy");
            }
        }
        last = report.checks;
    }

    info!("Health monitor stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn aggregates_pass_and_fail() {
        let checker = HealthChecker::default();
        checker.register_check("a", || async { Ok::<_, ProbeError>(true) });
        checker.register_check("b", || async { Err::<bool, _>(ProbeError::Failed("boom".into())) });

        let report = checker.run_all_checks().await;
        assert_eq!(
            report.checks,
            BTreeMap::from([("a".to_string(), true), ("b".to_string(), false)])
        );
        assert!(!report.is_healthy());
    }

    #[tokio::test]
    async fn empty_registry_is_healthy() {
        let report = HealthChecker::default().run_all_checks().await;
        assert!(report.checks.is_empty());
        assert!(report.is_healthy());
    }

    #[tokio::test]
    async fn unknown_check_fails() {
        let checker = HealthChecker::default();
        assert_eq!(checker.run_check_outcome("database").await, ProbeOutcome::Failed);
        assert!(!checker.run_check("database").await);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_probe_times_out() {
        let checker = HealthChecker::new(Duration::from_secs(2));
        checker.register_check("database", || async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok::<_, ProbeError>(true)
        });

        assert_eq!(checker.run_check_outcome("database").await, ProbeOutcome::TimedOut);
        assert!(!checker.run_check("database").await);
    }

    #[tokio::test(start_paused = true)]
    async fn probes_run_concurrently() {
        let checker = HealthChecker::new(Duration::from_secs(5));
        for name in ["a", "b", "c"] {
            checker.register_check(name, || async {
                tokio::time::sleep(Duration::from_secs(2)).await;
                Ok::<_, ProbeError>(true)
            });
        }

        let start = tokio::time::Instant::now();
        let report = checker.run_all_checks().await;
        assert!(report.is_healthy());
        // sequential would take 6s and trip the 5s timeout
        assert!(start.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test]
    async fn last_registration_wins() {
        let checker = HealthChecker::default();
        let calls = Arc::new(AtomicUsize::new(0));

        checker.register_check("cache", || async { Ok::<_, ProbeError>(false) });
        let counted = calls.clone();
        checker.register_check("cache", move || {
            let counted = counted.clone();
            async move {
                counted.fetch_add(1, Ordering::SeqCst);
                Ok::<_, ProbeError>(true)
            }
        });

        assert!(checker.run_check("cache").await);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(checker.check_names(), vec!["cache".to_string()]);
    }

    #[tokio::test]
    async fn tcp_probe_reports_listener_state() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let checker = HealthChecker::default();
        checker.register_check("database", tcp_probe(addr));
        assert!(checker.run_check("database").await);

        drop(listener);
        assert!(!checker.run_check("database").await);
    }

    #[tokio::test(start_paused = true)]
    async fn monitor_stops_on_cancel() {
        let checker = Arc::new(HealthChecker::default());
        checker.register_check("a", || async { Ok::<_, ProbeError>(true) });
        let token = CancellationToken::new();

        let handle = tokio::spawn(health_monitor(
            checker,
            Duration::from_secs(30),
            token.clone(),
        ));
        tokio::time::sleep(Duration::from_secs(61)).await;
        token.cancel();
        handle.await.unwrap();
    }

    #[test]
    fn state_changes_report_both_directions() {
        let previous = BTreeMap::from([
            ("upstream".to_string(), true),
            ("database".to_string(), false),
            ("cache".to_string(), true),
        ]);
        let current = BTreeMap::from([
            ("upstream".to_string(), false),
            ("database".to_string(), true),
            ("cache".to_string(), true),
        ]);

        assert_eq!(
            state_changes(&previous, &current),
            vec![("database", true), ("upstream", false)]
        );
        assert!(state_changes(&current, &current).is_empty());
    }

    #[test]
    fn new_checks_only_report_failures() {
        let current = BTreeMap::from([
            ("search".to_string(), false),
            ("upstream".to_string(), true),
        ]);
        assert_eq!(
            state_changes(&BTreeMap::new(), &current),
            vec![("search", false)]
        );
    }
}
