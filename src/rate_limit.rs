//! Fixed-window request limiting keyed by caller identity.
//!
//! A window is identified by `now / window_ms`, so every identifier shares the
//! same boundaries. Back-to-back bursts across a boundary can reach twice the
//! limit; that is accepted in exchange for O(1) state per active identifier.

use dashmap::DashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::error::{ConfigError, LimiterError};

/// Wall-clock source in unix milliseconds, swappable in tests.
pub trait Clock: Send + Sync + fmt::Debug {
    fn now_millis(&self) -> Result<u64, LimiterError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> Result<u64, LimiterError> {
        let since_epoch = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|_| LimiterError::Clock)?;
        Ok(u64::try_from(since_epoch.as_millis()).unwrap_or(u64::MAX))
    }
}

/// Clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new(start_millis: u64) -> Self {
        Self {
            now: AtomicU64::new(start_millis),
        }
    }

    pub fn advance(&self, by: Duration) {
        let by = u64::try_from(by.as_millis()).unwrap_or(u64::MAX);
        self.now.fetch_add(by, Ordering::SeqCst);
    }

    pub fn set(&self, millis: u64) {
        self.now.store(millis, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> Result<u64, LimiterError> {
        Ok(self.now.load(Ordering::SeqCst))
    }
}

/// Parse a window spec such as `"15m"` into a duration.
///
/// Accepted units are `s`, `m`, `h` and `d`. Zero-length windows and values
/// that overflow a millisecond count are rejected.
pub fn parse_window(spec: &str) -> Result<Duration, ConfigError> {
    let invalid = || ConfigError::InvalidWindow(spec.to_string());

    let spec = spec.trim();
    let unit = spec.chars().last().ok_or_else(invalid)?;
    let digits = &spec[..spec.len() - unit.len_utf8()];
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid());
    }
    let value: u64 = digits.parse().map_err(|_| invalid())?;

    let unit_ms: u64 = match unit {
        's' => 1_000,
        'm' => 60_000,
        'h' => 3_600_000,
        'd' => 86_400_000,
        _ => return Err(invalid()),
    };

    match value.checked_mul(unit_ms) {
        Some(0) | None => Err(invalid()),
        Some(ms) => Ok(Duration::from_millis(ms)),
    }
}

/// A validated `{requests, window}` pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitPolicy {
    requests: u32,
    window: Duration,
    window_ms: u64,
}

impl RateLimitPolicy {
    pub fn new(requests: u32, window: &str) -> Result<Self, ConfigError> {
        if requests == 0 {
            return Err(ConfigError::ZeroRequests);
        }
        let window = parse_window(window)?;
        Ok(Self {
            requests,
            window_ms: u64::try_from(window.as_millis()).unwrap_or(u64::MAX),
            window,
        })
    }

    pub fn requests(&self) -> u32 {
        self.requests
    }

    pub fn window(&self) -> Duration {
        self.window
    }
}

/// Named traffic classes, each with its own policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RateLimitPreset {
    Api,
    Auth,
    Upload,
    Search,
    Ai,
    Push,
    Strict,
}

impl RateLimitPreset {
    pub const ALL: [RateLimitPreset; 7] = [
        Self::Api,
        Self::Auth,
        Self::Upload,
        Self::Search,
        Self::Ai,
        Self::Push,
        Self::Strict,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::Api => "api",
            Self::Auth => "auth",
            Self::Upload => "upload",
            Self::Search => "search",
            Self::Ai => "ai",
            Self::Push => "push",
            Self::Strict => "strict",
        }
    }

    // (requests, window)
    fn params(self) -> (u32, &'static str) {
        match self {
            Self::Api => (100, "15m"),
            Self::Auth => (5, "15m"),
            Self::Upload => (10, "1h"),
            Self::Search => (30, "1m"),
            Self::Ai => (20, "1h"),
            Self::Push => (10, "1m"),
            Self::Strict => (10, "1m"),
        }
    }

    pub fn policy(self) -> Result<RateLimitPolicy, ConfigError> {
        let (requests, window) = self.params();
        RateLimitPolicy::new(requests, window)
    }

    /// Pick the traffic class for a request path.
    pub fn for_path(path: &str) -> Self {
        const ROUTES: [(&str, RateLimitPreset); 6] = [
            ("/api/auth", RateLimitPreset::Auth),
            ("/api/upload", RateLimitPreset::Upload),
            ("/api/search", RateLimitPreset::Search),
            ("/api/ai", RateLimitPreset::Ai),
            ("/api/push", RateLimitPreset::Push),
            ("/api/admin", RateLimitPreset::Strict),
        ];

        ROUTES
            .iter()
            .find(|(prefix, _)| {
                path.strip_prefix(prefix)
                    .is_some_and(|rest| rest.is_empty() || rest.starts_with('/'))
            })
            .map(|(_, preset)| *preset)
            .unwrap_or(Self::Api)
    }
}

/// Every preset's policy, validated once at startup.
#[derive(Debug, Clone)]
pub struct RateLimitPolicies {
    api: RateLimitPolicy,
    auth: RateLimitPolicy,
    upload: RateLimitPolicy,
    search: RateLimitPolicy,
    ai: RateLimitPolicy,
    push: RateLimitPolicy,
    strict: RateLimitPolicy,
}

impl RateLimitPolicies {
    pub fn from_presets() -> Result<Self, ConfigError> {
        Ok(Self {
            api: RateLimitPreset::Api.policy()?,
            auth: RateLimitPreset::Auth.policy()?,
            upload: RateLimitPreset::Upload.policy()?,
            search: RateLimitPreset::Search.policy()?,
            ai: RateLimitPreset::Ai.policy()?,
            push: RateLimitPreset::Push.policy()?,
            strict: RateLimitPreset::Strict.policy()?,
        })
    }

    pub fn get(&self, preset: RateLimitPreset) -> &RateLimitPolicy {
        match preset {
            RateLimitPreset::Api => &self.api,
            RateLimitPreset::Auth => &self.auth,
            RateLimitPreset::Upload => &self.upload,
            RateLimitPreset::Search => &self.search,
            RateLimitPreset::Ai => &self.ai,
            RateLimitPreset::Push => &self.push,
            RateLimitPreset::Strict => &self.strict,
        }
    }

    // Same table with one preset replaced
    pub fn with_policy(mut self, preset: RateLimitPreset, policy: RateLimitPolicy) -> Self {
        match preset {
            RateLimitPreset::Api => self.api = policy,
            RateLimitPreset::Auth => self.auth = policy,
            RateLimitPreset::Upload => self.upload = policy,
            RateLimitPreset::Search => self.search = policy,
            RateLimitPreset::Ai => self.ai = policy,
            RateLimitPreset::Push => self.push = policy,
            RateLimitPreset::Strict => self.strict = policy,
        }
        self
    }
}

/// Outcome of a single limiter check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    /// Unix milliseconds at which the current window ends.
    pub reset_at: u64,
}

impl RateLimitDecision {
    pub fn reset_at_secs(&self) -> u64 {
        self.reset_at.div_ceil(1_000)
    }

    // Whole seconds until the window resets, never less than one
    pub fn retry_after_secs(&self, now_millis: u64) -> u64 {
        self.reset_at
            .saturating_sub(now_millis)
            .div_ceil(1_000)
            .max(1)
    }
}

// Rate limit entry - one per identifier per window
#[derive(Debug)]
struct RateWindowEntry {
    count: u32,
    reset_at: u64,
}

pub struct RateLimiter {
    entries: DashMap<String, RateWindowEntry>,
    clock: Arc<dyn Clock>,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            clock,
        }
    }

    pub fn now_millis(&self) -> Result<u64, LimiterError> {
        self.clock.now_millis()
    }

    /// Count one request for `identifier` and decide whether it may proceed.
    ///
    /// The entry is mutated under its shard lock, so concurrent callers on the
    /// same key serialize and the count never passes `policy.requests()`.
    pub fn check(
        &self,
        identifier: &str,
        policy: &RateLimitPolicy,
    ) -> Result<RateLimitDecision, LimiterError> {
        let now = self.clock.now_millis()?;
        let window_index = now / policy.window_ms;
        let reset_at = window_index
            .saturating_add(1)
            .saturating_mul(policy.window_ms);

        let mut entry = self
            .entries
            .entry(format!("{identifier}:{window_index}"))
            .or_insert(RateWindowEntry { count: 0, reset_at });

        let limit = policy.requests;
        if entry.count >= limit {
            return Ok(RateLimitDecision {
                allowed: false,
                limit,
                remaining: 0,
                reset_at: entry.reset_at,
            });
        }

        entry.count += 1;
        Ok(RateLimitDecision {
            allowed: true,
            limit,
            remaining: limit - entry.count,
            reset_at: entry.reset_at,
        })
    }

    /// Drop every window that has already ended. Returns how many went.
    ///
    /// `retain` locks one shard at a time, so checks against other shards keep
    /// running while a sweep is in progress.
    pub fn sweep_expired(&self) -> usize {
        let Ok(now) = self.clock.now_millis() else {
            return 0;
        };
        let mut removed = 0;
        self.entries.retain(|_, entry| {
            let keep = entry.reset_at > now;
            if !keep {
                removed += 1;
            }
            keep
        });
        removed
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimiter")
            .field("entries", &self.entries.len())
            .field("clock", &self.clock)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // aligned to a minute boundary so "1m" windows start here
    const T0: u64 = 1_700_000_040_000;

    fn limiter_at(start: u64) -> (RateLimiter, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(start));
        (RateLimiter::with_clock(clock.clone()), clock)
    }

    #[test]
    fn parses_window_specs() {
        assert_eq!(parse_window("15m").unwrap(), Duration::from_millis(900_000));
        assert_eq!(parse_window("1h").unwrap(), Duration::from_millis(3_600_000));
        assert_eq!(parse_window("1d").unwrap(), Duration::from_millis(86_400_000));
        assert_eq!(parse_window("30s").unwrap(), Duration::from_secs(30));
    }

    #[test]
    fn rejects_bad_window_specs() {
        for spec in ["abc", "", "m", "10", "10x", "-5m", "1.5h", "0s", "99999999999999999999d"] {
            assert_eq!(
                parse_window(spec),
                Err(ConfigError::InvalidWindow(spec.to_string())),
                "{spec:?} should be rejected"
            );
        }
    }

    #[test]
    fn policy_rejects_zero_requests() {
        assert_eq!(RateLimitPolicy::new(0, "1m"), Err(ConfigError::ZeroRequests));
        assert!(matches!(
            RateLimitPolicy::new(5, "abc"),
            Err(ConfigError::InvalidWindow(_))
        ));
    }

    #[test]
    fn every_preset_builds() {
        let policies = RateLimitPolicies::from_presets().unwrap();
        assert_eq!(policies.get(RateLimitPreset::Auth).requests(), 5);
        assert_eq!(
            policies.get(RateLimitPreset::Upload).window(),
            Duration::from_secs(3_600)
        );
        assert_eq!(policies.get(RateLimitPreset::Api).requests(), 100);
    }

    #[test]
    fn presets_follow_path_prefixes() {
        assert_eq!(RateLimitPreset::for_path("/api/auth/login"), RateLimitPreset::Auth);
        assert_eq!(RateLimitPreset::for_path("/api/ai"), RateLimitPreset::Ai);
        assert_eq!(RateLimitPreset::for_path("/api/admin/users"), RateLimitPreset::Strict);
        assert_eq!(RateLimitPreset::for_path("/api/authors"), RateLimitPreset::Api);
        assert_eq!(RateLimitPreset::for_path("/api/workouts"), RateLimitPreset::Api);
        assert_eq!(RateLimitPreset::for_path("/"), RateLimitPreset::Api);
    }

    #[test]
    fn allows_up_to_limit_then_blocks() {
        let (limiter, _clock) = limiter_at(T0 + 5_000);
        let policy = RateLimitPolicy::new(5, "1m").unwrap();

        let first = limiter.check("ip:1.2.3.4", &policy).unwrap();
        assert!(first.allowed);
        assert_eq!(first.remaining, 4);
        assert_eq!(first.limit, 5);
        assert_eq!(first.reset_at, T0 + 60_000);

        for expected in [3, 2, 1, 0] {
            let decision = limiter.check("ip:1.2.3.4", &policy).unwrap();
            assert!(decision.allowed);
            assert_eq!(decision.remaining, expected);
        }

        let blocked = limiter.check("ip:1.2.3.4", &policy).unwrap();
        assert!(!blocked.allowed);
        assert_eq!(blocked.remaining, 0);
        assert_eq!(blocked.reset_at, first.reset_at);
    }

    #[test]
    fn fresh_window_after_reset() {
        let (limiter, clock) = limiter_at(T0);
        let policy = RateLimitPolicy::new(2, "1m").unwrap();

        assert!(limiter.check("user:42", &policy).unwrap().allowed);
        assert!(limiter.check("user:42", &policy).unwrap().allowed);
        let blocked = limiter.check("user:42", &policy).unwrap();
        assert!(!blocked.allowed);

        clock.set(blocked.reset_at);
        let next = limiter.check("user:42", &policy).unwrap();
        assert!(next.allowed);
        assert_eq!(next.remaining, 1);
        assert_eq!(next.reset_at, blocked.reset_at + 60_000);
    }

    #[test]
    fn identifiers_do_not_interfere() {
        let (limiter, _clock) = limiter_at(T0);
        let policy = RateLimitPolicy::new(3, "1m").unwrap();

        for _ in 0..4 {
            limiter.check("ip:A", &policy).unwrap();
        }
        assert!(!limiter.check("ip:A", &policy).unwrap().allowed);

        let other = limiter.check("ip:B", &policy).unwrap();
        assert!(other.allowed);
        assert_eq!(other.remaining, 2);
    }

    #[test]
    fn retry_after_rounds_up() {
        let decision = RateLimitDecision {
            allowed: false,
            limit: 1,
            remaining: 0,
            reset_at: 10_500,
        };
        assert_eq!(decision.retry_after_secs(9_000), 2);
        assert_eq!(decision.retry_after_secs(10_500), 1);
        assert_eq!(decision.reset_at_secs(), 11);
    }

    #[test]
    fn sweep_removes_only_finished_windows() {
        let (limiter, clock) = limiter_at(T0);
        let short = RateLimitPolicy::new(10, "1m").unwrap();
        let long = RateLimitPolicy::new(10, "1h").unwrap();

        limiter.check("a", &short).unwrap();
        limiter.check("b", &long).unwrap();
        assert_eq!(limiter.len(), 2);

        clock.advance(Duration::from_secs(61));
        assert_eq!(limiter.sweep_expired(), 1);
        assert_eq!(limiter.len(), 1);
    }

    #[test]
    fn concurrent_checks_never_overshoot() {
        let limiter = Arc::new(RateLimiter::new());
        let policy = Arc::new(RateLimitPolicy::new(50, "1h").unwrap());

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let limiter = limiter.clone();
                let policy = policy.clone();
                std::thread::spawn(move || {
                    (0..25)
                        .filter(|_| limiter.check("shared", &policy).unwrap().allowed)
                        .count()
                })
            })
            .collect();

        let allowed: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        // 200 attempts; a window boundary could split them, but never undercount
        assert!(allowed >= 50 && allowed <= 100, "allowed {allowed}");
    }
}
