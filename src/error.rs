use std::time::Duration;
use thiserror::Error;

// Bad rate-limit policy, caught when presets are built at startup
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid rate limit window {0:?}: expected <integer><s|m|h|d>")]
    InvalidWindow(String),

    #[error("rate limit policy must allow at least one request")]
    ZeroRequests,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MetricsError {
    #[error("timer {name}/{id} was never started")]
    TimerNotFound { name: String, id: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProbeError {
    #[error("probe failed: {0}")]
    Failed(String),

    #[error("probe timed out after {0:?}")]
    Timeout(Duration),

    #[error("no probe registered under {0:?}")]
    NotRegistered(String),
}

// Anything that goes wrong inside a limiter check. Callers fail open.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LimiterError {
    #[error("system clock is before the unix epoch")]
    Clock,
}
