use clap::Parser;
use std::time::Duration;

// Upper bound for the cache TTL and health interval flags
const MAX_INTERVAL_SECS: u64 = 24 * 60 * 60;

// CLI argument structure, every flag can also come from the environment
#[derive(Parser, Debug, Clone)]
#[command(name = "fitpulse-gateway")]
#[command(about = "Rate limiting and monitoring gateway for the FitPulse app")]
pub struct Args {
    // Port to run the server on
    #[arg(short, long, env = "PORT", default_value_t = 8080)]
    pub port: u16,

    // Base URL of the app everything is forwarded to
    #[arg(short, long, env = "UPSTREAM_URL", default_value = "http://localhost:3000")]
    pub upstream: String,

    // Path on the upstream probed by the "upstream" health check
    #[arg(long, env = "UPSTREAM_HEALTH_PATH", default_value = "/api/health")]
    pub upstream_health_path: String,

    // Upstream request timeout in seconds
    #[arg(long, env = "UPSTREAM_TIMEOUT", default_value_t = 30)]
    pub upstream_timeout: u64,

    // host:port of the database, enables the "database" health check
    #[arg(long, env = "DATABASE_ADDR")]
    pub database_addr: Option<String>,

    // Check consulted by HEAD /api/health
    #[arg(long, env = "LIVENESS_CHECK", default_value = "upstream")]
    pub liveness_check: String,

    // Key required on monitoring endpoints in production
    #[arg(long, env = "MONITORING_API_KEY", hide_env_values = true)]
    pub api_key: Option<String>,

    #[arg(long, env = "PRODUCTION", default_value_t = false)]
    pub production: bool,

    // Per-probe timeout in milliseconds
    #[arg(long, env = "PROBE_TIMEOUT_MS", default_value_t = 3000)]
    pub probe_timeout_ms: u64,

    // How often expired rate-limit windows and cache entries are swept
    #[arg(long, env = "SWEEP_INTERVAL_SECS", default_value_t = 60)]
    pub sweep_interval_secs: u64,

    // AI response cache TTL in seconds
    #[arg(short, long, env = "CACHE_TTL", default_value_t = 300)]
    pub cache_ttl: u64,

    // Background health check interval in seconds, 0 disables
    #[arg(long, env = "HEALTH_INTERVAL", default_value_t = 30)]
    pub health_interval: u64,
}

impl Args {
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms.clamp(1, 30_000))
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl.min(MAX_INTERVAL_SECS))
    }

    // None when the background health monitor is disabled
    pub fn health_interval(&self) -> Option<Duration> {
        (self.health_interval > 0)
            .then(|| Duration::from_secs(self.health_interval.min(MAX_INTERVAL_SECS)))
    }

    pub fn upstream_base(&self) -> &str {
        self.upstream.trim_end_matches('/')
    }

    pub fn upstream_health_url(&self) -> String {
        let path = self.upstream_health_path.trim_start_matches('/');
        format!("{}/{}", self.upstream_base(), path)
    }
}
