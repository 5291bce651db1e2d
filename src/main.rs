use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use fitpulse_gateway::cache::TtlCache;
use fitpulse_gateway::config::Args;
use fitpulse_gateway::handlers::router;
use fitpulse_gateway::health::{HealthChecker, health_monitor, http_probe, tcp_probe};
use fitpulse_gateway::metrics::MetricsRegistry;
use fitpulse_gateway::rate_limit::{RateLimitPolicies, RateLimitPreset, RateLimiter};
use fitpulse_gateway::state::{AppState, MonitoringAuth};
use fitpulse_gateway::worker::sweep_worker;

// this is main async function with tokio
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // parse cli arguments
    let args = Args::parse();

    // policies are validated here so a bad window never reaches the request path
    let policies = RateLimitPolicies::from_presets()?;
    for preset in RateLimitPreset::ALL {
        let policy = policies.get(preset);
        info!(
            preset = preset.name(),
            requests = policy.requests(),
            window = ?policy.window(),
            "Rate limit policy"
        );
    }

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(args.upstream_timeout))
        .build()?;

    let health = Arc::new(HealthChecker::new(args.probe_timeout()));
    health.register_check(
        "upstream",
        http_probe(client.clone(), args.upstream_health_url()),
    );
    if let Some(addr) = &args.database_addr {
        health.register_check("database", tcp_probe(addr.clone()));
    }
    if !health.check_names().contains(&args.liveness_check) {
        warn!(
            check = %args.liveness_check,
            "Liveness check is not registered, HEAD /api/health will report unavailable"
        );
    }

    let auth = match (&args.api_key, args.production) {
        (Some(key), true) => MonitoringAuth::required(key.clone()),
        (None, true) => {
            warn!("No monitoring API key configured, health and metrics endpoints are open");
            MonitoringAuth::open()
        }
        _ => MonitoringAuth::open(),
    };

    // creating shared state
    let state = Arc::new(AppState {
        client,
        upstream: args.upstream_base().to_string(),
        limiter: Arc::new(RateLimiter::new()),
        policies,
        metrics: Arc::new(MetricsRegistry::new()),
        health: health.clone(),
        ai_cache: Arc::new(TtlCache::new(args.cache_ttl())),
        liveness_check: args.liveness_check.clone(),
        auth,
    });

    // spawn the background workers
    let shutdown = CancellationToken::new();
    let mut tasks = vec![tokio::spawn(sweep_worker(
        state.limiter.clone(),
        state.ai_cache.clone(),
        args.sweep_interval(),
        shutdown.clone(),
    ))];
    if let Some(health_interval) = args.health_interval() {
        tasks.push(tokio::spawn(health_monitor(
            health,
            health_interval,
            shutdown.clone(),
        )));
    }

    let app = router(state);

    let addr = format!("0.0.0.0:{}", args.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    info!(
        port = args.port,
        upstream = %args.upstream_base(),
        production = args.production,
        cache_ttl = ?args.cache_ttl(),
        "Gateway running"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await?;

    shutdown.cancel();
    for task in tasks {
        let _ = task.await;
    }
    info!("Gateway stopped");
    Ok(())
}

// Resolves on Ctrl-C or SIGTERM and cancels the background workers
async fn shutdown_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
        _ = shutdown.cancelled() => {},
    }

    info!("Shutting down");
    shutdown.cancel();
}
