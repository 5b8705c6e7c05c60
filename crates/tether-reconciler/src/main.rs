//! tether-reconciler: dynamic reconciler for externally-defined resources.
//!
//! Hosts one controller per configured resource kind and forwards all
//! provider-specific work to remote providers over the session protocol.
//! Providers come from a JSON config file (`--config`) or the
//! single-provider shortcut (`--provider-endpoint`).
//!
//! The binary runs against the in-process object store; deployments with
//! a real declarative store embed the engine as a library and supply
//! their own `ObjectStore` implementation.
//!
//! Exit codes: 0 on clean shutdown, 1 on startup validation errors, 2 on
//! unrecoverable runtime errors.

use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::routing::get;
use axum::Router;
use clap::Parser;
use tether_reconciler::engine::{Engine, EngineOptions};
use tether_reconciler::leader::{LeaderElector, LeadershipResult, MemoryLeaderElector};
use tether_reconciler::metrics::MetricsRegistry;
use tether_reconciler::store::memory::MemoryStore;
use tether_reconciler::RuntimeConfig;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Reconciler for externally-defined resources.
#[derive(Parser, Debug)]
#[command(name = "tether-reconciler")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to the providers config file.
    #[arg(long, default_value = "", conflicts_with = "provider_endpoint")]
    config: String,

    /// Single-provider shortcut; mutually exclusive with --config.
    #[arg(long, default_value = "")]
    provider_endpoint: String,

    /// Enable leader election.
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    leader_election: bool,

    /// Workers per controller.
    #[arg(long, default_value_t = 10)]
    max_reconcile_rate: usize,

    /// Steady-state re-observe cadence (e.g. 30s, 1m, 2h).
    #[arg(long, default_value = "1m", value_parser = parse_duration)]
    poll_interval: Duration,

    /// Metrics endpoint bind address.
    #[arg(long, default_value = ":8080")]
    metrics_bind_address: String,

    /// Liveness/readiness endpoint bind address.
    #[arg(long, default_value = ":8081")]
    health_probe_bind_address: String,

    /// Directory holding TLS materials (loading is the deployment's
    /// concern).
    #[arg(long, default_value = "")]
    cert_dir: String,
}

enum RunError {
    /// Bad configuration or failed startup; exit code 1.
    Startup(anyhow::Error),
    /// Failure after the engine was running; exit code 2.
    Runtime(anyhow::Error),
}

fn main() -> ExitCode {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "failed to create runtime");
            return ExitCode::from(2);
        }
    };

    match runtime.block_on(run(args)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(RunError::Startup(e)) => {
            error!(error = ?e, "startup failed");
            ExitCode::from(1)
        }
        Err(RunError::Runtime(e)) => {
            error!(error = ?e, "unrecoverable runtime error");
            ExitCode::from(2)
        }
    }
}

async fn run(args: Args) -> Result<(), RunError> {
    let config = load_config(&args).map_err(RunError::Startup)?;
    config
        .validate()
        .context("invalid configuration")
        .map_err(RunError::Startup)?;

    if !args.cert_dir.is_empty() {
        info!(cert_dir = %args.cert_dir, "TLS material directory supplied by deployment");
    }

    let cancel = CancellationToken::new();

    // Single-replica lease; swap in a distributed elector when running
    // more than one copy.
    if args.leader_election {
        let elector = Arc::new(MemoryLeaderElector::new());
        let instance = format!("tether-reconciler-{}", std::process::id());
        match elector
            .try_acquire("tether-reconciler", &instance)
            .await
            .context("leader election failed")
            .map_err(RunError::Startup)?
        {
            LeadershipResult::Acquired { lease_token, lease_duration } => {
                info!(%instance, "acquired leadership");
                spawn_lease_renewal(elector, lease_token, lease_duration, cancel.clone());
            }
            LeadershipResult::NotLeader { current_leader } => {
                return Err(RunError::Startup(anyhow::anyhow!(
                    "another instance holds leadership: {current_leader:?}"
                )));
            }
        }
    } else {
        info!("leader election disabled");
    }

    let metrics = MetricsRegistry::new()
        .context("failed to build metrics registry")
        .map_err(RunError::Startup)?;

    spawn_metrics_server(metrics.clone(), &args.metrics_bind_address, cancel.clone())
        .map_err(RunError::Startup)?;
    spawn_health_server(&args.health_probe_bind_address, cancel.clone())
        .map_err(RunError::Startup)?;

    let store = Arc::new(MemoryStore::new());
    info!("using in-process object store");

    let engine = Engine::new(config, store)
        .with_options(EngineOptions {
            max_reconcile_rate: args.max_reconcile_rate,
            poll_interval: args.poll_interval,
        })
        .with_metrics(metrics.engine());

    engine
        .start()
        .await
        .context("failed to start engine")
        .map_err(RunError::Startup)?;
    let controllers = engine.controller_names().await;
    info!(?controllers, "reconciler running");

    wait_for_shutdown_signal()
        .await
        .map_err(RunError::Runtime)?;

    info!("shutting down");
    engine.shutdown().await;
    cancel.cancel();
    Ok(())
}

fn load_config(args: &Args) -> anyhow::Result<RuntimeConfig> {
    if !args.config.is_empty() {
        RuntimeConfig::load(&args.config).context("failed to load config file")
    } else {
        Ok(RuntimeConfig::from_endpoint(&args.provider_endpoint))
    }
}

fn spawn_lease_renewal(
    elector: Arc<MemoryLeaderElector>,
    lease_token: String,
    lease_duration: Duration,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        let interval = lease_duration / 3;
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                () = tokio::time::sleep(interval) => {}
            }
            match elector.renew("tether-reconciler", &lease_token).await {
                Ok(tether_reconciler::leader::RenewalResult::Renewed) => {}
                Ok(other) => {
                    warn!(?other, "lost leadership lease");
                    break;
                }
                Err(e) => {
                    warn!(error = %e, "lease renewal failed");
                    break;
                }
            }
        }
        let _ = elector.release("tether-reconciler", &lease_token).await;
    });
}

fn spawn_metrics_server(
    metrics: Arc<MetricsRegistry>,
    address: &str,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let addr = parse_bind_address(address)?;
    let app = Router::new().route(
        "/metrics",
        get(move || {
            let metrics = metrics.clone();
            async move {
                match metrics.encode_text() {
                    Ok(body) => (
                        axum::http::StatusCode::OK,
                        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
                        body,
                    ),
                    Err(e) => (
                        axum::http::StatusCode::INTERNAL_SERVER_ERROR,
                        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
                        format!("failed to encode metrics: {e}"),
                    ),
                }
            }
        }),
    );
    spawn_http_server("metrics", addr, app, cancel);
    Ok(())
}

fn spawn_health_server(address: &str, cancel: CancellationToken) -> anyhow::Result<()> {
    let addr = parse_bind_address(address)?;
    let app = Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .route("/readyz", get(|| async { "ok" }));
    spawn_http_server("health", addr, app, cancel);
    Ok(())
}

fn spawn_http_server(name: &'static str, addr: SocketAddr, app: Router, cancel: CancellationToken) {
    tokio::spawn(async move {
        let listener = match tokio::net::TcpListener::bind(addr).await {
            Ok(listener) => listener,
            Err(e) => {
                error!(server = name, %addr, error = %e, "failed to bind HTTP server");
                return;
            }
        };
        info!(server = name, %addr, "HTTP server listening");
        let shutdown = cancel.cancelled_owned();
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await
        {
            error!(server = name, error = %e, "HTTP server error");
        }
    });
}

async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).context("cannot install SIGTERM handler")?;
        let mut sigint = signal(SignalKind::interrupt()).context("cannot install SIGINT handler")?;
        tokio::select! {
            _ = sigterm.recv() => info!("received SIGTERM"),
            _ = sigint.recv() => info!("received SIGINT"),
        }
        Ok(())
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .context("cannot install ctrl-c handler")?;
        info!("received ctrl-c");
        Ok(())
    }
}

// Accepts the `:8080` shorthand by binding all interfaces.
fn parse_bind_address(address: &str) -> anyhow::Result<SocketAddr> {
    let normalized = if address.starts_with(':') {
        format!("0.0.0.0{address}")
    } else {
        address.to_string()
    };
    normalized
        .parse()
        .with_context(|| format!("invalid bind address {address:?}"))
}

fn parse_duration(value: &str) -> Result<Duration, String> {
    let value = value.trim();
    let (number, unit) = value.split_at(
        value
            .find(|c: char| !c.is_ascii_digit())
            .ok_or_else(|| format!("missing unit in duration {value:?} (use s, m, or h)"))?,
    );
    let number: u64 = number
        .parse()
        .map_err(|_| format!("invalid duration {value:?}"))?;
    match unit {
        "s" => Ok(Duration::from_secs(number)),
        "m" => Ok(Duration::from_secs(number * 60)),
        "h" => Ok(Duration::from_secs(number * 3600)),
        "ms" => Ok(Duration::from_millis(number)),
        _ => Err(format!("unknown duration unit {unit:?} (use s, m, or h)")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_durations() {
        assert_eq!(parse_duration("1m").unwrap(), Duration::from_secs(60));
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("2h").unwrap(), Duration::from_secs(7200));
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert!(parse_duration("60").is_err());
        assert!(parse_duration("1d").is_err());
    }

    #[test]
    fn parses_bind_addresses() {
        assert_eq!(
            parse_bind_address(":8080").unwrap(),
            "0.0.0.0:8080".parse::<SocketAddr>().unwrap()
        );
        assert!(parse_bind_address("nonsense").is_err());
    }

    #[test]
    fn cli_defaults_match_the_documented_surface() {
        let args = Args::parse_from(["tether-reconciler"]);
        assert!(args.leader_election);
        assert_eq!(args.max_reconcile_rate, 10);
        assert_eq!(args.poll_interval, Duration::from_secs(60));
        assert_eq!(args.metrics_bind_address, ":8080");
        assert_eq!(args.health_probe_bind_address, ":8081");
    }
}
