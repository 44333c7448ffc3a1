//! Aegis Proxy
//!
//! Policy-enforcement proxy between MCP agents and upstream tool servers.
//!
//! The binary is a thin transport adapter: it reads one normalized JSON
//! request per line on stdin and writes one JSON result per line on stdout.
//! Everything interesting happens in the enforcement pipeline.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::signal;
use tracing::{info, warn};

use aegis_proxy::config::AegisConfig;
use aegis_proxy::enforcer::PolicyEnforcer;
use aegis_proxy::upstream::{EchoUpstream, HttpUpstream, Upstream};

#[derive(Parser, Debug)]
#[command(name = "aegis-proxy")]
#[command(about = "Policy enforcement proxy for MCP tool servers", long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "aegis.yaml")]
    config: String,

    /// Policy file or directory (overrides the config file)
    #[arg(short, long)]
    policy: Option<String>,

    /// Upstream backend URL (overrides the config file)
    #[arg(short, long)]
    backend: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_tracing(cli.verbose);
    init_metrics()?;

    info!("Starting Aegis proxy");

    let mut config = AegisConfig::load(&cli.config)?;
    if let Some(policy) = cli.policy {
        config.policy_path = policy;
    }
    if let Some(backend) = cli.backend {
        config.backend_url = Some(backend);
    }

    let upstream: Arc<dyn Upstream> = match &config.backend_url {
        Some(url) => {
            info!("Forwarding to upstream: {}", url);
            Arc::new(HttpUpstream::new(url.clone(), Duration::from_secs(300))?)
        }
        None => {
            warn!("No backend configured, running in echo mode");
            Arc::new(EchoUpstream)
        }
    };

    let enforcer = PolicyEnforcer::from_config(&config, upstream)?;
    load_policies(&enforcer, &config.policy_path);

    info!(
        policies = enforcer.engine().list_policies().len(),
        "Enforcement pipeline ready, reading requests from stdin"
    );

    serve_stdio(&enforcer).await?;

    enforcer.flush();
    info!("Shutdown complete");
    Ok(())
}

/// Load the policy file or directory configured for the engine
fn load_policies(enforcer: &PolicyEnforcer, policy_path: &str) {
    let path = std::path::Path::new(policy_path);
    if !path.exists() {
        warn!("Policy path does not exist, starting with an empty set: {}", policy_path);
        return;
    }

    if path.is_dir() {
        match enforcer.engine().load_policy_dir(path) {
            Ok(count) => info!("Loaded {} policies from {}", count, policy_path),
            Err(e) => warn!("Failed to load policy directory {}: {}", policy_path, e),
        }
    } else {
        match aegis_policy::Policy::from_file(path) {
            Ok(policy) => {
                enforcer.engine().add_policy(policy);
                info!("Loaded policy file {}", policy_path);
            }
            Err(e) => warn!("Failed to load policy {}: {}", policy_path, e),
        }
    }
}

/// One JSON request per stdin line, one JSON result per stdout line
async fn serve_stdio(enforcer: &PolicyEnforcer) -> Result<()> {
    let stdin = BufReader::new(tokio::io::stdin());
    let mut stdout = tokio::io::stdout();
    let mut lines = stdin.lines();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else {
                    break;
                };
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }

                let output = match serde_json::from_str::<aegis_core::InboundRequest>(line) {
                    Ok(req) => match enforcer.enforce(&req).await {
                        Ok(result) => serde_json::json!({ "result": result }),
                        Err(error) => serde_json::json!({ "error": error }),
                    },
                    Err(e) => serde_json::json!({
                        "error": {
                            "code": "INVALID_CONTEXT",
                            "message": format!("unparsable request: {}", e),
                        }
                    }),
                };

                stdout
                    .write_all(format!("{}\n", output).as_bytes())
                    .await?;
                stdout.flush().await?;
            }
            _ = shutdown_signal() => {
                warn!("Shutdown signal received");
                break;
            }
        }
    }

    Ok(())
}

/// Listen for shutdown signals (SIGTERM, SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

/// Initialize tracing/logging
fn init_tracing(verbose: bool) {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = if verbose {
        EnvFilter::new("aegis=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("aegis=info"))
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

/// Install the metrics recorder
fn init_metrics() -> Result<()> {
    use metrics_exporter_prometheus::PrometheusBuilder;

    PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| anyhow::anyhow!("Failed to install metrics: {}", e))?;

    metrics::describe_counter!("aegis_requests_total", "Total requests processed");
    metrics::describe_counter!(
        "aegis_decisions_total",
        "Decisions rendered, labeled by verdict"
    );
    metrics::describe_counter!(
        "aegis_constraint_violations_total",
        "Responses dropped at egress"
    );
    metrics::describe_histogram!(
        "aegis_decision_latency_us",
        metrics::Unit::Microseconds,
        "End-to-end enforcement latency in microseconds"
    );

    Ok(())
}
