//! relay-proxy: an Anthropic-compatible gateway that multiplexes chat
//! requests across heterogeneous upstream LLM providers.

mod balance;
mod config;
mod convert;
mod error;
mod health;
mod pool;
mod proxy;
mod server;
mod transform;

use std::sync::Arc;

use balance::Balancer;
use config::RelayConfig;
use pool::EndpointPool;
use server::AppState;
use transform::TransformerRegistry;

fn main() -> anyhow::Result<()> {
    // Determine config path
    let config_path = {
        let args: Vec<String> = std::env::args().collect();
        // Check for --config flag first
        args.iter()
            .position(|a| a == "--config")
            .and_then(|i| args.get(i + 1).cloned())
            // Fall back to positional arg
            .or_else(|| args.get(1).filter(|a| !a.starts_with('-')).cloned())
            .or_else(|| std::env::var("RELAY_PROXY_CONFIG").ok())
            .unwrap_or_else(|| "relay.toml".to_string())
    };

    // Load configuration
    let config = RelayConfig::load(&config_path)?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        // Initialize tracing (OTLP export is optional, fmt-only otherwise)
        let _tracing_guard = relay_tracing::init_tracing(&config.tracing.options());

        tracing::info!(
            config_path = %config_path,
            listen_address = %config.server.listen_address,
            endpoints = config.endpoints.len(),
            strategy = ?config.balance_mode.strategy,
            "Starting relay-proxy"
        );

        run(config).await
    })
}

async fn run(config: RelayConfig) -> anyhow::Result<()> {
    let endpoints = config.enabled_endpoints();
    if endpoints.is_empty() {
        anyhow::bail!("no enabled endpoints configured");
    }

    let client = server::build_client(config.proxy_url.as_deref())?;

    let pool = Arc::new(EndpointPool::new(endpoints));
    let balancer = Arc::new(Balancer::new(pool.clone(), &config.balance_mode));
    let registry = Arc::new(TransformerRegistry::with_builtins());

    // Probe before serving; speed-first needs a full round of samples.
    health::run_initial_probes(
        &pool,
        &client,
        &config.balance_mode.health_check,
        config.balance_mode.strategy,
    )
    .await;

    // Periodic recovery probing; when disabled, the failure ban window is
    // the sole recovery mechanism.
    if config.balance_mode.health_check.enabled {
        tokio::spawn(health::run_periodic_probes(
            pool.clone(),
            client.clone(),
            config.balance_mode.health_check.clone(),
        ));
    }

    let state = AppState {
        config,
        balancer,
        registry,
        client,
    };

    server::run(state).await
}
