//! Axum HTTP server: router, CORS policy, listener, graceful shutdown.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Request, State};
use axum::http::header::{AUTHORIZATION, CONTENT_TYPE};
use axum::http::{HeaderName, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};

use crate::balance::Balancer;
use crate::config::{RelayConfig, Strategy};
use crate::error::RelayError;
use crate::pool::EndpointStatus;
use crate::proxy::engine;
use crate::transform::TransformerRegistry;

/// Request bodies beyond this are rejected before dispatch.
const MAX_REQUEST_BYTES: usize = 16 * 1024 * 1024;

/// Shared application state.
pub struct AppState {
    pub config: RelayConfig,
    pub balancer: Arc<Balancer>,
    pub registry: Arc<TransformerRegistry>,
    pub client: reqwest::Client,
}

/// Read-only status query over the running gateway.
#[derive(Debug, Serialize)]
pub struct StatusSnapshot {
    pub total: usize,
    pub healthy: usize,
    pub unhealthy: usize,
    pub endpoints: Vec<EndpointStatus>,
    pub load_balance: bool,
    pub transform: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub strategy: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transformers: Option<Vec<&'static str>>,
}

impl AppState {
    pub fn status(&self) -> StatusSnapshot {
        let pool = self.balancer.pool();
        let total = pool.len();
        let healthy = pool.healthy_count();
        let load_balance = self.config.proxy_mode.enable_load_balance;
        let transform = self.config.proxy_mode.enable_transform;
        StatusSnapshot {
            total,
            healthy,
            unhealthy: total - healthy,
            endpoints: pool.status_rows(),
            load_balance,
            transform,
            strategy: load_balance.then(|| match self.balancer.strategy() {
                Strategy::Fallback => "fallback",
                Strategy::Polling => "polling",
                Strategy::SpeedFirst => "speed-first",
            }),
            transformers: transform.then(|| self.registry.names()),
        }
    }
}

/// The outbound HTTP client shared by all dispatches.
///
/// No whole-request timeout: streamed responses run as long as they need.
/// Connection establishment is bounded here, time-to-headers by the engine.
pub fn build_client(proxy_url: Option<&str>) -> anyhow::Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder().connect_timeout(Duration::from_secs(30));
    if let Some(url) = proxy_url {
        builder = builder.proxy(reqwest::Proxy::all(url)?);
    }
    Ok(builder.build()?)
}

/// Build and run the HTTP server until SIGINT.
pub async fn run(state: AppState) -> anyhow::Result<()> {
    run_until(state, shutdown_signal()).await
}

/// Build and run the HTTP server until `shutdown` completes. This is the
/// stop operation: callers hold the future's trigger.
pub async fn run_until(
    state: AppState,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let listen_addr = state.config.server.listen_address.clone();

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::POST, Method::OPTIONS, Method::GET])
        .allow_headers([
            CONTENT_TYPE,
            AUTHORIZATION,
            HeaderName::from_static("x-api-key"),
        ])
        .max_age(Duration::from_secs(86400));

    let app = Router::new()
        .route("/health", get(handle_health))
        .fallback(handle_any)
        .layer(cors)
        .with_state(Arc::new(state));

    let listener = tokio::net::TcpListener::bind(&listen_addr).await?;
    tracing::info!(address = %listen_addr, "relay-proxy listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;

    tracing::info!("relay-proxy shut down gracefully");
    Ok(())
}

/// Catch-all handler: any-path POST is proxied, OPTIONS answers the CORS
/// preflight (headers added by the layer), everything else is a 404.
async fn handle_any(State(state): State<Arc<AppState>>, request: Request) -> Response {
    if request.method() == Method::OPTIONS {
        return StatusCode::NO_CONTENT.into_response();
    }
    if request.method() != Method::POST {
        return RelayError::NotFound.into_response();
    }

    let path_and_query = request
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| request.uri().path().to_string());
    let headers = request.headers().clone();

    let body = match axum::body::to_bytes(request.into_body(), MAX_REQUEST_BYTES).await {
        Ok(b) => b,
        Err(e) => {
            tracing::warn!(error = %e, "failed to read request body");
            return RelayError::InvalidRequest("failed to read request body".to_string())
                .into_response();
        }
    };

    engine::handle_proxy(state, path_and_query, headers, body).await
}

/// Liveness probe.
async fn handle_health() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

/// Wait for SIGINT (Ctrl+C) for graceful shutdown.
async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("failed to install CTRL+C signal handler");
    tracing::info!("Shutdown signal received, draining connections...");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EndpointConfig;
    use crate::pool::EndpointPool;

    fn test_state(enable_transform: bool) -> AppState {
        let config = RelayConfig {
            server: Default::default(),
            endpoints: vec![
                EndpointConfig {
                    name: "a".into(),
                    base_url: "https://a.example.com".into(),
                    api_key: "k".into(),
                    model: None,
                    order: 0,
                    enabled: true,
                    transformer_enabled: false,
                    transformer: None,
                    headers: Default::default(),
                },
                EndpointConfig {
                    name: "b".into(),
                    base_url: "https://b.example.com".into(),
                    api_key: "k".into(),
                    model: None,
                    order: 1,
                    enabled: true,
                    transformer_enabled: false,
                    transformer: None,
                    headers: Default::default(),
                },
            ],
            proxy_mode: crate::config::ProxyModeConfig {
                enable_load_balance: true,
                enable_transform,
                verbose: false,
                debug: false,
            },
            balance_mode: Default::default(),
            proxy_url: None,
            tracing: Default::default(),
        };
        let pool = Arc::new(EndpointPool::new(config.enabled_endpoints()));
        let balancer = Arc::new(Balancer::new(pool, &config.balance_mode));
        AppState {
            config,
            balancer,
            registry: Arc::new(TransformerRegistry::with_builtins()),
            client: reqwest::Client::new(),
        }
    }

    #[test]
    fn test_status_snapshot() {
        let state = test_state(true);
        state.balancer.pool().endpoints()[1].mark_unhealthy(
            "down",
            None,
            std::time::Instant::now(),
        );

        let status = state.status();
        assert_eq!(status.total, 2);
        assert_eq!(status.healthy, 1);
        assert_eq!(status.unhealthy, 1);
        assert_eq!(status.endpoints.len(), 2);
        assert_eq!(status.strategy, Some("fallback"));
        let transformers = status.transformers.unwrap();
        assert!(transformers.contains(&"openai"));
        assert!(transformers.contains(&"gemini"));
        assert!(transformers.contains(&"openrouter"));
    }

    #[test]
    fn test_status_hides_transformers_when_transform_off() {
        let state = test_state(false);
        let status = state.status();
        assert!(status.transformers.is_none());
        assert!(!status.transform);
    }
}
