//! Endpoint health probing.
//!
//! Two modes: initial probes gate serving at startup (15 s timeout, every
//! endpoint under speed-first, first-healthy-suffices otherwise), and the
//! periodic prober revisits unhealthy endpoints while serving (10 s timeout).
//! The caller owns the periodic loop; [`run_probe_round`] performs a single
//! round.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::stream::{self, StreamExt};
use serde_json::{json, Value};

use crate::config::{HealthCheckConfig, Strategy};
use crate::pool::{Endpoint, EndpointPool};

/// Legacy ping model used when neither the endpoint nor the health-check
/// config names one.
pub const DEFAULT_PROBE_MODEL: &str = "claude-3-haiku-20241022";

const INITIAL_PROBE_TIMEOUT: Duration = Duration::from_secs(15);
const PERIODIC_PROBE_TIMEOUT: Duration = Duration::from_secs(10);
const PROBE_CONCURRENCY: usize = 8;

/// Minimal Messages-shaped ping body.
fn probe_body(endpoint: &Endpoint, config: &HealthCheckConfig) -> Value {
    let model = endpoint
        .config
        .model
        .as_deref()
        .or(config.probe_model.as_deref())
        .unwrap_or(DEFAULT_PROBE_MODEL);
    json!({
        "model": model,
        "max_tokens": 10,
        "messages": [{"role": "user", "content": "ping"}]
    })
}

/// Whether the periodic prober should revisit this endpoint now.
fn due_for_probe(endpoint: &Endpoint, now: Instant, interval: Duration) -> bool {
    let health = endpoint.health();
    if health.healthy {
        return false;
    }
    match health.last_check_at {
        Some(at) => now.duration_since(at) >= interval,
        None => true,
    }
}

/// Issue one probe. Any response with status < 500 counts healthy.
async fn probe_once(
    client: &reqwest::Client,
    endpoint: &Endpoint,
    config: &HealthCheckConfig,
    timeout: Duration,
) -> Result<Duration, String> {
    let url = format!(
        "{}/v1/messages",
        endpoint.config.base_url.trim_end_matches('/')
    );
    let start = Instant::now();
    let result = client
        .post(&url)
        .timeout(timeout)
        .header("content-type", "application/json")
        .header("x-api-key", &endpoint.config.api_key)
        .json(&probe_body(endpoint, config))
        .send()
        .await;

    match result {
        Ok(resp) if resp.status().as_u16() < 500 => Ok(start.elapsed()),
        Ok(resp) => Err(format!("http {}", resp.status().as_u16())),
        Err(e) => Err(e.to_string()),
    }
}

/// Probe every endpoint before serving traffic.
///
/// Successful probes seed the response-time window so speed-first has data
/// to rank on. Under speed-first the full round completes; under the other
/// strategies probing stops at the first healthy endpoint.
pub async fn run_initial_probes(
    pool: &EndpointPool,
    client: &reqwest::Client,
    config: &HealthCheckConfig,
    strategy: Strategy,
) {
    let probe_all = strategy == Strategy::SpeedFirst;

    let mut probes = stream::iter(pool.endpoints().iter().cloned())
        .map(|endpoint| {
            let client = client.clone();
            let config = config.clone();
            async move {
                let outcome = probe_once(&client, &endpoint, &config, INITIAL_PROBE_TIMEOUT).await;
                (endpoint, outcome)
            }
        })
        .buffer_unordered(PROBE_CONCURRENCY);

    while let Some((endpoint, outcome)) = probes.next().await {
        let span = relay_tracing::health_probe_span!(&endpoint.config.name, "initial");
        let _guard = span.enter();
        endpoint.note_checked(Instant::now());
        match outcome {
            Ok(latency) => {
                span.record("healthy", true);
                span.record("latency_ms", latency.as_millis() as u64);
                endpoint.mark_healthy();
                endpoint.record_response_time(latency);
                tracing::info!(endpoint = %endpoint.config.name, "initial probe healthy");
                if !probe_all {
                    break;
                }
            }
            Err(reason) => {
                span.record("healthy", false);
                tracing::warn!(
                    endpoint = %endpoint.config.name,
                    reason = %reason,
                    "initial probe failed"
                );
                endpoint.mark_unhealthy(&reason, None, Instant::now());
            }
        }
    }
}

/// Run a single round of periodic checks against due unhealthy endpoints.
pub async fn run_probe_round(
    pool: &EndpointPool,
    client: &reqwest::Client,
    config: &HealthCheckConfig,
) {
    let interval = Duration::from_millis(config.interval_ms);
    let now = Instant::now();
    let due: Vec<Arc<Endpoint>> = pool
        .endpoints()
        .iter()
        .filter(|e| due_for_probe(e, now, interval))
        .cloned()
        .collect();
    if due.is_empty() {
        return;
    }

    stream::iter(due)
        .map(|endpoint| {
            let client = client.clone();
            let config = config.clone();
            async move {
                let outcome =
                    probe_once(&client, &endpoint, &config, PERIODIC_PROBE_TIMEOUT).await;
                endpoint.note_checked(Instant::now());
                match outcome {
                    Ok(_) => {
                        tracing::info!(endpoint = %endpoint.config.name, "endpoint recovered");
                        endpoint.mark_healthy();
                    }
                    Err(reason) => {
                        tracing::debug!(
                            endpoint = %endpoint.config.name,
                            reason = %reason,
                            "periodic probe failed"
                        );
                    }
                }
            }
        })
        .buffer_unordered(PROBE_CONCURRENCY)
        .collect::<()>()
        .await;
}

/// Periodic prober loop; runs until the task is dropped at shutdown.
pub async fn run_periodic_probes(
    pool: Arc<EndpointPool>,
    client: reqwest::Client,
    config: HealthCheckConfig,
) {
    let interval = Duration::from_millis(config.interval_ms);
    loop {
        tokio::time::sleep(interval).await;
        run_probe_round(&pool, &client, &config).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EndpointConfig;
    use crate::pool::test_endpoint;

    fn health_config(probe_model: Option<&str>) -> HealthCheckConfig {
        HealthCheckConfig {
            enabled: true,
            interval_ms: 30_000,
            probe_model: probe_model.map(String::from),
        }
    }

    #[test]
    fn test_probe_body_model_precedence() {
        // endpoint model wins, then the configured probe model, then legacy
        let ep = test_endpoint("a", 0);
        let body = probe_body(&ep, &health_config(None));
        assert_eq!(body["model"], DEFAULT_PROBE_MODEL);
        assert_eq!(body["max_tokens"], 10);
        assert_eq!(body["messages"][0]["content"], "ping");

        let body = probe_body(&ep, &health_config(Some("probe-model")));
        assert_eq!(body["model"], "probe-model");

        let with_model = crate::pool::Endpoint::new(EndpointConfig {
            model: Some("endpoint-model".into()),
            ..ep.config.clone()
        });
        let body = probe_body(&with_model, &health_config(Some("probe-model")));
        assert_eq!(body["model"], "endpoint-model");
    }

    #[test]
    fn test_due_for_probe_gating() {
        let interval = Duration::from_secs(30);
        let now = Instant::now();
        let ep = test_endpoint("a", 0);

        // healthy endpoints are never probed periodically
        assert!(!due_for_probe(&ep, now, interval));

        ep.mark_unhealthy("down", None, now);
        assert!(due_for_probe(&ep, now, interval));

        // just checked: not due until the interval elapses
        ep.note_checked(now);
        assert!(!due_for_probe(&ep, now + Duration::from_secs(10), interval));
        assert!(due_for_probe(&ep, now + Duration::from_secs(30), interval));
    }
}
