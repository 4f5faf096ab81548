//! Endpoint pool: per-endpoint config plus atomically-swapped health state.
//!
//! Health state is a snapshot behind `ArcSwap`: readers load a consistent
//! record without locking, writers copy-update through `rcu`. Request
//! handlers and the health prober share the same endpoints.

use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use serde::Serialize;

use crate::config::EndpointConfig;

/// Sample window high-water mark; trimmed down to [`TRIM_TO`] when exceeded.
const MAX_SAMPLES: usize = 100;
const TRIM_TO: usize = 50;

/// Mutable health and timing state for one endpoint.
#[derive(Debug, Clone)]
pub struct EndpointHealth {
    pub healthy: bool,
    pub failure_count: u32,
    pub last_error: Option<String>,
    pub last_check_at: Option<Instant>,
    /// Quarantine deadline; set only when periodic probing is disabled.
    pub banned_until: Option<Instant>,
    /// Most recent response times, milliseconds.
    pub response_times: Vec<u64>,
    /// Arithmetic mean of `response_times`; 0 when empty.
    pub average_response_time: f64,
    pub total_requests: u64,
}

impl Default for EndpointHealth {
    fn default() -> Self {
        Self {
            healthy: true,
            failure_count: 0,
            last_error: None,
            last_check_at: None,
            banned_until: None,
            response_times: Vec::new(),
            average_response_time: 0.0,
            total_requests: 0,
        }
    }
}

/// One configured upstream endpoint with its shared health state.
pub struct Endpoint {
    pub config: EndpointConfig,
    state: ArcSwap<EndpointHealth>,
}

impl Endpoint {
    pub fn new(config: EndpointConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            state: ArcSwap::from_pointee(EndpointHealth::default()),
        })
    }

    /// Consistent snapshot of the current health state.
    pub fn health(&self) -> Arc<EndpointHealth> {
        self.state.load_full()
    }

    fn update(&self, f: impl Fn(&mut EndpointHealth)) {
        self.state.rcu(|current| {
            let mut next = (**current).clone();
            f(&mut next);
            Arc::new(next)
        });
    }

    /// Clear failure bookkeeping and any ban.
    pub fn mark_healthy(&self) {
        self.update(|s| {
            s.healthy = true;
            s.failure_count = 0;
            s.last_error = None;
            s.banned_until = None;
        });
    }

    /// Record a failure. `ban` is the quarantine window applied when periodic
    /// probing is disabled; with probing enabled the prober is the recovery
    /// path and no ban is set.
    pub fn mark_unhealthy(&self, reason: &str, ban: Option<Duration>, now: Instant) {
        let reason = reason.to_string();
        self.update(|s| {
            s.healthy = false;
            s.failure_count += 1;
            s.last_error = Some(reason.clone());
            if let Some(duration) = ban {
                s.banned_until = Some(now + duration);
            }
        });
    }

    /// Append a response-time sample and recompute the mean.
    pub fn record_response_time(&self, duration: Duration) {
        let millis = duration.as_millis() as u64;
        self.update(|s| {
            s.response_times.push(millis);
            if s.response_times.len() > MAX_SAMPLES {
                let excess = s.response_times.len() - TRIM_TO;
                s.response_times.drain(..excess);
            }
            s.average_response_time = if s.response_times.is_empty() {
                0.0
            } else {
                s.response_times.iter().sum::<u64>() as f64 / s.response_times.len() as f64
            };
        });
    }

    /// Count one proxied request against this endpoint.
    pub fn note_request(&self) {
        self.update(|s| s.total_requests += 1);
    }

    pub fn note_checked(&self, now: Instant) {
        self.update(|s| s.last_check_at = Some(now));
    }

    /// Whether the selector may return this endpoint at `now`.
    ///
    /// Ban expiry is lazy: an expired ban is cleared here and the endpoint
    /// comes back healthy on the same inspection.
    pub fn is_selectable(&self, now: Instant) -> bool {
        let health = self.state.load();
        if let Some(until) = health.banned_until {
            if until <= now {
                self.mark_healthy();
                return true;
            }
            return false;
        }
        health.healthy
    }
}

/// Ordered endpoint list shared by the balancer and the prober.
pub struct EndpointPool {
    endpoints: Vec<Arc<Endpoint>>,
}

impl EndpointPool {
    pub fn new(configs: Vec<EndpointConfig>) -> Self {
        Self {
            endpoints: configs.into_iter().map(Endpoint::new).collect(),
        }
    }

    pub fn endpoints(&self) -> &[Arc<Endpoint>] {
        &self.endpoints
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    pub fn healthy_count(&self) -> usize {
        let now = Instant::now();
        self.endpoints
            .iter()
            .filter(|e| e.is_selectable(now))
            .count()
    }

    /// Per-endpoint status rows for the status query.
    pub fn status_rows(&self) -> Vec<EndpointStatus> {
        let now = Instant::now();
        self.endpoints
            .iter()
            .map(|e| {
                let health = e.health();
                EndpointStatus {
                    name: e.config.name.clone(),
                    healthy: health.healthy,
                    failure_count: health.failure_count,
                    last_error: health.last_error.clone(),
                    banned: health.banned_until.is_some_and(|until| until > now),
                    average_response_time_ms: health.average_response_time,
                    total_requests: health.total_requests,
                }
            })
            .collect()
    }
}

/// One row of the status query.
#[derive(Debug, Clone, Serialize)]
pub struct EndpointStatus {
    pub name: String,
    pub healthy: bool,
    pub failure_count: u32,
    pub last_error: Option<String>,
    pub banned: bool,
    pub average_response_time_ms: f64,
    pub total_requests: u64,
}

#[cfg(test)]
pub(crate) fn test_endpoint(name: &str, order: u32) -> Arc<Endpoint> {
    Endpoint::new(EndpointConfig {
        name: name.to_string(),
        base_url: format!("https://{name}.example.com"),
        api_key: "key".to_string(),
        model: None,
        order,
        enabled: true,
        transformer_enabled: false,
        transformer: None,
        headers: Default::default(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mean_tracks_samples() {
        let ep = test_endpoint("a", 0);
        assert_eq!(ep.health().average_response_time, 0.0);

        ep.record_response_time(Duration::from_millis(100));
        ep.record_response_time(Duration::from_millis(300));
        let health = ep.health();
        assert_eq!(health.response_times, vec![100, 300]);
        assert_eq!(health.average_response_time, 200.0);
    }

    #[test]
    fn test_window_trims_to_recent_half() {
        let ep = test_endpoint("a", 0);
        for i in 0..101u64 {
            ep.record_response_time(Duration::from_millis(i));
        }
        let health = ep.health();
        assert_eq!(health.response_times.len(), TRIM_TO);
        // most recent samples survive: 51..=100
        assert_eq!(*health.response_times.first().unwrap(), 51);
        assert_eq!(*health.response_times.last().unwrap(), 100);
        let expected = (51..=100).sum::<u64>() as f64 / 50.0;
        assert_eq!(health.average_response_time, expected);
    }

    #[test]
    fn test_unhealthy_then_recovered() {
        let ep = test_endpoint("a", 0);
        let now = Instant::now();

        ep.mark_unhealthy("boom", None, now);
        let health = ep.health();
        assert!(!health.healthy);
        assert_eq!(health.failure_count, 1);
        assert_eq!(health.last_error.as_deref(), Some("boom"));
        assert!(!ep.is_selectable(now));

        ep.mark_healthy();
        let health = ep.health();
        assert!(health.healthy);
        assert_eq!(health.failure_count, 0);
        assert!(health.last_error.is_none());
        assert!(ep.is_selectable(now));
    }

    #[test]
    fn test_ban_expiry_is_lazy() {
        let ep = test_endpoint("a", 0);
        let t0 = Instant::now();

        ep.mark_unhealthy("http 502", Some(Duration::from_secs(1)), t0);
        assert!(!ep.is_selectable(t0 + Duration::from_millis(500)));

        // first inspection past the deadline clears the ban and heals
        assert!(ep.is_selectable(t0 + Duration::from_millis(1100)));
        let health = ep.health();
        assert!(health.healthy);
        assert!(health.banned_until.is_none());
        assert_eq!(health.failure_count, 0);
    }

    #[test]
    fn test_no_ban_when_probing_enabled() {
        let ep = test_endpoint("a", 0);
        ep.mark_unhealthy("boom", None, Instant::now());
        assert!(ep.health().banned_until.is_none());
    }

    #[test]
    fn test_failure_count_accumulates() {
        let ep = test_endpoint("a", 0);
        let now = Instant::now();
        ep.mark_unhealthy("one", None, now);
        ep.mark_unhealthy("two", None, now);
        let health = ep.health();
        assert_eq!(health.failure_count, 2);
        assert_eq!(health.last_error.as_deref(), Some("two"));
    }

    #[test]
    fn test_status_rows() {
        let pool = EndpointPool::new(vec![
            test_endpoint("a", 0).config.clone(),
            test_endpoint("b", 1).config.clone(),
        ]);
        pool.endpoints()[1].mark_unhealthy("down", None, Instant::now());
        pool.endpoints()[0].note_request();

        let rows = pool.status_rows();
        assert_eq!(rows.len(), 2);
        assert!(rows[0].healthy);
        assert_eq!(rows[0].total_requests, 1);
        assert!(!rows[1].healthy);
        assert_eq!(pool.healthy_count(), 1);
    }
}
