//! Load-balancing strategies over the endpoint pool.
//!
//! The strategy is fixed at construction for the process lifetime. Selection
//! is O(n) over the pool; the round-robin cursor is a shared atomic and its
//! races only skew distribution fairness, never correctness.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::{BalanceConfig, Strategy};
use crate::pool::{Endpoint, EndpointPool};

pub struct Balancer {
    pool: Arc<EndpointPool>,
    strategy: Strategy,
    cursor: AtomicUsize,
    min_samples: usize,
    /// Quarantine window applied on failure; `Some` iff periodic health
    /// probing is disabled (the ban is then the sole recovery mechanism).
    ban_duration: Option<Duration>,
}

impl Balancer {
    pub fn new(pool: Arc<EndpointPool>, config: &BalanceConfig) -> Self {
        let ban_duration = if config.health_check.enabled {
            None
        } else {
            Some(Duration::from_secs(config.failed_endpoint.ban_duration_seconds))
        };
        Self {
            pool,
            strategy: config.strategy,
            cursor: AtomicUsize::new(0),
            min_samples: config.speed_first.min_samples,
            ban_duration,
        }
    }

    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    pub fn pool(&self) -> &Arc<EndpointPool> {
        &self.pool
    }

    /// Pick the next endpoint under the active strategy, or `None` when no
    /// endpoint is currently selectable.
    pub fn select_next(&self) -> Option<Arc<Endpoint>> {
        self.select_at(Instant::now())
    }

    pub fn select_at(&self, now: Instant) -> Option<Arc<Endpoint>> {
        let healthy: Vec<&Arc<Endpoint>> = self
            .pool
            .endpoints()
            .iter()
            .filter(|e| e.is_selectable(now))
            .collect();
        if healthy.is_empty() {
            return None;
        }

        let chosen = match self.strategy {
            Strategy::Polling => self.round_robin(&healthy),
            Strategy::Fallback => {
                // Serve only the lowest priority group; higher orders are
                // reached when the whole group is down.
                let lowest = healthy.iter().map(|e| e.config.order).min().unwrap();
                let group: Vec<&Arc<Endpoint>> = healthy
                    .iter()
                    .filter(|e| e.config.order == lowest)
                    .copied()
                    .collect();
                self.round_robin(&group)
            }
            Strategy::SpeedFirst => {
                let qualified: Vec<&Arc<Endpoint>> = healthy
                    .iter()
                    .filter(|e| e.health().response_times.len() >= self.min_samples)
                    .copied()
                    .collect();
                if qualified.is_empty() {
                    // Not enough samples anywhere; poll so data is collected.
                    self.round_robin(&healthy)
                } else {
                    // Minimum mean; insertion order breaks ties.
                    qualified
                        .into_iter()
                        .min_by(|a, b| {
                            a.health()
                                .average_response_time
                                .total_cmp(&b.health().average_response_time)
                        })
                        .unwrap()
                        .clone()
                }
            }
        };
        Some(chosen)
    }

    fn round_robin(&self, candidates: &[&Arc<Endpoint>]) -> Arc<Endpoint> {
        let n = self.cursor.fetch_add(1, Ordering::Relaxed);
        candidates[n % candidates.len()].clone()
    }

    /// Record a successful upstream completion.
    pub fn record_success(&self, endpoint: &Endpoint, duration: Duration) {
        endpoint.record_response_time(duration);
    }

    /// Record an upstream failure (5xx or transport error).
    pub fn record_failure(&self, endpoint: &Endpoint, reason: &str) {
        endpoint.mark_unhealthy(reason, self.ban_duration, Instant::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FailedEndpointConfig, HealthCheckConfig, SpeedFirstConfig};
    use crate::pool::test_endpoint;
    use std::collections::HashMap;

    fn balance_config(strategy: Strategy, health_check_enabled: bool) -> BalanceConfig {
        BalanceConfig {
            strategy,
            health_check: HealthCheckConfig {
                enabled: health_check_enabled,
                interval_ms: 30_000,
                probe_model: None,
            },
            failed_endpoint: FailedEndpointConfig {
                ban_duration_seconds: 1,
            },
            speed_first: SpeedFirstConfig {
                response_time_window_ms: 300_000,
                min_samples: 2,
            },
        }
    }

    fn pool_of(names_orders: &[(&str, u32)]) -> Arc<EndpointPool> {
        let configs = names_orders
            .iter()
            .map(|(name, order)| test_endpoint(name, *order).config.clone())
            .collect();
        Arc::new(EndpointPool::new(configs))
    }

    #[test]
    fn test_polling_is_fair() {
        // 10*N selections land exactly 10 on each of N endpoints.
        let pool = pool_of(&[("a", 0), ("b", 0), ("c", 0)]);
        let balancer = Balancer::new(pool, &balance_config(Strategy::Polling, true));

        let mut counts: HashMap<String, usize> = HashMap::new();
        for _ in 0..30 {
            let ep = balancer.select_next().unwrap();
            *counts.entry(ep.config.name.clone()).or_insert(0) += 1;
        }
        assert_eq!(counts["a"], 10);
        assert_eq!(counts["b"], 10);
        assert_eq!(counts["c"], 10);
    }

    #[test]
    fn test_polling_round_robin_order() {
        let pool = pool_of(&[("a", 0), ("b", 0), ("c", 0)]);
        let balancer = Balancer::new(pool, &balance_config(Strategy::Polling, true));
        let picks: Vec<String> = (0..6)
            .map(|_| balancer.select_next().unwrap().config.name.clone())
            .collect();
        assert_eq!(picks, vec!["a", "b", "c", "a", "b", "c"]);
    }

    #[test]
    fn test_fallback_serves_lowest_order_group() {
        let pool = pool_of(&[("a", 0), ("b", 0), ("c", 1)]);
        let balancer = Balancer::new(pool.clone(), &balance_config(Strategy::Fallback, true));

        for _ in 0..20 {
            let ep = balancer.select_next().unwrap();
            assert_ne!(ep.config.name, "c");
        }

        // whole group down: next order takes over
        pool.endpoints()[0].mark_unhealthy("down", None, Instant::now());
        pool.endpoints()[1].mark_unhealthy("down", None, Instant::now());
        for _ in 0..5 {
            assert_eq!(balancer.select_next().unwrap().config.name, "c");
        }
    }

    #[test]
    fn test_fallback_polls_within_group() {
        let pool = pool_of(&[("a", 0), ("b", 0), ("c", 1)]);
        let balancer = Balancer::new(pool, &balance_config(Strategy::Fallback, true));
        let picks: Vec<String> = (0..4)
            .map(|_| balancer.select_next().unwrap().config.name.clone())
            .collect();
        assert_eq!(picks, vec!["a", "b", "a", "b"]);
    }

    #[test]
    fn test_speed_first_picks_minimum_mean() {
        let pool = pool_of(&[("slow", 0), ("fast", 0), ("mid", 0)]);
        for (i, millis) in [(0usize, 300u64), (1, 50), (2, 120)] {
            pool.endpoints()[i].record_response_time(Duration::from_millis(millis));
            pool.endpoints()[i].record_response_time(Duration::from_millis(millis));
        }
        let balancer = Balancer::new(pool.clone(), &balance_config(Strategy::SpeedFirst, true));

        for _ in 0..5 {
            let ep = balancer.select_next().unwrap();
            assert_eq!(ep.config.name, "fast");
            let selected_avg = ep.health().average_response_time;
            let min_avg = pool
                .endpoints()
                .iter()
                .map(|e| e.health().average_response_time)
                .fold(f64::INFINITY, f64::min);
            assert_eq!(selected_avg, min_avg);
        }
    }

    #[test]
    fn test_speed_first_falls_back_to_polling_below_min_samples() {
        let pool = pool_of(&[("a", 0), ("b", 0)]);
        // one sample each: below the min_samples=2 threshold
        pool.endpoints()[0].record_response_time(Duration::from_millis(10));
        pool.endpoints()[1].record_response_time(Duration::from_millis(500));
        let balancer = Balancer::new(pool, &balance_config(Strategy::SpeedFirst, true));

        let picks: Vec<String> = (0..4)
            .map(|_| balancer.select_next().unwrap().config.name.clone())
            .collect();
        assert_eq!(picks, vec!["a", "b", "a", "b"]);
    }

    #[test]
    fn test_all_down_returns_none() {
        let pool = pool_of(&[("a", 0), ("b", 0)]);
        let now = Instant::now();
        pool.endpoints()[0].mark_unhealthy("down", None, now);
        pool.endpoints()[1].mark_unhealthy("down", None, now);
        let balancer = Balancer::new(pool, &balance_config(Strategy::Polling, true));
        assert!(balancer.select_next().is_none());
    }

    #[test]
    fn test_ban_excludes_until_expiry() {
        // Probing disabled: failures ban for 1s, expiry readmits lazily.
        let pool = pool_of(&[("a", 0), ("b", 1)]);
        let balancer = Balancer::new(pool.clone(), &balance_config(Strategy::Fallback, false));

        let t0 = Instant::now();
        balancer.record_failure(&pool.endpoints()[0], "http 500");

        let during = balancer.select_at(t0 + Duration::from_millis(500)).unwrap();
        assert_eq!(during.config.name, "b");

        let after = balancer.select_at(t0 + Duration::from_millis(1100)).unwrap();
        assert_eq!(after.config.name, "a");
        assert!(pool.endpoints()[0].health().healthy);
    }

    #[test]
    fn test_failure_without_probing_sets_ban() {
        let pool = pool_of(&[("a", 0)]);
        let balancer = Balancer::new(pool.clone(), &balance_config(Strategy::Polling, false));
        balancer.record_failure(&pool.endpoints()[0], "connect refused");
        assert!(pool.endpoints()[0].health().banned_until.is_some());

        // with probing enabled no ban is set
        let pool2 = pool_of(&[("a", 0)]);
        let balancer2 = Balancer::new(pool2.clone(), &balance_config(Strategy::Polling, true));
        balancer2.record_failure(&pool2.endpoints()[0], "connect refused");
        assert!(pool2.endpoints()[0].health().banned_until.is_none());
    }
}
