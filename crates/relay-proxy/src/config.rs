//! Configuration types and loading logic.
//!
//! The configuration collaborator materializes a TOML file with the endpoint
//! list and the settings bundle; this module reads it once at startup and
//! layers `RELAY_`-prefixed environment variables on top.

use std::collections::HashMap;

use figment::providers::{Env, Format, Toml};
use figment::Figment;
use serde::Deserialize;

/// Top-level gateway configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct RelayConfig {
    #[serde(default)]
    pub server: ServerConfig,

    /// Upstream endpoint list, in insertion (priority tie-break) order.
    #[serde(default)]
    pub endpoints: Vec<EndpointConfig>,

    #[serde(default)]
    pub proxy_mode: ProxyModeConfig,

    #[serde(default)]
    pub balance_mode: BalanceConfig,

    /// Optional outbound HTTP/HTTPS proxy for upstream dispatch.
    #[serde(default)]
    pub proxy_url: Option<String>,

    #[serde(default)]
    pub tracing: TracingConfig,
}

/// Server listen configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen_address")]
    pub listen_address: String,
}

/// A single upstream provider endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct EndpointConfig {
    pub name: String,

    #[serde(default)]
    pub base_url: String,

    #[serde(default)]
    pub api_key: String,

    /// Model override; also used as the health-probe model when set.
    #[serde(default)]
    pub model: Option<String>,

    /// Priority group, lower first. Only meaningful under the fallback
    /// strategy.
    #[serde(default)]
    pub order: u32,

    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default)]
    pub transformer_enabled: bool,

    /// Explicit transformer name; when absent the registry matches on the
    /// endpoint's hostname.
    #[serde(default)]
    pub transformer: Option<String>,

    /// Extra headers sent with every request to this endpoint.
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

/// Feature switches for the proxy engine.
#[derive(Debug, Clone, Deserialize)]
pub struct ProxyModeConfig {
    #[serde(default = "default_true")]
    pub enable_load_balance: bool,

    #[serde(default = "default_true")]
    pub enable_transform: bool,

    #[serde(default)]
    pub verbose: bool,

    #[serde(default)]
    pub debug: bool,
}

/// Load-balancer strategy selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Strategy {
    Fallback,
    Polling,
    SpeedFirst,
}

/// Load balancing, health checking, and quarantine settings.
#[derive(Debug, Clone, Deserialize)]
pub struct BalanceConfig {
    #[serde(default = "default_strategy")]
    pub strategy: Strategy,

    #[serde(default)]
    pub health_check: HealthCheckConfig,

    #[serde(default)]
    pub failed_endpoint: FailedEndpointConfig,

    #[serde(default)]
    pub speed_first: SpeedFirstConfig,
}

/// Periodic health probing settings.
#[derive(Debug, Clone, Deserialize)]
pub struct HealthCheckConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_health_interval_ms")]
    pub interval_ms: u64,

    /// Model used in the probe body when the endpoint has no model of its
    /// own. Falls back to a legacy haiku ping.
    #[serde(default)]
    pub probe_model: Option<String>,
}

/// Ban window applied when periodic probing is disabled.
#[derive(Debug, Clone, Deserialize)]
pub struct FailedEndpointConfig {
    #[serde(default = "default_ban_duration_seconds")]
    pub ban_duration_seconds: u64,
}

/// Speed-first strategy tuning.
#[derive(Debug, Clone, Deserialize)]
pub struct SpeedFirstConfig {
    /// Accepted from the settings bundle but not enforced: trimming is by
    /// sample count, not age. See DESIGN.md.
    #[serde(default = "default_response_time_window_ms")]
    pub response_time_window_ms: u64,

    #[serde(default = "default_min_samples")]
    pub min_samples: usize,
}

/// Logging and span-export settings, handed to `relay_tracing` at startup.
#[derive(Debug, Clone, Deserialize)]
pub struct TracingConfig {
    #[serde(default = "default_service_name")]
    pub service_name: String,

    /// OTLP collector endpoint; span export is off when absent.
    #[serde(default)]
    pub otlp_endpoint: Option<String>,

    #[serde(default)]
    pub otlp_protocol: OtlpProtocol,

    #[serde(default = "default_log_level")]
    pub log_level: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OtlpProtocol {
    #[default]
    Grpc,
    Http,
}

impl TracingConfig {
    /// Materialize the bootstrap parameters for `relay_tracing`.
    pub fn options(&self) -> relay_tracing::TracingOptions {
        relay_tracing::TracingOptions {
            service_name: self.service_name.clone(),
            otlp_endpoint: self.otlp_endpoint.clone(),
            transport: match self.otlp_protocol {
                OtlpProtocol::Grpc => relay_tracing::OtlpTransport::Grpc,
                OtlpProtocol::Http => relay_tracing::OtlpTransport::Http,
            },
            log_level: self.log_level.clone(),
        }
    }
}

fn default_listen_address() -> String {
    "127.0.0.1:2333".to_string()
}

fn default_true() -> bool {
    true
}

fn default_strategy() -> Strategy {
    Strategy::Fallback
}

fn default_health_interval_ms() -> u64 {
    30_000
}

fn default_ban_duration_seconds() -> u64 {
    300
}

fn default_response_time_window_ms() -> u64 {
    300_000
}

fn default_min_samples() -> usize {
    2
}

fn default_service_name() -> String {
    "relay-proxy".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_address: default_listen_address(),
        }
    }
}

impl Default for ProxyModeConfig {
    fn default() -> Self {
        Self {
            enable_load_balance: true,
            enable_transform: true,
            verbose: false,
            debug: false,
        }
    }
}

impl Default for BalanceConfig {
    fn default() -> Self {
        Self {
            strategy: default_strategy(),
            health_check: HealthCheckConfig::default(),
            failed_endpoint: FailedEndpointConfig::default(),
            speed_first: SpeedFirstConfig::default(),
        }
    }
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: default_health_interval_ms(),
            probe_model: None,
        }
    }
}

impl Default for FailedEndpointConfig {
    fn default() -> Self {
        Self {
            ban_duration_seconds: default_ban_duration_seconds(),
        }
    }
}

impl Default for SpeedFirstConfig {
    fn default() -> Self {
        Self {
            response_time_window_ms: default_response_time_window_ms(),
            min_samples: default_min_samples(),
        }
    }
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            service_name: default_service_name(),
            otlp_endpoint: None,
            otlp_protocol: OtlpProtocol::default(),
            log_level: default_log_level(),
        }
    }
}

impl RelayConfig {
    /// Load configuration from a TOML file and environment variables.
    ///
    /// Priority (highest to lowest):
    /// 1. Environment variables (RELAY_ prefix, __ for nesting)
    /// 2. TOML config file
    /// 3. Defaults
    pub fn load(config_path: &str) -> anyhow::Result<Self> {
        let config: RelayConfig = Figment::new()
            .merge(Toml::file(config_path))
            .merge(Env::prefixed("RELAY_").split("__"))
            .extract()?;
        Ok(config)
    }

    /// Endpoints that are enabled, in configured order.
    pub fn enabled_endpoints(&self) -> Vec<EndpointConfig> {
        self.endpoints
            .iter()
            .filter(|e| e.enabled)
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config: RelayConfig = Figment::new()
            .merge(Toml::string(""))
            .extract()
            .unwrap();
        assert_eq!(config.server.listen_address, "127.0.0.1:2333");
        assert!(config.proxy_mode.enable_load_balance);
        assert!(config.proxy_mode.enable_transform);
        assert_eq!(config.balance_mode.strategy, Strategy::Fallback);
        assert!(config.balance_mode.health_check.enabled);
        assert_eq!(config.balance_mode.health_check.interval_ms, 30_000);
        assert_eq!(config.balance_mode.speed_first.min_samples, 2);
        assert!(config.endpoints.is_empty());
    }

    #[test]
    fn test_endpoint_list_parses() {
        let toml = r#"
            [[endpoints]]
            name = "openai-main"
            base_url = "https://api.openai.com"
            api_key = "sk-test"
            model = "gpt-4o"
            order = 0
            transformer_enabled = true

            [[endpoints]]
            name = "backup"
            base_url = "https://fallback.example.com"
            api_key = "key2"
            order = 1
            enabled = false

            [balance_mode]
            strategy = "speed-first"

            [balance_mode.speed_first]
            min_samples = 3
        "#;
        let config: RelayConfig = Figment::new()
            .merge(Toml::string(toml))
            .extract()
            .unwrap();
        assert_eq!(config.endpoints.len(), 2);
        assert_eq!(config.endpoints[0].name, "openai-main");
        assert!(config.endpoints[0].transformer_enabled);
        assert_eq!(config.endpoints[0].model.as_deref(), Some("gpt-4o"));
        assert_eq!(config.balance_mode.strategy, Strategy::SpeedFirst);
        assert_eq!(config.balance_mode.speed_first.min_samples, 3);

        // Disabled endpoints are filtered out of the serving set.
        let enabled = config.enabled_endpoints();
        assert_eq!(enabled.len(), 1);
        assert_eq!(enabled[0].name, "openai-main");
    }

    #[test]
    fn test_tracing_section() {
        let config: RelayConfig = Figment::new()
            .merge(Toml::string(""))
            .extract()
            .unwrap();
        assert_eq!(config.tracing.service_name, "relay-proxy");
        assert_eq!(config.tracing.log_level, "info");
        assert!(config.tracing.otlp_endpoint.is_none());

        let toml = r#"
            [tracing]
            service_name = "edge-relay"
            otlp_endpoint = "http://localhost:4317"
            otlp_protocol = "http"
            log_level = "relay_proxy=debug,info"
        "#;
        let config: RelayConfig = Figment::new()
            .merge(Toml::string(toml))
            .extract()
            .unwrap();
        let options = config.tracing.options();
        assert_eq!(options.service_name, "edge-relay");
        assert_eq!(
            options.otlp_endpoint.as_deref(),
            Some("http://localhost:4317")
        );
        assert_eq!(options.transport, relay_tracing::OtlpTransport::Http);
        assert_eq!(options.log_level, "relay_proxy=debug,info");
    }

    #[test]
    fn test_strategy_names() {
        for (name, expected) in [
            ("fallback", Strategy::Fallback),
            ("polling", Strategy::Polling),
            ("speed-first", Strategy::SpeedFirst),
        ] {
            let toml = format!("[balance_mode]\nstrategy = \"{name}\"");
            let config: RelayConfig = Figment::new()
                .merge(Toml::string(&toml))
                .extract()
                .unwrap();
            assert_eq!(config.balance_mode.strategy, expected);
        }
    }
}
