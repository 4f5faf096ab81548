//! Transformer registry and the provider transformer contract.
//!
//! A transformer adapts the Anthropic-shaped intermediate request to one
//! provider's native shape and back. Capabilities are composed, not
//! inherited: `format_response` and the stream-chunk rewriter have
//! passthrough defaults and only providers that need them implement them.

pub mod gemini;
pub mod openai;
pub mod openrouter;

use std::sync::Arc;

use bytes::Bytes;
use http::HeaderMap;
use serde_json::Value;
use thiserror::Error;

use crate::config::EndpointConfig;
use crate::convert::sse::ChunkRewriter;
use crate::convert::types::MessagesRequest;

#[derive(Debug, Error)]
pub enum TransformError {
    #[error("model is required for {0} requests")]
    MissingModel(&'static str),

    #[error("{0}")]
    Schema(String),
}

/// Dispatch envelope produced by `normalize_request`: the target URL and
/// auth headers, ready for HTTP. The body stays in intermediate shape until
/// `format_request`.
pub struct Dispatch {
    pub url: String,
    pub headers: HeaderMap,
}

pub trait Transformer: Send + Sync {
    fn name(&self) -> &'static str;

    /// Hostname this transformer claims.
    fn domain(&self) -> &'static str;

    /// Fallback transformer when no domain matches. At most one.
    fn is_default(&self) -> bool {
        false
    }

    /// Build the dispatch envelope (target URL, auth headers).
    fn normalize_request(
        &self,
        req: &MessagesRequest,
        endpoint: &EndpointConfig,
    ) -> Result<Dispatch, TransformError>;

    /// Shape the body for the provider.
    fn format_request(
        &self,
        req: &MessagesRequest,
        endpoint: &EndpointConfig,
    ) -> Result<Value, TransformError>;

    /// Rewrite a buffered upstream body before universal normalization.
    fn format_response(&self, _status: u16, body: Bytes) -> Result<Bytes, TransformError> {
        Ok(body)
    }

    /// Per-stream rewriter applied to each parsed SSE chunk before the
    /// OpenAI->Anthropic conversion.
    fn chunk_rewriter(&self) -> Option<ChunkRewriter> {
        None
    }
}

/// Name-keyed transformer map with host-based discovery.
pub struct TransformerRegistry {
    entries: Vec<Arc<dyn Transformer>>,
}

impl TransformerRegistry {
    /// Registry with the built-in provider set.
    pub fn with_builtins() -> Self {
        Self {
            entries: vec![
                Arc::new(openai::OpenAiTransformer),
                Arc::new(openrouter::OpenRouterTransformer),
                Arc::new(gemini::GeminiTransformer),
            ],
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Transformer>> {
        self.entries.iter().find(|t| t.name() == name).cloned()
    }

    pub fn default_transformer(&self) -> Option<Arc<dyn Transformer>> {
        self.entries.iter().find(|t| t.is_default()).cloned()
    }

    /// Discovery order: exact host match, then substring match in either
    /// direction (handles `api.openrouter.ai` vs `openrouter.ai`), then the
    /// sole default.
    pub fn find_for_host(&self, host: &str) -> Option<Arc<dyn Transformer>> {
        if let Some(exact) = self.entries.iter().find(|t| t.domain() == host) {
            return Some(exact.clone());
        }
        if let Some(fuzzy) = self
            .entries
            .iter()
            .find(|t| host.contains(t.domain()) || t.domain().contains(host))
        {
            return Some(fuzzy.clone());
        }
        self.default_transformer()
    }

    /// Resolve for an endpoint: explicit hint first, then its hostname.
    pub fn resolve(&self, endpoint: &EndpointConfig) -> Option<Arc<dyn Transformer>> {
        if let Some(hint) = endpoint.transformer.as_deref() {
            if let Some(t) = self.get(hint) {
                return Some(t);
            }
            tracing::warn!(
                endpoint = %endpoint.name,
                transformer = %hint,
                "unknown transformer hint, falling back to host match"
            );
        }
        self.find_for_host(host_of(&endpoint.base_url))
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.entries.iter().map(|t| t.name()).collect()
    }
}

/// Hostname of a URL, without scheme, port, or path.
pub fn host_of(url: &str) -> &str {
    let without_scheme = url
        .trim_start_matches("https://")
        .trim_start_matches("http://");
    let host_port = without_scheme.split('/').next().unwrap_or(without_scheme);
    host_port.split(':').next().unwrap_or(host_port)
}

/// Effective model for a request against an endpoint: the endpoint override
/// wins, the client's model otherwise.
pub(crate) fn effective_model<'a>(req: &'a MessagesRequest, endpoint: &'a EndpointConfig) -> &'a str {
    endpoint.model.as_deref().unwrap_or(&req.model)
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_of() {
        assert_eq!(host_of("https://api.openai.com/v1"), "api.openai.com");
        assert_eq!(host_of("http://localhost:8080/x"), "localhost");
        assert_eq!(host_of("openrouter.ai"), "openrouter.ai");
    }

    #[test]
    fn test_exact_host_match() {
        let registry = TransformerRegistry::with_builtins();
        let t = registry.find_for_host("openrouter.ai").unwrap();
        assert_eq!(t.name(), "openrouter");
        let t = registry
            .find_for_host("generativelanguage.googleapis.com")
            .unwrap();
        assert_eq!(t.name(), "gemini");
    }

    #[test]
    fn test_substring_match_both_directions() {
        let registry = TransformerRegistry::with_builtins();
        // host is longer than the claimed domain
        let t = registry.find_for_host("api.openrouter.ai").unwrap();
        assert_eq!(t.name(), "openrouter");
        // host is a shortened form of the claimed domain
        let t = registry.find_for_host("openai.com").unwrap();
        assert_eq!(t.name(), "openai");
    }

    #[test]
    fn test_unknown_host_gets_default() {
        let registry = TransformerRegistry::with_builtins();
        let t = registry.find_for_host("llm.mycorp.internal").unwrap();
        assert_eq!(t.name(), "openai");
        assert!(t.is_default());
    }

    #[test]
    fn test_single_default() {
        let registry = TransformerRegistry::with_builtins();
        let defaults = registry
            .names()
            .into_iter()
            .map(|n| registry.get(n).unwrap().is_default())
            .filter(|d| *d)
            .count();
        assert_eq!(defaults, 1);
    }

    #[test]
    fn test_resolve_prefers_hint() {
        let registry = TransformerRegistry::with_builtins();
        let mut ep = testutil::endpoint("e", "https://api.openai.com");
        ep.transformer = Some("gemini".to_string());
        assert_eq!(registry.resolve(&ep).unwrap().name(), "gemini");

        // bad hint falls back to host discovery
        ep.transformer = Some("nonexistent".to_string());
        assert_eq!(registry.resolve(&ep).unwrap().name(), "openai");
    }
}
