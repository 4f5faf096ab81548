//! OpenAI chat-completions transformer. The registry default.

use http::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde_json::Value;

use super::{effective_model, Dispatch, TransformError, Transformer};
use crate::config::EndpointConfig;
use crate::convert::anthropic_to_openai::anthropic_to_openai;
use crate::convert::types::MessagesRequest;

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com";

pub struct OpenAiTransformer;

impl Transformer for OpenAiTransformer {
    fn name(&self) -> &'static str {
        "openai"
    }

    fn domain(&self) -> &'static str {
        "api.openai.com"
    }

    fn is_default(&self) -> bool {
        true
    }

    fn normalize_request(
        &self,
        _req: &MessagesRequest,
        endpoint: &EndpointConfig,
    ) -> Result<Dispatch, TransformError> {
        let base = if endpoint.base_url.is_empty() {
            DEFAULT_BASE_URL
        } else {
            endpoint.base_url.trim_end_matches('/')
        };
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", endpoint.api_key))
                .map_err(|e| TransformError::Schema(e.to_string()))?,
        );
        Ok(Dispatch {
            url: format!("{base}/v1/chat/completions"),
            headers,
        })
    }

    fn format_request(
        &self,
        req: &MessagesRequest,
        endpoint: &EndpointConfig,
    ) -> Result<Value, TransformError> {
        let model = effective_model(req, endpoint);
        if model.is_empty() {
            return Err(TransformError::MissingModel("openai"));
        }
        let mut body =
            anthropic_to_openai(req).map_err(|e| TransformError::Schema(e.to_string()))?;
        body["model"] = Value::String(model.to_string());
        Ok(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transform::testutil::{endpoint, request};

    #[test]
    fn test_normalize_targets_chat_completions() {
        let t = OpenAiTransformer;
        let ep = endpoint("oai", "https://api.openai.com");
        let dispatch = t.normalize_request(&request("gpt-4o", false), &ep).unwrap();
        assert_eq!(dispatch.url, "https://api.openai.com/v1/chat/completions");
        assert_eq!(
            dispatch.headers.get(AUTHORIZATION).unwrap(),
            "Bearer test-key"
        );
    }

    #[test]
    fn test_normalize_falls_back_to_default_base() {
        let t = OpenAiTransformer;
        let ep = endpoint("oai", "");
        let dispatch = t.normalize_request(&request("gpt-4o", false), &ep).unwrap();
        assert_eq!(dispatch.url, "https://api.openai.com/v1/chat/completions");
    }

    #[test]
    fn test_format_request_projects_body() {
        let t = OpenAiTransformer;
        let ep = endpoint("oai", "https://api.openai.com");
        let body = t.format_request(&request("gpt-4o", true), &ep).unwrap();
        assert_eq!(body["model"], "gpt-4o");
        assert_eq!(body["stream"], true);
        assert_eq!(body["messages"][0]["role"], "user");
        assert_eq!(body["messages"][0]["content"], "hi");
    }

    #[test]
    fn test_endpoint_model_overrides() {
        let t = OpenAiTransformer;
        let mut ep = endpoint("oai", "https://api.openai.com");
        ep.model = Some("gpt-4o-mini".to_string());
        let body = t.format_request(&request("gpt-4o", false), &ep).unwrap();
        assert_eq!(body["model"], "gpt-4o-mini");
    }

    #[test]
    fn test_missing_model_is_an_error() {
        let t = OpenAiTransformer;
        let ep = endpoint("oai", "https://api.openai.com");
        let err = t.format_request(&request("", false), &ep).unwrap_err();
        assert!(matches!(err, TransformError::MissingModel("openai")));
    }
}
