//! OpenRouter transformer.
//!
//! OpenRouter speaks OpenAI chat-completions with a few wrinkles: prompt
//! caching markers are only understood for claude models, image parts must
//! be real URLs or data URLs, and streamed reasoning arrives under a
//! `reasoning` key with unreliable tool-call ids.

use std::collections::HashMap;

use http::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde_json::{json, Value};
use uuid::Uuid;

use super::{effective_model, Dispatch, TransformError, Transformer};
use crate::config::EndpointConfig;
use crate::convert::anthropic_to_openai::anthropic_to_openai;
use crate::convert::sse::ChunkRewriter;
use crate::convert::types::MessagesRequest;

pub const DEFAULT_BASE_URL: &str = "https://openrouter.ai/api";

pub struct OpenRouterTransformer;

impl Transformer for OpenRouterTransformer {
    fn name(&self) -> &'static str {
        "openrouter"
    }

    fn domain(&self) -> &'static str {
        "openrouter.ai"
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
        let model = effective_model(req, endpoint).to_string();
        if model.is_empty() {
            return Err(TransformError::MissingModel("openrouter"));
        }
        let mut body =
            anthropic_to_openai(req).map_err(|e| TransformError::Schema(e.to_string()))?;
        body["model"] = json!(model);

        let is_claude = model.contains("claude");
        if let Some(messages) = body.get_mut("messages").and_then(|m| m.as_array_mut()) {
            for message in messages {
                let Some(parts) = message.get_mut("content").and_then(|c| c.as_array_mut())
                else {
                    continue;
                };
                for part in parts {
                    if !is_claude {
                        if let Some(obj) = part.as_object_mut() {
                            obj.remove("cache_control");
                        }
                    }
                    inline_image_part(part);
                }
            }
        }
        Ok(body)
    }

    fn chunk_rewriter(&self) -> Option<ChunkRewriter> {
        let mut saw_tool_call = false;
        let mut id_by_index: HashMap<u64, String> = HashMap::new();

        Some(Box::new(move |chunk: &mut Value| {
            let Some(choice) = chunk
                .get_mut("choices")
                .and_then(|c| c.as_array_mut())
                .and_then(|c| c.first_mut())
            else {
                return;
            };

            if let Some(delta) = choice.get_mut("delta").and_then(|d| d.as_object_mut()) {
                // reasoning deltas stream under `reasoning`; re-tag so the
                // converter opens a thinking block
                if let Some(reasoning) = delta.remove("reasoning") {
                    if reasoning.is_string() {
                        delta.insert("thinking".to_string(), reasoning);
                    }
                }
                if let Some(tool_calls) = delta
                    .get_mut("tool_calls")
                    .and_then(|tc| tc.as_array_mut())
                {
                    for tc in tool_calls {
                        saw_tool_call = true;
                        let index = tc.get("index").and_then(|i| i.as_u64()).unwrap_or(0);
                        let id = tc.get("id").and_then(|i| i.as_str());
                        // index echoes and absent ids get a stable synthetic
                        // id per tool call
                        if id.is_none_or(|id| id.chars().all(|c| c.is_ascii_digit())) {
                            let assigned = id_by_index
                                .entry(index)
                                .or_insert_with(|| format!("call_{}", Uuid::new_v4().simple()))
                                .clone();
                            tc["id"] = json!(assigned);
                        }
                    }
                }
            }

            if saw_tool_call {
                if let Some(reason) = choice.get_mut("finish_reason") {
                    if reason.as_str().is_some() {
                        *reason = json!("tool_calls");
                    }
                }
            }
        }))
    }
}

/// Inline non-http `image_url` parts as data URLs using the carried
/// media_type, then drop the carrier key.
fn inline_image_part(part: &mut Value) {
    if part.get("type").and_then(|t| t.as_str()) != Some("image_url") {
        return;
    }
    let media_type = part
        .get("media_type")
        .and_then(|m| m.as_str())
        .unwrap_or("image/png")
        .to_string();
    if let Some(url) = part.pointer("/image_url/url").and_then(|u| u.as_str()) {
        if !url.starts_with("http") && !url.starts_with("data:") {
            let inlined = format!("data:{media_type};base64,{url}");
            part["image_url"]["url"] = json!(inlined);
        }
    }
    part.as_object_mut().map(|o| o.remove("media_type"));
}
