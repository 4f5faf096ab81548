//! Gemini (generativelanguage) transformer.
//!
//! Gemini's surface differs structurally from chat completions: the model
//! lives in the URL, roles are `user`/`model`, message content is `parts`,
//! and tool definitions are `functionDeclarations` with a restricted
//! parameter-schema vocabulary. Responses are rewritten into
//! chat-completions shape and flow through universal normalization like any
//! other OpenAI-shaped body.

use http::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use serde_json::{json, Map, Value};
use uuid::Uuid;

use super::{effective_model, Dispatch, TransformError, Transformer};
use crate::config::EndpointConfig;
use crate::convert::sse::ChunkRewriter;
use crate::convert::types::{ContentBlock, MessageContent, MessagesRequest, Role};

pub const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com";

/// Parameter-schema keys Gemini accepts in function declarations; everything
/// else is pruned.
const SCHEMA_KEYS: &[&str] = &[
    "type",
    "format",
    "title",
    "description",
    "nullable",
    "enum",
    "maxItems",
    "minItems",
    "properties",
    "required",
    "items",
    "minimum",
    "maximum",
];

pub struct GeminiTransformer;

impl Transformer for GeminiTransformer {
    fn name(&self) -> &'static str {
        "gemini"
    }

    fn domain(&self) -> &'static str {
        "generativelanguage.googleapis.com"
    }

    fn normalize_request(
        &self,
        req: &MessagesRequest,
        endpoint: &EndpointConfig,
    ) -> Result<Dispatch, TransformError> {
        let model = effective_model(req, endpoint);
        if model.is_empty() {
            return Err(TransformError::MissingModel("gemini"));
        }
        let base = if endpoint.base_url.is_empty() {
            DEFAULT_BASE_URL
        } else {
            endpoint.base_url.trim_end_matches('/')
        };
        let action = if req.stream {
            "streamGenerateContent?alt=sse"
        } else {
            "generateContent"
        };
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(
            "x-goog-api-key",
            HeaderValue::from_str(&endpoint.api_key)
                .map_err(|e| TransformError::Schema(e.to_string()))?,
        );
        Ok(Dispatch {
            url: format!("{base}/v1beta/models/{model}:{action}"),
            headers,
        })
    }

    fn format_request(
        &self,
        req: &MessagesRequest,
        _endpoint: &EndpointConfig,
    ) -> Result<Value, TransformError> {
        let contents: Vec<Value> = req
            .messages
            .iter()
            .map(|msg| {
                let role = match msg.role {
                    Role::Assistant => "model",
                    Role::User => "user",
                };
                json!({ "role": role, "parts": message_parts(&msg.content) })
            })
            .collect();

        let mut body = json!({ "contents": contents });

        if let Some(system) = &req.system {
            body["systemInstruction"] = json!({ "parts": [{ "text": system }] });
        }

        if let Some(tools) = &req.tools {
            let declarations: Vec<Value> = tools
                .iter()
                .map(|tool| {
                    json!({
                        "name": tool.name,
                        "description": tool.description,
                        "parameters": prune_schema(&tool.input_schema),
                    })
                })
                .collect();
            body["tools"] = json!([{ "functionDeclarations": declarations }]);
        }

        let mut generation = json!({ "maxOutputTokens": req.max_tokens });
        if let Some(t) = req.temperature {
            generation["temperature"] = json!(t);
        }
        if let Some(p) = req.top_p {
            generation["topP"] = json!(p);
        }
        if let Some(k) = req.top_k {
            generation["topK"] = json!(k);
        }
        if let Some(stops) = &req.stop_sequences {
            generation["stopSequences"] = json!(stops);
        }
        body["generationConfig"] = generation;

        Ok(body)
    }

    fn format_response(
        &self,
        _status: u16,
        body: bytes::Bytes,
    ) -> Result<bytes::Bytes, TransformError> {
        let parsed: Value = serde_json::from_slice(&body)
            .map_err(|e| TransformError::Schema(format!("gemini response: {e}")))?;
        if parsed.get("candidates").is_none() {
            return Ok(body);
        }
        let completion = candidates_to_chat_completion(&parsed);
        let rewritten =
            serde_json::to_vec(&completion).map_err(|e| TransformError::Schema(e.to_string()))?;
        Ok(bytes::Bytes::from(rewritten))
    }

    fn chunk_rewriter(&self) -> Option<ChunkRewriter> {
        let mut tool_index: u64 = 0;
        let mut saw_tool_call = false;

        Some(Box::new(move |chunk: &mut Value| {
            // Non-Gemini chunks (already chat-completion shaped) pass through.
            if chunk.get("candidates").is_none() {
                return;
            }
            let candidate = chunk
                .get("candidates")
                .and_then(|c| c.as_array())
                .and_then(|c| c.first())
                .cloned()
                .unwrap_or(Value::Null);

            let mut delta = Map::new();
            let mut text = String::new();
            let mut tool_calls = Vec::new();
            if let Some(parts) = candidate.pointer("/content/parts").and_then(|p| p.as_array()) {
                for part in parts {
                    if let Some(t) = part.get("text").and_then(|t| t.as_str()) {
                        text.push_str(t);
                    }
                    if let Some(call) = part.get("functionCall") {
                        saw_tool_call = true;
                        tool_calls.push(json!({
                            "index": tool_index,
                            "id": format!("call_{}", Uuid::new_v4().simple()),
                            "type": "function",
                            "function": {
                                "name": call.get("name").and_then(|n| n.as_str()).unwrap_or(""),
                                "arguments": call.get("args")
                                    .map(|a| a.to_string())
                                    .unwrap_or_else(|| "{}".to_string()),
                            }
                        }));
                        tool_index += 1;
                    }
                }
            }
            if !text.is_empty() {
                delta.insert("content".to_string(), json!(text));
            }
            if !tool_calls.is_empty() {
                delta.insert("tool_calls".to_string(), json!(tool_calls));
            }

            let finish_reason = candidate
                .get("finishReason")
                .and_then(|r| r.as_str())
                .map(|r| {
                    if saw_tool_call {
                        "tool_calls"
                    } else {
                        map_gemini_finish_reason(r)
                    }
                });

            let mut usage = Value::Null;
            if let Some(meta) = chunk.get("usageMetadata") {
                usage = json!({
                    "prompt_tokens": meta.get("promptTokenCount").and_then(|v| v.as_u64()).unwrap_or(0),
                    "completion_tokens": meta.get("candidatesTokenCount").and_then(|v| v.as_u64()).unwrap_or(0),
                });
            }

            *chunk = json!({
                "id": chunk.get("responseId").cloned().unwrap_or(Value::Null),
                "model": chunk.get("modelVersion").cloned().unwrap_or(Value::Null),
                "choices": [{
                    "delta": Value::Object(delta),
                    "finish_reason": finish_reason,
                }],
                "usage": usage,
            });
        }))
    }
}

fn message_parts(content: &MessageContent) -> Vec<Value> {
    match content {
        MessageContent::Text { content } => vec![json!({ "text": content })],
        MessageContent::Blocks { content } => content
            .iter()
            .filter_map(|block| match block {
                ContentBlock::Text { text, .. } => Some(json!({ "text": text })),
                ContentBlock::Image { source } => {
                    if source.source_type == "url" {
                        Some(json!({
                            "fileData": {
                                "mimeType": source.media_type.clone().unwrap_or_default(),
                                "fileUri": source.url.clone().unwrap_or_default(),
                            }
                        }))
                    } else {
                        Some(json!({
                            "inlineData": {
                                "mimeType": source.media_type.clone().unwrap_or_default(),
                                "data": source.data.clone().unwrap_or_default(),
                            }
                        }))
                    }
                }
                ContentBlock::ToolUse { name, input, .. } => Some(json!({
                    "functionCall": { "name": name, "args": input }
                })),
                ContentBlock::ToolResult {
                    tool_use_id,
                    content,
                    ..
                } => Some(json!({
                    "functionResponse": {
                        "name": tool_use_id,
                        "response": {
                            "result": content.as_ref().map(|c| c.to_text()).unwrap_or_default()
                        }
                    }
                })),
                ContentBlock::Other => None,
            })
            .collect(),
    }
}

/// Keep only the schema keys Gemini accepts, recursing into `properties`
/// and `items`.
fn prune_schema(schema: &Value) -> Value {
    let Some(obj) = schema.as_object() else {
        return schema.clone();
    };
    let mut pruned = Map::new();
    for (key, value) in obj {
        if !SCHEMA_KEYS.contains(&key.as_str()) {
            continue;
        }
        let value = match key.as_str() {
            "properties" => {
                let Some(props) = value.as_object() else {
                    continue;
                };
                Value::Object(
                    props
                        .iter()
                        .map(|(name, sub)| (name.clone(), prune_schema(sub)))
                        .collect(),
                )
            }
            "items" => prune_schema(value),
            _ => value.clone(),
        };
        pruned.insert(key.clone(), value);
    }
    Value::Object(pruned)
}

fn map_gemini_finish_reason(reason: &str) -> &'static str {
    match reason {
        "STOP" => "stop",
        "MAX_TOKENS" => "length",
        "SAFETY" | "RECITATION" | "BLOCKLIST" | "PROHIBITED_CONTENT" => "content_filter",
        _ => "stop",
    }
}

/// Rewrite a Gemini generateContent response into chat-completions shape.
fn candidates_to_chat_completion(body: &Value) -> Value {
    let candidate = body
        .pointer("/candidates/0")
        .cloned()
        .unwrap_or(Value::Null);

    let mut text = String::new();
    let mut tool_calls = Vec::new();
    if let Some(parts) = candidate.pointer("/content/parts").and_then(|p| p.as_array()) {
        for part in parts {
            if let Some(t) = part.get("text").and_then(|t| t.as_str()) {
                text.push_str(t);
            }
            if let Some(call) = part.get("functionCall") {
                tool_calls.push(json!({
                    "id": format!("call_{}", Uuid::new_v4().simple()),
                    "type": "function",
                    "function": {
                        "name": call.get("name").and_then(|n| n.as_str()).unwrap_or(""),
                        "arguments": call.get("args")
                            .map(|a| a.to_string())
                            .unwrap_or_else(|| "{}".to_string()),
                    }
                }));
            }
        }
    }

    let mut message = json!({ "role": "assistant" });
    message["content"] = if text.is_empty() {
        Value::Null
    } else {
        json!(text)
    };
    let finish_reason = if !tool_calls.is_empty() {
        message["tool_calls"] = json!(tool_calls);
        "tool_calls"
    } else {
        candidate
            .get("finishReason")
            .and_then(|r| r.as_str())
            .map(map_gemini_finish_reason)
            .unwrap_or("stop")
    };

    json!({
        "id": body.get("responseId").cloned()
            .unwrap_or_else(|| json!(format!("chatcmpl_{}", Uuid::new_v4().simple()))),
        "object": "chat.completion",
        "model": body.get("modelVersion").and_then(|m| m.as_str()).unwrap_or(""),
        "choices": [{
            "index": 0,
            "message": message,
            "finish_reason": finish_reason,
        }],
        "usage": {
            "prompt_tokens": body.pointer("/usageMetadata/promptTokenCount")
                .and_then(|v| v.as_u64()).unwrap_or(0),
            "completion_tokens": body.pointer("/usageMetadata/candidatesTokenCount")
                .and_then(|v| v.as_u64()).unwrap_or(0),
        }
    })
}
