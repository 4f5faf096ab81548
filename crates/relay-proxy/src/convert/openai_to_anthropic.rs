//! OpenAI -> Anthropic response conversion and universal normalization.
//!
//! Every buffered upstream body funnels through [`normalize_body`]: bodies
//! already in Anthropic shape pass through untouched, OpenAI
//! `chat.completion` bodies are rewritten, and the degenerate cases (empty,
//! non-JSON) wrap into the taxonomized error shapes.

use serde_json::{json, Value};
use uuid::Uuid;

/// Map an OpenAI finish_reason onto an Anthropic stop_reason.
pub fn map_finish_reason(reason: &str) -> &'static str {
    match reason {
        "stop" => "end_turn",
        "length" => "max_tokens",
        "tool_calls" => "tool_use",
        "content_filter" => "stop_sequence",
        _ => "end_turn",
    }
}

/// True when the body is an OpenAI chat completion.
pub fn is_chat_completion(body: &Value) -> bool {
    body.get("object").and_then(|o| o.as_str()) == Some("chat.completion")
        && body.get("choices").is_some_and(|c| c.is_array())
}

/// Rewrite an OpenAI `chat.completion` body into an Anthropic message.
pub fn chat_completion_to_message(body: &Value) -> Value {
    let id = body
        .get("id")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .unwrap_or_else(|| format!("msg_{}", Uuid::new_v4().simple()));
    let model = body
        .get("model")
        .and_then(|v| v.as_str())
        .unwrap_or_default();

    let choice = body
        .get("choices")
        .and_then(|c| c.as_array())
        .and_then(|c| c.first())
        .cloned()
        .unwrap_or(Value::Null);
    let message = choice.get("message").cloned().unwrap_or(Value::Null);

    let mut content = Vec::new();

    // Reasoning models surface their chain under either key; render it as a
    // thinking block ahead of the visible text.
    if let Some(thinking) = message
        .get("reasoning_content")
        .or_else(|| message.get("reasoning"))
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
    {
        content.push(json!({ "type": "thinking", "thinking": thinking }));
    }

    if let Some(text) = message
        .get("content")
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
    {
        content.push(json!({ "type": "text", "text": text }));
    }

    let mut saw_tool_calls = false;
    if let Some(tool_calls) = message.get("tool_calls").and_then(|v| v.as_array()) {
        for call in tool_calls {
            saw_tool_calls = true;
            let input = call
                .pointer("/function/arguments")
                .and_then(|a| a.as_str())
                .and_then(|a| serde_json::from_str::<Value>(a).ok())
                .unwrap_or_else(|| json!({}));
            content.push(json!({
                "type": "tool_use",
                "id": call.get("id").and_then(|v| v.as_str())
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| format!("call_{}", Uuid::new_v4().simple())),
                "name": call.pointer("/function/name").and_then(|v| v.as_str()).unwrap_or(""),
                "input": input,
            }));
        }
    }

    let stop_reason = if saw_tool_calls {
        "tool_use"
    } else {
        choice
            .get("finish_reason")
            .and_then(|v| v.as_str())
            .map(map_finish_reason)
            .unwrap_or("end_turn")
    };

    let usage = body.get("usage").cloned().unwrap_or(Value::Null);
    let input_tokens = usage
        .get("prompt_tokens")
        .and_then(|v| v.as_u64())
        .unwrap_or(0);
    let output_tokens = usage
        .get("completion_tokens")
        .and_then(|v| v.as_u64())
        .unwrap_or(0);

    json!({
        "id": id,
        "type": "message",
        "role": "assistant",
        "model": model,
        "content": content,
        "stop_reason": stop_reason,
        "stop_sequence": null,
        "usage": {
            "input_tokens": input_tokens,
            "output_tokens": output_tokens,
        }
    })
}

/// Universal response normalization over a buffered upstream body.
pub fn normalize_body(bytes: &[u8]) -> Value {
    if bytes.is_empty() {
        return json!({
            "error": {
                "type": "empty_response",
                "message": "Empty response from upstream"
            }
        });
    }

    let parsed: Value = match serde_json::from_slice(bytes) {
        Ok(v) => v,
        Err(_) => {
            return json!({
                "error": {
                    "type": "format_error",
                    "originalResponse": String::from_utf8_lossy(bytes),
                }
            });
        }
    };

    if is_chat_completion(&parsed) {
        chat_completion_to_message(&parsed)
    } else {
        parsed
    }
}
