//! Anthropic -> OpenAI chat completions request conversion.
//!
//! Projects a [`MessagesRequest`] onto a `serde_json::Value` in OpenAI
//! chat-completions shape. The output targets `Value` rather than typed
//! OpenAI structs: providers accept valid OpenAI-format JSON and a typed
//! model would only lag their extensions.

use anyhow::Result;
use serde_json::{json, Value};

use super::types::*;

/// Convert an Anthropic Messages request to OpenAI chat completions JSON.
pub fn anthropic_to_openai(req: &MessagesRequest) -> Result<Value> {
    let mut messages = Vec::new();

    // Prepend system message if present
    if let Some(system_text) = &req.system {
        messages.push(json!({
            "role": "system",
            "content": system_text
        }));
    }

    for msg in &req.messages {
        match (&msg.role, &msg.content) {
            (Role::User, MessageContent::Text { content }) => {
                messages.push(json!({
                    "role": "user",
                    "content": content
                }));
            }
            (Role::User, MessageContent::Blocks { content: blocks }) => {
                convert_user_blocks(blocks, &mut messages);
            }
            (Role::Assistant, MessageContent::Text { content }) => {
                messages.push(json!({
                    "role": "assistant",
                    "content": content
                }));
            }
            (Role::Assistant, MessageContent::Blocks { content: blocks }) => {
                convert_assistant_blocks(blocks, &mut messages);
            }
        }
    }

    let mut request = json!({
        "model": req.model,
        "messages": messages,
        "max_tokens": req.max_tokens,
        "stream": req.stream,
    });

    if let Some(temp) = req.temperature {
        request["temperature"] = json!(temp);
    }
    if let Some(top_p) = req.top_p {
        request["top_p"] = json!(top_p);
    }
    if let Some(ref stop_seqs) = req.stop_sequences {
        request["stop"] = json!(stop_seqs);
    }
    if let Some(ref tools) = req.tools {
        request["tools"] = convert_tools(tools);
    }
    if let Some(ref tool_choice) = req.tool_choice {
        request["tool_choice"] = convert_tool_choice(tool_choice);
    }

    Ok(request)
}

/// Render an image block as an OpenAI `image_url` content part.
///
/// URL sources pass through. Base64 sources keep the raw payload in
/// `image_url.url` with `media_type` carried alongside; a provider-specific
/// pass (OpenRouter) inlines those as data URLs.
fn image_part(source: &ImageSource) -> Value {
    if source.source_type == "url" {
        json!({
            "type": "image_url",
            "image_url": { "url": source.url.clone().unwrap_or_default() }
        })
    } else {
        json!({
            "type": "image_url",
            "image_url": { "url": source.data.clone().unwrap_or_default() },
            "media_type": source.media_type.clone().unwrap_or_default()
        })
    }
}

/// Convert user-role content blocks into chat completion messages.
///
/// Plain text runs collapse to a string message; a run containing images or
/// caching markers keeps the content-part array so those survive the trip.
/// `tool_result` blocks always split out into their own `role:"tool"`
/// messages.
fn convert_user_blocks(blocks: &[ContentBlock], messages: &mut Vec<Value>) {
    let mut parts: Vec<Value> = Vec::new();
    let mut keep_parts = false;

    let flush = |parts: &mut Vec<Value>, keep_parts: &mut bool, messages: &mut Vec<Value>| {
        if parts.is_empty() {
            return;
        }
        if *keep_parts {
            messages.push(json!({
                "role": "user",
                "content": std::mem::take(parts)
            }));
        } else {
            let combined = parts
                .drain(..)
                .filter_map(|p| p["text"].as_str().map(|s| s.to_string()))
                .collect::<Vec<_>>()
                .join("");
            messages.push(json!({
                "role": "user",
                "content": combined
            }));
        }
        *keep_parts = false;
    };

    for block in blocks {
        match block {
            ContentBlock::Text {
                text,
                cache_control,
            } => {
                let mut part = json!({ "type": "text", "text": text });
                if let Some(cc) = cache_control {
                    keep_parts = true;
                    part["cache_control"] = cc.clone();
                }
                parts.push(part);
            }
            ContentBlock::Image { source } => {
                keep_parts = true;
                parts.push(image_part(source));
            }
            ContentBlock::ToolResult {
                tool_use_id,
                content,
                ..
            } => {
                flush(&mut parts, &mut keep_parts, messages);
                messages.push(json!({
                    "role": "tool",
                    "content": content.as_ref().map(|c| c.to_text()).unwrap_or_default(),
                    "tool_call_id": tool_use_id
                }));
            }
            // tool_use in a user message is unexpected; unknown blocks carry
            // nothing translatable
            ContentBlock::ToolUse { .. } | ContentBlock::Other => {}
        }
    }

    flush(&mut parts, &mut keep_parts, messages);
}

/// Convert assistant-role content blocks into chat completion messages.
fn convert_assistant_blocks(blocks: &[ContentBlock], messages: &mut Vec<Value>) {
    let mut text_content = String::new();
    let mut tool_calls = Vec::new();

    for block in blocks {
        match block {
            ContentBlock::Text { text, .. } => {
                text_content.push_str(text);
            }
            ContentBlock::ToolUse { id, name, input } => {
                tool_calls.push(json!({
                    "id": id,
                    "type": "function",
                    "function": {
                        "name": name,
                        "arguments": serde_json::to_string(input).unwrap_or_default()
                    }
                }));
            }
            _ => {}
        }
    }

    let mut msg = json!({ "role": "assistant" });

    if !text_content.is_empty() {
        msg["content"] = json!(text_content);
    }
    if !tool_calls.is_empty() {
        msg["tool_calls"] = json!(tool_calls);
    }

    messages.push(msg);
}

/// Convert Anthropic tools to OpenAI-format tools.
fn convert_tools(tools: &[ToolDefinition]) -> Value {
    let converted: Vec<Value> = tools
        .iter()
        .map(|tool| {
            json!({
                "type": "function",
                "function": {
                    "name": tool.name,
                    "description": tool.description,
                    "parameters": tool.input_schema
                }
            })
        })
        .collect();
    json!(converted)
}

/// Convert Anthropic tool_choice to OpenAI-format tool_choice.
fn convert_tool_choice(tc: &ToolChoice) -> Value {
    match tc {
        ToolChoice::Simple(simple) => match simple.choice_type {
            ToolChoiceMode::Auto => json!("auto"),
            ToolChoiceMode::Any => json!("required"),
            ToolChoiceMode::None => json!("none"),
            ToolChoiceMode::Tool => json!("auto"),
        },
        ToolChoice::Named(named) => {
            json!({
                "type": "function",
                "function": {
                    "name": named.name
                }
            })
        }
    }
}
