//! OpenAI SSE -> Anthropic SSE stream conversion.
//!
//! [`StreamConverter`] is a line-buffered state machine over raw upstream
//! bytes. It consumes `data: {...}` frames in OpenAI chunk shape and emits
//! Anthropic event-stream frames (`event: <type>\ndata: <json>\n\n`),
//! tracking one content block per text run, tool call, thinking segment, and
//! web-search annotation.
//!
//! [`ConvertedSse`] drives the converter over a live upstream byte stream;
//! [`aggregate_openai_sse`] folds a complete stream into a single
//! `chat.completion` body for clients that asked for a non-streaming
//! response.

use std::collections::HashMap;
use std::convert::Infallible;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use futures_core::Stream;
use serde_json::{json, Value};
use uuid::Uuid;

/// Unterminated input above this size is flushed as best-effort lines.
const MAX_TAIL_BUFFER: usize = 1024 * 1024;

/// Stateful per-stream chunk rewriter supplied by a transformer
/// (e.g. OpenRouter reasoning re-tagging). Applied to each parsed OpenAI
/// chunk before conversion.
pub type ChunkRewriter = Box<dyn FnMut(&mut Value) + Send>;

/// The currently open content block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockState {
    None,
    Text,
    Thinking,
    ToolCall { openai_index: u64 },
}

#[derive(Debug)]
struct ToolCallBlock {
    content_index: usize,
    id: String,
    name: String,
    synthesized_id: bool,
    synthesized_name: bool,
}

/// OpenAI chunk stream -> Anthropic event stream state machine.
pub struct StreamConverter {
    started: bool,
    finished: bool,
    closed: bool,
    block: BlockState,
    /// Index the next content block will open at.
    content_index: usize,
    tool_calls: HashMap<u64, ToolCallBlock>,
    saw_tool_call: bool,
    model: String,
    input_tokens: u64,
    output_tokens: u64,
    tail: Vec<u8>,
    rewriter: Option<ChunkRewriter>,
}

impl StreamConverter {
    pub fn new(rewriter: Option<ChunkRewriter>) -> Self {
        Self {
            started: false,
            finished: false,
            closed: false,
            block: BlockState::None,
            content_index: 0,
            tool_calls: HashMap::new(),
            saw_tool_call: false,
            model: String::new(),
            input_tokens: 0,
            output_tokens: 0,
            tail: Vec::new(),
            rewriter,
        }
    }

    /// Feed raw upstream bytes; returns the Anthropic frames produced.
    pub fn push(&mut self, data: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        if self.closed {
            return out;
        }

        self.tail.extend_from_slice(data);

        // Process every complete line, keep the unterminated remainder.
        let mut start = 0;
        while let Some(pos) = self.tail[start..].iter().position(|&b| b == b'\n') {
            let line = self.tail[start..start + pos].to_vec();
            start += pos + 1;
            self.process_line(&line, &mut out);
        }
        self.tail.drain(..start);

        // Degenerate producers can send unbounded undelimited data; flush it
        // as one best-effort line and keep going.
        if self.tail.len() > MAX_TAIL_BUFFER {
            let overflow = std::mem::take(&mut self.tail);
            self.process_line(&overflow, &mut out);
        }

        out
    }

    /// Signal end of upstream input. Flushes the tail and, if the stream
    /// never delivered a finish_reason, synthesizes the terminal frames so
    /// the client always sees a well-formed message.
    pub fn finish(&mut self) -> Vec<u8> {
        let mut out = Vec::new();
        if self.closed {
            return out;
        }

        let tail = std::mem::take(&mut self.tail);
        if !tail.is_empty() {
            self.process_line(&tail, &mut out);
        }

        if self.started && !self.finished {
            self.close_open_block(&mut out);
            let stop_reason = if self.saw_tool_call { "tool_use" } else { "end_turn" };
            self.emit_terminal(stop_reason, &mut out);
        }
        self.closed = true;
        out
    }

    fn process_line(&mut self, line: &[u8], out: &mut Vec<u8>) {
        let line = String::from_utf8_lossy(line);
        let line = line.trim();
        if line.is_empty() || line.starts_with(':') || line.starts_with("event:") {
            return;
        }
        let Some(data) = line.strip_prefix("data:").map(str::trim) else {
            return;
        };
        if data == "[DONE]" {
            return;
        }
        // Undecodable frames are dropped; the stream continues.
        let Ok(chunk) = serde_json::from_str::<Value>(data) else {
            tracing::debug!(len = data.len(), "dropping undecodable stream frame");
            return;
        };
        self.process_chunk(chunk, out);
    }

    fn process_chunk(&mut self, mut chunk: Value, out: &mut Vec<u8>) {
        // Late frames after the terminal are dropped.
        if self.finished {
            return;
        }

        if let Some(rewrite) = self.rewriter.as_mut() {
            rewrite(&mut chunk);
        }

        if let Some(usage) = chunk.get("usage") {
            if let Some(n) = usage.get("prompt_tokens").and_then(|v| v.as_u64()) {
                self.input_tokens = n;
            }
            if let Some(n) = usage.get("completion_tokens").and_then(|v| v.as_u64()) {
                self.output_tokens = n;
            }
        }

        let Some(choice) = chunk
            .get("choices")
            .and_then(|c| c.as_array())
            .and_then(|c| c.first())
            .cloned()
        else {
            return;
        };

        if !self.started {
            self.emit_message_start(&chunk, out);
        }

        let delta = choice.get("delta").cloned().unwrap_or(Value::Null);

        if let Some(thinking) = delta.get("thinking").and_then(|v| v.as_str()) {
            self.on_thinking_delta(thinking, out);
        }
        if let Some(signature) = delta.get("signature").and_then(|v| v.as_str()) {
            self.on_signature(signature, out);
        }
        if let Some(text) = delta.get("content").and_then(|v| v.as_str()) {
            if !text.is_empty() {
                self.on_text_delta(text, out);
            }
        }
        if let Some(annotations) = delta.get("annotations").and_then(|v| v.as_array()) {
            self.on_annotations(annotations, out);
        }
        if let Some(tool_calls) = delta.get("tool_calls").and_then(|v| v.as_array()) {
            for tc in tool_calls {
                self.on_tool_call_delta(tc, out);
            }
        }

        if let Some(reason) = choice.get("finish_reason").and_then(|v| v.as_str()) {
            self.on_finish(reason, out);
        }
    }

    fn emit_message_start(&mut self, chunk: &Value, out: &mut Vec<u8>) {
        self.started = true;
        let id = chunk
            .get("id")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .unwrap_or_else(|| format!("msg_{}", Uuid::new_v4().simple()));
        self.model = chunk
            .get("model")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        push_frame(
            out,
            "message_start",
            &json!({
                "type": "message_start",
                "message": {
                    "id": id,
                    "type": "message",
                    "role": "assistant",
                    "model": self.model,
                    "content": [],
                    "stop_reason": null,
                    "stop_sequence": null,
                    "usage": {"input_tokens": 0, "output_tokens": 0}
                }
            }),
        );
    }

    fn on_thinking_delta(&mut self, thinking: &str, out: &mut Vec<u8>) {
        if self.block != BlockState::Thinking {
            self.close_open_block(out);
            push_frame(
                out,
                "content_block_start",
                &json!({
                    "type": "content_block_start",
                    "index": self.content_index,
                    "content_block": {"type": "thinking", "thinking": ""}
                }),
            );
            self.block = BlockState::Thinking;
        }
        push_frame(
            out,
            "content_block_delta",
            &json!({
                "type": "content_block_delta",
                "index": self.content_index,
                "delta": {"type": "thinking_delta", "thinking": thinking}
            }),
        );
    }

    fn on_signature(&mut self, signature: &str, out: &mut Vec<u8>) {
        if self.block != BlockState::Thinking {
            return;
        }
        push_frame(
            out,
            "content_block_delta",
            &json!({
                "type": "content_block_delta",
                "index": self.content_index,
                "delta": {"type": "signature_delta", "signature": signature}
            }),
        );
        self.close_open_block(out);
    }

    fn on_text_delta(&mut self, text: &str, out: &mut Vec<u8>) {
        if self.block != BlockState::Text {
            self.close_open_block(out);
            push_frame(
                out,
                "content_block_start",
                &json!({
                    "type": "content_block_start",
                    "index": self.content_index,
                    "content_block": {"type": "text", "text": ""}
                }),
            );
            self.block = BlockState::Text;
        }
        push_frame(
            out,
            "content_block_delta",
            &json!({
                "type": "content_block_delta",
                "index": self.content_index,
                "delta": {"type": "text_delta", "text": text}
            }),
        );
    }

    fn on_annotations(&mut self, annotations: &[Value], out: &mut Vec<u8>) {
        self.close_open_block(out);
        for annotation in annotations {
            // OpenAI nests url citations; tolerate a flat shape too.
            let citation = annotation.get("url_citation").unwrap_or(annotation);
            let url = citation.get("url").and_then(|v| v.as_str()).unwrap_or("");
            let title = citation.get("title").and_then(|v| v.as_str()).unwrap_or("");
            push_frame(
                out,
                "content_block_start",
                &json!({
                    "type": "content_block_start",
                    "index": self.content_index,
                    "content_block": {
                        "type": "web_search_tool_result",
                        "tool_use_id": format!("srvtoolu_{}", Uuid::new_v4().simple()),
                        "content": [{"type": "web_search_result", "url": url, "title": title}]
                    }
                }),
            );
            push_frame(
                out,
                "content_block_stop",
                &json!({"type": "content_block_stop", "index": self.content_index}),
            );
            self.content_index += 1;
        }
    }

    fn on_tool_call_delta(&mut self, tc: &Value, out: &mut Vec<u8>) {
        let openai_index = tc.get("index").and_then(|v| v.as_u64()).unwrap_or(0);
        let id = tc.get("id").and_then(|v| v.as_str());
        let name = tc.pointer("/function/name").and_then(|v| v.as_str());
        let arguments = tc.pointer("/function/arguments").and_then(|v| v.as_str());

        self.saw_tool_call = true;

        if !self.tool_calls.contains_key(&openai_index) {
            self.close_open_block(out);
            let block = ToolCallBlock {
                content_index: self.content_index,
                id: id.map(|s| s.to_string()).unwrap_or_else(|| {
                    let ts = SystemTime::now()
                        .duration_since(UNIX_EPOCH)
                        .map(|d| d.as_millis())
                        .unwrap_or(0);
                    format!("call_{ts}_{openai_index}")
                }),
                name: name
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| format!("tool_{openai_index}")),
                synthesized_id: id.is_none(),
                synthesized_name: name.is_none(),
            };
            push_frame(
                out,
                "content_block_start",
                &json!({
                    "type": "content_block_start",
                    "index": block.content_index,
                    "content_block": {
                        "type": "tool_use",
                        "id": block.id,
                        "name": block.name,
                        "input": {}
                    }
                }),
            );
            self.block = BlockState::ToolCall { openai_index };
            self.tool_calls.insert(openai_index, block);
        } else {
            // Late frames may carry the real id/name where the start event
            // used synthesized values; keep state current without re-emitting.
            let block = self.tool_calls.get_mut(&openai_index).expect("tool block");
            if let Some(id) = id {
                if block.synthesized_id {
                    block.id = id.to_string();
                    block.synthesized_id = false;
                }
            }
            if let Some(name) = name {
                if block.synthesized_name {
                    block.name = name.to_string();
                    block.synthesized_name = false;
                }
            }
        }

        if let Some(fragment) = arguments {
            if let Some(fragment) = sanitize_fragment(fragment) {
                let content_index = self.tool_calls[&openai_index].content_index;
                push_frame(
                    out,
                    "content_block_delta",
                    &json!({
                        "type": "content_block_delta",
                        "index": content_index,
                        "delta": {"type": "input_json_delta", "partial_json": fragment}
                    }),
                );
            }
        }
    }

    fn on_finish(&mut self, reason: &str, out: &mut Vec<u8>) {
        self.close_open_block(out);
        let mapped = super::openai_to_anthropic::map_finish_reason(reason);
        let stop_reason = if mapped == "end_turn" && self.saw_tool_call {
            "tool_use"
        } else {
            mapped
        };
        self.emit_terminal(stop_reason, out);
    }

    fn emit_terminal(&mut self, stop_reason: &str, out: &mut Vec<u8>) {
        push_frame(
            out,
            "message_delta",
            &json!({
                "type": "message_delta",
                "delta": {"stop_reason": stop_reason, "stop_sequence": null},
                "usage": {
                    "input_tokens": self.input_tokens,
                    "output_tokens": self.output_tokens
                }
            }),
        );
        push_frame(out, "message_stop", &json!({"type": "message_stop"}));
        self.finished = true;
    }

    fn close_open_block(&mut self, out: &mut Vec<u8>) {
        if self.block == BlockState::None {
            return;
        }
        push_frame(
            out,
            "content_block_stop",
            &json!({"type": "content_block_stop", "index": self.content_index}),
        );
        self.content_index += 1;
        self.block = BlockState::None;
    }
}

fn push_frame(out: &mut Vec<u8>, event: &str, data: &Value) {
    out.extend_from_slice(format!("event: {event}\ndata: {data}\n\n").as_bytes());
}

/// Sanitize a tool-argument fragment destined for `partial_json`.
///
/// Well-formed fragments pass through untouched. A fragment carrying raw
/// control characters gets one repair attempt: control characters are
/// stripped and backslashes and quotes escaped. A fragment with nothing
/// left after repair is dropped.
fn sanitize_fragment(fragment: &str) -> Option<String> {
    let clean = fragment
        .chars()
        .all(|c| !c.is_control() || c == '\n' || c == '\t');
    if clean {
        return Some(fragment.to_string());
    }
    let mut repaired = String::with_capacity(fragment.len());
    for c in fragment.chars() {
        match c {
            '\\' => repaired.push_str("\\\\"),
            '"' => repaired.push_str("\\\""),
            c if c.is_control() && c != '\n' && c != '\t' => {}
            c => repaired.push(c),
        }
    }
    if repaired.is_empty() {
        None
    } else {
        Some(repaired)
    }
}

/// A `Stream` that pipes upstream bytes through a [`StreamConverter`].
///
/// Upstream transport errors after the stream began are absorbed: the
/// converter closes the message cleanly instead of surfacing a mid-stream
/// error the client cannot parse.
pub struct ConvertedSse {
    inner: Pin<Box<dyn Stream<Item = Result<Bytes, reqwest::Error>> + Send>>,
    converter: StreamConverter,
    on_first_chunk: Option<Box<dyn FnOnce() + Send>>,
    done: bool,
}

impl ConvertedSse {
    pub fn new(
        inner: Pin<Box<dyn Stream<Item = Result<Bytes, reqwest::Error>> + Send>>,
        rewriter: Option<ChunkRewriter>,
        on_first_chunk: Option<Box<dyn FnOnce() + Send>>,
    ) -> Self {
        Self {
            inner,
            converter: StreamConverter::new(rewriter),
            on_first_chunk,
            done: false,
        }
    }
}

impl Stream for ConvertedSse {
    type Item = Result<Bytes, Infallible>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            if self.done {
                return Poll::Ready(None);
            }
            match self.inner.as_mut().poll_next(cx) {
                Poll::Ready(Some(Ok(chunk))) => {
                    if let Some(hook) = self.on_first_chunk.take() {
                        hook();
                    }
                    let out = self.converter.push(&chunk);
                    if out.is_empty() {
                        continue;
                    }
                    return Poll::Ready(Some(Ok(Bytes::from(out))));
                }
                Poll::Ready(Some(Err(e))) => {
                    tracing::warn!(error = %e, "upstream stream error, closing message");
                    self.done = true;
                    let out = self.converter.finish();
                    if out.is_empty() {
                        return Poll::Ready(None);
                    }
                    return Poll::Ready(Some(Ok(Bytes::from(out))));
                }
                Poll::Ready(None) => {
                    self.done = true;
                    let out = self.converter.finish();
                    if out.is_empty() {
                        return Poll::Ready(None);
                    }
                    return Poll::Ready(Some(Ok(Bytes::from(out))));
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

/// Fold a complete OpenAI SSE body into one `chat.completion` value.
///
/// Used when the client asked for `stream=false` but the upstream answered
/// with an event stream: the stream is consumed to completion and re-emitted
/// as a single JSON payload (after universal normalization).
pub fn aggregate_openai_sse(body: &[u8], rewriter: Option<ChunkRewriter>) -> Value {
    let mut rewriter = rewriter;
    let mut id = None;
    let mut model = String::new();
    let mut content = String::new();
    let mut reasoning = String::new();
    let mut finish_reason: Option<String> = None;
    let mut tool_calls: HashMap<u64, Value> = HashMap::new();
    let mut usage = json!({"prompt_tokens": 0, "completion_tokens": 0});

    for raw_line in body.split(|&b| b == b'\n') {
        let line = String::from_utf8_lossy(raw_line);
        let line = line.trim();
        let Some(data) = line.strip_prefix("data:").map(str::trim) else {
            continue;
        };
        if data == "[DONE]" {
            break;
        }
        let Ok(mut chunk) = serde_json::from_str::<Value>(data) else {
            continue;
        };
        if let Some(rewrite) = rewriter.as_mut() {
            rewrite(&mut chunk);
        }

        if id.is_none() {
            id = chunk.get("id").and_then(|v| v.as_str()).map(String::from);
        }
        if model.is_empty() {
            if let Some(m) = chunk.get("model").and_then(|v| v.as_str()) {
                model = m.to_string();
            }
        }
        if let Some(u) = chunk.get("usage").filter(|u| u.is_object()) {
            usage = u.clone();
        }

        let Some(choice) = chunk
            .get("choices")
            .and_then(|c| c.as_array())
            .and_then(|c| c.first())
        else {
            continue;
        };
        if let Some(reason) = choice.get("finish_reason").and_then(|v| v.as_str()) {
            finish_reason = Some(reason.to_string());
        }
        let Some(delta) = choice.get("delta") else {
            continue;
        };
        if let Some(text) = delta.get("content").and_then(|v| v.as_str()) {
            content.push_str(text);
        }
        if let Some(text) = delta
            .get("thinking")
            .or_else(|| delta.get("reasoning_content"))
            .and_then(|v| v.as_str())
        {
            reasoning.push_str(text);
        }
        if let Some(calls) = delta.get("tool_calls").and_then(|v| v.as_array()) {
            for tc in calls {
                let index = tc.get("index").and_then(|v| v.as_u64()).unwrap_or(0);
                let entry = tool_calls.entry(index).or_insert_with(|| {
                    json!({
                        "id": "",
                        "type": "function",
                        "function": {"name": "", "arguments": ""}
                    })
                });
                if let Some(id) = tc.get("id").and_then(|v| v.as_str()) {
                    entry["id"] = json!(id);
                }
                if let Some(name) = tc.pointer("/function/name").and_then(|v| v.as_str()) {
                    entry["function"]["name"] = json!(name);
                }
                if let Some(args) = tc.pointer("/function/arguments").and_then(|v| v.as_str()) {
                    let existing = entry["function"]["arguments"].as_str().unwrap_or("");
                    entry["function"]["arguments"] = json!(format!("{existing}{args}"));
                }
            }
        }
    }

    let mut message = json!({"role": "assistant"});
    if !content.is_empty() {
        message["content"] = json!(content);
    }
    if !reasoning.is_empty() {
        message["reasoning_content"] = json!(reasoning);
    }
    if !tool_calls.is_empty() {
        let mut indices: Vec<_> = tool_calls.keys().copied().collect();
        indices.sort_unstable();
        let calls: Vec<_> = indices.into_iter().map(|i| tool_calls[&i].clone()).collect();
        message["tool_calls"] = json!(calls);
        finish_reason = Some("tool_calls".to_string());
    }

    json!({
        "id": id.unwrap_or_else(|| format!("chatcmpl_{}", Uuid::new_v4().simple())),
        "object": "chat.completion",
        "model": model,
        "choices": [{
            "index": 0,
            "message": message,
            "finish_reason": finish_reason.unwrap_or_else(|| "stop".to_string()),
        }],
        "usage": usage,
    })
}
