//! Upstream response handling.
//!
//! Transformer paths branch on the upstream Content-Type: event streams are
//! converted live (or consumed and demoted to one JSON payload when the
//! client asked for `stream=false`), buffered bodies run through the
//! transformer's `format_response` and universal normalization, and a
//! buffered body answering a streaming request is promoted to SSE.
//! Non-transformer paths proxy bytes verbatim with header hygiene.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::body::Body;
use axum::http::header::{CACHE_CONTROL, CONNECTION, CONTENT_TYPE};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures_core::Stream;
use futures_util::StreamExt;
use serde_json::Value;

use crate::convert::openai_to_anthropic::{chat_completion_to_message, normalize_body};
use crate::convert::sse::{aggregate_openai_sse, ConvertedSse};
use crate::error::RelayError;
use crate::transform::Transformer;

/// Buffered bodies beyond this are surfaced as `format_error`.
pub const MAX_RESPONSE_BYTES: usize = 16 * 1024 * 1024;

/// Headers that never cross the proxy in either direction.
pub const HOP_BY_HOP_HEADERS: &[&str] = &[
    "host",
    "connection",
    "proxy-connection",
    "transfer-encoding",
    "keep-alive",
    "upgrade",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
];

/// One-shot hook fired when the first upstream body byte is observed.
pub type FirstTokenHook = Box<dyn FnOnce() + Send>;

/// Per-response pipeline inputs.
pub struct PipelineContext {
    pub client_wants_stream: bool,
    pub transformer: Arc<dyn Transformer>,
    pub on_first_token: Option<FirstTokenHook>,
}

/// A passthrough stream that fires a hook on the first chunk.
struct TapStream {
    inner: Pin<Box<dyn Stream<Item = Result<Bytes, reqwest::Error>> + Send>>,
    on_first_chunk: Option<FirstTokenHook>,
}

impl Stream for TapStream {
    type Item = Result<Bytes, reqwest::Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match self.inner.as_mut().poll_next(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                if let Some(hook) = self.on_first_chunk.take() {
                    hook();
                }
                Poll::Ready(Some(Ok(chunk)))
            }
            other => other,
        }
    }
}

fn forwardable_headers(upstream: &HeaderMap) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (name, value) in upstream.iter() {
        if HOP_BY_HOP_HEADERS.contains(&name.as_str()) {
            continue;
        }
        headers.insert(name.clone(), value.clone());
    }
    headers
}

fn client_status(status: reqwest::StatusCode) -> StatusCode {
    StatusCode::from_u16(status.as_u16()).unwrap_or(StatusCode::BAD_GATEWAY)
}

/// Proxy an upstream response verbatim (non-transformer endpoints and
/// unretryable 5xx bodies): status and headers preserved, hop-by-hop
/// stripped, body streamed through untouched.
pub fn passthrough_response(
    upstream: reqwest::Response,
    on_first_token: Option<FirstTokenHook>,
) -> Response {
    let status = client_status(upstream.status());
    let headers = forwardable_headers(upstream.headers());

    let tap = TapStream {
        inner: Box::pin(upstream.bytes_stream()),
        on_first_chunk: on_first_token,
    };

    let mut builder = Response::builder().status(status);
    for (name, value) in headers.iter() {
        builder = builder.header(name, value);
    }
    builder
        .body(Body::from_stream(tap))
        .unwrap_or_else(|e| {
            tracing::error!(error = %e, "failed to build passthrough response");
            RelayError::Internal(e.to_string()).into_response()
        })
}

/// Run a transformer-path upstream response through the pipeline.
pub async fn transformed_response(upstream: reqwest::Response, ctx: PipelineContext) -> Response {
    let is_event_stream = upstream
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.starts_with("text/event-stream"));

    if is_event_stream {
        streamed_upstream(upstream, ctx).await
    } else {
        buffered_upstream(upstream, ctx).await
    }
}

async fn streamed_upstream(upstream: reqwest::Response, ctx: PipelineContext) -> Response {
    if ctx.client_wants_stream {
        let converted = ConvertedSse::new(
            Box::pin(upstream.bytes_stream()),
            ctx.transformer.chunk_rewriter(),
            ctx.on_first_token,
        );
        return sse_response(Body::from_stream(converted));
    }

    // Client asked for a single payload; drain the stream and demote.
    let (bytes, overflowed) = collect_capped(upstream, ctx.on_first_token).await;
    if overflowed {
        return oversize_response();
    }
    let completion = aggregate_openai_sse(&bytes, ctx.transformer.chunk_rewriter());
    let message = chat_completion_to_message(&completion);
    json_response(StatusCode::OK, &message)
}

async fn buffered_upstream(upstream: reqwest::Response, ctx: PipelineContext) -> Response {
    let status = client_status(upstream.status());
    let (bytes, overflowed) = collect_capped(upstream, ctx.on_first_token).await;
    if overflowed {
        return oversize_response();
    }

    // A failed transformer response hook falls back to the original body;
    // universal normalization still runs.
    let bytes = match ctx.transformer.format_response(status.as_u16(), bytes.clone()) {
        Ok(formatted) => formatted,
        Err(e) => {
            tracing::warn!(
                transformer = ctx.transformer.name(),
                error = %e,
                "format_response failed, forwarding original body"
            );
            bytes
        }
    };

    let normalized = normalize_body(&bytes);

    if ctx.client_wants_stream {
        // Promote the single payload to an event stream.
        let frame = format!("data: {normalized}\n\ndata: [DONE]\n\n");
        return sse_response(Body::from(frame));
    }

    json_response(status, &normalized)
}

/// Accumulate an upstream body up to [`MAX_RESPONSE_BYTES`].
async fn collect_capped(
    upstream: reqwest::Response,
    on_first_token: Option<FirstTokenHook>,
) -> (Bytes, bool) {
    let mut on_first_token = on_first_token;
    let mut buf: Vec<u8> = Vec::new();
    let mut stream = upstream.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let Ok(chunk) = chunk else { break };
        if let Some(hook) = on_first_token.take() {
            hook();
        }
        if buf.len() + chunk.len() > MAX_RESPONSE_BYTES {
            return (Bytes::new(), true);
        }
        buf.extend_from_slice(&chunk);
    }
    // An empty body still counts as "arrived" for timing purposes.
    if let Some(hook) = on_first_token.take() {
        hook();
    }
    (Bytes::from(buf), false)
}

fn sse_response(body: Body) -> Response {
    Response::builder()
        .status(StatusCode::OK)
        .header(CONTENT_TYPE, HeaderValue::from_static("text/event-stream"))
        .header(CACHE_CONTROL, HeaderValue::from_static("no-cache"))
        .header(CONNECTION, HeaderValue::from_static("keep-alive"))
        .body(body)
        .unwrap_or_else(|e| {
            tracing::error!(error = %e, "failed to build SSE response");
            RelayError::Internal(e.to_string()).into_response()
        })
}

fn json_response(status: StatusCode, body: &Value) -> Response {
    (status, axum::Json(body.clone())).into_response()
}

/// Oversize bodies surface as `format_error` rather than an opaque cutoff.
fn oversize_response() -> Response {
    json_response(
        StatusCode::OK,
        &serde_json::json!({
            "error": {
                "type": "format_error",
                "message": "upstream response exceeded the buffer limit"
            }
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hop_by_hop_headers_are_stripped() {
        let mut upstream = HeaderMap::new();
        upstream.insert("content-type", HeaderValue::from_static("application/json"));
        upstream.insert("connection", HeaderValue::from_static("close"));
        upstream.insert("proxy-connection", HeaderValue::from_static("keep-alive"));
        upstream.insert("transfer-encoding", HeaderValue::from_static("chunked"));
        upstream.insert("upgrade", HeaderValue::from_static("h2c"));
        upstream.insert("x-request-id", HeaderValue::from_static("abc"));

        let forwarded = forwardable_headers(&upstream);
        assert!(forwarded.contains_key("content-type"));
        assert!(forwarded.contains_key("x-request-id"));
        for name in HOP_BY_HOP_HEADERS {
            assert!(!forwarded.contains_key(*name), "{name} leaked through");
        }
    }

    #[test]
    fn test_promotion_frame_shape() {
        let body = serde_json::json!({"type": "message", "content": []});
        let frame = format!("data: {body}\n\ndata: [DONE]\n\n");
        assert!(frame.starts_with("data: {"));
        assert!(frame.ends_with("data: [DONE]\n\n"));
    }
}
