//! The per-request proxy pipeline: endpoint selection, transformer
//! resolution, upstream dispatch, and the single in-flight retry.
//!
//! Retry discipline: a transport error, timeout, or 5xx marks the endpoint
//! unhealthy and earns exactly one retry against a *different* endpoint
//! instance, and only while nothing has been flushed to the client. A second
//! failure surfaces as the taxonomized error; an unretryable 5xx is proxied
//! to the client unchanged.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::http::{HeaderMap, HeaderName, HeaderValue};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use serde_json::Value;
use tracing::Instrument;
use uuid::Uuid;

use super::response::{self, PipelineContext, HOP_BY_HOP_HEADERS};
use crate::convert::types::MessagesRequest;
use crate::error::RelayError;
use crate::pool::Endpoint;
use crate::server::AppState;
use crate::transform::Transformer;

/// Correlates client and upstream requests in logs and traces.
pub const REQUEST_ID_HEADER: &str = "x-relay-request-id";

/// Time allowed for the upstream to accept the request and answer with
/// headers. Body streaming is unbounded.
const UPSTREAM_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Outcome of one dispatch attempt.
enum Attempt {
    /// A response is ready for the client (success or a non-retryable
    /// client-facing error).
    Done(Response),
    /// The endpoint failed; a retry on another endpoint may follow.
    Failed(Failure),
}

enum Failure {
    Timeout,
    Transport(String),
    /// Upstream answered >= 500; the response is kept so it can be proxied
    /// unchanged when no retry is possible.
    ServerError(reqwest::Response),
}

impl Failure {
    fn reason(&self) -> String {
        match self {
            Failure::Timeout => "upstream timeout".to_string(),
            Failure::Transport(msg) => msg.clone(),
            Failure::ServerError(resp) => format!("http {}", resp.status().as_u16()),
        }
    }

    fn into_client_response(self) -> Response {
        match self {
            Failure::Timeout => RelayError::Timeout.into_response(),
            Failure::Transport(msg) => RelayError::UpstreamError(msg).into_response(),
            Failure::ServerError(resp) => response::passthrough_response(resp, None),
        }
    }
}

/// Handle one proxied POST.
pub async fn handle_proxy(
    state: Arc<AppState>,
    path_and_query: String,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let request_id = Uuid::new_v4().to_string();
    let typed: Option<MessagesRequest> = serde_json::from_slice(&body).ok();

    let model = typed
        .as_ref()
        .map(|r| r.model.as_str())
        .unwrap_or("unknown")
        .to_string();
    let client_wants_stream = match &typed {
        Some(req) => req.stream,
        // Fall back to sniffing untyped JSON so passthrough bodies still
        // stream correctly.
        None => serde_json::from_slice::<Value>(&body)
            .ok()
            .and_then(|v| v.get("stream").and_then(|s| s.as_bool()))
            .unwrap_or(false),
    };

    let span = relay_tracing::proxy_request_span!(&request_id, &model);

    async {
        let Some(first) = state.balancer.select_next() else {
            return RelayError::ServiceUnavailable.into_response();
        };
        tracing::Span::current().record("endpoint", first.config.name.as_str());

        let mut response = match dispatch(
            &state,
            &first,
            &path_and_query,
            &headers,
            &body,
            typed.as_ref(),
            &request_id,
            client_wants_stream,
        )
        .await
        {
            Attempt::Done(resp) => resp,
            Attempt::Failed(failure) => {
                // One retry, never against the same instance.
                let retry_target = state
                    .balancer
                    .select_next()
                    .filter(|candidate| !Arc::ptr_eq(candidate, &first));
                match retry_target {
                    Some(second) => {
                        tracing::info!(
                            failed = %first.config.name,
                            retry = %second.config.name,
                            reason = %failure.reason(),
                            "retrying on another endpoint"
                        );
                        tracing::Span::current().record("endpoint", second.config.name.as_str());
                        match dispatch(
                            &state,
                            &second,
                            &path_and_query,
                            &headers,
                            &body,
                            typed.as_ref(),
                            &request_id,
                            client_wants_stream,
                        )
                        .await
                        {
                            Attempt::Done(resp) => resp,
                            Attempt::Failed(second_failure) => {
                                second_failure.into_client_response()
                            }
                        }
                    }
                    None => failure.into_client_response(),
                }
            }
        };

        if let Ok(id) = HeaderValue::from_str(&request_id) {
            response
                .headers_mut()
                .insert(HeaderName::from_static(REQUEST_ID_HEADER), id);
        }
        response
    }
    .instrument(span)
    .await
}

/// One upstream dispatch attempt against a chosen endpoint.
#[allow(clippy::too_many_arguments)]
async fn dispatch(
    state: &Arc<AppState>,
    endpoint: &Arc<Endpoint>,
    path_and_query: &str,
    headers: &HeaderMap,
    body: &Bytes,
    typed: Option<&MessagesRequest>,
    request_id: &str,
    client_wants_stream: bool,
) -> Attempt {
    endpoint.note_request();

    let use_transformer =
        endpoint.config.transformer_enabled && state.config.proxy_mode.enable_transform;

    let plan = if use_transformer {
        if endpoint.config.base_url.is_empty() || endpoint.config.api_key.is_empty() {
            return Attempt::Done(
                RelayError::ProxyError(format!(
                    "endpoint {} has transformers enabled but no baseUrl/apiKey",
                    endpoint.config.name
                ))
                .into_response(),
            );
        }
        let Some(req) = typed else {
            return Attempt::Done(
                RelayError::InvalidRequest(
                    "transformer endpoints require a JSON messages body".to_string(),
                )
                .into_response(),
            );
        };
        let Some(transformer) = state.registry.resolve(&endpoint.config) else {
            return Attempt::Done(
                RelayError::Transformer(format!(
                    "no transformer available for endpoint {}",
                    endpoint.config.name
                ))
                .into_response(),
            );
        };
        match transformed_plan(&transformer, endpoint, req, headers) {
            Some(plan) => plan,
            // Conversion failures fall back to a verbatim forward; universal
            // normalization still sees the response.
            None => raw_plan(endpoint, path_and_query, headers, body.clone()),
        }
    } else {
        raw_plan(endpoint, path_and_query, headers, body.clone())
    };

    let span = relay_tracing::upstream_dispatch_span!(request_id, &endpoint.config.name);
    let start = Instant::now();

    let dispatch_result = async {
        let mut builder = state
            .client
            .post(&plan.url)
            .headers(plan.headers.clone())
            .header(REQUEST_ID_HEADER, request_id)
            .body(plan.body.clone());
        for (name, value) in &endpoint.config.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        tokio::time::timeout(UPSTREAM_CONNECT_TIMEOUT, builder.send()).await
    }
    .instrument(span.clone())
    .await;

    let latency = start.elapsed().as_millis() as u64;
    span.record("latency_ms", latency);

    let upstream = match dispatch_result {
        Err(_) => {
            tracing::warn!(endpoint = %endpoint.config.name, "upstream timed out");
            state.balancer.record_failure(endpoint, "upstream timeout");
            return Attempt::Failed(Failure::Timeout);
        }
        Ok(Err(e)) => {
            tracing::warn!(endpoint = %endpoint.config.name, error = %e, "upstream transport error");
            state.balancer.record_failure(endpoint, &e.to_string());
            return Attempt::Failed(Failure::Transport(e.to_string()));
        }
        Ok(Ok(resp)) => resp,
    };

    let status = upstream.status();
    span.record("status", status.as_u16());

    if status.as_u16() >= 500 {
        tracing::warn!(
            endpoint = %endpoint.config.name,
            status = status.as_u16(),
            "upstream server error"
        );
        state
            .balancer
            .record_failure(endpoint, &format!("http {}", status.as_u16()));
        return Attempt::Failed(Failure::ServerError(upstream));
    }

    if state.config.proxy_mode.verbose {
        tracing::info!(
            endpoint = %endpoint.config.name,
            status = status.as_u16(),
            latency_ms = latency,
            "upstream responded"
        );
    }

    // First-token timing feeds the speed-first window.
    let on_first_token: response::FirstTokenHook = {
        let balancer = state.balancer.clone();
        let endpoint = endpoint.clone();
        Box::new(move || {
            balancer.record_success(&endpoint, start.elapsed());
        })
    };

    let response = match plan.transformer {
        Some(transformer) => {
            response::transformed_response(
                upstream,
                PipelineContext {
                    client_wants_stream,
                    transformer,
                    on_first_token: Some(on_first_token),
                },
            )
            .await
        }
        None => response::passthrough_response(upstream, Some(on_first_token)),
    };
    Attempt::Done(response)
}

/// A fully-prepared upstream request.
struct DispatchPlan {
    url: String,
    headers: HeaderMap,
    body: Bytes,
    transformer: Option<Arc<dyn Transformer>>,
}

/// Build the transformer-path plan: normalize for the envelope, format for
/// the body. Returns `None` when conversion fails (the caller falls back to
/// a verbatim forward).
fn transformed_plan(
    transformer: &Arc<dyn Transformer>,
    endpoint: &Endpoint,
    req: &MessagesRequest,
    client_headers: &HeaderMap,
) -> Option<DispatchPlan> {
    let dispatch = match transformer.normalize_request(req, &endpoint.config) {
        Ok(d) => d,
        Err(e) => {
            tracing::warn!(
                transformer = transformer.name(),
                endpoint = %endpoint.config.name,
                error = %e,
                "normalize_request failed, forwarding verbatim"
            );
            return None;
        }
    };
    let body = match transformer.format_request(req, &endpoint.config) {
        Ok(b) => b,
        Err(e) => {
            tracing::warn!(
                transformer = transformer.name(),
                endpoint = %endpoint.config.name,
                error = %e,
                "format_request failed, forwarding verbatim"
            );
            return None;
        }
    };

    let mut headers = dispatch.headers;
    // Carry the caller's User-Agent; reqwest computes Content-Length from
    // the final body.
    if let Some(ua) = client_headers.get(axum::http::header::USER_AGENT) {
        headers.insert(axum::http::header::USER_AGENT, ua.clone());
    }

    Some(DispatchPlan {
        url: dispatch.url,
        headers,
        body: Bytes::from(serde_json::to_vec(&body).unwrap_or_default()),
        transformer: Some(transformer.clone()),
    })
}

/// Build the verbatim-forward plan: original path against the endpoint's
/// base URL, hop-by-hop headers stripped, client credentials replaced with
/// the endpoint's key.
fn raw_plan(
    endpoint: &Endpoint,
    path_and_query: &str,
    client_headers: &HeaderMap,
    body: Bytes,
) -> DispatchPlan {
    let url = format!(
        "{}{}",
        endpoint.config.base_url.trim_end_matches('/'),
        path_and_query
    );

    let mut headers = HeaderMap::new();
    for (name, value) in client_headers.iter() {
        let name_str = name.as_str();
        if HOP_BY_HOP_HEADERS.contains(&name_str) {
            continue;
        }
        // Replaced below with the endpoint's own credentials.
        if name_str == "x-api-key" || name_str == "authorization" {
            continue;
        }
        // reqwest recomputes these for the outbound request.
        if name_str == "content-length" || name_str == REQUEST_ID_HEADER {
            continue;
        }
        headers.insert(name.clone(), value.clone());
    }
    if let Ok(key) = HeaderValue::from_str(&endpoint.config.api_key) {
        headers.insert(HeaderName::from_static("x-api-key"), key);
    }

    DispatchPlan {
        url,
        headers,
        body,
        transformer: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::test_endpoint;

    #[test]
    fn test_raw_plan_header_hygiene() {
        let ep = test_endpoint("a", 0);
        let mut client_headers = HeaderMap::new();
        client_headers.insert("content-type", HeaderValue::from_static("application/json"));
        client_headers.insert("x-api-key", HeaderValue::from_static("client-secret"));
        client_headers.insert("authorization", HeaderValue::from_static("Bearer client"));
        client_headers.insert("connection", HeaderValue::from_static("keep-alive"));
        client_headers.insert("transfer-encoding", HeaderValue::from_static("chunked"));
        client_headers.insert("upgrade", HeaderValue::from_static("h2c"));
        client_headers.insert("proxy-connection", HeaderValue::from_static("keep-alive"));
        client_headers.insert("anthropic-version", HeaderValue::from_static("2023-06-01"));

        let plan = raw_plan(&ep, "/v1/messages", &client_headers, Bytes::new());

        assert_eq!(plan.url, "https://a.example.com/v1/messages");
        // endpoint credentials replace the client's
        assert_eq!(plan.headers.get("x-api-key").unwrap(), "key");
        assert!(plan.headers.get("authorization").is_none());
        // hop-by-hop headers never cross
        for name in HOP_BY_HOP_HEADERS {
            assert!(!plan.headers.contains_key(*name), "{name} leaked");
        }
        // end-to-end headers survive
        assert!(plan.headers.contains_key("anthropic-version"));
        assert!(plan.headers.contains_key("content-type"));
    }

    #[test]
    fn test_raw_plan_preserves_path_and_query() {
        let ep = test_endpoint("a", 0);
        let plan = raw_plan(
            &ep,
            "/v1/messages?beta=true",
            &HeaderMap::new(),
            Bytes::new(),
        );
        assert_eq!(plan.url, "https://a.example.com/v1/messages?beta=true");
    }

    #[test]
    fn test_retry_target_is_never_the_same_instance() {
        use crate::balance::Balancer;
        use crate::pool::EndpointPool;

        // Sole endpoint: the retry filter must yield no target rather than
        // the instance that just failed.
        let pool = Arc::new(EndpointPool::new(vec![test_endpoint("only", 0)
            .config
            .clone()]));
        let balancer = Balancer::new(pool, &Default::default());

        let first = balancer.select_next().unwrap();
        let retry = balancer
            .select_next()
            .filter(|candidate| !Arc::ptr_eq(candidate, &first));
        assert!(retry.is_none());

        // With a second endpoint the retry target is the other instance.
        let pool = Arc::new(EndpointPool::new(vec![
            test_endpoint("a", 0).config.clone(),
            test_endpoint("b", 0).config.clone(),
        ]));
        let balancer = Balancer::new(pool, &Default::default());
        let first = balancer.select_next().unwrap();
        let retry = balancer
            .select_next()
            .filter(|candidate| !Arc::ptr_eq(candidate, &first));
        assert!(!Arc::ptr_eq(&retry.unwrap(), &first));
    }
}
