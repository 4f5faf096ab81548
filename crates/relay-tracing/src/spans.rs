//! Span builder helpers for relay-proxy instrumentation.

/// Create a tracing span for the top-level proxied request.
///
/// Usage: `let span = proxy_request_span!(request_id, model);`
///
/// Fields recorded later by the request pipeline:
/// - `endpoint`: name of the upstream endpoint the request was dispatched to
/// - `ttft_ms`: milliseconds from dispatch to the first upstream byte
/// - `status`: upstream HTTP status
#[macro_export]
macro_rules! proxy_request_span {
    ($request_id:expr, $model:expr) => {
        tracing::info_span!(
            "proxy_request",
            request_id = %$request_id,
            model = %$model,
            endpoint = tracing::field::Empty,
            ttft_ms = tracing::field::Empty,
            status = tracing::field::Empty,
        )
    };
}

/// Create a tracing span for a single upstream dispatch attempt.
#[macro_export]
macro_rules! upstream_dispatch_span {
    ($request_id:expr, $endpoint:expr) => {
        tracing::info_span!(
            "upstream_dispatch",
            request_id = %$request_id,
            endpoint = %$endpoint,
            status = tracing::field::Empty,
            latency_ms = tracing::field::Empty,
        )
    };
}

/// Create a tracing span for a health probe against one endpoint.
#[macro_export]
macro_rules! health_probe_span {
    ($endpoint:expr, $kind:expr) => {
        tracing::info_span!(
            "health_probe",
            endpoint = %$endpoint,
            kind = %$kind,
            healthy = tracing::field::Empty,
            latency_ms = tracing::field::Empty,
        )
    };
}
