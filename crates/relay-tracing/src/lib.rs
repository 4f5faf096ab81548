//! Tracing bootstrap for relay-proxy: stderr fmt logging with optional OTLP
//! span export.
//!
//! This crate is serde-free: the gateway materializes [`TracingOptions`]
//! from its own configuration layer and hands them over at startup. Export
//! is best-effort — a collector that cannot be reached degrades to
//! fmt-only logging instead of failing the boot.

pub mod spans;

use anyhow::Result;
use opentelemetry::trace::TracerProvider;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::trace::SdkTracerProvider;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// How to reach the OTLP collector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OtlpTransport {
    Grpc,
    Http,
}

/// Parameters for [`init_tracing`].
#[derive(Debug, Clone)]
pub struct TracingOptions {
    /// Service name reported on exported spans.
    pub service_name: String,
    /// Collector endpoint; `None` disables span export entirely.
    pub otlp_endpoint: Option<String>,
    pub transport: OtlpTransport,
    /// Env-filter directive string (e.g. "info", "relay_proxy=debug,info").
    pub log_level: String,
}

/// RAII guard that flushes exported spans on drop.
pub struct TracingGuard {
    provider: Option<SdkTracerProvider>,
}

impl Drop for TracingGuard {
    fn drop(&mut self) {
        if let Some(ref mut provider) = self.provider {
            if let Err(e) = provider.shutdown() {
                eprintln!("Failed to shutdown tracer provider: {e}");
            }
        }
    }
}

/// Install the global subscriber: an env-filtered fmt layer on stderr, plus
/// an OTLP span layer when an endpoint is configured and the exporter
/// builds. Hold the returned guard for the process lifetime.
pub fn init_tracing(options: &TracingOptions) -> TracingGuard {
    let mut export_error = None;
    let (provider, otlp_layer) = match build_provider(options) {
        Ok(Some(provider)) => {
            let tracer = provider.tracer(options.service_name.clone());
            let layer = tracing_opentelemetry::layer().with_tracer(tracer);
            (Some(provider), Some(layer))
        }
        Ok(None) => (None, None),
        Err(e) => {
            export_error = Some(e.to_string());
            (None, None)
        }
    };

    let filter =
        EnvFilter::try_new(&options.log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(otlp_layer)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_writer(std::io::stderr),
        )
        .with(filter)
        .init();

    // The subscriber exists now; report how export setup went through it.
    match (&provider, export_error) {
        (_, Some(error)) => tracing::warn!(
            error = %error,
            "OTLP exporter failed to initialize, running with fmt-only tracing"
        ),
        (Some(_), None) => tracing::info!(
            service = %options.service_name,
            transport = ?options.transport,
            "OTLP span export enabled"
        ),
        (None, None) => {}
    }

    TracingGuard { provider }
}

/// Build the span exporter pipeline, or `None` when export is disabled.
fn build_provider(options: &TracingOptions) -> Result<Option<SdkTracerProvider>> {
    let Some(endpoint) = options.otlp_endpoint.as_deref() else {
        return Ok(None);
    };

    let exporter = match options.transport {
        OtlpTransport::Grpc => opentelemetry_otlp::SpanExporter::builder()
            .with_tonic()
            .with_endpoint(endpoint)
            .build()?,
        OtlpTransport::Http => opentelemetry_otlp::SpanExporter::builder()
            .with_http()
            .with_endpoint(endpoint)
            .build()?,
    };

    let provider = SdkTracerProvider::builder()
        .with_batch_exporter(exporter)
        .with_resource(
            opentelemetry_sdk::Resource::builder_empty()
                .with_service_name(options.service_name.clone())
                .build(),
        )
        .build();

    Ok(Some(provider))
}
