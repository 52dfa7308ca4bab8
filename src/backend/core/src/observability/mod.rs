//! Observability: tracing, metrics, and logging.

use opentelemetry_otlp::WithExportConfig;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize the observability stack.
///
/// Installs an env-filtered JSON logger; when an OTLP endpoint is configured
/// the OpenTelemetry tracing pipeline is layered on top.
pub fn init(service_name: &str, otlp_endpoint: Option<&str>) -> anyhow::Result<()> {
    if let Some(endpoint) = otlp_endpoint {
        let tracer = opentelemetry_otlp::new_pipeline()
            .tracing()
            .with_exporter(
                opentelemetry_otlp::new_exporter()
                    .tonic()
                    .with_endpoint(endpoint),
            )
            .with_trace_config(
                opentelemetry_sdk::trace::config().with_resource(
                    opentelemetry_sdk::Resource::new(vec![opentelemetry::KeyValue::new(
                        "service.name",
                        service_name.to_string(),
                    )]),
                ),
            )
            .install_batch(opentelemetry_sdk::runtime::Tokio)?;

        let telemetry_layer = tracing_opentelemetry::layer().with_tracer(tracer);

        tracing_subscriber::registry()
            .with(EnvFilter::from_default_env())
            .with(telemetry_layer)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(EnvFilter::from_default_env())
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    }

    Ok(())
}

/// Shutdown OpenTelemetry.
pub fn shutdown() {
    opentelemetry::global::shutdown_tracer_provider();
}

/// Metric descriptions, registered once at startup.
pub mod metrics {
    use metrics::{describe_counter, describe_gauge};

    pub fn register_metrics() {
        describe_counter!(
            "vitrine_catalog_requests_total",
            "Catalog requests by cache disposition (hit/stale/miss/degraded)"
        );
        describe_counter!(
            "vitrine_upstream_requests_total",
            "Requests issued to the upstream commerce API"
        );
        describe_counter!(
            "vitrine_upstream_retries_total",
            "Upstream request attempts that were retried"
        );
        describe_counter!(
            "vitrine_upstream_failures_total",
            "Upstream requests that failed after exhausting retries"
        );
        describe_counter!(
            "vitrine_cache_hits_total",
            "Cache hits by backend tier"
        );
        describe_counter!(
            "vitrine_cache_misses_total",
            "Cache misses by backend tier"
        );
        describe_counter!(
            "vitrine_cache_errors_total",
            "Swallowed cache-tier failures"
        );
        describe_counter!(
            "vitrine_category_resolutions_total",
            "Category resolutions by outcome"
        );
        describe_counter!(
            "vitrine_normalization_failures_total",
            "Product records that degraded during normalization"
        );
        describe_counter!(
            "vitrine_tag_fallbacks_total",
            "Tag filters that fell back to manual matching"
        );
        describe_counter!("vitrine_errors_total", "Structured errors by code");
        describe_gauge!(
            "vitrine_inflight_fetches",
            "Catalog fetch pipelines currently in flight"
        );
    }
}
