use opentelemetry::{KeyValue, global, trace::TracerProvider as _};
use opentelemetry_otlp::{MetricExporter, SpanExporter, WithExportConfig, WithTonicConfig};
use opentelemetry_sdk::{
    Resource,
    metrics::{PeriodicReader, SdkMeterProvider},
    propagation::TraceContextPropagator,
    trace::{RandomIdGenerator, Sampler, SdkTracerProvider},
};
use opentelemetry_semantic_conventions::{SCHEMA_URL, attribute::SERVICE_VERSION};
use time::macros::format_description;
use tonic::transport::ClientTlsConfig;
use tracing::Level;
use tracing_opentelemetry::{MetricsLayer, OpenTelemetryLayer};
use tracing_subscriber::{
    EnvFilter, Layer, fmt::time::LocalTime, layer::SubscriberExt, util::SubscriberInitExt,
};

use crate::factories::observability::{
    Observability, ObservabilityConfig, error::ObservabilityError,
};

impl Drop for Observability {
    fn drop(&mut self) {
        if let Some(provider) = &self.tracer_provider
            && let Err(err) = provider.shutdown()
        {
            eprintln!("{err:?}");
        }
        if let Some(provider) = &self.meter_provider
            && let Err(err) = provider.shutdown()
        {
            eprintln!("{err:?}");
        }
    }
}

fn level(tracing_level: Option<&str>) -> Level {
    match tracing_level {
        Some("TRACE") => Level::TRACE,
        Some("DEBUG") => Level::DEBUG,
        Some("WARN") => Level::WARN,
        Some("ERROR") => Level::ERROR,
        _ => Level::INFO,
    }
}

impl Observability {
    /// Installs the global tracing subscriber. The returned value shuts the
    /// OpenTelemetry providers down when dropped.
    pub async fn init(
        cargo_crate_name: String,
        cargo_pkg_version: String,
        cfg: &ObservabilityConfig,
    ) -> Result<Observability, ObservabilityError> {
        global::set_text_map_propagator(TraceContextPropagator::new());

        let endpoint = cfg
            .otel_exporter_otlp_endpoint
            .as_deref()
            .filter(|e| !e.is_empty());

        let (tracer_provider, meter_provider) = match endpoint {
            Some(endpoint) => {
                let resource = Self::get_resource(&cargo_crate_name, &cargo_pkg_version);
                (
                    Some(Self::init_tracer_provider(resource.clone(), endpoint)?),
                    Some(Self::init_meter_provider(resource, endpoint)?),
                )
            }
            None => (None, None),
        };

        let open_telemetry_layer = tracer_provider
            .as_ref()
            .map(|p| OpenTelemetryLayer::new(p.tracer("tracing-otel-subscriber")));
        let metrics_layer = meter_provider
            .as_ref()
            .map(|p| MetricsLayer::new(p.clone()));

        let level = level(cfg.tracing_level.as_deref());
        let env_filter = match cfg.rust_log.as_deref() {
            Some(rust_log) => EnvFilter::new(rust_log),
            None => EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(level.as_str().to_lowercase())),
        };

        let timer = LocalTime::new(format_description!(
            "[year]-[month]-[day] [hour]:[minute]:[second]"
        ));
        let with_file = cfg.with_file.unwrap_or(true);
        let with_line_number = cfg.with_line_number.unwrap_or(true);

        let fmt_layer = if cfg.log_format.as_deref() == Some("pretty") {
            tracing_subscriber::fmt::layer()
                .with_ansi(true)
                .with_timer(timer)
                .with_target(false)
                .with_file(with_file)
                .with_line_number(with_line_number)
                .compact()
                .boxed()
        } else {
            tracing_subscriber::fmt::layer()
                .with_timer(timer)
                .with_target(false)
                .with_file(with_file)
                .with_line_number(with_line_number)
                .json()
                .flatten_event(true)
                .with_span_list(false)
                .boxed()
        };

        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .with(metrics_layer)
            .with(open_telemetry_layer)
            .try_init()?;

        Ok(Observability {
            tracer_provider,
            meter_provider,
        })
    }

    fn get_resource(cargo_crate_name: &str, cargo_pkg_version: &str) -> Resource {
        Resource::builder()
            .with_service_name(cargo_crate_name.to_string())
            .with_schema_url(
                [KeyValue::new(
                    SERVICE_VERSION,
                    cargo_pkg_version.to_string(),
                )],
                SCHEMA_URL,
            )
            .build()
    }

    fn tls_config(endpoint: &str) -> Option<ClientTlsConfig> {
        endpoint
            .starts_with("https://")
            .then(|| ClientTlsConfig::new().with_native_roots())
    }

    fn init_tracer_provider(
        resource: Resource,
        endpoint: &str,
    ) -> Result<SdkTracerProvider, ObservabilityError> {
        println!("📤 Initializing OTLP trace exporter...");

        let mut exporter = SpanExporter::builder()
            .with_tonic()
            .with_endpoint(endpoint)
            .with_compression(opentelemetry_otlp::Compression::Gzip);
        if let Some(tls_config) = Self::tls_config(endpoint) {
            exporter = exporter.with_tls_config(tls_config);
        }
        let trace_exporter = exporter.build()?;

        let tracer_provider = SdkTracerProvider::builder()
            .with_id_generator(RandomIdGenerator::default())
            .with_batch_exporter(trace_exporter)
            .with_sampler(Sampler::AlwaysOn)
            .with_resource(resource)
            .build();

        global::set_tracer_provider(tracer_provider.clone());
        println!("✅ Tracer provider registered globally");

        Ok(tracer_provider)
    }

    fn init_meter_provider(
        resource: Resource,
        endpoint: &str,
    ) -> Result<SdkMeterProvider, ObservabilityError> {
        println!("📊 Initializing OTLP metric exporter...");

        let mut exporter = MetricExporter::builder()
            .with_tonic()
            .with_endpoint(endpoint)
            .with_compression(opentelemetry_otlp::Compression::Gzip);
        if let Some(tls_config) = Self::tls_config(endpoint) {
            exporter = exporter.with_tls_config(tls_config);
        }
        let metric_exporter = exporter.build()?;

        let reader = PeriodicReader::builder(metric_exporter)
            .with_interval(std::time::Duration::from_secs(30))
            .build();

        let meter_provider = SdkMeterProvider::builder()
            .with_resource(resource)
            .with_reader(reader)
            .build();

        global::set_meter_provider(meter_provider.clone());
        println!("✅ Meter provider registered globally");

        Ok(meter_provider)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_levels_fall_back_to_info() {
        assert_eq!(level(Some("DEBUG")), Level::DEBUG);
        assert_eq!(level(Some("verbose")), Level::INFO);
        assert_eq!(level(None), Level::INFO);
    }

    #[test]
    fn only_https_endpoints_get_tls() {
        assert!(Observability::tls_config("https://otel.example.com:4317").is_some());
        assert!(Observability::tls_config("http://localhost:4317").is_none());
    }
}
