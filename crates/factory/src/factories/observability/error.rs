use thiserror::Error;

#[derive(Error, Debug)]
pub enum ObservabilityError {
    #[error("OTLP exporter error, {0}")]
    ExporterError(#[from] opentelemetry_otlp::ExporterBuildError),
    #[error("Tracing subscriber error, {0}")]
    SubscriberError(#[from] tracing_subscriber::util::TryInitError),
}
