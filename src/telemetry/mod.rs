//! # Telemetry
//!
//! Sets up `tracing` for the whole process: a compact console layer filtered
//! by `RUST_LOG` (or the CLI verbosity), plus an optional OpenTelemetry layer
//! exporting spans over OTLP/gRPC.
//!
//! The pipeline run, each endpoint evaluation and each HTTP fetch are spans,
//! so one exported trace shows a whole validation run.
//!
//! ## Environment
//!
//! - `OTEL_SERVICE_NAME`: service name (default `apisense-daemon`)
//! - `OTEL_EXPORTER_OTLP_ENDPOINT`: collector URL; unset means console only
//! - `OTEL_TRACES_SAMPLER_ARG`: sampling ratio between 0.0 and 1.0
//!
//! Call [`shutdown_telemetry`] before exiting so batched spans are flushed.

use opentelemetry::trace::TracerProvider as _;
use opentelemetry::{global, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::runtime::Tokio;
use opentelemetry_sdk::trace::{RandomIdGenerator, Sampler, Tracer, TracerProvider};
use opentelemetry_sdk::{trace as sdktrace, Resource};
use tracing::Level;
use tracing_opentelemetry::OpenTelemetryLayer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

pub const DEFAULT_SERVICE_NAME: &str = "apisense-daemon";

#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    pub service_name: String,

    /// OTLP collector, e.g. `http://localhost:4317`. `None` logs to the
    /// console only.
    pub otlp_endpoint: Option<String>,

    /// 1.0 keeps every trace, 0.0 none.
    pub sampling_ratio: f64,

    pub enable_console_logging: bool,

    /// Used when `RUST_LOG` is not set.
    pub log_level: Level,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: DEFAULT_SERVICE_NAME.to_string(),
            otlp_endpoint: None,
            sampling_ratio: 1.0,
            enable_console_logging: true,
            log_level: Level::INFO,
        }
    }
}

impl TelemetryConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(name) = std::env::var("OTEL_SERVICE_NAME") {
            config.service_name = name;
        }

        if let Ok(endpoint) = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT") {
            if !endpoint.trim().is_empty() {
                config.otlp_endpoint = Some(endpoint);
            }
        }

        if let Ok(ratio) = std::env::var("OTEL_TRACES_SAMPLER_ARG") {
            if let Ok(r) = ratio.parse::<f64>() {
                config.sampling_ratio = r.clamp(0.0, 1.0);
            }
        }

        config
    }

    /// `-v` switches the default level to DEBUG, `-vv` to TRACE.
    pub fn with_verbosity(mut self, verbose: u8) -> Self {
        self.log_level = match verbose {
            0 => Level::INFO,
            1 => Level::DEBUG,
            _ => Level::TRACE,
        };
        self
    }
}

/// Installs the global subscriber. Returns the tracer when OTLP is enabled.
pub fn init_telemetry(config: TelemetryConfig) -> anyhow::Result<Option<Tracer>> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.to_string()));

    if let Some(endpoint) = &config.otlp_endpoint {
        let tracer = init_otlp_tracer(&config.service_name, endpoint, config.sampling_ratio)?;
        let telemetry_layer = OpenTelemetryLayer::new(tracer.clone());

        let subscriber = tracing_subscriber::registry()
            .with(env_filter)
            .with(telemetry_layer);

        if config.enable_console_logging {
            subscriber
                .with(tracing_subscriber::fmt::layer().compact().with_writer(std::io::stderr))
                .try_init()?;
        } else {
            subscriber.try_init()?;
        }

        tracing::info!(
            service_name = %config.service_name,
            endpoint = %endpoint,
            sampling_ratio = config.sampling_ratio,
            "OTLP telemetry initialized"
        );

        Ok(Some(tracer))
    } else {
        let subscriber = tracing_subscriber::registry().with(env_filter);

        if config.enable_console_logging {
            subscriber
                .with(tracing_subscriber::fmt::layer().compact().with_writer(std::io::stderr))
                .try_init()?;
        } else {
            subscriber.try_init()?;
        }

        tracing::debug!("telemetry initialized (console only)");
        Ok(None)
    }
}

fn init_otlp_tracer(
    service_name: &str,
    endpoint: &str,
    sampling_ratio: f64,
) -> anyhow::Result<Tracer> {
    let sampler = if sampling_ratio >= 1.0 {
        Sampler::AlwaysOn
    } else if sampling_ratio <= 0.0 {
        Sampler::AlwaysOff
    } else {
        Sampler::TraceIdRatioBased(sampling_ratio)
    };

    let tracer_provider = TracerProvider::builder()
        .with_batch_exporter(
            opentelemetry_otlp::new_exporter()
                .tonic()
                .with_endpoint(endpoint)
                .build_span_exporter()?,
            Tokio,
        )
        .with_config(
            sdktrace::Config::default()
                .with_sampler(sampler)
                .with_id_generator(RandomIdGenerator::default())
                .with_resource(Resource::new(vec![KeyValue::new(
                    "service.name",
                    service_name.to_string(),
                )])),
        )
        .build();

    let tracer = tracer_provider.tracer(service_name.to_string());
    global::set_tracer_provider(tracer_provider);

    Ok(tracer)
}

/// Flushes pending spans.
pub fn shutdown_telemetry() {
    global::shutdown_tracer_provider();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = TelemetryConfig::default();
        assert_eq!(config.service_name, "apisense-daemon");
        assert!(config.otlp_endpoint.is_none());
        assert_eq!(config.sampling_ratio, 1.0);
        assert_eq!(config.log_level, Level::INFO);
    }

    #[test]
    fn test_verbosity_levels() {
        assert_eq!(TelemetryConfig::default().with_verbosity(1).log_level, Level::DEBUG);
        assert_eq!(TelemetryConfig::default().with_verbosity(4).log_level, Level::TRACE);
        assert_eq!(TelemetryConfig::default().with_verbosity(0).log_level, Level::INFO);
    }
}
