use std::process::ExitCode;
use std::time::Duration;

use envconfig::Envconfig;
use opentelemetry::trace::TraceError;
use opentelemetry::{KeyValue, Value};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::trace::{BatchConfig, RandomIdGenerator, Sampler, Tracer};
use opentelemetry_sdk::{runtime, Resource};
use tokio::signal;
use tracing::level_filters::LevelFilter;
use tracing_opentelemetry::OpenTelemetryLayer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use http_input::config::Config;
use http_input::server::{bind_listener, serve};

async fn shutdown() {
    let mut term = signal::unix::signal(signal::unix::SignalKind::terminate())
        .expect("failed to register SIGTERM handler");

    let mut interrupt = signal::unix::signal(signal::unix::SignalKind::interrupt())
        .expect("failed to register SIGINT handler");

    tokio::select! {
        _ = term.recv() => {},
        _ = interrupt.recv() => {},
    };

    tracing::info!("Shutting down gracefully...");
}

fn init_tracer(sink_url: &str, sampling_rate: f64, service_name: &str) -> Result<Tracer, TraceError> {
    opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_trace_config(
            opentelemetry_sdk::trace::Config::default()
                .with_sampler(Sampler::ParentBased(Box::new(Sampler::TraceIdRatioBased(
                    sampling_rate,
                ))))
                .with_id_generator(RandomIdGenerator::default())
                .with_resource(Resource::new(vec![KeyValue::new(
                    "service.name",
                    Value::from(service_name.to_string()),
                )])),
        )
        .with_batch_config(BatchConfig::default())
        .with_exporter(
            opentelemetry_otlp::new_exporter()
                .tonic()
                .with_endpoint(sink_url)
                .with_timeout(Duration::from_secs(3)),
        )
        .install_batch(runtime::Tokio)
}

async fn run(config: Config) -> ExitCode {
    // Instantiate tracing outputs:
    //   - stdout with a level configured by the RUST_LOG envvar (default=INFO)
    //   - OpenTelemetry if enabled, for levels LOG_LEVEL and higher
    let log_layer = tracing_subscriber::fmt::layer().with_filter(
        EnvFilter::builder()
            .with_default_directive(LevelFilter::INFO.into())
            .from_env_lossy(),
    );
    let tracer = match config.otel_url.as_deref() {
        Some(url) => match init_tracer(url, config.otel_sampling_rate, &config.otel_service_name) {
            Ok(tracer) => Some(tracer),
            Err(err) => {
                eprintln!("failed to start OpenTelemetry exporter: {err}");
                None
            }
        },
        None => None,
    };
    let otel_layer = tracer
        .map(OpenTelemetryLayer::new)
        .with_filter(LevelFilter::from_level(config.log_level));
    tracing_subscriber::registry()
        .with(log_layer)
        .with(otel_layer)
        .init();

    let listener = match bind_listener(&config).await {
        Ok(listener) => listener,
        Err(err) => {
            tracing::error!("could not bind {}:{}: {}", config.bind, config.port, err);
            return ExitCode::FAILURE;
        }
    };

    match serve(config, listener, shutdown()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!("http input failed: {}", err);
            ExitCode::FAILURE
        }
    }
}

fn main() -> ExitCode {
    let config = match Config::init_from_env() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("Invalid configuration: {err}");
            return ExitCode::FAILURE;
        }
    };
    if let Err(err) = config.validate() {
        eprintln!("Invalid configuration: {err}");
        return ExitCode::FAILURE;
    }

    // MAX_THREADS bounds both the worker pool and in-flight requests
    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.max_threads)
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("failed to start tokio runtime: {err}");
            return ExitCode::FAILURE;
        }
    };

    runtime.block_on(run(config))
}
