use std::future::Future;
use std::io;
use std::net::TcpListener;

use axum::Router;
use axum_server::tls_rustls::RustlsConfig;
use axum_server::Handle;
use health::{HealthHandle, HealthRegistry};
use thiserror::Error;
use time::Duration;
use tokio::net::TcpSocket;
use tracing::{error, info, warn};

use crate::config::{Config, ConfigError, SslKeys};
use crate::decode::Decoder;
use crate::router::{self, Limits};
use crate::sinks::kafka::KafkaSink;
use crate::sinks::print::PrintSink;
use crate::{parser, time::SystemTime};

/// Pending connections queued by the kernel when `BACKLOG` is not set.
pub const DEFAULT_BACKLOG: u32 = 1024;

const HEARTBEAT_INTERVAL: std::time::Duration = std::time::Duration::from_secs(10);

#[derive(Error, Debug)]
pub enum ServerError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("failed to load TLS keys: {0}")]
    Tls(#[source] io::Error),
    #[error("failed to start sink: {0}")]
    Sink(#[from] anyhow::Error),
    #[error("server error: {0}")]
    Io(#[from] io::Error),
}

/// Binds the configured address with the configured listen backlog.
pub async fn bind_listener(config: &Config) -> Result<TcpListener, ServerError> {
    let address = config.address()?;
    let socket = if address.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    socket.bind(address)?;
    let listener = socket.listen(config.backlog.unwrap_or(DEFAULT_BACKLOG))?;
    Ok(listener.into_std()?)
}

/// Serves until `shutdown` resolves, then stops accepting and gives in-flight
/// requests up to `SHUTDOWN_TIMEOUT` to complete.
pub async fn serve<F>(config: Config, listener: TcpListener, shutdown: F) -> Result<(), ServerError>
where
    F: Future<Output = ()> + Send + 'static,
{
    config.validate()?;

    let liveness = HealthRegistry::new("liveness");
    let decoder = Decoder::new(parser::build(&config.format, &config.parser)?);
    let limits = Limits {
        concurrency: config.max_threads,
        max_body_size: config.max_body_size,
    };

    info!(
        format = %config.format,
        min_threads = config.min_threads,
        max_threads = config.max_threads,
        use_ssl = config.use_ssl,
        "starting http input"
    );

    let mut kafka_sink = None;
    let app = if config.print_sink {
        router::router(
            SystemTime {},
            liveness.clone(),
            PrintSink {},
            decoder,
            limits,
            config.export_prometheus,
        )
    } else {
        let sink_liveness = liveness.register("rdkafka", Duration::seconds(30)).await;
        let sink = KafkaSink::new(config.kafka.clone(), sink_liveness)?;
        kafka_sink = Some(sink.clone());
        router::router(
            SystemTime {},
            liveness.clone(),
            sink,
            decoder,
            limits,
            config.export_prometheus,
        )
    };

    let tls = match (&config.ssl_keys, config.use_ssl) {
        (Some(keys), true) => Some(load_tls(keys).await?),
        _ => None,
    };

    let server_liveness = liveness
        .register("http_server", Duration::seconds(30))
        .await;
    let heartbeat = tokio::spawn(report_alive(server_liveness));

    let result = serve_app(app, listener, tls, config.shutdown_timeout.0, shutdown).await;
    heartbeat.abort();

    if let Some(sink) = kafka_sink {
        match tokio::task::spawn_blocking(move || sink.flush()).await {
            Ok(Ok(())) => info!("flushed pending Kafka messages"),
            Ok(Err(err)) => warn!("failed to flush Kafka producer: {}", err),
            Err(err) => warn!("Kafka flush task failed: {}", err),
        }
    }

    match &result {
        Ok(()) => info!("HTTP server graceful shutdown completed"),
        Err(err) => error!("HTTP server stopped: {}", err),
    }
    result
}

/// Serves `app` on `listener` until `shutdown` resolves. Accepting stops at once,
/// connections still open after `grace_period` are closed.
pub async fn serve_app<F>(
    app: Router,
    listener: TcpListener,
    tls: Option<RustlsConfig>,
    grace_period: std::time::Duration,
    shutdown: F,
) -> Result<(), ServerError>
where
    F: Future<Output = ()> + Send + 'static,
{
    listener.set_nonblocking(true)?;
    info!("listening on {:?}", listener.local_addr()?);

    let handle = Handle::new();
    let shutdown_handle = handle.clone();
    tokio::spawn(async move {
        shutdown.await;
        info!("shutdown signal received, draining for up to {:?}", grace_period);
        shutdown_handle.graceful_shutdown(Some(grace_period));
    });

    let service = app.into_make_service();
    match tls {
        Some(tls) => {
            axum_server::from_tcp_rustls(listener, tls)
                .handle(handle)
                .serve(service)
                .await?
        }
        None => {
            axum_server::from_tcp(listener)
                .handle(handle)
                .serve(service)
                .await?
        }
    };
    Ok(())
}

async fn load_tls(keys: &SslKeys) -> Result<RustlsConfig, ServerError> {
    info!(cert = ?keys.cert, key = ?keys.key, "loading TLS keys");
    RustlsConfig::from_pem_file(&keys.cert, &keys.key)
        .await
        .map_err(ServerError::Tls)
}

async fn report_alive(liveness: HealthHandle) {
    let mut interval = tokio::time::interval(HEARTBEAT_INTERVAL);
    loop {
        interval.tick().await;
        liveness.report_healthy().await;
    }
}
