#![allow(dead_code)]

use std::collections::HashMap;
use std::net::{SocketAddr, TcpListener};
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{header, Method, Request, StatusCode};
use axum::Router;
use envconfig::Envconfig;
use health::HealthRegistry;
use http_body_util::BodyExt;
use once_cell::sync::Lazy;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tower::ServiceExt;

use http_input::api::InputError;
use http_input::config::Config;
use http_input::decode::Decoder;
use http_input::event::{Entry, Event};
use http_input::router::{router, Limits};
use http_input::server::{serve, serve_app, ServerError};
use http_input::sinks::EventSink;
use http_input::time::FixedTime;

pub const NOW: u64 = 1_700_000_000;

pub static DEFAULT_CONFIG: Lazy<Config> = Lazy::new(|| {
    let env: HashMap<String, String> = [
        ("BIND", "127.0.0.1"),
        ("PORT", "0"),
        ("PRINT_SINK", "true"),
        ("EXPORT_PROMETHEUS", "false"),
        ("SHUTDOWN_TIMEOUT", "2000"),
    ]
    .iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect();
    Config::init_from_hashmap(&env).unwrap()
});

static TRACING_INIT: Once = Once::new();
pub fn setup_tracing() {
    TRACING_INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_writer(tracing_subscriber::fmt::TestWriter::new())
            .init()
    });
}

#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    One(Event),
    Batch(String, Vec<Entry>),
}

/// Records sink calls, or fails all of them with a retryable error. A slow sink
/// signals `started` then holds every call for its delay.
#[derive(Clone, Default)]
pub struct MemorySink {
    calls: Arc<Mutex<Vec<Call>>>,
    failing: bool,
    delay: Option<Duration>,
    pub started: Arc<Notify>,
}

impl MemorySink {
    pub fn failing() -> Self {
        Self {
            failing: true,
            ..Default::default()
        }
    }

    pub fn slow(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Default::default()
        }
    }

    async fn hold(&self) {
        self.started.notify_one();
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl EventSink for MemorySink {
    async fn send(&self, event: Event) -> Result<(), InputError> {
        self.hold().await;
        if self.failing {
            return Err(InputError::RetryableSinkError);
        }
        self.calls.lock().unwrap().push(Call::One(event));
        Ok(())
    }

    async fn send_batch(&self, tag: String, entries: Vec<Entry>) -> Result<(), InputError> {
        self.hold().await;
        if self.failing {
            return Err(InputError::RetryableSinkError);
        }
        self.calls.lock().unwrap().push(Call::Batch(tag, entries));
        Ok(())
    }
}

pub fn app(sink: MemorySink, decoder: Decoder) -> Router {
    router(
        FixedTime { time: NOW },
        HealthRegistry::new("liveness"),
        sink,
        decoder,
        Limits {
            concurrency: 4,
            max_body_size: 1024 * 1024,
        },
        false,
    )
}

pub async fn request(
    app: Router,
    method: Method,
    uri: &str,
    content_type: Option<&str>,
    body: impl Into<Body>,
) -> (StatusCode, String) {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(content_type) = content_type {
        builder = builder.header(header::CONTENT_TYPE, content_type);
    }
    let response = app
        .oneshot(builder.body(body.into()).unwrap())
        .await
        .unwrap();

    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    (status, String::from_utf8(body.to_vec()).unwrap())
}

pub async fn post(
    app: Router,
    uri: &str,
    content_type: &str,
    body: impl Into<Body>,
) -> (StatusCode, String) {
    request(app, Method::POST, uri, Some(content_type), body).await
}

/// Runs the full server on an ephemeral port until dropped.
pub struct ServerHandle {
    pub addr: SocketAddr,
    shutdown: Arc<Notify>,
    task: Option<JoinHandle<Result<(), ServerError>>>,
}

impl ServerHandle {
    pub fn for_config(config: Config) -> ServerHandle {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let notify = Arc::new(Notify::new());
        let shutdown = notify.clone();

        let task = tokio::spawn(async move {
            serve(config, listener, async move { notify.notified().await }).await
        });
        ServerHandle {
            addr,
            shutdown,
            task: Some(task),
        }
    }

    /// Serves a prepared router, draining for up to `grace_period` on stop.
    pub fn for_app(app: Router, grace_period: Duration) -> ServerHandle {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let notify = Arc::new(Notify::new());
        let shutdown = notify.clone();

        let task = tokio::spawn(async move {
            serve_app(app, listener, None, grace_period, async move {
                notify.notified().await
            })
            .await
        });
        ServerHandle {
            addr,
            shutdown,
            task: Some(task),
        }
    }

    /// Triggers shutdown without waiting for the server.
    pub fn trigger_shutdown(&self) {
        self.shutdown.notify_one();
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    /// Triggers shutdown and waits for the server to return.
    pub async fn stop(mut self) -> Result<(), ServerError> {
        self.shutdown.notify_one();
        match self.task.take() {
            Some(task) => task.await.unwrap(),
            None => Ok(()),
        }
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        self.shutdown.notify_one()
    }
}
