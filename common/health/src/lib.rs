//! Liveness reporting for the long-running parts of the input service.
//!
//! Every component that must keep running for the process to be trusted with
//! events (the HTTP listener, the Kafka producer loop, ...) registers itself
//! and then reports on a schedule. The process is live only when every
//! registered component reported healthy before its own deadline.
//!
//! An empty registry is unhealthy: the probe stays red until at least one
//! component has registered.

use std::collections::BTreeMap;
use std::ops::Add;
use std::sync::{Arc, RwLock};

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use time::{Duration, OffsetDateTime};
use tokio::sync::mpsc;
use tracing::{debug, warn};

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ComponentStatus {
    /// Registered, no report yet
    Starting,
    /// Reported healthy, must report again before this instant
    HealthyUntil(OffsetDateTime),
    /// Reported itself broken
    Unhealthy,
    /// Missed its reporting deadline
    Stalled,
}

#[derive(Default, Debug)]
pub struct HealthStatus {
    pub healthy: bool,
    pub components: BTreeMap<String, ComponentStatus>,
}

impl IntoResponse for HealthStatus {
    fn into_response(self) -> Response {
        let body = format!("{:?}", self);
        let status = if self.healthy {
            StatusCode::OK
        } else {
            StatusCode::INTERNAL_SERVER_ERROR
        };
        (status, body).into_response()
    }
}

struct Report {
    component: String,
    status: ComponentStatus,
}

/// Handed to a registered component so it can report its status.
#[derive(Clone)]
pub struct HealthHandle {
    component: String,
    deadline: Duration,
    sender: mpsc::Sender<Report>,
}

impl HealthHandle {
    pub fn component(&self) -> &str {
        &self.component
    }

    /// Must be called more often than the deadline given at registration.
    pub async fn report_healthy(&self) {
        self.report_status(self.healthy_until()).await
    }

    pub async fn report_status(&self, status: ComponentStatus) {
        if let Err(err) = self.sender.send(self.report(status)).await {
            warn!(component = %self.component, "failed to report health status: {}", err)
        }
    }

    /// Same as `report_healthy`, for callers running outside of the async runtime
    /// (librdkafka callbacks run on their own threads).
    pub fn report_healthy_blocking(&self) {
        let status = self.healthy_until();
        if let Err(err) = self.sender.blocking_send(self.report(status)) {
            warn!(component = %self.component, "failed to report health status: {}", err)
        }
    }

    fn healthy_until(&self) -> ComponentStatus {
        ComponentStatus::HealthyUntil(OffsetDateTime::now_utc().add(self.deadline))
    }

    fn report(&self, status: ComponentStatus) -> Report {
        Report {
            component: self.component.clone(),
            status,
        }
    }
}

#[derive(Clone)]
pub struct HealthRegistry {
    name: String,
    components: Arc<RwLock<BTreeMap<String, ComponentStatus>>>,
    sender: mpsc::Sender<Report>,
}

impl HealthRegistry {
    /// Must be called from within a tokio runtime, the registry spawns its
    /// own task to apply reports.
    pub fn new(name: &str) -> Self {
        let (sender, mut receiver) = mpsc::channel::<Report>(16);
        let components: Arc<RwLock<BTreeMap<String, ComponentStatus>>> = Default::default();

        let writer = components.clone();
        tokio::spawn(async move {
            while let Some(report) = receiver.recv().await {
                match writer.write() {
                    Ok(mut map) => {
                        map.insert(report.component, report.status);
                    }
                    Err(_) => warn!("health registry lock is poisoned"),
                }
            }
        });

        Self {
            name: name.to_owned(),
            components,
            sender,
        }
    }

    pub async fn register(&self, component: &str, deadline: Duration) -> HealthHandle {
        let handle = HealthHandle {
            component: component.to_owned(),
            deadline,
            sender: self.sender.clone(),
        };
        handle.report_status(ComponentStatus::Starting).await;
        handle
    }

    /// Usable directly as an axum handler body.
    pub fn get_status(&self) -> HealthStatus {
        let now = OffsetDateTime::now_utc();
        let mut status = HealthStatus::default();

        let Ok(components) = self.components.read() else {
            warn!("{} health registry lock is poisoned", self.name);
            return status;
        };

        status.healthy = !components.is_empty();
        for (name, component) in components.iter() {
            let component = match component {
                ComponentStatus::HealthyUntil(until) if *until > now => component.clone(),
                ComponentStatus::HealthyUntil(_) => ComponentStatus::Stalled,
                other => other.clone(),
            };
            if !matches!(component, ComponentStatus::HealthyUntil(_)) {
                status.healthy = false;
            }
            status.components.insert(name.clone(), component);
        }

        if status.healthy {
            debug!("{} health check ok", self.name);
        } else {
            warn!("{} health check failed: {:?}", self.name, status.components);
        }
        status
    }
}
