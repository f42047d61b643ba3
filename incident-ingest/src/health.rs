//! Liveness reporting for the long-running loops of the service.
//!
//! Each loop registers a component and must report healthy more often than its
//! deadline. The process is live only while every registered component is.
//! A loop that stops reporting (stuck in a retry, blocked on a dead broker)
//! goes stale and fails the probe, so the orchestrator restarts the process.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use time::{Duration, OffsetDateTime};
use tracing::{info, warn};

#[derive(Default, Debug)]
pub struct HealthStatus {
    /// True when every registered component is healthy
    pub healthy: bool,
    pub components: HashMap<String, ComponentStatus>,
}

impl IntoResponse for HealthStatus {
    fn into_response(self) -> Response {
        let body = format!("{:?}", self);
        match self.healthy {
            true => (StatusCode::OK, body),
            false => (StatusCode::INTERNAL_SERVER_ERROR, body),
        }
        .into_response()
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ComponentStatus {
    /// Registered, has not reported yet
    Starting,
    /// Must report again before the deadline
    HealthyUntil(OffsetDateTime),
    Unhealthy(String),
    /// Missed its deadline
    Stalled,
}

type Components = Arc<RwLock<HashMap<String, ComponentStatus>>>;

/// Held by a component to report its own status.
#[derive(Clone)]
pub struct HealthHandle {
    component: String,
    deadline: Duration,
    components: Components,
}

impl HealthHandle {
    /// Must be called more frequently than the registered deadline.
    pub fn report_healthy(&self) {
        let until = OffsetDateTime::now_utc() + self.deadline;
        self.report_status(ComponentStatus::HealthyUntil(until));
    }

    pub fn report_unhealthy(&self, reason: impl Into<String>) {
        self.report_status(ComponentStatus::Unhealthy(reason.into()));
    }

    pub fn report_status(&self, status: ComponentStatus) {
        let mut components = self
            .components
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        components.insert(self.component.clone(), status);
    }
}

#[derive(Clone)]
pub struct HealthRegistry {
    name: String,
    components: Components,
}

impl HealthRegistry {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            components: Default::default(),
        }
    }

    /// Registers a component in the `Starting` state. The returned handle is
    /// passed to the component so it can report on its own.
    pub fn register(&self, component: &str, deadline: std::time::Duration) -> HealthHandle {
        let handle = HealthHandle {
            component: component.to_owned(),
            deadline: Duration::try_from(deadline).unwrap_or(Duration::MAX),
            components: self.components.clone(),
        };
        handle.report_status(ComponentStatus::Starting);
        handle
    }

    /// Overall process status. Can be used as an axum handler.
    pub fn get_status(&self) -> HealthStatus {
        let components = self
            .components
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let now = OffsetDateTime::now_utc();

        // unhealthy until something registers
        let mut result = HealthStatus {
            healthy: !components.is_empty(),
            components: HashMap::with_capacity(components.len()),
        };
        for (name, status) in components.iter() {
            let status = match status {
                ComponentStatus::HealthyUntil(until) if *until > now => status.clone(),
                ComponentStatus::HealthyUntil(_) => ComponentStatus::Stalled,
                other => other.clone(),
            };
            if !matches!(status, ComponentStatus::HealthyUntil(_)) {
                result.healthy = false;
            }
            result.components.insert(name.clone(), status);
        }

        match result.healthy {
            true => info!("{} health check ok", self.name),
            false => warn!("{} health check failed: {:?}", self.name, result.components),
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEADLINE: std::time::Duration = std::time::Duration::from_secs(30);

    #[test]
    fn defaults_to_unhealthy() {
        let registry = HealthRegistry::new("liveness");
        assert!(!registry.get_status().healthy);
    }

    #[test]
    fn one_component() {
        let registry = HealthRegistry::new("liveness");
        let handle = registry.register("pipeline", DEADLINE);

        let status = registry.get_status();
        assert!(!status.healthy);
        assert_eq!(
            status.components.get("pipeline"),
            Some(&ComponentStatus::Starting)
        );

        handle.report_healthy();
        assert!(registry.get_status().healthy);

        handle.report_unhealthy("primary store unreachable");
        let status = registry.get_status();
        assert!(!status.healthy);
        assert_eq!(
            status.components.get("pipeline"),
            Some(&ComponentStatus::Unhealthy(
                "primary store unreachable".to_string()
            ))
        );
    }

    #[test]
    fn stale_report_is_stalled() {
        let registry = HealthRegistry::new("liveness");
        let handle = registry.register("pipeline", DEADLINE);
        handle.report_status(ComponentStatus::HealthyUntil(
            OffsetDateTime::now_utc() - Duration::seconds(1),
        ));

        let status = registry.get_status();
        assert!(!status.healthy);
        assert_eq!(
            status.components.get("pipeline"),
            Some(&ComponentStatus::Stalled)
        );
    }

    #[test]
    fn every_component_must_be_healthy() {
        let registry = HealthRegistry::new("liveness");
        let pipeline = registry.register("pipeline", DEADLINE);
        let server = registry.register("server", DEADLINE);

        pipeline.report_healthy();
        assert!(!registry.get_status().healthy);

        server.report_healthy();
        assert!(registry.get_status().healthy);

        pipeline.report_unhealthy("stopped");
        assert!(!registry.get_status().healthy);

        pipeline.report_healthy();
        assert!(registry.get_status().healthy);
    }

    #[test]
    fn into_response() {
        let nok = HealthStatus::default().into_response();
        assert_eq!(nok.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let ok = HealthStatus {
            healthy: true,
            components: Default::default(),
        }
        .into_response();
        assert_eq!(ok.status(), StatusCode::OK);
    }
}
