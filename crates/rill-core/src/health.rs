//! Health check system for monitoring component status.
//!
//! Components are named `<stream>:<component>`, e.g. `weather:source`,
//! `weather:sink:files` or `weather:checkpoint`. One [`HealthCheck`] is
//! shared by every stream in a process.

use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::Instant;

/// Health status of a component.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", content = "reason", rename_all = "lowercase")]
pub enum ComponentStatus {
    /// Component is healthy
    Healthy,
    /// Component is degraded but operational
    Degraded(String),
    /// Component is unhealthy
    Unhealthy(String),
    /// Component status is unknown
    Unknown,
}

/// Overall system health status.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// All components healthy
    Healthy,
    /// Some components degraded
    Degraded,
    /// System is unhealthy
    Unhealthy,
}

/// Serializable health report for the HTTP surface.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub uptime_seconds: u64,
    pub running_streams: Vec<String>,
    pub components: BTreeMap<String, ComponentStatus>,
}

/// Health check manager for tracking component health.
pub struct HealthCheck {
    components: RwLock<HashMap<String, ComponentStatus>>,
    started_at: Instant,
    running: RwLock<BTreeSet<String>>,
}

/// Component name for one part of a stream.
pub fn component_name(stream_id: &str, component: &str) -> String {
    format!("{}:{}", stream_id, component)
}

impl HealthCheck {
    /// Create a new health check manager.
    pub fn new() -> Self {
        Self {
            components: RwLock::new(HashMap::new()),
            started_at: Instant::now(),
            running: RwLock::new(BTreeSet::new()),
        }
    }

    /// Register a component to track.
    pub fn register_component(&self, name: &str) {
        let mut components = self.components.write();
        components.insert(name.to_string(), ComponentStatus::Unknown);
    }

    /// Mark a component as healthy.
    pub fn mark_healthy(&self, name: &str) {
        let mut components = self.components.write();
        components.insert(name.to_string(), ComponentStatus::Healthy);
    }

    /// Mark a component as degraded.
    pub fn mark_degraded(&self, name: &str, reason: &str) {
        let mut components = self.components.write();
        components.insert(
            name.to_string(),
            ComponentStatus::Degraded(reason.to_string()),
        );
    }

    /// Mark a component as unhealthy.
    pub fn mark_unhealthy(&self, name: &str, reason: &str) {
        let mut components = self.components.write();
        components.insert(
            name.to_string(),
            ComponentStatus::Unhealthy(reason.to_string()),
        );
    }

    /// Get the status of a specific component.
    pub fn get_component_status(&self, name: &str) -> Option<ComponentStatus> {
        let components = self.components.read();
        components.get(name).cloned()
    }

    /// Get all component statuses.
    pub fn get_all_statuses(&self) -> HashMap<String, ComponentStatus> {
        self.components.read().clone()
    }

    /// Get overall system health status.
    pub fn overall_status(&self) -> HealthStatus {
        let components = self.components.read();

        let mut has_degraded = false;
        for status in components.values() {
            match status {
                ComponentStatus::Unhealthy(_) => return HealthStatus::Unhealthy,
                ComponentStatus::Degraded(_) => has_degraded = true,
                _ => {}
            }
        }

        if has_degraded {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        }
    }

    /// Check if the system is operational (healthy or degraded).
    pub fn is_operational(&self) -> bool {
        matches!(
            self.overall_status(),
            HealthStatus::Healthy | HealthStatus::Degraded
        )
    }

    /// Mark a stream's scheduler as running.
    pub fn stream_started(&self, stream_id: &str) {
        self.running.write().insert(stream_id.to_string());
    }

    /// Mark a stream's scheduler as no longer running.
    pub fn stream_stopped(&self, stream_id: &str) {
        self.running.write().remove(stream_id);
    }

    /// Check if a stream's scheduler is running.
    pub fn is_stream_running(&self, stream_id: &str) -> bool {
        self.running.read().contains(stream_id)
    }

    /// Whether any stream is running.
    pub fn any_running(&self) -> bool {
        !self.running.read().is_empty()
    }

    /// Build a report of every component.
    pub fn report(&self) -> HealthReport {
        HealthReport {
            status: self.overall_status(),
            uptime_seconds: self.started_at.elapsed().as_secs(),
            running_streams: self.running.read().iter().cloned().collect(),
            components: self
                .components
                .read()
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        }
    }
}

impl Default for HealthCheck {
    fn default() -> Self {
        Self::new()
    }
}
