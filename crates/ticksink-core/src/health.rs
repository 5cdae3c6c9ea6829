//! Health registry for the engine's components.

use parking_lot::RwLock;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

/// Engine component tracked by the health registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Component {
    Store,
    Pool,
    Queue,
    Writer,
    Session,
}

impl Component {
    pub const ALL: [Component; 5] = [
        Component::Store,
        Component::Pool,
        Component::Queue,
        Component::Writer,
        Component::Session,
    ];

    /// Name used in logs and health responses.
    pub fn as_str(&self) -> &'static str {
        match self {
            Component::Store => "store",
            Component::Pool => "pool",
            Component::Queue => "queue",
            Component::Writer => "writer",
            Component::Session => "session",
        }
    }
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Health status of a component.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
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

/// Overall status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Tracks the last reported status of every component.
pub struct HealthCheck {
    components: RwLock<BTreeMap<Component, ComponentStatus>>,
}

impl HealthCheck {
    /// A registry with every component `Unknown`.
    pub fn new() -> Self {
        let components = Component::ALL
            .iter()
            .map(|c| (*c, ComponentStatus::Unknown))
            .collect();
        Self {
            components: RwLock::new(components),
        }
    }

    /// Mark a component as healthy.
    pub fn mark_healthy(&self, component: Component) {
        self.components
            .write()
            .insert(component, ComponentStatus::Healthy);
    }

    /// Mark a component as degraded.
    pub fn mark_degraded(&self, component: Component, reason: impl Into<String>) {
        self.components
            .write()
            .insert(component, ComponentStatus::Degraded(reason.into()));
    }

    /// Mark a component as unhealthy.
    pub fn mark_unhealthy(&self, component: Component, reason: impl Into<String>) {
        self.components
            .write()
            .insert(component, ComponentStatus::Unhealthy(reason.into()));
    }

    /// Status of one component.
    pub fn status_of(&self, component: Component) -> ComponentStatus {
        self.components
            .read()
            .get(&component)
            .cloned()
            .unwrap_or(ComponentStatus::Unknown)
    }

    /// All component statuses, keyed by name.
    pub fn all_statuses(&self) -> BTreeMap<&'static str, ComponentStatus> {
        self.components
            .read()
            .iter()
            .map(|(c, s)| (c.as_str(), s.clone()))
            .collect()
    }

    /// Worst status across components. `Unknown` counts as healthy.
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

    /// Healthy or degraded.
    pub fn is_operational(&self) -> bool {
        matches!(
            self.overall_status(),
            HealthStatus::Healthy | HealthStatus::Degraded
        )
    }
}

impl Default for HealthCheck {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_check_lifecycle() {
        let health = HealthCheck::new();
        assert_eq!(health.status_of(Component::Pool), ComponentStatus::Unknown);
        assert_eq!(health.overall_status(), HealthStatus::Healthy);

        health.mark_healthy(Component::Pool);
        health.mark_healthy(Component::Store);
        assert_eq!(health.overall_status(), HealthStatus::Healthy);

        health.mark_degraded(Component::Writer, "batch rolled back");
        assert_eq!(health.overall_status(), HealthStatus::Degraded);
        assert!(health.is_operational());

        health.mark_unhealthy(Component::Pool, "store unreachable");
        assert_eq!(health.overall_status(), HealthStatus::Unhealthy);
        assert!(!health.is_operational());

        health.mark_healthy(Component::Pool);
        health.mark_healthy(Component::Writer);
        assert_eq!(health.overall_status(), HealthStatus::Healthy);
    }

    #[test]
    fn test_all_statuses_lists_every_component() {
        let health = HealthCheck::new();
        health.mark_degraded(Component::Queue, "requeue overflow");

        let statuses = health.all_statuses();
        assert_eq!(statuses.len(), Component::ALL.len());
        assert_eq!(
            statuses.get("queue"),
            Some(&ComponentStatus::Degraded("requeue overflow".to_string()))
        );
    }

    #[test]
    fn test_status_serializes_with_reason() {
        let json = serde_json::to_string(&ComponentStatus::Unhealthy("down".into())).unwrap();
        assert_eq!(json, r#"{"status":"unhealthy","reason":"down"}"#);
        let json = serde_json::to_string(&ComponentStatus::Healthy).unwrap();
        assert_eq!(json, r#"{"status":"healthy"}"#);
    }
}
