//! Service instance state

use super::spec::ServiceSpec;
use crate::error::{BerthError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Instance state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceState {
    /// Created in the engine, not started
    Created,
    /// Started, waiting for readiness
    Starting,
    /// Ready for use
    Running,
    /// Being torn down
    Stopping,
    /// Torn down
    Stopped,
    /// Creation, start or readiness failed
    Failed,
}

impl InstanceState {
    /// Whether no further transition is possible
    pub fn is_terminal(self) -> bool {
        matches!(self, InstanceState::Stopped | InstanceState::Failed)
    }

    /// Whether `next` is a legal successor of this state
    pub fn can_transition_to(self, next: InstanceState) -> bool {
        use InstanceState::*;
        matches!(
            (self, next),
            (Created, Starting)
                | (Starting, Running)
                | (Running, Stopping)
                | (Stopping, Stopped)
                | (Created, Failed)
                | (Starting, Failed)
                | (Running, Failed)
        )
    }
}

impl std::fmt::Display for InstanceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InstanceState::Created => write!(f, "created"),
            InstanceState::Starting => write!(f, "starting"),
            InstanceState::Running => write!(f, "running"),
            InstanceState::Stopping => write!(f, "stopping"),
            InstanceState::Stopped => write!(f, "stopped"),
            InstanceState::Failed => write!(f, "failed"),
        }
    }
}

/// A provisioned dependency
#[derive(Debug, Clone)]
pub struct ServiceInstance {
    id: String,
    spec: Arc<ServiceSpec>,
    state: InstanceState,
    container_name: Option<String>,
    /// Declared container port -> host port; non-empty only while running
    ports: HashMap<u16, u16>,
    failure: Option<String>,
    /// Shared with every handle resolved from this instance
    live: Arc<AtomicBool>,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
}

impl ServiceInstance {
    /// Track a freshly created engine instance
    pub fn new(id: &str, spec: Arc<ServiceSpec>) -> Self {
        Self {
            id: id.to_string(),
            spec,
            state: InstanceState::Created,
            container_name: None,
            ports: HashMap::new(),
            failure: None,
            live: Arc::new(AtomicBool::new(false)),
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    /// Engine-assigned id
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Service name
    pub fn name(&self) -> &str {
        self.spec.name()
    }

    /// The spec this instance was created from
    pub fn spec(&self) -> &Arc<ServiceSpec> {
        &self.spec
    }

    /// Current state
    pub fn state(&self) -> InstanceState {
        self.state
    }

    /// Check if the instance is running
    pub fn is_running(&self) -> bool {
        self.state == InstanceState::Running
    }

    /// Engine-side container name, known once inspected
    pub fn container_name(&self) -> Option<&str> {
        self.container_name.as_deref()
    }

    /// Host port mapped to a declared container port
    pub fn mapped_port(&self, declared: u16) -> Option<u16> {
        self.ports.get(&declared).copied()
    }

    /// All port mappings
    pub fn ports(&self) -> &HashMap<u16, u16> {
        &self.ports
    }

    /// Failure message, if the instance failed
    pub fn failure(&self) -> Option<&str> {
        self.failure.as_deref()
    }

    /// Flag that stays set while the instance is running
    pub(crate) fn liveness(&self) -> Arc<AtomicBool> {
        self.live.clone()
    }

    /// Creation time
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Time the instance became ready
    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    /// Time the instance stopped or failed
    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.finished_at
    }

    fn transition(&mut self, next: InstanceState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(BerthError::InvalidTransition {
                name: self.spec.name().to_string(),
                from: self.state.to_string(),
                to: next.to_string(),
            });
        }
        tracing::debug!("Instance {} ({}): {} -> {}", self.spec.name(), self.id, self.state, next);
        self.state = next;
        Ok(())
    }

    /// Mark the instance as started and awaiting readiness
    pub fn mark_starting(&mut self) -> Result<()> {
        self.transition(InstanceState::Starting)
    }

    /// Mark the instance ready, recording its runtime port mapping
    pub fn mark_running(
        &mut self,
        ports: HashMap<u16, u16>,
        container_name: Option<String>,
    ) -> Result<()> {
        for declared in self.spec.exposed_ports() {
            if !ports.contains_key(declared) {
                return Err(BerthError::PortNotMapped {
                    name: self.spec.name().to_string(),
                    port: *declared,
                });
            }
        }
        self.transition(InstanceState::Running)?;
        self.ports = ports;
        if container_name.is_some() {
            self.container_name = container_name;
        }
        self.started_at = Some(Utc::now());
        self.live.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Begin teardown
    pub fn mark_stopping(&mut self) -> Result<()> {
        self.transition(InstanceState::Stopping)?;
        self.live.store(false, Ordering::SeqCst);
        self.ports.clear();
        Ok(())
    }

    /// Teardown finished
    pub fn mark_stopped(&mut self) -> Result<()> {
        self.transition(InstanceState::Stopped)?;
        self.finished_at = Some(Utc::now());
        Ok(())
    }

    /// Record a failure
    pub fn mark_failed(&mut self, message: &str) -> Result<()> {
        self.transition(InstanceState::Failed)?;
        self.live.store(false, Ordering::SeqCst);
        self.ports.clear();
        self.failure = Some(message.to_string());
        self.finished_at = Some(Utc::now());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> Arc<ServiceSpec> {
        Arc::new(ServiceSpec::builder("db", "postgres").port(5432).build().unwrap())
    }

    #[test]
    fn test_happy_path_transitions() {
        let mut instance = ServiceInstance::new("abc123", spec());
        assert_eq!(instance.state(), InstanceState::Created);
        assert!(instance.mapped_port(5432).is_none());

        instance.mark_starting().unwrap();
        instance
            .mark_running(HashMap::from([(5432, 54321)]), Some("berth-db-1".to_string()))
            .unwrap();
        assert!(instance.is_running());
        assert_eq!(instance.mapped_port(5432), Some(54321));
        assert_eq!(instance.container_name(), Some("berth-db-1"));

        instance.mark_stopping().unwrap();
        assert!(instance.mapped_port(5432).is_none());
        instance.mark_stopped().unwrap();
        assert!(instance.state().is_terminal());
        assert!(instance.finished_at().is_some());
    }

    #[test]
    fn test_transitions_are_one_directional() {
        let mut instance = ServiceInstance::new("abc123", spec());
        instance.mark_starting().unwrap();
        instance.mark_running(HashMap::from([(5432, 1)]), None).unwrap();

        let err = instance.mark_starting().unwrap_err();
        assert!(matches!(err, BerthError::InvalidTransition { .. }));
    }

    #[test]
    fn test_failed_reachable_from_non_terminal_states() {
        let mut created = ServiceInstance::new("a", spec());
        created.mark_failed("create failed").unwrap();
        assert_eq!(created.failure(), Some("create failed"));

        let mut starting = ServiceInstance::new("b", spec());
        starting.mark_starting().unwrap();
        starting.mark_failed("probe timed out").unwrap();
        assert_eq!(starting.state(), InstanceState::Failed);

        let mut stopped = ServiceInstance::new("c", spec());
        stopped.mark_starting().unwrap();
        stopped.mark_running(HashMap::from([(5432, 1)]), None).unwrap();
        stopped.mark_stopping().unwrap();
        stopped.mark_stopped().unwrap();
        assert!(stopped.mark_failed("late").is_err());
    }

    #[test]
    fn test_running_requires_every_declared_port() {
        let mut instance = ServiceInstance::new("abc123", spec());
        instance.mark_starting().unwrap();

        let err = instance.mark_running(HashMap::new(), None).unwrap_err();
        assert!(matches!(err, BerthError::PortNotMapped { port: 5432, .. }));
        assert_eq!(instance.state(), InstanceState::Starting);
    }
}
