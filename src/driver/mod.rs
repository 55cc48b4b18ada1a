//! Container engine drivers
//!
//! A driver is a thin adapter over a container engine. The rest of the
//! crate only talks to engines through [`RuntimeDriver`], so the transport
//! (HTTP API, local socket, in-process simulation) stays behind this seam.
//!
//! Every driver keeps an [`IdRegistry`] of the instances it created and
//! refuses to operate on ids it does not own.

pub mod docker;
pub mod memory;

pub use docker::DockerDriver;
pub use memory::MemoryDriver;

use crate::error::{BerthError, Result};
use crate::service::ServiceSpec;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

/// Observed engine-side state of an instance
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InspectInfo {
    /// Whether the engine reports the instance as running
    pub running: bool,
    /// Declared container port -> host port
    pub ports: HashMap<u16, u16>,
    /// Engine-side container name
    pub name: Option<String>,
}

/// Result of a command run inside an instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutput {
    /// Process exit code
    pub exit_code: i64,
    /// Combined output
    pub output: String,
}

impl ExecOutput {
    /// Check if the command succeeded
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Control contract over a container engine
#[async_trait]
pub trait RuntimeDriver: Send + Sync {
    /// Short driver name for logs
    fn name(&self) -> &str;

    /// Create an instance from `spec`, returning its engine id
    async fn create(&self, spec: &ServiceSpec) -> Result<String>;

    /// Start an instance; starting a running instance is a no-op
    async fn start(&self, id: &str) -> Result<()>;

    /// Stop an instance; stopping a stopped or removed instance is a no-op
    async fn stop(&self, id: &str) -> Result<()>;

    /// Remove an instance; removing it twice is a no-op
    async fn remove(&self, id: &str) -> Result<()>;

    /// Report running state and port mapping
    async fn inspect(&self, id: &str) -> Result<InspectInfo>;

    /// Combined stdout/stderr of the instance
    async fn logs(&self, id: &str) -> Result<String>;

    /// Run a command inside the instance
    async fn exec(&self, id: &str, command: &[String]) -> Result<ExecOutput>;

    /// Check that the engine is reachable
    async fn ping(&self) -> Result<()>;
}

/// Whether an id is live or already removed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdStatus {
    /// Created by this driver and not removed
    Live,
    /// Created by this driver and since removed
    Removed,
}

/// Ids a driver created
#[derive(Debug, Default)]
pub struct IdRegistry {
    live: RwLock<HashSet<String>>,
    removed: RwLock<HashSet<String>>,
}

impl IdRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a newly created id
    pub fn register(&self, id: &str) -> Result<()> {
        let mut live = self.live.write()
            .map_err(|_| BerthError::Lock("Failed to acquire write lock".to_string()))?;
        live.insert(id.to_string());
        Ok(())
    }

    /// Look up an id, refusing ids this driver never created
    pub fn status(&self, id: &str) -> Result<IdStatus> {
        let live = self.live.read()
            .map_err(|_| BerthError::Lock("Failed to acquire read lock".to_string()))?;
        if live.contains(id) {
            return Ok(IdStatus::Live);
        }
        drop(live);

        let removed = self.removed.read()
            .map_err(|_| BerthError::Lock("Failed to acquire read lock".to_string()))?;
        if removed.contains(id) {
            return Ok(IdStatus::Removed);
        }

        Err(BerthError::InstanceNotFound(id.to_string()))
    }

    /// Require a live id
    pub fn require_live(&self, id: &str) -> Result<()> {
        match self.status(id)? {
            IdStatus::Live => Ok(()),
            IdStatus::Removed => Err(BerthError::InstanceNotFound(id.to_string())),
        }
    }

    /// Move an id to the removed set
    pub fn forget(&self, id: &str) -> Result<()> {
        let mut live = self.live.write()
            .map_err(|_| BerthError::Lock("Failed to acquire write lock".to_string()))?;
        let mut removed = self.removed.write()
            .map_err(|_| BerthError::Lock("Failed to acquire write lock".to_string()))?;
        live.remove(id);
        removed.insert(id.to_string());
        Ok(())
    }

    /// Number of live ids
    pub fn live_count(&self) -> Result<usize> {
        let live = self.live.read()
            .map_err(|_| BerthError::Lock("Failed to acquire read lock".to_string()))?;
        Ok(live.len())
    }
}

/// Generate an engine-side container name for a service
pub fn container_name(service: &str) -> String {
    format!("berth-{}-{}", service, &uuid::Uuid::new_v4().simple().to_string()[..8])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_refuses_foreign_ids() {
        let registry = IdRegistry::new();
        registry.register("abc").unwrap();

        assert_eq!(registry.status("abc").unwrap(), IdStatus::Live);
        assert!(matches!(
            registry.status("xyz"),
            Err(BerthError::InstanceNotFound(_))
        ));
    }

    #[test]
    fn test_registry_remembers_removed_ids() {
        let registry = IdRegistry::new();
        registry.register("abc").unwrap();
        registry.forget("abc").unwrap();

        assert_eq!(registry.status("abc").unwrap(), IdStatus::Removed);
        assert!(registry.require_live("abc").is_err());
        assert_eq!(registry.live_count().unwrap(), 0);
    }

    #[test]
    fn test_container_name_format() {
        let name = container_name("db");
        assert!(name.starts_with("berth-db-"));
        assert_eq!(name.len(), "berth-db-".len() + 8);
    }
}
