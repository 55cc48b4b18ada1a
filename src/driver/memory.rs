//! In-process simulated engine
//!
//! `MemoryDriver` behaves like a container engine without starting any
//! process: instances get host ports from a counter (or from fixed
//! overrides), report the log text and exec results they were configured
//! with, and every engine call is counted. Faults can be injected per
//! operation to exercise failure paths.

use super::{container_name, ExecOutput, IdRegistry, IdStatus, InspectInfo, RuntimeDriver};
use crate::error::{BerthError, Result};
use crate::probe::PortDialer;
use crate::service::ServiceSpec;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU16, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

/// First host port handed out when no override applies
pub const FIRST_EPHEMERAL_PORT: u16 = 49152;

#[derive(Debug)]
struct MemoryContainer {
    name: String,
    service: String,
    declared_ports: Vec<u16>,
    ports: HashMap<u16, u16>,
    running: bool,
}

#[derive(Debug, Default)]
struct Behavior {
    offline: bool,
    refuse_connections: bool,
    create_delay: Duration,
    remove_delay: Duration,
    port_overrides: HashMap<u16, u16>,
    create_failure: Option<BerthError>,
    start_failure: Option<BerthError>,
    inspect_failure: Option<BerthError>,
    logs: HashMap<String, String>,
    exec_exit_codes: HashMap<String, i64>,
}

#[derive(Debug, Default)]
struct Counters {
    create: AtomicUsize,
    start: AtomicUsize,
    stop: AtomicUsize,
    remove: AtomicUsize,
    inspect: AtomicUsize,
}

/// Simulated container engine
#[derive(Debug)]
pub struct MemoryDriver {
    registry: IdRegistry,
    containers: Mutex<HashMap<String, MemoryContainer>>,
    behavior: Mutex<Behavior>,
    next_port: AtomicU16,
    counters: Counters,
}

impl Default for MemoryDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryDriver {
    /// Create a new simulated engine
    pub fn new() -> Self {
        Self {
            registry: IdRegistry::new(),
            containers: Mutex::new(HashMap::new()),
            behavior: Mutex::new(Behavior::default()),
            next_port: AtomicU16::new(FIRST_EPHEMERAL_PORT),
            counters: Counters::default(),
        }
    }

    /// Always map `container_port` to `host_port`
    pub fn with_port_mapping(self, container_port: u16, host_port: u16) -> Self {
        if let Ok(mut behavior) = self.behavior.lock() {
            behavior.port_overrides.insert(container_port, host_port);
        }
        self
    }

    /// Delay every create call, widening the window for concurrent callers
    pub fn with_create_delay(self, delay: Duration) -> Self {
        if let Ok(mut behavior) = self.behavior.lock() {
            behavior.create_delay = delay;
        }
        self
    }

    /// Delay every remove call
    pub fn with_remove_delay(self, delay: Duration) -> Self {
        if let Ok(mut behavior) = self.behavior.lock() {
            behavior.remove_delay = delay;
        }
        self
    }

    /// Log text reported by instances of `service`
    pub fn with_logs(self, service: &str, logs: &str) -> Self {
        if let Ok(mut behavior) = self.behavior.lock() {
            behavior.logs.insert(service.to_string(), logs.to_string());
        }
        self
    }

    /// Exit code of commands executed in instances of `service`
    pub fn with_exec_exit_code(self, service: &str, exit_code: i64) -> Self {
        if let Ok(mut behavior) = self.behavior.lock() {
            behavior.exec_exit_codes.insert(service.to_string(), exit_code);
        }
        self
    }

    /// Take the engine offline or bring it back
    pub fn set_offline(&self, offline: bool) -> Result<()> {
        self.behavior()?.offline = offline;
        Ok(())
    }

    /// Make mapped ports refuse (or accept) connections
    pub fn set_refuse_connections(&self, refuse: bool) -> Result<()> {
        self.behavior()?.refuse_connections = refuse;
        Ok(())
    }

    /// Fail every create call with `err`
    pub fn fail_create(&self, err: BerthError) -> Result<()> {
        self.behavior()?.create_failure = Some(err);
        Ok(())
    }

    /// Fail every start call with `err`
    pub fn fail_start(&self, err: BerthError) -> Result<()> {
        self.behavior()?.start_failure = Some(err);
        Ok(())
    }

    /// Fail every inspect call with `err`
    pub fn fail_inspect(&self, err: BerthError) -> Result<()> {
        self.behavior()?.inspect_failure = Some(err);
        Ok(())
    }

    /// Remove all injected failures
    pub fn clear_failures(&self) -> Result<()> {
        let mut behavior = self.behavior()?;
        behavior.create_failure = None;
        behavior.start_failure = None;
        behavior.inspect_failure = None;
        Ok(())
    }

    /// Number of create calls
    pub fn create_calls(&self) -> usize {
        self.counters.create.load(Ordering::SeqCst)
    }

    /// Number of start calls
    pub fn start_calls(&self) -> usize {
        self.counters.start.load(Ordering::SeqCst)
    }

    /// Number of stop calls
    pub fn stop_calls(&self) -> usize {
        self.counters.stop.load(Ordering::SeqCst)
    }

    /// Number of remove calls
    pub fn remove_calls(&self) -> usize {
        self.counters.remove.load(Ordering::SeqCst)
    }

    /// Number of inspect calls
    pub fn inspect_calls(&self) -> usize {
        self.counters.inspect.load(Ordering::SeqCst)
    }

    /// Number of instances currently running
    pub fn running_count(&self) -> Result<usize> {
        let containers = self.containers()?;
        Ok(containers.values().filter(|c| c.running).count())
    }

    /// Number of instances that exist (created and not removed)
    pub fn instance_count(&self) -> Result<usize> {
        self.registry.live_count()
    }

    fn behavior(&self) -> Result<MutexGuard<'_, Behavior>> {
        self.behavior.lock()
            .map_err(|_| BerthError::Lock("Failed to acquire behavior lock".to_string()))
    }

    fn containers(&self) -> Result<MutexGuard<'_, HashMap<String, MemoryContainer>>> {
        self.containers.lock()
            .map_err(|_| BerthError::Lock("Failed to acquire container lock".to_string()))
    }

    fn ensure_online(&self) -> Result<()> {
        if self.behavior()?.offline {
            return Err(BerthError::EngineUnavailable(
                "memory engine is offline".to_string(),
            ));
        }
        Ok(())
    }

    fn allocate_ports(&self, declared: &[u16]) -> Result<HashMap<u16, u16>> {
        let behavior = self.behavior()?;
        let mut ports = HashMap::new();
        for port in declared {
            let host_port = match behavior.port_overrides.get(port) {
                Some(host_port) => *host_port,
                None => self.next_port.fetch_add(1, Ordering::SeqCst),
            };
            ports.insert(*port, host_port);
        }
        Ok(ports)
    }
}

#[async_trait]
impl RuntimeDriver for MemoryDriver {
    fn name(&self) -> &str {
        "memory"
    }

    async fn create(&self, spec: &ServiceSpec) -> Result<String> {
        self.counters.create.fetch_add(1, Ordering::SeqCst);

        let delay = self.behavior()?.create_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        self.ensure_online()?;
        if let Some(err) = self.behavior()?.create_failure.clone() {
            return Err(err);
        }

        let id = uuid::Uuid::new_v4().simple().to_string()[..12].to_string();
        let container = MemoryContainer {
            name: container_name(spec.name()),
            service: spec.name().to_string(),
            declared_ports: spec.exposed_ports().to_vec(),
            ports: HashMap::new(),
            running: false,
        };

        self.containers()?.insert(id.clone(), container);
        self.registry.register(&id)?;

        tracing::debug!("Created memory instance {} for {}", id, spec.name());
        Ok(id)
    }

    async fn start(&self, id: &str) -> Result<()> {
        self.counters.start.fetch_add(1, Ordering::SeqCst);
        self.ensure_online()?;
        self.registry.require_live(id)?;
        if let Some(err) = self.behavior()?.start_failure.clone() {
            return Err(err);
        }

        let declared = {
            let containers = self.containers()?;
            let container = containers.get(id)
                .ok_or_else(|| BerthError::InstanceNotFound(id.to_string()))?;
            if container.running {
                return Ok(());
            }
            container.declared_ports.clone()
        };

        let ports = self.allocate_ports(&declared)?;
        let mut containers = self.containers()?;
        let container = containers.get_mut(id)
            .ok_or_else(|| BerthError::InstanceNotFound(id.to_string()))?;
        container.ports = ports;
        container.running = true;
        Ok(())
    }

    async fn stop(&self, id: &str) -> Result<()> {
        self.counters.stop.fetch_add(1, Ordering::SeqCst);
        self.ensure_online()?;
        if self.registry.status(id)? == IdStatus::Removed {
            return Ok(());
        }

        let mut containers = self.containers()?;
        if let Some(container) = containers.get_mut(id) {
            container.running = false;
            container.ports.clear();
        }
        Ok(())
    }

    async fn remove(&self, id: &str) -> Result<()> {
        self.counters.remove.fetch_add(1, Ordering::SeqCst);

        let delay = self.behavior()?.remove_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        self.ensure_online()?;
        if self.registry.status(id)? == IdStatus::Removed {
            return Ok(());
        }

        self.containers()?.remove(id);
        self.registry.forget(id)?;
        Ok(())
    }

    async fn inspect(&self, id: &str) -> Result<InspectInfo> {
        self.counters.inspect.fetch_add(1, Ordering::SeqCst);
        self.ensure_online()?;
        self.registry.require_live(id)?;
        if let Some(err) = self.behavior()?.inspect_failure.clone() {
            return Err(err);
        }

        let containers = self.containers()?;
        let container = containers.get(id)
            .ok_or_else(|| BerthError::InstanceNotFound(id.to_string()))?;

        Ok(InspectInfo {
            running: container.running,
            ports: container.ports.clone(),
            name: Some(container.name.clone()),
        })
    }

    async fn logs(&self, id: &str) -> Result<String> {
        self.ensure_online()?;
        self.registry.require_live(id)?;

        let service = {
            let containers = self.containers()?;
            let container = containers.get(id)
                .ok_or_else(|| BerthError::InstanceNotFound(id.to_string()))?;
            if !container.running {
                return Ok(String::new());
            }
            container.service.clone()
        };

        Ok(self.behavior()?.logs.get(&service).cloned().unwrap_or_default())
    }

    async fn exec(&self, id: &str, command: &[String]) -> Result<ExecOutput> {
        self.ensure_online()?;
        self.registry.require_live(id)?;

        let service = {
            let containers = self.containers()?;
            let container = containers.get(id)
                .ok_or_else(|| BerthError::InstanceNotFound(id.to_string()))?;
            if !container.running {
                return Err(BerthError::Engine(format!("instance {} is not running", id)));
            }
            container.service.clone()
        };

        let exit_code = self.behavior()?.exec_exit_codes.get(&service).copied().unwrap_or(0);
        Ok(ExecOutput {
            exit_code,
            output: command.join(" "),
        })
    }

    async fn ping(&self) -> Result<()> {
        self.ensure_online()
    }
}

#[async_trait]
impl PortDialer for MemoryDriver {
    async fn dial(&self, _host: &str, port: u16) -> Result<()> {
        if self.behavior()?.refuse_connections {
            return Err(BerthError::Probe(format!("connection to port {} refused", port)));
        }

        let containers = self.containers()?;
        let open = containers.values()
            .any(|c| c.running && c.ports.values().any(|p| *p == port));
        if open {
            Ok(())
        } else {
            Err(BerthError::Probe(format!("nothing listening on port {}", port)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> ServiceSpec {
        ServiceSpec::builder("db", "postgres").port(5432).build().unwrap()
    }

    #[tokio::test]
    async fn test_lifecycle() {
        let driver = MemoryDriver::new().with_port_mapping(5432, 54321);
        let id = driver.create(&spec()).await.unwrap();

        let info = driver.inspect(&id).await.unwrap();
        assert!(!info.running);
        assert!(info.ports.is_empty());

        driver.start(&id).await.unwrap();
        let info = driver.inspect(&id).await.unwrap();
        assert!(info.running);
        assert_eq!(info.ports.get(&5432), Some(&54321));

        driver.stop(&id).await.unwrap();
        driver.remove(&id).await.unwrap();
        assert_eq!(driver.instance_count().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let driver = MemoryDriver::new();
        let id = driver.create(&spec()).await.unwrap();
        driver.start(&id).await.unwrap();
        let first = driver.inspect(&id).await.unwrap();

        driver.start(&id).await.unwrap();
        let second = driver.inspect(&id).await.unwrap();
        assert_eq!(first.ports, second.ports);
    }

    #[tokio::test]
    async fn test_stop_and_remove_are_idempotent() {
        let driver = MemoryDriver::new();
        let id = driver.create(&spec()).await.unwrap();
        driver.start(&id).await.unwrap();

        driver.stop(&id).await.unwrap();
        driver.stop(&id).await.unwrap();
        driver.remove(&id).await.unwrap();
        driver.remove(&id).await.unwrap();
        driver.stop(&id).await.unwrap();
        assert!(matches!(
            driver.inspect(&id).await,
            Err(BerthError::InstanceNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_foreign_id_refused() {
        let driver = MemoryDriver::new();
        assert!(matches!(
            driver.start("not-mine").await,
            Err(BerthError::InstanceNotFound(_))
        ));
        assert!(matches!(
            driver.stop("not-mine").await,
            Err(BerthError::InstanceNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_offline_engine() {
        let driver = MemoryDriver::new();
        driver.set_offline(true).unwrap();
        assert!(matches!(
            driver.create(&spec()).await,
            Err(BerthError::EngineUnavailable(_))
        ));
        assert!(driver.ping().await.is_err());
    }

    #[tokio::test]
    async fn test_dial_follows_running_ports() {
        let driver = MemoryDriver::new().with_port_mapping(5432, 54321);
        assert!(driver.dial("localhost", 54321).await.is_err());

        let id = driver.create(&spec()).await.unwrap();
        driver.start(&id).await.unwrap();
        assert!(driver.dial("localhost", 54321).await.is_ok());

        driver.set_refuse_connections(true).unwrap();
        assert!(driver.dial("localhost", 54321).await.is_err());
    }

    #[tokio::test]
    async fn test_logs_and_exec() {
        let driver = MemoryDriver::new()
            .with_logs("db", "starting\nready\n")
            .with_exec_exit_code("db", 2);
        let id = driver.create(&spec()).await.unwrap();
        assert_eq!(driver.logs(&id).await.unwrap(), "");

        driver.start(&id).await.unwrap();
        assert_eq!(driver.logs(&id).await.unwrap(), "starting\nready\n");

        let output = driver.exec(&id, &["pg_isready".to_string()]).await.unwrap();
        assert!(!output.success());
    }
}
