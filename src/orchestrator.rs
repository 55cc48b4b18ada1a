//! Test orchestrator
//!
//! Entry point for test code: builds scopes over one driver and brings a
//! set of services up together, failing fast if any of them cannot be made
//! ready.

use crate::config::OrchestratorConfig;
use crate::driver::{DockerDriver, RuntimeDriver};
use crate::error::{BerthError, Result};
use crate::probe::{PortDialer, ReadinessProbe, TcpDialer};
use crate::resolver::{ConnectionHandle, ConnectionResolver};
use crate::scope::{LifecycleScope, ScopeKind, ScopeRuntime};
use crate::service::ServiceSpec;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::task::JoinSet;

/// Orchestrator builder
#[derive(Default)]
pub struct TestOrchestratorBuilder {
    config: Option<OrchestratorConfig>,
    driver: Option<Arc<dyn RuntimeDriver>>,
    dialer: Option<Arc<dyn PortDialer>>,
}

impl TestOrchestratorBuilder {
    /// Use `config` instead of the defaults
    pub fn config(mut self, config: OrchestratorConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Drive instances through `driver` instead of the Docker Engine API
    pub fn driver(mut self, driver: Arc<dyn RuntimeDriver>) -> Self {
        self.driver = Some(driver);
        self
    }

    /// Check open ports through `dialer` instead of real TCP connects
    pub fn dialer(mut self, dialer: Arc<dyn PortDialer>) -> Self {
        self.dialer = Some(dialer);
        self
    }

    /// Build the orchestrator
    pub fn build(self) -> Result<TestOrchestrator> {
        let config = self.config.unwrap_or_default();
        config.validate()?;

        let driver = match self.driver {
            Some(driver) => driver,
            None => Arc::new(DockerDriver::new(&config)?),
        };
        let dialer = self.dialer.unwrap_or_else(|| Arc::new(TcpDialer::default()));

        let runtime = ScopeRuntime {
            driver: driver.clone(),
            probe: ReadinessProbe::new(driver.clone(), dialer, &config.host, config.poll_interval()),
            resolver: ConnectionResolver::new(&config.host),
            readiness_timeout: config.readiness_timeout(),
            startup_timeout: config.startup_timeout(),
        };
        let process = LifecycleScope::new(ScopeKind::PerProcess, runtime.clone());

        tracing::debug!("Orchestrator using {} driver at host {}", driver.name(), config.host);

        Ok(TestOrchestrator {
            config,
            runtime,
            process,
            scopes: Mutex::new(Vec::new()),
        })
    }
}

/// Starts, hands out and tears down service dependencies
pub struct TestOrchestrator {
    config: OrchestratorConfig,
    runtime: ScopeRuntime,
    /// Shared scope for the whole process
    process: LifecycleScope,
    /// Wider scopes handed out, shut down with the orchestrator
    scopes: Mutex<Vec<LifecycleScope>>,
}

impl TestOrchestrator {
    /// Create a builder
    pub fn builder() -> TestOrchestratorBuilder {
        TestOrchestratorBuilder::default()
    }

    /// Orchestrator over the Docker Engine API, configured from
    /// `berth.yaml` (if present) and the environment
    pub fn from_env() -> Result<Self> {
        let config = OrchestratorConfig::load(None)?;
        Self::builder().config(config).build()
    }

    /// Effective configuration
    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Name of the driver in use
    pub fn driver_name(&self) -> &str {
        self.runtime.driver.name()
    }

    /// Whether the engine answers
    ///
    /// Never skips anything on its own; callers decide what to do with a
    /// `false`.
    pub async fn engine_available(&self) -> bool {
        match self.runtime.driver.ping().await {
            Ok(()) => true,
            Err(e) => {
                tracing::debug!("Engine not available: {}", e);
                false
            }
        }
    }

    /// Create a new scope
    pub fn scope(&self, kind: ScopeKind) -> LifecycleScope {
        let scope = LifecycleScope::new(kind, self.runtime.clone());
        if let Err(e) = self.track(&scope) {
            tracing::warn!("Scope {} not tracked for shutdown: {}", scope.id(), e);
        }
        scope
    }

    /// Create a new scope with `specs` declared up front
    pub fn scope_with(&self, kind: ScopeKind, specs: &[ServiceSpec]) -> Result<LifecycleScope> {
        let scope = LifecycleScope::with_specs(kind, self.runtime.clone(), specs)?;
        self.track(&scope)?;
        Ok(scope)
    }

    /// Remember a wide scope for shutdown, forgetting retired ones
    fn track(&self, scope: &LifecycleScope) -> Result<()> {
        if scope.kind() == ScopeKind::PerCase {
            return Ok(());
        }
        let mut scopes = self.scopes.lock()
            .map_err(|_| BerthError::Lock("Failed to acquire scope list lock".to_string()))?;
        scopes.retain(|s| !s.is_retired());
        scopes.push(scope.clone());
        Ok(())
    }

    /// The process-wide scope
    pub fn process_scope(&self) -> &LifecycleScope {
        &self.process
    }

    /// Acquire a single service
    pub async fn acquire(&self, scope: &LifecycleScope, spec: &ServiceSpec) -> Result<ConnectionHandle> {
        scope.acquire(spec).await
    }

    /// Bring up every spec in `scope` and return a handle per service name
    ///
    /// Services start concurrently. The first failure is returned and every
    /// handle already obtained is released again; no partial set is handed
    /// out. Released services in a wide scope stay up until that scope is
    /// closed or shut down.
    pub async fn start(
        &self,
        scope: &LifecycleScope,
        specs: &[ServiceSpec],
    ) -> Result<HashMap<String, ConnectionHandle>> {
        let mut names = HashSet::new();
        for spec in specs {
            if !names.insert(spec.name()) {
                return Err(BerthError::IdentityConflict(spec.name().to_string()));
            }
        }

        tracing::info!("Starting {} service(s) in {} scope {}", specs.len(), scope.kind(), scope.id());

        let mut tasks = JoinSet::new();
        for spec in specs {
            let scope = scope.clone();
            let spec = spec.clone();
            tasks.spawn(async move { scope.acquire(&spec).await });
        }

        let mut handles = HashMap::new();
        while let Some(joined) = tasks.join_next().await {
            let outcome = joined.map_err(|e| BerthError::Startup {
                name: scope.id().to_string(),
                message: format!("startup task failed: {}", e),
            });

            match outcome.and_then(|result| result) {
                Ok(handle) => {
                    handles.insert(handle.name().to_string(), handle);
                }
                Err(err) => {
                    tracing::warn!("Startup in scope {} failed: {}", scope.id(), err);
                    tasks.abort_all();
                    while let Some(joined) = tasks.join_next().await {
                        if let Ok(Ok(handle)) = joined {
                            handles.insert(handle.name().to_string(), handle);
                        }
                    }
                    self.release_all(scope, handles).await;
                    return Err(err);
                }
            }
        }

        tracing::info!("{} service(s) ready in scope {}", handles.len(), scope.id());
        Ok(handles)
    }

    /// Release a single handle
    pub async fn release(&self, scope: &LifecycleScope, handle: &ConnectionHandle) -> Result<()> {
        scope.release(handle).await
    }

    /// Release every handle returned by [`start`](Self::start)
    pub async fn release_all(&self, scope: &LifecycleScope, handles: HashMap<String, ConnectionHandle>) {
        for handle in handles.values() {
            if let Err(e) = scope.release(handle).await {
                tracing::warn!("Failed to release {}: {}", handle.name(), e);
            }
        }
    }

    /// Tear down the process scope and every wider scope handed out
    pub async fn shutdown(&self) {
        let scopes = match self.scopes.lock() {
            Ok(mut scopes) => std::mem::take(&mut *scopes),
            Err(_) => Vec::new(),
        };
        for scope in scopes.iter().rev() {
            scope.shutdown().await;
        }
        self.process.shutdown().await;
        tracing::info!("Orchestrator shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::MemoryDriver;
    use crate::probe::WaitStrategy;
    use std::time::Duration;

    fn orchestrator(driver: &Arc<MemoryDriver>) -> TestOrchestrator {
        let config = OrchestratorConfig {
            poll_interval_ms: 10,
            readiness_timeout_ms: 1_000,
            ..OrchestratorConfig::default()
        };
        TestOrchestrator::builder()
            .config(config)
            .driver(driver.clone())
            .dialer(driver.clone())
            .build()
            .unwrap()
    }

    fn db() -> ServiceSpec {
        ServiceSpec::builder("db", "postgres:16")
            .env("X_USER", "u")
            .env("X_PASSWORD", "p")
            .port(5432)
            .build()
            .unwrap()
    }

    fn cache() -> ServiceSpec {
        ServiceSpec::builder("cache", "redis:7").port(6379).build().unwrap()
    }

    #[tokio::test]
    async fn test_start_returns_handle_per_service() {
        let driver = Arc::new(MemoryDriver::new().with_port_mapping(5432, 54321));
        let orchestrator = orchestrator(&driver);
        let scope = orchestrator.scope(ScopeKind::PerCase);

        let handles = orchestrator.start(&scope, &[db(), cache()]).await.unwrap();
        assert_eq!(handles.len(), 2);
        assert_eq!(handles["db"].port(), Some(54321));
        assert_eq!(handles["db"].credentials().username.as_deref(), Some("u"));
        assert!(handles["cache"].port().is_some());

        orchestrator.release_all(&scope, handles).await;
        assert_eq!(driver.running_count().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_names_rejected_before_start() {
        let driver = Arc::new(MemoryDriver::new());
        let orchestrator = orchestrator(&driver);
        let scope = orchestrator.scope(ScopeKind::PerCase);

        let err = orchestrator.start(&scope, &[db(), db()]).await.unwrap_err();
        assert!(matches!(err, BerthError::IdentityConflict(_)));
        assert_eq!(driver.create_calls(), 0);
    }

    #[tokio::test]
    async fn test_fail_fast_releases_ready_services() {
        let driver = Arc::new(MemoryDriver::new().with_exec_exit_code("cache", 1));
        let orchestrator = orchestrator(&driver);
        let scope = orchestrator.scope(ScopeKind::PerCase);

        let broken = ServiceSpec::builder("cache", "redis:7")
            .port(6379)
            .wait_for(WaitStrategy::command(&["redis-cli", "ping"]))
            .readiness_timeout(Duration::from_millis(100))
            .build()
            .unwrap();

        let err = orchestrator.start(&scope, &[db(), broken]).await.unwrap_err();
        assert!(matches!(err, BerthError::ReadinessTimeout { .. }));
        assert_eq!(driver.running_count().unwrap(), 0);
        assert_eq!(scope.ref_count("db").unwrap(), 0);
    }

    #[tokio::test]
    async fn test_engine_available() {
        let driver = Arc::new(MemoryDriver::new());
        let orchestrator = orchestrator(&driver);
        assert!(orchestrator.engine_available().await);

        driver.set_offline(true).unwrap();
        assert!(!orchestrator.engine_available().await);
    }

    #[tokio::test]
    async fn test_shutdown_stops_wide_scopes() {
        let driver = Arc::new(MemoryDriver::new());
        let orchestrator = orchestrator(&driver);
        let class = orchestrator.scope(ScopeKind::PerClass);

        let _db = orchestrator.acquire(&class, &db()).await.unwrap();
        let _cache = orchestrator.acquire(orchestrator.process_scope(), &cache()).await.unwrap();
        assert_eq!(driver.running_count().unwrap(), 2);

        orchestrator.shutdown().await;
        assert_eq!(driver.running_count().unwrap(), 0);
        assert_eq!(driver.instance_count().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_failed_start_in_process_scope_cleaned_by_shutdown() {
        let driver = Arc::new(MemoryDriver::new().with_exec_exit_code("cache", 1));
        let orchestrator = orchestrator(&driver);
        let scope = orchestrator.scope(ScopeKind::PerProcess);

        let broken = ServiceSpec::builder("cache", "redis:7")
            .port(6379)
            .wait_for(WaitStrategy::command(&["redis-cli", "ping"]))
            .readiness_timeout(Duration::from_millis(100))
            .build()
            .unwrap();

        assert!(orchestrator.start(&scope, &[db(), broken]).await.is_err());
        assert_eq!(scope.ref_count("db").unwrap(), 0);
        // Released but still owned by the open scope
        assert_eq!(driver.running_count().unwrap(), 1);

        scope.shutdown().await;
        orchestrator.shutdown().await;
        assert_eq!(driver.running_count().unwrap(), 0);
        assert_eq!(driver.instance_count().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_retired_scopes_are_forgotten() {
        let driver = Arc::new(MemoryDriver::new());
        let orchestrator = orchestrator(&driver);

        let first = orchestrator.scope(ScopeKind::PerClass);
        let handle = first.acquire(&db()).await.unwrap();
        first.release(&handle).await.unwrap();
        assert_eq!(first.close().await.unwrap(), 0);
        assert!(first.is_retired());

        let held = orchestrator.scope(ScopeKind::PerClass);
        let _db = held.acquire(&db()).await.unwrap();
        held.close().await.unwrap();
        assert!(!held.is_retired());

        let _third = orchestrator.scope_with(ScopeKind::PerProcess, &[cache()]).unwrap();
        let _case = orchestrator.scope(ScopeKind::PerCase);
        assert_eq!(orchestrator.scopes.lock().unwrap().len(), 2);

        orchestrator.shutdown().await;
        assert_eq!(driver.running_count().unwrap(), 0);
    }
}
