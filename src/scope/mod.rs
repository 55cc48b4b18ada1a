//! Lifecycle scopes
//!
//! A scope owns the instances started on its behalf and decides when they
//! are torn down:
//!
//! - `PerCase`: as soon as the last handle is released
//! - `PerClass`: when the scope is closed and the last handle is released
//! - `PerProcess`: like `PerClass`, normally closed via `shutdown` at exit
//!
//! Within a scope each service name maps to at most one slot. The first
//! acquirer registers the slot and spawns the create/start/probe sequence;
//! concurrent acquirers of the same name join that sequence and receive the
//! same instance, or the same failure. All slot bookkeeping happens under
//! one mutex per scope, never held across an await point.

mod slot;

use crate::driver::RuntimeDriver;
use crate::error::{BerthError, Result};
use crate::probe::ReadinessProbe;
use crate::resolver::{ConnectionHandle, ConnectionResolver};
use crate::service::{InstanceState, ServiceInstance, ServiceSpec};
use serde::{Deserialize, Serialize};
use slot::{Slot, SlotStatus};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Lifetime boundary of a scope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScopeKind {
    /// One test case
    PerCase,
    /// All test cases of one class or module
    PerClass,
    /// The whole test process
    PerProcess,
}

impl std::fmt::Display for ScopeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScopeKind::PerCase => write!(f, "per-case"),
            ScopeKind::PerClass => write!(f, "per-class"),
            ScopeKind::PerProcess => write!(f, "per-process"),
        }
    }
}

/// Collaborators a scope drives
#[derive(Clone)]
pub struct ScopeRuntime {
    pub driver: Arc<dyn RuntimeDriver>,
    pub probe: ReadinessProbe,
    pub resolver: ConnectionResolver,
    /// Readiness budget for specs that declare none
    pub readiness_timeout: Duration,
    /// Budget for create + start
    pub startup_timeout: Duration,
}

impl ScopeRuntime {
    /// Longest an acquirer waits on an in-flight startup
    fn join_budget(&self, spec: &ServiceSpec) -> Duration {
        self.startup_timeout
            + spec.readiness_timeout().unwrap_or(self.readiness_timeout)
            + self.probe.interval()
    }
}

#[derive(Debug, Default)]
struct ScopeState {
    slots: HashMap<String, Slot>,
    declared: HashMap<String, Arc<ServiceSpec>>,
    /// Registration order; teardown runs in reverse
    order: Vec<String>,
    /// Last torn-down instance per name, kept until the scope is dropped
    stopped: HashMap<String, ServiceInstance>,
    closed: bool,
}

struct ScopeInner {
    id: String,
    kind: ScopeKind,
    runtime: ScopeRuntime,
    state: Mutex<ScopeState>,
    generations: AtomicU64,
    leases: AtomicU64,
}

/// Binds running instances to a test lifetime
#[derive(Clone)]
pub struct LifecycleScope {
    inner: Arc<ScopeInner>,
}

impl LifecycleScope {
    /// Create an empty scope
    pub fn new(kind: ScopeKind, runtime: ScopeRuntime) -> Self {
        let id = uuid::Uuid::new_v4().simple().to_string()[..8].to_string();
        debug!("Created {} scope {}", kind, id);

        Self {
            inner: Arc::new(ScopeInner {
                id,
                kind,
                runtime,
                state: Mutex::new(ScopeState::default()),
                generations: AtomicU64::new(0),
                leases: AtomicU64::new(1),
            }),
        }
    }

    /// Create a scope with `specs` declared up front
    ///
    /// Fails with `IdentityConflict` if two specs share a name.
    pub fn with_specs(kind: ScopeKind, runtime: ScopeRuntime, specs: &[ServiceSpec]) -> Result<Self> {
        let scope = Self::new(kind, runtime);
        {
            let mut state = scope.inner.lock()?;
            for spec in specs {
                if state.declared.contains_key(spec.name()) {
                    return Err(BerthError::IdentityConflict(spec.name().to_string()));
                }
                state.declared.insert(spec.name().to_string(), Arc::new(spec.clone()));
            }
        }
        Ok(scope)
    }

    /// Short scope id used in logs
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Scope kind
    pub fn kind(&self) -> ScopeKind {
        self.inner.kind
    }

    /// Register `spec` without starting it
    pub fn declare(&self, spec: &ServiceSpec) -> Result<()> {
        let mut state = self.inner.lock()?;
        declare_locked(&mut state, Arc::new(spec.clone()))?;
        Ok(())
    }

    /// Get a handle to a running instance of `spec`
    ///
    /// Starts the instance if this is the first acquire of its name in the
    /// scope, otherwise joins the existing (or in-flight) instance. Waits
    /// until the instance is running or its startup failed.
    pub async fn acquire(&self, spec: &ServiceSpec) -> Result<ConnectionHandle> {
        let (generation, spec, mut status) = {
            let mut guard = self.inner.lock()?;
            let state = &mut *guard;
            if state.closed {
                return Err(BerthError::ScopeClosed(format!(
                    "cannot acquire {} from closed scope {}",
                    spec.name(),
                    self.inner.id
                )));
            }

            let spec = declare_locked(state, Arc::new(spec.clone()))?;
            let name = spec.name().to_string();

            match state.slots.get_mut(&name) {
                Some(slot) => {
                    if let Some(err) = slot.failure() {
                        return Err(err);
                    }
                    slot.waiters += 1;
                    debug!("Joining {} in scope {} (held={})", name, self.inner.id, slot.held());
                    (slot.generation, spec, slot.status.subscribe())
                }
                None => {
                    let generation = self.inner.generations.fetch_add(1, Ordering::SeqCst);
                    let mut slot = Slot::new(generation);
                    slot.waiters = 1;
                    let status = slot.status.subscribe();
                    state.slots.insert(name.clone(), slot);
                    state.order.push(name.clone());

                    info!("Starting {} ({}) in {} scope {}", name, spec.image(), self.inner.kind, self.inner.id);
                    tokio::spawn(self.inner.clone().run_startup(spec.clone(), generation));
                    (generation, spec, status)
                }
            }
        };

        let mut pending = PendingRef {
            inner: &self.inner,
            name: spec.name().to_string(),
            generation,
            armed: true,
        };

        let budget = self.inner.runtime.join_budget(&spec);
        let outcome = tokio::time::timeout(budget, async {
            status.wait_for(|s| !s.is_pending()).await.map(|s| (*s).clone())
        })
        .await;

        match outcome {
            Ok(Ok(SlotStatus::Ready(instance))) => {
                let handle = self.inner.runtime.resolver.resolve_primary(&instance)?;
                let lease = self.inner.grant_lease(spec.name(), generation)?;
                pending.armed = false;
                Ok(handle.with_lease(lease))
            }
            Ok(Ok(SlotStatus::Failed(err))) => Err(err),
            Ok(Ok(SlotStatus::Pending)) | Ok(Err(_)) => Err(BerthError::ScopeClosed(format!(
                "scope {} shut down while {} was starting",
                self.inner.id,
                spec.name()
            ))),
            Err(_) => Err(BerthError::ReadinessTimeout {
                name: spec.name().to_string(),
                timeout: budget,
                last_error: "in-flight startup did not complete".to_string(),
            }),
        }
    }

    /// Acquire a spec declared earlier by name
    pub async fn acquire_declared(&self, name: &str) -> Result<ConnectionHandle> {
        let spec = {
            let state = self.inner.lock()?;
            state.declared.get(name).cloned().ok_or_else(|| {
                BerthError::InvalidSpec(format!("service {} is not declared in this scope", name))
            })?
        };
        self.acquire(&spec).await
    }

    /// Give back a handle obtained from [`acquire`](Self::acquire)
    ///
    /// Each acquire grants one lease. Releasing a lease that is unknown to
    /// the scope or already released fails with `NotAcquired`.
    pub async fn release(&self, handle: &ConnectionHandle) -> Result<()> {
        let teardown = {
            let mut guard = self.inner.lock()?;
            let state = &mut *guard;
            let slot = state.slots
                .get_mut(handle.name())
                .filter(|s| s.instance_id() == Some(handle.instance_id()))
                .ok_or_else(|| BerthError::NotAcquired(handle.name().to_string()))?;
            if !slot.leases.remove(&handle.lease()) {
                return Err(BerthError::NotAcquired(handle.name().to_string()));
            }

            debug!("Released {} in scope {} (held={})", handle.name(), self.inner.id, slot.held());

            if slot.is_unused() && (self.inner.kind == ScopeKind::PerCase || state.closed) {
                take_for_teardown(state, handle.name())
            } else {
                None
            }
        };

        if let Some(instance) = teardown {
            self.inner.teardown(instance).await;
        }
        Ok(())
    }

    /// End the scope
    ///
    /// Instances nobody holds are torn down now; held instances are torn
    /// down on their last release. Returns the number still held.
    pub async fn close(&self) -> Result<usize> {
        let (teardown, held) = {
            let mut guard = self.inner.lock()?;
            let state = &mut *guard;
            state.closed = true;

            let idle: Vec<String> = state.order
                .iter()
                .filter(|name| state.slots.get(*name).map_or(false, |s| s.is_unused()))
                .cloned()
                .collect();
            let held = state.order.len() - idle.len();

            let mut teardown = Vec::new();
            for name in idle.iter().rev() {
                if let Some(instance) = take_for_teardown(state, name) {
                    teardown.push(instance);
                }
            }
            (teardown, held)
        };

        if held > 0 {
            warn!(
                "Scope {} closed with {} service(s) still held; they stop on last release",
                self.inner.id, held
            );
        }
        for instance in teardown {
            self.inner.teardown(instance).await;
        }
        Ok(held)
    }

    /// Tear down everything regardless of outstanding handles
    ///
    /// Used at process exit. Safe to call more than once.
    pub async fn shutdown(&self) {
        let teardown = match self.inner.lock() {
            Ok(mut guard) => {
                let state = &mut *guard;
                state.closed = true;
                let names: Vec<String> = state.order.iter().rev().cloned().collect();
                names.iter()
                    .filter_map(|name| take_for_teardown(state, name))
                    .collect::<Vec<_>>()
            }
            Err(e) => {
                warn!("Scope {} shutdown skipped: {}", self.inner.id, e);
                Vec::new()
            }
        };

        for instance in teardown {
            self.inner.teardown(instance).await;
        }
    }

    /// Whether the scope refuses new acquires
    pub fn is_closed(&self) -> bool {
        self.inner.lock().map(|s| s.closed).unwrap_or(true)
    }

    /// Closed with nothing left to tear down
    pub fn is_retired(&self) -> bool {
        self.inner.lock().map(|s| s.closed && s.slots.is_empty()).unwrap_or(true)
    }

    /// Outstanding handles plus callers still waiting on a startup
    pub fn ref_count(&self, name: &str) -> Result<usize> {
        let state = self.inner.lock()?;
        Ok(state.slots.get(name).map_or(0, |s| s.held()))
    }

    /// Current state of a service's instance
    ///
    /// Once torn down, the last instance of the name reports `Stopped`.
    pub fn state_of(&self, name: &str) -> Result<Option<InstanceState>> {
        let state = self.inner.lock()?;
        let live = state.slots.get(name).and_then(|s| s.instance.as_ref());
        Ok(live.or_else(|| state.stopped.get(name)).map(|i| i.state()))
    }

    /// Snapshot of the instances owned by the scope, in registration order
    pub fn instances(&self) -> Result<Vec<ServiceInstance>> {
        let state = self.inner.lock()?;
        Ok(state.order
            .iter()
            .filter_map(|name| state.slots.get(name))
            .filter_map(|s| s.instance.clone())
            .collect())
    }
}

impl ScopeInner {
    fn lock(&self) -> Result<MutexGuard<'_, ScopeState>> {
        self.state.lock()
            .map_err(|_| BerthError::Lock("Failed to acquire scope lock".to_string()))
    }

    async fn run_startup(self: Arc<Self>, spec: Arc<ServiceSpec>, generation: u64) {
        let mut created = None;
        let result = self.provision(&spec, generation, &mut created).await;

        match (result, created) {
            (Ok(()), Some(instance)) => self.publish_ready(generation, instance).await,
            (Ok(()), None) => {
                let err = BerthError::Startup {
                    name: spec.name().to_string(),
                    message: "startup produced no instance".to_string(),
                };
                self.publish_failure(&spec, generation, err, None).await;
            }
            (Err(err), created) => self.publish_failure(&spec, generation, err, created).await,
        }
    }

    async fn provision(
        &self,
        spec: &Arc<ServiceSpec>,
        generation: u64,
        created: &mut Option<ServiceInstance>,
    ) -> Result<()> {
        let runtime = &self.runtime;
        let deadline = Instant::now() + runtime.startup_timeout;

        let id = within(deadline, spec.name(), "create", runtime.driver.create(spec)).await?;
        let instance = created.insert(ServiceInstance::new(&id, spec.clone()));
        self.sync_instance(generation, instance);

        instance.mark_starting()?;
        self.sync_instance(generation, instance);
        within(deadline, spec.name(), "start", runtime.driver.start(&id)).await?;

        let strategy = spec.effective_wait_strategy();
        let timeout = spec.readiness_timeout().unwrap_or(runtime.readiness_timeout);
        debug!("Probing {} ({}) with {} for up to {:?}", spec.name(), id, strategy, timeout);
        let ready = runtime.probe.await_ready(instance, &strategy, timeout).await?;

        instance.mark_running(ready.info.ports, ready.info.name)?;
        Ok(())
    }

    fn sync_instance(&self, generation: u64, instance: &ServiceInstance) {
        if let Ok(mut state) = self.state.lock() {
            if let Some(slot) = state.slots
                .get_mut(instance.name())
                .filter(|s| s.generation == generation)
            {
                slot.instance = Some(instance.clone());
            }
        }
    }

    async fn publish_ready(&self, generation: u64, mut instance: ServiceInstance) {
        let name = instance.name().to_string();
        let teardown = match self.state.lock() {
            Ok(mut guard) => {
                let state = &mut *guard;
                match state.slots.get_mut(&name).filter(|s| s.generation == generation) {
                    Some(slot) => {
                        slot.instance = Some(instance.clone());
                        slot.status.send_replace(SlotStatus::Ready(instance));
                        info!("{} ready in scope {}", name, self.id);

                        if slot.is_unused() && (self.kind == ScopeKind::PerCase || state.closed) {
                            take_for_teardown(state, &name)
                        } else {
                            None
                        }
                    }
                    None => {
                        debug!("{} became ready after scope {} let go of it", name, self.id);
                        if let Err(e) = instance.mark_stopping() {
                            warn!("{}", e);
                        }
                        Some(instance)
                    }
                }
            }
            Err(_) => {
                warn!("Scope {} lock poisoned; tearing down {}", self.id, name);
                let _ = instance.mark_stopping();
                Some(instance)
            }
        };

        if let Some(instance) = teardown {
            self.teardown(instance).await;
        }
    }

    async fn publish_failure(
        &self,
        spec: &ServiceSpec,
        generation: u64,
        err: BerthError,
        created: Option<ServiceInstance>,
    ) {
        let message = err.to_string();
        warn!("Startup of {} in scope {} failed: {}", spec.name(), self.id, message);

        let created = created.map(|mut instance| {
            if !instance.state().is_terminal() {
                if let Err(e) = instance.mark_failed(&message) {
                    warn!("{}", e);
                }
            }
            instance
        });

        // Best effort: the instance never became usable
        if let Some(instance) = &created {
            if let Err(e) = self.runtime.driver.remove(instance.id()).await {
                debug!("Removal of failed instance {} failed: {}", instance.id(), e);
            }
        }

        if let Ok(mut state) = self.state.lock() {
            if let Some(slot) = state.slots
                .get_mut(spec.name())
                .filter(|s| s.generation == generation)
            {
                slot.instance = created;
                slot.status.send_replace(SlotStatus::Failed(err));
            }
        }
    }

    /// Turn a waiter on a ready slot into a lease
    fn grant_lease(&self, name: &str, generation: u64) -> Result<u64> {
        let mut state = self.lock()?;
        let slot = state.slots
            .get_mut(name)
            .filter(|s| s.generation == generation)
            .ok_or_else(|| {
                BerthError::ScopeClosed(format!("scope {} let go of {} while it started", self.id, name))
            })?;

        let lease = self.leases.fetch_add(1, Ordering::SeqCst);
        slot.waiters = slot.waiters.saturating_sub(1);
        slot.leases.insert(lease);
        Ok(lease)
    }

    /// Drop the waiter of a caller that gave up waiting
    fn drop_ref(&self, name: &str, generation: u64) -> Option<ServiceInstance> {
        let mut guard = self.state.lock().ok()?;
        let state = &mut *guard;
        let slot = state.slots.get_mut(name).filter(|s| s.generation == generation)?;
        slot.waiters = slot.waiters.saturating_sub(1);

        let unused = slot.is_unused() && slot.is_ready();
        if unused && (self.kind == ScopeKind::PerCase || state.closed) {
            take_for_teardown(state, name)
        } else {
            None
        }
    }

    async fn teardown(&self, mut instance: ServiceInstance) {
        let driver = &self.runtime.driver;
        info!("Tearing down {} ({}) in scope {}", instance.name(), instance.id(), self.id);

        if let Err(e) = driver.stop(instance.id()).await {
            warn!("Failed to stop {}: {}", instance.id(), e);
        }
        if let Err(e) = driver.remove(instance.id()).await {
            warn!("Failed to remove {}: {}", instance.id(), e);
        }
        if instance.state() == InstanceState::Stopping {
            if let Err(e) = instance.mark_stopped() {
                warn!("{}", e);
            }
        }

        if let Ok(mut state) = self.state.lock() {
            state.stopped.insert(instance.name().to_string(), instance);
        }
    }
}

impl Drop for ScopeInner {
    fn drop(&mut self) {
        let state = match self.state.get_mut() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        let leftovers: Vec<String> = state.slots
            .drain()
            .filter_map(|(_, slot)| slot.instance)
            .filter(|instance| instance.is_running())
            .map(|instance| instance.id().to_string())
            .collect();
        if leftovers.is_empty() {
            return;
        }

        let driver = self.runtime.driver.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                warn!("Scope {} dropped with {} running instance(s)", self.id, leftovers.len());
                handle.spawn(async move {
                    for id in leftovers {
                        let _ = driver.stop(&id).await;
                        let _ = driver.remove(&id).await;
                    }
                });
            }
            Err(_) => warn!(
                "Scope {} dropped outside a runtime; {} instance(s) left running",
                self.id,
                leftovers.len()
            ),
        }
    }
}

/// Keeps an acquirer's reference honest if it stops waiting early
struct PendingRef<'a> {
    inner: &'a Arc<ScopeInner>,
    name: String,
    generation: u64,
    armed: bool,
}

impl Drop for PendingRef<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Some(instance) = self.inner.drop_ref(&self.name, self.generation) {
            let inner = self.inner.clone();
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move { inner.teardown(instance).await });
            }
        }
    }
}

fn declare_locked(state: &mut ScopeState, spec: Arc<ServiceSpec>) -> Result<Arc<ServiceSpec>> {
    match state.declared.get(spec.name()) {
        Some(existing) if **existing != *spec => {
            Err(BerthError::IdentityConflict(spec.name().to_string()))
        }
        Some(existing) => Ok(existing.clone()),
        None => {
            state.declared.insert(spec.name().to_string(), spec.clone());
            Ok(spec)
        }
    }
}

/// Unregister a slot; a running instance is moved to `Stopping`
fn take_for_teardown(state: &mut ScopeState, name: &str) -> Option<ServiceInstance> {
    let slot = state.slots.remove(name)?;
    state.order.retain(|n| n != name);

    let mut instance = slot.instance?;
    if !instance.is_running() {
        return None;
    }
    if let Err(e) = instance.mark_stopping() {
        warn!("{}", e);
        return None;
    }
    Some(instance)
}

async fn within<T, F>(deadline: Instant, name: &str, step: &str, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout_at(deadline, fut).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(BerthError::Engine(message))) => Err(BerthError::Startup {
            name: name.to_string(),
            message,
        }),
        Ok(Err(err)) => Err(err),
        Err(_) => Err(BerthError::Startup {
            name: name.to_string(),
            message: format!("{} did not finish in time", step),
        }),
    }
}
