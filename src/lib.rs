//! Berth - ephemeral service dependencies for integration tests
//!
//! Berth starts disposable services (databases, caches, queues) in a
//! container engine, waits until they are usable, hands out their
//! connection coordinates, and tears them down when the owning scope ends.
//!
//! - Declarative service specs, with PostgreSQL and Redis presets
//! - Docker Engine API driver and an in-process simulated engine
//! - Pluggable readiness strategies (open port, log pattern, command)
//! - Per-case, per-class and per-process lifecycle scopes with
//!   single-flight startup
//! - Compose-like fixture files

pub mod config;
pub mod driver;
pub mod error;
pub mod fixtures;
pub mod orchestrator;
pub mod probe;
pub mod resolver;
pub mod scope;
pub mod service;

pub use config::OrchestratorConfig;
pub use driver::{DockerDriver, MemoryDriver, RuntimeDriver};
pub use error::{BerthError, FailureKind, Result};
pub use orchestrator::{TestOrchestrator, TestOrchestratorBuilder};
pub use probe::{ReadinessProbe, WaitStrategy};
pub use resolver::{ConnectionHandle, ConnectionResolver, Credentials};
pub use scope::{LifecycleScope, ScopeKind, ScopeRuntime};
pub use service::{presets, ServiceInstance, ServiceSpec};
