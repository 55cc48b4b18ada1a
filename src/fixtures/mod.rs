//! Fixture files
//!
//! A fixture file declares a set of services in a compose-like YAML layout:
//!
//! ```yaml
//! scope: per_class
//! services:
//!   db:
//!     image: postgres:16-alpine
//!     environment:
//!       POSTGRES_PASSWORD: secret
//!     ports: [5432]
//!     init_script: sql/schema.sql
//!     wait:
//!       kind: log_pattern_match
//!       pattern: ready to accept connections
//!       times: 2
//!   cache:
//!     image: redis:7
//!     ports: [6379]
//!     files:
//!       - ./redis.conf:/usr/local/etc/redis/redis.conf:ro
//! ```
//!
//! Relative file paths resolve against the directory of the fixture file.

pub mod parser;

pub use parser::FixtureParser;

use crate::error::{BerthError, Result};
use crate::probe::WaitStrategy;
use crate::scope::ScopeKind;
use crate::service::{BindMode, FileBinding, ServiceSpec};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level fixture document
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FixtureFile {
    /// Scope the services are meant for
    #[serde(default)]
    pub scope: Option<ScopeKind>,

    /// Services by name
    #[serde(default)]
    pub services: BTreeMap<String, FixtureService>,
}

/// One service entry
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FixtureService {
    /// Image reference
    pub image: String,

    /// Environment variables
    #[serde(default, alias = "env")]
    pub environment: Option<FixtureEnvironment>,

    /// Exposed container ports
    #[serde(default)]
    pub ports: Vec<u16>,

    /// Files bound into the instance
    #[serde(default)]
    pub files: Vec<FixtureBinding>,

    /// Database initialization script
    #[serde(default)]
    pub init_script: Option<PathBuf>,

    /// Readiness strategy
    #[serde(default)]
    pub wait: Option<WaitStrategy>,

    /// Readiness budget in milliseconds
    #[serde(default)]
    pub readiness_timeout_ms: Option<u64>,
}

/// Environment, either `KEY=value` entries or a map
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FixtureEnvironment {
    /// Array of KEY=value strings
    Array(Vec<String>),
    /// Map of key to value
    Map(BTreeMap<String, String>),
}

impl FixtureEnvironment {
    /// Normalize into a map
    pub fn to_map(&self) -> Result<BTreeMap<String, String>> {
        match self {
            FixtureEnvironment::Map(map) => Ok(map.clone()),
            FixtureEnvironment::Array(entries) => {
                let mut map = BTreeMap::new();
                for entry in entries {
                    let (key, value) = entry.split_once('=').ok_or_else(|| {
                        BerthError::FixtureParse(format!("environment entry {:?} has no '='", entry))
                    })?;
                    if map.insert(key.to_string(), value.to_string()).is_some() {
                        return Err(BerthError::FixtureParse(format!(
                            "environment variable {} set twice",
                            key
                        )));
                    }
                }
                Ok(map)
            }
        }
    }
}

/// File binding, short `source:target[:ro|rw]` or long form
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FixtureBinding {
    /// `source:target[:mode]`
    Short(String),
    /// Long form
    Long {
        source: PathBuf,
        target: String,
        #[serde(default)]
        mode: BindMode,
    },
}

impl FixtureBinding {
    /// Convert to a binding with the source still unresolved
    pub fn to_binding(&self) -> Result<FileBinding> {
        match self {
            FixtureBinding::Long { source, target, mode } => {
                Ok(FileBinding::new(source.clone(), target, *mode))
            }
            FixtureBinding::Short(value) => {
                let parts: Vec<&str> = value.split(':').collect();
                let (source, target, mode) = match parts.as_slice() {
                    [source, target] => (*source, *target, BindMode::ReadOnly),
                    [source, target, "ro"] => (*source, *target, BindMode::ReadOnly),
                    [source, target, "rw"] => (*source, *target, BindMode::ReadWrite),
                    _ => {
                        return Err(BerthError::FixtureParse(format!(
                            "invalid file binding {:?}, expected source:target[:ro|rw]",
                            value
                        )))
                    }
                };
                Ok(FileBinding::new(source, target, mode))
            }
        }
    }
}

impl FixtureFile {
    /// Build the declared services, resolving relative paths against `base_dir`
    ///
    /// Specs come back ordered by service name.
    pub fn to_specs(&self, base_dir: &Path) -> Result<Vec<ServiceSpec>> {
        let mut specs = Vec::with_capacity(self.services.len());
        for (name, service) in &self.services {
            let spec = service.to_spec(name, base_dir).map_err(|e| match e {
                e @ BerthError::FixtureParse(_) => e,
                other => BerthError::FixtureParse(format!("service {}: {}", name, other)),
            })?;
            specs.push(spec);
        }
        Ok(specs)
    }
}

impl FixtureService {
    /// Build the spec for the service called `name`
    pub fn to_spec(&self, name: &str, base_dir: &Path) -> Result<ServiceSpec> {
        let mut builder = ServiceSpec::builder(name, &self.image)
            .resource_root(base_dir)
            .ports(&self.ports);

        if let Some(environment) = &self.environment {
            for (key, value) in environment.to_map()? {
                builder = builder.env(&key, &value);
            }
        }
        for binding in &self.files {
            let binding = binding.to_binding()?;
            builder = builder.file(binding.source, &binding.target, binding.mode);
        }
        if let Some(script) = &self.init_script {
            builder = builder.init_script(script.clone());
        }
        if let Some(wait) = &self.wait {
            builder = builder.wait_for(wait.clone());
        }
        if let Some(ms) = self.readiness_timeout_ms {
            builder = builder.readiness_timeout(Duration::from_millis(ms));
        }

        builder.build()
    }
}
