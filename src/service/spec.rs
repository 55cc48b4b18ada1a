//! Service specification

use crate::error::{BerthError, Result};
use crate::probe::WaitStrategy;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Directory the official database images scan for init scripts
pub const INIT_SCRIPT_DIR: &str = "/docker-entrypoint-initdb.d";

/// Access mode of an injected file
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BindMode {
    /// The instance may only read the file
    #[default]
    ReadOnly,
    /// The instance may modify the file
    ReadWrite,
}

impl std::fmt::Display for BindMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BindMode::ReadOnly => write!(f, "ro"),
            BindMode::ReadWrite => write!(f, "rw"),
        }
    }
}

/// A host file injected into the instance
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileBinding {
    /// Host path of the resource
    pub source: PathBuf,
    /// Absolute path inside the instance
    pub target: String,
    /// Access mode
    #[serde(default)]
    pub mode: BindMode,
}

impl FileBinding {
    /// Create a new file binding
    pub fn new(source: impl Into<PathBuf>, target: &str, mode: BindMode) -> Self {
        Self {
            source: source.into(),
            target: target.to_string(),
            mode,
        }
    }
}

/// Declarative description of one dependency
///
/// A spec is immutable once built; use [`ServiceSpec::builder`] to make one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceSpec {
    name: String,
    image: String,
    env: BTreeMap<String, String>,
    exposed_ports: Vec<u16>,
    files: Vec<FileBinding>,
    init_script: Option<PathBuf>,
    wait: Option<WaitStrategy>,
    readiness_timeout: Option<Duration>,
}

impl ServiceSpec {
    /// Start building a spec for `name` running `image`
    pub fn builder(name: &str, image: &str) -> ServiceSpecBuilder {
        ServiceSpecBuilder::new(name, image)
    }

    /// Service name, unique within a scope
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Image reference
    pub fn image(&self) -> &str {
        &self.image
    }

    /// Environment variables
    pub fn env(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    /// Exposed container ports in declaration order
    pub fn exposed_ports(&self) -> &[u16] {
        &self.exposed_ports
    }

    /// First exposed port, used as the service's primary port
    pub fn primary_port(&self) -> Option<u16> {
        self.exposed_ports.first().copied()
    }

    /// Injected files, including the init script binding
    pub fn files(&self) -> &[FileBinding] {
        &self.files
    }

    /// Init script, if one was declared
    pub fn init_script(&self) -> Option<&Path> {
        self.init_script.as_deref()
    }

    /// Wait strategy declared on the spec
    pub fn wait_strategy(&self) -> Option<&WaitStrategy> {
        self.wait.as_ref()
    }

    /// Wait strategy to use, falling back to a port check or a running check
    pub fn effective_wait_strategy(&self) -> WaitStrategy {
        match &self.wait {
            Some(strategy) => strategy.clone(),
            None if self.exposed_ports.is_empty() => WaitStrategy::Running,
            None => WaitStrategy::port_open(),
        }
    }

    /// Readiness budget declared on the spec
    pub fn readiness_timeout(&self) -> Option<Duration> {
        self.readiness_timeout
    }
}

/// Builder for [`ServiceSpec`]
#[derive(Debug, Clone)]
pub struct ServiceSpecBuilder {
    name: String,
    image: String,
    env: BTreeMap<String, String>,
    exposed_ports: Vec<u16>,
    files: Vec<FileBinding>,
    init_script: Option<PathBuf>,
    wait: Option<WaitStrategy>,
    readiness_timeout: Option<Duration>,
    resource_root: Option<PathBuf>,
}

impl ServiceSpecBuilder {
    fn new(name: &str, image: &str) -> Self {
        Self {
            name: name.to_string(),
            image: image.to_string(),
            env: BTreeMap::new(),
            exposed_ports: Vec::new(),
            files: Vec::new(),
            init_script: None,
            wait: None,
            readiness_timeout: None,
            resource_root: None,
        }
    }

    /// Add environment variable; a repeated key keeps the last value
    pub fn env(mut self, key: &str, value: &str) -> Self {
        self.env.insert(key.to_string(), value.to_string());
        self
    }

    /// Expose a container port
    pub fn port(mut self, port: u16) -> Self {
        self.exposed_ports.push(port);
        self
    }

    /// Expose several container ports
    pub fn ports(mut self, ports: &[u16]) -> Self {
        self.exposed_ports.extend_from_slice(ports);
        self
    }

    /// Inject a file
    pub fn file(mut self, source: impl Into<PathBuf>, target: &str, mode: BindMode) -> Self {
        self.files.push(FileBinding::new(source, target, mode));
        self
    }

    /// Inject a database init script into the image's init directory
    pub fn init_script(mut self, source: impl Into<PathBuf>) -> Self {
        self.init_script = Some(source.into());
        self
    }

    /// Set the readiness strategy
    pub fn wait_for(mut self, strategy: WaitStrategy) -> Self {
        self.wait = Some(strategy);
        self
    }

    /// Set the readiness budget for this service
    pub fn readiness_timeout(mut self, timeout: Duration) -> Self {
        self.readiness_timeout = Some(timeout);
        self
    }

    /// Directory relative file sources are resolved against
    pub fn resource_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.resource_root = Some(root.into());
        self
    }

    /// Validate and freeze the spec
    pub fn build(self) -> Result<ServiceSpec> {
        validate_name(&self.name)?;

        if self.image.trim().is_empty() {
            return Err(BerthError::InvalidSpec(format!(
                "service {} has no image",
                self.name
            )));
        }

        let mut seen_ports = HashSet::new();
        for port in &self.exposed_ports {
            if *port == 0 {
                return Err(BerthError::InvalidSpec(format!(
                    "service {} exposes port 0",
                    self.name
                )));
            }
            if !seen_ports.insert(*port) {
                return Err(BerthError::InvalidSpec(format!(
                    "service {} exposes port {} twice",
                    self.name, port
                )));
            }
        }

        for key in self.env.keys() {
            if key.is_empty() || key.contains('=') {
                return Err(BerthError::InvalidSpec(format!(
                    "service {} has invalid environment key {:?}",
                    self.name, key
                )));
            }
        }

        let root = match self.resource_root {
            Some(root) => root,
            None => std::env::current_dir()?,
        };

        let mut files = Vec::with_capacity(self.files.len() + 1);
        for binding in self.files {
            files.push(resolve_binding(&self.name, &root, binding)?);
        }

        let init_script = match self.init_script {
            Some(source) => {
                let file_name = source
                    .file_name()
                    .and_then(|n| n.to_str())
                    .map(|n| n.to_string())
                    .ok_or_else(|| {
                        BerthError::InvalidSpec(format!(
                            "init script {} has no file name",
                            source.display()
                        ))
                    })?;
                let target = format!("{}/{}", INIT_SCRIPT_DIR, file_name);
                let binding = resolve_binding(
                    &self.name,
                    &root,
                    FileBinding::new(source, &target, BindMode::ReadOnly),
                )?;
                let resolved = binding.source.clone();
                files.push(binding);
                Some(resolved)
            }
            None => None,
        };

        let mut targets = HashSet::new();
        for binding in &files {
            if !targets.insert(binding.target.as_str()) {
                return Err(BerthError::InvalidSpec(format!(
                    "service {} binds {} twice",
                    self.name, binding.target
                )));
            }
        }

        if let Some(ref strategy) = self.wait {
            strategy.validate(&self.exposed_ports)?;
        }

        if let Some(timeout) = self.readiness_timeout {
            if timeout.is_zero() {
                return Err(BerthError::InvalidSpec(format!(
                    "service {} has a zero readiness timeout",
                    self.name
                )));
            }
        }

        Ok(ServiceSpec {
            name: self.name,
            image: self.image,
            env: self.env,
            exposed_ports: self.exposed_ports,
            files,
            init_script,
            wait: self.wait,
            readiness_timeout: self.readiness_timeout,
        })
    }
}

fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(BerthError::InvalidSpec("service name is empty".to_string()));
    }
    let valid = name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.');
    if !valid {
        return Err(BerthError::InvalidSpec(format!(
            "service name {:?} may only contain [a-zA-Z0-9_.-]",
            name
        )));
    }
    Ok(())
}

fn resolve_binding(service: &str, root: &Path, binding: FileBinding) -> Result<FileBinding> {
    if !binding.target.starts_with('/') {
        return Err(BerthError::InvalidSpec(format!(
            "service {}: bind target {} is not absolute",
            service, binding.target
        )));
    }

    let source = if binding.source.is_absolute() {
        binding.source
    } else {
        root.join(&binding.source)
    };

    if !source.exists() {
        return Err(BerthError::InvalidSpec(format!(
            "service {}: resource {} does not exist",
            service,
            source.display()
        )));
    }

    Ok(FileBinding {
        source,
        target: binding.target,
        mode: binding.mode,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_build_spec() {
        let spec = ServiceSpec::builder("db", "postgres:12.12")
            .env("POSTGRES_USER", "postgres")
            .env("POSTGRES_PASSWORD", "postgres")
            .port(5432)
            .build()
            .unwrap();

        assert_eq!(spec.name(), "db");
        assert_eq!(spec.image(), "postgres:12.12");
        assert_eq!(spec.env().len(), 2);
        assert_eq!(spec.primary_port(), Some(5432));
        assert_eq!(spec.effective_wait_strategy(), WaitStrategy::port_open());
    }

    #[test]
    fn test_repeated_env_key_keeps_last_value() {
        let spec = ServiceSpec::builder("db", "postgres")
            .env("POSTGRES_DB", "first")
            .env("POSTGRES_DB", "tasklist")
            .build()
            .unwrap();

        assert_eq!(spec.env().len(), 1);
        assert_eq!(spec.env()["POSTGRES_DB"], "tasklist");
    }

    #[test]
    fn test_invalid_specs_rejected() {
        assert!(ServiceSpec::builder("", "redis").build().is_err());
        assert!(ServiceSpec::builder("my db", "redis").build().is_err());
        assert!(ServiceSpec::builder("cache", " ").build().is_err());
        assert!(ServiceSpec::builder("cache", "redis").port(0).build().is_err());
        assert!(ServiceSpec::builder("cache", "redis")
            .ports(&[6379, 6379])
            .build()
            .is_err());
    }

    #[test]
    fn test_no_ports_waits_for_running() {
        let spec = ServiceSpec::builder("cache", "redis").build().unwrap();
        assert_eq!(spec.effective_wait_strategy(), WaitStrategy::Running);
    }

    #[test]
    fn test_relative_file_resolved_against_root() {
        let temp = tempdir().unwrap();
        std::fs::create_dir_all(temp.path().join("database")).unwrap();
        std::fs::write(temp.path().join("database/INIT.sql"), "CREATE TABLE t (id int);").unwrap();

        let spec = ServiceSpec::builder("db", "postgres:12.12")
            .resource_root(temp.path())
            .init_script("database/INIT.sql")
            .port(5432)
            .build()
            .unwrap();

        let binding = &spec.files()[0];
        assert_eq!(binding.source, temp.path().join("database/INIT.sql"));
        assert_eq!(binding.target, "/docker-entrypoint-initdb.d/INIT.sql");
        assert_eq!(binding.mode, BindMode::ReadOnly);
        assert_eq!(spec.init_script(), Some(temp.path().join("database/INIT.sql").as_path()));
    }

    #[test]
    fn test_missing_resource_rejected() {
        let temp = tempdir().unwrap();
        let result = ServiceSpec::builder("db", "postgres")
            .resource_root(temp.path())
            .file("missing.sql", "/tmp/missing.sql", BindMode::ReadOnly)
            .build();

        assert!(matches!(result, Err(BerthError::InvalidSpec(_))));
    }

    #[test]
    fn test_relative_target_rejected() {
        let temp = tempdir().unwrap();
        std::fs::write(temp.path().join("a.conf"), "").unwrap();
        let result = ServiceSpec::builder("cache", "redis")
            .resource_root(temp.path())
            .file("a.conf", "etc/a.conf", BindMode::ReadWrite)
            .build();

        assert!(result.is_err());
    }
}
