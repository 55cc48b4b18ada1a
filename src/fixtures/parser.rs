//! Fixture file parser

use super::FixtureFile;
use crate::error::{BerthError, Result};
use crate::service::ServiceSpec;
use std::path::{Path, PathBuf};

/// Default fixture file names
pub const DEFAULT_FIXTURE_FILES: &[&str] = &[
    "berth.services.yaml",
    "berth.services.yml",
    "services.yaml",
    "services.yml",
];

/// Fixture file parser
pub struct FixtureParser;

impl FixtureParser {
    /// Find a fixture file in `dir`
    pub fn find_fixture_file(dir: &Path) -> Option<PathBuf> {
        DEFAULT_FIXTURE_FILES
            .iter()
            .map(|name| dir.join(name))
            .find(|path| path.exists())
    }

    /// Parse a fixture file from `path`
    pub fn parse_file(path: &Path) -> Result<FixtureFile> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            BerthError::FixtureParse(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::parse_str(&content)
    }

    /// Parse a fixture document
    pub fn parse_str(content: &str) -> Result<FixtureFile> {
        let fixture: FixtureFile = serde_yaml::from_str(content)
            .map_err(|e| BerthError::FixtureParse(format!("Failed to parse YAML: {}", e)))?;

        if fixture.services.is_empty() {
            return Err(BerthError::FixtureParse("no services declared".to_string()));
        }
        for (name, service) in &fixture.services {
            if service.image.trim().is_empty() {
                return Err(BerthError::FixtureParse(format!("service {} has no image", name)));
            }
        }
        Ok(fixture)
    }

    /// Parse `path` and build its specs, resolving files next to it
    pub fn load_specs(path: &Path) -> Result<(FixtureFile, Vec<ServiceSpec>)> {
        let fixture = Self::parse_file(path)?;
        let base_dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => std::env::current_dir()?,
        };
        let specs = fixture.to_specs(&base_dir)?;
        Ok((fixture, specs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::WaitStrategy;
    use crate::scope::ScopeKind;
    use crate::service::{BindMode, INIT_SCRIPT_DIR};
    use std::time::Duration;
    use tempfile::TempDir;

    const FIXTURE: &str = r#"
scope: per_class
services:
  db:
    image: postgres:16-alpine
    environment:
      POSTGRES_USER: u
      POSTGRES_PASSWORD: p
    ports: [5432]
    init_script: sql/schema.sql
    wait:
      kind: log_pattern_match
      pattern: ready to accept connections
      times: 2
    readiness_timeout_ms: 30000
  cache:
    image: redis:7
    env:
      - REDIS_ARGS=--save ""
    ports: [6379]
    files:
      - ./redis.conf:/usr/local/etc/redis/redis.conf:ro
"#;

    fn fixture_dir() -> TempDir {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir(dir.path().join("sql")).unwrap();
        std::fs::write(dir.path().join("sql/schema.sql"), "create table task(id int);").unwrap();
        std::fs::write(dir.path().join("redis.conf"), "appendonly no\n").unwrap();
        std::fs::write(dir.path().join("services.yaml"), FIXTURE).unwrap();
        dir
    }

    #[test]
    fn test_parse_str() {
        let fixture = FixtureParser::parse_str(FIXTURE).unwrap();
        assert_eq!(fixture.scope, Some(ScopeKind::PerClass));
        assert_eq!(fixture.services.len(), 2);
        assert_eq!(fixture.services["db"].ports, vec![5432]);
        assert_eq!(
            fixture.services["db"].wait,
            Some(WaitStrategy::log_message_times("ready to accept connections", 2))
        );
    }

    #[test]
    fn test_load_specs_resolves_files() {
        let dir = fixture_dir();
        let path = FixtureParser::find_fixture_file(dir.path()).unwrap();
        let (_, specs) = FixtureParser::load_specs(&path).unwrap();

        let names: Vec<&str> = specs.iter().map(|s| s.name()).collect();
        assert_eq!(names, vec!["cache", "db"]);

        let cache = &specs[0];
        assert_eq!(cache.env()["REDIS_ARGS"], "--save \"\"");
        assert_eq!(cache.files()[0].source, dir.path().join("./redis.conf"));
        assert_eq!(cache.files()[0].mode, BindMode::ReadOnly);

        let db = &specs[1];
        assert_eq!(db.primary_port(), Some(5432));
        assert_eq!(db.readiness_timeout(), Some(Duration::from_secs(30)));
        assert!(db
            .files()
            .iter()
            .any(|f| f.target == format!("{}/schema.sql", INIT_SCRIPT_DIR)));
    }

    #[test]
    fn test_missing_resource_is_fixture_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("services.yaml");
        std::fs::write(
            &path,
            "services:\n  db:\n    image: postgres\n    init_script: missing.sql\n",
        )
        .unwrap();

        let err = FixtureParser::load_specs(&path).unwrap_err();
        match err {
            BerthError::FixtureParse(message) => assert!(message.contains("service db")),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_rejects_empty_and_imageless() {
        assert!(FixtureParser::parse_str("services: {}\n").is_err());
        assert!(FixtureParser::parse_str("services:\n  db:\n    image: \"\"\n").is_err());
        assert!(FixtureParser::parse_str("services: [").is_err());
    }

    #[test]
    fn test_no_fixture_file() {
        let dir = TempDir::new().unwrap();
        assert!(FixtureParser::find_fixture_file(dir.path()).is_none());
    }
}
