//! Ready-made specs for common dependencies

use super::spec::ServiceSpec;
use crate::error::Result;
use crate::probe::WaitStrategy;
use std::path::PathBuf;

/// PostgreSQL server port
pub const POSTGRES_PORT: u16 = 5432;

/// Redis server port
pub const REDIS_PORT: u16 = 6379;

/// Logged once by initdb's temporary server and once by the real one
const POSTGRES_READY_LOG: &str = "database system is ready to accept connections";

/// PostgreSQL preset
#[derive(Debug, Clone)]
pub struct PostgresPreset {
    name: String,
    image: String,
    username: String,
    password: String,
    database: String,
    init_script: Option<PathBuf>,
    resource_root: Option<PathBuf>,
}

/// PostgreSQL with the image defaults (`postgres`/`postgres`/`postgres`)
pub fn postgres(tag: &str) -> PostgresPreset {
    PostgresPreset {
        name: "postgres".to_string(),
        image: format!("postgres:{}", tag),
        username: "postgres".to_string(),
        password: "postgres".to_string(),
        database: "postgres".to_string(),
        init_script: None,
        resource_root: None,
    }
}

impl PostgresPreset {
    /// Override the service name
    pub fn name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    /// Set the superuser name
    pub fn username(mut self, username: &str) -> Self {
        self.username = username.to_string();
        self
    }

    /// Set the superuser password
    pub fn password(mut self, password: &str) -> Self {
        self.password = password.to_string();
        self
    }

    /// Set the database created on first start
    pub fn database(mut self, database: &str) -> Self {
        self.database = database.to_string();
        self
    }

    /// Run a SQL script when the database is initialised
    pub fn init_script(mut self, path: impl Into<PathBuf>) -> Self {
        self.init_script = Some(path.into());
        self
    }

    /// Directory relative script paths are resolved against
    pub fn resource_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.resource_root = Some(root.into());
        self
    }

    /// Build the service spec
    pub fn build(self) -> Result<ServiceSpec> {
        let mut builder = ServiceSpec::builder(&self.name, &self.image)
            .env("POSTGRES_USER", &self.username)
            .env("POSTGRES_PASSWORD", &self.password)
            .env("POSTGRES_DB", &self.database)
            .port(POSTGRES_PORT)
            .wait_for(WaitStrategy::log_message_times(POSTGRES_READY_LOG, 2));

        if let Some(root) = self.resource_root {
            builder = builder.resource_root(root);
        }
        if let Some(script) = self.init_script {
            builder = builder.init_script(script);
        }

        builder.build()
    }
}

/// Redis preset
pub fn redis(tag: &str) -> Result<ServiceSpec> {
    ServiceSpec::builder("redis", &format!("redis:{}", tag))
        .port(REDIS_PORT)
        .wait_for(WaitStrategy::port_open())
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_postgres_preset() {
        let temp = tempdir().unwrap();
        std::fs::create_dir_all(temp.path().join("database")).unwrap();
        std::fs::write(temp.path().join("database/INIT.sql"), "CREATE TABLE tasks ();").unwrap();

        let spec = postgres("12.12")
            .database("tasklist")
            .resource_root(temp.path())
            .init_script("database/INIT.sql")
            .build()
            .unwrap();

        assert_eq!(spec.name(), "postgres");
        assert_eq!(spec.image(), "postgres:12.12");
        assert_eq!(spec.env()["POSTGRES_DB"], "tasklist");
        assert_eq!(spec.env()["POSTGRES_USER"], "postgres");
        assert_eq!(spec.exposed_ports(), &[POSTGRES_PORT]);
        assert_eq!(spec.files().len(), 1);
        assert!(matches!(
            spec.effective_wait_strategy(),
            WaitStrategy::LogPatternMatch { times: 2, .. }
        ));
    }

    #[test]
    fn test_redis_preset() {
        let spec = redis("7").unwrap();
        assert_eq!(spec.image(), "redis:7");
        assert_eq!(spec.primary_port(), Some(REDIS_PORT));
    }
}
