//! MySQL from the official image.

use std::path::PathBuf;

use crate::archive::ArchiveEntry;
use crate::error::{ConfigError, Result};
use crate::lifecycle::{InstanceHandle, InstanceSpec, Payload};
use crate::readiness::ReadinessCheck;
use crate::services::Service;

/// Extensions the entrypoint runs from `/docker-entrypoint-initdb.d`.
const INIT_EXTENSIONS: [&str; 3] = [".sh", ".sql", ".sql.gz"];

const INIT_DIR: &str = "/docker-entrypoint-initdb.d";

/// MySQL with optional seed SQL.
///
/// MySQL accepts connections before its init scripts finish, so readiness
/// is a query against `initialize_table`: pick a table the seed SQL creates
/// last, or `information_schema.COLUMNS` when there is no seed.
#[derive(Debug, Clone)]
pub struct MySql {
    pub name: String,
    pub initialize_table: String,
    pub sql_file: Option<PathBuf>,
    pub query: Option<String>,
}

impl MySql {
    pub const IMAGE: &'static str = "mysql:latest";
    pub const PORT: u16 = 3306;
    pub const ROOT_PASSWORD: &'static str = "pass";

    pub fn new(name: impl Into<String>, initialize_table: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            initialize_table: initialize_table.into(),
            sql_file: None,
            query: None,
        }
    }

    /// Must end in `.sh`, `.sql` or `.sql.gz`.
    pub fn with_sql_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.sql_file = Some(path.into());
        self
    }

    pub fn with_query(mut self, query: impl Into<String>) -> Self {
        self.query = Some(query.into());
        self
    }

    /// `mysql://` URL for a running instance.
    pub fn url(instance: &InstanceHandle) -> Option<String> {
        let endpoint = instance.endpoint(Self::PORT)?;
        Some(format!("mysql://root:{}@{endpoint}/mysql", Self::ROOT_PASSWORD))
    }

    fn check_sql_file(&self) -> Result<()> {
        let Some(path) = &self.sql_file else {
            return Ok(());
        };
        let name = path.to_string_lossy();
        if INIT_EXTENSIONS.iter().any(|ext| name.ends_with(ext)) {
            return Ok(());
        }
        Err(ConfigError::InvalidValue {
            key: "sql_file".to_string(),
            message: format!(
                "'{}' must end in .sh, .sql or .sql.gz or it will not run during initialization",
                path.display()
            ),
        }
        .into())
    }
}

impl Service for MySql {
    fn spec(&self) -> Result<InstanceSpec> {
        self.check_sql_file()?;

        let probe = format!(
            "mysql -uroot -p{} -e 'select 1 from {} limit 1'",
            Self::ROOT_PASSWORD,
            self.initialize_table
        );
        let mut spec = InstanceSpec::new("mysql", Self::IMAGE)
            .named(&self.name)
            .port(Self::PORT)
            .env("MYSQL_ROOT_PASSWORD", Self::ROOT_PASSWORD)
            .readiness(ReadinessCheck::command(["sh", "-c", probe.as_str()]));

        if let Some(path) = &self.sql_file {
            spec = spec.payload(Payload::path(path, INIT_DIR));
        }
        if let Some(query) = &self.query {
            let file = ArchiveEntry::file("tempcontainers-query.sql", query.as_bytes());
            spec = spec.payload(Payload::entries(vec![file], INIT_DIR));
        }
        Ok(spec)
    }
}
