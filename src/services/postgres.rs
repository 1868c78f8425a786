//! PostgreSQL from the official image.

use std::path::PathBuf;

use crate::archive::ArchiveEntry;
use crate::error::Result;
use crate::lifecycle::{InstanceHandle, InstanceSpec, Payload};
use crate::readiness::ReadinessCheck;
use crate::runtime::NativeHealthCheck;
use crate::services::{INIT_SCRIPT, Service, collect_sql};

/// PostgreSQL with optional seed SQL.
///
/// Seed SQL runs from `/docker-entrypoint-initdb.d`. A sentinel table is
/// created after it, and the health check only passes once the sentinel
/// exists, so the callback never sees a half-seeded database.
#[derive(Debug, Clone, Default)]
pub struct Postgres {
    pub name: String,
    pub sql_file: Option<PathBuf>,
    pub query: Option<String>,
}

impl Postgres {
    pub const IMAGE: &'static str = "postgres:latest";
    pub const PORT: u16 = 5432;
    pub const USER: &'static str = "postgres";
    pub const PASSWORD: &'static str = "pass";
    pub const SENTINEL: &'static str = "postgres.public.z_z_";

    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Run this file's SQL at startup.
    pub fn with_sql_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.sql_file = Some(path.into());
        self
    }

    /// Run this SQL at startup, after the file.
    pub fn with_query(mut self, query: impl Into<String>) -> Self {
        self.query = Some(query.into());
        self
    }

    /// `postgres://` URL for a running instance.
    pub fn url(instance: &InstanceHandle) -> Option<String> {
        let endpoint = instance.endpoint(Self::PORT)?;
        Some(format!(
            "postgres://{}:{}@{endpoint}/postgres?sslmode=disable",
            Self::USER,
            Self::PASSWORD
        ))
    }

    fn init_script(&self) -> Result<String> {
        let sql = collect_sql(self.sql_file.as_deref(), self.query.as_deref())?;
        Ok(format!("{sql};CREATE TABLE {}(id integer);", Self::SENTINEL))
    }
}

impl Service for Postgres {
    fn spec(&self) -> Result<InstanceSpec> {
        let script = ArchiveEntry::file(INIT_SCRIPT, self.init_script()?).with_mode(0o777);
        let health = NativeHealthCheck::shell(format!(
            "psql -U {} -h localhost -c 'select 1 from {} limit 1'",
            Self::USER,
            Self::SENTINEL
        ));

        Ok(InstanceSpec::new("postgres", Self::IMAGE)
            .named(&self.name)
            .port(Self::PORT)
            .env("POSTGRES_PASSWORD", Self::PASSWORD)
            .payload(Payload::entries(vec![script], "/docker-entrypoint-initdb.d"))
            .readiness(ReadinessCheck::native(health)))
    }
}
