//! SQL Server from Microsoft's image.

use std::path::PathBuf;

use crate::archive::ArchiveEntry;
use crate::error::Result;
use crate::lifecycle::{InstanceHandle, InstanceSpec, Payload, SetupStep};
use crate::readiness::ReadinessCheck;
use crate::runtime::NativeHealthCheck;
use crate::services::{INIT_SCRIPT, Service, WAIT_ATTEMPTS, collect_sql, retry_script};

const SQLCMD: &str = "/opt/mssql-tools/bin/sqlcmd";

/// SQL Server with optional seed SQL.
///
/// The entrypoint has no init directory, so the seed script is copied to
/// `/tmp` and run with `sqlcmd` once the server accepts logins. The script
/// creates `temp_schema.zz` first; the health check waits for the seed to
/// finish by querying it.
#[derive(Debug, Clone, Default)]
pub struct SqlServer {
    pub name: String,
    pub sql_file: Option<PathBuf>,
    pub query: Option<String>,
}

impl SqlServer {
    pub const IMAGE: &'static str = "mcr.microsoft.com/mssql/server:2017-latest";
    pub const PORT: u16 = 1433;
    pub const SA_PASSWORD: &'static str = "Passpass_1";

    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_sql_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.sql_file = Some(path.into());
        self
    }

    pub fn with_query(mut self, query: impl Into<String>) -> Self {
        self.query = Some(query.into());
        self
    }

    /// ADO-style connection string for a running instance.
    pub fn connection_string(instance: &InstanceHandle) -> Option<String> {
        let endpoint = instance.endpoint(Self::PORT)?;
        Some(format!(
            "Server={},{};User Id=SA;Password={};",
            crate::lifecycle::InstanceEndpoint::HOST,
            endpoint.port,
            Self::SA_PASSWORD
        ))
    }

    fn init_script(&self) -> Result<String> {
        let sql = collect_sql(self.sql_file.as_deref(), self.query.as_deref())?;
        Ok(format!(
            "CREATE SCHEMA temp_schema\nGO\nCREATE TABLE temp_schema.zz(id int)\nGO\n{sql}\n"
        ))
    }

    fn sqlcmd(args: &[&str]) -> Vec<String> {
        [SQLCMD, "-b", "-U", "SA", "-P", Self::SA_PASSWORD]
            .iter()
            .chain(args)
            .map(|s| s.to_string())
            .collect()
    }
}

impl Service for SqlServer {
    fn spec(&self) -> Result<InstanceSpec> {
        let script = ArchiveEntry::file(INIT_SCRIPT, self.init_script()?).with_mode(0o777);
        let login = Self::sqlcmd(&["-Q", "'SELECT 1'"]).join(" ");
        let health = NativeHealthCheck::shell(format!(
            "{SQLCMD} -U SA -P {} -b -Q 'SELECT \"startup SQL initialized\" FROM master.temp_schema.zz'",
            Self::SA_PASSWORD
        ));

        Ok(InstanceSpec::new("sqlserver", Self::IMAGE)
            .named(&self.name)
            .port(Self::PORT)
            .env("SA_PASSWORD", Self::SA_PASSWORD)
            .env("ACCEPT_EULA", "Y")
            .payload(Payload::entries(vec![script], "/tmp"))
            .setup(SetupStep::shell(retry_script(&login, "sql server", WAIT_ATTEMPTS)))
            .setup(SetupStep::Run(Self::sqlcmd(&[
                "-i",
                &format!("/tmp/{INIT_SCRIPT}"),
            ])))
            .readiness(ReadinessCheck::native(health)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_script_creates_sentinel_first() {
        let script = SqlServer::new("db").with_query("CREATE TABLE t (id int)").init_script().unwrap();
        let sentinel = script.find("CREATE TABLE temp_schema.zz").unwrap();
        let user = script.find("CREATE TABLE t (id int)").unwrap();
        assert!(sentinel < user);
    }

    #[test]
    fn test_spec_runs_script_after_login_wait() {
        let spec = SqlServer::new("db").spec().unwrap();
        assert_eq!(spec.image, SqlServer::IMAGE);
        assert!(spec.env.contains(&("ACCEPT_EULA".to_string(), "Y".to_string())));
        assert_eq!(spec.payloads[0].dest, "/tmp");

        assert_eq!(spec.setup.len(), 2);
        let SetupStep::Run(wait) = &spec.setup[0] else {
            panic!("expected a waited step");
        };
        assert!(wait[2].contains("-Q 'SELECT 1'"));
        assert_eq!(
            spec.setup[1],
            SetupStep::Run(SqlServer::sqlcmd(&["-i", "/tmp/tempcontainers-init.sql"]))
        );
    }
}
