//! Ready-made instance specs for common backing services.
//!
//! Each preset builds an [`InstanceSpec`] with the image, ports, credentials,
//! seed data and readiness check the service needs, and can run it directly
//! through [`Service::run`]:
//!
//! ```rust,no_run
//! use tempcontainers::services::{Postgres, Service};
//! use tempcontainers::{Config, Environment};
//!
//! # async fn example() -> tempcontainers::Result<()> {
//! let env = Environment::init(Config::from_env()?).await?;
//! env.install_signal_handlers();
//! let pg = Postgres::new("orders").with_query("CREATE TABLE orders (id int)");
//!
//! pg.run(&env, |instance| async move {
//!     let url = Postgres::url(&instance);
//!     println!("postgres at {url:?}");
//!     Ok(())
//! })
//! .await?;
//! # Ok(())
//! # }
//! ```

mod goapp;
mod localstack;
mod mysql;
mod postgres;
mod rabbitmq;
mod redis;
mod sqlserver;

pub use goapp::GoApp;
pub use localstack::{LambdaFunction, Localstack, LocalstackService, SqsQueue};
pub use mysql::MySql;
pub use postgres::Postgres;
pub use rabbitmq::{Exchange, ExchangeType, QueueBinding, RabbitMq, RabbitQueue, Vhost};
pub use redis::Redis;
pub use sqlserver::SqlServer;

use std::future::Future;
use std::path::Path;

use crate::error::Result;
use crate::lifecycle::{Environment, InstanceHandle, InstanceSpec};

/// File name used for generated init scripts.
pub(crate) const INIT_SCRIPT: &str = "tempcontainers-init.sql";

/// Seconds a generated wait loop keeps retrying before failing.
pub(crate) const WAIT_ATTEMPTS: u32 = 120;

/// A service preset.
pub trait Service {
    /// Build the instance spec. Fails if seed files are missing or invalid.
    fn spec(&self) -> Result<InstanceSpec>;

    /// Provision the service, hand it to `f`, then tear it down.
    fn run<F, Fut, T>(&self, env: &Environment, f: F) -> impl Future<Output = Result<T>>
    where
        F: FnOnce(InstanceHandle) -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let spec = self.spec();
        async move { env.with_instance(spec?, f).await }
    }
}

/// Concatenate an optional SQL file and an optional query.
///
/// The `; ` separator keeps the query valid when the file does not end
/// with a semicolon.
pub(crate) fn collect_sql(file: Option<&Path>, query: Option<&str>) -> Result<String> {
    let mut sql = match file {
        Some(path) => std::fs::read_to_string(path)?,
        None => String::new(),
    };
    if let Some(query) = query {
        sql.push_str("; ");
        sql.push_str(query);
    }
    Ok(sql)
}

/// A shell loop that retries `check` once a second and exits non-zero
/// after `attempts` failures.
pub(crate) fn retry_script(check: &str, what: &str, attempts: u32) -> String {
    format!(
        "for _ in $(seq 1 {attempts}); do if ({check}) >/dev/null 2>&1; then exit 0; fi; \
         echo 'waiting for {what} to be up'; sleep 1; done; exit 1"
    )
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn test_collect_sql() {
        assert_eq!(collect_sql(None, None).unwrap(), "");
        assert_eq!(collect_sql(None, Some("select 1")).unwrap(), "; select 1");

        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "create table a (id int)").unwrap();
        assert_eq!(
            collect_sql(Some(file.path()), Some("insert into a values (1)")).unwrap(),
            "create table a (id int); insert into a values (1)"
        );
    }

    #[test]
    fn test_collect_sql_missing_file() {
        let err = collect_sql(Some(Path::new("/definitely/not/here.sql")), None).unwrap_err();
        assert!(matches!(err, crate::Error::Io(_)));
    }

    #[test]
    fn test_retry_script() {
        let script = retry_script("redis-cli ping", "redis", 5);
        assert!(script.starts_with("for _ in $(seq 1 5); do if (redis-cli ping)"));
        assert!(script.contains("waiting for redis to be up"));
        assert!(script.ends_with("exit 1"));
    }
}
