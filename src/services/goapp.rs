//! A Go application built and run inside `golang:alpine`.

use std::path::{Path, PathBuf};

use crate::error::{ConfigError, Result};
use crate::lifecycle::{Environment, InstanceHandle, InstanceSpec, Payload, SetupStep};
use crate::readiness::ReadinessCheck;
use crate::runtime::NativeHealthCheck;
use crate::services::Service;

/// Where the built binary lands inside the container.
const BIN_DIR: &str = "/usr/local/bin";

/// A Go project copied into the instance, built there and launched in the
/// background.
///
/// The app listens on the same port inside and outside the container, so
/// the port is leased when the preset is built and can be handed to the app
/// through its environment before the instance exists.
#[derive(Debug, Clone)]
pub struct GoApp {
    pub name: String,
    /// Project root on the host; also its path inside the instance.
    pub app_dir: PathBuf,
    /// Package to build, relative to `app_dir`.
    pub build_dir: String,
    /// Path polled with `curl` for readiness.
    pub health_endpoint: String,
    pub port: u16,
    pub env: Vec<(String, String)>,
}

impl GoApp {
    pub const IMAGE: &'static str = "golang:alpine";

    /// Lease a port from `env` for the app.
    pub fn new(
        env: &Environment,
        name: impl Into<String>,
        app_dir: impl Into<PathBuf>,
        build_dir: impl Into<String>,
        health_endpoint: impl Into<String>,
    ) -> Result<Self> {
        let lease = env.ports().acquire()?;
        Ok(Self::with_port(name, lease.port, app_dir, build_dir, health_endpoint))
    }

    /// Use a caller-chosen port.
    pub fn with_port(
        name: impl Into<String>,
        port: u16,
        app_dir: impl Into<PathBuf>,
        build_dir: impl Into<String>,
        health_endpoint: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            app_dir: app_dir.into(),
            build_dir: build_dir.into(),
            health_endpoint: health_endpoint.into(),
            port,
            env: Vec::new(),
        }
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Binary name: the last component of `build_dir`.
    pub fn binary(&self) -> String {
        Path::new(&self.build_dir)
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "app".to_string())
    }

    pub fn url(&self, instance: &InstanceHandle) -> Option<String> {
        instance.endpoint(self.port).map(|e| e.url("http"))
    }

    fn health_command(&self) -> String {
        format!(
            "curl -fs http://localhost:{}/{}",
            self.port,
            self.health_endpoint.trim_start_matches('/')
        )
    }
}

impl Service for GoApp {
    fn spec(&self) -> Result<InstanceSpec> {
        let app_dir = self.app_dir.to_str().ok_or_else(|| ConfigError::InvalidValue {
            key: "app_dir".to_string(),
            message: format!("'{}' is not valid unicode", self.app_dir.display()),
        })?;
        let binary = self.binary();

        let mut spec = InstanceSpec::new("goapp", Self::IMAGE)
            .named(format!("{binary}-{}", self.name))
            .fixed_port(self.port, self.port)
            .tty(true);
        for (key, value) in &self.env {
            spec = spec.env(key, value);
        }

        Ok(spec
            .payload(Payload::path(&self.app_dir, app_dir))
            .setup(SetupStep::run(["apk", "update"]))
            .setup(SetupStep::run(["apk", "add", "curl"]))
            .setup(SetupStep::shell(format!(
                "cd {app_dir} && go build -o {BIN_DIR}/{binary} ./{}",
                self.build_dir.trim_start_matches("./")
            )))
            .setup(SetupStep::start([format!("{BIN_DIR}/{binary}")]))
            .readiness(ReadinessCheck::native(NativeHealthCheck::shell(
                self.health_command(),
            ))))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::config::Config;
    use crate::lifecycle::PortRequest;
    use crate::testing::StubRuntime;

    fn app() -> GoApp {
        GoApp::with_port("api", 18080, "/src/shop", "cmd/server", "/health")
    }

    #[test]
    fn test_spec() {
        let spec = app().env("MODE", "test").spec().unwrap();
        assert!(spec.name.starts_with("server-api"));
        assert_eq!(spec.ports, vec![PortRequest::fixed(18080, 18080)]);
        assert!(spec.tty);
        assert_eq!(spec.env, vec![("MODE".to_string(), "test".to_string())]);
        assert_eq!(spec.payloads[0].dest, "/src/shop");

        assert_eq!(
            spec.setup,
            vec![
                SetupStep::run(["apk", "update"]),
                SetupStep::run(["apk", "add", "curl"]),
                SetupStep::shell("cd /src/shop && go build -o /usr/local/bin/server ./cmd/server"),
                SetupStep::start(["/usr/local/bin/server"]),
            ]
        );
        let health = spec.readiness.unwrap();
        assert_eq!(
            health.native_health_check().unwrap().command,
            "curl -fs http://localhost:18080/health"
        );
    }

    #[tokio::test]
    async fn test_new_leases_port() {
        let stub = Arc::new(StubRuntime::new());
        let env = Environment::with_runtime(stub, Config::default()).await.unwrap();

        let app = GoApp::new(&env, "api", "/src/shop", "cmd/server", "health").unwrap();
        assert!(env.ports().is_allocated(app.port));
    }
}
