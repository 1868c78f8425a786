//! Instance lifecycle: provision, hand to the caller, always tear down.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                     Environment::with_instance(spec, f)                  │
//! │                                                                          │
//! │   ┌──────────────┐    ┌──────────────┐    ┌───────────────────────────┐  │
//! │   │ Lease Ports  │───▶│ Pull Image   │───▶│ Create & Start Container  │  │
//! │   │ (allocator)  │    │ (unless skip)│    │ (guard armed)             │  │
//! │   └──────────────┘    └──────────────┘    └───────────────────────────┘  │
//! │                                                  │                       │
//! │                                                  ▼                       │
//! │   ┌──────────────┐    ┌──────────────┐    ┌───────────────────────────┐  │
//! │   │ Setup Steps  │◀───│ Inject       │◀───│ Spawn Readiness Monitor   │  │
//! │   │ Run/Start/∥  │    │ Payloads     │    │ (watch + cancel token)    │  │
//! │   └──────────────┘    └──────────────┘    └───────────────────────────┘  │
//! │          │                                                               │
//! │          ▼                                                               │
//! │   ┌──────────────┐    ┌──────────────┐    ┌───────────────────────────┐  │
//! │   │ Wait Healthy │───▶│ After-Ready  │───▶│ f(InstanceHandle)         │  │
//! │   │ Died/TimedOut│    │ Steps        │    │ (panics caught)           │  │
//! │   └──────────────┘    └──────────────┘    └───────────────────────────┘  │
//! │                                                  │                       │
//! │                                                  ▼                       │
//! │                       ┌──────────────────────────────────────────────┐   │
//! │                       │ Stop Monitor ─▶ Stop (grace) ─▶ Force Remove  │   │
//! │                       │ exactly once, on every exit path              │   │
//! │                       └──────────────────────────────────────────────┘   │
//! └──────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use tempcontainers::{Config, Environment, InstanceSpec, ReadinessCheck};
//!
//! # async fn example() -> tempcontainers::Result<()> {
//! let env = Environment::init(Config::from_env()?).await?;
//!
//! let spec = InstanceSpec::new("redis", "redis:latest")
//!     .port(6379)
//!     .readiness(ReadinessCheck::command(["redis-cli", "ping"]));
//!
//! let port = env
//!     .with_instance(spec, |instance| async move {
//!         let out = instance.exec(&["redis-cli", "set", "k", "v"]).await?;
//!         assert_eq!(out.output.trim(), "OK");
//!         Ok(instance.host_port(6379))
//!     })
//!     .await?;
//!
//! println!("redis was on {port:?}");
//! env.shutdown().await?;
//! # Ok(())
//! # }
//! ```

pub mod instance;
pub mod manager;
pub mod spec;

pub use instance::{InstanceEndpoint, InstanceHandle, Phase};
pub use manager::Environment;
pub use spec::{InstanceSpec, Payload, PayloadSource, PortRequest, SetupStep};
