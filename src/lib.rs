//! Disposable container instances for integration tests.
//!
//! An [`Environment`] owns the engine connection, a port allocator and a
//! registry of live instances. [`Environment::with_instance`] provisions one
//! instance from an [`InstanceSpec`], waits until it is ready, hands it to a
//! callback and removes it afterwards, however the callback ends.
//!
//! Every instance name starts with a reserved prefix (`tempcontainers-` by
//! default). Anything carrying that prefix is treated as disposable: it is
//! swept on startup, on shutdown and, once
//! [`Environment::install_signal_handlers`] has been called, on
//! SIGINT/SIGTERM.
//!
//! ```text
//!   Config ──► Environment ──► with_instance(spec, f)
//!                  │
//!                  ├── PortAllocator      fresh loopback ports
//!                  ├── ContainerRuntime   bollard API or engine CLI
//!                  ├── ReadinessMonitor   native health or exec probe
//!                  └── CleanupRegistry    prefix sweep, signal handling
//! ```
//!
//! Presets for common services live in [`services`].

pub mod archive;
pub mod cleanup;
pub mod cli;
pub mod config;
pub mod error;
pub mod exec;
pub mod initializer;
pub mod lifecycle;
pub mod ports;
pub mod readiness;
pub mod runtime;
pub mod services;
pub mod testing;

pub use archive::{ArchiveEntry, ArchiveTransfer, Compression};
pub use cleanup::{CleanupRegistry, TerminationSignal};
pub use config::{Backend, Config, LifecycleConfig, RuntimeConfig};
pub use error::{ConfigError, Error, Result};
pub use exec::CommandExecutor;
pub use initializer::ConcurrentInitializer;
pub use lifecycle::{
    Environment, InstanceEndpoint, InstanceHandle, InstanceSpec, Payload, Phase, SetupStep,
};
pub use ports::{PortAllocator, PortLease};
pub use readiness::{Probe, ReadinessCheck, ReadinessState};
pub use runtime::{ContainerRuntime, ExecOutput, HealthStatus, NativeHealthCheck};
