//! Lifecycle tests against the in-memory engine.
//!
//! Every test builds an `Environment` on a `StubRuntime` with millisecond
//! timings and checks what the engine saw: which containers exist, what was
//! executed, and that teardown happened exactly once on every exit path.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::FutureExt;
use futures::future::join_all;
use pretty_assertions::assert_eq;

use tempcontainers::testing::StubRuntime;
use tempcontainers::{
    ArchiveEntry, Config, Environment, Error, HealthStatus, InstanceSpec, NativeHealthCheck,
    Payload, ReadinessCheck, SetupStep,
};

const PREFIX: &str = "tempcontainers-";

fn fast_config() -> Config {
    let mut config = Config::default();
    config.lifecycle.probe_interval = Duration::from_millis(10);
    config.lifecycle.probe_timeout = Duration::from_secs(5);
    config.lifecycle.stop_grace = Duration::from_millis(10);
    config.lifecycle.cleanup_timeout = Duration::from_millis(200);
    config.lifecycle.cleanup_poll_interval = Duration::from_millis(10);
    config
}

async fn environment(stub: &Arc<StubRuntime>) -> Environment {
    Environment::with_runtime(stub.clone(), fast_config())
        .await
        .expect("environment")
}

fn redis() -> InstanceSpec {
    InstanceSpec::new("redis", "redis:latest")
        .named("cache")
        .port(6379)
        .readiness(ReadinessCheck::command(["redis-cli", "ping"]))
}

// ---------------------------------------------------------------------------
// Teardown on every exit path
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_success_tears_down_once() {
    let stub = Arc::new(StubRuntime::new());
    let env = environment(&stub).await;

    let observed = stub.clone();
    let name = env
        .with_instance(redis(), |instance| async move {
            assert!(instance.name().starts_with("tempcontainers-redis-cache-"));
            assert_eq!(instance.name().matches(PREFIX).count(), 1);
            assert!(instance.host_port(6379).is_some());

            let container = observed.container_by_name(instance.name()).unwrap();
            assert!(container.running);
            Ok(instance.name().to_string())
        })
        .await
        .unwrap();

    assert!(stub.container_names().is_empty());
    assert_eq!(stub.removed_names(), vec![name]);
    assert_eq!(stub.stop_count(), 1);
    assert_eq!(env.cleanup().live_count(), 0);
}

#[tokio::test]
async fn test_callback_error_tears_down_and_propagates() {
    let stub = Arc::new(StubRuntime::new());
    let env = environment(&stub).await;

    let err = env
        .with_instance(redis(), |_instance| async move {
            Err::<(), _>(anyhow::anyhow!("assertion in test body failed"))
        })
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Callback(_)));
    assert_eq!(err.to_string(), "assertion in test body failed");
    assert!(stub.container_names().is_empty());
    assert_eq!(stub.removed_names().len(), 1);
}

#[tokio::test]
async fn test_panic_tears_down_then_resumes() {
    let stub = Arc::new(StubRuntime::new());
    let env = environment(&stub).await;

    let explode = true;
    let result = AssertUnwindSafe(env.with_instance(redis(), |_instance| async move {
        if explode {
            panic!("test body panicked");
        }
        Ok(())
    }))
    .catch_unwind()
    .await;

    let payload = result.unwrap_err();
    assert_eq!(payload.downcast_ref::<&str>(), Some(&"test body panicked"));
    assert!(stub.container_names().is_empty());
    assert_eq!(stub.removed_names().len(), 1);
    assert_eq!(env.cleanup().live_count(), 0);
}

#[tokio::test]
async fn test_dropped_future_still_removes_instance() {
    let stub = Arc::new(StubRuntime::new());
    let env = environment(&stub).await;
    stub.set_exec_delay(Duration::from_millis(500));

    let spec = InstanceSpec::new("postgres", "postgres:latest").setup(SetupStep::run(["migrate"]));
    let in_flight = env.with_instance(spec, |_instance| async move { Ok(()) });
    let timed_out = tokio::time::timeout(Duration::from_millis(50), in_flight).await;
    assert!(timed_out.is_err());

    for _ in 0..100 {
        if stub.container_names().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(stub.container_names().is_empty());
    assert_eq!(stub.removed_names().len(), 1);
}

// ---------------------------------------------------------------------------
// Provisioning failures
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_probe_timeout_reports_last_output() {
    let stub = Arc::new(StubRuntime::new());
    let env = environment(&stub).await;
    stub.respond_to("pg_isready", 2, "no response");

    let called = Arc::new(AtomicBool::new(false));
    let flag = called.clone();
    let spec = InstanceSpec::new("postgres", "postgres:latest").readiness(
        ReadinessCheck::command(["pg_isready"]).with_timeout(Duration::from_millis(150)),
    );

    let err = env
        .with_instance(spec, |_instance| async move {
            flag.store(true, Ordering::SeqCst);
            Ok(())
        })
        .await
        .unwrap_err();

    match err {
        Error::ProbeTimedOut { detail, timeout, .. } => {
            assert_eq!(detail, "no response");
            assert_eq!(timeout, Duration::from_millis(150));
        }
        other => panic!("expected ProbeTimedOut, got {other:?}"),
    }
    assert!(!called.load(Ordering::SeqCst));
    assert!(stub.container_names().is_empty());
}

#[tokio::test]
async fn test_early_death_short_circuits_wait() {
    let stub = Arc::new(StubRuntime::new());
    let env = environment(&stub).await;
    stub.script_native_health(vec![(HealthStatus::Starting, "starting up")]);
    stub.die_after_inspects(2, 137);

    let spec = InstanceSpec::new("mysql", "mysql:latest").readiness(
        ReadinessCheck::native(NativeHealthCheck::shell("mysqladmin ping"))
            .with_timeout(Duration::from_secs(30)),
    );

    let started = tokio::time::Instant::now();
    let err = env
        .with_instance(spec, |_instance| async move { Ok(()) })
        .await
        .unwrap_err();

    match err {
        Error::InstanceDied { detail, .. } => assert!(detail.contains("137"), "{detail}"),
        other => panic!("expected InstanceDied, got {other:?}"),
    }
    assert!(started.elapsed() < Duration::from_secs(1));
    assert!(stub.container_names().is_empty());
}

#[tokio::test]
async fn test_fail_twice_then_ready() {
    let stub = Arc::new(StubRuntime::new());
    let env = environment(&stub).await;
    stub.fail_then_succeed("redis-cli", 2, "Could not connect");

    let probes = |stub: &StubRuntime| {
        stub.exec_log()
            .into_iter()
            .filter(|argv| argv[0] == "redis-cli")
            .count()
    };

    let observed = stub.clone();
    env.with_instance(redis(), |_instance| async move {
        // The instance is still up here; polling must already have stopped.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(probes(&observed), 3);
        Ok(())
    })
    .await
    .unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(probes(&stub), 3);
}

#[tokio::test]
async fn test_pull_failure_creates_nothing() {
    let stub = Arc::new(StubRuntime::new());
    let env = environment(&stub).await;
    stub.fail_pull("manifest unknown");

    let err = env
        .with_instance(redis(), |_instance| async move { Ok(()) })
        .await
        .unwrap_err();

    assert!(matches!(err, Error::ImagePullFailed { .. }));
    assert_eq!(stub.create_count(), 0);
    assert_eq!(stub.remove_count(), 0);
}

#[tokio::test]
async fn test_start_failure_removes_created_container() {
    let stub = Arc::new(StubRuntime::new());
    let env = environment(&stub).await;
    stub.fail_start("port is already allocated");

    let err = env
        .with_instance(redis(), |_instance| async move { Ok(()) })
        .await
        .unwrap_err();

    assert!(matches!(err, Error::StartFailed { .. }));
    assert!(stub.container_names().is_empty());
    assert_eq!(stub.removed_names().len(), 1);
}

#[tokio::test]
async fn test_setup_failure_tears_down() {
    let stub = Arc::new(StubRuntime::new());
    let env = environment(&stub).await;
    stub.respond_to("migrate", 2, "relation already exists");

    let spec = InstanceSpec::new("postgres", "postgres:latest").setup(SetupStep::run(["migrate"]));
    let err = env
        .with_instance(spec, |_instance| async move { Ok(()) })
        .await
        .unwrap_err();

    assert_eq!(err.exec_output(), Some("relation already exists"));
    assert!(stub.container_names().is_empty());
}

// ---------------------------------------------------------------------------
// Sequencing
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_payloads_then_setup_then_after_ready() {
    let stub = Arc::new(StubRuntime::new());
    let env = environment(&stub).await;

    let spec = InstanceSpec::new("postgres", "postgres:latest")
        .payload(Payload::entries(
            vec![ArchiveEntry::file("init.sql", "create table t (id int);")],
            "/seed",
        ))
        .setup(SetupStep::run(["migrate"]))
        .after_ready(SetupStep::run(["seed"]))
        .readiness(ReadinessCheck::command(["ready"]));

    env.with_instance(spec, |_instance| async move { Ok(()) })
        .await
        .unwrap();

    let log = stub.exec_log();
    let position = |program: &str| log.iter().position(|argv| argv[0] == program).unwrap();
    assert!(position("mkdir") < position("migrate"));
    assert!(position("migrate") < position("seed"));
    assert_eq!(log.last().unwrap(), &vec!["seed".to_string()]);

    let copies = stub.copies();
    assert_eq!(copies.len(), 1);
    assert_eq!(copies[0].dest, "/seed");
}

#[tokio::test]
async fn test_skip_pull() {
    let stub = Arc::new(StubRuntime::new());
    let mut config = fast_config();
    config.lifecycle.skip_pull = true;
    let env = Environment::with_runtime(stub.clone(), config).await.unwrap();

    env.with_instance(redis(), |_instance| async move { Ok(()) })
        .await
        .unwrap();
    assert_eq!(stub.pull_count(), 0);

    let env = environment(&stub).await;
    env.with_instance(redis(), |_instance| async move { Ok(()) })
        .await
        .unwrap();
    assert_eq!(stub.pull_count(), 1);
}

#[tokio::test]
async fn test_concurrent_instances_are_isolated() {
    let stub = Arc::new(StubRuntime::new());
    let env = environment(&stub).await;

    let runs = (0..8).map(|_| {
        env.with_instance(redis(), |instance| async move {
            Ok((instance.name().to_string(), instance.host_port(6379).unwrap()))
        })
    });
    let results: Vec<(String, u16)> = join_all(runs)
        .await
        .into_iter()
        .map(|r| r.unwrap())
        .collect();

    let mut names: Vec<_> = results.iter().map(|(n, _)| n.clone()).collect();
    let mut ports: Vec<_> = results.iter().map(|(_, p)| *p).collect();
    names.sort();
    names.dedup();
    ports.sort();
    ports.dedup();
    assert_eq!(names.len(), 8);
    assert_eq!(ports.len(), 8);
    assert!(stub.container_names().is_empty());
}

// ---------------------------------------------------------------------------
// Sweeps
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_startup_sweep_removes_only_prefixed() {
    let stub = Arc::new(StubRuntime::new());
    stub.spawn_running("tempcontainers-redis-old-1a2b3c4d");
    stub.spawn_running("tempcontainers-postgres-old-5e6f7a8b");
    stub.spawn_running("someone-elses-database");

    let _env = environment(&stub).await;

    assert_eq!(stub.container_names(), vec!["someone-elses-database".to_string()]);
}

#[tokio::test]
async fn test_startup_sweep_failure_is_fatal() {
    let stub = Arc::new(StubRuntime::new());
    let id = stub.spawn_running("tempcontainers-stuck");
    stub.make_unremovable(&id);

    let err = Environment::with_runtime(stub.clone(), fast_config())
        .await
        .unwrap_err();

    match err {
        Error::CleanupFailed { remaining, .. } => assert_eq!(remaining, 1),
        other => panic!("expected CleanupFailed, got {other:?}"),
    }
}

#[tokio::test]
async fn test_custom_prefix_scopes_sweep() {
    let stub = Arc::new(StubRuntime::new());
    stub.spawn_running("tempcontainers-redis-a");
    stub.spawn_running("ci-redis-b");

    let config = fast_config().with_prefix("ci-");
    let env = Environment::with_runtime(stub.clone(), config).await.unwrap();
    assert_eq!(stub.container_names(), vec!["tempcontainers-redis-a".to_string()]);

    let name = env
        .with_instance(redis(), |instance| async move { Ok(instance.name().to_string()) })
        .await
        .unwrap();
    assert!(name.starts_with("ci-redis-cache-"));
}

#[tokio::test]
async fn test_shutdown_sweeps_leftovers() {
    let stub = Arc::new(StubRuntime::new());
    let env = environment(&stub).await;
    stub.spawn_running("tempcontainers-leaked");

    assert_eq!(env.shutdown().await.unwrap(), 1);
    assert!(stub.container_names().is_empty());
}

#[tokio::test]
async fn test_signal_sweep_removes_running_instance() {
    let stub = Arc::new(StubRuntime::new());
    let env = environment(&stub).await;

    let handler = env.install_signal_handlers();
    let cleanup = env.cleanup().clone();
    let observed = stub.clone();
    env.with_instance(redis(), |instance| async move {
        let code = cleanup
            .on_signal(tempcontainers::TerminationSignal::Terminate)
            .await;
        assert_eq!(code, 143);
        assert!(observed.container_by_name(instance.name()).is_none());
        Ok(())
    })
    .await
    .unwrap();

    // No signal arrived, so the handler is still waiting.
    assert!(!handler.is_finished());
    handler.abort();
    assert!(stub.container_names().is_empty());
}
