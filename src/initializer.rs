//! Fan-out of independent setup tasks.
//!
//! Every task runs to completion even when a sibling fails; the first
//! failure observed is what the caller sees.

use std::future::Future;

use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::task::JoinSet;

use crate::error::{Error, Result};

/// A labelled set of setup tasks run concurrently.
#[derive(Default)]
pub struct ConcurrentInitializer {
    tasks: Vec<(String, BoxFuture<'static, Result<()>>)>,
}

impl ConcurrentInitializer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a task. `label` is only used for logging.
    pub fn add<F>(&mut self, label: impl Into<String>, task: F) -> &mut Self
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        self.tasks.push((label.into(), task.boxed()));
        self
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Run every task and wait for all of them.
    ///
    /// Returns the first error observed. A panicking task is reported as
    /// [`Error::TaskFailed`].
    pub async fn run(self) -> Result<()> {
        let total = self.tasks.len();
        let mut join_set = JoinSet::new();

        for (label, task) in self.tasks {
            join_set.spawn(async move {
                let result = task.await;
                (label, result)
            });
        }

        let mut first_error = None;
        let mut failed = 0usize;

        while let Some(joined) = join_set.join_next().await {
            let error = match joined {
                Ok((label, Ok(()))) => {
                    tracing::debug!(task = %label, "setup task finished");
                    continue;
                }
                Ok((label, Err(e))) => {
                    tracing::debug!(task = %label, error = %e, "setup task failed");
                    e
                }
                Err(e) => Error::TaskFailed {
                    reason: e.to_string(),
                },
            };

            failed += 1;
            if first_error.is_none() {
                first_error = Some(error);
            }
        }

        match first_error {
            Some(e) => {
                tracing::info!(failed, total, "concurrent setup failed");
                Err(e)
            }
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for ConcurrentInitializer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let labels: Vec<&str> = self.tasks.iter().map(|(l, _)| l.as_str()).collect();
        f.debug_struct("ConcurrentInitializer")
            .field("tasks", &labels)
            .finish()
    }
}

/// Run `tasks` concurrently; see [`ConcurrentInitializer::run`].
pub async fn run_all<I, F>(tasks: I) -> Result<()>
where
    I: IntoIterator<Item = F>,
    F: Future<Output = Result<()>> + Send + 'static,
{
    let mut init = ConcurrentInitializer::new();
    for (i, task) in tasks.into_iter().enumerate() {
        init.add(format!("task-{i}"), task);
    }
    init.run().await
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn test_all_succeed() {
        let counter = Arc::new(AtomicU32::new(0));
        let tasks = (0..5).map(|_| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });
        run_all(tasks).await.unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_failure_does_not_abort_siblings() {
        let finished = Arc::new(AtomicU32::new(0));
        let mut init = ConcurrentInitializer::new();

        for i in 0..3u32 {
            let finished = finished.clone();
            init.add(format!("queue-{i}"), async move {
                if i == 1 {
                    return Err(Error::PortExhausted { attempts: 10 });
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
                finished.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        }
        assert_eq!(init.len(), 3);

        let err = init.run().await.unwrap_err();
        assert!(matches!(err, Error::PortExhausted { .. }));
        assert_eq!(finished.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_panic_becomes_task_failed() {
        let mut init = ConcurrentInitializer::new();
        init.add("ok", async { Ok(()) });
        let explode = true;
        init.add("boom", async move {
            if explode {
                panic!("setup exploded");
            }
            Ok(())
        });

        let err = init.run().await.unwrap_err();
        assert!(matches!(err, Error::TaskFailed { .. }));
    }

    #[tokio::test]
    async fn test_empty_is_ok() {
        assert!(ConcurrentInitializer::new().is_empty());
        ConcurrentInitializer::new().run().await.unwrap();
    }
}
