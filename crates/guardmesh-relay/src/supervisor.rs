//! Supervised task group sharing one shutdown signal.
//!
//! The group fails as a unit: the first task error (or panic) flips the
//! shutdown signal, every task is given `unwind` to return, and whatever is
//! still running afterwards is aborted.

use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

pub type TaskError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("task '{task}' failed: {source}")]
    Task {
        task: &'static str,
        #[source]
        source: TaskError,
    },

    #[error("task panicked: {0}")]
    Panicked(String),
}

pub struct Supervisor {
    tasks: JoinSet<(&'static str, Result<(), TaskError>)>,
    shutdown: watch::Sender<bool>,
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl Supervisor {
    pub fn new() -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            tasks: JoinSet::new(),
            shutdown,
        }
    }

    /// A receiver that observes the group's shutdown signal.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    pub fn spawn<F>(&mut self, name: &'static str, task: F)
    where
        F: Future<Output = Result<(), TaskError>> + Send + 'static,
    {
        self.tasks.spawn(async move { (name, task.await) });
        info!(task = name, "Task started");
    }

    /// Run until `stop` resolves or a task fails, then shut the group down.
    ///
    /// Returns the first failure, if any.
    pub async fn run(
        mut self,
        stop: impl Future<Output = ()>,
        unwind: Duration,
    ) -> Result<(), SupervisorError> {
        let mut first_error = None;
        tokio::pin!(stop);

        while !self.tasks.is_empty() {
            tokio::select! {
                () = &mut stop => {
                    info!("Shutdown requested");
                    break;
                }
                Some(joined) = self.tasks.join_next() => {
                    if let Some(e) = record(joined) {
                        first_error = Some(e);
                        break;
                    }
                }
            }
        }

        let _ = self.shutdown.send(true);
        let drain = async {
            while let Some(joined) = self.tasks.join_next().await {
                if let Some(e) = record(joined) {
                    first_error.get_or_insert(e);
                }
            }
        };
        if tokio::time::timeout(unwind, drain).await.is_err() {
            warn!(
                remaining = self.tasks.len(),
                unwind_secs = unwind.as_secs(),
                "Tasks did not stop in time, aborting"
            );
            self.tasks.shutdown().await;
        }

        first_error.map_or(Ok(()), Err)
    }
}

fn record(
    joined: Result<(&'static str, Result<(), TaskError>), tokio::task::JoinError>,
) -> Option<SupervisorError> {
    match joined {
        Ok((task, Ok(()))) => {
            info!(task, "Task finished");
            None
        }
        Ok((task, Err(source))) => {
            error!(task, error = %source, "Task failed");
            Some(SupervisorError::Task { task, source })
        }
        Err(e) => {
            error!(error = %e, "Task panicked");
            Some(SupervisorError::Panicked(e.to_string()))
        }
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;

    const UNWIND: Duration = Duration::from_secs(1);

    fn waits_for_shutdown(
        mut shutdown: watch::Receiver<bool>,
        stopped: Arc<AtomicBool>,
    ) -> impl Future<Output = Result<(), TaskError>> {
        async move {
            let _ = shutdown.changed().await;
            stopped.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    async fn explode() -> Result<(), TaskError> {
        panic!("boom")
    }

    #[tokio::test]
    async fn stop_signal_unwinds_every_task() {
        let mut group = Supervisor::new();
        let a = Arc::new(AtomicBool::new(false));
        let b = Arc::new(AtomicBool::new(false));
        group.spawn("a", waits_for_shutdown(group.subscribe(), Arc::clone(&a)));
        group.spawn("b", waits_for_shutdown(group.subscribe(), Arc::clone(&b)));

        group.run(async {}, UNWIND).await.unwrap();
        assert!(a.load(Ordering::SeqCst));
        assert!(b.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn first_error_cancels_the_rest() {
        let mut group = Supervisor::new();
        let survivor = Arc::new(AtomicBool::new(false));
        group.spawn(
            "survivor",
            waits_for_shutdown(group.subscribe(), Arc::clone(&survivor)),
        );
        group.spawn("tunnel", async { Err::<(), TaskError>("device gone".into()) });

        let err = group
            .run(std::future::pending::<()>(), UNWIND)
            .await
            .unwrap_err();
        assert!(matches!(err, SupervisorError::Task { task: "tunnel", .. }));
        assert!(err.to_string().contains("device gone"));
        assert!(survivor.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn panic_is_a_failure() {
        let mut group = Supervisor::new();
        group.spawn("api", explode());
        let err = group
            .run(std::future::pending::<()>(), UNWIND)
            .await
            .unwrap_err();
        assert!(matches!(err, SupervisorError::Panicked(_)));
    }

    #[tokio::test]
    async fn stuck_task_is_aborted_after_unwind() {
        let mut group = Supervisor::new();
        group.spawn("stuck", std::future::pending::<Result<(), TaskError>>());

        let started = tokio::time::Instant::now();
        group
            .run(async {}, Duration::from_millis(50))
            .await
            .unwrap();
        assert!(started.elapsed() < UNWIND);
    }

    #[tokio::test]
    async fn clean_exit_does_not_stop_the_group() {
        let mut group = Supervisor::new();
        let stopped = Arc::new(AtomicBool::new(false));
        group.spawn("oneshot", async { Ok::<(), TaskError>(()) });
        group.spawn(
            "long",
            waits_for_shutdown(group.subscribe(), Arc::clone(&stopped)),
        );

        let stop = async {
            tokio::time::sleep(Duration::from_millis(50)).await;
        };
        group.run(stop, UNWIND).await.unwrap();
        assert!(stopped.load(Ordering::SeqCst));
    }
}
