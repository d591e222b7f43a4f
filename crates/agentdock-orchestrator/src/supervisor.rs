use std::any::Any;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

pub const DEFAULT_MAX_CONCURRENT_TASKS: usize = 16;

/// Runs task workers under a concurrency cap and reports workers that died
/// without finishing.
#[derive(Clone)]
pub struct TaskSupervisor {
    permits: Arc<Semaphore>,
    active: Arc<AtomicUsize>,
    waiting: Arc<AtomicUsize>,
}

impl TaskSupervisor {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
            active: Arc::new(AtomicUsize::new(0)),
            waiting: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn waiting_count(&self) -> usize {
        self.waiting.load(Ordering::SeqCst)
    }

    /// Spawns `work` once a permit is free. If the worker panics or is
    /// aborted, `recover` runs with a description of what happened.
    pub fn spawn<W, R, RF>(&self, task_id: &str, work: W, recover: R) -> JoinHandle<()>
    where
        W: Future<Output = ()> + Send + 'static,
        R: FnOnce(String) -> RF + Send + 'static,
        RF: Future<Output = ()> + Send + 'static,
    {
        let permits = self.permits.clone();
        let active = self.active.clone();
        let waiting = self.waiting.clone();
        let task_id = task_id.to_string();
        waiting.fetch_add(1, Ordering::SeqCst);
        tokio::spawn(async move {
            let permit = permits.acquire_owned().await.ok();
            waiting.fetch_sub(1, Ordering::SeqCst);
            active.fetch_add(1, Ordering::SeqCst);
            let outcome = tokio::spawn(work).await;
            active.fetch_sub(1, Ordering::SeqCst);
            drop(permit);

            if let Err(err) = outcome {
                let detail = if err.is_panic() {
                    panic_message(err.into_panic())
                } else {
                    "worker was cancelled".to_string()
                };
                tracing::error!(task_id = %task_id, "task worker died: {detail}");
                recover(detail).await;
            }
        })
    }
}

impl Default for TaskSupervisor {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CONCURRENT_TASKS)
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use tokio::sync::oneshot;

    use super::*;

    #[tokio::test]
    async fn panicking_worker_triggers_recovery() {
        let supervisor = TaskSupervisor::new(2);
        let (tx, rx) = oneshot::channel();
        let handle = supervisor.spawn(
            "t1",
            async { panic!("provider exploded") },
            move |detail| async move {
                let _ = tx.send(detail);
            },
        );
        handle.await.expect("supervisor");
        assert_eq!(rx.await.expect("recovered"), "provider exploded");
        assert_eq!(supervisor.active_count(), 0);
    }

    #[tokio::test]
    async fn clean_worker_skips_recovery() {
        let supervisor = TaskSupervisor::default();
        let recovered = Arc::new(Mutex::new(false));
        let flag = recovered.clone();
        supervisor
            .spawn("t1", async {}, move |_| async move {
                if let Ok(mut flag) = flag.lock() {
                    *flag = true;
                }
            })
            .await
            .expect("supervisor");
        assert!(!*recovered.lock().expect("lock"));
    }

    #[tokio::test]
    async fn concurrency_is_capped() {
        let supervisor = TaskSupervisor::new(1);
        let (release_tx, release_rx) = oneshot::channel::<()>();
        let first = supervisor.spawn(
            "t1",
            async {
                let _ = release_rx.await;
            },
            |_| async {},
        );
        let second = supervisor.spawn("t2", async {}, |_| async {});
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(supervisor.active_count(), 1);
        assert_eq!(supervisor.waiting_count(), 1);

        let _ = release_tx.send(());
        first.await.expect("first");
        second.await.expect("second");
        assert_eq!(supervisor.active_count(), 0);
        assert_eq!(supervisor.waiting_count(), 0);
    }
}
