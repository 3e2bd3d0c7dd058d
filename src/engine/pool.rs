use std::sync::Arc;

use futures::future::BoxFuture;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PoolError {
    #[error("worker pool '{0}' is shut down")]
    Closed(&'static str),
}

/// Runs one unit of work. The token fires when the pool is shut down.
pub type Handler<T> = Arc<dyn Fn(T, CancellationToken) -> BoxFuture<'static, ()> + Send + Sync>;

/// Fixed number of workers pulling plain task values off a shared queue.
///
/// Queued tasks that never started are handed back by [`WorkerPool::shutdown_now`]
/// so the caller can undo whatever it reserved for them.
pub struct WorkerPool<T> {
    name: &'static str,
    tx: mpsc::UnboundedSender<T>,
    rx: Arc<Mutex<mpsc::UnboundedReceiver<T>>>,
    token: CancellationToken,
    workers: usize,
}

impl<T: Send + 'static> WorkerPool<T> {
    /// Spawns `workers` tasks on the current runtime.
    pub fn new(name: &'static str, workers: usize, handler: Handler<T>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel::<T>();
        let rx = Arc::new(Mutex::new(rx));
        let token = CancellationToken::new();
        let workers = workers.max(1);
        for _ in 0..workers {
            let rx = rx.clone();
            let token = token.clone();
            let handler = handler.clone();
            tokio::spawn(async move {
                loop {
                    let next = {
                        let mut rx = rx.lock().await;
                        tokio::select! {
                            biased;
                            _ = token.cancelled() => None,
                            task = rx.recv() => task,
                        }
                    };
                    let Some(task) = next else { break };
                    handler(task, token.clone()).await;
                }
            });
        }
        WorkerPool {
            name,
            tx,
            rx,
            token,
            workers,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    pub fn execute(&self, task: T) -> Result<(), PoolError> {
        if self.token.is_cancelled() {
            return Err(PoolError::Closed(self.name));
        }
        self.tx.send(task).map_err(|_| PoolError::Closed(self.name))
    }

    pub fn is_shutdown(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Interrupts running work and returns every task that never started.
    pub async fn shutdown_now(&self) -> Vec<T> {
        self.token.cancel();
        let mut rx = self.rx.lock().await;
        rx.close();
        let mut drained = Vec::new();
        while let Ok(task) = rx.try_recv() {
            drained.push(task);
        }
        debug!(pool = self.name, drained = drained.len(), "worker pool shut down");
        drained
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use futures::FutureExt;
    use tokio::sync::Notify;

    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn runs_every_task() {
        let done = Arc::new(AtomicUsize::new(0));
        let counter = done.clone();
        let handler: Handler<usize> = Arc::new(move |n: usize, _token: CancellationToken| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(n, Ordering::SeqCst);
            }
            .boxed()
        });
        let pool = WorkerPool::new("test", 4, handler);
        for _ in 0..10 {
            pool.execute(1).unwrap();
        }
        tokio::time::timeout(Duration::from_secs(5), async {
            while done.load(Ordering::SeqCst) < 10 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn shutdown_returns_unstarted_tasks_and_interrupts_running_ones() {
        let started = Arc::new(Notify::new());
        let interrupted = Arc::new(AtomicUsize::new(0));
        let (s, i) = (started.clone(), interrupted.clone());
        let handler: Handler<u32> = Arc::new(move |_n: u32, token: CancellationToken| {
            let (s, i) = (s.clone(), i.clone());
            async move {
                s.notify_one();
                token.cancelled().await;
                i.fetch_add(1, Ordering::SeqCst);
            }
            .boxed()
        });
        let pool = WorkerPool::new("blocking", 1, handler);
        for n in 0..5 {
            pool.execute(n).unwrap();
        }
        started.notified().await;

        let drained = pool.shutdown_now().await;
        assert_eq!(drained, vec![1, 2, 3, 4]);
        assert!(pool.is_shutdown());
        assert_eq!(pool.execute(9), Err(PoolError::Closed("blocking")));

        tokio::time::timeout(Duration::from_secs(5), async {
            while interrupted.load(Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }
}
