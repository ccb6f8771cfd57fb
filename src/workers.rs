use std::future::Future;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;

/// Worker count used when the caller does not specify one.
pub fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// A fixed-size pool of tasks draining a single work channel. Workers stop
/// when the channel closes; there are no ordering guarantees on output.
pub struct WorkerPool {
    set: JoinSet<()>,
}

impl WorkerPool {
    pub fn spawn<T, F, Fut>(workers: usize, rx: mpsc::Receiver<T>, handler: F) -> Self
    where
        T: Send + 'static,
        F: Fn(T) -> Fut + Clone + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send,
    {
        let rx = Arc::new(Mutex::new(rx));
        let mut set = JoinSet::new();
        for _ in 0..workers.max(1) {
            let rx = Arc::clone(&rx);
            let handler = handler.clone();
            set.spawn(async move {
                loop {
                    let item = rx.lock().await.recv().await;
                    match item {
                        Some(item) => handler(item).await,
                        None => break,
                    }
                }
            });
        }
        Self { set }
    }

    /// Waits for every worker to finish draining.
    pub async fn join(mut self) {
        while self.set.join_next().await.is_some() {}
    }
}
