use std::collections::HashSet;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::Semaphore;

/// Semaphore-bounded task queue that runs at most one task per key.
#[derive(Debug, Clone)]
pub struct InProcessQueue {
    semaphore: Arc<Semaphore>,
    active: Arc<Mutex<HashSet<String>>>,
}

impl InProcessQueue {
    pub fn new(max_concurrency: usize) -> Self {
        let permits = max_concurrency.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(permits)),
            active: Arc::default(),
        }
    }

    /// Queues `fut` unless a task for `key` is already queued or running.
    /// Returns whether the task was accepted.
    pub fn spawn<F>(&self, key: &str, fut: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if !lock(&self.active).insert(key.to_owned()) {
            tracing::debug!(key, "task already queued; skipping");
            return false;
        }

        let guard = ActiveKey {
            active: Arc::clone(&self.active),
            key: key.to_owned(),
        };
        let semaphore = Arc::clone(&self.semaphore);
        tokio::spawn(async move {
            match semaphore.acquire_owned().await {
                Ok(_permit) => fut.await,
                Err(_) => tracing::error!(key = %guard.key, "in-process queue is closed"),
            }
            drop(guard);
        });
        true
    }
}

struct ActiveKey {
    active: Arc<Mutex<HashSet<String>>>,
    key: String,
}

impl Drop for ActiveKey {
    fn drop(&mut self) {
        lock(&self.active).remove(&self.key);
    }
}

fn lock(active: &Mutex<HashSet<String>>) -> MutexGuard<'_, HashSet<String>> {
    active.lock().unwrap_or_else(PoisonError::into_inner)
}
