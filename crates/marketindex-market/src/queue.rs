//! In-process delayed job queue.
//!
//! Jobs are keyed by string id with replace-or-create semantics: enqueueing
//! an id that already has a pending job cancels the old one. This is what
//! makes lifecycle jobs single-flight per `(job kind, listing)` key.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;

struct Entry {
    generation: u64,
    handle: JoinHandle<()>,
}

/// Delayed jobs on tokio timers, keyed by id.
#[derive(Default)]
pub struct JobQueue {
    jobs: Mutex<HashMap<String, Entry>>,
    generation: AtomicU64,
}

impl JobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule `job` to run after `delay`, replacing any pending job with
    /// the same id.
    pub fn enqueue<F>(self: &Arc<Self>, id: &str, delay: Duration, job: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst);
        let key = id.to_string();
        let queue = Arc::clone(self);
        let task_key = key.clone();

        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            job.await;
            // Drop our own slot, but only if it wasn't replaced meanwhile.
            let mut jobs = queue.jobs.lock().unwrap();
            if jobs.get(&task_key).map(|e| e.generation) == Some(generation) {
                jobs.remove(&task_key);
            }
        });

        let mut jobs = self.jobs.lock().unwrap();
        if let Some(previous) = jobs.insert(key, Entry { generation, handle }) {
            previous.handle.abort();
        }
    }

    /// Cancel a pending job. Removing an unknown id is a no-op.
    pub fn remove(&self, id: &str) {
        if let Some(entry) = self.jobs.lock().unwrap().remove(id) {
            entry.handle.abort();
        }
    }

    /// Whether a job with this id is still tracked.
    pub fn pending(&self, id: &str) -> bool {
        self.jobs.lock().unwrap().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.jobs.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
