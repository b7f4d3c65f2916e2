use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::watch;
use tokio::task::AbortHandle;

use crate::errors::{AgentError, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobControl {
    Running,
    Cancelled,
}

struct JobHandle {
    id: u64,
    control: watch::Sender<JobControl>,
    abort: Option<AbortHandle>,
}

/// Background jobs keyed by package name. A second submission for a live key
/// is dropped (keep-existing).
#[derive(Clone, Default)]
pub struct JobRegistry {
    jobs: Arc<Mutex<HashMap<String, JobHandle>>>,
    next_id: Arc<AtomicU64>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawns the job unless one is already live for `key`. Returns whether it spawned.
    pub fn enqueue_unique<F, Fut>(&self, key: &str, make: F) -> Result<bool>
    where
        F: FnOnce(watch::Receiver<JobControl>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let rx = {
            let mut jobs = self
                .jobs
                .lock()
                .map_err(|_| AgentError::lock_poisoned("job registry"))?;
            if jobs.contains_key(key) {
                tracing::debug!("job for {} already live, keeping existing", key);
                return Ok(false);
            }
            let (tx, rx) = watch::channel(JobControl::Running);
            jobs.insert(
                key.to_string(),
                JobHandle {
                    id,
                    control: tx,
                    abort: None,
                },
            );
            rx
        };

        let job = make(rx);
        let registry = self.clone();
        let owned_key = key.to_string();
        let task = tokio::spawn(async move {
            job.await;
            registry.finish(&owned_key, id);
        });

        if let Ok(mut jobs) = self.jobs.lock() {
            if let Some(handle) = jobs.get_mut(key).filter(|handle| handle.id == id) {
                handle.abort = Some(task.abort_handle());
            }
        }
        Ok(true)
    }

    /// Signals and aborts the job for `key`. Returns whether one was live.
    pub fn cancel(&self, key: &str) -> bool {
        let handle = match self.jobs.lock() {
            Ok(mut jobs) => jobs.remove(key),
            Err(_) => None,
        };
        match handle {
            Some(handle) => {
                let _ = handle.control.send(JobControl::Cancelled);
                if let Some(abort) = handle.abort {
                    abort.abort();
                }
                tracing::info!("cancelled background job for {}", key);
                true
            }
            None => false,
        }
    }

    pub fn cancel_all(&self) -> Vec<String> {
        let keys = self.active_keys();
        keys.into_iter().filter(|key| self.cancel(key)).collect()
    }

    pub fn is_active(&self, key: &str) -> bool {
        self.jobs
            .lock()
            .map(|jobs| jobs.contains_key(key))
            .unwrap_or(false)
    }

    pub fn active_keys(&self) -> Vec<String> {
        self.jobs
            .lock()
            .map(|jobs| jobs.keys().cloned().collect())
            .unwrap_or_default()
    }

    fn finish(&self, key: &str, id: u64) {
        if let Ok(mut jobs) = self.jobs.lock() {
            if jobs.get(key).map(|handle| handle.id == id).unwrap_or(false) {
                jobs.remove(key);
            }
        }
    }
}
