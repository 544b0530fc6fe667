//! Per-collection coalescing of reorder jobs.
//!
//! Rapid submissions for the same key collapse into the last one once the key
//! has been quiet for the configured period. Ready jobs run one at a time on a
//! single worker, so writes for one collection never interleave.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

struct Pending<J> {
    generation: u64,
    job: J,
}

enum Command<J> {
    Run { key: String, job: J },
    Barrier(oneshot::Sender<()>),
}

struct Shared<J> {
    pending: Mutex<PendingJobs<J>>,
    sender: mpsc::UnboundedSender<Command<J>>,
}

struct PendingJobs<J> {
    next_generation: u64,
    by_key: HashMap<String, Pending<J>>,
}

impl<J> Shared<J> {
    fn lock(&self) -> std::sync::MutexGuard<'_, PendingJobs<J>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Dispatch the job for `key` if it is still the latest submission.
    fn fire(&self, key: &str, generation: u64) {
        let mut pending = self.lock();
        if pending.by_key.get(key).map(|entry| entry.generation) != Some(generation) {
            return;
        }
        if let Some(entry) = pending.by_key.remove(key) {
            self.dispatch(key.to_string(), entry.job);
        }
    }

    fn dispatch(&self, key: String, job: J) {
        if self.sender.send(Command::Run { key, job }).is_err() {
            warn!("reorder worker stopped; job dropped");
        }
    }
}

/// Collapses rapid submissions per key into the last one.
///
/// Must be created inside a tokio runtime.
pub struct ReorderCoalescer<J> {
    shared: Arc<Shared<J>>,
    quiet_period: Duration,
}

impl<J> Clone for ReorderCoalescer<J> {
    fn clone(&self) -> Self {
        Self { shared: Arc::clone(&self.shared), quiet_period: self.quiet_period }
    }
}

impl<J: Send + 'static> ReorderCoalescer<J> {
    /// Start the worker. `handler` runs on the blocking pool, one job at a time.
    pub fn new<F>(quiet_period: Duration, handler: F) -> Self
    where
        F: Fn(String, J) + Send + Sync + 'static,
    {
        let (sender, mut receiver) = mpsc::unbounded_channel::<Command<J>>();
        let handler = Arc::new(handler);

        tokio::spawn(async move {
            while let Some(command) = receiver.recv().await {
                match command {
                    Command::Run { key, job } => {
                        let handler = Arc::clone(&handler);
                        let task_key = key.clone();
                        if let Err(err) =
                            tokio::task::spawn_blocking(move || handler(task_key, job)).await
                        {
                            warn!(key = %key, error = %err, "reorder job panicked");
                        }
                    }
                    Command::Barrier(done) => {
                        let _ = done.send(());
                    }
                }
            }
        });

        Self {
            shared: Arc::new(Shared {
                pending: Mutex::new(PendingJobs { next_generation: 0, by_key: HashMap::new() }),
                sender,
            }),
            quiet_period,
        }
    }

    pub fn quiet_period(&self) -> Duration {
        self.quiet_period
    }

    /// Queue `job` for `key`, replacing any job still waiting for that key.
    ///
    /// Returns `true` when an earlier job was superseded.
    pub fn submit(&self, key: impl Into<String>, job: J) -> bool {
        let key = key.into();
        let (generation, superseded) = {
            let mut pending = self.shared.lock();
            pending.next_generation += 1;
            let generation = pending.next_generation;
            let superseded =
                pending.by_key.insert(key.clone(), Pending { generation, job }).is_some();
            (generation, superseded)
        };
        if superseded {
            debug!(key = %key, "pending reorder superseded");
        }

        let shared = Arc::clone(&self.shared);
        let quiet_period = self.quiet_period;
        tokio::spawn(async move {
            tokio::time::sleep(quiet_period).await;
            shared.fire(&key, generation);
        });

        superseded
    }

    /// Keys with a job still waiting for its quiet period, sorted.
    pub fn pending_keys(&self) -> Vec<String> {
        let mut keys = self.shared.lock().by_key.keys().cloned().collect::<Vec<_>>();
        keys.sort();
        keys
    }

    /// Run every waiting job now and wait until all dispatched jobs finished.
    pub async fn flush(&self) {
        let drained = {
            let mut pending = self.shared.lock();
            let mut drained = pending.by_key.drain().collect::<Vec<_>>();
            drained.sort_by(|lhs, rhs| lhs.0.cmp(&rhs.0));
            drained
        };
        for (key, entry) in drained {
            self.shared.dispatch(key, entry.job);
        }

        let (done, finished) = oneshot::channel();
        if self.shared.sender.send(Command::Barrier(done)).is_err() {
            warn!("reorder worker stopped before flush");
            return;
        }
        let _ = finished.await;
    }
}
