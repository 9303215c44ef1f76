//! Background runtime for incremental updates.
//!
//! Ingestion events arrive faster than a pipeline run finishes. This module
//! provides a small, bounded, thread-based runtime: changesets queue on a
//! bounded channel and a fixed pool of workers runs
//! [`Consolidator::incremental_update`] for each. Overlapping changesets
//! serialize on the consolidator's shared node lock table; disjoint ones run
//! side by side.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use tracing::debug;

use crate::config::RuntimeConfig;
use crate::consolidator::{Changeset, ConsolidationReport, Consolidator};
use crate::error::{ConfigError, ConsolidationError, ConsolidationResult, RuntimeError};

enum Job {
    Update {
        changeset: Changeset,
        batch_size: usize,
        reply: Sender<ConsolidationResult<ConsolidationReport>>,
    },

    #[cfg(test)]
    Sleep {
        duration: Duration,
        reply: Sender<()>,
    },
}

/// Handle to one queued changeset.
#[derive(Debug)]
pub struct UpdateHandle {
    rx: Receiver<ConsolidationResult<ConsolidationReport>>,
}

impl UpdateHandle {
    /// Waits for the report.
    pub fn join(self) -> ConsolidationResult<ConsolidationReport> {
        self.rx
            .recv()
            .map_err(|_| ConsolidationError::from(RuntimeError::Disconnected))?
    }

    /// Waits for the report, at most `timeout`.
    pub fn join_timeout(self, timeout: Duration) -> ConsolidationResult<ConsolidationReport> {
        self.rx.recv_timeout(timeout).map_err(|err| match err {
            RecvTimeoutError::Timeout => ConsolidationError::from(RuntimeError::Timeout {
                duration_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            }),
            RecvTimeoutError::Disconnected => RuntimeError::Disconnected.into(),
        })?
    }
}

/// Worker pool running incremental updates.
pub struct ConsolidationRuntime {
    consolidator: Arc<Consolidator>,
    tx: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
    queue_capacity: usize,
    batch_size: usize,
}

impl std::fmt::Debug for ConsolidationRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsolidationRuntime")
            .field("workers", &self.workers.len())
            .field("queue_capacity", &self.queue_capacity)
            .field("batch_size", &self.batch_size)
            .finish_non_exhaustive()
    }
}

impl ConsolidationRuntime {
    /// Starts `config.workers` threads over `consolidator`.
    ///
    /// Every update reads the graph in pages of `batch_size`.
    pub fn start(
        consolidator: Arc<Consolidator>,
        config: &RuntimeConfig,
        batch_size: usize,
    ) -> ConsolidationResult<Self> {
        config.validate()?;
        if batch_size == 0 {
            return Err(ConfigError::NonPositive { name: "batch_size" }.into());
        }
        let (tx, rx) = bounded::<Job>(config.queue_capacity);

        let mut workers = Vec::with_capacity(config.workers);
        for idx in 0..config.workers {
            let rx: Receiver<Job> = rx.clone();
            let consolidator = Arc::clone(&consolidator);
            let handle = thread::Builder::new()
                .name(format!("kgconsolidate-{idx}"))
                .spawn(move || worker_loop(&consolidator, &rx))
                .map_err(|err| ConsolidationError::internal(format!("failed to spawn worker: {err}")))?;
            workers.push(handle);
        }
        debug!(workers = workers.len(), queue_capacity = config.queue_capacity, "runtime started");

        Ok(Self {
            consolidator,
            tx: Some(tx),
            workers,
            queue_capacity: config.queue_capacity,
            batch_size,
        })
    }

    /// The consolidator the workers share.
    #[must_use]
    pub fn consolidator(&self) -> &Consolidator {
        &self.consolidator
    }

    fn sender(&self) -> ConsolidationResult<&Sender<Job>> {
        self.tx
            .as_ref()
            .ok_or_else(|| RuntimeError::Disconnected.into())
    }

    fn job(&self, changeset: Changeset) -> (Job, UpdateHandle) {
        let (reply, rx) = bounded(1);
        let job = Job::Update {
            changeset,
            batch_size: self.batch_size,
            reply,
        };
        (job, UpdateHandle { rx })
    }

    /// Queues `changeset`, blocking while the queue is full.
    pub fn submit(&self, changeset: Changeset) -> ConsolidationResult<UpdateHandle> {
        let (job, handle) = self.job(changeset);
        self.sender()?
            .send(job)
            .map_err(|_| ConsolidationError::from(RuntimeError::Disconnected))?;
        Ok(handle)
    }

    /// Queues `changeset`, failing with [`RuntimeError::QueueFull`] instead of
    /// blocking.
    pub fn try_submit(&self, changeset: Changeset) -> ConsolidationResult<UpdateHandle> {
        let (job, handle) = self.job(changeset);
        self.try_send(job)?;
        Ok(handle)
    }

    fn try_send(&self, job: Job) -> ConsolidationResult<()> {
        match self.sender()?.try_send(job) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(RuntimeError::QueueFull {
                capacity: self.queue_capacity,
            }
            .into()),
            Err(TrySendError::Disconnected(_)) => Err(RuntimeError::Disconnected.into()),
        }
    }

    #[cfg(test)]
    fn submit_sleep(&self, duration: Duration) -> ConsolidationResult<Receiver<()>> {
        let (reply, rx) = bounded::<()>(1);
        self.try_send(Job::Sleep { duration, reply })?;
        Ok(rx)
    }

    /// Stops accepting work, drains the queue and joins the workers.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        // Closing the channel lets workers drain queued jobs, then exit.
        self.tx = None;
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for ConsolidationRuntime {
    fn drop(&mut self) {
        self.stop();
    }
}

fn worker_loop(consolidator: &Consolidator, rx: &Receiver<Job>) {
    while let Ok(job) = rx.recv() {
        match job {
            Job::Update {
                changeset,
                batch_size,
                reply,
            } => {
                let result = consolidator.incremental_update(&changeset, batch_size);
                let _ = reply.send(result);
            }

            #[cfg(test)]
            Job::Sleep { duration, reply } => {
                thread::sleep(duration);
                let _ = reply.send(());
            }
        }
    }
}
