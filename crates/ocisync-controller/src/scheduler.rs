//! Bounded-concurrency batch scheduler.
//!
//! Items are placed on a queue drained by a fixed group of workers. Each
//! worker takes a ticket from the admission gate before processing an item
//! and reports the outcome on a completion channel; the orchestrator drains
//! exactly one completion per item. Tickets are RAII guards, so they are
//! released on every exit path including a panic inside `process`.

use std::collections::VecDeque;
use std::fmt::Display;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::error::{ControllerError, Result};

/// Configuration for the scheduler.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Maximum number of items processed at once.
    pub max_concurrent: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self { max_concurrent: 10 }
    }
}

impl SchedulerConfig {
    /// Creates a configuration builder.
    #[must_use]
    pub fn builder() -> SchedulerConfigBuilder {
        SchedulerConfigBuilder::default()
    }
}

/// Builder for `SchedulerConfig`.
#[derive(Debug, Default)]
pub struct SchedulerConfigBuilder {
    max_concurrent: Option<usize>,
}

impl SchedulerConfigBuilder {
    /// Sets the maximum concurrency. Values below 1 are raised to 1.
    #[must_use]
    pub const fn max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent = Some(max);
        self
    }

    /// Builds the configuration.
    #[must_use]
    pub fn build(self) -> SchedulerConfig {
        let defaults = SchedulerConfig::default();
        SchedulerConfig {
            max_concurrent: self.max_concurrent.unwrap_or(defaults.max_concurrent).max(1),
        }
    }
}

/// Admission gate holding a fixed number of tickets.
///
/// Tracks how many tickets are out and the highest number ever out at once.
#[derive(Debug)]
pub struct Admission {
    semaphore: Arc<Semaphore>,
    limit: usize,
    active: AtomicUsize,
    peak: AtomicUsize,
}

impl Admission {
    /// Creates a gate with `limit` tickets, capped at the semaphore maximum.
    #[must_use]
    pub fn new(limit: usize) -> Self {
        let limit = limit.min(Semaphore::MAX_PERMITS);
        Self {
            semaphore: Arc::new(Semaphore::new(limit)),
            limit,
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    /// Waits for a ticket, or fails with [`ControllerError::Cancelled`].
    ///
    /// # Errors
    ///
    /// Returns `Cancelled` if the token fires first or the gate is closed.
    pub async fn acquire(self: &Arc<Self>, cancel: &CancellationToken) -> Result<Ticket> {
        let permit = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(ControllerError::Cancelled),
            permit = Arc::clone(&self.semaphore).acquire_owned() => {
                permit.map_err(|_| ControllerError::Cancelled)?
            }
        };

        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        Ok(Ticket {
            _permit: permit,
            gate: Arc::clone(self),
        })
    }

    /// Number of tickets the gate holds.
    #[must_use]
    pub const fn limit(&self) -> usize {
        self.limit
    }

    /// Tickets currently out.
    #[must_use]
    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Highest number of tickets out at once since creation.
    #[must_use]
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

/// A held admission ticket. Dropping it returns the ticket to the gate.
#[derive(Debug)]
pub struct Ticket {
    _permit: OwnedSemaphorePermit,
    gate: Arc<Admission>,
}

impl Drop for Ticket {
    fn drop(&mut self) {
        self.gate.active.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Fixed-size worker pool over independent items.
#[derive(Debug, Clone)]
pub struct Scheduler {
    config: SchedulerConfig,
    gate: Arc<Admission>,
}

impl Scheduler {
    /// Creates a new scheduler.
    #[must_use]
    pub fn new(config: SchedulerConfig) -> Self {
        let gate = Arc::new(Admission::new(config.max_concurrent));
        Self { config, gate }
    }

    /// Returns the scheduler configuration.
    #[must_use]
    pub const fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Returns the admission gate, for instrumentation.
    #[must_use]
    pub fn admission(&self) -> &Admission {
        &self.gate
    }

    /// Processes every item, at most `max_concurrent` at a time.
    ///
    /// Returns one error per failed item, each wrapped with the item's
    /// identifier. A failure never stops other items from being attempted.
    /// After cancellation, items not yet started fail with `Cancelled`.
    pub async fn run<T, F, Fut>(
        &self,
        items: Vec<T>,
        cancel: &CancellationToken,
        process: F,
    ) -> Vec<ControllerError>
    where
        T: Display + Send + 'static,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let total = items.len();
        if total == 0 {
            return Vec::new();
        }

        let queue = Arc::new(Mutex::new(items.into_iter().collect::<VecDeque<_>>()));
        let process = Arc::new(process);
        let (tx, mut rx) = mpsc::channel::<(String, Result<()>)>(total);

        let workers = self.config.max_concurrent.min(total);
        tracing::debug!(items = total, workers, "Starting batch");

        for _ in 0..workers {
            let queue = Arc::clone(&queue);
            let process = Arc::clone(&process);
            let gate = Arc::clone(&self.gate);
            let cancel = cancel.clone();
            let tx = tx.clone();

            tokio::spawn(async move {
                loop {
                    let Some(item) = queue.lock().pop_front() else {
                        break;
                    };
                    let id = item.to_string();
                    let outcome = run_one(&gate, &cancel, process.as_ref(), item).await;
                    if tx.send((id, outcome)).await.is_err() {
                        break;
                    }
                }
            });
        }
        drop(tx);

        let mut errors = Vec::new();
        let mut received = 0usize;
        while received < total {
            let Some((id, outcome)) = rx.recv().await else {
                break;
            };
            received += 1;
            if let Err(e) = outcome {
                errors.push(e.in_repository(id));
            }
        }

        if received < total {
            errors.push(ControllerError::WorkerPanicked {
                message: format!("{} item(s) produced no result", total - received),
            });
        }

        tracing::debug!(
            items = total,
            failed = errors.len(),
            peak = self.gate.peak(),
            "Batch finished"
        );
        errors
    }
}

async fn run_one<T, F, Fut>(
    gate: &Arc<Admission>,
    cancel: &CancellationToken,
    process: &F,
    item: T,
) -> Result<()>
where
    F: Fn(T) -> Fut,
    Fut: Future<Output = Result<()>>,
{
    let _ticket = gate.acquire(cancel).await?;

    // Calling `process` inside the guard catches panics raised before the first poll.
    let work = AssertUnwindSafe(async move { process(item).await }).catch_unwind();
    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(ControllerError::Cancelled),
        outcome = work => outcome.unwrap_or_else(|payload| {
            Err(ControllerError::WorkerPanicked {
                message: panic_message(payload.as_ref()),
            })
        }),
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(ToString::to_string)
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string())
}
