//! Job dispatcher for enrichment runs.
//!
//! A single actor task owns the per-comment bookkeeping, so no lock is held
//! across the network call or store I/O. Each comment has at most one run in
//! flight. Requests arriving while a run is in flight collapse into one
//! follow-up run started after it, which is enough because every run reads the
//! comment's latest content and fully replaces its tones.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot, Mutex, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use crate::error::{AbortReason, Result, ToneError};
use crate::job::JobOutcome;
use crate::metrics::MetricsCollector;
use crate::models::CommentId;

/// Executes one enrichment run for a comment
#[async_trait]
pub trait JobRunner: Send + Sync {
    /// `attempt` is 0 for a fresh run and counts up across retries
    async fn run(&self, comment_id: CommentId, attempt: u32) -> JobOutcome;

    /// Called when a run ended without producing an outcome, such as a panic.
    /// The comment must not be left `pending` forever.
    async fn abandon(&self, _comment_id: CommentId, _reason: AbortReason) {}
}

enum Command {
    Enqueue(CommentId),
    WaitIdle(oneshot::Sender<()>),
    Shutdown,
}

/// Handle used by the CRUD layer to schedule enrichment.
///
/// Cheap to clone; all clones feed the same actor.
#[derive(Clone)]
pub struct JobDispatcher {
    tx: mpsc::UnboundedSender<Command>,
    /// Held across the closed check and the send so no accepted request can
    /// land behind `Shutdown` in the channel
    closed: Arc<StdMutex<bool>>,
    actor: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl JobDispatcher {
    /// Start the dispatcher on the current tokio runtime with `workers`
    /// concurrent runs at most
    pub fn new(runner: Arc<dyn JobRunner>, workers: usize) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let actor = DispatchActor {
            runner,
            permits: Arc::new(Semaphore::new(workers.max(1))),
            lanes: HashMap::new(),
            tasks: JoinSet::new(),
            idle_waiters: Vec::new(),
            metrics: MetricsCollector::default(),
        };
        let handle = tokio::spawn(actor.run(rx));

        info!(workers = workers.max(1), "Job dispatcher started");

        Self {
            tx,
            closed: Arc::new(StdMutex::new(false)),
            actor: Arc::new(Mutex::new(Some(handle))),
        }
    }

    /// Schedule enrichment of `comment_id` and return immediately
    pub fn enqueue(&self, comment_id: CommentId) -> Result<()> {
        let closed = self.closed.lock().unwrap_or_else(PoisonError::into_inner);
        if *closed {
            return Err(ToneError::DispatcherClosed);
        }
        self.tx
            .send(Command::Enqueue(comment_id))
            .map_err(|_| ToneError::DispatcherClosed)
    }

    /// Resolve once no run is in flight, queued or waiting for a retry
    pub async fn wait_idle(&self) {
        let (tx, rx) = oneshot::channel();
        if self.tx.send(Command::WaitIdle(tx)).is_ok() {
            // A dropped sender means the actor is gone, which is idle too
            let _ = rx.await;
        }
    }

    /// Stop accepting work and wait until every accepted request has finished
    pub async fn shutdown(&self) {
        {
            let mut closed = self.closed.lock().unwrap_or_else(PoisonError::into_inner);
            if !*closed {
                *closed = true;
                let _ = self.tx.send(Command::Shutdown);
            }
        }

        let handle = self.actor.lock().await.take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(error = %e, "Job dispatcher task failed");
            }
            info!("Job dispatcher stopped");
        }
    }
}

/// Per-comment state while a run is in flight or scheduled
#[derive(Debug, Default)]
struct Lane {
    /// Another request arrived during the current run
    rerun: bool,
}

struct Finished {
    comment_id: CommentId,
    attempt: u32,
    outcome: JobOutcome,
}

struct DispatchActor {
    runner: Arc<dyn JobRunner>,
    permits: Arc<Semaphore>,
    lanes: HashMap<CommentId, Lane>,
    tasks: JoinSet<Finished>,
    idle_waiters: Vec<oneshot::Sender<()>>,
    metrics: MetricsCollector,
}

impl DispatchActor {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command>) {
        let mut accepting = true;

        loop {
            tokio::select! {
                command = rx.recv(), if accepting => match command {
                    Some(Command::Enqueue(comment_id)) => self.enqueue(comment_id),
                    Some(Command::WaitIdle(waiter)) => self.add_idle_waiter(waiter),
                    Some(Command::Shutdown) | None => {
                        debug!(in_flight = self.lanes.len(), "Job dispatcher draining");
                        accepting = false;
                    }
                },
                Some(joined) = self.tasks.join_next(), if !self.tasks.is_empty() => match joined {
                    Ok(finished) => self.finish(finished),
                    Err(e) => error!(error = %e, "Enrichment task was lost"),
                },
                else => break,
            }

            if !accepting && self.tasks.is_empty() {
                break;
            }
        }

        self.notify_idle();
    }

    fn enqueue(&mut self, comment_id: CommentId) {
        if let Some(lane) = self.lanes.get_mut(&comment_id) {
            debug!(comment_id, "Enrichment already in flight, queueing a follow-up run");
            lane.rerun = true;
            return;
        }

        self.lanes.insert(comment_id, Lane::default());
        self.spawn(comment_id, 0, Duration::ZERO);
    }

    fn spawn(&mut self, comment_id: CommentId, attempt: u32, delay: Duration) {
        let runner = Arc::clone(&self.runner);
        let permits = Arc::clone(&self.permits);
        let metrics = self.metrics;

        self.tasks.spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            // Retries wait without holding a worker slot
            let _permit = permits.acquire_owned().await.ok();

            let started = Instant::now();
            let worker = Arc::clone(&runner);
            let job = tokio::spawn(async move { worker.run(comment_id, attempt).await });
            let outcome = match job.await {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!(comment_id, attempt, error = %e, "Enrichment job panicked");
                    let reason = AbortReason::WorkerPanic(e.to_string());
                    metrics.record_job(reason.kind(), started.elapsed());
                    runner.abandon(comment_id, reason.clone()).await;
                    JobOutcome::Aborted(reason)
                }
            };

            Finished {
                comment_id,
                attempt,
                outcome,
            }
        });
    }

    fn finish(&mut self, finished: Finished) {
        let Finished {
            comment_id,
            attempt,
            outcome,
        } = finished;

        let rerun = self
            .lanes
            .get_mut(&comment_id)
            .is_some_and(|lane| std::mem::take(&mut lane.rerun));

        match outcome {
            JobOutcome::Retry { after, .. } => {
                // A newer request restarts the attempt count but still honors the backoff
                let next_attempt = if rerun { 0 } else { attempt + 1 };
                debug!(comment_id, next_attempt, "Scheduling enrichment retry");
                self.spawn(comment_id, next_attempt, after);
            }
            _ if rerun => {
                debug!(comment_id, "Starting queued follow-up run");
                self.spawn(comment_id, 0, Duration::ZERO);
            }
            _ => {
                self.lanes.remove(&comment_id);
            }
        }

        if self.lanes.is_empty() {
            self.notify_idle();
        }
    }

    fn add_idle_waiter(&mut self, waiter: oneshot::Sender<()>) {
        if self.lanes.is_empty() {
            let _ = waiter.send(());
        } else {
            self.idle_waiters.push(waiter);
        }
    }

    fn notify_idle(&mut self) {
        for waiter in self.idle_waiters.drain(..) {
            let _ = waiter.send(());
        }
    }
}

impl Drop for DispatchActor {
    fn drop(&mut self) {
        if !self.lanes.is_empty() {
            warn!(
                pending = self.lanes.len(),
                "Job dispatcher stopped with enrichment still pending"
            );
        }
    }
}
