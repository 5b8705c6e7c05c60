//! Controller records and worker pools.
//!
//! One [`Controller`] exists per configured kind: a named workqueue plus a
//! pool of workers draining it through the kind's [`Reconciler`]. Workers
//! are stateless across reconciles; the queue alone provides ordering and
//! per-key exclusivity. Stopping a controller shuts its queue down and
//! waits for in-flight reconciles before returning.

use std::sync::Arc;
use std::time::Instant;

use tether_core::Kind;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info};

use crate::metrics::EngineMetrics;
use crate::queue::WorkQueue;
use crate::reconcile::{ReconcileOutcome, Reconciler};

/// A running controller for one kind.
pub struct Controller {
    name: String,
    kind: Kind,
    queue: Arc<WorkQueue>,
    cancel: CancellationToken,
    workers: TaskTracker,
}

impl Controller {
    /// Starts `worker_count` workers draining the queue.
    pub fn start(
        name: impl Into<String>,
        kind: Kind,
        queue: Arc<WorkQueue>,
        reconciler: Arc<Reconciler>,
        worker_count: usize,
        cancel: CancellationToken,
        metrics: Option<EngineMetrics>,
    ) -> Self {
        let name = name.into();
        let workers = TaskTracker::new();

        for worker in 0..worker_count.max(1) {
            workers.spawn(run_worker(
                name.clone(),
                worker,
                queue.clone(),
                reconciler.clone(),
                cancel.clone(),
                metrics.clone(),
            ));
        }
        workers.close();

        info!(controller = %name, kind = %kind, workers = worker_count.max(1), "controller started");
        Self {
            name,
            kind,
            queue,
            cancel,
            workers,
        }
    }

    /// The controller's unique name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The kind this controller reconciles.
    #[must_use]
    pub fn kind(&self) -> &Kind {
        &self.kind
    }

    /// The controller's workqueue.
    #[must_use]
    pub fn queue(&self) -> Arc<WorkQueue> {
        self.queue.clone()
    }

    /// Stops the controller: drains the queue, cancels the workers, and
    /// waits for in-flight reconciles to finish.
    pub async fn stop(&self) {
        debug!(controller = %self.name, "stopping controller");
        self.cancel.cancel();
        self.queue.shutdown();
        self.workers.wait().await;
        info!(controller = %self.name, "controller stopped");
    }
}

async fn run_worker(
    controller: String,
    worker: usize,
    queue: Arc<WorkQueue>,
    reconciler: Arc<Reconciler>,
    cancel: CancellationToken,
    metrics: Option<EngineMetrics>,
) {
    debug!(%controller, worker, "worker started");
    loop {
        let key = tokio::select! {
            () = cancel.cancelled() => break,
            key = queue.get() => match key {
                Some(key) => key,
                None => break,
            },
        };

        let started = Instant::now();
        let outcome = reconciler.reconcile(&key).await;
        let elapsed = started.elapsed();

        if let Some(metrics) = &metrics {
            let label = match outcome {
                ReconcileOutcome::Forget | ReconcileOutcome::RequeueAfter(_) => "success",
                ReconcileOutcome::RequeueWithBackoff => "error",
            };
            metrics.reconcile_finished(&controller, label, elapsed.as_secs_f64());
            metrics.set_queue_depth(&controller, queue.len());
        }

        match outcome {
            ReconcileOutcome::Forget => {
                queue.forget(&key);
                queue.done(&key);
            }
            ReconcileOutcome::RequeueAfter(delay) => {
                queue.forget(&key);
                queue.done(&key);
                queue.add_after(key, delay);
            }
            ReconcileOutcome::RequeueWithBackoff => {
                let delay = queue.next_backoff(&key);
                queue.done(&key);
                queue.add_after(key, delay);
            }
        }
    }
    debug!(%controller, worker, "worker stopped");
}
