// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Worker pool draining one reconciler's queue.

use crate::constants::collector::CHANNEL_CAPACITY;
use crate::controllers::context::RunContext;
use crate::controllers::handlers::RequestQueue;
use crate::controllers::workqueue::WorkQueue;
use crate::reconcilers::Reconcile;
use crate::types::{Operation, ReconcileOutcome, ReconcileRequest};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Handle to report reconcile outcomes to the collector
#[derive(Clone)]
pub struct OutcomeSender {
    tx: mpsc::Sender<ReconcileOutcome>,
}

impl OutcomeSender {
    pub async fn send(&self, outcome: ReconcileOutcome) {
        if self.tx.send(outcome).await.is_err() {
            debug!("Collector is gone, dropping outcome");
        }
    }
}

pub fn outcome_channel() -> (OutcomeSender, mpsc::Receiver<ReconcileOutcome>) {
    let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
    (OutcomeSender { tx }, rx)
}

/// Queue and workers of one reconciler
pub struct ReconcileLoop {
    reconciler: Arc<dyn Reconcile>,
    queue: RequestQueue,
    outcomes: OutcomeSender,
    workers: usize,
}

impl ReconcileLoop {
    pub fn new(reconciler: Arc<dyn Reconcile>, outcomes: OutcomeSender, workers: usize) -> Arc<Self> {
        Arc::new(Self {
            reconciler,
            queue: WorkQueue::new(),
            outcomes,
            workers: workers.max(1),
        })
    }

    pub fn name(&self) -> &str {
        self.reconciler.name()
    }

    pub fn queue(&self) -> RequestQueue {
        Arc::clone(&self.queue)
    }

    /// Spawn the workers. Cancelling the run shuts the queue down, which ends them.
    pub fn start(self: &Arc<Self>, ctx: &RunContext) -> Vec<JoinHandle<()>> {
        info!("Starting {} workers for reconciler {}", self.workers, self.name());
        let mut tasks: Vec<JoinHandle<()>> = (0..self.workers)
            .map(|_| {
                let this = Arc::clone(self);
                let ctx = ctx.clone();
                tokio::spawn(async move { while this.process_next(&ctx).await {} })
            })
            .collect();

        let queue = self.queue();
        let ctx = ctx.clone();
        tasks.push(tokio::spawn(async move {
            ctx.cancelled().await;
            queue.shutdown();
        }));
        tasks
    }

    async fn emit(&self, operation: Operation, request: &ReconcileRequest, message: Option<String>) {
        let outcome = ReconcileOutcome::new(
            operation,
            self.reconciler.name(),
            self.reconciler.for_type(),
            request,
            message,
        );
        self.outcomes.send(outcome).await;
    }

    /// Handle one key. Returns false once the queue is shut down.
    pub async fn process_next(&self, ctx: &RunContext) -> bool {
        let Some(request) = self.queue.get().await else {
            return false;
        };

        self.emit(Operation::Start, &request, None).await;
        let (operation, message) = match self.reconciler.reconcile(ctx, &request).await {
            Err(e) => {
                error!("Reconciler {} failed for {}: {}", self.name(), request, e);
                self.queue.forget(&request);
                (Operation::Error, Some(e.to_string()))
            }
            Ok(result) if !result.requeue_after.is_zero() => {
                debug!("Requeueing {} after {:?}", request, result.requeue_after);
                self.queue.forget(&request);
                self.queue.add_after(request.clone(), result.requeue_after);
                (Operation::Requeue, result.message)
            }
            Ok(result) if result.requeue => {
                if let Some(message) = &result.message {
                    warn!("Requeueing {}: {}", request, message);
                }
                self.queue.add_rate_limited(request.clone());
                (Operation::Requeue, result.message)
            }
            Ok(_) => {
                self.queue.forget(&request);
                (Operation::Stop, None)
            }
        };
        self.queue.done(&request);
        self.emit(operation, &request, message).await;
        true
    }
}
