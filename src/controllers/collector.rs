// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Aggregates reconcile outcomes and detects when a run-once batch is finished.
//!
//! A batch is finished once nothing is in flight and no outcome arrived for
//! [`IDLE_TICKS`] consecutive ticks. The first error ends a run-once batch
//! immediately.

use crate::constants::collector::{IDLE_TICKS, TICK_INTERVAL_MS};
use crate::controllers::context::RunContext;
use crate::types::{Operation, ReconcileOutcome, ReconcileRequest, RunFailure, RunSummary};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CollectorMode {
    RunOnce,
    Continuous,
}

pub struct Collector {
    rx: mpsc::Receiver<ReconcileOutcome>,
    mode: CollectorMode,
    subscriber: Option<mpsc::Sender<ReconcileOutcome>>,
}

struct Tally {
    started_at: Instant,
    inflight: HashMap<(String, ReconcileRequest), Instant>,
    finishing: Option<Instant>,
    idle_ticks: u32,
    operations: BTreeMap<String, BTreeMap<Operation, usize>>,
}

impl Tally {
    fn new() -> Self {
        let started_at = Instant::now();
        Self {
            started_at,
            inflight: HashMap::new(),
            // an empty batch finishes after the idle window
            finishing: Some(started_at),
            idle_ticks: 0,
            operations: BTreeMap::new(),
        }
    }

    fn record(&mut self, outcome: &ReconcileOutcome) {
        self.idle_ticks = 0;
        *self
            .operations
            .entry(outcome.reconciler.clone())
            .or_default()
            .entry(outcome.operation)
            .or_default() += 1;

        let key = (outcome.reconciler.clone(), outcome.request.clone());
        match outcome.operation {
            Operation::Start => {
                self.inflight.insert(key, Instant::now());
                self.finishing = None;
            }
            Operation::Stop | Operation::Requeue | Operation::Error => {
                if let Some(started) = self.inflight.remove(&key) {
                    debug!(
                        "{} {} {} after {:?}",
                        outcome.reconciler,
                        outcome.request,
                        outcome.operation,
                        started.elapsed()
                    );
                }
                if self.inflight.is_empty() {
                    self.finishing = Some(Instant::now());
                }
            }
        }
    }

    fn summary(&self, failure: Option<RunFailure>) -> RunSummary {
        let finished_at = self.finishing.unwrap_or_else(Instant::now);
        RunSummary {
            success: failure.is_none(),
            elapsed_seconds: finished_at.duration_since(self.started_at).as_secs_f64(),
            operations: self.operations.clone(),
            failure,
        }
    }
}

impl Collector {
    pub fn new(rx: mpsc::Receiver<ReconcileOutcome>, mode: CollectorMode) -> Self {
        Self {
            rx,
            mode,
            subscriber: None,
        }
    }

    /// Forward every outcome to `subscriber` as well
    pub fn with_subscriber(mut self, subscriber: mpsc::Sender<ReconcileOutcome>) -> Self {
        self.subscriber = Some(subscriber);
        self
    }

    /// Collect until the batch is done (run-once) or the run is cancelled.
    /// Continuous collection always returns `None`.
    pub async fn run(mut self, ctx: RunContext) -> Option<RunSummary> {
        let run_once = self.mode == CollectorMode::RunOnce;
        let mut tally = Tally::new();
        let mut ticker = tokio::time::interval(Duration::from_millis(TICK_INTERVAL_MS));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // the first tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ctx.cancelled() => {
                    debug!("Collector cancelled");
                    return None;
                }
                received = self.rx.recv() => {
                    let Some(outcome) = received else {
                        debug!("All outcome senders are gone");
                        return run_once.then(|| tally.summary(None));
                    };
                    tally.record(&outcome);
                    if run_once && outcome.operation == Operation::Error {
                        let message = outcome.message.clone().unwrap_or_default();
                        error!("Run failed on {} {}: {}", outcome.reconciler, outcome.request, message);
                        return Some(tally.summary(Some(RunFailure {
                            reconciler: outcome.reconciler.clone(),
                            key: outcome.request.to_string(),
                            message,
                        })));
                    }
                    self.forward(outcome).await;
                }
                _ = ticker.tick() => {
                    if tally.finishing.is_none() {
                        continue;
                    }
                    tally.idle_ticks += 1;
                    if run_once && tally.idle_ticks >= IDLE_TICKS {
                        let summary = tally.summary(None);
                        info!("Run finished in {:.2}s", summary.elapsed_seconds);
                        return Some(summary);
                    }
                }
            }
        }
    }

    async fn forward(&mut self, outcome: ReconcileOutcome) {
        let Some(subscriber) = &self.subscriber else {
            return;
        };
        if subscriber.send(outcome).await.is_err() {
            debug!("Outcome subscriber is gone");
            self.subscriber = None;
        }
    }
}
