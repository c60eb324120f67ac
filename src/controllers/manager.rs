// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Wires reconcilers, informers, workers and the collector for one run.

use crate::client::{Branch, ResourceClient};
use crate::controllers::collector::{Collector, CollectorMode};
use crate::controllers::context::RunContext;
use crate::controllers::handlers::{ForHandler, OwnHandler, RequestQueue, WatchHandler};
use crate::controllers::informer::InformerFactory;
use crate::controllers::reconciler::{outcome_channel, ReconcileLoop};
use crate::error::Result;
use crate::reconcilers::script::{CodeModules, ModuleCache};
use crate::reconcilers::{new_reconciler, Reconcile, TypedReconciler};
use crate::types::{ReconcileOutcome, ReconcilerConfig, RunSummary};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info};

pub struct ControllerManager {
    client: Arc<dyn ResourceClient>,
    reconcilers: Vec<Arc<TypedReconciler>>,
    workers: usize,
    mode: CollectorMode,
    subscriber: Option<mpsc::Sender<ReconcileOutcome>>,
}

impl ControllerManager {
    /// Build every reconciler up front. Any construction failure, such as an
    /// import cycle between script modules, fails the whole run.
    pub async fn new(
        configs: Vec<ReconcilerConfig>,
        client: Arc<dyn ResourceClient>,
        workers: usize,
        mode: CollectorMode,
    ) -> Result<Self> {
        let cache = ModuleCache::new(Arc::new(CodeModules::from_configs(&configs)));
        let mut reconcilers = Vec::with_capacity(configs.len());
        for config in configs {
            let reconciler = new_reconciler(config, Arc::clone(&client), &cache).await?;
            info!(
                "Created {:?} reconciler {} for {}",
                reconciler.config().runtime,
                reconciler.name(),
                reconciler.for_type()
            );
            reconcilers.push(Arc::new(reconciler));
        }

        Ok(Self {
            client,
            reconcilers,
            workers,
            mode,
            subscriber: None,
        })
    }

    /// Also deliver every outcome to `subscriber`
    pub fn with_subscriber(mut self, subscriber: mpsc::Sender<ReconcileOutcome>) -> Self {
        self.subscriber = Some(subscriber);
        self
    }

    fn register_handlers(&self, informers: &InformerFactory, config: &ReconcilerConfig, queue: &RequestQueue) {
        informers.informer(config.for_type()).add_handler(Arc::new(ForHandler::new(
            &config.name,
            config.for_resource.clone(),
            Arc::clone(queue),
        )));
        for owned in &config.owns {
            informers.informer(owned).add_handler(Arc::new(OwnHandler::new(
                &config.name,
                config.for_type().clone(),
                Arc::clone(queue),
            )));
        }
        for watched in &config.watches {
            informers.informer(&watched.resource).add_handler(Arc::new(WatchHandler::new(
                &config.name,
                config.for_resource.clone(),
                watched.selector.clone(),
                Arc::clone(&self.client),
                Arc::clone(queue),
            )));
        }
    }

    /// Run against `branch` until the batch completes (run-once) or `shutdown` resolves.
    /// Returns the summary of a run-once batch, `None` otherwise.
    pub async fn run(self, branch: Branch, shutdown: impl Future<Output = ()>) -> Option<RunSummary> {
        let (ctx, cancel) = RunContext::new(branch);
        let (outcomes, rx) = outcome_channel();
        let informers = InformerFactory::new(Arc::clone(&self.client));

        let mut tasks = Vec::new();
        for reconciler in &self.reconcilers {
            let worker = ReconcileLoop::new(
                Arc::clone(reconciler) as Arc<dyn Reconcile>,
                outcomes.clone(),
                self.workers,
            );
            self.register_handlers(&informers, reconciler.config(), &worker.queue());
            tasks.extend(worker.start(&ctx));
        }
        drop(outcomes);
        info!(
            "Starting {} informers for {} reconcilers on branch {}",
            informers.informers().len(),
            self.reconcilers.len(),
            ctx.branch()
        );
        tasks.extend(informers.start(&ctx));

        let mut collector = Collector::new(rx, self.mode);
        if let Some(subscriber) = self.subscriber {
            collector = collector.with_subscriber(subscriber);
        }
        let summary = tokio::select! {
            summary = collector.run(ctx.clone()) => summary,
            _ = shutdown => {
                info!("Shutdown requested");
                None
            }
        };

        cancel.cancel();
        debug!("Waiting for {} tasks to stop", tasks.len());
        futures::future::join_all(tasks).await;
        summary
    }
}
