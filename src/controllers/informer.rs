// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! One watch per resource type, fanned out to every registered handler.

use crate::client::{EventType, FieldSelector, ResourceClient, WatchEvent};
use crate::constants::watch::RETRY_DELAY_MS;
use crate::controllers::context::RunContext;
use crate::controllers::handlers::EventHandler;
use crate::types::ResourceType;
use futures::StreamExt;
use kube::ResourceExt;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub struct Informer {
    resource: ResourceType,
    client: Arc<dyn ResourceClient>,
    handlers: Mutex<Vec<Arc<dyn EventHandler>>>,
}

impl Informer {
    pub fn new(resource: ResourceType, client: Arc<dyn ResourceClient>) -> Arc<Self> {
        Arc::new(Self {
            resource,
            client,
            handlers: Mutex::new(Vec::new()),
        })
    }

    pub fn resource(&self) -> &ResourceType {
        &self.resource
    }

    pub fn add_handler(&self, handler: Arc<dyn EventHandler>) {
        self.handlers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(handler);
    }

    fn handlers(&self) -> Vec<Arc<dyn EventHandler>> {
        self.handlers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Watch until the run is cancelled, reopening the watch after a fixed delay whenever it ends
    pub async fn run(self: Arc<Self>, ctx: RunContext) {
        let retry_delay = Duration::from_millis(RETRY_DELAY_MS);
        while !ctx.is_cancelled() {
            match self
                .client
                .watch(ctx.branch(), &self.resource, &FieldSelector::new())
                .await
            {
                Ok(mut stream) => {
                    info!("Watching {} on branch {}", self.resource, ctx.branch());
                    loop {
                        let next = tokio::select! {
                            _ = ctx.cancelled() => return,
                            next = stream.next() => next,
                        };
                        match next {
                            Some(Ok(event)) if event.event_type == EventType::Error => {
                                warn!("Watch of {} reported an error event", self.resource);
                                break;
                            }
                            Some(Ok(event)) => self.dispatch(&ctx, event),
                            Some(Err(e)) => {
                                warn!("Watch of {} failed: {}", self.resource, e);
                                break;
                            }
                            None => {
                                debug!("Watch of {} ended", self.resource);
                                break;
                            }
                        }
                    }
                }
                Err(e) => warn!("Failed to watch {}: {}", self.resource, e),
            }

            tokio::select! {
                _ = ctx.cancelled() => return,
                _ = tokio::time::sleep(retry_delay) => {}
            }
        }
    }

    /// One task per handler, failures are logged and dropped
    fn dispatch(&self, ctx: &RunContext, event: WatchEvent) {
        let event = Arc::new(event);
        for handler in self.handlers() {
            let ctx = ctx.clone();
            let event = Arc::clone(&event);
            tokio::spawn(async move {
                if let Err(e) = handler.handle(&ctx, &event).await {
                    warn!(
                        "Handler of reconciler {} failed for {}: {}",
                        handler.reconciler(),
                        event.object.name_any(),
                        e
                    );
                }
            });
        }
    }
}

/// Informers shared across reconcilers, one per resource type
pub struct InformerFactory {
    client: Arc<dyn ResourceClient>,
    informers: Mutex<BTreeMap<ResourceType, Arc<Informer>>>,
}

impl InformerFactory {
    pub fn new(client: Arc<dyn ResourceClient>) -> Self {
        Self {
            client,
            informers: Mutex::new(BTreeMap::new()),
        }
    }

    /// Informer for a type, created on first use
    pub fn informer(&self, resource: &ResourceType) -> Arc<Informer> {
        let mut informers = self.informers.lock().unwrap_or_else(|e| e.into_inner());
        let informer = informers
            .entry(resource.clone())
            .or_insert_with(|| Informer::new(resource.clone(), Arc::clone(&self.client)));
        Arc::clone(informer)
    }

    pub fn informers(&self) -> Vec<Arc<Informer>> {
        self.informers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }

    pub fn start(&self, ctx: &RunContext) -> Vec<JoinHandle<()>> {
        self.informers()
            .into_iter()
            .map(|informer| tokio::spawn(informer.run(ctx.clone())))
            .collect()
    }
}
