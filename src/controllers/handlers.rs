// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Event handlers translating watch events into reconcile requests.

use crate::client::{EventType, ResourceClient, WatchEvent};
use crate::controllers::context::RunContext;
use crate::controllers::workqueue::WorkQueue;
use crate::error::Result;
use crate::types::resource::field_string;
use crate::types::{ForResource, ReconcileRequest, ResourceType, WatchSelector};
use async_trait::async_trait;
use kube::ResourceExt;
use std::sync::Arc;
use tracing::{debug, instrument};

pub type RequestQueue = Arc<WorkQueue<ReconcileRequest>>;

#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Reconciler this handler feeds, for logging
    fn reconciler(&self) -> &str;

    async fn handle(&self, ctx: &RunContext, event: &WatchEvent) -> Result<()>;
}

fn is_object_event(event: &WatchEvent) -> bool {
    event.event_type != EventType::Error
}

/// Enqueues the event object itself when it passes the "for" selector
pub struct ForHandler {
    reconciler: String,
    for_resource: ForResource,
    queue: RequestQueue,
}

impl ForHandler {
    pub fn new(reconciler: &str, for_resource: ForResource, queue: RequestQueue) -> Self {
        Self {
            reconciler: reconciler.to_string(),
            for_resource,
            queue,
        }
    }
}

#[async_trait]
impl EventHandler for ForHandler {
    fn reconciler(&self) -> &str {
        &self.reconciler
    }

    async fn handle(&self, _ctx: &RunContext, event: &WatchEvent) -> Result<()> {
        if !is_object_event(event) {
            return Ok(());
        }
        let obj = &event.object;
        if !self.for_resource.selector.is_empty() {
            let value = serde_json::to_value(obj)?;
            if !self.for_resource.selector.matches(&value) {
                debug!("{} {} does not match selector, skipping", self.for_resource.resource, obj.name_any());
                return Ok(());
            }
        }
        self.queue.add(ReconcileRequest::new(obj.name_any(), obj.namespace()));
        Ok(())
    }
}

/// Enqueues the owner when the event object is owned by a "for" object
pub struct OwnHandler {
    reconciler: String,
    for_type: ResourceType,
    queue: RequestQueue,
}

impl OwnHandler {
    pub fn new(reconciler: &str, for_type: ResourceType, queue: RequestQueue) -> Self {
        Self {
            reconciler: reconciler.to_string(),
            for_type,
            queue,
        }
    }
}

#[async_trait]
impl EventHandler for OwnHandler {
    fn reconciler(&self) -> &str {
        &self.reconciler
    }

    async fn handle(&self, _ctx: &RunContext, event: &WatchEvent) -> Result<()> {
        if !is_object_event(event) {
            return Ok(());
        }
        let obj = &event.object;
        let Some(owner) = obj
            .owner_references()
            .iter()
            .find(|o| self.for_type.matches_owner(o))
        else {
            return Ok(());
        };
        self.queue
            .add(ReconcileRequest::new(owner.name.clone(), obj.namespace()));
        Ok(())
    }
}

/// Enqueues every "for" object correlated with the event object through data fields
pub struct WatchHandler {
    reconciler: String,
    for_resource: ForResource,
    selector: WatchSelector,
    client: Arc<dyn ResourceClient>,
    queue: RequestQueue,
}

impl WatchHandler {
    pub fn new(
        reconciler: &str,
        for_resource: ForResource,
        selector: WatchSelector,
        client: Arc<dyn ResourceClient>,
        queue: RequestQueue,
    ) -> Self {
        Self {
            reconciler: reconciler.to_string(),
            for_resource,
            selector,
            client,
            queue,
        }
    }
}

#[async_trait]
impl EventHandler for WatchHandler {
    fn reconciler(&self) -> &str {
        &self.reconciler
    }

    #[instrument(skip_all, fields(reconciler = %self.reconciler, watched = %event.object.name_any()))]
    async fn handle(&self, ctx: &RunContext, event: &WatchEvent) -> Result<()> {
        if !is_object_event(event) {
            return Ok(());
        }
        let watched = serde_json::to_value(&event.object)?;
        let Some(filter) = self.selector.field_filter(&watched) else {
            debug!("Watched object lacks a correlated field, skipping");
            return Ok(());
        };

        let candidates = self
            .client
            .list(ctx.branch(), &self.for_resource.resource, &filter)
            .await?;

        for candidate in candidates {
            let value = serde_json::to_value(&candidate)?;
            let correlated = filter
                .iter()
                .all(|(path, expected)| field_string(&value, path).as_deref() == Some(expected));
            if correlated && self.for_resource.selector.matches(&value) {
                self.queue
                    .add(ReconcileRequest::new(candidate.name_any(), candidate.namespace()));
            }
        }
        Ok(())
    }
}
