// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Reconcilers turning one "for" object into its owned children.

pub mod managed_fields;
pub mod resources;
pub mod script;
pub mod template;
pub mod typed;

pub use resources::Resources;
pub use typed::{new_reconciler, Runtime, TypedReconciler};

use crate::controllers::context::RunContext;
use crate::error::Result;
use crate::types::{ReconcileRequest, ReconcileResult, ResourceType};
use async_trait::async_trait;

#[async_trait]
pub trait Reconcile: Send + Sync {
    fn name(&self) -> &str;

    fn for_type(&self) -> &ResourceType;

    async fn reconcile(&self, ctx: &RunContext, request: &ReconcileRequest) -> Result<ReconcileResult>;
}
