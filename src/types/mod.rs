// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Data model shared by controllers and reconcilers.

pub mod reconcile;
pub mod reconciler_config;
pub mod resource;

pub use reconcile::{
    Operation, ReconcileOutcome, ReconcileRequest, ReconcileResult, RunFailure, RunSummary,
};
pub use reconciler_config::{
    ForResource, ReconcilerConfig, ResourceSelector, RuntimeKind, WatchResource, WatchSelector,
};
pub use resource::{ResourceKey, ResourceType};
