// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Event dispatch, work queues and run coordination.

pub mod collector;
pub mod context;
pub mod handlers;
pub mod informer;
pub mod manager;
pub mod reconciler;
pub mod workqueue;

pub use collector::{Collector, CollectorMode};
pub use context::{CancelHandle, RunContext};
pub use manager::ControllerManager;
