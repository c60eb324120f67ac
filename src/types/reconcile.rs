// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Reconcile requests, results and the outcomes reported about them.

use crate::types::resource::ResourceType;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

/// Work queue key of one "for" object
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ReconcileRequest {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

impl ReconcileRequest {
    pub fn new(name: impl Into<String>, namespace: Option<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.filter(|ns| !ns.is_empty()),
        }
    }
}

impl fmt::Display for ReconcileRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}", ns, self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

/// What the reconcile loop should do with the key after an attempt
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReconcileResult {
    pub requeue: bool,
    pub requeue_after: Duration,
    pub message: Option<String>,
}

impl ReconcileResult {
    pub fn requeue(message: impl Into<String>) -> Self {
        Self {
            requeue: true,
            message: Some(message.into()),
            ..Default::default()
        }
    }

    pub fn requeue_after(delay: Duration) -> Self {
        Self {
            requeue_after: delay,
            ..Default::default()
        }
    }
}

/// Lifecycle transition of one reconcile attempt
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Operation {
    Start,
    Stop,
    Error,
    Requeue,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Operation::Start => "start",
            Operation::Stop => "stop",
            Operation::Error => "error",
            Operation::Requeue => "requeue",
        };
        f.write_str(s)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileOutcome {
    pub operation: Operation,
    pub reconciler: String,
    pub resource: ResourceType,
    pub request: ReconcileRequest,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ReconcileOutcome {
    pub fn new(
        operation: Operation,
        reconciler: &str,
        resource: &ResourceType,
        request: &ReconcileRequest,
        message: Option<String>,
    ) -> Self {
        Self {
            operation,
            reconciler: reconciler.to_string(),
            resource: resource.clone(),
            request: request.clone(),
            timestamp: Utc::now(),
            message,
        }
    }
}

/// First error that aborted a run-once batch
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunFailure {
    pub reconciler: String,
    pub key: String,
    pub message: String,
}

/// Terminal report of a run-once batch
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub success: bool,
    pub elapsed_seconds: f64,
    pub operations: BTreeMap<String, BTreeMap<Operation, usize>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<RunFailure>,
}
