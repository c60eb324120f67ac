// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! The `#{resource, error, fatal}` envelope shared by builtins and the reconcile return value.

use crate::error::{ControllerError, Result};
use crate::types::ReconcileResult;
use rhai::{Dynamic, Map};
use serde::Deserialize;
use serde_json::Value;
use std::fmt::Display;
use std::time::Duration;

pub fn ok(resource: Dynamic) -> Map {
    envelope(resource, Dynamic::UNIT, false)
}

pub fn failure(error: impl Display, fatal: bool) -> Map {
    envelope(Dynamic::UNIT, error.to_string().into(), fatal)
}

/// Store failures are transient from the script's point of view
pub fn from_store<T>(result: Result<T>, convert: impl FnOnce(T) -> Result<Dynamic>) -> Map {
    match result.and_then(convert) {
        Ok(resource) => ok(resource),
        Err(e @ ControllerError::Serialization(_)) => failure(e, true),
        Err(e) => failure(e, false),
    }
}

fn envelope(resource: Dynamic, error: Dynamic, fatal: bool) -> Map {
    let mut map = Map::new();
    map.insert("resource".into(), resource);
    map.insert("error".into(), error);
    map.insert("fatal".into(), fatal.into());
    map
}

/// Map built by `reconcile_result`
pub fn reconcile_result(requeue: bool, requeue_after_secs: i64, error: Dynamic, fatal: bool) -> Map {
    let mut result = Map::new();
    result.insert("requeue".into(), requeue.into());
    result.insert("requeue_after".into(), requeue_after_secs.max(0).into());
    let error = if error.is_unit() || error.to_string().is_empty() {
        Dynamic::UNIT
    } else {
        error
    };
    envelope(Dynamic::from_map(result), error, fatal)
}

#[derive(Debug, Default, Deserialize)]
struct Envelope {
    #[serde(default)]
    resource: Value,
    #[serde(default)]
    error: Value,
    #[serde(default)]
    fatal: bool,
}

#[derive(Debug, Default, Deserialize)]
struct Requeue {
    #[serde(default)]
    requeue: bool,
    #[serde(default)]
    requeue_after: u64,
}

/// Turn the value returned by the script's reconcile function into a result.
///
/// A fatal error is a hard error, any other error requeues with its message.
pub fn classify(returned: Dynamic) -> Result<ReconcileResult> {
    let value: Value = rhai::serde::from_dynamic(&returned)
        .map_err(|e| ControllerError::Script(format!("unreadable reconcile result: {}", e)))?;
    if !value.is_object() {
        return Err(ControllerError::Script(format!(
            "reconcile must return a map, got {}",
            returned.type_name()
        )));
    }
    let envelope: Envelope = serde_json::from_value(value)
        .map_err(|e| ControllerError::Script(format!("malformed reconcile result: {}", e)))?;

    let error = match envelope.error {
        Value::Null => None,
        Value::String(s) if s.is_empty() => None,
        Value::String(s) => Some(s),
        other => Some(other.to_string()),
    };
    if let Some(error) = error {
        if envelope.fatal {
            return Err(ControllerError::Fatal(error));
        }
        return Ok(ReconcileResult::requeue(error));
    }

    let requeue: Requeue = match envelope.resource {
        resource @ Value::Object(_) => serde_json::from_value(resource)
            .map_err(|e| ControllerError::Script(format!("malformed reconcile result: {}", e)))?,
        _ => Requeue::default(),
    };
    Ok(ReconcileResult {
        requeue: requeue.requeue,
        requeue_after: Duration::from_secs(requeue.requeue_after),
        message: None,
    })
}
