// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Branch scoped access to the resource store.

pub mod kubernetes;

pub use kubernetes::KubeResourceClient;

use crate::error::Result;
use crate::types::resource::field_string;
use crate::types::{ResourceKey, ResourceType};
use async_trait::async_trait;
use futures::stream::BoxStream;
use kube::api::DynamicObject;
use std::collections::BTreeMap;
use std::fmt;

/// A named, isolated view of the store
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Branch {
    pub name: String,
}

impl Branch {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl fmt::Display for Branch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Field path equality filter
pub type FieldSelector = BTreeMap<String, String>;

/// Render a selector in the `a=b,c=d` form used by the API
pub fn field_selector_string(selector: &FieldSelector) -> String {
    selector
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",")
}

/// Field labels every API server accepts in a `fieldSelector`
const SERVER_FIELDS: [&str; 2] = ["metadata.name", "metadata.namespace"];

/// Split a selector into the terms the server can evaluate and the ones left to the client
pub fn split_field_selector(selector: &FieldSelector) -> (FieldSelector, FieldSelector) {
    selector
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .partition(|(path, _)| SERVER_FIELDS.contains(&path.as_str()))
}

/// Whether every term of the selector holds for the object
pub fn matches_fields(obj: &DynamicObject, selector: &FieldSelector) -> bool {
    if selector.is_empty() {
        return true;
    }
    let Ok(value) = serde_json::to_value(obj) else {
        return false;
    };
    selector
        .iter()
        .all(|(path, expected)| field_string(&value, path).as_deref() == Some(expected))
}

#[derive(Clone, Copy, Debug, Default)]
pub struct GetOptions {
    pub show_managed_fields: bool,
}

#[derive(Clone, Debug)]
pub struct ApplyOptions {
    pub field_manager: String,
    pub force: bool,
}

impl ApplyOptions {
    pub fn new(field_manager: impl Into<String>) -> Self {
        Self {
            field_manager: field_manager.into(),
            force: true,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventType {
    Added,
    Modified,
    Deleted,
    Error,
}

#[derive(Clone, Debug)]
pub struct WatchEvent {
    pub event_type: EventType,
    pub object: DynamicObject,
}

pub type WatchStream = BoxStream<'static, Result<WatchEvent>>;

/// Narrow store interface the controller consumes
#[async_trait]
pub trait ResourceClient: Send + Sync {
    /// Fails with `ControllerError::NotFound` when the object does not exist
    async fn get(&self, branch: &Branch, key: &ResourceKey, opts: GetOptions) -> Result<DynamicObject>;

    async fn list(
        &self,
        branch: &Branch,
        resource: &ResourceType,
        selector: &FieldSelector,
    ) -> Result<Vec<DynamicObject>>;

    async fn apply(&self, branch: &Branch, obj: &DynamicObject, opts: &ApplyOptions) -> Result<DynamicObject>;

    async fn create(&self, branch: &Branch, obj: &DynamicObject) -> Result<DynamicObject>;

    async fn update(&self, branch: &Branch, obj: &DynamicObject) -> Result<DynamicObject>;

    async fn update_status(&self, branch: &Branch, obj: &DynamicObject) -> Result<DynamicObject>;

    /// Fails with `ControllerError::NotFound` when the object is already gone
    async fn delete(&self, branch: &Branch, obj: &DynamicObject) -> Result<()>;

    async fn watch(
        &self,
        branch: &Branch,
        resource: &ResourceType,
        selector: &FieldSelector,
    ) -> Result<WatchStream>;
}
