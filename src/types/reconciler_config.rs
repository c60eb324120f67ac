// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Reconciler configuration as loaded from YAML.

use crate::error::{ControllerError, Result};
use crate::types::resource::{field_string, ResourceType};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Business logic runtime of a reconciler
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeKind {
    Template,
    Script,
}

/// Label and field equality selector applied to "for" objects
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceSelector {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub match_labels: BTreeMap<String, String>,
    /// Dotted field path to expected value
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub match_fields: BTreeMap<String, String>,
}

impl ResourceSelector {
    pub fn is_empty(&self) -> bool {
        self.match_labels.is_empty() && self.match_fields.is_empty()
    }

    /// Match against the JSON form of an object
    pub fn matches(&self, obj: &Value) -> bool {
        let labels_match = self.match_labels.iter().all(|(k, v)| {
            obj.pointer("/metadata/labels")
                .and_then(|labels| labels.get(k))
                .and_then(Value::as_str)
                == Some(v.as_str())
        });
        labels_match
            && self
                .match_fields
                .iter()
                .all(|(path, expected)| field_string(obj, path).as_deref() == Some(expected))
    }
}

/// Correlates a watched object with "for" objects through data fields
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchSelector {
    /// "for" object field path to watched object field path
    #[serde(default, rename = "match")]
    pub match_expressions: BTreeMap<String, String>,
}

impl WatchSelector {
    /// Field equality filter for the "for" type, evaluated against a watched object.
    /// `None` when the watched object lacks a referenced field.
    pub fn field_filter(&self, watched: &Value) -> Option<BTreeMap<String, String>> {
        self.match_expressions
            .iter()
            .map(|(for_path, watched_path)| {
                field_string(watched, watched_path).map(|value| (for_path.clone(), value))
            })
            .collect()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForResource {
    #[serde(flatten)]
    pub resource: ResourceType,
    #[serde(default, skip_serializing_if = "ResourceSelector::is_empty")]
    pub selector: ResourceSelector,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WatchResource {
    #[serde(flatten)]
    pub resource: ResourceType,
    #[serde(default)]
    pub selector: WatchSelector,
}

/// Everything needed to build and run one reconciler
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcilerConfig {
    pub name: String,
    #[serde(rename = "for")]
    pub for_resource: ForResource,
    #[serde(default)]
    pub owns: Vec<ResourceType>,
    #[serde(default)]
    pub watches: Vec<WatchResource>,
    pub runtime: RuntimeKind,
    /// Template or module name to source
    #[serde(default)]
    pub code: BTreeMap<String, String>,
    /// Template name, or script module holding the reconcile function
    pub entrypoint: String,
}

impl ReconcilerConfig {
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)
            .map_err(|e| ControllerError::InvalidConfig(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(ControllerError::InvalidConfig(
                "reconciler name must not be empty".to_string(),
            ));
        }
        if self.for_resource.resource.api_version.is_empty() || self.for_resource.resource.kind.is_empty() {
            return Err(ControllerError::InvalidConfig(format!(
                "reconciler {} has no for apiVersion/kind",
                self.name
            )));
        }
        if !self.code.contains_key(&self.entrypoint) {
            return Err(ControllerError::InvalidConfig(format!(
                "reconciler {} entrypoint {} not found in code",
                self.name, self.entrypoint
            )));
        }
        Ok(())
    }

    pub fn for_type(&self) -> &ResourceType {
        &self.for_resource.resource
    }

}
