// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Resource identity and helpers over untyped store objects.

use crate::constants::NAMESPACE_KIND;
use crate::error::{ControllerError, Result};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::{ApiResource, DynamicObject, GroupVersionKind};
use kube::ResourceExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// A resource type addressed by apiVersion and kind
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceType {
    pub api_version: String,
    pub kind: String,
}

impl ResourceType {
    pub fn new(api_version: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            api_version: api_version.into(),
            kind: kind.into(),
        }
    }

    /// Read the type from an object's TypeMeta
    pub fn of(obj: &DynamicObject) -> Result<Self> {
        let types = obj.types.as_ref().ok_or_else(|| {
            ControllerError::InvalidResource(format!(
                "object {} has no apiVersion/kind",
                obj.name_any()
            ))
        })?;
        Ok(Self::new(types.api_version.clone(), types.kind.clone()))
    }

    /// API group, empty for the core group
    pub fn group(&self) -> &str {
        self.api_version
            .rsplit_once('/')
            .map(|(group, _)| group)
            .unwrap_or("")
    }

    pub fn version(&self) -> &str {
        self.api_version
            .rsplit_once('/')
            .map(|(_, version)| version)
            .unwrap_or(&self.api_version)
    }

    pub fn gvk(&self) -> GroupVersionKind {
        GroupVersionKind::gvk(self.group(), self.version(), &self.kind)
    }

    pub fn api_resource(&self) -> ApiResource {
        ApiResource::from_gvk(&self.gvk())
    }

    pub fn is_namespace(&self) -> bool {
        self.kind == NAMESPACE_KIND && self.group().is_empty()
    }

    /// Whether an owner reference points at an object of this type
    pub fn matches_owner(&self, owner: &OwnerReference) -> bool {
        owner.api_version == self.api_version && owner.kind == self.kind
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.api_version, self.kind)
    }
}

/// Full identity of one object: group/version/kind/namespace/name
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceKey {
    pub group: String,
    pub version: String,
    pub kind: String,
    /// Empty for cluster scoped objects
    pub namespace: String,
    pub name: String,
}

impl ResourceKey {
    pub fn new(resource: &ResourceType, namespace: Option<&str>, name: &str) -> Self {
        Self {
            group: resource.group().to_string(),
            version: resource.version().to_string(),
            kind: resource.kind.clone(),
            namespace: namespace.unwrap_or_default().to_string(),
            name: name.to_string(),
        }
    }

    pub fn of(obj: &DynamicObject) -> Result<Self> {
        let resource = ResourceType::of(obj)?;
        let name = obj.metadata.name.as_deref().ok_or_else(|| {
            ControllerError::InvalidResource(format!("{} object without metadata.name", resource))
        })?;
        Ok(Self::new(&resource, obj.metadata.namespace.as_deref(), name))
    }

    pub fn resource_type(&self) -> ResourceType {
        let api_version = if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        };
        ResourceType::new(api_version, self.kind.clone())
    }

    pub fn namespace(&self) -> Option<&str> {
        (!self.namespace.is_empty()).then_some(self.namespace.as_str())
    }

    pub fn is_namespace(&self) -> bool {
        self.kind == NAMESPACE_KIND && self.group.is_empty()
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}/{}",
            self.group, self.version, self.kind, self.namespace, self.name
        )
    }
}

/// Look up a dotted field path such as `metadata.labels.app` in a JSON document
pub fn field_value<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    path.trim_start_matches('.')
        .split('.')
        .filter(|segment| !segment.is_empty())
        .try_fold(value, |current, segment| match current {
            Value::Object(map) => map.get(segment),
            Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        })
}

/// Scalar field rendered as a string, as used by field selectors
pub fn field_string(value: &Value, path: &str) -> Option<String> {
    match field_value(value, path)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

pub fn has_finalizer(obj: &DynamicObject, finalizer: &str) -> bool {
    obj.finalizers().iter().any(|f| f == finalizer)
}

/// Returns true when the finalizer was not present yet
pub fn add_finalizer(obj: &mut DynamicObject, finalizer: &str) -> bool {
    if has_finalizer(obj, finalizer) {
        return false;
    }
    obj.finalizers_mut().push(finalizer.to_string());
    true
}

/// Returns true when the finalizer was present
pub fn remove_finalizer(obj: &mut DynamicObject, finalizer: &str) -> bool {
    let finalizers = obj.finalizers_mut();
    let before = finalizers.len();
    finalizers.retain(|f| f != finalizer);
    before != finalizers.len()
}

pub fn is_terminating(obj: &DynamicObject) -> bool {
    obj.metadata.deletion_timestamp.is_some()
}

pub fn is_owned_by(obj: &DynamicObject, owner_uid: &str) -> bool {
    obj.owner_references().iter().any(|o| o.uid == owner_uid)
}

/// Controller owner reference pointing at `owner`
pub fn controller_owner_ref(owner: &DynamicObject) -> Result<OwnerReference> {
    let resource = ResourceType::of(owner)?;
    let uid = owner.uid().ok_or_else(|| {
        ControllerError::InvalidResource(format!("owner {} has no uid", owner.name_any()))
    })?;
    Ok(OwnerReference {
        api_version: resource.api_version,
        kind: resource.kind,
        name: owner.name_any(),
        uid,
        controller: Some(true),
        block_owner_deletion: Some(true),
    })
}

/// Replace any controller reference to the same owner with `owner_ref`
pub fn set_owner_reference(obj: &mut DynamicObject, owner_ref: OwnerReference) {
    let refs = obj.owner_references_mut();
    refs.retain(|o| o.uid != owner_ref.uid);
    refs.push(owner_ref);
}
