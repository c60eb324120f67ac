// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Converges the children owned by one "for" object onto the desired set.

use crate::client::{ApplyOptions, Branch, FieldSelector, ResourceClient};
use crate::error::{ControllerError, Result};
use crate::types::resource::{controller_owner_ref, is_owned_by, set_owner_reference};
use crate::types::{ResourceKey, ResourceType};
use kube::api::DynamicObject;
use kube::ResourceExt;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// Desired children of one reconcile attempt
pub struct Resources {
    client: Arc<dyn ResourceClient>,
    branch: Branch,
    owner: DynamicObject,
    owns: Vec<ResourceType>,
    field_manager: String,
    new_resources: Mutex<Vec<DynamicObject>>,
}

fn is_namespace(obj: &DynamicObject) -> bool {
    ResourceType::of(obj).is_ok_and(|t| t.is_namespace())
}

impl Resources {
    pub fn new(
        client: Arc<dyn ResourceClient>,
        branch: Branch,
        owner: DynamicObject,
        owns: Vec<ResourceType>,
        field_manager: impl Into<String>,
    ) -> Self {
        Self {
            client,
            branch,
            owner,
            owns,
            field_manager: field_manager.into(),
            new_resources: Mutex::new(Vec::new()),
        }
    }

    /// Register a desired child, replacing an earlier one with the same identity
    pub fn add_new_resource(&self, obj: DynamicObject) -> Result<()> {
        let key = ResourceKey::of(&obj)?;
        let mut new_resources = self.new_resources.lock().unwrap_or_else(|e| e.into_inner());
        new_resources.retain(|existing| ResourceKey::of(existing).map_or(true, |k| k != key));
        new_resources.push(obj);
        Ok(())
    }

    pub fn new_resources(&self) -> Vec<DynamicObject> {
        self.new_resources
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Children currently in the store carrying an owner reference to the "for" object
    async fn existing_resources(&self, owner_uid: &str) -> Result<Vec<DynamicObject>> {
        let mut existing = Vec::new();
        for resource in &self.owns {
            let objects = self
                .client
                .list(&self.branch, resource, &FieldSelector::new())
                .await?;
            existing.extend(objects.into_iter().filter(|o| is_owned_by(o, owner_uid)));
        }
        Ok(existing)
    }

    /// Delete owned children that are no longer desired and apply the desired ones.
    pub async fn apply(&self) -> Result<()> {
        let owner_uid = self.owner.uid().ok_or_else(|| {
            ControllerError::InvalidResource(format!("owner {} has no uid", self.owner.name_any()))
        })?;
        let desired = self.new_resources();
        let desired_keys = desired
            .iter()
            .map(ResourceKey::of)
            .collect::<Result<HashSet<_>>>()?;

        let stale: Vec<DynamicObject> = self
            .existing_resources(&owner_uid)
            .await?
            .into_iter()
            .filter(|obj| ResourceKey::of(obj).is_ok_and(|key| !desired_keys.contains(&key)))
            .collect();

        let mut errors = Vec::new();

        // namespaces go last so their contents are deleted explicitly first
        let (stale_namespaces, stale_others): (Vec<_>, Vec<_>) =
            stale.into_iter().partition(is_namespace);
        for obj in stale_others.iter().chain(stale_namespaces.iter()) {
            match self.client.delete(&self.branch, obj).await {
                Ok(()) => info!("Deleted stale child {}", obj.name_any()),
                Err(e) if e.is_not_found() => debug!("{} already gone", obj.name_any()),
                Err(e) => {
                    warn!("Failed to delete {}: {}", obj.name_any(), e);
                    errors.push(e);
                }
            }
        }

        let owner_ref = controller_owner_ref(&self.owner)?;
        let opts = ApplyOptions::new(self.field_manager.clone());
        let (namespaces, others): (Vec<_>, Vec<_>) = desired.into_iter().partition(is_namespace);
        for mut obj in namespaces.into_iter().chain(others) {
            set_owner_reference(&mut obj, owner_ref.clone());
            match self.client.apply(&self.branch, &obj, &opts).await {
                Ok(applied) => debug!("Applied {}", applied.name_any()),
                Err(e) => {
                    warn!("Failed to apply {}: {}", obj.name_any(), e);
                    errors.push(e);
                }
            }
        }

        ControllerError::aggregate(errors)
    }

    /// Delete every owned child
    pub async fn delete_all(&self) -> Result<()> {
        self.new_resources
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        self.apply().await
    }
}
