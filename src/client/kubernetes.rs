// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Store client over a Kubernetes compatible API, one kubeconfig context per branch

use crate::client::{
    field_selector_string, matches_fields, split_field_selector, ApplyOptions, Branch, EventType,
    FieldSelector, GetOptions, ResourceClient, WatchEvent, WatchStream,
};
use crate::error::{ControllerError, Result};
use crate::types::{ResourceKey, ResourceType};
use async_trait::async_trait;
use futures::StreamExt;
use kube::api::{
    Api, DeleteParams, DynamicObject, ListParams, Patch, PatchParams, PostParams, TypeMeta,
};
use kube::config::KubeConfigOptions;
use kube::runtime::watcher::{self, watcher};
use kube::{Client, Config as KConfig, ResourceExt};
use serde_json::json;
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::{debug, info, instrument};

pub struct KubeResourceClient {
    /// Branch name to client, filled lazily from kubeconfig contexts
    clients: RwLock<HashMap<String, Client>>,
    /// When set, every branch is served by this client
    fixed: Option<Client>,
}

impl KubeResourceClient {
    /// Resolve each branch to the kubeconfig context of the same name
    pub fn from_kubeconfig() -> Self {
        Self {
            clients: RwLock::new(HashMap::new()),
            fixed: None,
        }
    }

    /// Serve all branches with one client
    pub fn with_client(client: Client) -> Self {
        Self {
            clients: RwLock::new(HashMap::new()),
            fixed: Some(client),
        }
    }

    async fn client_for(&self, branch: &Branch) -> Result<Client> {
        if let Some(client) = &self.fixed {
            return Ok(client.clone());
        }
        if let Some(client) = self.clients.read().await.get(&branch.name) {
            return Ok(client.clone());
        }

        let mut clients = self.clients.write().await;
        if let Some(client) = clients.get(&branch.name) {
            return Ok(client.clone());
        }
        let client = create_branch_client(branch).await?;
        clients.insert(branch.name.clone(), client.clone());
        Ok(client)
    }
}

/// Create a client for the kubeconfig context named after the branch
async fn create_branch_client(branch: &Branch) -> Result<Client> {
    info!("Creating client for branch {}", branch);

    let options = KubeConfigOptions {
        context: Some(branch.name.clone()),
        ..Default::default()
    };
    let client_config = KConfig::from_kubeconfig(&options).await.map_err(|e| {
        ControllerError::KubeconfigError(format!(
            "Failed to load kubeconfig context for branch {}: {}",
            branch, e
        ))
    })?;

    Client::try_from(client_config)
        .map_err(|e| ControllerError::KubeconfigError(format!("Failed to create client: {}", e)))
}

fn api_for(client: Client, resource: &ResourceType, namespace: Option<&str>) -> Api<DynamicObject> {
    let ar = resource.api_resource();
    match namespace {
        Some(ns) => Api::namespaced_with(client, ns, &ar),
        None => Api::all_with(client, &ar),
    }
}

/// List and watch items usually arrive without TypeMeta
fn with_types(mut obj: DynamicObject, resource: &ResourceType) -> DynamicObject {
    if obj.types.is_none() {
        obj.types = Some(TypeMeta {
            api_version: resource.api_version.clone(),
            kind: resource.kind.clone(),
        });
    }
    obj
}

fn map_not_found(err: kube::Error, what: impl FnOnce() -> String) -> ControllerError {
    match err {
        kube::Error::Api(ae) if ae.code == 404 => ControllerError::NotFound(what()),
        e => ControllerError::KubeError(e),
    }
}

fn object_name(obj: &DynamicObject) -> Result<String> {
    obj.metadata
        .name
        .clone()
        .ok_or_else(|| ControllerError::InvalidResource("object without metadata.name".to_string()))
}

#[async_trait]
impl ResourceClient for KubeResourceClient {
    #[instrument(skip(self, opts), fields(branch = %branch, key = %key))]
    async fn get(&self, branch: &Branch, key: &ResourceKey, opts: GetOptions) -> Result<DynamicObject> {
        let client = self.client_for(branch).await?;
        let resource = key.resource_type();
        let api = api_for(client, &resource, key.namespace());

        let mut obj = api
            .get(&key.name)
            .await
            .map_err(|e| map_not_found(e, || key.to_string()))?;
        if !opts.show_managed_fields {
            obj.metadata.managed_fields = None;
        }
        Ok(with_types(obj, &resource))
    }

    #[instrument(skip(self, selector), fields(branch = %branch, resource = %resource))]
    async fn list(
        &self,
        branch: &Branch,
        resource: &ResourceType,
        selector: &FieldSelector,
    ) -> Result<Vec<DynamicObject>> {
        let client = self.client_for(branch).await?;
        let api = api_for(client, resource, None);

        let (server, local) = split_field_selector(selector);
        let mut lp = ListParams::default();
        if !server.is_empty() {
            lp = lp.fields(&field_selector_string(&server));
        }
        let list = api.list(&lp).await?;
        debug!("Listed {} {} objects", list.items.len(), resource);

        Ok(list
            .items
            .into_iter()
            .map(|obj| with_types(obj, resource))
            .filter(|obj| matches_fields(obj, &local))
            .collect())
    }

    #[instrument(skip(self, obj, opts), fields(branch = %branch, name = %obj.name_any()))]
    async fn apply(&self, branch: &Branch, obj: &DynamicObject, opts: &ApplyOptions) -> Result<DynamicObject> {
        let client = self.client_for(branch).await?;
        let resource = ResourceType::of(obj)?;
        let name = object_name(obj)?;
        let api = api_for(client, &resource, obj.metadata.namespace.as_deref());

        let mut body = obj.clone();
        body.metadata.managed_fields = None;

        let mut pp = PatchParams::apply(&opts.field_manager);
        if opts.force {
            pp = pp.force();
        }
        let applied = api.patch(&name, &pp, &Patch::Apply(&body)).await?;
        Ok(with_types(applied, &resource))
    }

    #[instrument(skip(self, obj), fields(branch = %branch, name = %obj.name_any()))]
    async fn create(&self, branch: &Branch, obj: &DynamicObject) -> Result<DynamicObject> {
        let client = self.client_for(branch).await?;
        let resource = ResourceType::of(obj)?;
        let api = api_for(client, &resource, obj.metadata.namespace.as_deref());

        let created = api.create(&PostParams::default(), obj).await?;
        Ok(with_types(created, &resource))
    }

    #[instrument(skip(self, obj), fields(branch = %branch, name = %obj.name_any()))]
    async fn update(&self, branch: &Branch, obj: &DynamicObject) -> Result<DynamicObject> {
        let client = self.client_for(branch).await?;
        let resource = ResourceType::of(obj)?;
        let name = object_name(obj)?;
        let api = api_for(client, &resource, obj.metadata.namespace.as_deref());

        let updated = api
            .replace(&name, &PostParams::default(), obj)
            .await
            .map_err(|e| map_not_found(e, || name.clone()))?;
        Ok(with_types(updated, &resource))
    }

    #[instrument(skip(self, obj), fields(branch = %branch, name = %obj.name_any()))]
    async fn update_status(&self, branch: &Branch, obj: &DynamicObject) -> Result<DynamicObject> {
        let client = self.client_for(branch).await?;
        let resource = ResourceType::of(obj)?;
        let name = object_name(obj)?;
        let api = api_for(client, &resource, obj.metadata.namespace.as_deref());

        let status = json!({ "status": obj.data.get("status").cloned().unwrap_or_default() });
        let updated = api
            .patch_status(&name, &PatchParams::default(), &Patch::Merge(&status))
            .await
            .map_err(|e| map_not_found(e, || name.clone()))?;
        Ok(with_types(updated, &resource))
    }

    #[instrument(skip(self, obj), fields(branch = %branch, name = %obj.name_any()))]
    async fn delete(&self, branch: &Branch, obj: &DynamicObject) -> Result<()> {
        let client = self.client_for(branch).await?;
        let resource = ResourceType::of(obj)?;
        let name = object_name(obj)?;
        let api = api_for(client, &resource, obj.metadata.namespace.as_deref());

        api.delete(&name, &DeleteParams::default())
            .await
            .map_err(|e| map_not_found(e, || name.clone()))?;
        Ok(())
    }

    #[instrument(skip(self, selector), fields(branch = %branch, resource = %resource))]
    async fn watch(
        &self,
        branch: &Branch,
        resource: &ResourceType,
        selector: &FieldSelector,
    ) -> Result<WatchStream> {
        let client = self.client_for(branch).await?;
        let api = api_for(client, resource, None);

        let (server, local) = split_field_selector(selector);
        let mut wc = watcher::Config::default();
        if !server.is_empty() {
            wc = wc.fields(&field_selector_string(&server));
        }

        let resource = resource.clone();
        let stream = watcher(api, wc).filter_map(move |event| {
            let resource = resource.clone();
            let local = local.clone();
            async move {
                let event = match event {
                    Ok(watcher::Event::InitApply(obj)) => Some(Ok(WatchEvent {
                        event_type: EventType::Added,
                        object: with_types(obj, &resource),
                    })),
                    Ok(watcher::Event::Apply(obj)) => Some(Ok(WatchEvent {
                        event_type: EventType::Modified,
                        object: with_types(obj, &resource),
                    })),
                    Ok(watcher::Event::Delete(obj)) => Some(Ok(WatchEvent {
                        event_type: EventType::Deleted,
                        object: with_types(obj, &resource),
                    })),
                    Ok(watcher::Event::Init) | Ok(watcher::Event::InitDone) => None,
                    Err(e) => Some(Err(ControllerError::Client(format!(
                        "watch on {} failed: {}",
                        resource, e
                    )))),
                };
                match event {
                    Some(Ok(watched)) if !matches_fields(&watched.object, &local) => None,
                    other => other,
                }
            }
        });

        Ok(stream.boxed())
    }
}
