// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Test utilities: a mock HTTP service for kube clients and an in-memory store.

use crate::client::{
    matches_fields, ApplyOptions, Branch, EventType, FieldSelector, GetOptions, ResourceClient,
    WatchEvent, WatchStream,
};
use crate::error::{ControllerError, Result};
use crate::reconcilers::managed_fields::managed_field_set;
use crate::types::{ReconcilerConfig, ResourceKey, ResourceType};
use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use http::{Request, Response};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{FieldsV1, ManagedFieldsEntry, Time};
use kube::api::DynamicObject;
use kube::client::Body;
use kube::{Client, ResourceExt};
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use tokio::sync::broadcast;
use tower::Service;

/// A mock HTTP service that returns predefined responses based on request paths.
#[derive(Clone)]
pub struct MockService {
    responses: Arc<Mutex<HashMap<(String, String), (u16, String)>>>,
    requests: Arc<Mutex<Vec<String>>>,
}

impl MockService {
    pub fn new() -> Self {
        Self {
            responses: Arc::new(Mutex::new(HashMap::new())),
            requests: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Every request URI seen so far, path and query
    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }

    /// Add a response for requests with this method matching the exact path
    pub fn on(self, method: &str, path: &str, status: u16, body: &str) -> Self {
        self.responses
            .lock()
            .unwrap()
            .insert((method.to_string(), path.to_string()), (status, body.to_string()));
        self
    }

    pub fn on_get(self, path: &str, status: u16, body: &str) -> Self {
        self.on("GET", path, status, body)
    }

    pub fn on_patch(self, path: &str, status: u16, body: &str) -> Self {
        self.on("PATCH", path, status, body)
    }

    /// Build a kube Client from this mock service
    pub fn into_client(self) -> Client {
        Client::new(self, "https://kubernetes.default.svc")
    }

    fn find_response(&self, method: &str, path: &str) -> Option<(u16, String)> {
        let responses = self.responses.lock().unwrap();
        responses
            .get(&(method.to_string(), path.to_string()))
            .cloned()
    }
}

impl Default for MockService {
    fn default() -> Self {
        Self::new()
    }
}

impl Service<Request<Body>> for MockService {
    type Response = Response<Body>;
    type Error = tower::BoxError;
    type Future = std::pin::Pin<
        Box<dyn std::future::Future<Output = std::result::Result<Self::Response, Self::Error>> + Send>,
    >;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<std::result::Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let method = req.method().to_string();
        let path = req.uri().path().to_string();
        self.requests.lock().unwrap().push(req.uri().to_string());

        let response = self.find_response(&method, &path);

        Box::pin(async move {
            let (status, body) = response.unwrap_or_else(|| (404, not_found_json("resource", &path)));
            Ok(Response::builder()
                .status(status)
                .header("content-type", "application/json")
                .body(Body::from(body.into_bytes()))
                .unwrap())
        })
    }
}

/// Create a 404 not found response
pub fn not_found_json(resource: &str, name: &str) -> String {
    serde_json::json!({
        "kind": "Status",
        "apiVersion": "v1",
        "status": "Failure",
        "message": format!("{} \"{}\" not found", resource, name),
        "reason": "NotFound",
        "code": 404
    })
    .to_string()
}

pub fn object(value: Value) -> DynamicObject {
    serde_json::from_value(value).unwrap()
}

pub fn widget_type() -> ResourceType {
    ResourceType::new("example.com/v1", "Widget")
}

pub fn config_map_type() -> ResourceType {
    ResourceType::new("v1", "ConfigMap")
}

pub fn namespace_type() -> ResourceType {
    ResourceType::new("v1", "Namespace")
}

pub fn widget(name: &str, namespace: &str) -> Value {
    json!({
        "apiVersion": "example.com/v1",
        "kind": "Widget",
        "metadata": {"name": name, "namespace": namespace, "labels": {"tier": "web"}},
        "spec": {"value": format!("{}-value", name)}
    })
}

pub fn config_map(name: &str, namespace: &str) -> Value {
    json!({
        "apiVersion": "v1",
        "kind": "ConfigMap",
        "metadata": {"name": name, "namespace": namespace},
        "data": {"key": "value"}
    })
}

/// Widget reconciler owning ConfigMaps, with the given runtime and code
pub fn widget_config(runtime: &str, entrypoint: &str, code: &[(&str, &str)]) -> ReconcilerConfig {
    let code: BTreeMap<String, String> = code
        .iter()
        .map(|(name, source)| (name.to_string(), source.to_string()))
        .collect();
    serde_json::from_value(json!({
        "name": "widget",
        "for": {"apiVersion": "example.com/v1", "kind": "Widget"},
        "owns": [{"apiVersion": "v1", "kind": "ConfigMap"}],
        "runtime": runtime,
        "entrypoint": entrypoint,
        "code": code,
    }))
    .unwrap()
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpKind {
    Apply,
    Create,
    Update,
    UpdateStatus,
    Delete,
}

/// Mutating call recorded by the memory store
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoreOp {
    pub kind: OpKind,
    pub key: ResourceKey,
}

#[derive(Clone)]
enum Broadcast {
    Event(String, ResourceType, WatchEvent),
    Interrupt,
}

#[derive(Default)]
struct StoreState {
    objects: BTreeMap<(String, ResourceKey), DynamicObject>,
    next_id: u64,
    ops: Vec<StoreOp>,
    failing: HashSet<String>,
    watch_failures: usize,
    watch_calls: usize,
}

impl StoreState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

/// Branch aware in-memory store emulating the parts of an API server the controller relies on
pub struct MemoryClient {
    state: Mutex<StoreState>,
    events: broadcast::Sender<Broadcast>,
}

impl Default for MemoryClient {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryClient {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            state: Mutex::new(StoreState::default()),
            events,
        }
    }

    /// Insert an object directly, assigning uid and resourceVersion
    pub fn seed(&self, branch: &Branch, value: Value) -> DynamicObject {
        let mut obj = object(value);
        let mut state = self.state.lock().unwrap();
        let id = state.next_id();
        if obj.metadata.uid.is_none() {
            obj.metadata.uid = Some(format!("uid-{}", id));
        }
        obj.metadata.resource_version = Some(id.to_string());
        let key = ResourceKey::of(&obj).unwrap();
        state.objects.insert((branch.name.clone(), key.clone()), obj.clone());
        self.emit(branch, &key, EventType::Added, &obj);
        obj
    }

    pub fn object(&self, branch: &Branch, key: &ResourceKey) -> Option<DynamicObject> {
        let state = self.state.lock().unwrap();
        state.objects.get(&(branch.name.clone(), key.clone())).cloned()
    }

    pub fn objects_of(&self, branch: &Branch, resource: &ResourceType) -> Vec<DynamicObject> {
        let state = self.state.lock().unwrap();
        state
            .objects
            .iter()
            .filter(|((b, key), _)| b == &branch.name && &key.resource_type() == resource)
            .map(|(_, obj)| obj.clone())
            .collect()
    }

    /// Make every apply and delete of objects with this name fail
    pub fn fail_on(&self, name: &str) {
        self.state.lock().unwrap().failing.insert(name.to_string());
    }

    /// Make the next `count` watch calls fail
    pub fn fail_next_watches(&self, count: usize) {
        self.state.lock().unwrap().watch_failures = count;
    }

    /// Break every open watch stream with an error
    pub fn interrupt_watches(&self) {
        let _ = self.events.send(Broadcast::Interrupt);
    }

    pub fn watch_calls(&self) -> usize {
        self.state.lock().unwrap().watch_calls
    }

    pub fn ops(&self) -> Vec<StoreOp> {
        self.state.lock().unwrap().ops.clone()
    }

    pub fn clear_ops(&self) {
        self.state.lock().unwrap().ops.clear();
    }

    fn emit(&self, branch: &Branch, key: &ResourceKey, event_type: EventType, obj: &DynamicObject) {
        let _ = self.events.send(Broadcast::Event(
            branch.name.clone(),
            key.resource_type(),
            WatchEvent {
                event_type,
                object: obj.clone(),
            },
        ));
    }

    fn check_failure(state: &StoreState, name: &str) -> Result<()> {
        if state.failing.contains(name) {
            return Err(ControllerError::Client(format!("injected failure for {}", name)));
        }
        Ok(())
    }

    /// Store the object, or drop it when it is terminating without finalizers.
    /// Writes that change nothing keep the resourceVersion and emit no event.
    fn persist(&self, state: &mut StoreState, branch: &Branch, key: ResourceKey, mut obj: DynamicObject) -> DynamicObject {
        if let Some(stored) = state.objects.get(&(branch.name.clone(), key.clone())) {
            obj.metadata.resource_version = stored.metadata.resource_version.clone();
            if serde_json::to_value(stored).ok() == serde_json::to_value(&obj).ok() {
                return obj;
            }
        }
        obj.metadata.resource_version = Some(state.next_id().to_string());
        if obj.metadata.deletion_timestamp.is_some() && obj.finalizers().is_empty() {
            state.objects.remove(&(branch.name.clone(), key.clone()));
            self.emit(branch, &key, EventType::Deleted, &obj);
        } else {
            state.objects.insert((branch.name.clone(), key.clone()), obj.clone());
            self.emit(branch, &key, EventType::Modified, &obj);
        }
        obj
    }
}

const SERVER_METADATA: [&str; 8] = [
    "name",
    "namespace",
    "uid",
    "resourceVersion",
    "creationTimestamp",
    "deletionTimestamp",
    "generation",
    "managedFields",
];

/// FieldsV1 set describing every field present in an applied object
fn applied_field_set(value: &Value) -> Map<String, Value> {
    let mut set = Map::new();
    let Value::Object(map) = value else {
        return set;
    };
    for (key, child) in map {
        match key.as_str() {
            "apiVersion" | "kind" => {}
            "metadata" => {
                let mut meta = Map::new();
                for (mk, mv) in child.as_object().into_iter().flatten() {
                    if SERVER_METADATA.contains(&mk.as_str()) {
                        continue;
                    }
                    let sub = if mk == "finalizers" {
                        mv.as_array()
                            .into_iter()
                            .flatten()
                            .map(|f| (format!("v:{}", f), json!({})))
                            .collect()
                    } else {
                        nested_field_set(mv)
                    };
                    meta.insert(format!("f:{}", mk), Value::Object(sub));
                }
                set.insert("f:metadata".to_string(), Value::Object(meta));
            }
            _ => {
                set.insert(format!("f:{}", key), Value::Object(nested_field_set(child)));
            }
        }
    }
    set
}

/// Maps recurse, lists and scalars are owned atomically
fn nested_field_set(value: &Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map
            .iter()
            .map(|(k, v)| (format!("f:{}", k), Value::Object(nested_field_set(v))))
            .collect(),
        _ => Map::new(),
    }
}

/// Remove the fields of a previous apply so omitted fields disappear
fn remove_owned(value: &mut Value, set: &Map<String, Value>) {
    match value {
        Value::Object(map) => {
            for (field, sub) in set {
                let Some(key) = field.strip_prefix("f:") else {
                    continue;
                };
                let sub = sub.as_object().cloned().unwrap_or_default();
                let is_set_list = sub.keys().any(|k| k.starts_with("v:"));
                if sub.is_empty() {
                    map.remove(key);
                } else if let Some(child) = map.get_mut(key) {
                    if is_set_list {
                        if let Value::Array(items) = child {
                            items.retain(|item| !sub.contains_key(&format!("v:{}", item)));
                        }
                    } else {
                        remove_owned(child, &sub);
                    }
                }
            }
        }
        _ => {}
    }
}

fn merge_applied(target: &mut Value, source: &Value) {
    match (target, source) {
        (Value::Object(target), Value::Object(source)) => {
            for (key, value) in source {
                match (target.get_mut(key), value) {
                    (Some(Value::Array(existing)), Value::Array(incoming)) if key == "finalizers" => {
                        for item in incoming {
                            if !existing.contains(item) {
                                existing.push(item.clone());
                            }
                        }
                    }
                    (Some(existing @ Value::Object(_)), Value::Object(_)) => merge_applied(existing, value),
                    _ => {
                        target.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (target, source) => *target = source.clone(),
    }
}

fn manager_entry(manager: &str, fields: Map<String, Value>) -> ManagedFieldsEntry {
    ManagedFieldsEntry {
        manager: Some(manager.to_string()),
        operation: Some("Apply".to_string()),
        fields_type: Some("FieldsV1".to_string()),
        fields_v1: Some(FieldsV1(Value::Object(fields))),
        ..Default::default()
    }
}

#[async_trait]
impl ResourceClient for MemoryClient {
    async fn get(&self, branch: &Branch, key: &ResourceKey, opts: GetOptions) -> Result<DynamicObject> {
        let mut obj = self
            .object(branch, key)
            .ok_or_else(|| ControllerError::NotFound(key.to_string()))?;
        if !opts.show_managed_fields {
            obj.metadata.managed_fields = None;
        }
        Ok(obj)
    }

    async fn list(
        &self,
        branch: &Branch,
        resource: &ResourceType,
        selector: &FieldSelector,
    ) -> Result<Vec<DynamicObject>> {
        Ok(self
            .objects_of(branch, resource)
            .into_iter()
            .filter(|obj| matches_fields(obj, selector))
            .collect())
    }

    async fn apply(&self, branch: &Branch, obj: &DynamicObject, opts: &ApplyOptions) -> Result<DynamicObject> {
        let key = ResourceKey::of(obj)?;
        let mut state = self.state.lock().unwrap();
        Self::check_failure(&state, &key.name)?;
        state.ops.push(StoreOp {
            kind: OpKind::Apply,
            key: key.clone(),
        });

        let mut applied = serde_json::to_value(obj)?;
        if let Some(meta) = applied.get_mut("metadata").and_then(Value::as_object_mut) {
            for field in SERVER_METADATA.iter().skip(2) {
                meta.remove(*field);
            }
        }
        let fields = applied_field_set(&applied);

        let existing = state.objects.get(&(branch.name.clone(), key.clone())).cloned();
        match existing {
            None => {
                let mut created: DynamicObject = serde_json::from_value(applied)?;
                created.metadata.uid = Some(format!("uid-{}", state.next_id()));
                created.metadata.creation_timestamp = Some(Time(Utc::now()));
                created.metadata.managed_fields = Some(vec![manager_entry(&opts.field_manager, fields)]);
                created.metadata.resource_version = Some(state.next_id().to_string());
                state
                    .objects
                    .insert((branch.name.clone(), key.clone()), created.clone());
                self.emit(branch, &key, EventType::Added, &created);
                Ok(created)
            }
            Some(stored) => {
                let previous = managed_field_set(&stored, &opts.field_manager);
                let mut merged = serde_json::to_value(&stored)?;
                remove_owned(&mut merged, &previous);
                merge_applied(&mut merged, &applied);

                let mut updated: DynamicObject = serde_json::from_value(merged)?;
                let mut entries: Vec<ManagedFieldsEntry> = stored
                    .metadata
                    .managed_fields
                    .clone()
                    .unwrap_or_default()
                    .into_iter()
                    .filter(|e| e.manager.as_deref() != Some(opts.field_manager.as_str()))
                    .collect();
                entries.push(manager_entry(&opts.field_manager, fields));
                updated.metadata.managed_fields = Some(entries);
                Ok(self.persist(&mut state, branch, key, updated))
            }
        }
    }

    async fn create(&self, branch: &Branch, obj: &DynamicObject) -> Result<DynamicObject> {
        let key = ResourceKey::of(obj)?;
        let mut state = self.state.lock().unwrap();
        if state.objects.contains_key(&(branch.name.clone(), key.clone())) {
            return Err(ControllerError::Client(format!("{} already exists", key)));
        }
        state.ops.push(StoreOp {
            kind: OpKind::Create,
            key: key.clone(),
        });
        let mut created = obj.clone();
        created.metadata.uid = Some(format!("uid-{}", state.next_id()));
        created.metadata.resource_version = Some(state.next_id().to_string());
        state
            .objects
            .insert((branch.name.clone(), key.clone()), created.clone());
        self.emit(branch, &key, EventType::Added, &created);
        Ok(created)
    }

    async fn update(&self, branch: &Branch, obj: &DynamicObject) -> Result<DynamicObject> {
        let key = ResourceKey::of(obj)?;
        let mut state = self.state.lock().unwrap();
        let stored = state
            .objects
            .get(&(branch.name.clone(), key.clone()))
            .cloned()
            .ok_or_else(|| ControllerError::NotFound(key.to_string()))?;
        state.ops.push(StoreOp {
            kind: OpKind::Update,
            key: key.clone(),
        });
        let mut updated = obj.clone();
        updated.metadata.uid = stored.metadata.uid.clone();
        updated.metadata.managed_fields = stored.metadata.managed_fields.clone();
        updated.metadata.deletion_timestamp = stored.metadata.deletion_timestamp.clone();
        Ok(self.persist(&mut state, branch, key, updated))
    }

    async fn update_status(&self, branch: &Branch, obj: &DynamicObject) -> Result<DynamicObject> {
        let key = ResourceKey::of(obj)?;
        let mut state = self.state.lock().unwrap();
        let mut stored = state
            .objects
            .get(&(branch.name.clone(), key.clone()))
            .cloned()
            .ok_or_else(|| ControllerError::NotFound(key.to_string()))?;
        state.ops.push(StoreOp {
            kind: OpKind::UpdateStatus,
            key: key.clone(),
        });
        if let (Value::Object(data), Some(status)) = (&mut stored.data, obj.data.get("status")) {
            data.insert("status".to_string(), status.clone());
        }
        Ok(self.persist(&mut state, branch, key, stored))
    }

    async fn delete(&self, branch: &Branch, obj: &DynamicObject) -> Result<()> {
        let key = ResourceKey::of(obj)?;
        let mut state = self.state.lock().unwrap();
        Self::check_failure(&state, &key.name)?;
        let mut stored = state
            .objects
            .get(&(branch.name.clone(), key.clone()))
            .cloned()
            .ok_or_else(|| ControllerError::NotFound(key.to_string()))?;
        state.ops.push(StoreOp {
            kind: OpKind::Delete,
            key: key.clone(),
        });
        if stored.metadata.deletion_timestamp.is_none() {
            stored.metadata.deletion_timestamp = Some(Time(Utc::now()));
        }
        self.persist(&mut state, branch, key, stored);
        Ok(())
    }

    async fn watch(
        &self,
        branch: &Branch,
        resource: &ResourceType,
        selector: &FieldSelector,
    ) -> Result<WatchStream> {
        let (rx, initial) = {
            let mut state = self.state.lock().unwrap();
            state.watch_calls += 1;
            if state.watch_failures > 0 {
                state.watch_failures -= 1;
                return Err(ControllerError::Client("injected watch failure".to_string()));
            }
            let rx = self.events.subscribe();
            let initial: Vec<Broadcast> = state
                .objects
                .iter()
                .filter(|((b, key), _)| b == &branch.name && &key.resource_type() == resource)
                .map(|((b, _), obj)| {
                    Broadcast::Event(
                        b.clone(),
                        resource.clone(),
                        WatchEvent {
                            event_type: EventType::Added,
                            object: obj.clone(),
                        },
                    )
                })
                .collect();
            (rx, initial)
        };

        let live = futures::stream::unfold(rx, |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(item) => return Some((item, rx)),
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });

        let branch = branch.name.clone();
        let resource = resource.clone();
        let selector = selector.clone();
        let stream = futures::stream::iter(initial)
            .chain(live)
            .filter_map(move |item| {
                let matched = match item {
                    Broadcast::Interrupt => Some(Err(ControllerError::Client(
                        "watch interrupted".to_string(),
                    ))),
                    Broadcast::Event(b, r, event) if b == branch && r == resource => {
                        matches_fields(&event.object, &selector).then_some(Ok(event))
                    }
                    Broadcast::Event(..) => None,
                };
                async move { matched }
            });
        Ok(stream.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_apply_drops_fields_no_longer_applied() {
        let store = MemoryClient::new();
        let branch = Branch::new("main");
        let opts = ApplyOptions::new("mgr");

        let mut cm = config_map("a", "default");
        cm["data"]["extra"] = json!("x");
        store.apply(&branch, &object(cm), &opts).await.unwrap();
        let applied = store
            .apply(&branch, &object(config_map("a", "default")), &opts)
            .await
            .unwrap();

        assert_eq!(applied.data["data"], json!({"key": "value"}));
    }

    #[tokio::test]
    async fn test_delete_with_finalizer_marks_terminating() {
        let store = MemoryClient::new();
        let branch = Branch::new("main");
        let mut value = widget("w1", "default");
        value["metadata"]["finalizers"] = json!(["keep"]);
        let obj = store.seed(&branch, value);
        let key = ResourceKey::of(&obj).unwrap();

        store.delete(&branch, &obj).await.unwrap();
        let stored = store.object(&branch, &key).unwrap();
        assert!(stored.metadata.deletion_timestamp.is_some());

        let mut cleared = stored.clone();
        cleared.finalizers_mut().clear();
        store.update(&branch, &cleared).await.unwrap();
        assert!(store.object(&branch, &key).is_none());
    }

    #[tokio::test]
    async fn test_watch_replays_existing_objects() {
        let store = MemoryClient::new();
        let branch = Branch::new("main");
        store.seed(&branch, widget("w1", "default"));
        store.seed(&Branch::new("other"), widget("w2", "default"));

        let mut stream = store
            .watch(&branch, &widget_type(), &FieldSelector::new())
            .await
            .unwrap();
        let first = stream.next().await.unwrap().unwrap();

        assert_eq!(first.event_type, EventType::Added);
        assert_eq!(first.object.name_any(), "w1");
    }
}
