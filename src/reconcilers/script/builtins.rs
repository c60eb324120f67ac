// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Functions exposed to reconcile scripts.
//!
//! Every builtin returns `#{resource, error, fatal}`. Store failures are
//! reported with `fatal = false`, malformed arguments with `fatal = true`.

use super::result::{failure, from_store, ok, reconcile_result};
use super::ScriptHost;
use crate::client::{ApplyOptions, FieldSelector, GetOptions};
use crate::error::{ControllerError, Result};
use crate::types::resource::{self, field_value};
use crate::types::{ResourceKey, ResourceType};
use kube::api::DynamicObject;
use rhai::{Array, Dynamic, Engine, Map};
use serde_json::Value;
use std::net::IpAddr;
use std::sync::Arc;

fn to_dynamic<T: serde::Serialize>(value: &T) -> Result<Dynamic> {
    rhai::serde::to_dynamic(value).map_err(|e| ControllerError::Script(e.to_string()))
}

fn to_object(obj: Map) -> Result<DynamicObject> {
    let value: Value = rhai::serde::from_dynamic(&Dynamic::from_map(obj))
        .map_err(|e| ControllerError::Script(format!("not a resource: {}", e)))?;
    let obj: DynamicObject = serde_json::from_value(value)
        .map_err(|e| ControllerError::Script(format!("not a resource: {}", e)))?;
    // identity is required by every store call
    ResourceKey::of(&obj)?;
    Ok(obj)
}

fn to_resource_type(resource: Map) -> Result<ResourceType> {
    let resource: ResourceType = rhai::serde::from_dynamic(&Dynamic::from_map(resource))
        .map_err(|e| ControllerError::Script(format!("not a resource type: {}", e)))?;
    if resource.api_version.is_empty() || resource.kind.is_empty() {
        return Err(ControllerError::Script("resource type needs apiVersion and kind".to_string()));
    }
    Ok(resource)
}

fn object_result(obj: DynamicObject) -> Result<Dynamic> {
    to_dynamic(&obj)
}

/// Run a store call with a decoded object argument
fn with_object<T>(
    obj: Map,
    call: impl FnOnce(DynamicObject) -> Result<T>,
    convert: impl FnOnce(T) -> Result<Dynamic>,
) -> Map {
    match to_object(obj) {
        Ok(obj) => from_store(call(obj), convert),
        Err(e) => failure(e, true),
    }
}

fn client_get(host: &ScriptHost, resource: Map, namespace: &str, name: &str) -> Map {
    let resource = match to_resource_type(resource) {
        Ok(resource) => resource,
        Err(e) => return failure(e, true),
    };
    let namespace = (!namespace.is_empty()).then_some(namespace);
    let key = ResourceKey::new(&resource, namespace, name);
    let result = host.block_on(host.client.get(&host.branch, &key, GetOptions::default()));
    from_store(result, object_result)
}

fn client_list(host: &ScriptHost, resource: Map, selector: Map) -> Map {
    let resource = match to_resource_type(resource) {
        Ok(resource) => resource,
        Err(e) => return failure(e, true),
    };
    let selector: FieldSelector = selector
        .into_iter()
        .map(|(path, value)| (path.to_string(), value.to_string()))
        .collect();
    let result = host.block_on(host.client.list(&host.branch, &resource, &selector));
    from_store(result, |items| {
        let items = items
            .iter()
            .map(to_dynamic)
            .collect::<Result<Array>>()?;
        let mut list = Map::new();
        list.insert("items".into(), Dynamic::from_array(items));
        Ok(Dynamic::from_map(list))
    })
}

fn client_create(host: &ScriptHost, obj: Map) -> Map {
    match to_object(obj.clone()) {
        Ok(child) => match host.resources.add_new_resource(child) {
            Ok(()) => ok(Dynamic::from_map(obj)),
            Err(e) => failure(e, true),
        },
        Err(e) => failure(e, true),
    }
}

fn client_apply(host: &ScriptHost, obj: Map) -> Map {
    let opts = ApplyOptions::new(host.field_manager.clone());
    with_object(
        obj,
        |obj| host.block_on(host.client.apply(&host.branch, &obj, &opts)),
        object_result,
    )
}

fn client_update(host: &ScriptHost, obj: Map) -> Map {
    with_object(
        obj,
        |obj| host.block_on(host.client.update(&host.branch, &obj)),
        object_result,
    )
}

fn client_update_status(host: &ScriptHost, obj: Map) -> Map {
    with_object(
        obj,
        |obj| host.block_on(host.client.update_status(&host.branch, &obj)),
        object_result,
    )
}

fn client_delete(host: &ScriptHost, obj: Map) -> Map {
    with_object(
        obj,
        |obj| host.block_on(host.client.delete(&host.branch, &obj)),
        |()| Ok(Dynamic::UNIT),
    )
}

fn get_resource(api_version: &str, kind: &str) -> Map {
    if api_version.is_empty() || kind.is_empty() {
        return failure("get_resource needs apiVersion and kind", true);
    }
    match to_dynamic(&ResourceType::new(api_version, kind)) {
        Ok(resource) => ok(resource),
        Err(e) => failure(e, true),
    }
}

fn update_finalizers(obj: Map, name: &str, add: bool) -> Map {
    let result = to_object(obj).and_then(|mut obj| {
        if add {
            resource::add_finalizer(&mut obj, name);
        } else {
            resource::remove_finalizer(&mut obj, name);
        }
        to_dynamic(&obj)
    });
    match result {
        Ok(obj) => ok(obj),
        Err(e) => failure(e, true),
    }
}

/// Split `address/length`, the length is optional
fn split_cidr(cidr: &str) -> std::result::Result<(IpAddr, Option<u8>), String> {
    let (address, length) = match cidr.split_once('/') {
        Some((address, length)) => (address, Some(length)),
        None => (cidr, None),
    };
    let address: IpAddr = address
        .trim()
        .parse()
        .map_err(|_| format!("{} is not an IP address", cidr))?;
    let max = if address.is_ipv4() { 32 } else { 128 };
    let length = match length {
        Some(length) => match length.trim().parse::<u8>() {
            Ok(length) if length <= max => Some(length),
            _ => return Err(format!("{} has an invalid prefix length", cidr)),
        },
        None => None,
    };
    Ok((address, length))
}

fn get_prefixlength(cidr: &str) -> Map {
    match split_cidr(cidr) {
        Ok((_, Some(length))) => ok((length as i64).into()),
        Ok((_, None)) => failure(format!("{} has no prefix length", cidr), true),
        Err(e) => failure(e, true),
    }
}

/// `10.0.0.0/24` becomes `10.0.0.0-24`, usable in resource names
fn get_subnetname(cidr: &str) -> Map {
    match split_cidr(cidr) {
        Ok((address, Some(length))) => {
            let address = address.to_string().replace(':', "-");
            ok(format!("{}-{}", address, length).into())
        }
        Ok((_, None)) => failure(format!("{} has no prefix length", cidr), true),
        Err(e) => failure(e, true),
    }
}

fn get_address(cidr: &str) -> Map {
    match split_cidr(cidr) {
        Ok((address, _)) => ok(address.to_string().into()),
        Err(e) => failure(e, true),
    }
}

fn is_ipv4(address: &str) -> Map {
    ok(split_cidr(address).is_ok_and(|(a, _)| a.is_ipv4()).into())
}

fn is_ipv6(address: &str) -> Map {
    ok(split_cidr(address).is_ok_and(|(a, _)| a.is_ipv6()).into())
}

fn is_condition_ready(obj: Map, condition: &str) -> Map {
    let value: Value = match rhai::serde::from_dynamic(&Dynamic::from_map(obj)) {
        Ok(value) => value,
        Err(e) => return failure(e, true),
    };
    let ready = field_value(&value, "status.conditions")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .find(|c| c.get("type").and_then(Value::as_str) == Some(condition))
        .and_then(|c| c.get("status"))
        .and_then(Value::as_str)
        == Some("True");
    ok(ready.into())
}

/// Register every builtin on `engine`, bound to one reconcile attempt
pub fn register(engine: &mut Engine, host: Arc<ScriptHost>) {
    let h = Arc::clone(&host);
    engine.register_fn("client_get", move |resource: Map, namespace: &str, name: &str| {
        client_get(&h, resource, namespace, name)
    });
    let h = Arc::clone(&host);
    engine.register_fn("client_list", move |resource: Map, selector: Map| client_list(&h, resource, selector));
    let h = Arc::clone(&host);
    engine.register_fn("client_create", move |obj: Map| client_create(&h, obj));
    let h = Arc::clone(&host);
    engine.register_fn("client_apply", move |obj: Map| client_apply(&h, obj));
    let h = Arc::clone(&host);
    engine.register_fn("client_update", move |obj: Map| client_update(&h, obj));
    let h = Arc::clone(&host);
    engine.register_fn("client_update_status", move |obj: Map| client_update_status(&h, obj));
    let h = host;
    engine.register_fn("client_delete", move |obj: Map| client_delete(&h, obj));

    engine.register_fn("reconcile_result", reconcile_result);
    engine.register_fn("get_resource", get_resource);
    engine.register_fn("add_finalizer", |obj: Map, name: &str| update_finalizers(obj, name, true));
    engine.register_fn("del_finalizer", |obj: Map, name: &str| update_finalizers(obj, name, false));
    engine.register_fn("get_prefixlength", get_prefixlength);
    engine.register_fn("get_subnetname", get_subnetname);
    engine.register_fn("get_address", get_address);
    engine.register_fn("isIPv4", is_ipv4);
    engine.register_fn("isIPv6", is_ipv6);
    engine.register_fn("is_conditionready", is_condition_ready);
}
