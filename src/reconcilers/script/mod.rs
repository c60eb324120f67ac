// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Script runtime: calls `reconcile(obj)` in the entrypoint module for each attempt.

pub mod builtins;
pub mod cache;
pub mod result;

pub use cache::{CodeModules, ModuleCache, ModuleSource};

use crate::client::{Branch, ResourceClient};
use crate::constants::script::{EXTENSION, MAX_OPERATIONS, RECONCILE_FN};
use crate::error::{ControllerError, Result};
use crate::reconcilers::resources::Resources;
use crate::types::{ReconcileResult, ReconcilerConfig};
use kube::api::DynamicObject;
use rhai::{Dynamic, Engine, Module, Scope};
use std::future::Future;
use std::sync::Arc;
use tokio::runtime::Handle;
use tracing::{debug, info};

/// Module name used by `import`, without the script extension
pub fn module_name(name: &str) -> String {
    name.strip_suffix(EXTENSION)
        .and_then(|n| n.strip_suffix('.'))
        .unwrap_or(name)
        .to_string()
}

/// Engine with the operation limit every script runs under
pub(crate) fn sandboxed_engine() -> Engine {
    let mut engine = Engine::new();
    engine.set_max_operations(MAX_OPERATIONS);
    engine.on_print(|text| info!(target: "trellis::script", "{}", text));
    engine.on_debug(|text, source, pos| {
        debug!(target: "trellis::script", "{} @ {:?} {}", text, source, pos)
    });
    engine
}

/// What the builtins of one reconcile attempt act on
pub struct ScriptHost {
    pub client: Arc<dyn ResourceClient>,
    pub branch: Branch,
    pub resources: Arc<Resources>,
    pub field_manager: String,
    handle: Handle,
}

impl ScriptHost {
    /// Must be created on the runtime the builtins will call back into
    pub fn new(
        client: Arc<dyn ResourceClient>,
        branch: Branch,
        resources: Arc<Resources>,
        field_manager: impl Into<String>,
    ) -> Self {
        Self {
            client,
            branch,
            resources,
            field_manager: field_manager.into(),
            handle: Handle::current(),
        }
    }

    /// Drive a store call from the script thread
    pub fn block_on<F: Future>(&self, future: F) -> F::Output {
        self.handle.block_on(future)
    }
}

pub struct ScriptRuntime {
    cache: ModuleCache,
    main: Arc<Module>,
}

impl ScriptRuntime {
    /// Load the entrypoint module and its imports. Cycles and compile errors are fatal.
    pub async fn new(config: &ReconcilerConfig, cache: ModuleCache) -> Result<Self> {
        let name = module_name(&config.entrypoint);
        let loader = cache.clone();
        let main = tokio::task::spawn_blocking(move || loader.load(&name))
            .await
            .map_err(|e| ControllerError::ModuleLoad(format!("module load task failed: {}", e)))??;
        Ok(Self { cache, main })
    }

    /// Run `reconcile(obj)` on a blocking thread and classify what it returns
    pub async fn reconcile(&self, host: ScriptHost, obj: &DynamicObject) -> Result<ReconcileResult> {
        let value = serde_json::to_value(obj)?;
        let cache = self.cache.clone();
        let main = Arc::clone(&self.main);
        let host = Arc::new(host);

        let returned = tokio::task::spawn_blocking(move || -> Result<Dynamic> {
            let mut engine = sandboxed_engine();
            engine.set_module_resolver(cache.resolver());
            engine.register_global_module(main);
            builtins::register(&mut engine, host);

            let obj = rhai::serde::to_dynamic(value)
                .map_err(|e| ControllerError::Script(e.to_string()))?;
            let mut scope = Scope::new();
            scope.push_dynamic("obj", obj);
            engine
                .eval_with_scope::<Dynamic>(&mut scope, &format!("{}(obj)", RECONCILE_FN))
                .map_err(|e| ControllerError::Script(e.to_string()))
        })
        .await
        .map_err(|e| ControllerError::Script(format!("script task failed: {}", e)))??;

        result::classify(returned)
    }
}
