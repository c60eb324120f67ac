// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Reconciler driving one config: finalizer handling, runtime transform and convergence.

use super::managed_fields::prune_unmanaged;
use super::resources::Resources;
use super::script::{ModuleCache, ScriptHost, ScriptRuntime};
use super::template::TemplateRuntime;
use super::Reconcile;
use crate::client::{ApplyOptions, GetOptions, ResourceClient};
use crate::constants::{FINALIZER_DOMAIN, OPERATOR_NAME};
use crate::controllers::context::RunContext;
use crate::error::Result;
use crate::types::resource::{add_finalizer, has_finalizer, is_terminating, remove_finalizer};
use crate::types::{
    ReconcileRequest, ReconcileResult, ReconcilerConfig, ResourceKey, ResourceType, RuntimeKind,
};
use async_trait::async_trait;
use kube::api::DynamicObject;
use kube::ResourceExt;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Business logic turning a "for" object into children
pub enum Runtime {
    Template(TemplateRuntime),
    Script(ScriptRuntime),
}

impl Runtime {
    pub fn template(config: &ReconcilerConfig) -> Result<Self> {
        Ok(Runtime::Template(TemplateRuntime::new(config)?))
    }

    pub async fn script(config: &ReconcilerConfig, cache: ModuleCache) -> Result<Self> {
        Ok(Runtime::Script(ScriptRuntime::new(config, cache).await?))
    }
}

pub struct TypedReconciler {
    config: ReconcilerConfig,
    client: Arc<dyn ResourceClient>,
    runtime: Runtime,
    field_manager: String,
    finalizer: String,
}

/// Build the reconciler for a config, with the runtime its config selects
pub async fn new_reconciler(
    config: ReconcilerConfig,
    client: Arc<dyn ResourceClient>,
    cache: &ModuleCache,
) -> Result<TypedReconciler> {
    config.validate()?;
    let runtime = match config.runtime {
        RuntimeKind::Template => Runtime::template(&config)?,
        RuntimeKind::Script => Runtime::script(&config, cache.clone()).await?,
    };
    Ok(TypedReconciler::new(config, client, runtime))
}

impl TypedReconciler {
    pub fn new(config: ReconcilerConfig, client: Arc<dyn ResourceClient>, runtime: Runtime) -> Self {
        let field_manager = format!("{}-{}", OPERATOR_NAME, config.name);
        let finalizer = format!("{}/{}", FINALIZER_DOMAIN, config.name);
        Self {
            config,
            client,
            runtime,
            field_manager,
            finalizer,
        }
    }

    pub fn config(&self) -> &ReconcilerConfig {
        &self.config
    }

    fn apply_options(&self) -> ApplyOptions {
        ApplyOptions::new(self.field_manager.clone())
    }

    fn resources(&self, ctx: &RunContext, owner: &DynamicObject) -> Resources {
        Resources::new(
            Arc::clone(&self.client),
            ctx.branch().clone(),
            owner.clone(),
            self.config.owns.clone(),
            self.field_manager.clone(),
        )
    }

    /// Tear down the children, then release the object
    async fn finalize(&self, ctx: &RunContext, obj: DynamicObject) -> Result<ReconcileResult> {
        info!("{} is terminating, deleting owned resources", obj.name_any());
        self.resources(ctx, &obj).delete_all().await?;

        let mut pruned = prune_unmanaged(&obj, &self.field_manager)?;
        if !remove_finalizer(&mut pruned, &self.finalizer) {
            return Ok(ReconcileResult::default());
        }
        if pruned.finalizers().is_empty() {
            pruned.metadata.finalizers = None;
        }
        match self.client.apply(ctx.branch(), &pruned, &self.apply_options()).await {
            Ok(_) => Ok(ReconcileResult::default()),
            Err(e) if e.is_not_found() => Ok(ReconcileResult::default()),
            Err(e) => Err(e),
        }
    }

    /// Make sure the finalizer is stored before any child exists
    async fn ensure_finalizer(&self, ctx: &RunContext, obj: DynamicObject) -> Result<DynamicObject> {
        if has_finalizer(&obj, &self.finalizer) {
            return Ok(obj);
        }
        debug!("Adding finalizer {} to {}", self.finalizer, obj.name_any());
        let mut pruned = prune_unmanaged(&obj, &self.field_manager)?;
        add_finalizer(&mut pruned, &self.finalizer);
        self.client
            .apply(ctx.branch(), &pruned, &self.apply_options())
            .await
    }

    async fn transform(&self, ctx: &RunContext, obj: &DynamicObject) -> Result<ReconcileResult> {
        let resources = Arc::new(self.resources(ctx, obj));
        match &self.runtime {
            Runtime::Template(template) => {
                resources.add_new_resource(template.render(obj)?)?;
                resources.apply().await?;
                Ok(ReconcileResult::default())
            }
            Runtime::Script(script) => {
                let host = ScriptHost::new(
                    Arc::clone(&self.client),
                    ctx.branch().clone(),
                    Arc::clone(&resources),
                    self.field_manager.clone(),
                );
                let result = script.reconcile(host, obj).await?;
                if let Some(message) = &result.message {
                    // an unfinished transform registered only part of the children
                    warn!("Script for {} did not finish, keeping children: {}", obj.name_any(), message);
                    return Ok(result);
                }
                match resources.apply().await {
                    Ok(()) => Ok(result),
                    Err(e) if e.is_fatal() => Err(e),
                    Err(e) => {
                        warn!("Converging children of {} failed: {}", obj.name_any(), e);
                        Ok(ReconcileResult::requeue(e.to_string()))
                    }
                }
            }
        }
    }
}

#[async_trait]
impl Reconcile for TypedReconciler {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn for_type(&self) -> &ResourceType {
        self.config.for_type()
    }

    #[instrument(skip(self, ctx), fields(reconciler = %self.config.name, branch = %ctx.branch()))]
    async fn reconcile(&self, ctx: &RunContext, request: &ReconcileRequest) -> Result<ReconcileResult> {
        let key = ResourceKey::new(self.for_type(), request.namespace.as_deref(), &request.name);
        let opts = GetOptions {
            show_managed_fields: true,
        };
        let obj = match self.client.get(ctx.branch(), &key, opts).await {
            Ok(obj) => obj,
            Err(e) if e.is_not_found() => {
                debug!("{} no longer exists", key);
                return Ok(ReconcileResult::default());
            }
            Err(e) => return Err(e),
        };

        if is_terminating(&obj) {
            return self.finalize(ctx, obj).await;
        }

        let obj = self.ensure_finalizer(ctx, obj).await?;
        let result = self.transform(ctx, &obj).await?;

        let pruned = prune_unmanaged(&obj, &self.field_manager)?;
        self.client
            .apply(ctx.branch(), &pruned, &self.apply_options())
            .await?;
        Ok(result)
    }
}
