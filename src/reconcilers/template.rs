// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Template runtime: renders one child manifest from the "for" object.

use crate::error::{ControllerError, Result};
use crate::types::resource::field_string;
use crate::types::ReconcilerConfig;
use kube::api::DynamicObject;
use minijinja::{Environment, UndefinedBehavior};
use serde_json::Value;
use tracing::debug;

pub struct TemplateRuntime {
    env: Environment<'static>,
    entrypoint: String,
}

impl TemplateRuntime {
    /// Register every code entry as a template so the entrypoint can include the others
    pub fn new(config: &ReconcilerConfig) -> Result<Self> {
        let mut env = Environment::new();
        env.set_undefined_behavior(UndefinedBehavior::Strict);
        for (name, source) in &config.code {
            env.add_template_owned(name.clone(), source.clone())
                .map_err(|e| ControllerError::Template(format!("{}: {}", name, e)))?;
        }
        if env.get_template(&config.entrypoint).is_err() {
            return Err(ControllerError::Template(format!(
                "entrypoint template {} not found",
                config.entrypoint
            )));
        }
        Ok(Self {
            env,
            entrypoint: config.entrypoint.clone(),
        })
    }

    /// Render the entrypoint with the object's JSON content as context
    pub fn render(&self, obj: &DynamicObject) -> Result<DynamicObject> {
        let context = serde_json::to_value(obj)?;
        let template = self
            .env
            .get_template(&self.entrypoint)
            .map_err(|e| ControllerError::Template(e.to_string()))?;
        let rendered = template
            .render(&context)
            .map_err(|e| ControllerError::Template(format!("{}: {}", self.entrypoint, e)))?;
        debug!("Rendered {} bytes from {}", rendered.len(), self.entrypoint);
        parse_manifest(&rendered)
    }
}

/// Exactly one manifest with apiVersion, kind and metadata.name
fn parse_manifest(rendered: &str) -> Result<DynamicObject> {
    let value: Value = serde_yaml::from_str(rendered)
        .map_err(|e| ControllerError::Template(format!("rendered output is not one YAML document: {}", e)))?;
    if !value.is_object() {
        return Err(ControllerError::Template(
            "rendered output is not a resource manifest".to_string(),
        ));
    }
    for field in ["apiVersion", "kind", "metadata.name"] {
        if field_string(&value, field).map_or(true, |v| v.is_empty()) {
            return Err(ControllerError::Template(format!(
                "rendered manifest has no {}",
                field
            )));
        }
    }
    serde_json::from_value(value)
        .map_err(|e| ControllerError::Template(format!("rendered manifest is invalid: {}", e)))
}
