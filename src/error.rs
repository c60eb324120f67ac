// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ControllerError {
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("{0} not found")]
    NotFound(String),

    #[error("Store request failed: {0}")]
    Client(String),

    #[error("Failed to create branch client: {0}")]
    KubeconfigError(String),

    #[error("Invalid reconciler config: {0}")]
    InvalidConfig(String),

    #[error("Invalid resource: {0}")]
    InvalidResource(String),

    #[error("Template error: {0}")]
    Template(String),

    #[error("Script error: {0}")]
    Script(String),

    #[error("Fatal reconcile error: {0}")]
    Fatal(String),

    #[error("Module load cycle detected: {0}")]
    ModuleCycle(String),

    #[error("Module load failed: {0}")]
    ModuleLoad(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{}", join_errors(.0))]
    Aggregate(Vec<ControllerError>),
}

fn join_errors(errors: &[ControllerError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl ControllerError {
    pub fn is_not_found(&self) -> bool {
        match self {
            ControllerError::NotFound(_) => true,
            ControllerError::KubeError(kube::Error::Api(err)) => err.code == 404,
            _ => false,
        }
    }

    /// Fatal errors halt the key until something external retriggers it.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ControllerError::Template(_)
                | ControllerError::Script(_)
                | ControllerError::Fatal(_)
                | ControllerError::ModuleCycle(_)
                | ControllerError::ModuleLoad(_)
                | ControllerError::InvalidConfig(_)
        )
    }

    /// Collapses per-item errors into one, or `Ok` when there were none.
    pub fn aggregate(mut errors: Vec<ControllerError>) -> Result<()> {
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(ControllerError::Aggregate(errors)),
        }
    }
}

pub type Result<T> = std::result::Result<T, ControllerError>;
