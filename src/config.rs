// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0
use crate::constants::{queue::DEFAULT_WORKERS, DEFAULT_BRANCH};
use crate::types::ReconcilerConfig;
use anyhow::{Context, Result};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Operator configuration loaded from environment variables
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Directory holding one YAML reconciler config per file
    pub reconciler_dir: PathBuf,
    /// Store branch the run operates on
    pub branch: String,
    /// Stop after the first quiet period and report a summary
    pub run_once: bool,
    /// Workers per reconciler
    pub workers: usize,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let reconciler_dir = lookup("RECONCILER_DIR")
            .map(PathBuf::from)
            .context("RECONCILER_DIR environment variable not set")?;
        let branch = lookup("BRANCH").unwrap_or_else(|| DEFAULT_BRANCH.to_string());
        let run_once = match lookup("RUN_ONCE") {
            Some(value) => value
                .parse()
                .with_context(|| format!("RUN_ONCE must be true or false, got {}", value))?,
            None => false,
        };
        let workers = match lookup("WORKERS") {
            Some(value) => value
                .parse()
                .with_context(|| format!("WORKERS must be a number, got {}", value))?,
            None => DEFAULT_WORKERS,
        };

        Ok(Config {
            reconciler_dir,
            branch,
            run_once,
            workers,
        })
    }
}

fn is_yaml(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|ext| ext.to_str()),
        Some("yaml") | Some("yml")
    )
}

/// Read every `*.yaml`/`*.yml` file in `dir` as a reconciler config, in file name order
pub fn load_reconciler_configs(dir: &Path) -> Result<Vec<ReconcilerConfig>> {
    let mut paths: Vec<PathBuf> = fs::read_dir(dir)
        .with_context(|| format!("Failed to read reconciler directory {}", dir.display()))?
        .map(|entry| entry.map(|e| e.path()))
        .collect::<std::io::Result<_>>()
        .with_context(|| format!("Failed to list reconciler directory {}", dir.display()))?;
    paths.retain(|path| path.is_file() && is_yaml(path));
    paths.sort();

    let mut configs = Vec::with_capacity(paths.len());
    for path in paths {
        let yaml = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let config = ReconcilerConfig::from_yaml(&yaml)
            .with_context(|| format!("Invalid reconciler config {}", path.display()))?;
        debug!("Loaded reconciler {} from {}", config.name, path.display());
        configs.push(config);
    }
    info!("Loaded {} reconciler configs from {}", configs.len(), dir.display());
    Ok(configs)
}
