// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0
use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use trellis::client::{Branch, KubeResourceClient};
use trellis::config::{load_reconciler_configs, Config};
use trellis::controllers::{CollectorMode, ControllerManager};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Starting trellis controller");

    let config = Config::from_env()?;
    info!(
        "Configuration loaded: reconciler_dir={} branch={} run_once={} workers={}",
        config.reconciler_dir.display(),
        config.branch,
        config.run_once,
        config.workers
    );

    let configs = load_reconciler_configs(&config.reconciler_dir)?;
    let client = Arc::new(KubeResourceClient::from_kubeconfig());
    let mode = if config.run_once {
        CollectorMode::RunOnce
    } else {
        CollectorMode::Continuous
    };

    let manager = ControllerManager::new(configs, client, config.workers, mode)
        .await
        .context("Failed to create reconcilers")?;

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    match manager.run(Branch::new(config.branch), shutdown).await {
        Some(summary) => {
            println!(
                "{}",
                serde_json::to_string_pretty(&summary).context("Failed to serialize run summary")?
            );
            if !summary.success {
                std::process::exit(1);
            }
        }
        None => info!("Controller stopped"),
    }
    Ok(())
}
