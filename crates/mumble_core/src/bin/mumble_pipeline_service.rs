/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use anyhow::{Context, Result};
use mumble_core::{PipelineConfig, PipelineRuntime};
use std::path::PathBuf;
use tokio::sync::watch;
use tracing::{error, info};

/// `--config <path>` wins over `MUMBLE_CONFIG`; with neither, defaults plus env.
fn parse_config_path(args: &[String]) -> Result<Option<PathBuf>> {
    let mut it = args.iter();
    while let Some(arg) = it.next() {
        if arg == "--config" {
            return match it.next() {
                Some(path) => Ok(Some(PathBuf::from(path))),
                None => Err(anyhow::anyhow!("--config requires a path")),
            };
        }
    }
    if let Ok(path) = std::env::var("MUMBLE_CONFIG") {
        if !path.trim().is_empty() {
            return Ok(Some(PathBuf::from(path.trim())));
        }
    }
    Ok(None)
}

fn positional(args: &[String]) -> Vec<&str> {
    let mut out = Vec::new();
    let mut it = args.iter();
    while let Some(arg) = it.next() {
        if arg == "--config" {
            it.next();
            continue;
        }
        out.push(arg.as_str());
    }
    out
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let cfg_path = parse_config_path(&args)?;
    let cfg = PipelineConfig::load(cfg_path.as_deref())?;
    let runtime = PipelineRuntime::open(cfg).context("open pipeline")?;

    if let ["create-user", username] = positional(&args).as_slice() {
        let user = runtime.directory.create_user(username).await?;
        info!(username = %user.username, id = %runtime.context().user_id(&user.username)?, "user created");
        return Ok(());
    }

    let (stop_tx, stop_rx) = watch::channel(false);
    let handle = runtime.start(stop_rx)?;

    tokio::signal::ctrl_c().await.context("wait for ctrl-c")?;
    info!("shutdown requested");
    let _ = stop_tx.send(true);
    if let Err(e) = handle.await {
        error!(error = %e, "router task failed");
    }
    info!("pipeline stopped");
    Ok(())
}
