/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use anyhow::{anyhow, Context, Result};
use mumble_core::dead_letter::DeadLetterSink;
use mumble_core::{replay_dead_letter, PipelineConfig, PipelineRuntime};
use std::path::PathBuf;

const USAGE: &str = "usage: mumble_dead_letters [--config <path>] (list [limit] [--all] | show <id> | replay <id>)";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let mut cfg_path = std::env::var("MUMBLE_CONFIG")
        .ok()
        .filter(|p| !p.trim().is_empty())
        .map(PathBuf::from);
    let mut include_replayed = false;
    let mut rest = Vec::new();
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" => cfg_path = Some(PathBuf::from(args.next().ok_or_else(|| anyhow!("--config requires a path"))?)),
            "--all" => include_replayed = true,
            _ => rest.push(arg),
        }
    }

    let cfg = PipelineConfig::load(cfg_path.as_deref())?;
    let runtime = PipelineRuntime::open(cfg).context("open pipeline")?;
    let ctx = runtime.context();

    match rest.iter().map(String::as_str).collect::<Vec<_>>().as_slice() {
        ["list"] | ["list", _] => {
            let limit = match rest.get(1) {
                Some(n) => n.parse::<u32>().with_context(|| format!("bad limit: {n}"))?,
                None => 50,
            };
            for r in ctx.dead_letters.list(limit, include_replayed).await? {
                let replayed = if r.replayed_at_ms.is_some() { " (replayed)" } else { "" };
                println!(
                    "{}  {}  {}  attempts={}  {}{}",
                    r.id, r.stage, r.error_kind, r.attempts, r.last_error, replayed
                );
            }
        }
        ["show", id] => {
            let record = ctx
                .dead_letters
                .get(id)
                .await?
                .ok_or_else(|| anyhow!("no such dead letter: {id}"))?;
            println!("{}", serde_json::to_string_pretty(&record)?);
        }
        ["replay", id] => {
            replay_dead_letter(ctx, id).await?;
            println!("replayed {id}");
        }
        _ => return Err(anyhow!(USAGE)),
    }
    Ok(())
}
