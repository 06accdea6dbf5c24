/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::actor_resolver::HttpActorResolver;
use crate::change_journal::ChangeJournal;
use crate::config::PipelineConfig;
use crate::context::PipelineContext;
use crate::dead_letter::{DeadLetterSink, SqliteDeadLetterSink};
use crate::delivery::HttpDeliverer;
use crate::directory::SqliteUserDirectory;
use crate::error::StageError;
use crate::fanout::deliver_one;
use crate::metadata_index::SqliteMetadataIndex;
use crate::object_store::FsObjectStore;
use crate::retry::run_stage;
use crate::router::ChangeRouter;
use crate::workflow::{run_workflow, WorkflowKind};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use mumble_protocol::{DeadLetterInput, DeadLetterRecord};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Everything the pipeline needs, opened from a validated config.
pub struct PipelineRuntime {
    ctx: PipelineContext,
    journal: Arc<ChangeJournal>,
    pub directory: Arc<SqliteUserDirectory>,
}

impl PipelineRuntime {
    pub fn open(config: PipelineConfig) -> Result<Self> {
        if let Err(e) = config.validate() {
            error!(alert = true, error = %e, "invalid pipeline configuration");
            return Err(e.into());
        }
        let domain = config.domain_name()?.to_string();
        std::fs::create_dir_all(&config.data_dir)
            .with_context(|| format!("create data dir: {}", config.data_dir.display()))?;

        let journal = Arc::new(ChangeJournal::open(config.journal_db_path())?);
        let store = Arc::new(FsObjectStore::open(config.objects_dir(), journal.clone())?);
        let index = Arc::new(SqliteMetadataIndex::open(config.index_db_path())?);
        let directory = Arc::new(SqliteUserDirectory::open(config.users_db_path())?);
        let dead_letters = Arc::new(SqliteDeadLetterSink::open(config.dead_letter_db_path())?);

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.http_timeout_secs.clamp(1, 300)))
            .user_agent(concat!("mumble/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("build http client")?;
        let actors = Arc::new(HttpActorResolver::new(
            http.clone(),
            Duration::from_secs(config.actor_cache_ttl_secs),
        ));
        let deliverer = Arc::new(HttpDeliverer::new(http, directory.clone(), &domain));

        let ctx = PipelineContext {
            config: Arc::new(config),
            store,
            index,
            directory: directory.clone(),
            actors,
            deliverer,
            dead_letters,
        };
        Ok(Self {
            ctx,
            journal,
            directory,
        })
    }

    pub fn context(&self) -> &PipelineContext {
        &self.ctx
    }

    /// Starts the change router over the change journal.
    pub fn start(&self, shutdown: watch::Receiver<bool>) -> Result<JoinHandle<()>> {
        let router = ChangeRouter::new()?;
        info!(
            domain = self.ctx.config.domain_name.as_deref().unwrap_or_default(),
            data_dir = %self.ctx.config.data_dir.display(),
            "pipeline started"
        );
        Ok(tokio::spawn(router.run(self.ctx.clone(), self.journal.clone(), shutdown)))
    }
}

/// Sink used while replaying one record: a renewed failure of the same input
/// updates that record instead of opening a second one.
struct ReplaySink {
    inner: Arc<dyn DeadLetterSink>,
    replaying: DeadLetterRecord,
}

#[async_trait]
impl DeadLetterSink for ReplaySink {
    async fn record(
        &self,
        stage: &str,
        input: &DeadLetterInput,
        error: &StageError,
        attempts: u32,
    ) -> Result<String> {
        let id = &self.replaying.id;
        if *input == self.replaying.input && self.inner.refresh(id, stage, error, attempts).await? {
            return Ok(id.clone());
        }
        self.inner.record(stage, input, error, attempts).await
    }

    async fn list(&self, limit: u32, include_replayed: bool) -> Result<Vec<DeadLetterRecord>> {
        self.inner.list(limit, include_replayed).await
    }

    async fn get(&self, id: &str) -> Result<Option<DeadLetterRecord>> {
        self.inner.get(id).await
    }

    async fn mark_replayed(&self, id: &str) -> Result<bool> {
        self.inner.mark_replayed(id).await
    }

    async fn refresh(&self, id: &str, stage: &str, error: &StageError, attempts: u32) -> Result<bool> {
        self.inner.refresh(id, stage, error, attempts).await
    }
}

/// Re-runs a dead-lettered input and marks the record replayed on success.
/// A failed replay leaves the record open with its error and attempt count
/// updated.
pub async fn replay_dead_letter(ctx: &PipelineContext, id: &str) -> Result<()> {
    let record = ctx
        .dead_letters
        .get(id)
        .await?
        .ok_or_else(|| anyhow!("no such dead letter: {id}"))?;
    if record.replayed_at_ms.is_some() {
        return Err(anyhow!("dead letter {id} was already replayed"));
    }
    let mut replay_ctx = ctx.clone();
    replay_ctx.dead_letters = Arc::new(ReplaySink {
        inner: ctx.dead_letters.clone(),
        replaying: record.clone(),
    });
    let ctx = &replay_ctx;
    match &record.input {
        DeadLetterInput::WorkItem { item } => {
            let kind = WorkflowKind::for_zone(item.zone)
                .ok_or_else(|| anyhow!("no workflow for zone {}", item.zone))?;
            run_workflow(ctx, kind, item).await?;
        }
        DeadLetterInput::Delivery { attempt } => {
            run_stage(
                "deliver_one",
                &ctx.config.stages.deliver_one,
                &record.input,
                ctx.dead_letters.as_ref(),
                || deliver_one(ctx, attempt),
            )
            .await?;
        }
        DeadLetterInput::Raw { .. } => {
            return Err(anyhow!("dead letter {id} has no replayable input"));
        }
    }
    ctx.dead_letters.mark_replayed(id).await?;
    info!(id, stage = %record.stage, "dead letter replayed");
    Ok(())
}
