/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::activity::Activity;
use crate::actor_resolver::RemoteActor;
use crate::context::PipelineContext;
use crate::error::{StageError, StageResult};
use crate::expand::RecipientSet;
use crate::retry::run_stage;
use futures_util::FutureExt;
use mumble_protocol::{DeadLetterInput, DeliveryAttempt, Recipient};
use reqwest::StatusCode;
use serde_json::Value;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info};

/// Pushes one activity to one recipient. Built from the attempt alone, so
/// every retry sends the same bytes.
pub async fn deliver_one(ctx: &PipelineContext, attempt: &DeliveryAttempt) -> StageResult<()> {
    let activity = Activity::parse(attempt.activity.clone())?;
    if !activity.is_deliverable() {
        return Err(StageError::malformed("activity is missing @context, id or type"));
    }
    if attempt.recipient.uri().trim().is_empty() {
        return Err(StageError::malformed("empty recipient"));
    }
    let inbox = match &attempt.recipient {
        Recipient::Inbox(inbox) => inbox.clone(),
        Recipient::Actor(actor) => lookup_inbox(ctx, actor).await?,
    };
    ctx.deliverer
        .post(activity.actor(), &inbox, &activity.to_vec())
        .await
}

async fn lookup_inbox(ctx: &PipelineContext, actor: &str) -> StageResult<String> {
    match ctx.actors.resolve(actor).await? {
        found @ RemoteActor::Actor { .. } => found
            .delivery_inbox()
            .map(str::to_string)
            .ok_or_else(|| StageError::malformed(format!("{actor} advertises no inbox"))),
        RemoteActor::Gone => Err(StageError::unreachable(actor, StatusCode::GONE, "")),
        RemoteActor::Collection => Err(StageError::malformed(format!("{actor} is a collection, not an actor"))),
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FanOutReport {
    pub invoked: usize,
    pub delivered: usize,
    /// Recipients whose attempt ended in the dead-letter sink.
    pub failed: Vec<String>,
}

/// Runs Deliver-One per recipient with at most `ceiling` in flight.
///
/// One recipient's failure never aborts its siblings; it is retried under the
/// deliver policy and then dead-lettered on its own.
#[derive(Debug, Clone, Copy)]
pub struct FanOutDispatcher {
    ceiling: usize,
}

impl FanOutDispatcher {
    pub fn new(ceiling: usize) -> Self {
        Self {
            ceiling: ceiling.max(1),
        }
    }

    pub fn from_context(ctx: &PipelineContext) -> Self {
        Self::new(ctx.config.fanout_concurrency)
    }

    pub async fn dispatch(&self, ctx: &PipelineContext, activity: &Value, recipients: RecipientSet) -> FanOutReport {
        let permits = Arc::new(Semaphore::new(self.ceiling));
        let mut tasks = JoinSet::new();
        let mut report = FanOutReport::default();

        for recipient in recipients.into_vec() {
            let permit = match permits.clone().acquire_owned().await {
                Ok(p) => p,
                Err(_) => break,
            };
            report.invoked += 1;
            let ctx = ctx.clone();
            let attempt = DeliveryAttempt {
                activity: activity.clone(),
                recipient,
            };
            tasks.spawn(async move {
                let _permit = permit;
                let input = DeadLetterInput::Delivery {
                    attempt: attempt.clone(),
                };
                let policy = ctx.config.stages.deliver_one;
                let run = run_stage("deliver_one", &policy, &input, ctx.dead_letters.as_ref(), || {
                    deliver_one(&ctx, &attempt)
                });
                let result = match AssertUnwindSafe(run).catch_unwind().await {
                    Ok(result) => result,
                    Err(_) => {
                        let err = StageError::transient("delivery task panicked");
                        match ctx.dead_letters.record("deliver_one", &input, &err, 1).await {
                            Ok(id) => error!(recipient = %attempt.recipient, dead_letter = %id, "delivery panicked"),
                            Err(e) => error!(recipient = %attempt.recipient, sink_error = %e, "delivery panicked and dead-letter write failed"),
                        }
                        Err(err)
                    }
                };
                (attempt.recipient, result)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((recipient, Ok(()))) => {
                    debug!(recipient = %recipient, "delivery done");
                    report.delivered += 1;
                }
                Ok((recipient, Err(_))) => report.failed.push(recipient.uri().to_string()),
                Err(e) => error!(error = %e, "delivery task cancelled"),
            }
        }
        info!(
            invoked = report.invoked,
            delivered = report.delivered,
            failed = report.failed.len(),
            "fan-out finished"
        );
        report
    }
}
