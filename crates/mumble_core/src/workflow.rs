/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Per-zone workflows as an explicit state machine.
//!
//! ```text
//! Inbound:       TranslateInbound -> (StageResponse) -> End
//! StagingOutbox: TranslateOutbound -> End
//! ObjectsZone:   PushStagedObject -> End
//! OutboxZone:    PushActivity -> ExpandRecipients -> FanOut -> End
//! ```
//!
//! Only the work item is carried between steps; everything else is re-read
//! from the object store, so a workflow can be re-run from `Start`.

use crate::context::PipelineContext;
use crate::error::StageResult;
use crate::expand::{expand_recipients, RecipientSet};
use crate::fanout::{FanOutDispatcher, FanOutReport};
use crate::inbound::{stage_response, translate_inbound, StagedResponse};
use crate::outbound::{translate_outbound, OutboundWrites};
use crate::push::{push_activity, push_staged_object, PushOutcome};
use crate::retry::run_stage;
use mumble_protocol::{DeadLetterInput, ObjectKey, WorkItem, Zone};
use serde_json::Value;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkflowKind {
    Inbound,
    StagingOutbox,
    ObjectsZone,
    OutboxZone,
}

impl WorkflowKind {
    /// `None` for zones with no bound behaviour.
    pub fn for_zone(zone: Zone) -> Option<Self> {
        match zone {
            Zone::Inbox => Some(WorkflowKind::Inbound),
            Zone::StagingOutbox => Some(WorkflowKind::StagingOutbox),
            Zone::Objects => Some(WorkflowKind::ObjectsZone),
            Zone::Outbox => Some(WorkflowKind::OutboxZone),
            Zone::Media => None,
        }
    }

    pub fn zone(&self) -> Zone {
        match self {
            WorkflowKind::Inbound => Zone::Inbox,
            WorkflowKind::StagingOutbox => Zone::StagingOutbox,
            WorkflowKind::ObjectsZone => Zone::Objects,
            WorkflowKind::OutboxZone => Zone::Outbox,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            WorkflowKind::Inbound => "inbound",
            WorkflowKind::StagingOutbox => "staging_outbox",
            WorkflowKind::ObjectsZone => "objects_zone",
            WorkflowKind::OutboxZone => "outbox_zone",
        }
    }

    fn start(&self) -> Step {
        match self {
            WorkflowKind::Inbound => Step::TranslateInbound,
            WorkflowKind::StagingOutbox => Step::TranslateOutbound,
            WorkflowKind::ObjectsZone => Step::PushStagedObject,
            WorkflowKind::OutboxZone => Step::PushActivity,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum WorkflowOutcome {
    NoResponse,
    ResponseStaged(ObjectKey),
    Translated(OutboundWrites),
    Pushed(PushOutcome),
    FannedOut(FanOutReport),
}

#[derive(Debug)]
enum Step {
    TranslateInbound,
    StageResponse(StagedResponse),
    TranslateOutbound,
    PushStagedObject,
    PushActivity,
    ExpandRecipients,
    FanOut { activity: Value, recipients: RecipientSet },
    End(WorkflowOutcome),
}

impl Step {
    fn name(&self) -> &'static str {
        match self {
            Step::TranslateInbound => "translate_inbound",
            Step::StageResponse(_) => "stage_response",
            Step::TranslateOutbound => "translate_outbound",
            Step::PushStagedObject => "push_staged_object",
            Step::PushActivity => "push_activity",
            Step::ExpandRecipients => "expand_recipients",
            Step::FanOut { .. } => "fan_out",
            Step::End(_) => "end",
        }
    }
}

pub async fn run_workflow(ctx: &PipelineContext, kind: WorkflowKind, item: &WorkItem) -> StageResult<WorkflowOutcome> {
    let mut step = kind.start();
    loop {
        debug!(workflow = kind.name(), step = step.name(), key = %item.key, "workflow step");
        step = match advance(ctx, item, step).await? {
            Step::End(outcome) => {
                info!(workflow = kind.name(), key = %item.key, "workflow finished");
                return Ok(outcome);
            }
            next => next,
        };
    }
}

async fn advance(ctx: &PipelineContext, item: &WorkItem, step: Step) -> StageResult<Step> {
    let key = item.object_key();
    let input = DeadLetterInput::WorkItem { item: item.clone() };
    let stages = &ctx.config.stages;
    let sink = ctx.dead_letters.as_ref();

    let next = match step {
        Step::TranslateInbound => {
            match run_stage("translate_inbound", &stages.translate_inbound, &input, sink, || {
                translate_inbound(ctx, &key)
            })
            .await?
            {
                Some(response) => Step::StageResponse(response),
                None => Step::End(WorkflowOutcome::NoResponse),
            }
        }
        Step::StageResponse(response) => {
            let staged = run_stage("stage_response", &stages.stage_response, &input, sink, || {
                stage_response(ctx, &key, &response)
            })
            .await?;
            Step::End(WorkflowOutcome::ResponseStaged(staged))
        }
        Step::TranslateOutbound => {
            let writes = run_stage("translate_outbound", &stages.translate_outbound, &input, sink, || {
                translate_outbound(ctx, &key)
            })
            .await?;
            Step::End(WorkflowOutcome::Translated(writes))
        }
        Step::PushStagedObject => {
            let outcome = run_stage("push_staged_object", &stages.push_staged_object, &input, sink, || {
                push_staged_object(ctx, &key)
            })
            .await?;
            Step::End(WorkflowOutcome::Pushed(outcome))
        }
        Step::PushActivity => {
            run_stage("push_activity", &stages.push_activity, &input, sink, || push_activity(ctx, &key)).await?;
            Step::ExpandRecipients
        }
        Step::ExpandRecipients => {
            let expansion = run_stage("expand_recipients", &stages.expand_recipients, &input, sink, || {
                expand_recipients(ctx, &key)
            })
            .await?;
            Step::FanOut {
                activity: expansion.activity.into_value(),
                recipients: expansion.recipients,
            }
        }
        Step::FanOut { activity, recipients } => {
            let report = FanOutDispatcher::from_context(ctx)
                .dispatch(ctx, &activity, recipients)
                .await;
            Step::End(WorkflowOutcome::FannedOut(report))
        }
        end @ Step::End(_) => end,
    };
    Ok(next)
}
