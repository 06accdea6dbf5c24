/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Index commits: objects-zone posts and outbox activities.

use crate::activity::{in_reply_to, is_public_document, Activity};
use crate::context::PipelineContext;
use crate::error::{StageError, StageResult};
use crate::id_scheme::{parse_user_object_key, parse_user_post_id, parse_user_activity_id, username_from_key};
use crate::metadata_index::{
    object_partition_key, parse_published, ActivityMetadata, ObjectMetadata, ReplyRow,
};
use crate::object_store::load_json;
use mumble_protocol::{ObjectKey, Zone};
use serde_json::Value;
use tracing::{debug, info};

/// Index category of a post row; object keys use the plural `posts`.
pub const POST_CATEGORY: &str = "post";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushOutcome {
    Indexed { pk: String, inserted: bool },
    /// Categories without index rows (media).
    Skipped,
}

pub async fn push_staged_object(ctx: &PipelineContext, key: &ObjectKey) -> StageResult<PushOutcome> {
    expect_zone(key, Zone::Objects)?;
    let (username, category, unique, _ext) =
        parse_user_object_key(&key.key).map_err(|e| StageError::malformed(format!("{e:#}")))?;
    match category.as_str() {
        "posts" => {}
        "media" => {
            debug!(key = %key.key, "media object, nothing to index");
            return Ok(PushOutcome::Skipped);
        }
        other => return Err(StageError::malformed(format!("unsupported object category: {other}"))),
    }

    let doc = load_json(ctx.store.as_ref(), key).await?;
    let Value::Object(map) = &doc else {
        return Err(StageError::malformed("object must be a JSON object"));
    };
    let kind = map.get("type").and_then(Value::as_str).unwrap_or_default();
    if kind != "Note" {
        return Err(StageError::malformed(format!("only Note can be pushed, got {kind:?}")));
    }
    let id = map
        .get("id")
        .and_then(Value::as_str)
        .ok_or_else(|| StageError::malformed("object has no id"))?;
    let (_, id_user, id_unique) =
        parse_user_post_id(id).map_err(|e| StageError::malformed(format!("{e:#}")))?;
    if id_user != username || id_unique != unique {
        return Err(StageError::malformed(format!("object id {id} does not match key {}", key.key)));
    }
    let published = map.get("published").and_then(Value::as_str).unwrap_or_default();

    let row = ObjectMetadata::new(&username, POST_CATEGORY, &unique, id, kind, published, is_public_document(map));
    let inserted = ctx
        .index
        .append_object(&row)
        .await
        .map_err(StageError::from_anyhow)?;
    // Only after the object row, so a reply never points at an unindexed post.
    record_reply(ctx, &doc).await?;

    info!(key = %key.key, pk = %row.pk, inserted, "object indexed");
    Ok(PushOutcome::Indexed { pk: row.pk, inserted })
}

/// Appends a reply row under the local post `object` replies to, if any.
/// Returns whether a new row was written.
pub(crate) async fn record_reply(ctx: &PipelineContext, object: &Value) -> StageResult<bool> {
    let Some(parent) = in_reply_to(object) else {
        return Ok(false);
    };
    let domain = ctx.domain_name()?;
    let Ok((parent_domain, owner, unique)) = parse_user_post_id(&parent) else {
        return Ok(false);
    };
    if parent_domain != domain {
        return Ok(false);
    }
    let Some(reply_id) = object.get("id").and_then(Value::as_str) else {
        return Err(StageError::malformed("reply has no id"));
    };
    let pk = object_partition_key(&owner, POST_CATEGORY, &unique);
    let found = ctx
        .index
        .find_object(&pk)
        .await
        .map_err(StageError::from_anyhow)?;
    if found.is_none() {
        debug!(parent = %parent, "reply to unknown local post ignored");
        return Ok(false);
    }
    let published = object.get("published").and_then(Value::as_str).unwrap_or_default();
    ctx.index
        .append_reply(&ReplyRow::new(&pk, reply_id, published))
        .await
        .map_err(StageError::from_anyhow)
}

pub async fn push_activity(ctx: &PipelineContext, key: &ObjectKey) -> StageResult<ActivityMetadata> {
    expect_zone(key, Zone::Outbox)?;
    let owner = username_from_key(Zone::Outbox, &key.key)
        .map_err(|e| StageError::malformed(format!("{e:#}")))?;
    let activity = Activity::parse(load_json(ctx.store.as_ref(), key).await?)?;
    let id = activity
        .id()
        .ok_or_else(|| StageError::malformed("outbound activity has no id"))?;
    let (_, id_owner, unique) =
        parse_user_activity_id(id).map_err(|e| StageError::malformed(format!("{e:#}")))?;
    if id_owner != owner {
        return Err(StageError::malformed(format!("activity {id} is not owned by {owner}")));
    }
    let published = activity
        .published()
        .ok_or_else(|| StageError::malformed("outbound activity has no published"))
        .and_then(|p| parse_published(p).map_err(|e| StageError::malformed(format!("{e:#}"))))?;

    let row = ActivityMetadata::new(&owner, id, &unique, activity.kind(), published, activity.is_public());
    let inserted = ctx
        .index
        .append_activity(&row)
        .await
        .map_err(StageError::from_anyhow)?;
    ctx.directory
        .update_last_activity(&owner, published)
        .await
        .map_err(StageError::from_anyhow)?;
    debug!(key = %key.key, pk = %row.pk, sk = %row.sk, inserted, "activity indexed");
    Ok(row)
}

pub(crate) fn expect_zone(key: &ObjectKey, zone: Zone) -> StageResult<()> {
    if key.zone != zone || !key.key.starts_with(zone.prefix()) {
        return Err(StageError::malformed(format!("expected a {zone} key, got {key}")));
    }
    Ok(())
}
