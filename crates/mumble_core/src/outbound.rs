/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Canonicalization of author-submitted documents.
//!
//! Identity is derived from the staging key, and each output zone is checked
//! before it is written, so re-running on the same key converges on the same
//! canonical documents.

use crate::activity::ACTIVITY_STREAMS_CONTEXT;
use crate::context::PipelineContext;
use crate::error::{StageError, StageResult};
use crate::id_scheme::{
    derive_unique_part, make_activity_id, make_outbox_key, make_post_id, make_post_object_key,
    username_from_key,
};
use crate::metadata_index::format_published;
use crate::object_store::{load_json, save_json};
use crate::push::expect_zone;
use chrono::Utc;
use mumble_protocol::{ObjectKey, Zone};
use serde_json::{Map, Value};
use tracing::{debug, info};

/// Activity types an author may submit directly.
const AUTHORED_ACTIVITY_TYPES: &[&str] = &[
    "Accept", "Reject", "Follow", "Undo", "Like", "Announce", "Update", "Delete",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundWrites {
    pub object: Option<ObjectKey>,
    pub outbox: ObjectKey,
    pub activity_id: String,
}

pub async fn translate_outbound(ctx: &PipelineContext, key: &ObjectKey) -> StageResult<OutboundWrites> {
    expect_zone(key, Zone::StagingOutbox)?;
    let owner = username_from_key(Zone::StagingOutbox, &key.key)
        .map_err(|e| StageError::malformed(format!("{e:#}")))?;
    let owner_id = ctx.user_id(&owner)?;
    if ctx
        .directory
        .find_user(&owner)
        .await
        .map_err(StageError::from_anyhow)?
        .is_none()
    {
        return Err(StageError::NotFound(format!("no such author: {owner}")));
    }

    let Value::Object(doc) = load_json(ctx.store.as_ref(), key).await? else {
        return Err(StageError::malformed("staged document must be a JSON object"));
    };
    let kind = doc.get("type").and_then(Value::as_str).unwrap_or_default().to_string();
    let writes = match kind.as_str() {
        "Note" => publish_note(ctx, key, &owner, &owner_id, doc).await?,
        k if AUTHORED_ACTIVITY_TYPES.contains(&k) => {
            publish_activity(ctx, key, &owner, &owner_id, doc).await?
        }
        other => return Err(StageError::malformed(format!("cannot publish type {other:?}"))),
    };
    info!(staged = %key.key, kind = %kind, activity = %writes.activity_id, "outbound translated");
    Ok(writes)
}

async fn publish_note(
    ctx: &PipelineContext,
    staged: &ObjectKey,
    owner: &str,
    owner_id: &str,
    mut note: Map<String, Value>,
) -> StageResult<OutboundWrites> {
    let post_unique = derive_unique_part("post", &staged.key);
    let object_key = ObjectKey::new(Zone::Objects, make_post_object_key(owner, &post_unique));

    // The objects write happens first; a re-run picks up its timestamp.
    let note = match existing(ctx, &object_key).await? {
        Some(prev) => prev,
        None => {
            note.insert("@context".into(), ACTIVITY_STREAMS_CONTEXT.into());
            note.insert("id".into(), make_post_id(owner_id, &post_unique).into());
            note.insert("attributedTo".into(), owner_id.into());
            note.insert("published".into(), format_published(Utc::now()).into());
            let note = Value::Object(note);
            save_json(ctx.store.as_ref(), &object_key, &note).await?;
            note
        }
    };

    let activity_unique = derive_unique_part("activity", &staged.key);
    let activity_id = make_activity_id(owner_id, &activity_unique);
    let outbox_key = ObjectKey::new(Zone::Outbox, make_outbox_key(owner, &activity_unique));
    if existing(ctx, &outbox_key).await?.is_none() {
        let mut create = Map::new();
        create.insert("@context".into(), ACTIVITY_STREAMS_CONTEXT.into());
        create.insert("id".into(), activity_id.clone().into());
        create.insert("type".into(), "Create".into());
        create.insert("actor".into(), owner_id.into());
        if let Some(p) = note.get("published") {
            create.insert("published".into(), p.clone());
        }
        for field in ["to", "cc", "bcc"] {
            if let Some(v) = note.get(field) {
                create.insert(field.into(), v.clone());
            }
        }
        let mut embedded = note.clone();
        if let Value::Object(m) = &mut embedded {
            m.remove("@context");
            m.remove("bcc");
        }
        create.insert("object".into(), embedded);
        save_json(ctx.store.as_ref(), &outbox_key, &Value::Object(create)).await?;
    } else {
        debug!(key = %outbox_key.key, "create already in outbox");
    }

    Ok(OutboundWrites {
        object: Some(object_key),
        outbox: outbox_key,
        activity_id,
    })
}

async fn publish_activity(
    ctx: &PipelineContext,
    staged: &ObjectKey,
    owner: &str,
    owner_id: &str,
    mut activity: Map<String, Value>,
) -> StageResult<OutboundWrites> {
    match activity.get("actor").and_then(Value::as_str) {
        None => {
            activity.insert("actor".into(), owner_id.into());
        }
        Some(actor) if actor == owner_id => {}
        Some(actor) => {
            return Err(StageError::malformed(format!("{actor} cannot publish as {owner_id}")));
        }
    }

    let unique = derive_unique_part("activity", &staged.key);
    let activity_id = make_activity_id(owner_id, &unique);
    let outbox_key = ObjectKey::new(Zone::Outbox, make_outbox_key(owner, &unique));
    if existing(ctx, &outbox_key).await?.is_none() {
        activity.insert("@context".into(), ACTIVITY_STREAMS_CONTEXT.into());
        activity.insert("id".into(), activity_id.clone().into());
        activity.insert("published".into(), format_published(Utc::now()).into());
        save_json(ctx.store.as_ref(), &outbox_key, &Value::Object(activity)).await?;
    }
    Ok(OutboundWrites {
        object: None,
        outbox: outbox_key,
        activity_id,
    })
}

async fn existing(ctx: &PipelineContext, key: &ObjectKey) -> StageResult<Option<Value>> {
    match load_json(ctx.store.as_ref(), key).await {
        Ok(v) => Ok(Some(v)),
        Err(StageError::NotFound(_)) => Ok(None),
        Err(e) => Err(e),
    }
}
