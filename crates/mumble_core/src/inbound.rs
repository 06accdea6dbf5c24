/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::activity::{Activity, ObjectRef, ACTIVITY_STREAMS_CONTEXT};
use crate::context::PipelineContext;
use crate::error::{StageError, StageResult};
use crate::id_scheme::{derive_unique_part, make_staging_outbox_key, username_from_key};
use crate::object_store::{load_json, save_json};
use crate::push::{expect_zone, record_reply};
use mumble_protocol::{ObjectKey, Zone};
use serde_json::{json, Value};
use tracing::{debug, info};

/// A response activity that must be authored on behalf of the inbox owner.
#[derive(Debug, Clone, PartialEq)]
pub struct StagedResponse {
    pub owner: String,
    pub activity: Value,
}

pub async fn translate_inbound(
    ctx: &PipelineContext,
    key: &ObjectKey,
) -> StageResult<Option<StagedResponse>> {
    expect_zone(key, Zone::Inbox)?;
    let owner = username_from_key(Zone::Inbox, &key.key)
        .map_err(|e| StageError::malformed(format!("{e:#}")))?;
    if ctx
        .directory
        .find_user(&owner)
        .await
        .map_err(StageError::from_anyhow)?
        .is_none()
    {
        return Err(StageError::NotFound(format!("no such inbox owner: {owner}")));
    }
    let owner_id = ctx.user_id(&owner)?;
    let activity = Activity::parse(load_json(ctx.store.as_ref(), key).await?)?;

    match activity.kind() {
        "Follow" => on_follow(ctx, &owner, &owner_id, activity).await.map(Some),
        "Undo" => {
            on_undo(ctx, &owner, &owner_id, &activity).await?;
            Ok(None)
        }
        "Create" => {
            if let Some(obj) = activity.object().as_ref().and_then(ObjectRef::inline) {
                if record_reply(ctx, obj).await? {
                    info!(key = %key.key, actor = activity.actor(), "reply recorded");
                }
            }
            Ok(None)
        }
        other => {
            debug!(key = %key.key, kind = other, "inbound activity ignored");
            Ok(None)
        }
    }
}

async fn on_follow(
    ctx: &PipelineContext,
    owner: &str,
    owner_id: &str,
    follow: Activity,
) -> StageResult<StagedResponse> {
    let target = follow.object().and_then(|o| o.id().map(str::to_string));
    if target.as_deref() != Some(owner_id) {
        return Err(StageError::malformed(format!(
            "follow of {target:?} delivered to the inbox of {owner_id}"
        )));
    }
    let follower = follow.actor().to_string();
    let added = ctx
        .directory
        .add_follower(owner, &follower)
        .await
        .map_err(StageError::from_anyhow)?;
    info!(owner, follower = %follower, added, "follow accepted");

    Ok(StagedResponse {
        owner: owner.to_string(),
        activity: json!({
            "@context": ACTIVITY_STREAMS_CONTEXT,
            "type": "Accept",
            "actor": owner_id,
            "to": [follower],
            "object": follow.into_value(),
        }),
    })
}

async fn on_undo(ctx: &PipelineContext, owner: &str, owner_id: &str, undo: &Activity) -> StageResult<()> {
    let Some(object) = undo.object() else {
        return Err(StageError::malformed("undo without object"));
    };
    let Some(inner) = object.inline() else {
        debug!(owner, "undo by reference ignored");
        return Ok(());
    };
    let inner = Activity::parse(inner.clone())?;
    if inner.kind() != "Follow" {
        debug!(owner, kind = inner.kind(), "undo of unsupported activity ignored");
        return Ok(());
    }
    if inner.actor() != undo.actor() {
        return Err(StageError::malformed("undo of a follow by a different actor"));
    }
    if inner.object().and_then(|o| o.id().map(str::to_string)).as_deref() != Some(owner_id) {
        return Err(StageError::malformed("undo of a follow of another user"));
    }
    let removed = ctx
        .directory
        .remove_follower(owner, undo.actor())
        .await
        .map_err(StageError::from_anyhow)?;
    info!(owner, follower = undo.actor(), removed, "follow undone");
    Ok(())
}

/// Writes the response into the owner's staging area under a key derived
/// from the inbox key, so a re-run rewrites the same object.
pub async fn stage_response(
    ctx: &PipelineContext,
    inbox_key: &ObjectKey,
    response: &StagedResponse,
) -> StageResult<ObjectKey> {
    let unique = derive_unique_part("response", &inbox_key.key);
    let key = ObjectKey::new(
        Zone::StagingOutbox,
        make_staging_outbox_key(&response.owner, &unique),
    );
    save_json(ctx.store.as_ref(), &key, &response.activity).await?;
    debug!(inbox = %inbox_key.key, staged = %key.key, "response staged");
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id_scheme::make_inbox_key;
    use crate::test_support::TestPipeline;

    async fn deliver(t: &TestPipeline, owner: &str, name: &str, doc: Value) -> ObjectKey {
        let key = ObjectKey::new(Zone::Inbox, make_inbox_key(owner, name));
        save_json(t.ctx.store.as_ref(), &key, &doc).await.unwrap();
        key
    }

    #[tokio::test]
    async fn follow_adds_follower_and_answers_accept() {
        let t = TestPipeline::new().await;
        let follow = json!({
            "id": "https://remote.example/follows/1",
            "type": "Follow",
            "actor": "https://remote.example/users/bob",
            "object": t.user_id("alice"),
        });
        let key = deliver(&t, "alice", "f1", follow.clone()).await;
        let response = translate_inbound(&t.ctx, &key).await.unwrap().unwrap();
        assert_eq!(response.owner, "alice");
        assert_eq!(response.activity["type"], "Accept");
        assert_eq!(response.activity["actor"], t.user_id("alice"));
        assert_eq!(response.activity["object"], follow);

        let page = t.ctx.directory.followers_page("alice", None, 10).await.unwrap();
        assert_eq!(page.items, vec!["https://remote.example/users/bob".to_string()]);

        let a = stage_response(&t.ctx, &key, &response).await.unwrap();
        let b = stage_response(&t.ctx, &key, &response).await.unwrap();
        assert_eq!(a, b);
        assert!(a.key.starts_with("staging/users/alice/"));
        assert_eq!(t.store.keys_with_prefix("staging/").len(), 1);
    }

    #[tokio::test]
    async fn follow_for_someone_else_is_malformed() {
        let t = TestPipeline::new().await;
        let key = deliver(
            &t,
            "alice",
            "f2",
            json!({"type": "Follow", "actor": "https://remote.example/users/bob", "object": t.user_id("carol")}),
        )
        .await;
        assert!(matches!(translate_inbound(&t.ctx, &key).await, Err(StageError::MalformedInput(_))));
    }

    #[tokio::test]
    async fn undo_follow_removes_follower() {
        let t = TestPipeline::new().await;
        t.ctx.directory.add_follower("alice", "https://remote.example/users/bob").await.unwrap();
        let key = deliver(
            &t,
            "alice",
            "u1",
            json!({
                "type": "Undo",
                "actor": "https://remote.example/users/bob",
                "object": {"type": "Follow", "actor": "https://remote.example/users/bob", "object": t.user_id("alice")},
            }),
        )
        .await;
        assert!(translate_inbound(&t.ctx, &key).await.unwrap().is_none());
        assert!(t.ctx.directory.followers_page("alice", None, 10).await.unwrap().items.is_empty());
    }

    #[tokio::test]
    async fn unknown_owner_and_bad_documents() {
        let t = TestPipeline::new().await;
        let key = deliver(&t, "nobody", "x", json!({"type": "Like", "actor": "a"})).await;
        assert!(matches!(translate_inbound(&t.ctx, &key).await, Err(StageError::NotFound(_))));
        let key = deliver(&t, "alice", "y", json!({"actor": "a"})).await;
        assert!(matches!(translate_inbound(&t.ctx, &key).await, Err(StageError::MalformedInput(_))));
        let key = deliver(&t, "alice", "z", json!({"type": "Like", "actor": "a", "object": "b"})).await;
        assert!(translate_inbound(&t.ctx, &key).await.unwrap().is_none());
    }
}
