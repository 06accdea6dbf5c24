/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::error::{StageError, StageResult};
use async_trait::async_trait;
use reqwest::header::ACCEPT;
use reqwest::StatusCode;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

pub const ACTIVITY_JSON_ACCEPT: &str =
    "application/activity+json, application/ld+json; profile=\"https://www.w3.org/ns/activitystreams\"";

/// What a remote id turned out to be.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteActor {
    Actor {
        id: String,
        inbox: String,
        shared_inbox: Option<String>,
    },
    /// A collection; we do not deliver to those.
    Collection,
    /// The remote answered 410.
    Gone,
}

impl RemoteActor {
    /// `sharedInbox` when advertised, otherwise the personal inbox.
    pub fn delivery_inbox(&self) -> Option<&str> {
        match self {
            RemoteActor::Actor {
                inbox,
                shared_inbox,
                ..
            } => Some(shared_inbox.as_deref().unwrap_or(inbox)),
            RemoteActor::Collection | RemoteActor::Gone => None,
        }
    }
}

#[async_trait]
pub trait ActorResolver: Send + Sync {
    async fn resolve(&self, actor_id: &str) -> StageResult<RemoteActor>;
}

#[derive(Debug, Deserialize)]
struct ActorDoc {
    id: Option<String>,
    #[serde(rename = "type")]
    kind: Option<String>,
    inbox: Option<String>,
    endpoints: Option<Endpoints>,
}

#[derive(Debug, Deserialize)]
struct Endpoints {
    #[serde(rename = "sharedInbox")]
    shared_inbox: Option<String>,
}

#[derive(Clone)]
struct CachedActor {
    actor: RemoteActor,
    expires_at: Instant,
}

/// Fetches actor documents over HTTP and keeps them for `ttl`.
#[derive(Clone)]
pub struct HttpActorResolver {
    client: reqwest::Client,
    ttl: Duration,
    cache: Arc<RwLock<HashMap<String, CachedActor>>>,
}

impl HttpActorResolver {
    pub fn new(client: reqwest::Client, ttl: Duration) -> Self {
        Self {
            client,
            ttl,
            cache: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    async fn get_cached(&self, actor_id: &str) -> Option<RemoteActor> {
        let mut cache = self.cache.write().await;
        if let Some(v) = cache.get(actor_id) {
            if v.expires_at > Instant::now() {
                return Some(v.actor.clone());
            }
        }
        cache.remove(actor_id);
        None
    }

    async fn put_cached(&self, actor_id: &str, actor: RemoteActor) {
        self.cache.write().await.insert(
            actor_id.to_string(),
            CachedActor {
                actor,
                expires_at: Instant::now() + self.ttl,
            },
        );
    }
}

#[async_trait]
impl ActorResolver for HttpActorResolver {
    async fn resolve(&self, actor_id: &str) -> StageResult<RemoteActor> {
        if let Some(hit) = self.get_cached(actor_id).await {
            return Ok(hit);
        }

        let resp = self
            .client
            .get(actor_id)
            .header(ACCEPT, ACTIVITY_JSON_ACCEPT)
            .send()
            .await?;
        let status = resp.status();
        if status == StatusCode::GONE {
            self.put_cached(actor_id, RemoteActor::Gone).await;
            return Ok(RemoteActor::Gone);
        }
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(StageError::unreachable(actor_id, status, &text));
        }
        let text = resp.text().await?;
        let actor = parse_actor_document(actor_id, &text)?;
        self.put_cached(actor_id, actor.clone()).await;
        Ok(actor)
    }
}

pub fn parse_actor_document(actor_id: &str, text: &str) -> StageResult<RemoteActor> {
    let doc: ActorDoc = serde_json::from_str(text)
        .map_err(|e| StageError::malformed(format!("actor json from {actor_id}: {e}")))?;
    if matches!(
        doc.kind.as_deref(),
        Some("Collection" | "OrderedCollection" | "CollectionPage" | "OrderedCollectionPage")
    ) {
        return Ok(RemoteActor::Collection);
    }
    let inbox = doc
        .inbox
        .filter(|s| !s.is_empty())
        .ok_or_else(|| StageError::malformed(format!("actor missing inbox: {actor_id}")))?;
    Ok(RemoteActor::Actor {
        id: doc.id.unwrap_or_else(|| actor_id.to_string()),
        inbox,
        shared_inbox: doc
            .endpoints
            .and_then(|e| e.shared_inbox)
            .filter(|s| !s.is_empty()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unreachable_host_is_a_retryable_recipient_failure() {
        let resolver = HttpActorResolver::new(reqwest::Client::new(), Duration::from_secs(60));
        let err = resolver.resolve("http://127.0.0.1:1/users/bob").await.unwrap_err();
        assert_eq!(err.kind(), "recipient_unreachable");
        assert!(err.is_retryable());
        assert!(err.to_string().contains("127.0.0.1:1/users/bob"));
    }

    #[test]
    fn prefers_shared_inbox() {
        let a = parse_actor_document(
            "https://r.example/users/bob",
            r#"{"id":"https://r.example/users/bob","type":"Person","inbox":"https://r.example/users/bob/inbox","endpoints":{"sharedInbox":"https://r.example/inbox"}}"#,
        )
        .unwrap();
        assert_eq!(a.delivery_inbox(), Some("https://r.example/inbox"));

        let b = parse_actor_document(
            "https://r.example/users/carol",
            r#"{"type":"Person","inbox":"https://r.example/users/carol/inbox"}"#,
        )
        .unwrap();
        assert_eq!(b.delivery_inbox(), Some("https://r.example/users/carol/inbox"));
    }

    #[test]
    fn collections_and_broken_documents() {
        let c = parse_actor_document("x", r#"{"type":"OrderedCollection","totalItems":3}"#).unwrap();
        assert_eq!(c, RemoteActor::Collection);
        assert_eq!(c.delivery_inbox(), None);
        assert!(parse_actor_document("x", r#"{"type":"Person"}"#).is_err());
        assert!(parse_actor_document("x", "<html>").is_err());
    }
}
