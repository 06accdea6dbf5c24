/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! In-process doubles for unit tests.

use crate::actor_resolver::{ActorResolver, RemoteActor};
use crate::change_journal::ChangeJournal;
use crate::config::{PipelineConfig, StagePolicy};
use crate::context::PipelineContext;
use crate::dead_letter::{DeadLetterSink, SqliteDeadLetterSink};
use crate::delivery::InboxDeliverer;
use crate::directory::SqliteUserDirectory;
use crate::error::{StageError, StageResult};
use crate::id_scheme::make_user_id;
use crate::metadata_index::SqliteMetadataIndex;
use crate::object_store::MemoryObjectStore;
use async_trait::async_trait;
use mumble_protocol::DeadLetterRecord;
use reqwest::StatusCode;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const DOMAIN: &str = "mumble.example";

#[derive(Clone)]
enum Canned {
    Actor(RemoteActor),
    Failing,
}

#[derive(Default)]
pub struct StaticActorResolver {
    actors: Mutex<HashMap<String, Canned>>,
}

impl StaticActorResolver {
    pub fn add_actor(&self, id: &str, inbox: &str, shared_inbox: Option<&str>) {
        self.put(
            id,
            Canned::Actor(RemoteActor::Actor {
                id: id.to_string(),
                inbox: inbox.to_string(),
                shared_inbox: shared_inbox.map(str::to_string),
            }),
        );
    }

    pub fn add_gone(&self, id: &str) {
        self.put(id, Canned::Actor(RemoteActor::Gone));
    }

    pub fn add_failing(&self, id: &str) {
        self.put(id, Canned::Failing);
    }

    fn put(&self, id: &str, c: Canned) {
        self.actors.lock().unwrap().insert(id.to_string(), c);
    }
}

#[async_trait]
impl ActorResolver for StaticActorResolver {
    async fn resolve(&self, actor_id: &str) -> StageResult<RemoteActor> {
        let hit = self.actors.lock().unwrap().get(actor_id).cloned();
        match hit {
            Some(Canned::Actor(a)) => Ok(a),
            Some(Canned::Failing) => Err(StageError::transient(format!("resolve {actor_id}: connection reset"))),
            None => Err(StageError::unreachable(actor_id, StatusCode::NOT_FOUND, "")),
        }
    }
}

/// Records every post; can be told to fail for given inboxes and to linger
/// so concurrency is observable.
#[derive(Default)]
pub struct RecordingDeliverer {
    pub delivered: Mutex<Vec<(String, String)>>,
    pub attempts: AtomicUsize,
    failing: Mutex<HashMap<String, StatusCode>>,
    panicking: Mutex<HashSet<String>>,
    delay: Mutex<Duration>,
    in_flight: AtomicUsize,
    pub peak_in_flight: AtomicUsize,
}

impl RecordingDeliverer {
    pub fn fail_with(&self, inbox: &str, status: StatusCode) {
        self.failing.lock().unwrap().insert(inbox.to_string(), status);
    }

    pub fn panic_on(&self, inbox: &str) {
        self.panicking.lock().unwrap().insert(inbox.to_string());
    }

    pub fn heal(&self, inbox: &str) {
        self.failing.lock().unwrap().remove(inbox);
    }

    pub fn set_delay(&self, d: Duration) {
        *self.delay.lock().unwrap() = d;
    }

    pub fn delivered_inboxes(&self) -> HashSet<String> {
        self.delivered.lock().unwrap().iter().map(|(_, i)| i.clone()).collect()
    }
}

#[async_trait]
impl InboxDeliverer for RecordingDeliverer {
    async fn post(&self, sender_actor: &str, inbox: &str, _body: &[u8]) -> StageResult<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let panics = self.panicking.lock().unwrap().contains(inbox);
        if panics {
            panic!("deliverer exploded for {inbox}");
        }
        let failing = self.failing.lock().unwrap().get(inbox).copied();
        if let Some(status) = failing {
            return Err(StageError::unreachable(inbox, status, ""));
        }
        self.delivered
            .lock()
            .unwrap()
            .push((sender_actor.to_string(), inbox.to_string()));
        Ok(())
    }
}

pub struct TestPipeline {
    pub dir: tempfile::TempDir,
    pub ctx: PipelineContext,
    pub store: Arc<MemoryObjectStore>,
    pub journal: Arc<ChangeJournal>,
    pub actors: Arc<StaticActorResolver>,
    pub deliverer: Arc<RecordingDeliverer>,
    pub dead_letters: Arc<SqliteDeadLetterSink>,
}

impl TestPipeline {
    pub async fn new() -> Self {
        Self::with_config(test_config(Some(DOMAIN))).await
    }

    pub async fn without_domain() -> Self {
        Self::with_config(test_config(None)).await
    }

    pub async fn with_config(config: PipelineConfig) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let journal = Arc::new(ChangeJournal::open(dir.path().join("journal.sqlite")).unwrap());
        let store = Arc::new(MemoryObjectStore::new(journal.clone()));
        let index = Arc::new(SqliteMetadataIndex::open(dir.path().join("index.sqlite")).unwrap());
        let directory = Arc::new(SqliteUserDirectory::open(dir.path().join("users.sqlite")).unwrap());
        for user in ["alice", "bob"] {
            directory.insert_user_with_keys(user, "private", "public").await.unwrap();
        }
        let actors = Arc::new(StaticActorResolver::default());
        let deliverer = Arc::new(RecordingDeliverer::default());
        let dead_letters = Arc::new(SqliteDeadLetterSink::open(dir.path().join("dl.sqlite")).unwrap());
        let ctx = PipelineContext {
            config: Arc::new(config),
            store: store.clone(),
            index,
            directory,
            actors: actors.clone(),
            deliverer: deliverer.clone(),
            dead_letters: dead_letters.clone(),
        };
        Self {
            dir,
            ctx,
            store,
            journal,
            actors,
            deliverer,
            dead_letters,
        }
    }

    pub fn user_id(&self, username: &str) -> String {
        make_user_id(DOMAIN, username)
    }

    pub async fn dead_letters_list(&self) -> Vec<DeadLetterRecord> {
        self.dead_letters.list(100, true).await.unwrap()
    }
}

pub fn test_config(domain: Option<&str>) -> PipelineConfig {
    let fast = StagePolicy {
        timeout_secs: 5,
        max_retries: 2,
        base_backoff_ms: 1,
        max_backoff_ms: 5,
    };
    let mut cfg = PipelineConfig {
        domain_name: domain.map(str::to_string),
        router_concurrency: 16,
        journal_poll_ms: 10,
        ..PipelineConfig::default()
    };
    cfg.stages.translate_inbound = fast;
    cfg.stages.stage_response = fast;
    cfg.stages.translate_outbound = fast;
    cfg.stages.push_staged_object = fast;
    cfg.stages.push_activity = fast;
    cfg.stages.expand_recipients = fast;
    cfg.stages.deliver_one = fast;
    cfg
}
