/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::change_journal::ChangeJournal;
use crate::context::PipelineContext;
use crate::error::StageError;
use crate::workflow::{run_workflow, WorkflowKind};
use anyhow::{anyhow, Result};
use futures_util::FutureExt;
use mumble_protocol::{DeadLetterInput, ObjectCreated, WorkItem, WorkflowInput, Zone};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkflowInvocation {
    pub kind: WorkflowKind,
    pub item: WorkItem,
    pub input: WorkflowInput,
}

/// Maps object-created notifications to the workflow bound to their zone.
///
/// Holds no per-notification state; several routers may drain the same
/// journal, which only adds duplicate invocations that every stage tolerates.
#[derive(Debug, Clone)]
pub struct ChangeRouter {
    bindings: Vec<(&'static str, WorkflowKind)>,
}

impl ChangeRouter {
    /// Binds every zone that has a workflow.
    pub fn new() -> Result<Self> {
        let bindings = Zone::ALL
            .into_iter()
            .filter_map(|z| WorkflowKind::for_zone(z).map(|k| (z.prefix(), k)))
            .collect();
        Self::with_bindings(bindings)
    }

    pub fn with_bindings(bindings: Vec<(&'static str, WorkflowKind)>) -> Result<Self> {
        for (i, (a, _)) in bindings.iter().enumerate() {
            for (b, _) in bindings.iter().skip(i + 1) {
                if a.starts_with(b) || b.starts_with(a) {
                    return Err(anyhow!("overlapping zone prefixes: {a:?} and {b:?}"));
                }
            }
        }
        Ok(Self { bindings })
    }

    pub fn route(&self, n: &ObjectCreated) -> Option<WorkflowInvocation> {
        let Some((prefix, kind)) = self.bindings.iter().find(|(p, _)| n.key.starts_with(p)) else {
            debug!(key = %n.key, "no workflow bound, dropped");
            return None;
        };
        let zone = kind.zone();
        if let Some(tagged) = n.zone {
            if tagged != zone {
                warn!(key = %n.key, tagged = %tagged, prefix, "zone tag disagrees with key prefix, dropped");
                return None;
            }
        }
        let item = WorkItem {
            zone,
            key: n.key.clone(),
        };
        Some(WorkflowInvocation {
            kind: *kind,
            input: item.input(),
            item,
        })
    }

    /// Consumes the change journal until shutdown, running each bound
    /// workflow as its own task with at most `router_concurrency` in flight.
    ///
    /// An entry is acknowledged once its workflow finished or was
    /// dead-lettered. Entries that hit a fatal error stay in the journal and
    /// are picked up again by the next router start. In-flight workflows are
    /// awaited before returning.
    pub async fn run(self, ctx: PipelineContext, journal: Arc<ChangeJournal>, mut shutdown: watch::Receiver<bool>) {
        let cap = ctx.config.router_concurrency.max(1);
        let poll = Duration::from_millis(ctx.config.journal_poll_ms.max(1));
        let wake = journal.wakeup();
        let mut cursor = 0i64;
        let mut running = JoinSet::new();
        info!(db = %journal.db_path().display(), "change router started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            let room = cap.saturating_sub(running.len());
            let mut more = false;
            if room > 0 {
                match journal.pending(cursor, room).await {
                    Ok(entries) => {
                        more = entries.len() == room;
                        let mut unrouted = Vec::new();
                        for entry in entries {
                            cursor = cursor.max(entry.seq);
                            match self.route(&entry.created) {
                                Some(inv) => {
                                    running.spawn(run_entry(ctx.clone(), journal.clone(), entry.seq, inv));
                                }
                                None => unrouted.push(entry.seq),
                            }
                        }
                        if let Err(e) = journal.ack(&unrouted).await {
                            warn!(error = %e, "journal ack failed");
                        }
                    }
                    Err(e) => warn!(error = %e, "journal read failed"),
                }
            }
            if more && running.len() < cap {
                continue;
            }
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                Some(done) = running.join_next(), if !running.is_empty() => {
                    if let Err(e) = done {
                        error!(error = %e, "workflow task cancelled");
                    }
                }
                _ = wake.notified() => {}
                _ = tokio::time::sleep(poll) => {}
            }
        }
        info!(in_flight = running.len(), "router stopping");
        while let Some(done) = running.join_next().await {
            if let Err(e) = done {
                error!(error = %e, "workflow task cancelled");
            }
        }
    }
}

async fn run_entry(ctx: PipelineContext, journal: Arc<ChangeJournal>, seq: i64, inv: WorkflowInvocation) {
    let run = run_workflow(&ctx, inv.kind, &inv.item);
    let result = match AssertUnwindSafe(run).catch_unwind().await {
        Ok(result) => result,
        Err(_) => {
            let err = StageError::transient("workflow task panicked");
            let input = DeadLetterInput::WorkItem { item: inv.item.clone() };
            match ctx.dead_letters.record(inv.kind.name(), &input, &err, 1).await {
                Ok(id) => error!(workflow = inv.kind.name(), key = %inv.item.key, dead_letter = %id, "workflow panicked"),
                Err(e) => {
                    error!(workflow = inv.kind.name(), key = %inv.item.key, sink_error = %e, "workflow panicked and dead-letter write failed");
                    return;
                }
            }
            Err(err)
        }
    };
    match result {
        Err(e) if e.is_fatal() => {
            warn!(workflow = inv.kind.name(), key = %inv.item.key, seq, error = %e, "fatal error, journal entry kept");
            return;
        }
        // Other failures were already dead-lettered by the stage runner.
        Err(e) => debug!(workflow = inv.kind.name(), key = %inv.item.key, error = %e, "workflow failed"),
        Ok(_) => {}
    }
    if let Err(e) = journal.ack(&[seq]).await {
        warn!(seq, error = %e, "journal ack failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id_scheme::make_staging_outbox_key;
    use crate::object_store::{save_json, FsObjectStore};
    use crate::test_support::TestPipeline;
    use mumble_protocol::ObjectKey;
    use serde_json::json;
    use std::time::Duration;

    fn created(zone: Option<Zone>, key: &str) -> ObjectCreated {
        ObjectCreated {
            zone,
            key: key.to_string(),
            size: 1,
        }
    }

    #[test]
    fn routes_by_prefix() {
        let r = ChangeRouter::new().unwrap();
        let inv = r.route(&created(Some(Zone::Outbox), "outbox/users/alice/a.json")).unwrap();
        assert_eq!(inv.kind, WorkflowKind::OutboxZone);
        assert!(matches!(inv.input, WorkflowInput::Activity(_)));
        let inv = r.route(&created(None, "staging/users/alice/raw1")).unwrap();
        assert_eq!(inv.kind, WorkflowKind::StagingOutbox);
        assert!(matches!(inv.input, WorkflowInput::Object(_)));
        assert_eq!(r.route(&created(None, "inbox/users/alice/x.json")).unwrap().kind, WorkflowKind::Inbound);
        assert_eq!(r.route(&created(None, "objects/users/alice/posts/p.json")).unwrap().kind, WorkflowKind::ObjectsZone);

        assert!(r.route(&created(Some(Zone::Media), "media/users/alice/x.png")).is_none());
        assert!(r.route(&created(None, "elsewhere/x")).is_none());
        assert!(r.route(&created(Some(Zone::Inbox), "outbox/users/alice/a.json")).is_none());
    }

    #[test]
    fn rejects_overlapping_prefixes() {
        let err = ChangeRouter::with_bindings(vec![
            ("outbox/", WorkflowKind::OutboxZone),
            ("outbox/users/", WorkflowKind::Inbound),
        ]);
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn drives_a_note_end_to_end() {
        let t = TestPipeline::new().await;
        t.actors.add_actor("https://r.example/users/bob", "https://r.example/users/bob/inbox", None);
        t.ctx.directory.add_follower("alice", "https://r.example/users/bob").await.unwrap();

        let (stop_tx, stop_rx) = watch::channel(false);
        let router = ChangeRouter::new().unwrap();
        let handle = tokio::spawn(router.run(t.ctx.clone(), t.journal.clone(), stop_rx));

        let alice = t.user_id("alice");
        save_json(
            t.ctx.store.as_ref(),
            &ObjectKey::new(Zone::StagingOutbox, make_staging_outbox_key("alice", "raw1")),
            &json!({"type": "Note", "content": "hi", "cc": [format!("{alice}/followers")]}),
        )
        .await
        .unwrap();

        let mut delivered = false;
        for _ in 0..200 {
            if t.deliverer.delivered_inboxes().contains("https://r.example/users/bob/inbox") {
                delivered = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        stop_tx.send(true).unwrap();
        handle.await.unwrap();
        assert!(delivered);
        assert_eq!(t.deliverer.attempts.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    async fn wait_for(mut check: impl FnMut() -> bool) -> bool {
        for _ in 0..500 {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    async fn wait_for_empty_journal(journal: &ChangeJournal) -> bool {
        for _ in 0..500 {
            if journal.backlog().await.unwrap() == 0 {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    fn append_media_rows(journal: &ChangeJournal, n: usize) {
        let mut conn = rusqlite::Connection::open(journal.db_path()).unwrap();
        let tx = conn.transaction().unwrap();
        for i in 0..n {
            let event = serde_json::to_string(&created(Some(Zone::Media), &format!("media/users/alice/{i}.png"))).unwrap();
            tx.execute(
                "INSERT INTO change_journal(event_json, created_at_ms) VALUES (?1, 0)",
                rusqlite::params![event],
            )
            .unwrap();
        }
        tx.commit().unwrap();
    }

    #[tokio::test]
    async fn picks_up_writes_from_another_store_handle() {
        let t = TestPipeline::new().await;
        let root = t.dir.path().join("objects");
        let mut ctx = t.ctx.clone();
        ctx.store = Arc::new(FsObjectStore::open(&root, t.journal.clone()).unwrap());
        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(ChangeRouter::new().unwrap().run(ctx, t.journal.clone(), stop_rx));

        // Same data dir, separate handles, as a second process would open them.
        let other_journal = Arc::new(ChangeJournal::open(t.journal.db_path()).unwrap());
        let other = FsObjectStore::open(&root, other_journal).unwrap();
        save_json(
            &other,
            &ObjectKey::new(Zone::StagingOutbox, make_staging_outbox_key("alice", "raw1")),
            &json!({"type": "Note", "content": "from elsewhere"}),
        )
        .await
        .unwrap();

        let posts = root.join("objects/users/alice/posts");
        let translated = wait_for(|| std::fs::read_dir(&posts).map(|d| d.count() > 0).unwrap_or(false)).await;
        stop_tx.send(true).unwrap();
        handle.await.unwrap();
        assert!(translated);
    }

    #[tokio::test]
    async fn backlog_larger_than_any_buffer_is_fully_routed() {
        let t = TestPipeline::new().await;
        append_media_rows(&t.journal, 1100);
        save_json(
            t.ctx.store.as_ref(),
            &ObjectKey::new(Zone::StagingOutbox, make_staging_outbox_key("alice", "raw1")),
            &json!({"type": "Note", "content": "buried"}),
        )
        .await
        .unwrap();
        append_media_rows(&t.journal, 1100);

        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(ChangeRouter::new().unwrap().run(t.ctx.clone(), t.journal.clone(), stop_rx));
        let translated = wait_for(|| !t.store.keys_with_prefix("objects/users/alice/posts/").is_empty()).await;
        let drained = wait_for_empty_journal(&t.journal).await;
        stop_tx.send(true).unwrap();
        handle.await.unwrap();
        assert!(translated);
        assert!(drained);
    }

    #[tokio::test]
    async fn fatal_failures_stay_in_the_journal() {
        let t = TestPipeline::without_domain().await;
        save_json(
            t.ctx.store.as_ref(),
            &ObjectKey::new(Zone::StagingOutbox, make_staging_outbox_key("alice", "raw1")),
            &json!({"type": "Note", "content": "hi"}),
        )
        .await
        .unwrap();
        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(ChangeRouter::new().unwrap().run(t.ctx.clone(), t.journal.clone(), stop_rx));
        tokio::time::sleep(Duration::from_millis(200)).await;
        stop_tx.send(true).unwrap();
        handle.await.unwrap();
        assert_eq!(t.journal.backlog().await.unwrap(), 1);
        assert!(t.dead_letters_list().await.is_empty());
    }
}
