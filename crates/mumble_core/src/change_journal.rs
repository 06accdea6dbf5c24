/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Durable log of object writes.
//!
//! Every store `put` appends one row; the change router reads rows in
//! sequence order and deletes them once their workflow is done. Any process
//! that opens the same database file sees the same backlog, so writes made
//! by the dead-letter CLI or another writer still trigger workflows.

use anyhow::{Context, Result};
use mumble_protocol::ObjectCreated;
use rusqlite::{params, Connection};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalEntry {
    pub seq: i64,
    pub created: ObjectCreated,
}

#[derive(Clone)]
pub struct ChangeJournal {
    db_path: PathBuf,
    notify: Arc<Notify>,
}

impl ChangeJournal {
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let db_path = db_path.as_ref().to_path_buf();
        init_db(&db_path)?;
        Ok(Self {
            db_path,
            notify: Arc::new(Notify::new()),
        })
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// Woken on every append through this handle. Appends from other
    /// handles are only seen by polling.
    pub fn wakeup(&self) -> Arc<Notify> {
        self.notify.clone()
    }

    pub async fn append(&self, created: &ObjectCreated) -> Result<i64> {
        let event_json = serde_json::to_string(created)?;
        let seq = self
            .with_conn(move |conn| {
                conn.execute(
                    "INSERT INTO change_journal(event_json, created_at_ms) VALUES (?1, ?2)",
                    params![event_json, now_ms()],
                )?;
                Ok(conn.last_insert_rowid())
            })
            .await?;
        self.notify.notify_one();
        Ok(seq)
    }

    /// Unacknowledged entries with `seq > after`, oldest first.
    pub async fn pending(&self, after: i64, limit: usize) -> Result<Vec<JournalEntry>> {
        let rows = self
            .with_conn(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT seq, event_json FROM change_journal WHERE seq > ?1 ORDER BY seq ASC LIMIT ?2",
                )?;
                let rows = stmt
                    .query_map(params![after, limit as i64], |r| {
                        Ok((r.get::<_, i64>(0)?, r.get::<_, String>(1)?))
                    })?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })
            .await?;

        let mut out = Vec::with_capacity(rows.len());
        for (seq, event_json) in rows {
            match serde_json::from_str::<ObjectCreated>(&event_json) {
                Ok(created) => out.push(JournalEntry { seq, created }),
                Err(e) => {
                    // Unreadable rows would block the cursor forever.
                    warn!(seq, error = %e, "dropping unreadable journal entry");
                    self.ack(&[seq]).await?;
                }
            }
        }
        Ok(out)
    }

    pub async fn ack(&self, seqs: &[i64]) -> Result<()> {
        if seqs.is_empty() {
            return Ok(());
        }
        let seqs = seqs.to_vec();
        self.with_conn(move |conn| {
            let tx = conn.unchecked_transaction()?;
            for seq in seqs {
                tx.execute("DELETE FROM change_journal WHERE seq = ?1", params![seq])?;
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    pub async fn backlog(&self) -> Result<u64> {
        self.with_conn(|conn| {
            let n: i64 = conn.query_row("SELECT COUNT(*) FROM change_journal", [], |r| r.get(0))?;
            Ok(n.max(0) as u64)
        })
        .await
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        let path = self.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let conn = Connection::open(&path)?;
            conn.busy_timeout(std::time::Duration::from_secs(5))?;
            f(&conn)
        })
        .await?
    }
}

fn init_db(path: &Path) -> Result<()> {
    let conn = Connection::open(path).with_context(|| format!("open db: {}", path.display()))?;
    conn.execute_batch(
        r#"
        PRAGMA journal_mode=WAL;
        CREATE TABLE IF NOT EXISTS change_journal (
          seq INTEGER PRIMARY KEY AUTOINCREMENT,
          event_json TEXT NOT NULL,
          created_at_ms INTEGER NOT NULL
        );
        "#,
    )?;
    Ok(())
}

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}
