/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::error::StageError;
use anyhow::{Context, Result};
use async_trait::async_trait;
use mumble_protocol::{DeadLetterInput, DeadLetterRecord};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Durable capture of stage inputs that ran out of retries.
#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    /// Returns the id of the new record.
    async fn record(
        &self,
        stage: &str,
        input: &DeadLetterInput,
        error: &StageError,
        attempts: u32,
    ) -> Result<String>;
    /// Newest first. Replayed records are skipped unless asked for.
    async fn list(&self, limit: u32, include_replayed: bool) -> Result<Vec<DeadLetterRecord>>;
    async fn get(&self, id: &str) -> Result<Option<DeadLetterRecord>>;
    async fn mark_replayed(&self, id: &str) -> Result<bool>;
    /// Folds a repeated failure of the same input into an open record.
    /// Returns false when `id` is unknown or already replayed.
    async fn refresh(&self, id: &str, stage: &str, error: &StageError, attempts: u32) -> Result<bool>;
}

#[derive(Clone)]
pub struct SqliteDeadLetterSink {
    path: PathBuf,
}

impl SqliteDeadLetterSink {
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let path = db_path.as_ref().to_path_buf();
        let conn = Connection::open(&path).with_context(|| format!("open db: {}", path.display()))?;
        conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;
            CREATE TABLE IF NOT EXISTS dead_letters (
              id TEXT PRIMARY KEY,
              stage TEXT NOT NULL,
              input_json TEXT NOT NULL,
              error_kind TEXT NOT NULL,
              last_error TEXT NOT NULL,
              attempts INTEGER NOT NULL,
              created_at_ms INTEGER NOT NULL,
              replayed_at_ms INTEGER NULL
            );
            CREATE INDEX IF NOT EXISTS dead_letters_created ON dead_letters(created_at_ms);
            "#,
        )?;
        Ok(Self { path })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || {
            let conn = Connection::open(&path)?;
            conn.busy_timeout(std::time::Duration::from_secs(5))?;
            f(&conn)
        })
        .await?
    }
}

const SELECT_COLUMNS: &str =
    "id, stage, input_json, error_kind, last_error, attempts, created_at_ms, replayed_at_ms";

fn row_to_record(r: &Row<'_>) -> rusqlite::Result<(DeadLetterRecord, String)> {
    let input_json: String = r.get(2)?;
    let record = DeadLetterRecord {
        id: r.get(0)?,
        stage: r.get(1)?,
        input: DeadLetterInput::Raw {
            value: serde_json::Value::Null,
        },
        error_kind: r.get(3)?,
        last_error: r.get(4)?,
        attempts: r.get::<_, i64>(5)?.max(0) as u32,
        created_at_ms: r.get(6)?,
        replayed_at_ms: r.get(7)?,
    };
    Ok((record, input_json))
}

/// Rows written by an older build may hold an input we no longer understand;
/// keep them visible as raw JSON.
fn decode_input((mut record, input_json): (DeadLetterRecord, String)) -> DeadLetterRecord {
    record.input = serde_json::from_str::<DeadLetterInput>(&input_json).unwrap_or_else(|_| {
        DeadLetterInput::Raw {
            value: serde_json::from_str(&input_json).unwrap_or(serde_json::Value::String(input_json)),
        }
    });
    record
}

#[async_trait]
impl DeadLetterSink for SqliteDeadLetterSink {
    async fn record(
        &self,
        stage: &str,
        input: &DeadLetterInput,
        error: &StageError,
        attempts: u32,
    ) -> Result<String> {
        let id = Uuid::now_v7().to_string();
        let input_json = serde_json::to_string(input)?;
        let (stage, kind, last_error) = (stage.to_string(), error.kind(), error.to_string());
        let out = id.clone();
        self.with_conn(move |conn| {
            conn.execute(
                r#"
                INSERT INTO dead_letters(id, stage, input_json, error_kind, last_error, attempts, created_at_ms)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                "#,
                params![id, stage, input_json, kind, last_error, attempts as i64, now_ms()],
            )?;
            Ok(())
        })
        .await?;
        Ok(out)
    }

    async fn list(&self, limit: u32, include_replayed: bool) -> Result<Vec<DeadLetterRecord>> {
        let limit = limit.clamp(1, 1000);
        self.with_conn(move |conn| {
            let filter = if include_replayed { "" } else { "WHERE replayed_at_ms IS NULL" };
            let mut stmt = conn.prepare(&format!(
                "SELECT {SELECT_COLUMNS} FROM dead_letters {filter} ORDER BY created_at_ms DESC, rowid DESC LIMIT ?1"
            ))?;
            let rows = stmt
                .query_map(params![limit as i64], row_to_record)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows.into_iter().map(decode_input).collect())
        })
        .await
    }

    async fn get(&self, id: &str) -> Result<Option<DeadLetterRecord>> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            let row = conn
                .query_row(
                    &format!("SELECT {SELECT_COLUMNS} FROM dead_letters WHERE id = ?1"),
                    params![id],
                    row_to_record,
                )
                .optional()?;
            Ok(row.map(decode_input))
        })
        .await
    }

    async fn mark_replayed(&self, id: &str) -> Result<bool> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            let n = conn.execute(
                "UPDATE dead_letters SET replayed_at_ms = ?2 WHERE id = ?1 AND replayed_at_ms IS NULL",
                params![id, now_ms()],
            )?;
            Ok(n > 0)
        })
        .await
    }

    async fn refresh(&self, id: &str, stage: &str, error: &StageError, attempts: u32) -> Result<bool> {
        let (id, stage, kind, last_error) = (id.to_string(), stage.to_string(), error.kind(), error.to_string());
        self.with_conn(move |conn| {
            let n = conn.execute(
                r#"
                UPDATE dead_letters SET stage = ?2, error_kind = ?3, last_error = ?4, attempts = attempts + ?5
                WHERE id = ?1 AND replayed_at_ms IS NULL
                "#,
                params![id, stage, kind, last_error, attempts as i64],
            )?;
            Ok(n > 0)
        })
        .await
    }
}

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}
