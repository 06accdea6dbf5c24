/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Append-only metadata index of activities, objects and reply threads.
//!
//! One table, addressed by `(pk, sk)`:
//!
//! | row            | pk                                      | sk                                  |
//! |----------------|-----------------------------------------|-------------------------------------|
//! | activity       | `activity:<owner>:<yyyy-mm>`            | `<ddTHH:MM:SS.ffffff>:<unique>`     |
//! | object         | `object:<owner>:<category>:<unique>`    | `metadata`                          |
//! | reply          | `object:<owner>:<category>:<unique>`    | `reply:<published>:<reply-id>`      |
//!
//! Sort keys are fixed-width timestamps, so string order is chronological
//! order within a partition. Rows are never updated in place here; a
//! duplicate append collides on `(pk, sk)` and is ignored.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Datelike, Months, NaiveDate, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};

const MAX_PAGE: u32 = 500;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivityMetadata {
    pub pk: String,
    pub sk: String,
    pub id: String,
    pub kind: String,
    pub owner: String,
    pub is_public: bool,
}

impl ActivityMetadata {
    pub fn new(
        owner: &str,
        id: &str,
        unique_part: &str,
        kind: &str,
        published: DateTime<Utc>,
        is_public: bool,
    ) -> Self {
        let month = first_of_month(published.date_naive());
        Self {
            pk: activity_partition_key(owner, month),
            sk: format!("{}:{unique_part}", published.format("%dT%H:%M:%S%.6f")),
            id: id.to_string(),
            kind: kind.to_string(),
            owner: owner.to_string(),
            is_public,
        }
    }

    pub fn key(&self) -> ActivityKey {
        ActivityKey {
            pk: self.pk.clone(),
            sk: self.sk.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectMetadata {
    pub pk: String,
    pub id: String,
    pub kind: String,
    pub owner: String,
    pub category: String,
    pub published: String,
    pub is_public: bool,
    /// Maintained by the statistics collapser; always 0 on append.
    pub reply_count: u64,
}

impl ObjectMetadata {
    pub const SORT_KEY: &'static str = "metadata";

    pub fn new(
        owner: &str,
        category: &str,
        unique_part: &str,
        id: &str,
        kind: &str,
        published: &str,
        is_public: bool,
    ) -> Self {
        Self {
            pk: object_partition_key(owner, category, unique_part),
            id: id.to_string(),
            kind: kind.to_string(),
            owner: owner.to_string(),
            category: category.to_string(),
            published: published.to_string(),
            is_public,
            reply_count: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyRow {
    pub pk: String,
    pub sk: String,
    pub reply_id: String,
    pub published: String,
}

impl ReplyRow {
    pub fn new(parent_pk: &str, reply_id: &str, published: &str) -> Self {
        Self {
            pk: parent_pk.to_string(),
            sk: format!("reply:{published}:{reply_id}"),
            reply_id: reply_id.to_string(),
            published: published.to_string(),
        }
    }
}

/// Primary key of an activity row, used as a paging cursor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivityKey {
    pub pk: String,
    pub sk: String,
}

impl ActivityKey {
    /// `<yyyy-mm>-<ddTHH:MM:SS.ffffff>:<unique>`; the owner is supplied on parse.
    pub fn serialize(&self) -> Result<String> {
        let (_, month) = parse_activity_partition_key(&self.pk)?;
        Ok(format!("{}-{}", format_yyyymm(month), self.sk))
    }

    pub fn deserialize(s: &str, owner: &str) -> Result<Self> {
        let bad = || anyhow!("invalid serialized activity key: {s}");
        if s.len() < 8 || !s.is_char_boundary(7) {
            return Err(bad());
        }
        let (ym, rest) = s.split_at(7);
        let sk = rest.strip_prefix('-').ok_or_else(bad)?;
        let month = parse_yyyymm(ym).map_err(|_| bad())?;
        if !sk.contains(':') {
            return Err(bad());
        }
        Ok(Self {
            pk: activity_partition_key(owner, month),
            sk: sk.to_string(),
        })
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct QueryOptions<'a> {
    /// Newest first when true.
    pub reverse: bool,
    /// Exclusive sort-key cursor from a previous page.
    pub cursor: Option<&'a str>,
    pub limit: u32,
    pub public_only: bool,
}

#[derive(Debug, Clone)]
pub struct Page<T> {
    pub items: Vec<T>,
    /// Sort key to pass as `cursor` for the next page, `None` when exhausted.
    pub next: Option<String>,
}

#[async_trait]
pub trait MetadataIndex: Send + Sync {
    /// Returns false when the row already existed.
    async fn append_activity(&self, row: &ActivityMetadata) -> Result<bool>;
    async fn append_object(&self, row: &ObjectMetadata) -> Result<bool>;
    async fn append_reply(&self, row: &ReplyRow) -> Result<bool>;
    async fn find_object(&self, pk: &str) -> Result<Option<ObjectMetadata>>;
    async fn query_by_owner_and_month(
        &self,
        owner: &str,
        month: NaiveDate,
        opts: QueryOptions<'_>,
    ) -> Result<Page<ActivityMetadata>>;
    async fn list_replies(
        &self,
        pk: &str,
        limit: u32,
        cursor: Option<&str>,
    ) -> Result<Page<ReplyRow>>;
}

#[derive(Clone)]
pub struct SqliteMetadataIndex {
    path: PathBuf,
}

impl SqliteMetadataIndex {
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let path = db_path.as_ref().to_path_buf();
        let conn = Connection::open(&path).with_context(|| format!("open db: {}", path.display()))?;
        conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;
            CREATE TABLE IF NOT EXISTS index_rows (
              pk TEXT NOT NULL,
              sk TEXT NOT NULL,
              id TEXT NOT NULL,
              type TEXT NULL,
              owner TEXT NULL,
              category TEXT NULL,
              published TEXT NULL,
              is_public INTEGER NOT NULL DEFAULT 0,
              reply_count INTEGER NOT NULL DEFAULT 0,
              created_at_ms INTEGER NOT NULL,
              PRIMARY KEY (pk, sk)
            );
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

#[async_trait]
impl MetadataIndex for SqliteMetadataIndex {
    async fn append_activity(&self, row: &ActivityMetadata) -> Result<bool> {
        let row = row.clone();
        self.with_conn(move |conn| {
            let n = conn.execute(
                r#"
                INSERT OR IGNORE INTO index_rows(pk, sk, id, type, owner, is_public, created_at_ms)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                "#,
                params![row.pk, row.sk, row.id, row.kind, row.owner, row.is_public, now_ms()],
            )?;
            Ok(n > 0)
        })
        .await
    }

    async fn append_object(&self, row: &ObjectMetadata) -> Result<bool> {
        let row = row.clone();
        self.with_conn(move |conn| {
            let n = conn.execute(
                r#"
                INSERT OR IGNORE INTO index_rows(pk, sk, id, type, owner, category, published, is_public, reply_count, created_at_ms)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 0, ?9)
                "#,
                params![
                    row.pk,
                    ObjectMetadata::SORT_KEY,
                    row.id,
                    row.kind,
                    row.owner,
                    row.category,
                    row.published,
                    row.is_public,
                    now_ms()
                ],
            )?;
            Ok(n > 0)
        })
        .await
    }

    async fn append_reply(&self, row: &ReplyRow) -> Result<bool> {
        let row = row.clone();
        self.with_conn(move |conn| {
            let n = conn.execute(
                r#"
                INSERT OR IGNORE INTO index_rows(pk, sk, id, published, created_at_ms)
                VALUES (?1, ?2, ?3, ?4, ?5)
                "#,
                params![row.pk, row.sk, row.reply_id, row.published, now_ms()],
            )?;
            Ok(n > 0)
        })
        .await
    }

    async fn find_object(&self, pk: &str) -> Result<Option<ObjectMetadata>> {
        let pk = pk.to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                r#"
                SELECT pk, id, type, owner, category, published, is_public, reply_count
                FROM index_rows WHERE pk = ?1 AND sk = ?2
                "#,
                params![pk, ObjectMetadata::SORT_KEY],
                |r| {
                    Ok(ObjectMetadata {
                        pk: r.get(0)?,
                        id: r.get(1)?,
                        kind: r.get::<_, Option<String>>(2)?.unwrap_or_default(),
                        owner: r.get::<_, Option<String>>(3)?.unwrap_or_default(),
                        category: r.get::<_, Option<String>>(4)?.unwrap_or_default(),
                        published: r.get::<_, Option<String>>(5)?.unwrap_or_default(),
                        is_public: r.get(6)?,
                        reply_count: r.get::<_, i64>(7)?.max(0) as u64,
                    })
                },
            )
            .optional()
            .map_err(Into::into)
        })
        .await
    }

    async fn query_by_owner_and_month(
        &self,
        owner: &str,
        month: NaiveDate,
        opts: QueryOptions<'_>,
    ) -> Result<Page<ActivityMetadata>> {
        let pk = activity_partition_key(owner, first_of_month(month));
        let cursor = opts.cursor.map(str::to_string);
        let limit = opts.limit.clamp(1, MAX_PAGE);
        let reverse = opts.reverse;
        let public_only = opts.public_only;
        let owner = owner.to_string();
        self.with_conn(move |conn| {
            let (cmp, order) = if reverse { ("<", "DESC") } else { (">", "ASC") };
            let public_clause = if public_only { "AND is_public = 1" } else { "" };
            let sql = match cursor {
                Some(_) => format!(
                    "SELECT pk, sk, id, type, is_public FROM index_rows WHERE pk = ?1 AND sk {cmp} ?3 {public_clause} ORDER BY sk {order} LIMIT ?2"
                ),
                None => format!(
                    "SELECT pk, sk, id, type, is_public FROM index_rows WHERE pk = ?1 {public_clause} ORDER BY sk {order} LIMIT ?2"
                ),
            };
            let mut params_vec: Vec<rusqlite::types::Value> = vec![pk.into(), (limit as i64).into()];
            if let Some(c) = cursor {
                params_vec.push(c.into());
            }
            let mut stmt = conn.prepare(&sql)?;
            let mut rows = stmt.query(rusqlite::params_from_iter(params_vec))?;
            let mut items = Vec::new();
            while let Some(row) = rows.next()? {
                items.push(ActivityMetadata {
                    pk: row.get(0)?,
                    sk: row.get(1)?,
                    id: row.get(2)?,
                    kind: row.get::<_, Option<String>>(3)?.unwrap_or_default(),
                    owner: owner.clone(),
                    is_public: row.get(4)?,
                });
            }
            let next = if items.len() as u32 == limit {
                items.last().map(|i| i.sk.clone())
            } else {
                None
            };
            Ok(Page { items, next })
        })
        .await
    }

    async fn list_replies(
        &self,
        pk: &str,
        limit: u32,
        cursor: Option<&str>,
    ) -> Result<Page<ReplyRow>> {
        let pk = pk.to_string();
        let cursor = cursor.map(str::to_string);
        let limit = limit.clamp(1, MAX_PAGE);
        self.with_conn(move |conn| {
            // `reply;` sorts right after every `reply:...` key.
            let upper = cursor.unwrap_or_else(|| "reply;".to_string());
            let mut stmt = conn.prepare(
                r#"
                SELECT pk, sk, id, published FROM index_rows
                WHERE pk = ?1 AND sk >= 'reply:' AND sk < ?2
                ORDER BY sk DESC LIMIT ?3
                "#,
            )?;
            let mut rows = stmt.query(params![pk, upper, limit as i64])?;
            let mut items = Vec::new();
            while let Some(row) = rows.next()? {
                items.push(ReplyRow {
                    pk: row.get(0)?,
                    sk: row.get(1)?,
                    reply_id: row.get(2)?,
                    published: row.get::<_, Option<String>>(3)?.unwrap_or_default(),
                });
            }
            let next = if items.len() as u32 == limit {
                items.last().map(|i| i.sk.clone())
            } else {
                None
            };
            Ok(Page { items, next })
        })
        .await
    }
}

/// Range of an activity scan across monthly partitions.
#[derive(Debug, Clone)]
pub struct ActivityScan<'a> {
    pub owner: &'a str,
    pub latest_month: NaiveDate,
    pub earliest_month: NaiveDate,
    /// Resume strictly before this key instead of at `latest_month`.
    pub before: Option<&'a ActivityKey>,
    pub page_size: u32,
    pub public_only: bool,
}

/// Every activity in the scan range, newest first.
pub async fn enumerate_user_activities(
    index: &dyn MetadataIndex,
    scan: ActivityScan<'_>,
) -> Result<Vec<ActivityMetadata>> {
    let earliest = first_of_month(scan.earliest_month);
    let (mut month, mut cursor) = match scan.before {
        Some(key) => {
            let (owner, month) = parse_activity_partition_key(&key.pk)?;
            if owner != scan.owner {
                return Err(anyhow!("before key is for different user: {owner} vs {}", scan.owner));
            }
            (month, Some(key.sk.clone()))
        }
        None => (first_of_month(scan.latest_month), None),
    };

    let mut out = Vec::new();
    while month >= earliest {
        loop {
            let page = index
                .query_by_owner_and_month(
                    scan.owner,
                    month,
                    QueryOptions {
                        reverse: true,
                        cursor: cursor.as_deref(),
                        limit: scan.page_size,
                        public_only: scan.public_only,
                    },
                )
                .await?;
            out.extend(page.items);
            match page.next {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }
        cursor = None;
        month = match month.checked_sub_months(Months::new(1)) {
            Some(m) => m,
            None => break,
        };
    }
    Ok(out)
}

pub fn activity_partition_key(owner: &str, month: NaiveDate) -> String {
    format!("activity:{owner}:{}", format_yyyymm(month))
}

pub fn object_partition_key(owner: &str, category: &str, unique_part: &str) -> String {
    format!("object:{owner}:{category}:{unique_part}")
}

pub fn parse_activity_partition_key(pk: &str) -> Result<(String, NaiveDate)> {
    let rest = pk
        .strip_prefix("activity:")
        .ok_or_else(|| anyhow!("invalid activity partition key: {pk}"))?;
    let (owner, ym) = rest
        .rsplit_once(':')
        .ok_or_else(|| anyhow!("invalid activity partition key: {pk}"))?;
    if owner.is_empty() || owner.contains(':') {
        return Err(anyhow!("invalid activity partition key: {pk}"));
    }
    Ok((owner.to_string(), parse_yyyymm(ym)?))
}

pub fn format_yyyymm(month: NaiveDate) -> String {
    format!("{:04}-{:02}", month.year(), month.month())
}

pub fn parse_yyyymm(s: &str) -> Result<NaiveDate> {
    if s.len() != 7 {
        return Err(anyhow!("invalid year-month: {s}"));
    }
    NaiveDate::parse_from_str(&format!("{s}-01"), "%Y-%m-%d")
        .with_context(|| format!("invalid year-month: {s}"))
}

pub fn first_of_month(date: NaiveDate) -> NaiveDate {
    date.with_day(1).unwrap_or(date)
}

/// Canonical `published` form used on every object this pipeline authors.
pub fn format_published(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn parse_published(s: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(s)
        .with_context(|| format!("invalid published timestamp: {s}"))?
        .with_timezone(&Utc))
}

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(y: i32, m: u32, d: u32, h: u32, micros: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, 0, 0).unwrap() + chrono::Duration::microseconds(micros as i64)
    }

    fn open() -> (tempfile::TempDir, SqliteMetadataIndex) {
        let dir = tempfile::tempdir().unwrap();
        let index = SqliteMetadataIndex::open(dir.path().join("index.sqlite")).unwrap();
        (dir, index)
    }

    #[test]
    fn activity_keys() {
        let row = ActivityMetadata::new("alice", "id", "u1", "Create", ts(2023, 5, 15, 1, 123456), true);
        assert_eq!(row.pk, "activity:alice:2023-05");
        assert_eq!(row.sk, "15T01:00:00.123456:u1");
        let s = row.key().serialize().unwrap();
        assert_eq!(s, "2023-05-15T01:00:00.123456:u1");
        assert_eq!(ActivityKey::deserialize(&s, "alice").unwrap(), row.key());
        assert!(ActivityKey::deserialize("2023-05", "alice").is_err());
        assert!(ActivityKey::deserialize("garbage-key-here", "alice").is_err());
        assert!(parse_activity_partition_key("object:alice:post:x").is_err());
    }

    #[tokio::test]
    async fn duplicate_appends_collide() {
        let (_dir, index) = open();
        let obj = ObjectMetadata::new("alice", "post", "u1", "https://m/users/alice/posts/u1", "Note", "2023-05-15T01:00:00.000000Z", true);
        assert!(index.append_object(&obj).await.unwrap());
        assert!(!index.append_object(&obj).await.unwrap());
        let found = index.find_object(&obj.pk).await.unwrap().unwrap();
        assert_eq!(found, obj);

        let reply = ReplyRow::new(&obj.pk, "https://remote/notes/1", "2023-05-16T00:00:00Z");
        assert!(index.append_reply(&reply).await.unwrap());
        assert!(!index.append_reply(&reply).await.unwrap());
        let later = ReplyRow::new(&obj.pk, "https://remote/notes/2", "2023-05-17T00:00:00Z");
        index.append_reply(&later).await.unwrap();
        let page = index.list_replies(&obj.pk, 1, None).await.unwrap();
        assert_eq!(page.items[0].reply_id, "https://remote/notes/2");
        let page = index.list_replies(&obj.pk, 10, page.next.as_deref()).await.unwrap();
        assert_eq!(page.items.len(), 1);
        assert_eq!(page.items[0].reply_id, "https://remote/notes/1");
        assert!(page.next.is_none());
    }

    #[tokio::test]
    async fn reverse_chronological_paging_across_months() {
        let (_dir, index) = open();
        let mut expected = Vec::new();
        for (month, count) in [(3u32, 4u32), (4, 3), (5, 5)] {
            for i in 0..count {
                let row = ActivityMetadata::new(
                    "alice",
                    &format!("a-{month}-{i}"),
                    &format!("u{month}{i}"),
                    "Create",
                    ts(2023, month, 1 + i, i, i * 10),
                    true,
                );
                index.append_activity(&row).await.unwrap();
                expected.push(row);
            }
        }
        // noise from another owner
        let other = ActivityMetadata::new("bob", "b", "ub", "Create", ts(2023, 4, 2, 0, 0), true);
        index.append_activity(&other).await.unwrap();

        let got = enumerate_user_activities(
            &index,
            ActivityScan {
                owner: "alice",
                latest_month: NaiveDate::from_ymd_opt(2023, 5, 20).unwrap(),
                earliest_month: NaiveDate::from_ymd_opt(2023, 3, 1).unwrap(),
                before: None,
                page_size: 2,
                public_only: false,
            },
        )
        .await
        .unwrap();

        expected.reverse();
        let got_ids: Vec<_> = got.iter().map(|r| r.id.clone()).collect();
        let want_ids: Vec<_> = expected.iter().map(|r| r.id.clone()).collect();
        assert_eq!(got_ids, want_ids);
    }

    #[tokio::test]
    async fn forward_query_and_public_filter() {
        let (_dir, index) = open();
        let a = ActivityMetadata::new("alice", "a", "ua", "Create", ts(2023, 5, 1, 0, 0), true);
        let b = ActivityMetadata::new("alice", "b", "ub", "Accept", ts(2023, 5, 2, 0, 0), false);
        let c = ActivityMetadata::new("alice", "c", "uc", "Create", ts(2023, 5, 3, 0, 0), true);
        for r in [&a, &b, &c] {
            index.append_activity(r).await.unwrap();
        }
        let month = NaiveDate::from_ymd_opt(2023, 5, 1).unwrap();
        let page = index
            .query_by_owner_and_month("alice", month, QueryOptions { limit: 10, ..Default::default() })
            .await
            .unwrap();
        assert_eq!(page.items.iter().map(|r| r.id.as_str()).collect::<Vec<_>>(), ["a", "b", "c"]);
        let page = index
            .query_by_owner_and_month(
                "alice",
                month,
                QueryOptions { reverse: true, limit: 10, public_only: true, cursor: None },
            )
            .await
            .unwrap();
        assert_eq!(page.items.iter().map(|r| r.id.as_str()).collect::<Vec<_>>(), ["c", "a"]);
    }

    #[tokio::test]
    async fn scan_resumes_before_key() {
        let (_dir, index) = open();
        let a = ActivityMetadata::new("alice", "a", "ua", "Create", ts(2023, 4, 30, 0, 0), true);
        let b = ActivityMetadata::new("alice", "b", "ub", "Create", ts(2023, 5, 1, 0, 0), true);
        let c = ActivityMetadata::new("alice", "c", "uc", "Create", ts(2023, 5, 2, 0, 0), true);
        for r in [&a, &b, &c] {
            index.append_activity(r).await.unwrap();
        }
        let before = c.key();
        let got = enumerate_user_activities(
            &index,
            ActivityScan {
                owner: "alice",
                latest_month: NaiveDate::from_ymd_opt(2023, 5, 1).unwrap(),
                earliest_month: NaiveDate::from_ymd_opt(2023, 4, 1).unwrap(),
                before: Some(&before),
                page_size: 10,
                public_only: true,
            },
        )
        .await
        .unwrap();
        assert_eq!(got.iter().map(|r| r.id.as_str()).collect::<Vec<_>>(), ["b", "a"]);
    }
}
