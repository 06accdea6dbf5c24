/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::metadata_index::Page;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::rngs::OsRng;
use rsa::{
    pkcs8::{EncodePrivateKey, EncodePublicKey, LineEnding},
    RsaPrivateKey, RsaPublicKey,
};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};

const KEY_BITS: usize = 2048;

#[derive(Debug, Clone)]
pub struct UserRecord {
    pub username: String,
    pub public_key_pem: String,
    pub created_at_ms: i64,
    pub last_activity_at_ms: Option<i64>,
}

/// Local users, their keys and their followers.
#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn find_user(&self, username: &str) -> Result<Option<UserRecord>>;
    /// Follower actor ids in a stable order, `limit` at a time.
    async fn followers_page(
        &self,
        username: &str,
        cursor: Option<&str>,
        limit: u32,
    ) -> Result<Page<String>>;
    /// Returns false when the follower was already present.
    async fn add_follower(&self, username: &str, follower_id: &str) -> Result<bool>;
    async fn remove_follower(&self, username: &str, follower_id: &str) -> Result<bool>;
    async fn resolve_public_key(&self, username: &str) -> Result<Option<String>>;
    /// PKCS#8 PEM used to sign deliveries on behalf of the user.
    async fn signing_key(&self, username: &str) -> Result<Option<String>>;
    async fn update_last_activity(&self, username: &str, at: DateTime<Utc>) -> Result<()>;
}

#[derive(Clone)]
pub struct SqliteUserDirectory {
    path: PathBuf,
}

impl SqliteUserDirectory {
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let path = db_path.as_ref().to_path_buf();
        let conn = Connection::open(&path).with_context(|| format!("open db: {}", path.display()))?;
        conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;
            CREATE TABLE IF NOT EXISTS users (
              username TEXT PRIMARY KEY,
              private_key_pem TEXT NOT NULL,
              public_key_pem TEXT NOT NULL,
              created_at_ms INTEGER NOT NULL,
              last_activity_at_ms INTEGER NULL
            );
            CREATE TABLE IF NOT EXISTS followers (
              username TEXT NOT NULL,
              follower_id TEXT NOT NULL,
              created_at_ms INTEGER NOT NULL,
              PRIMARY KEY (username, follower_id)
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

    /// Provisions a user with a fresh RSA key pair. Fails if the name is taken.
    pub async fn create_user(&self, username: &str) -> Result<UserRecord> {
        validate_username(username)?;
        let username = username.to_string();
        self.with_conn(move |conn| {
            let mut rng = OsRng;
            let private_key = RsaPrivateKey::new(&mut rng, KEY_BITS).context("generate rsa key")?;
            let private_key_pem = private_key.to_pkcs8_pem(LineEnding::LF)?.to_string();
            let public_key_pem = RsaPublicKey::from(&private_key)
                .to_public_key_pem(LineEnding::LF)?
                .to_string();
            let created_at_ms = now_ms();
            let n = conn.execute(
                r#"
                INSERT OR IGNORE INTO users(username, private_key_pem, public_key_pem, created_at_ms)
                VALUES (?1, ?2, ?3, ?4)
                "#,
                params![username, private_key_pem, public_key_pem, created_at_ms],
            )?;
            if n == 0 {
                return Err(anyhow!("user already exists: {username}"));
            }
            Ok(UserRecord {
                username,
                public_key_pem,
                created_at_ms,
                last_activity_at_ms: None,
            })
        })
        .await
    }

    /// Registers an existing key pair, for imports and tests.
    pub async fn insert_user_with_keys(
        &self,
        username: &str,
        private_key_pem: &str,
        public_key_pem: &str,
    ) -> Result<()> {
        validate_username(username)?;
        let (username, private_key_pem, public_key_pem) =
            (username.to_string(), private_key_pem.to_string(), public_key_pem.to_string());
        self.with_conn(move |conn| {
            conn.execute(
                r#"
                INSERT INTO users(username, private_key_pem, public_key_pem, created_at_ms)
                VALUES (?1, ?2, ?3, ?4)
                ON CONFLICT(username) DO UPDATE SET
                  private_key_pem = excluded.private_key_pem,
                  public_key_pem = excluded.public_key_pem
                "#,
                params![username, private_key_pem, public_key_pem, now_ms()],
            )?;
            Ok(())
        })
        .await
    }
}

#[async_trait]
impl UserDirectory for SqliteUserDirectory {
    async fn find_user(&self, username: &str) -> Result<Option<UserRecord>> {
        let username = username.to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT username, public_key_pem, created_at_ms, last_activity_at_ms FROM users WHERE username = ?1",
                params![username],
                |r| {
                    Ok(UserRecord {
                        username: r.get(0)?,
                        public_key_pem: r.get(1)?,
                        created_at_ms: r.get(2)?,
                        last_activity_at_ms: r.get(3)?,
                    })
                },
            )
            .optional()
            .map_err(Into::into)
        })
        .await
    }

    async fn followers_page(
        &self,
        username: &str,
        cursor: Option<&str>,
        limit: u32,
    ) -> Result<Page<String>> {
        let username = username.to_string();
        let cursor = cursor.unwrap_or_default().to_string();
        let limit = limit.clamp(1, 1000);
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                r#"
                SELECT follower_id FROM followers
                WHERE username = ?1 AND follower_id > ?2
                ORDER BY follower_id ASC
                LIMIT ?3
                "#,
            )?;
            let items = stmt
                .query_map(params![username, cursor, limit as i64], |r| r.get::<_, String>(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            let next = if items.len() as u32 == limit {
                items.last().cloned()
            } else {
                None
            };
            Ok(Page { items, next })
        })
        .await
    }

    async fn add_follower(&self, username: &str, follower_id: &str) -> Result<bool> {
        let (username, follower_id) = (username.to_string(), follower_id.to_string());
        self.with_conn(move |conn| {
            let n = conn.execute(
                "INSERT OR IGNORE INTO followers(username, follower_id, created_at_ms) VALUES (?1, ?2, ?3)",
                params![username, follower_id, now_ms()],
            )?;
            Ok(n > 0)
        })
        .await
    }

    async fn remove_follower(&self, username: &str, follower_id: &str) -> Result<bool> {
        let (username, follower_id) = (username.to_string(), follower_id.to_string());
        self.with_conn(move |conn| {
            let n = conn.execute(
                "DELETE FROM followers WHERE username = ?1 AND follower_id = ?2",
                params![username, follower_id],
            )?;
            Ok(n > 0)
        })
        .await
    }

    async fn resolve_public_key(&self, username: &str) -> Result<Option<String>> {
        Ok(self.find_user(username).await?.map(|u| u.public_key_pem))
    }

    async fn signing_key(&self, username: &str) -> Result<Option<String>> {
        let username = username.to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT private_key_pem FROM users WHERE username = ?1",
                params![username],
                |r| r.get::<_, String>(0),
            )
            .optional()
            .map_err(Into::into)
        })
        .await
    }

    async fn update_last_activity(&self, username: &str, at: DateTime<Utc>) -> Result<()> {
        let username = username.to_string();
        let at_ms = at.timestamp_millis();
        self.with_conn(move |conn| {
            // Monotonic: a replayed older activity never moves it backwards.
            conn.execute(
                r#"
                UPDATE users SET last_activity_at_ms = ?2
                WHERE username = ?1 AND (last_activity_at_ms IS NULL OR last_activity_at_ms < ?2)
                "#,
                params![username, at_ms],
            )?;
            Ok(())
        })
        .await
    }
}

fn validate_username(username: &str) -> Result<()> {
    let ok = !username.is_empty()
        && username.len() <= 64
        && username
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.');
    if !ok {
        return Err(anyhow!("invalid username: {username:?}"));
    }
    Ok(())
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

    fn open() -> (tempfile::TempDir, SqliteUserDirectory) {
        let dir = tempfile::tempdir().unwrap();
        let d = SqliteUserDirectory::open(dir.path().join("users.sqlite")).unwrap();
        (dir, d)
    }

    #[tokio::test]
    async fn followers_page_through_in_order() {
        let (_dir, d) = open();
        d.insert_user_with_keys("alice", "priv", "pub").await.unwrap();
        for i in 0..7 {
            assert!(d.add_follower("alice", &format!("https://r{i}.example/users/x")).await.unwrap());
        }
        assert!(!d.add_follower("alice", "https://r0.example/users/x").await.unwrap());

        let mut all = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let page = d.followers_page("alice", cursor.as_deref(), 3).await.unwrap();
            all.extend(page.items);
            match page.next {
                Some(n) => cursor = Some(n),
                None => break,
            }
        }
        assert_eq!(all.len(), 7);
        assert!(all.windows(2).all(|w| w[0] < w[1]));

        assert!(d.remove_follower("alice", "https://r3.example/users/x").await.unwrap());
        assert!(!d.remove_follower("alice", "https://r3.example/users/x").await.unwrap());
        let page = d.followers_page("alice", None, 100).await.unwrap();
        assert_eq!(page.items.len(), 6);
        assert!(page.next.is_none());
    }

    #[tokio::test]
    async fn keys_and_last_activity() {
        let (_dir, d) = open();
        assert!(d.find_user("alice").await.unwrap().is_none());
        d.insert_user_with_keys("alice", "priv", "pub").await.unwrap();
        assert_eq!(d.resolve_public_key("alice").await.unwrap().as_deref(), Some("pub"));
        assert_eq!(d.signing_key("alice").await.unwrap().as_deref(), Some("priv"));

        let later = DateTime::from_timestamp_millis(2_000).unwrap();
        let earlier = DateTime::from_timestamp_millis(1_000).unwrap();
        d.update_last_activity("alice", later).await.unwrap();
        d.update_last_activity("alice", earlier).await.unwrap();
        let u = d.find_user("alice").await.unwrap().unwrap();
        assert_eq!(u.last_activity_at_ms, Some(2_000));
        assert!(d.insert_user_with_keys("../x", "a", "b").await.is_err());
    }
}
