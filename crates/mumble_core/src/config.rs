/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::error::{StageError, StageResult};
use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Retry and timeout budget of a single stage.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct StagePolicy {
    pub timeout_secs: u64,
    pub max_retries: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for StagePolicy {
    fn default() -> Self {
        Self {
            timeout_secs: 10,
            max_retries: 3,
            base_backoff_ms: 200,
            max_backoff_ms: 5_000,
        }
    }
}

impl StagePolicy {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StagePolicies {
    pub translate_inbound: StagePolicy,
    pub stage_response: StagePolicy,
    pub translate_outbound: StagePolicy,
    pub push_staged_object: StagePolicy,
    pub push_activity: StagePolicy,
    pub expand_recipients: StagePolicy,
    pub deliver_one: StagePolicy,
}

impl Default for StagePolicies {
    fn default() -> Self {
        Self {
            translate_inbound: StagePolicy::default(),
            stage_response: StagePolicy::default(),
            translate_outbound: StagePolicy::default(),
            push_staged_object: StagePolicy::default(),
            push_activity: StagePolicy::default(),
            expand_recipients: StagePolicy {
                timeout_secs: 3600,
                max_retries: 2,
                base_backoff_ms: 1_000,
                max_backoff_ms: 30_000,
            },
            deliver_one: StagePolicy {
                timeout_secs: 30,
                max_retries: 5,
                base_backoff_ms: 500,
                max_backoff_ms: 60_000,
            },
        }
    }
}

impl StagePolicies {
    fn all(&self) -> [(&'static str, &StagePolicy); 7] {
        [
            ("translate_inbound", &self.translate_inbound),
            ("stage_response", &self.stage_response),
            ("translate_outbound", &self.translate_outbound),
            ("push_staged_object", &self.push_staged_object),
            ("push_activity", &self.push_activity),
            ("expand_recipients", &self.expand_recipients),
            ("deliver_one", &self.deliver_one),
        ]
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Canonical domain name of this server, e.g. `mumble.example.com`.
    pub domain_name: Option<String>,
    pub data_dir: PathBuf,
    /// Ceiling on concurrently in-flight deliveries of one fan-out.
    pub fanout_concurrency: usize,
    /// Look-ahead window used while resolving follower inboxes.
    pub lookahead: usize,
    pub followers_page_size: u32,
    pub http_timeout_secs: u64,
    pub actor_cache_ttl_secs: u64,
    /// Workflows the change router runs at once.
    pub router_concurrency: usize,
    /// Fallback poll of the change journal for writes made by other processes.
    pub journal_poll_ms: u64,
    pub stages: StagePolicies,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            domain_name: None,
            data_dir: PathBuf::from("mumble-data"),
            fanout_concurrency: 10,
            lookahead: 10,
            followers_page_size: 100,
            http_timeout_secs: 10,
            actor_cache_ttl_secs: 300,
            router_concurrency: 64,
            journal_poll_ms: 500,
            stages: StagePolicies::default(),
        }
    }
}

impl PipelineConfig {
    /// Reads a JSON config file (if any) and applies `MUMBLE_*` env overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut cfg = match path {
            Some(p) => {
                let bytes = std::fs::read(p)
                    .with_context(|| format!("read config: {}", p.display()))?;
                serde_json::from_slice::<PipelineConfig>(&bytes)
                    .with_context(|| format!("parse config: {}", p.display()))?
            }
            None => PipelineConfig::default(),
        };
        cfg.apply_env();
        Ok(cfg)
    }

    fn apply_env(&mut self) {
        if let Ok(v) = std::env::var("MUMBLE_DOMAIN_NAME") {
            let v = v.trim().to_string();
            if !v.is_empty() {
                self.domain_name = Some(v);
            }
        }
        if let Ok(v) = std::env::var("MUMBLE_DATA_DIR") {
            if !v.trim().is_empty() {
                self.data_dir = PathBuf::from(v.trim());
            }
        }
        if let Some(n) = std::env::var("MUMBLE_FANOUT_CONCURRENCY")
            .ok()
            .and_then(|v| v.trim().parse::<usize>().ok())
        {
            self.fanout_concurrency = n;
        }
        if let Some(n) = std::env::var("MUMBLE_LOOKAHEAD")
            .ok()
            .and_then(|v| v.trim().parse::<usize>().ok())
        {
            self.lookahead = n;
        }
    }

    pub fn validate(&self) -> StageResult<()> {
        self.domain_name()?;
        if self.fanout_concurrency == 0 {
            return Err(StageError::config("fanout_concurrency must be > 0"));
        }
        if self.lookahead == 0 {
            return Err(StageError::config("lookahead must be > 0"));
        }
        if self.router_concurrency == 0 {
            return Err(StageError::config("router_concurrency must be > 0"));
        }
        if self.journal_poll_ms == 0 {
            return Err(StageError::config("journal_poll_ms must be > 0"));
        }
        for (name, policy) in self.stages.all() {
            if policy.timeout_secs == 0 {
                return Err(StageError::config(format!("{name}.timeout_secs must be > 0")));
            }
        }
        Ok(())
    }

    pub fn domain_name(&self) -> StageResult<&str> {
        self.domain_name
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| StageError::config("domain_name is not configured"))
    }

    pub fn objects_dir(&self) -> PathBuf {
        self.data_dir.join("objects")
    }

    pub fn index_db_path(&self) -> PathBuf {
        self.data_dir.join("metadata_index.sqlite")
    }

    pub fn journal_db_path(&self) -> PathBuf {
        self.data_dir.join("change_journal.sqlite")
    }

    pub fn users_db_path(&self) -> PathBuf {
        self.data_dir.join("users.sqlite")
    }

    pub fn dead_letter_db_path(&self) -> PathBuf {
        self.data_dir.join("dead_letters.sqlite")
    }
}
