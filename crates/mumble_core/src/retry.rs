/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::config::StagePolicy;
use crate::dead_letter::DeadLetterSink;
use crate::error::{StageError, StageResult};
use mumble_protocol::DeadLetterInput;
use rand::{thread_rng, Rng};
use std::future::Future;
use std::time::Duration;
use tracing::{error, warn};

/// Runs one stage under its policy: per-attempt timeout, bounded retries with
/// jittered exponential backoff, then the dead-letter sink.
///
/// Configuration errors skip the sink and are raised as operator alerts.
pub async fn run_stage<T, F, Fut>(
    stage: &'static str,
    policy: &StagePolicy,
    input: &DeadLetterInput,
    sink: &dyn DeadLetterSink,
    mut op: F,
) -> StageResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = StageResult<T>>,
{
    let max_attempts = policy.max_attempts();
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        let result = match tokio::time::timeout(policy.timeout(), op()).await {
            Ok(r) => r,
            Err(_) => Err(StageError::Timeout(policy.timeout())),
        };
        let err = match result {
            Ok(v) => return Ok(v),
            Err(e) => e,
        };

        if err.is_fatal() {
            error!(stage, attempt, alert = true, error = %err, "stage failed on configuration");
            return Err(err);
        }
        if err.is_retryable() && attempt < max_attempts {
            let delay = next_backoff(attempt, policy.base_backoff_ms, policy.max_backoff_ms);
            warn!(stage, attempt, max_attempts, delay_ms = delay.as_millis() as u64, error = %err, "stage failed, retrying");
            tokio::time::sleep(delay).await;
            continue;
        }

        match sink.record(stage, input, &err, attempt).await {
            Ok(id) => error!(stage, attempt, dead_letter = %id, error = %err, "stage dead-lettered"),
            Err(e) => error!(stage, attempt, error = %err, sink_error = %e, "stage failed and dead-letter write failed"),
        }
        return Err(err);
    }
}

pub fn next_backoff(attempt: u32, base_ms: u64, max_ms: u64) -> Duration {
    let pow = attempt.saturating_sub(1).min(20);
    let ms = base_ms.saturating_mul(1u64 << pow).min(max_ms);
    // up to 20% jitter
    let jitter_ms = if ms >= 5 { thread_rng().gen_range(0..=ms / 5) } else { 0 };
    Duration::from_millis(ms + jitter_ms)
}
