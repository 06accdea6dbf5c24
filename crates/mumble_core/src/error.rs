/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use reqwest::StatusCode;
use std::time::Duration;

/// Failure of a single stage invocation, classified for retry decisions.
#[derive(Debug, thiserror::Error)]
pub enum StageError {
    #[error("malformed input: {0}")]
    MalformedInput(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("transient dependency failure: {0}")]
    TransientDependency(String),

    #[error("recipient unreachable ({recipient}): {reason}")]
    RecipientUnreachable {
        recipient: String,
        reason: String,
        retryable: bool,
    },

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("configuration error: {0}")]
    Configuration(String),
}

pub type StageResult<T> = std::result::Result<T, StageError>;

impl StageError {
    pub fn malformed(msg: impl Into<String>) -> Self {
        StageError::MalformedInput(msg.into())
    }

    pub fn transient(msg: impl Into<String>) -> Self {
        StageError::TransientDependency(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        StageError::Configuration(msg.into())
    }

    /// Store/index/directory failures are assumed transient.
    pub fn from_anyhow(e: anyhow::Error) -> Self {
        StageError::TransientDependency(format!("{e:#}"))
    }

    pub fn unreachable(recipient: &str, status: StatusCode, body: &str) -> Self {
        let retryable = status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error();
        let body: String = body.chars().take(200).collect();
        StageError::RecipientUnreachable {
            recipient: recipient.to_string(),
            reason: format!("{status} {body}").trim().to_string(),
            retryable,
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            StageError::TransientDependency(_) | StageError::Timeout(_) => true,
            StageError::RecipientUnreachable { retryable, .. } => *retryable,
            StageError::MalformedInput(_)
            | StageError::NotFound(_)
            | StageError::Configuration(_) => false,
        }
    }

    /// Configuration errors must reach an operator instead of the dead-letter sink.
    pub fn is_fatal(&self) -> bool {
        matches!(self, StageError::Configuration(_))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            StageError::MalformedInput(_) => "malformed_input",
            StageError::NotFound(_) => "not_found",
            StageError::TransientDependency(_) => "transient_dependency",
            StageError::RecipientUnreachable { .. } => "recipient_unreachable",
            StageError::Timeout(_) => "timeout",
            StageError::Configuration(_) => "configuration",
        }
    }
}

impl From<serde_json::Error> for StageError {
    fn from(e: serde_json::Error) -> Self {
        StageError::MalformedInput(format!("invalid json: {e}"))
    }
}

impl From<reqwest::Error> for StageError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_builder() {
            return StageError::malformed(format!("http request: {e}"));
        }
        let recipient = e.url().map(|u| u.to_string()).unwrap_or_default();
        match e.status() {
            Some(status) => StageError::RecipientUnreachable {
                recipient,
                reason: status.to_string(),
                retryable: status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error(),
            },
            // No response at all: DNS, connect, TLS, timeout or a cut body.
            None => StageError::RecipientUnreachable {
                recipient,
                reason: if e.is_timeout() { format!("timed out: {e}") } else { e.to_string() },
                retryable: true,
            },
        }
    }
}
