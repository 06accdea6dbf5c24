/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

pub mod activity;
pub mod actor_resolver;
pub mod change_journal;
pub mod config;
pub mod context;
pub mod dead_letter;
pub mod delivery;
pub mod directory;
pub mod error;
pub mod expand;
pub mod fanout;
pub mod http_sig;
pub mod id_scheme;
pub mod inbound;
pub mod lookahead;
pub mod metadata_index;
pub mod object_store;
pub mod outbound;
pub mod push;
pub mod retry;
pub mod router;
pub mod runtime;
pub mod workflow;

#[cfg(test)]
mod test_support;

pub use config::PipelineConfig;
pub use context::PipelineContext;
pub use error::{StageError, StageResult};
pub use runtime::{replay_dead_letter, PipelineRuntime};
