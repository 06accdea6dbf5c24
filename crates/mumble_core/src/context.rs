/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::actor_resolver::ActorResolver;
use crate::config::PipelineConfig;
use crate::dead_letter::DeadLetterSink;
use crate::delivery::InboxDeliverer;
use crate::directory::UserDirectory;
use crate::error::StageResult;
use crate::id_scheme::make_user_id;
use crate::metadata_index::MetadataIndex;
use crate::object_store::ObjectStore;
use std::sync::Arc;

/// Handles shared by every stage invocation. Cheap to clone.
#[derive(Clone)]
pub struct PipelineContext {
    pub config: Arc<PipelineConfig>,
    pub store: Arc<dyn ObjectStore>,
    pub index: Arc<dyn MetadataIndex>,
    pub directory: Arc<dyn UserDirectory>,
    pub actors: Arc<dyn ActorResolver>,
    pub deliverer: Arc<dyn InboxDeliverer>,
    pub dead_letters: Arc<dyn DeadLetterSink>,
}

impl PipelineContext {
    pub fn domain_name(&self) -> StageResult<&str> {
        self.config.domain_name()
    }

    pub fn user_id(&self, username: &str) -> StageResult<String> {
        Ok(make_user_id(self.domain_name()?, username))
    }
}
