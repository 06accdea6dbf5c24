/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::directory::UserDirectory;
use crate::error::{StageError, StageResult};
use crate::http_sig::{RequestSigner, POST_SIGNED_HEADERS};
use crate::id_scheme::{make_user_key_id, split_user_id};
use async_trait::async_trait;
use http::{HeaderMap, Method, Uri};
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

pub const ACTIVITY_JSON: &str = "application/activity+json";

/// Pushes one serialized activity to one remote inbox on behalf of a local actor.
#[async_trait]
pub trait InboxDeliverer: Send + Sync {
    async fn post(&self, sender_actor: &str, inbox: &str, body: &[u8]) -> StageResult<()>;
}

pub struct HttpDeliverer {
    client: reqwest::Client,
    directory: Arc<dyn UserDirectory>,
    domain_name: String,
    signers: RwLock<HashMap<String, RequestSigner>>,
}

impl HttpDeliverer {
    pub fn new(client: reqwest::Client, directory: Arc<dyn UserDirectory>, domain_name: &str) -> Self {
        Self {
            client,
            directory,
            domain_name: domain_name.to_string(),
            signers: RwLock::new(HashMap::new()),
        }
    }

    async fn signer_for(&self, sender_actor: &str) -> StageResult<RequestSigner> {
        if let Some(s) = self.signers.read().await.get(sender_actor) {
            return Ok(s.clone());
        }
        let (domain, username, rest) = split_user_id(sender_actor)
            .map_err(|e| StageError::malformed(format!("sender is not a user id: {e:#}")))?;
        if domain != self.domain_name || !rest.is_empty() {
            return Err(StageError::malformed(format!("sender is not a local user: {sender_actor}")));
        }
        let pem = self
            .directory
            .signing_key(&username)
            .await
            .map_err(StageError::from_anyhow)?
            .ok_or_else(|| StageError::NotFound(format!("no signing key for {username}")))?;
        let signer = RequestSigner::from_pkcs8_pem(&make_user_key_id(sender_actor), &pem)
            .map_err(|e| StageError::config(format!("signing key of {username}: {e:#}")))?;
        self.signers
            .write()
            .await
            .insert(sender_actor.to_string(), signer.clone());
        Ok(signer)
    }
}

#[async_trait]
impl InboxDeliverer for HttpDeliverer {
    async fn post(&self, sender_actor: &str, inbox: &str, body: &[u8]) -> StageResult<()> {
        let uri: Uri = inbox
            .parse()
            .map_err(|e| StageError::malformed(format!("inbox url {inbox}: {e}")))?;
        let signer = self.signer_for(sender_actor).await?;

        let mut headers = HeaderMap::new();
        headers.insert("Content-Type", http::HeaderValue::from_static(ACTIVITY_JSON));
        signer
            .sign(&Method::POST, &uri, &mut headers, body, POST_SIGNED_HEADERS)
            .map_err(|e| StageError::malformed(format!("sign request: {e:#}")))?;

        let mut req = self.client.post(inbox).header(ACCEPT, ACTIVITY_JSON);
        for (k, v) in headers.iter() {
            req = req.header(k.as_str(), v.to_str().unwrap_or_default());
        }
        req = req.header(CONTENT_TYPE, ACTIVITY_JSON);

        let resp = req
            .body(body.to_vec())
            .send()
            .await
            .map_err(|e| StageError::RecipientUnreachable {
                recipient: inbox.to_string(),
                reason: e.to_string(),
                retryable: true,
            })?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(StageError::unreachable(inbox, status, &text));
        }
        debug!(inbox, %status, "delivered");
        Ok(())
    }
}
