/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::activity::{Activity, PUBLIC_ADDRESS};
use crate::actor_resolver::RemoteActor;
use crate::context::PipelineContext;
use crate::directory::UserDirectory;
use crate::error::{StageError, StageResult};
use crate::id_scheme::{make_user_inbox_uri, split_user_id, username_from_key};
use crate::lookahead::filter_map_ordered;
use crate::object_store::load_json;
use crate::push::expect_zone;
use futures_util::stream::{self, BoxStream, StreamExt};
use futures_util::FutureExt;
use mumble_protocol::{ObjectKey, Recipient, Zone};
use serde_json::Value;
use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Delivery targets in first-seen order, without duplicates.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecipientSet {
    order: Vec<Recipient>,
    seen: HashSet<Recipient>,
}

impl RecipientSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false when already present.
    pub fn insert(&mut self, recipient: Recipient) -> bool {
        if self.seen.contains(&recipient) {
            return false;
        }
        self.seen.insert(recipient.clone());
        self.order.push(recipient);
        true
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn into_vec(self) -> Vec<Recipient> {
        self.order
    }
}

impl FromIterator<Recipient> for RecipientSet {
    fn from_iter<I: IntoIterator<Item = Recipient>>(iter: I) -> Self {
        let mut set = RecipientSet::new();
        for s in iter {
            set.insert(s);
        }
        set
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Target {
    Inbox(String),
    Followers(String),
    /// Actor whose inbox could not be looked up right now.
    Deferred(String),
    Skip(&'static str),
}

/// Output of recipient expansion: the loaded activity and where it goes.
#[derive(Debug, Clone)]
pub struct Expansion {
    pub activity: Activity,
    pub recipients: RecipientSet,
}

pub async fn expand_recipients(ctx: &PipelineContext, key: &ObjectKey) -> StageResult<Expansion> {
    expect_zone(key, Zone::Outbox)?;
    let owner = username_from_key(Zone::Outbox, &key.key)
        .map_err(|e| StageError::malformed(format!("{e:#}")))?;
    let activity = Activity::parse(load_json(ctx.store.as_ref(), key).await?)?;
    let sender = activity.actor().to_string();
    if sender != ctx.user_id(&owner)? {
        return Err(StageError::malformed(format!("outbox of {owner} holds activity by {sender}")));
    }

    let mut recipients = RecipientSet::new();
    for address in addresses_of(&activity) {
        if address == sender || address == PUBLIC_ADDRESS {
            continue;
        }
        match resolve_target(ctx, &address).await? {
            Target::Inbox(inbox) => {
                recipients.insert(Recipient::Inbox(inbox));
            }
            Target::Deferred(actor) => {
                recipients.insert(Recipient::Actor(actor));
            }
            Target::Followers(username) => {
                let n = expand_followers(ctx, &username, &sender, &mut recipients).await?;
                debug!(username = %username, resolved = n, "followers expanded");
            }
            Target::Skip(reason) => warn!(address = %address, reason, "recipient skipped"),
        }
    }
    info!(key = %key.key, recipients = recipients.len(), "recipients expanded");
    Ok(Expansion { activity, recipients })
}

/// `Accept` goes back to whoever sent the accepted activity; everything else
/// follows its own addressing.
fn addresses_of(activity: &Activity) -> Vec<String> {
    if activity.kind() == "Accept" {
        if let Some(actor) = activity
            .object()
            .as_ref()
            .and_then(|o| o.inline())
            .and_then(|o| o.get("actor"))
            .and_then(Value::as_str)
        {
            return vec![actor.to_string()];
        }
    }
    activity.addressees()
}

async fn resolve_target(ctx: &PipelineContext, address: &str) -> StageResult<Target> {
    let domain = ctx.domain_name()?;
    if let Ok((d, username, rest)) = split_user_id(address) {
        if d == domain {
            return Ok(match rest.trim_end_matches('/') {
                "" => Target::Inbox(make_user_inbox_uri(address)),
                "/followers" => Target::Followers(username),
                _ => Target::Skip("unsupported local collection"),
            });
        }
    }
    match ctx.actors.resolve(address).await {
        Ok(actor @ RemoteActor::Actor { .. }) => Ok(actor
            .delivery_inbox()
            .map(|s| Target::Inbox(s.to_string()))
            .unwrap_or(Target::Skip("no inbox"))),
        Ok(RemoteActor::Collection) => Ok(Target::Skip("remote collection")),
        Ok(RemoteActor::Gone) => Ok(Target::Skip("gone")),
        Err(e) if e.is_fatal() => Err(e),
        Err(e) if e.is_retryable() => {
            // Deliver-One retries the lookup under its own budget.
            warn!(address, error = %e, "inbox lookup deferred to delivery");
            Ok(Target::Deferred(address.to_string()))
        }
        Err(e) => {
            warn!(address, error = %e, "recipient could not be resolved");
            Ok(Target::Skip("unresolvable"))
        }
    }
}

fn follower_ids(
    directory: Arc<dyn UserDirectory>,
    username: String,
    page_size: u32,
) -> BoxStream<'static, anyhow::Result<String>> {
    // state: None = done, Some(cursor) = fetch the next page after cursor
    stream::unfold(Some(None::<String>), move |state| {
        let directory = directory.clone();
        let username = username.clone();
        async move {
            let cursor = state?;
            match directory.followers_page(&username, cursor.as_deref(), page_size).await {
                Ok(page) => {
                    let next = page.next.map(Some);
                    let items: Vec<anyhow::Result<String>> = page.items.into_iter().map(Ok).collect();
                    Some((stream::iter(items), next))
                }
                Err(e) => Some((stream::iter(vec![Err(e)]), None)),
            }
        }
    })
    .flatten()
    .boxed()
}

/// Pages through the user's followers, resolving inboxes through the
/// look-ahead window. Returns how many inboxes were resolved.
async fn expand_followers(
    ctx: &PipelineContext,
    username: &str,
    sender: &str,
    out: &mut RecipientSet,
) -> StageResult<usize> {
    let source = follower_ids(ctx.directory.clone(), username.to_string(), ctx.config.followers_page_size);
    let resolver = ctx.clone();
    let sender = sender.to_string();
    let mut rx = filter_map_ordered(source, ctx.config.lookahead, move |follower| {
        let ctx = resolver.clone();
        let sender = sender.clone();
        async move {
            let follower = match follower {
                Ok(f) => f,
                Err(e) => return Some(Err(StageError::from_anyhow(e))),
            };
            if follower == sender || follower == PUBLIC_ADDRESS {
                return None;
            }
            let resolved = AssertUnwindSafe(resolve_target(&ctx, &follower)).catch_unwind().await;
            match resolved {
                Ok(Ok(Target::Inbox(inbox))) => Some(Ok(Recipient::Inbox(inbox))),
                Ok(Ok(Target::Deferred(actor))) => Some(Ok(Recipient::Actor(actor))),
                Ok(Ok(Target::Followers(_))) | Ok(Ok(Target::Skip(_))) => {
                    warn!(follower = %follower, "follower skipped");
                    None
                }
                Ok(Err(e)) => Some(Err(e)),
                Err(_) => {
                    error!(follower = %follower, "follower lookup panicked, left to delivery");
                    Some(Ok(Recipient::Actor(follower)))
                }
            }
        }
    });

    let mut resolved = 0;
    while let Some(item) = rx.recv().await {
        let recipient = item.map_err(|e| StageError::transient(format!("follower lookup task: {e}")))??;
        out.insert(recipient);
        resolved += 1;
    }
    Ok(resolved)
}
