/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Identifier and object-key layout.
//!
//! Users are `https://<domain>/users/<username>`; everything a user owns hangs
//! below that id. Object-store keys mirror it under each zone prefix.

use anyhow::{anyhow, Context, Result};
use http::Uri;
use mumble_protocol::Zone;
use uuid::Uuid;

/// Namespace for ids derived from object-store keys.
const KEY_NAMESPACE: Uuid = Uuid::from_u128(0x6d75_6d62_6c65_4b65_795f_4e53_0000_0001);

pub fn make_user_id(domain_name: &str, username: &str) -> String {
    format!("https://{domain_name}/users/{username}")
}

/// Splits a user-rooted id into `(domain, username, remaining path)`.
pub fn split_user_id(id: &str) -> Result<(String, String, String)> {
    let uri: Uri = id.parse().with_context(|| format!("parse id: {id}"))?;
    let host = uri
        .host()
        .filter(|h| !h.is_empty())
        .ok_or_else(|| anyhow!("no domain name: {id}"))?;
    let rest = uri
        .path()
        .strip_prefix("/users/")
        .ok_or_else(|| anyhow!("not a user id: {id}"))?;
    let (username, remaining) = match rest.find('/') {
        Some(i) => (&rest[..i], &rest[i..]),
        None => (rest, ""),
    };
    if username.is_empty() {
        return Err(anyhow!("not a user id: {id}"));
    }
    Ok((host.to_string(), username.to_string(), remaining.to_string()))
}

pub fn make_user_inbox_uri(user_id: &str) -> String {
    format!("{user_id}/inbox")
}

pub fn make_user_followers_uri(user_id: &str) -> String {
    format!("{user_id}/followers")
}

pub fn make_user_key_id(user_id: &str) -> String {
    format!("{user_id}#main-key")
}

pub fn make_activity_id(user_id: &str, unique_part: &str) -> String {
    format!("{user_id}/activities/{unique_part}")
}

pub fn make_post_id(user_id: &str, unique_part: &str) -> String {
    format!("{user_id}/posts/{unique_part}")
}

/// Parses `<user>/<category>/<unique>` into `(domain, username, category, unique)`.
pub fn parse_user_object_id(id: &str) -> Result<(String, String, String, String)> {
    let (domain, username, remaining) = split_user_id(id)?;
    let remaining = remaining.trim_end_matches('/');
    let mut parts = remaining.trim_start_matches('/').splitn(2, '/');
    let category = parts.next().unwrap_or_default();
    let unique = parts.next().unwrap_or_default();
    if category.is_empty() || unique.is_empty() || unique.contains('/') {
        return Err(anyhow!("not a user object id: {id}"));
    }
    Ok((domain, username, category.to_string(), unique.to_string()))
}

pub fn parse_user_activity_id(id: &str) -> Result<(String, String, String)> {
    let (domain, username, category, unique) = parse_user_object_id(id)?;
    if category != "activities" {
        return Err(anyhow!("invalid activity id: {id}"));
    }
    Ok((domain, username, unique))
}

pub fn parse_user_post_id(id: &str) -> Result<(String, String, String)> {
    let (domain, username, category, unique) = parse_user_object_id(id)?;
    if category != "posts" {
        return Err(anyhow!("invalid post id: {id}"));
    }
    Ok((domain, username, unique))
}

/// Unique part derived from a seed (an object key, a source activity id).
/// Same seed and purpose always give the same value.
pub fn derive_unique_part(purpose: &str, seed: &str) -> String {
    let name = format!("{purpose}\n{seed}");
    Uuid::new_v5(&KEY_NAMESPACE, name.as_bytes()).to_string()
}

pub fn make_inbox_key(username: &str, unique_part: &str) -> String {
    format!("{}users/{username}/{unique_part}.json", Zone::Inbox.prefix())
}

pub fn make_staging_outbox_key(username: &str, unique_part: &str) -> String {
    format!("{}users/{username}/{unique_part}.json", Zone::StagingOutbox.prefix())
}

pub fn make_outbox_key(username: &str, unique_part: &str) -> String {
    format!("{}users/{username}/{unique_part}.json", Zone::Outbox.prefix())
}

pub fn make_post_object_key(username: &str, unique_part: &str) -> String {
    format!("{}users/{username}/posts/{unique_part}.json", Zone::Objects.prefix())
}

/// Username in `<zone-prefix>users/<username>/...`.
pub fn username_from_key(zone: Zone, key: &str) -> Result<String> {
    let rest = key
        .strip_prefix(zone.prefix())
        .and_then(|r| r.strip_prefix("users/"))
        .ok_or_else(|| anyhow!("not a {zone} key: {key}"))?;
    match rest.split_once('/') {
        Some((username, tail)) if !username.is_empty() && !tail.is_empty() => {
            Ok(username.to_string())
        }
        _ => Err(anyhow!("no username in object key: {key}")),
    }
}

/// Parses `objects/users/<username>/<category>/<unique>.<ext>`.
pub fn parse_user_object_key(key: &str) -> Result<(String, String, String, String)> {
    let rest = key
        .strip_prefix(Zone::Objects.prefix())
        .and_then(|r| r.strip_prefix("users/"))
        .ok_or_else(|| anyhow!("not an object key: {key}"))?;
    let parts: Vec<&str> = rest.split('/').collect();
    let [username, category, file] = parts.as_slice() else {
        return Err(anyhow!("not an object key: {key}"));
    };
    let (unique, ext) = file
        .rsplit_once('.')
        .ok_or_else(|| anyhow!("no extension in object key: {key}"))?;
    if username.is_empty() || category.is_empty() || unique.is_empty() {
        return Err(anyhow!("not an object key: {key}"));
    }
    Ok((
        username.to_string(),
        category.to_string(),
        unique.to_string(),
        ext.to_string(),
    ))
}
