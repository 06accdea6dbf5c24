/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Shared vocabulary of the activity dispatch pipeline: zones, object keys,
//! store notifications, workflow inputs and dead-letter records.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Logical partition of the object store, identified by key prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Zone {
    Inbox,
    StagingOutbox,
    Outbox,
    Objects,
    Media,
}

impl Zone {
    pub const ALL: [Zone; 5] = [
        Zone::Inbox,
        Zone::StagingOutbox,
        Zone::Outbox,
        Zone::Objects,
        Zone::Media,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Zone::Inbox => "inbox",
            Zone::StagingOutbox => "staging-outbox",
            Zone::Outbox => "outbox",
            Zone::Objects => "objects",
            Zone::Media => "media",
        }
    }

    /// Key prefix that routes an object into this zone.
    pub fn prefix(&self) -> &'static str {
        match self {
            Zone::Inbox => "inbox/",
            Zone::StagingOutbox => "staging/",
            Zone::Outbox => "outbox/",
            Zone::Objects => "objects/",
            Zone::Media => "media/",
        }
    }

    pub fn from_key(key: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|z| key.starts_with(z.prefix()))
    }
}

impl fmt::Display for Zone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Location of an object in the store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectKey {
    pub zone: Zone,
    pub key: String,
}

impl ObjectKey {
    pub fn new(zone: Zone, key: impl Into<String>) -> Self {
        Self {
            zone,
            key: key.into(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.zone, self.key)
    }
}

/// Raw object-created notification emitted by the store for every write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectCreated {
    /// Zone tag reported by the store; routing only trusts `key`.
    pub zone: Option<Zone>,
    pub key: String,
    pub size: u64,
}

/// A freshly written object that drives exactly one workflow.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkItem {
    pub zone: Zone,
    pub key: String,
}

impl WorkItem {
    pub fn object_key(&self) -> ObjectKey {
        ObjectKey::new(self.zone, self.key.clone())
    }

    /// Input shape expected by the workflow bound to this item's zone.
    pub fn input(&self) -> WorkflowInput {
        match self.zone {
            Zone::Inbox | Zone::Outbox => WorkflowInput::Activity(self.object_key()),
            Zone::StagingOutbox | Zone::Objects | Zone::Media => {
                WorkflowInput::Object(self.object_key())
            }
        }
    }
}

/// Workflow input: `{"activity": {zone, key}}` or `{"object": {zone, key}}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowInput {
    Activity(ObjectKey),
    Object(ObjectKey),
}

impl WorkflowInput {
    pub fn object_key(&self) -> &ObjectKey {
        match self {
            WorkflowInput::Activity(k) | WorkflowInput::Object(k) => k,
        }
    }
}

/// Delivery target: an inbox resolved during expansion, or an actor whose
/// inbox is looked up by the delivery itself.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Recipient {
    Inbox(String),
    Actor(String),
}

impl Recipient {
    pub fn uri(&self) -> &str {
        match self {
            Recipient::Inbox(u) | Recipient::Actor(u) => u,
        }
    }
}

impl fmt::Display for Recipient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Recipient::Inbox(u) => write!(f, "inbox {u}"),
            Recipient::Actor(u) => write!(f, "actor {u}"),
        }
    }
}

/// Unit of work for a single delivery. Rebuilt identically on every retry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryAttempt {
    pub activity: Value,
    pub recipient: Recipient,
}

/// What a dead-lettered stage was given, so an operator can replay it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DeadLetterInput {
    WorkItem { item: WorkItem },
    Delivery { attempt: DeliveryAttempt },
    Raw { value: Value },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterRecord {
    pub id: String,
    pub stage: String,
    pub input: DeadLetterInput,
    pub error_kind: String,
    pub last_error: String,
    pub attempts: u32,
    pub created_at_ms: i64,
    pub replayed_at_ms: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zone_prefixes_are_disjoint() {
        for a in Zone::ALL {
            for b in Zone::ALL {
                if a != b {
                    assert!(!a.prefix().starts_with(b.prefix()), "{a} overlaps {b}");
                }
            }
        }
    }

    #[test]
    fn zone_from_key() {
        assert_eq!(Zone::from_key("staging/users/alice/raw1"), Some(Zone::StagingOutbox));
        assert_eq!(Zone::from_key("objects/users/alice/posts/x.json"), Some(Zone::Objects));
        assert_eq!(Zone::from_key("stagingx/users/alice"), None);
        assert_eq!(Zone::from_key("unknown/key"), None);
    }

    #[test]
    fn workflow_input_shape() {
        let item = WorkItem {
            zone: Zone::Outbox,
            key: "outbox/users/alice/a.json".to_string(),
        };
        let v = serde_json::to_value(item.input()).unwrap();
        assert_eq!(v["activity"]["zone"], "outbox");
        assert_eq!(v["activity"]["key"], "outbox/users/alice/a.json");

        let item = WorkItem {
            zone: Zone::StagingOutbox,
            key: "staging/users/alice/raw1".to_string(),
        };
        let v = serde_json::to_value(item.input()).unwrap();
        assert_eq!(v["object"]["zone"], "staging-outbox");
    }

    #[test]
    fn delivery_attempt_shape() {
        let attempt = DeliveryAttempt {
            activity: serde_json::json!({"id": "a"}),
            recipient: Recipient::Actor("https://r.example/users/bob".to_string()),
        };
        let v = serde_json::to_value(&attempt).unwrap();
        assert_eq!(v["recipient"]["actor"], "https://r.example/users/bob");
        let back: DeliveryAttempt = serde_json::from_value(v).unwrap();
        assert_eq!(back.recipient.uri(), "https://r.example/users/bob");
    }
}
