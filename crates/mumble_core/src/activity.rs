/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::error::{StageError, StageResult};
use serde_json::{Map, Value};

pub const ACTIVITY_STREAMS_CONTEXT: &str = "https://www.w3.org/ns/activitystreams";
pub const PUBLIC_ADDRESS: &str = "https://www.w3.org/ns/activitystreams#Public";

/// `object` of an activity: embedded, or referenced by id.
#[derive(Debug, Clone, PartialEq)]
pub enum ObjectRef {
    Id(String),
    Inline(Value),
}

impl ObjectRef {
    pub fn id(&self) -> Option<&str> {
        match self {
            ObjectRef::Id(id) => Some(id),
            ObjectRef::Inline(v) => v.get("id").and_then(Value::as_str),
        }
    }

    pub fn inline(&self) -> Option<&Value> {
        match self {
            ObjectRef::Inline(v) => Some(v),
            ObjectRef::Id(_) => None,
        }
    }
}

/// An activity document. Only `type`, `actor`, `object` and addressing are interpreted.
#[derive(Debug, Clone, PartialEq)]
pub struct Activity {
    doc: Map<String, Value>,
}

impl Activity {
    pub fn parse(value: Value) -> StageResult<Self> {
        let Value::Object(doc) = value else {
            return Err(StageError::malformed("activity must be a JSON object"));
        };
        match doc.get("type") {
            Some(Value::String(t)) if !t.trim().is_empty() => {}
            _ => return Err(StageError::malformed("activity has no type")),
        }
        match doc.get("actor") {
            Some(Value::String(a)) if !a.trim().is_empty() => {}
            _ => return Err(StageError::malformed("activity has no actor")),
        }
        if let Some(obj) = doc.get("object") {
            if !obj.is_string() && !obj.is_object() {
                return Err(StageError::malformed("activity object must be an id or an object"));
            }
        }
        Ok(Self { doc })
    }

    pub fn id(&self) -> Option<&str> {
        self.doc.get("id").and_then(Value::as_str).filter(|s| !s.is_empty())
    }

    pub fn kind(&self) -> &str {
        self.doc.get("type").and_then(Value::as_str).unwrap_or_default()
    }

    pub fn actor(&self) -> &str {
        self.doc.get("actor").and_then(Value::as_str).unwrap_or_default()
    }

    pub fn published(&self) -> Option<&str> {
        self.doc.get("published").and_then(Value::as_str)
    }

    pub fn object(&self) -> Option<ObjectRef> {
        match self.doc.get("object")? {
            Value::String(s) => Some(ObjectRef::Id(s.clone())),
            v @ Value::Object(_) => Some(ObjectRef::Inline(v.clone())),
            _ => None,
        }
    }

    /// Ready to leave this server: has `@context`, `id` and `type`.
    pub fn is_deliverable(&self) -> bool {
        self.doc.contains_key("@context") && self.id().is_some() && !self.kind().is_empty()
    }

    /// Every `to`/`cc`/`bcc` target, in document order, duplicates kept.
    pub fn addressees(&self) -> Vec<String> {
        let mut out = Vec::new();
        for field in ["to", "cc", "bcc"] {
            collect_field(&self.doc, field, &mut out);
        }
        out
    }

    pub fn is_public(&self) -> bool {
        is_public_document(&self.doc)
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.doc)
    }

    pub fn to_vec(&self) -> Vec<u8> {
        serde_json::to_vec(&self.doc).unwrap_or_default()
    }
}

fn collect_field(doc: &Map<String, Value>, field: &str, out: &mut Vec<String>) {
    let Some(v) = doc.get(field) else { return };
    match v {
        Value::String(s) => out.push(s.clone()),
        Value::Array(arr) => {
            for item in arr {
                if let Value::String(s) = item {
                    out.push(s.clone());
                }
            }
        }
        _ => {}
    }
}

pub fn is_public_document(doc: &Map<String, Value>) -> bool {
    fn has_public(v: &Value) -> bool {
        match v {
            Value::String(s) => s == PUBLIC_ADDRESS,
            Value::Array(arr) => arr.iter().any(has_public),
            _ => false,
        }
    }
    doc.get("to").map(has_public).unwrap_or(false)
        || doc.get("cc").map(has_public).unwrap_or(false)
}

/// `inReplyTo` of an object, as an id.
pub fn in_reply_to(obj: &Value) -> Option<String> {
    match obj.get("inReplyTo")? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Object(m) => m.get("id").and_then(Value::as_str).map(str::to_string),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parse_requires_type_and_actor() {
        assert!(Activity::parse(json!({"type": "Follow"})).is_err());
        assert!(Activity::parse(json!({"actor": "https://a/users/x"})).is_err());
        assert!(Activity::parse(json!([1, 2])).is_err());
        assert!(Activity::parse(json!({"type": "Follow", "actor": "a", "object": 3})).is_err());
        let a = Activity::parse(json!({
            "type": "Follow",
            "actor": "https://remote.example/users/bob",
            "object": "https://mumble.example/users/alice",
        }))
        .unwrap();
        assert_eq!(a.kind(), "Follow");
        assert_eq!(a.object(), Some(ObjectRef::Id("https://mumble.example/users/alice".into())));
        assert!(!a.is_deliverable());
    }

    #[test]
    fn addressing() {
        let a = Activity::parse(json!({
            "type": "Create",
            "actor": "https://mumble.example/users/alice",
            "to": PUBLIC_ADDRESS,
            "cc": ["https://mumble.example/users/alice/followers", 5],
            "bcc": ["https://remote.example/users/bob"],
        }))
        .unwrap();
        assert!(a.is_public());
        assert_eq!(
            a.addressees(),
            vec![
                PUBLIC_ADDRESS.to_string(),
                "https://mumble.example/users/alice/followers".to_string(),
                "https://remote.example/users/bob".to_string(),
            ]
        );
    }

    #[test]
    fn reply_target() {
        assert_eq!(in_reply_to(&json!({"inReplyTo": "x"})), Some("x".into()));
        assert_eq!(in_reply_to(&json!({"inReplyTo": {"id": "y"}})), Some("y".into()));
        assert_eq!(in_reply_to(&json!({"content": "hi"})), None);
    }
}
