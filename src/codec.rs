//! Wire/record encoding: JSON-compatible records keyed by a stable id, the
//! `{__type:"Date", value}` wrapping rule for timestamps, and preference
//! entry wrapping. A typed envelope with decode-or-skip semantics, same
//! shape as any other versioned record codec, just over JSON.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The fixed set of synced entity kinds. New kinds are added here, not discovered
/// at runtime, since every Named Map is a registry entry rather than an ad-hoc collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kind {
    Agents,
    Conversations,
    Knowledge,
    Tasks,
    Battles,
    Memories,
    Credentials,
    PinnedMessages,
    StudioEntries,
    Preferences,
}

impl Kind {
    pub const ALL: &'static [Kind] = &[
        Kind::Agents,
        Kind::Conversations,
        Kind::Knowledge,
        Kind::Tasks,
        Kind::Battles,
        Kind::Memories,
        Kind::Credentials,
        Kind::PinnedMessages,
        Kind::StudioEntries,
        Kind::Preferences,
    ];

    /// Synced kinds the Sync Bridge's record-oriented startup merge and
    /// remote-change handling apply to. Preferences are bridged by a
    /// dedicated path (`SyncBridge::init_preferences`/`set_preference`)
    /// since they are key-wrapped `{value, updatedAt}` entries, not Records.
    pub const RECORD_KINDS: &'static [Kind] = &[
        Kind::Agents,
        Kind::Conversations,
        Kind::Knowledge,
        Kind::Tasks,
        Kind::Battles,
        Kind::Memories,
        Kind::Credentials,
        Kind::PinnedMessages,
        Kind::StudioEntries,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Kind::Agents => "agents",
            Kind::Conversations => "conversations",
            Kind::Knowledge => "knowledge",
            Kind::Tasks => "tasks",
            Kind::Battles => "battles",
            Kind::Memories => "memories",
            Kind::Credentials => "credentials",
            Kind::PinnedMessages => "pinnedMessages",
            Kind::StudioEntries => "studioEntries",
            Kind::Preferences => "preferences",
        }
    }

    pub fn table_name(self) -> &'static str {
        match self {
            Kind::Agents => "agents",
            Kind::Conversations => "conversations",
            Kind::Knowledge => "knowledge",
            Kind::Tasks => "tasks",
            Kind::Battles => "battles",
            Kind::Memories => "memories",
            Kind::Credentials => "credentials",
            Kind::PinnedMessages => "pinned_messages",
            Kind::StudioEntries => "studio_entries",
            Kind::Preferences => "preferences",
        }
    }
}

/// A record as stored in a Named Map: an `id` plus opaque record-kind-specific
/// fields, stored wholesale (not field-merged) per the Shared Document's rationale.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Record {
    pub id: String,
    #[serde(flatten)]
    pub fields: Value,
}

impl Record {
    /// Extract the record's effective timestamp: the first present of
    /// `updatedAt`, `createdAt`, `timestamp`, `learnedAt`, coerced to an
    /// absolute instant in epoch milliseconds.
    pub fn effective_timestamp_millis(&self) -> Option<i64> {
        const FIELDS: &[&str] = &["updatedAt", "createdAt", "timestamp", "learnedAt"];
        let obj = self.fields.as_object()?;
        for field in FIELDS {
            if let Some(v) = obj.get(*field) {
                if let Some(ms) = decode_date_value(v) {
                    return Some(ms);
                }
            }
        }
        None
    }
}

/// Decode a value that may be a raw ISO string, epoch millis, or the
/// `{__type:"Date", value}` wrapper used to cross the Shared Document boundary.
fn decode_date_value(v: &Value) -> Option<i64> {
    match v {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => parse_iso_millis(s),
        Value::Object(obj) => {
            if obj.get("__type").and_then(Value::as_str) == Some("Date") {
                match obj.get("value") {
                    Some(Value::String(s)) => parse_iso_millis(s),
                    Some(Value::Number(n)) => n.as_i64(),
                    _ => None,
                }
            } else {
                None
            }
        }
        _ => None,
    }
}

/// Parse an RFC 3339 / ISO-8601 timestamp to epoch milliseconds. Millis-since-epoch
/// encoded directly as a numeric string is also accepted, since some call sites
/// stringify an already-epoch timestamp.
fn parse_iso_millis(s: &str) -> Option<i64> {
    if let Ok(ms) = s.parse::<i64>() {
        return Some(ms);
    }
    chrono::DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.timestamp_millis())
}

/// The `{value, updatedAt}` wrapper every preference entry is stored as.
/// Consumers tolerate an unwrapped legacy value on read but never write one.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PreferenceEntry {
    pub value: Value,
    #[serde(rename = "updatedAt")]
    pub updated_at: String,
}

impl PreferenceEntry {
    pub fn new(value: Value, updated_at_iso: impl Into<String>) -> Self {
        Self {
            value,
            updated_at: updated_at_iso.into(),
        }
    }

    /// Parse either the wrapped form or a bare legacy value (treated as having no timestamp).
    pub fn from_json(raw: &Value) -> Self {
        if let Ok(wrapped) = serde_json::from_value::<PreferenceEntry>(raw.clone()) {
            return wrapped;
        }
        Self {
            value: raw.clone(),
            updated_at: String::new(),
        }
    }
}
