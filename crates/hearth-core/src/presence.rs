//! Presence of the account's other client instances.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One connected client instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceEntry {
    pub instance_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub roles: Vec<String>,
    /// Unix milliseconds.
    #[serde(default)]
    pub last_seen_ms: u64,
    /// Metadata fields without a dedicated slot.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl PresenceEntry {
    pub fn new(instance_id: impl Into<String>) -> Self {
        Self {
            instance_id: instance_id.into(),
            device_id: None,
            display_name: None,
            platform: None,
            roles: Vec::new(),
            last_seen_ms: 0,
            extra: serde_json::Map::new(),
        }
    }
}

/// The three update shapes carried by presence events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PresenceUpdate {
    /// Authoritative list; replaces everything held.
    Replace { entries: Vec<PresenceEntry> },
    /// Upsert by instance id.
    Join { entry: PresenceEntry },
    /// Remove by instance id.
    #[serde(rename_all = "camelCase")]
    Leave { instance_id: String },
}

impl PresenceUpdate {
    /// Decode an event payload.
    ///
    /// Besides the tagged shapes, a bare `{"presence": [...]}` list is
    /// accepted as a full replacement.
    pub fn from_payload(payload: &serde_json::Value) -> Result<Self, serde_json::Error> {
        if let Some(list) = payload.get("presence") {
            let entries = Vec::<PresenceEntry>::deserialize(list)?;
            return Ok(Self::Replace { entries });
        }
        Self::deserialize(payload)
    }
}

/// Presence set keyed by instance id.
///
/// Keys are kept sorted, so iteration order is stable and the first key is
/// the lexically smallest id.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PresenceTracker {
    entries: BTreeMap<String, PresenceEntry>,
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&mut self, update: PresenceUpdate) {
        match update {
            PresenceUpdate::Replace { entries } => self.replace(entries),
            PresenceUpdate::Join { entry } => self.join(entry),
            PresenceUpdate::Leave { instance_id } => self.leave(&instance_id),
        }
    }

    pub fn replace(&mut self, entries: Vec<PresenceEntry>) {
        self.entries = entries
            .into_iter()
            .map(|e| (e.instance_id.clone(), e))
            .collect();
    }

    pub fn join(&mut self, entry: PresenceEntry) {
        self.entries.insert(entry.instance_id.clone(), entry);
    }

    /// Removing an absent id is a no-op.
    pub fn leave(&mut self, instance_id: &str) {
        self.entries.remove(instance_id);
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn get(&self, instance_id: &str) -> Option<&PresenceEntry> {
        self.entries.get(instance_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn entries(&self) -> impl Iterator<Item = &PresenceEntry> {
        self.entries.values()
    }
}
