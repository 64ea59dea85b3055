use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Recipient class of direct user-to-user messages. Everything else is a
/// group class.
pub const CLASS_USER: &str = "user";

// --- Delivery flags ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum MessageFlag {
    /// The message must not be persisted once delivery is confirmed.
    RemoveDelivered,
    /// Non-senders may edit the message payload.
    Editable,
    /// Non-senders may delete the message.
    Deletable,
}

impl MessageFlag {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageFlag::RemoveDelivered => "remove_delivered",
            MessageFlag::Editable => "editable",
            MessageFlag::Deletable => "deletable",
        }
    }

    pub fn parse(s: &str) -> Option<MessageFlag> {
        match s {
            "remove_delivered" => Some(MessageFlag::RemoveDelivered),
            "editable" => Some(MessageFlag::Editable),
            "deletable" => Some(MessageFlag::Deletable),
            _ => None,
        }
    }
}

/// A set of delivery flags. Stored as a comma-joined string in the
/// `message_flags` column, transported as a JSON array of strings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageFlags(BTreeSet<MessageFlag>);

impl MessageFlags {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a client-supplied flag list. Unknown flags are an error.
    pub fn from_list<I, S>(flags: I) -> Result<Self, String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut set = BTreeSet::new();
        for flag in flags {
            match MessageFlag::parse(flag.as_ref()) {
                Some(f) => {
                    set.insert(f);
                }
                None => return Err(format!("unrecognized flag '{}'", flag.as_ref())),
            }
        }
        Ok(MessageFlags(set))
    }

    /// Parse the stored comma-joined form. Unknown entries are ignored.
    pub fn parse_stored(s: &str) -> Self {
        MessageFlags(
            s.split(',')
                .filter_map(|part| MessageFlag::parse(part.trim()))
                .collect(),
        )
    }

    pub fn contains(&self, flag: MessageFlag) -> bool {
        self.0.contains(&flag)
    }

    pub fn insert(&mut self, flag: MessageFlag) {
        self.0.insert(flag);
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Comma-joined storage form.
    pub fn dump(&self) -> String {
        self.0
            .iter()
            .map(|f| f.as_str())
            .collect::<Vec<_>>()
            .join(",")
    }

    pub fn as_list(&self) -> Vec<&'static str> {
        self.0.iter().map(|f| f.as_str()).collect()
    }
}

impl fmt::Display for MessageFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.dump())
    }
}

impl Serialize for MessageFlags {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.as_list().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for MessageFlags {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let list = Vec::<String>::deserialize(deserializer)?;
        MessageFlags::from_list(&list).map_err(serde::de::Error::custom)
    }
}

// --- Wire envelope ---

/// Mutation kind carried by an envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Action {
    #[serde(rename = "m")]
    NewMessage,
    #[serde(rename = "u")]
    MessageUpdated,
    #[serde(rename = "d")]
    MessageDeleted,
}

/// The JSON envelope published to the broker. Short keys keep the payload
/// small on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "a")]
    pub action: Action,
    #[serde(rename = "gsps")]
    pub gamespace_id: i64,
    #[serde(rename = "msgu")]
    pub message_uuid: String,
    #[serde(rename = "sndr")]
    pub sender: String,
    #[serde(rename = "class")]
    pub recipient_class: String,
    #[serde(rename = "key")]
    pub recipient_key: String,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub message_type: Option<String>,
    #[serde(rename = "payload", skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    #[serde(rename = "fl", skip_serializing_if = "Option::is_none")]
    pub flags: Option<MessageFlags>,
    /// Epoch seconds; set by the engine on push only.
    #[serde(rename = "tm", skip_serializing_if = "Option::is_none")]
    pub time: Option<i64>,
}

// --- History records ---

/// A persisted message.
#[derive(Debug, Clone, Serialize)]
pub struct MessageRecord {
    #[serde(skip_serializing)]
    pub message_id: i64,
    #[serde(rename = "uuid")]
    pub message_uuid: String,
    #[serde(skip_serializing)]
    pub gamespace_id: i64,
    pub sender: String,
    pub recipient_class: String,
    pub recipient: String,
    pub time: DateTime<Utc>,
    #[serde(rename = "type")]
    pub message_type: String,
    pub payload: serde_json::Value,
    pub delivered: bool,
    pub flags: MessageFlags,
}

/// Per-stream read watermark.
#[derive(Debug, Clone, Serialize)]
pub struct LastReadMessage {
    #[serde(skip_serializing)]
    pub gamespace_id: i64,
    pub account_id: String,
    pub recipient_class: String,
    pub recipient: String,
    pub last_message_time: DateTime<Utc>,
    pub last_message_uuid: String,
}

// --- Groups ---

#[derive(Debug, Clone)]
pub struct Group {
    pub group_id: i64,
    pub gamespace_id: i64,
    pub group_class: String,
    pub group_key: String,
    pub store_messages: bool,
    pub clustered: bool,
    pub cluster_size: i64,
}

impl Group {
    /// The recipient key messages to this group are addressed with, for a
    /// participant sitting in `cluster`.
    pub fn effective_recipient(&self, cluster: i64) -> String {
        if self.clustered {
            format!("{}-{}", self.group_id, cluster)
        } else {
            self.group_id.to_string()
        }
    }
}

#[derive(Debug, Clone)]
pub struct GroupParticipation {
    pub participation_id: i64,
    pub gamespace_id: i64,
    pub group_id: i64,
    pub account: String,
    pub role: String,
    pub cluster: i64,
}

/// A participation joined with its group, as needed by conversation attach.
#[derive(Debug, Clone)]
pub struct ParticipationInfo {
    pub group: Group,
    pub participation: GroupParticipation,
}

impl ParticipationInfo {
    pub fn effective_recipient(&self) -> String {
        self.group.effective_recipient(self.participation.cluster)
    }
}

// --- Request bodies ---

#[derive(Debug, Deserialize)]
pub struct SendMessage {
    pub message_type: String,
    pub payload: serde_json::Value,
    #[serde(default)]
    pub flags: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
pub struct SendBatch {
    pub messages: Vec<serde_json::Value>,
}

// --- JSON merge ---

/// Deep-merge `patch` into `dest`. Object values merge recursively, a
/// `null` value deletes the key, everything else replaces.
pub fn merge_payload(dest: &mut serde_json::Value, patch: &serde_json::Value) {
    use serde_json::Value;

    let Value::Object(patch_map) = patch else {
        *dest = patch.clone();
        return;
    };

    if !dest.is_object() {
        *dest = Value::Object(serde_json::Map::new());
    }
    let dest_map = dest.as_object_mut().unwrap();

    for (key, value) in patch_map {
        match value {
            Value::Null => {
                dest_map.remove(key);
            }
            Value::Object(_) if dest_map.get(key).is_some_and(|v| v.is_object()) => {
                merge_payload(dest_map.get_mut(key).unwrap(), value);
            }
            other => {
                dest_map.insert(key.clone(), other.clone());
            }
        }
    }
}
