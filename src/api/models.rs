use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The signed-in user, as issued by the authentication service.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Identity {
    pub id: String,
    pub display_name: String,
    pub contact_info: String,
}

/// Another registered user that can be messaged.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Peer {
    pub id: String,
    pub display_name: String,
    pub contact_info: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: String,
    pub sender_id: String,
    pub recipient_id: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    /// Wire shape used when echoing a persisted message over the live channel.
    pub fn to_record(&self) -> Value {
        serde_json::json!({
            "_id": self.id,
            "sender": { "_id": self.sender_id },
            "recipient": { "_id": self.recipient_id },
            "content": self.content,
            "timestamp": self.timestamp.to_rfc3339(),
        })
    }
}

/// The unordered pair of participants identifying one conversation.
///
/// `self_id` is kept apart from `peer_id` so outgoing messages know their
/// recipient; equality ignores the orientation.
#[derive(Debug, Clone)]
pub struct ConversationKey {
    pub self_id: String,
    pub peer_id: String,
}

impl ConversationKey {
    pub fn new(self_id: impl Into<String>, peer_id: impl Into<String>) -> Self {
        Self { self_id: self_id.into(), peer_id: peer_id.into() }
    }

    /// A message belongs to the key iff {sender, recipient} == {self, peer}.
    pub fn contains(&self, msg: &Message) -> bool {
        (msg.sender_id == self.self_id && msg.recipient_id == self.peer_id)
            || (msg.sender_id == self.peer_id && msg.recipient_id == self.self_id)
    }
}

impl PartialEq for ConversationKey {
    fn eq(&self, other: &Self) -> bool {
        (self.self_id == other.self_id && self.peer_id == other.peer_id)
            || (self.self_id == other.peer_id && self.peer_id == other.self_id)
    }
}

impl Eq for ConversationKey {}

// Server records. Field naming varies between endpoints (`_id` vs `id`, nested
// user objects vs bare ids), so everything is adapted here exactly once.

#[derive(Debug, Deserialize, Default)]
pub struct UserRecord {
    #[serde(rename = "_id", default)]
    pub underscore_id: Option<String>,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
}

impl UserRecord {
    fn canonical_id(&self) -> Option<String> {
        self.underscore_id
            .as_deref()
            .or(self.id.as_deref())
            .filter(|id| !id.is_empty())
            .map(str::to_string)
    }

    pub fn into_peer(self) -> Option<Peer> {
        let id = self.canonical_id()?;
        Some(Peer {
            display_name: self.username.unwrap_or_else(|| id.clone()),
            contact_info: self.email.unwrap_or_default(),
            id,
        })
    }

    pub fn into_identity(self) -> Option<Identity> {
        self.into_peer().map(|p| Identity {
            id: p.id,
            display_name: p.display_name,
            contact_info: p.contact_info,
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum UserRef {
    Record(UserRecord),
    Id(String),
}

impl UserRef {
    fn id(&self) -> Option<String> {
        match self {
            UserRef::Record(r) => r.canonical_id(),
            UserRef::Id(id) if !id.is_empty() => Some(id.clone()),
            UserRef::Id(_) => None,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct MessageRecord {
    #[serde(rename = "_id", default)]
    pub underscore_id: Option<String>,
    #[serde(default)]
    pub id: Option<String>,
    pub sender: UserRef,
    pub recipient: UserRef,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub timestamp: Value,
}

impl MessageRecord {
    pub fn into_message(self) -> Option<Message> {
        let id = self
            .underscore_id
            .or(self.id)
            .filter(|id| !id.is_empty())?;
        Some(Message {
            sender_id: self.sender.id()?,
            recipient_id: self.recipient.id()?,
            timestamp: parse_timestamp(&self.timestamp)?,
            content: self.content,
            id,
        })
    }
}

fn parse_timestamp(v: &Value) -> Option<DateTime<Utc>> {
    match v {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|t| t.with_timezone(&Utc)),
        Value::Number(n) => n
            .as_i64()
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
        _ => None,
    }
}

/// Adapt a JSON array of user records, dropping the ones without an id.
pub fn peers_from_value(json: Value) -> Vec<Peer> {
    records(json)
        .into_iter()
        .filter_map(|item| match serde_json::from_value::<UserRecord>(item) {
            Ok(rec) => rec.into_peer(),
            Err(e) => {
                log::warn!("Dropping malformed user record: {e}");
                None
            }
        })
        .collect()
}

/// Adapt a JSON array of message records, dropping the ones that don't normalize.
pub fn messages_from_value(json: Value) -> Vec<Message> {
    records(json)
        .into_iter()
        .filter_map(|item| message_from_value(item).ok())
        .collect()
}

pub fn message_from_value(item: Value) -> Result<Message, crate::Error> {
    let rec: MessageRecord = serde_json::from_value(item).map_err(|e| {
        log::warn!("Dropping malformed message record: {e}");
        crate::Error::from(e)
    })?;
    rec.into_message().ok_or_else(|| {
        log::warn!("Dropping message record without id, participants or timestamp");
        crate::Error::Protocol("incomplete message record".into())
    })
}

fn records(json: Value) -> Vec<Value> {
    match json {
        Value::Array(arr) => arr,
        Value::Object(mut obj) => match obj.remove("data") {
            Some(Value::Array(arr)) => arr,
            _ => Vec::new(),
        },
        _ => Vec::new(),
    }
}
