use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::{Error, Result};

/// Separator between the two encoded participant ids of a conversation key.
/// Percent-encoding never emits it, so keys cannot collide.
pub const KEY_SEPARATOR: char = ':';

/// Session id used when a client does not name its tab/device.
pub const DEFAULT_SESSION: &str = "default";

/// Longest text kept in a conversation's last-message summary.
pub const PREVIEW_CHARS: usize = 80;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ParticipantId(String);

impl ParticipantId {
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(Error::InvalidParticipant(
                "participant id must not be empty".to_string(),
            ));
        }
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for ParticipantId {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl From<ParticipantId> for String {
    fn from(id: ParticipantId) -> Self {
        id.0
    }
}

impl FromStr for ParticipantId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Tourist,
    /// Safari jeep driver offering trips.
    #[serde(alias = "driver")]
    Provider,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Tourist => "tourist",
            Role::Provider => "provider",
        }
    }
}

impl FromStr for Role {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "tourist" | "user" => Ok(Role::Tourist),
            "provider" | "driver" => Ok(Role::Provider),
            other => Err(Error::InvalidParticipant(format!("unknown role: {}", other))),
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who is sending a message, as supplied by the identity provider at login.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sender {
    pub id: ParticipantId,
    pub role: Role,
    pub name: String,
}

impl Sender {
    pub fn new(id: ParticipantId, role: Role, name: impl Into<String>) -> Self {
        Self {
            id,
            role,
            name: name.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationKey(String);

impl ConversationKey {
    pub(crate) fn from_encoded(key: String) -> Self {
        Self(key)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConversationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LastMessage {
    pub message_id: String,
    pub sender_id: ParticipantId,
    pub preview: String,
    pub created_at: u64,
    pub seq: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub key: ConversationKey,
    pub participants: [ParticipantId; 2],
    pub created_at: u64,
    /// Next sequence number handed out by the message pipeline.
    pub next_seq: u64,
    /// Timestamp of the newest allocated message; new messages never go below it.
    pub last_message_at: Option<u64>,
    pub last_message: Option<LastMessage>,
}

impl Conversation {
    pub fn has_participant(&self, id: &ParticipantId) -> bool {
        self.participants.iter().any(|p| p == id)
    }

    pub fn other_participant(&self, id: &ParticipantId) -> Option<&ParticipantId> {
        if !self.has_participant(id) {
            return None;
        }
        self.participants.iter().find(|p| *p != id)
    }

    pub fn last_activity(&self) -> u64 {
        self.last_message_at.unwrap_or(self.created_at)
    }
}

/// Delivery lifecycle of a message. `Read` carries its delivery time, so a
/// read message is always a delivered one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum DeliveryState {
    Sent,
    #[serde(rename_all = "camelCase")]
    Delivered { delivered_at: u64 },
    #[serde(rename_all = "camelCase")]
    Read { delivered_at: u64, read_at: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub conversation: ConversationKey,
    pub seq: u64,
    pub sender_id: ParticipantId,
    pub sender_role: Role,
    pub sender_name: String,
    pub text: String,
    pub created_at: u64,
    pub delivery: DeliveryState,
}

impl Message {
    pub fn is_delivered(&self) -> bool {
        !matches!(self.delivery, DeliveryState::Sent)
    }

    pub fn is_read(&self) -> bool {
        matches!(self.delivery, DeliveryState::Read { .. })
    }

    pub fn delivered_at(&self) -> Option<u64> {
        match self.delivery {
            DeliveryState::Sent => None,
            DeliveryState::Delivered { delivered_at } | DeliveryState::Read { delivered_at, .. } => {
                Some(delivered_at)
            }
        }
    }

    pub fn read_at(&self) -> Option<u64> {
        match self.delivery {
            DeliveryState::Read { read_at, .. } => Some(read_at),
            _ => None,
        }
    }

    /// Returns true if the state changed.
    pub fn mark_delivered(&mut self, at: u64) -> bool {
        match self.delivery {
            DeliveryState::Sent => {
                self.delivery = DeliveryState::Delivered { delivered_at: at };
                true
            }
            _ => false,
        }
    }

    /// Marks the message read, stamping delivery first if it never happened.
    pub fn mark_read(&mut self, at: u64) -> bool {
        match self.delivery {
            DeliveryState::Sent => {
                self.delivery = DeliveryState::Read {
                    delivered_at: at,
                    read_at: at,
                };
                true
            }
            DeliveryState::Delivered { delivered_at } => {
                self.delivery = DeliveryState::Read {
                    delivered_at,
                    read_at: at.max(delivered_at),
                };
                true
            }
            DeliveryState::Read { .. } => false,
        }
    }

    pub fn order_key(&self) -> (u64, u64) {
        (self.created_at, self.seq)
    }

    pub fn preview(&self) -> String {
        self.text.chars().take(PREVIEW_CHARS).collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceMetadata {
    /// Tab or device reporting the state. `None` means [`DEFAULT_SESSION`].
    pub session_id: Option<String>,
    pub display_name: Option<String>,
    pub status: Option<String>,
}

impl PresenceMetadata {
    pub fn session(session_id: impl Into<String>) -> Self {
        Self {
            session_id: Some(session_id.into()),
            ..Default::default()
        }
    }

    pub fn session_id(&self) -> &str {
        self.session_id.as_deref().unwrap_or(DEFAULT_SESSION)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionPresence {
    pub online: bool,
    /// Write timestamp used for last-write-wins.
    pub written_at: u64,
    pub last_seen: u64,
    pub heartbeat_deadline: Option<u64>,
    /// Set while the page is hidden; the session goes offline at this time.
    pub offline_after: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceRecord {
    pub participant_id: ParticipantId,
    pub role: Option<Role>,
    pub online: bool,
    pub last_seen: u64,
    pub display_name: Option<String>,
    pub status: Option<String>,
    pub sessions: BTreeMap<String, SessionPresence>,
    /// Latest sign-out. Online writes at or before it are stale for every
    /// session, including sessions the record has not seen yet.
    #[serde(default)]
    pub signed_out_at: u64,
}

impl PresenceRecord {
    pub fn new(participant_id: ParticipantId) -> Self {
        Self {
            participant_id,
            role: None,
            online: false,
            last_seen: 0,
            display_name: None,
            status: None,
            sessions: BTreeMap::new(),
            signed_out_at: 0,
        }
    }

    /// Status line for display: the custom status while online, otherwise
    /// plain online/offline.
    pub fn display_status(&self) -> &str {
        match (&self.status, self.online) {
            (Some(status), true) => status,
            (None, true) => "online",
            (_, false) => "offline",
        }
    }

    pub(crate) fn recompute(&mut self) {
        self.online = self.sessions.values().any(|s| s.online);
        self.last_seen = self
            .sessions
            .values()
            .map(|s| s.last_seen)
            .max()
            .unwrap_or(self.last_seen);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationKind {
    Message,
    Booking,
    Review,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub id: String,
    pub recipient: ParticipantId,
    pub kind: NotificationKind,
    pub title: String,
    pub body: String,
    pub read: bool,
    pub read_at: Option<u64>,
    pub created_at: u64,
    pub conversation: Option<ConversationKey>,
    pub message_id: Option<String>,
}

/// Which messages a read receipt covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadTarget {
    /// One message, acknowledged by its recipient `reader`.
    Message { id: String, reader: ParticipantId },
    /// Every unread message in the conversation not sent by `reader`.
    AllUnread { reader: ParticipantId },
}
