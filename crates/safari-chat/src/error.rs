use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Invalid participant: {0}")]
    InvalidParticipant(String),

    #[error("{participant} is not a participant of conversation {conversation}")]
    NotAParticipant {
        participant: String,
        conversation: String,
    },

    #[error("{participant} cannot acknowledge message {message}: only its recipient can")]
    NotRecipient { participant: String, message: String },

    #[error("Conversation not found: {0}")]
    ConversationNotFound(String),

    #[error("Message not found: {0}")]
    MessageNotFound(String),

    #[error("Notification not found: {0}")]
    NotificationNotFound(String),

    #[error("Persistence failure: {0}")]
    PersistenceFailure(String),

    #[error("Notification delivery failed: {0}")]
    NotificationDeliveryFailed(String),

    #[error("Presence write failed: {0}")]
    PresenceWriteFailed(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Write conflict on {key} after {attempts} attempts")]
    Conflict { key: String, attempts: u32 },

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Re-labels a storage-layer failure as a persistence failure for callers
    /// of the message pipeline. Validation errors pass through unchanged.
    pub(crate) fn into_persistence(self) -> Self {
        match self {
            Error::Storage(msg) => Error::PersistenceFailure(msg),
            Error::Json(e) => Error::PersistenceFailure(e.to_string()),
            Error::Conflict { key, attempts } => Error::PersistenceFailure(format!(
                "write conflict on {} after {} attempts",
                key, attempts
            )),
            other => other,
        }
    }

    pub(crate) fn into_presence(self) -> Self {
        match self {
            Error::PresenceWriteFailed(_) => self,
            other => Error::PresenceWriteFailed(other.to_string()),
        }
    }

    pub(crate) fn into_notification(self) -> Self {
        match self {
            Error::NotificationDeliveryFailed(_) | Error::NotificationNotFound(_) => self,
            other => Error::NotificationDeliveryFailed(other.to_string()),
        }
    }

    /// True for errors the caller caused and should not retry.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Error::InvalidMessage(_)
                | Error::InvalidParticipant(_)
                | Error::NotAParticipant { .. }
                | Error::NotRecipient { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
