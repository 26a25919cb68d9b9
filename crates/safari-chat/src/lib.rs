//! Real-time messaging and presence core for the safari marketplace:
//! conversations between tourists and jeep drivers, ordered messages with
//! delivery and read receipts, presence with heartbeats, and notification
//! feeds, all behind a pluggable [`StorageAdapter`].

pub mod chat;
pub mod clock;
pub mod config;
pub mod conversation;
pub mod error;
pub mod file_storage;
pub mod maintenance;
pub mod message_store;
pub mod notifications;
pub mod presence;
pub mod pubsub;
pub mod storage;
pub mod types;

pub use chat::{ChatCore, ConversationSummary};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::ChatConfig;
pub use conversation::{resolve, ConversationDirectory};
pub use error::{Error, Result};
pub use file_storage::FileStorageAdapter;
pub use maintenance::{MaintenanceEvent, MaintenanceTask, MaintenanceWorker};
pub use message_store::{MessageStore, SendHook};
pub use notifications::{message_notification_id, NotificationCenter};
pub use presence::{PresenceChange, PresenceRegistry, PresenceUpdate};
pub use pubsub::{
    Backoff, Callback, Hub, Refresh, SubscriptionError, SubscriptionEvent, SubscriptionHandle,
};
pub use storage::{InMemoryStorage, StorageAdapter};
pub use types::*;
