use crate::message_store::SendHook;
use crate::pubsub::{Backoff, Callback, Hub, Refresh, SubscriptionHandle};
use crate::storage::{read_all_json, read_json, update_json, Update};
use crate::{
    ChatConfig, Clock, Conversation, ConversationKey, Error, Message, Notification,
    NotificationKind, ParticipantId, Result, StorageAdapter,
};
use sha2::{Digest, Sha256};
use std::sync::Arc;

const NOTIFICATION_PREFIX: &str = "notifications/";
const NOTIFICATION_INDEX_PREFIX: &str = "notification-index/";

fn recipient_prefix(recipient: &ParticipantId) -> String {
    format!("{}{}/", NOTIFICATION_PREFIX, urlencoding::encode(recipient.as_str()))
}

fn notification_storage_key(recipient: &ParticipantId, id: &str) -> String {
    format!("{}{}", recipient_prefix(recipient), id)
}

fn index_key(id: &str) -> String {
    format!("{}{}", NOTIFICATION_INDEX_PREFIX, id)
}

/// Deterministic id of the notification for one message, so the same send
/// never produces two notifications.
pub fn message_notification_id(conversation: &ConversationKey, message_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(conversation.as_str().as_bytes());
    hasher.update([0u8]);
    hasher.update(message_id.as_bytes());
    hex::encode(hasher.finalize())
}

/// Durable per-recipient notification feeds. Installed as a [`SendHook`] on
/// the message store.
pub struct NotificationCenter {
    storage: Arc<dyn StorageAdapter>,
    clock: Arc<dyn Clock>,
    max_cas_retries: u32,
    hub: Hub<ParticipantId, Vec<Notification>>,
}

impl NotificationCenter {
    pub fn new(storage: Arc<dyn StorageAdapter>, clock: Arc<dyn Clock>, config: &ChatConfig) -> Self {
        let backoff = Backoff::new(
            config.resubscribe_backoff_base_ms,
            config.resubscribe_backoff_max_ms,
        );
        Self {
            hub: Hub::new("notifications", clock.clone(), backoff),
            storage,
            clock,
            max_cas_retries: config.max_cas_retries,
        }
    }

    /// Stores `notification` unless one with the same id exists. Returns
    /// whether it was created. The id index is written first and repeating
    /// the call repairs a half-finished earlier attempt.
    fn store(&self, notification: &Notification) -> Result<bool> {
        let storage_key = notification_storage_key(&notification.recipient, &notification.id);
        let index = index_key(&notification.id);
        if self.storage.get(&index)?.as_deref() != Some(storage_key.as_str()) {
            self.storage.put(&index, storage_key.clone())?;
        }
        let created = self
            .storage
            .insert_if_absent(&storage_key, serde_json::to_string(notification)?)?;
        if created {
            tracing::debug!(
                recipient = %notification.recipient,
                notification = %notification.id,
                kind = ?notification.kind,
                "notification created"
            );
            self.hub.notify(&notification.recipient);
        }
        Ok(created)
    }

    /// Creates a notification that is not tied to a message, such as a
    /// booking confirmation or a new review.
    pub fn notify(
        &self,
        recipient: &ParticipantId,
        kind: NotificationKind,
        title: impl Into<String>,
        body: impl Into<String>,
    ) -> Result<Notification> {
        let notification = Notification {
            id: uuid::Uuid::new_v4().to_string(),
            recipient: recipient.clone(),
            kind,
            title: title.into(),
            body: body.into(),
            read: false,
            read_at: None,
            created_at: self.clock.now_millis(),
            conversation: None,
            message_id: None,
        };
        self.store(&notification).map_err(Error::into_notification)?;
        Ok(notification)
    }

    /// Marks a notification read. Repeating it keeps the first read time.
    pub fn mark_read(&self, id: &str) -> Result<Notification> {
        let storage_key = self
            .storage
            .get(&index_key(id))
            .map_err(Error::into_notification)?
            .ok_or_else(|| Error::NotificationNotFound(id.to_string()))?;
        let now = self.clock.now_millis();
        let outcome = update_json::<Notification, _>(
            self.storage.as_ref(),
            &storage_key,
            self.max_cas_retries,
            |current| {
                let mut notification =
                    current.ok_or_else(|| Error::NotificationNotFound(id.to_string()))?;
                if notification.read {
                    return Ok(Update::Keep);
                }
                notification.read = true;
                notification.read_at = Some(now);
                Ok(Update::Write(notification))
            },
        )
        .map_err(Error::into_notification)?;

        let notification = outcome
            .value
            .ok_or_else(|| Error::NotificationNotFound(id.to_string()))?;
        if outcome.changed {
            self.hub.notify(&notification.recipient);
        }
        Ok(notification)
    }

    pub fn get(&self, id: &str) -> Result<Option<Notification>> {
        let Some(storage_key) = self.storage.get(&index_key(id)).map_err(Error::into_notification)? else {
            return Ok(None);
        };
        read_json(self.storage.as_ref(), &storage_key).map_err(Error::into_notification)
    }

    /// The recipient's feed, newest first.
    pub fn list(&self, recipient: &ParticipantId) -> Result<Vec<Notification>> {
        load_feed(self.storage.as_ref(), recipient).map_err(Error::into_notification)
    }

    pub fn unread_count(&self, recipient: &ParticipantId) -> Result<usize> {
        Ok(self.list(recipient)?.iter().filter(|n| !n.read).count())
    }

    pub fn subscribe(
        &self,
        recipient: &ParticipantId,
        callback: Callback<Vec<Notification>>,
    ) -> SubscriptionHandle {
        let storage = self.storage.clone();
        let owner = recipient.clone();
        let refresh: Refresh<Vec<Notification>> =
            Arc::new(move || load_feed(storage.as_ref(), &owner).map_err(Error::into_notification));
        self.hub.subscribe(recipient.clone(), Some(recipient.clone()), refresh, callback)
    }

    pub fn retry_subscriptions(&self) -> usize {
        self.hub.retry_due()
    }
}

impl SendHook for NotificationCenter {
    fn on_message_sent(&self, conversation: &Conversation, message: &Message) -> Result<()> {
        let Some(recipient) = conversation.other_participant(&message.sender_id) else {
            return Ok(());
        };
        let notification = Notification {
            id: message_notification_id(&conversation.key, &message.id),
            recipient: recipient.clone(),
            kind: NotificationKind::Message,
            title: format!("New message from {}", message.sender_name),
            body: message.preview(),
            read: false,
            read_at: None,
            created_at: message.created_at,
            conversation: Some(conversation.key.clone()),
            message_id: Some(message.id.clone()),
        };
        self.store(&notification)
            .map(|_| ())
            .map_err(Error::into_notification)
    }
}

fn load_feed(storage: &dyn StorageAdapter, recipient: &ParticipantId) -> Result<Vec<Notification>> {
    let mut feed: Vec<Notification> = read_all_json(storage, &recipient_prefix(recipient))?;
    feed.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
    Ok(feed)
}
