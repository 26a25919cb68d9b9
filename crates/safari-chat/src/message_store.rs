use crate::conversation::ConversationDirectory;
use crate::pubsub::{Backoff, Callback, Hub, Refresh, SubscriptionHandle};
use crate::storage::{read_all_json, read_json, update_json, Update};
use crate::{
    ChatConfig, Clock, Conversation, ConversationKey, DeliveryState, Error, Message,
    ParticipantId, ReadTarget, Result, Sender, StorageAdapter,
};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};

const MESSAGE_PREFIX: &str = "messages/";
const MESSAGE_ID_PREFIX: &str = "message-ids/";

fn messages_prefix(key: &ConversationKey) -> String {
    format!("{}{}/", MESSAGE_PREFIX, key)
}

fn message_storage_key(key: &ConversationKey, seq: u64) -> String {
    format!("{}{}/{:020}", MESSAGE_PREFIX, key, seq)
}

fn message_index_key(key: &ConversationKey, message_id: &str) -> String {
    format!("{}{}/{}", MESSAGE_ID_PREFIX, key, urlencoding::encode(message_id))
}

/// Slot reserved for a client message id. The id is claimed before the
/// message document is written, so a retry after a failed or timed-out send
/// finishes the same slot instead of allocating a second one.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IdClaim {
    seq: u64,
    created_at: u64,
}

/// Runs after a message is persisted and published. Errors are logged by the
/// store and never fail the send.
pub trait SendHook: Send + Sync {
    fn on_message_sent(&self, conversation: &Conversation, message: &Message) -> Result<()>;
}

pub struct MessageStore {
    storage: Arc<dyn StorageAdapter>,
    clock: Arc<dyn Clock>,
    directory: Arc<ConversationDirectory>,
    max_cas_retries: u32,
    hub: Hub<ConversationKey, Vec<Message>>,
    hooks: Mutex<Vec<Arc<dyn SendHook>>>,
}

impl MessageStore {
    pub fn new(
        storage: Arc<dyn StorageAdapter>,
        clock: Arc<dyn Clock>,
        directory: Arc<ConversationDirectory>,
        config: &ChatConfig,
    ) -> Self {
        let backoff = Backoff::new(
            config.resubscribe_backoff_base_ms,
            config.resubscribe_backoff_max_ms,
        );
        Self {
            hub: Hub::new("messages", clock.clone(), backoff),
            storage,
            clock,
            directory,
            max_cas_retries: config.max_cas_retries,
            hooks: Mutex::new(Vec::new()),
        }
    }

    pub fn add_hook(&self, hook: Arc<dyn SendHook>) {
        self.hooks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(hook);
    }

    pub fn send(&self, key: &ConversationKey, sender: &Sender, text: &str) -> Result<Message> {
        let id = uuid::Uuid::new_v4().to_string();
        self.send_with_id(key, sender, text, &id)
    }

    /// Sends with a caller-chosen id. Repeating the same id returns the
    /// already stored message instead of storing a second one.
    pub fn send_with_id(
        &self,
        key: &ConversationKey,
        sender: &Sender,
        text: &str,
        message_id: &str,
    ) -> Result<Message> {
        let text = text.trim();
        if text.is_empty() {
            return Err(Error::InvalidMessage("message text must not be empty".to_string()));
        }
        let message_id = message_id.trim();
        if message_id.is_empty() {
            return Err(Error::InvalidMessage("message id must not be empty".to_string()));
        }

        let (a, b) = key.participants()?;
        if sender.id != a && sender.id != b {
            return Err(Error::NotAParticipant {
                participant: sender.id.to_string(),
                conversation: key.to_string(),
            });
        }

        let conversation = self.directory.get_or_create(key)?;
        let claim = match self.read_claim(key, message_id)? {
            Some(claim) => claim,
            None => self.claim(key, message_id)?,
        };

        let storage_key = message_storage_key(key, claim.seq);
        let (message, written) = match read_json::<Message>(self.storage.as_ref(), &storage_key)
            .map_err(Error::into_persistence)?
        {
            Some(existing) => (existing, false),
            None => {
                let candidate = Message {
                    id: message_id.to_string(),
                    conversation: key.clone(),
                    seq: claim.seq,
                    sender_id: sender.id.clone(),
                    sender_role: sender.role,
                    sender_name: sender.name.clone(),
                    text: text.to_string(),
                    created_at: claim.created_at,
                    delivery: DeliveryState::Sent,
                };
                let written = self
                    .storage
                    .insert_if_absent(&storage_key, serde_json::to_string(&candidate)?)
                    .map_err(Error::into_persistence)?;
                if written {
                    (candidate, true)
                } else {
                    // A concurrent send with the same id finished the slot first.
                    let existing = read_json::<Message>(self.storage.as_ref(), &storage_key)
                        .map_err(Error::into_persistence)?
                        .ok_or_else(|| Error::MessageNotFound(message_id.to_string()))?;
                    (existing, false)
                }
            }
        };

        self.publish(&conversation, &message, written);
        Ok(self.find(key, message_id)?.unwrap_or(message))
    }

    /// Reserves a sequence slot for `message_id`. Losing the race to a
    /// concurrent send returns the winner's slot.
    fn claim(&self, key: &ConversationKey, message_id: &str) -> Result<IdClaim> {
        let allocation = self.directory.allocate(key)?;
        let claim = IdClaim {
            seq: allocation.seq,
            created_at: allocation.created_at,
        };
        let claimed = self
            .storage
            .insert_if_absent(&message_index_key(key, message_id), serde_json::to_string(&claim)?)
            .map_err(Error::into_persistence)?;
        if claimed {
            return Ok(claim);
        }
        self.read_claim(key, message_id)?.ok_or_else(|| {
            Error::PersistenceFailure(format!("claim for message {} vanished", message_id))
        })
    }

    fn read_claim(&self, key: &ConversationKey, message_id: &str) -> Result<Option<IdClaim>> {
        read_json(self.storage.as_ref(), &message_index_key(key, message_id))
            .map_err(Error::into_persistence)
    }

    /// Fan-out after a message is stored. Safe to repeat for a message that
    /// was already published: the summary only moves forward, hooks are
    /// idempotent and delivery only touches pending messages.
    fn publish(&self, conversation: &Conversation, message: &Message, written: bool) {
        let key = &conversation.key;
        let summary_moved = match self.directory.record_last_message(message) {
            Ok(moved) => moved,
            Err(e) => {
                tracing::warn!(conversation = %key, error = %e, "failed to update last message summary");
                written
            }
        };
        if written || summary_moved {
            tracing::debug!(conversation = %key, message = %message.id, seq = message.seq, "message sent");
            self.hub.notify(key);
        } else {
            tracing::debug!(conversation = %key, message = %message.id, "duplicate send");
        }

        self.run_hooks(conversation, message);

        if let Some(recipient) = conversation.other_participant(&message.sender_id) {
            if self.hub.has_viewer(key, recipient) {
                if let Err(e) = self.deliver_pending(key, recipient) {
                    tracing::warn!(conversation = %key, error = %e, "implicit delivery failed");
                }
            }
        }
    }

    fn run_hooks(&self, conversation: &Conversation, message: &Message) {
        let hooks = self
            .hooks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        for hook in hooks {
            if let Err(e) = hook.on_message_sent(conversation, message) {
                let e = e.into_notification();
                tracing::warn!(
                    conversation = %conversation.key,
                    message = %message.id,
                    error = %e,
                    "send hook failed"
                );
            }
        }
    }

    /// Looks a message up by id through the id index. A claimed id whose
    /// document was never written is a message that was not sent.
    pub fn find(&self, key: &ConversationKey, message_id: &str) -> Result<Option<Message>> {
        match self.read_claim(key, message_id)? {
            Some(claim) => read_json(self.storage.as_ref(), &message_storage_key(key, claim.seq))
                .map_err(Error::into_persistence),
            None => Ok(None),
        }
    }

    pub fn get(&self, key: &ConversationKey, message_id: &str) -> Result<Message> {
        self.find(key, message_id)?
            .ok_or_else(|| Error::MessageNotFound(message_id.to_string()))
    }

    /// All messages of the conversation in `(created_at, seq)` order.
    pub fn messages(&self, key: &ConversationKey) -> Result<Vec<Message>> {
        load_messages(self.storage.as_ref(), key).map_err(Error::into_persistence)
    }

    pub fn unread_count(&self, key: &ConversationKey, reader: &ParticipantId) -> Result<usize> {
        Ok(self
            .messages(key)?
            .iter()
            .filter(|m| &m.sender_id != reader && !m.is_read())
            .count())
    }

    /// Explicit delivery ack from `recipient`. Already delivered messages are
    /// returned unchanged.
    pub fn mark_delivered(
        &self,
        key: &ConversationKey,
        message_id: &str,
        recipient: &ParticipantId,
    ) -> Result<Message> {
        let message = self.get(key, message_id)?;
        check_recipient(key, &message, recipient)?;
        let now = self.clock.now_millis();
        let (message, changed) = self.update_message(&message, |m| m.mark_delivered(now))?;
        if changed {
            self.hub.notify(key);
        }
        Ok(message)
    }

    /// Marks every message `recipient` has not yet received as delivered.
    pub fn deliver_pending(&self, key: &ConversationKey, recipient: &ParticipantId) -> Result<usize> {
        let now = self.clock.now_millis();
        let mut delivered = 0;
        for message in self.messages(key)? {
            if &message.sender_id == recipient || message.is_delivered() {
                continue;
            }
            if self.update_message(&message, |m| m.mark_delivered(now))?.1 {
                delivered += 1;
            }
        }
        if delivered > 0 {
            tracing::debug!(conversation = %key, recipient = %recipient, delivered, "messages delivered");
            self.hub.notify(key);
        }
        Ok(delivered)
    }

    /// Marks messages read, stamping delivery on any that never got it.
    /// Returns the messages that changed.
    pub fn mark_read(&self, key: &ConversationKey, target: &ReadTarget) -> Result<Vec<Message>> {
        let now = self.clock.now_millis();
        let candidates = match target {
            ReadTarget::Message { id, reader } => {
                let message = self.get(key, id)?;
                check_recipient(key, &message, reader)?;
                vec![message]
            }
            ReadTarget::AllUnread { reader } => {
                let (a, b) = key.participants()?;
                if reader != &a && reader != &b {
                    return Err(Error::NotAParticipant {
                        participant: reader.to_string(),
                        conversation: key.to_string(),
                    });
                }
                self.messages(key)?
                    .into_iter()
                    .filter(|m| &m.sender_id != reader && !m.is_read())
                    .collect()
            }
        };

        let mut changed = Vec::new();
        for message in candidates {
            let (message, updated) = self.update_message(&message, |m| m.mark_read(now))?;
            if updated {
                changed.push(message);
            }
        }
        if !changed.is_empty() {
            tracing::debug!(conversation = %key, count = changed.len(), "messages read");
            self.hub.notify(key);
        }
        Ok(changed)
    }

    fn update_message<F>(&self, message: &Message, mut change: F) -> Result<(Message, bool)>
    where
        F: FnMut(&mut Message) -> bool,
    {
        let storage_key = message_storage_key(&message.conversation, message.seq);
        let outcome = update_json::<Message, _>(
            self.storage.as_ref(),
            &storage_key,
            self.max_cas_retries,
            |current| {
                let mut current =
                    current.ok_or_else(|| Error::MessageNotFound(message.id.clone()))?;
                if change(&mut current) {
                    Ok(Update::Write(current))
                } else {
                    Ok(Update::Keep)
                }
            },
        )
        .map_err(Error::into_persistence)?;
        let value = outcome
            .value
            .ok_or_else(|| Error::MessageNotFound(message.id.clone()))?;
        Ok((value, outcome.changed))
    }

    /// Streams the conversation's full ordered history now and after every
    /// change. A `viewer` who belongs to the conversation counts as a live
    /// recipient: their pending messages become delivered.
    pub fn subscribe(
        &self,
        key: &ConversationKey,
        viewer: Option<&ParticipantId>,
        callback: Callback<Vec<Message>>,
    ) -> Result<SubscriptionHandle> {
        if let Some(viewer) = viewer {
            let (a, b) = key.participants()?;
            if viewer != &a && viewer != &b {
                return Err(Error::NotAParticipant {
                    participant: viewer.to_string(),
                    conversation: key.to_string(),
                });
            }
        }

        let storage = self.storage.clone();
        let topic = key.clone();
        let refresh: Refresh<Vec<Message>> =
            Arc::new(move || load_messages(storage.as_ref(), &topic).map_err(Error::into_persistence));
        let handle = self.hub.subscribe(key.clone(), viewer.cloned(), refresh, callback);

        if let Some(viewer) = viewer {
            if let Err(e) = self.deliver_pending(key, viewer) {
                tracing::warn!(conversation = %key, error = %e, "catch-up delivery failed");
            }
        }
        Ok(handle)
    }

    pub fn retry_subscriptions(&self) -> usize {
        self.hub.retry_due()
    }

    pub fn subscriber_count(&self, key: &ConversationKey) -> usize {
        self.hub.subscriber_count(key)
    }

    /// Re-publishes the conversation to its subscribers, e.g. after another
    /// process wrote to shared storage.
    pub fn refresh(&self, key: &ConversationKey) {
        self.hub.notify(key);
    }
}

/// Receipts may only be set by the participant a message was sent to.
fn check_recipient(key: &ConversationKey, message: &Message, reader: &ParticipantId) -> Result<()> {
    let (a, b) = key.participants()?;
    if reader != &a && reader != &b {
        return Err(Error::NotAParticipant {
            participant: reader.to_string(),
            conversation: key.to_string(),
        });
    }
    if reader == &message.sender_id {
        return Err(Error::NotRecipient {
            participant: reader.to_string(),
            message: message.id.clone(),
        });
    }
    Ok(())
}

fn load_messages(storage: &dyn StorageAdapter, key: &ConversationKey) -> Result<Vec<Message>> {
    let mut messages: Vec<Message> = read_all_json(storage, &messages_prefix(key))?;
    messages.sort_by_key(Message::order_key);
    Ok(messages)
}
