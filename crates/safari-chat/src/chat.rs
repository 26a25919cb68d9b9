use crate::conversation::{self, ConversationDirectory};
use crate::maintenance::{MaintenanceEvent, MaintenanceWorker};
use crate::message_store::MessageStore;
use crate::notifications::NotificationCenter;
use crate::presence::{PresenceChange, PresenceRegistry, PresenceUpdate};
use crate::pubsub::{Callback, SubscriptionHandle};
use crate::{
    ChatConfig, Clock, Conversation, ConversationKey, Message, Notification, NotificationKind,
    ParticipantId, PresenceMetadata, PresenceRecord, ReadTarget, Result, Role, Sender,
    StorageAdapter, SystemClock,
};
use crossbeam_channel::Sender as EventSender;
use serde::Serialize;
use std::sync::{Arc, Weak};

/// A conversation as seen by one of its participants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSummary {
    pub conversation: Conversation,
    pub peer: ParticipantId,
    pub unread: usize,
}

/// Entry point for callers: wires the conversation directory, message
/// store, presence registry and notification feeds over one storage adapter.
pub struct ChatCore {
    config: ChatConfig,
    clock: Arc<dyn Clock>,
    directory: Arc<ConversationDirectory>,
    messages: MessageStore,
    presence: PresenceRegistry,
    notifications: Arc<NotificationCenter>,
}

impl ChatCore {
    pub fn new(storage: Arc<dyn StorageAdapter>, config: ChatConfig) -> Self {
        Self::with_clock(storage, Arc::new(SystemClock), config)
    }

    pub fn with_clock(storage: Arc<dyn StorageAdapter>, clock: Arc<dyn Clock>, config: ChatConfig) -> Self {
        let directory = Arc::new(ConversationDirectory::new(
            storage.clone(),
            clock.clone(),
            config.max_cas_retries,
        ));
        let messages = MessageStore::new(storage.clone(), clock.clone(), directory.clone(), &config);
        let presence = PresenceRegistry::new(storage.clone(), clock.clone(), &config);
        let notifications = Arc::new(NotificationCenter::new(storage, clock.clone(), &config));
        messages.add_hook(notifications.clone());

        Self {
            config,
            clock,
            directory,
            messages,
            presence,
            notifications,
        }
    }

    pub fn config(&self) -> &ChatConfig {
        &self.config
    }

    pub fn message_store(&self) -> &MessageStore {
        &self.messages
    }

    pub fn presence_registry(&self) -> &PresenceRegistry {
        &self.presence
    }

    pub fn notification_center(&self) -> &NotificationCenter {
        &self.notifications
    }

    // Conversations

    pub fn resolve_conversation(&self, a: &ParticipantId, b: &ParticipantId) -> ConversationKey {
        conversation::resolve(a, b)
    }

    pub fn get_or_create_conversation(&self, key: &ConversationKey) -> Result<Conversation> {
        self.directory.get_or_create(key)
    }

    pub fn open_conversation(&self, me: &ParticipantId, peer: &ParticipantId) -> Result<Conversation> {
        self.directory.get_or_create(&conversation::resolve(me, peer))
    }

    pub fn conversation(&self, key: &ConversationKey) -> Result<Option<Conversation>> {
        self.directory.get(key)
    }

    /// The participant's conversations, most recent first, with unread counts.
    pub fn list_conversations(&self, participant: &ParticipantId) -> Result<Vec<ConversationSummary>> {
        let mut summaries = Vec::new();
        for conversation in self.directory.list_for_participant(participant)? {
            let Some(peer) = conversation.other_participant(participant).cloned() else {
                continue;
            };
            let unread = self.messages.unread_count(&conversation.key, participant)?;
            summaries.push(ConversationSummary {
                conversation,
                peer,
                unread,
            });
        }
        Ok(summaries)
    }

    // Messages

    pub fn send_message(&self, key: &ConversationKey, sender: &Sender, text: &str) -> Result<Message> {
        self.messages.send(key, sender, text)
    }

    pub fn send_message_with_id(
        &self,
        key: &ConversationKey,
        sender: &Sender,
        text: &str,
        message_id: &str,
    ) -> Result<Message> {
        self.messages.send_with_id(key, sender, text, message_id)
    }

    pub fn messages(&self, key: &ConversationKey) -> Result<Vec<Message>> {
        self.messages.messages(key)
    }

    pub fn subscribe_messages(
        &self,
        key: &ConversationKey,
        viewer: Option<&ParticipantId>,
        callback: Callback<Vec<Message>>,
    ) -> Result<SubscriptionHandle> {
        self.messages.subscribe(key, viewer, callback)
    }

    pub fn mark_read(&self, key: &ConversationKey, target: &ReadTarget) -> Result<Vec<Message>> {
        self.messages.mark_read(key, target)
    }

    pub fn mark_delivered(
        &self,
        key: &ConversationKey,
        message_id: &str,
        recipient: &ParticipantId,
    ) -> Result<Message> {
        self.messages.mark_delivered(key, message_id, recipient)
    }

    pub fn unread_count(&self, key: &ConversationKey, reader: &ParticipantId) -> Result<usize> {
        self.messages.unread_count(key, reader)
    }

    // Presence

    /// Going offline with a named session only closes that session; without
    /// one every session is closed.
    pub fn set_presence(
        &self,
        participant: &ParticipantId,
        online: bool,
        role: Role,
        metadata: &PresenceMetadata,
    ) -> Result<Option<PresenceRecord>> {
        if online {
            return self.presence.set_online(participant, role, metadata).map(Some);
        }
        match &metadata.session_id {
            Some(session) => self.presence.apply(
                PresenceUpdate::new(participant.clone(), self.clock.now_millis(), PresenceChange::Offline)
                    .with_session(session.clone()),
            ),
            None => self.presence.set_offline(participant).map(Some),
        }
    }

    pub fn heartbeat(&self, participant: &ParticipantId, session_id: Option<&str>) -> Result<Option<PresenceRecord>> {
        self.presence
            .heartbeat(participant, session_id.unwrap_or(crate::DEFAULT_SESSION))
    }

    pub fn visibility_changed(
        &self,
        participant: &ParticipantId,
        session_id: Option<&str>,
        visible: bool,
    ) -> Result<Option<PresenceRecord>> {
        self.presence.on_visibility_change(
            participant,
            session_id.unwrap_or(crate::DEFAULT_SESSION),
            visible,
        )
    }

    pub fn presence(&self, participant: &ParticipantId) -> Result<Option<PresenceRecord>> {
        self.presence.get(participant)
    }

    pub fn subscribe_presence(
        &self,
        participant: &ParticipantId,
        callback: Callback<Option<PresenceRecord>>,
    ) -> SubscriptionHandle {
        self.presence.subscribe(participant, callback)
    }

    /// Runs the presence timeout check against the current clock.
    pub fn sweep_presence(&self) -> Result<Vec<ParticipantId>> {
        self.presence.sweep(self.clock.now_millis())
    }

    // Notifications

    pub fn notify(
        &self,
        recipient: &ParticipantId,
        kind: NotificationKind,
        title: &str,
        body: &str,
    ) -> Result<Notification> {
        self.notifications.notify(recipient, kind, title, body)
    }

    pub fn notifications(&self, recipient: &ParticipantId) -> Result<Vec<Notification>> {
        self.notifications.list(recipient)
    }

    pub fn subscribe_notifications(
        &self,
        recipient: &ParticipantId,
        callback: Callback<Vec<Notification>>,
    ) -> SubscriptionHandle {
        self.notifications.subscribe(recipient, callback)
    }

    pub fn mark_notification_read(&self, id: &str) -> Result<Notification> {
        self.notifications.mark_read(id)
    }

    // Maintenance

    /// Retries stale subscriptions whose backoff elapsed. Returns how many
    /// topics were refreshed.
    pub fn retry_subscriptions(&self) -> usize {
        self.messages.retry_subscriptions()
            + self.presence.retry_subscriptions()
            + self.notifications.retry_subscriptions()
    }

    /// One maintenance pass: presence timeouts, then subscription retries.
    pub fn run_maintenance(&self, events: Option<&EventSender<MaintenanceEvent>>) {
        match self.sweep_presence() {
            Ok(expired) => {
                if let Some(events) = events {
                    for participant in expired {
                        let _ = events.send(MaintenanceEvent::PresenceExpired(participant));
                    }
                }
            }
            Err(e) => tracing::warn!(error = %e, "presence sweep failed"),
        }
        let retried = self.retry_subscriptions();
        if retried > 0 {
            if let Some(events) = events {
                let _ = events.send(MaintenanceEvent::SubscriptionsRetried(retried));
            }
        }
    }

    /// Starts the background maintenance thread. It stops when the worker is
    /// dropped or when the core itself is gone.
    pub fn spawn_maintenance(
        self: &Arc<Self>,
        events: Option<EventSender<MaintenanceEvent>>,
    ) -> Result<MaintenanceWorker> {
        let core: Weak<ChatCore> = Arc::downgrade(self);
        MaintenanceWorker::spawn(
            self.config.maintenance_interval(),
            move |events: Option<&EventSender<MaintenanceEvent>>| match core.upgrade() {
                Some(core) => {
                    core.run_maintenance(events);
                    true
                }
                None => false,
            },
            events,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Error, InMemoryStorage, ManualClock};

    fn core(clock: &ManualClock) -> ChatCore {
        ChatCore::with_clock(
            Arc::new(InMemoryStorage::new()),
            Arc::new(clock.clone()),
            ChatConfig::default(),
        )
    }

    #[test]
    fn send_creates_notification_for_recipient() {
        let clock = ManualClock::new(0);
        let core = core(&clock);
        let u1 = ParticipantId::new("u1").unwrap();
        let p1 = ParticipantId::new("p1").unwrap();
        let key = core.resolve_conversation(&u1, &p1);
        let sender = Sender::new(u1.clone(), Role::Tourist, "Amina");

        core.send_message(&key, &sender, "Hello").unwrap();
        let feed = core.notifications(&p1).unwrap();
        assert_eq!(feed.len(), 1);
        assert_eq!(feed[0].kind, NotificationKind::Message);
        assert!(core.notifications(&u1).unwrap().is_empty());
    }

    #[test]
    fn list_conversations_reports_peer_and_unread() {
        let clock = ManualClock::new(0);
        let core = core(&clock);
        let u1 = ParticipantId::new("u1").unwrap();
        let p1 = ParticipantId::new("p1").unwrap();
        let key = core.open_conversation(&u1, &p1).unwrap().key;
        core.send_message(&key, &Sender::new(p1.clone(), Role::Provider, "Juma"), "Karibu")
            .unwrap();

        let listed = core.list_conversations(&u1).unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].peer, p1);
        assert_eq!(listed[0].unread, 1);
        assert_eq!(core.list_conversations(&p1).unwrap()[0].unread, 0);
    }

    #[test]
    fn offline_for_one_session_keeps_others() {
        let clock = ManualClock::new(0);
        let core = core(&clock);
        let p1 = ParticipantId::new("p1").unwrap();
        core.set_presence(&p1, true, Role::Provider, &PresenceMetadata::session("phone"))
            .unwrap();
        core.set_presence(&p1, true, Role::Provider, &PresenceMetadata::session("laptop"))
            .unwrap();
        clock.advance(1);
        let record = core
            .set_presence(&p1, false, Role::Provider, &PresenceMetadata::session("phone"))
            .unwrap()
            .unwrap();
        assert!(record.online);
        let record = core
            .set_presence(&p1, false, Role::Provider, &PresenceMetadata::default())
            .unwrap()
            .unwrap();
        assert!(!record.online);
    }

    #[test]
    fn presence_never_blocks_sending() {
        let clock = ManualClock::new(0);
        let core = core(&clock);
        let u1 = ParticipantId::new("u1").unwrap();
        let p1 = ParticipantId::new("p1").unwrap();
        core.set_presence(&p1, false, Role::Provider, &PresenceMetadata::default())
            .unwrap();
        let key = core.resolve_conversation(&u1, &p1);
        assert!(core
            .send_message(&key, &Sender::new(u1, Role::Tourist, "Amina"), "Anyone there?")
            .is_ok());
    }

    #[test]
    fn mark_all_unread_requires_participant() {
        let clock = ManualClock::new(0);
        let core = core(&clock);
        let key = core.resolve_conversation(
            &ParticipantId::new("u1").unwrap(),
            &ParticipantId::new("p1").unwrap(),
        );
        let err = core
            .mark_read(
                &key,
                &ReadTarget::AllUnread {
                    reader: ParticipantId::new("x").unwrap(),
                },
            )
            .unwrap_err();
        assert!(matches!(err, Error::NotAParticipant { .. }));
    }
}
