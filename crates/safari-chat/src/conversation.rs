use crate::storage::{read_all_json, read_json, update_json, Update};
use crate::{
    Clock, Conversation, ConversationKey, Error, LastMessage, Message, ParticipantId, Result,
    StorageAdapter, KEY_SEPARATOR,
};
use std::sync::Arc;

const CONVERSATION_PREFIX: &str = "conversations/";
const PARTICIPANT_INDEX_PREFIX: &str = "participant-conversations/";

/// Derives the conversation key for an unordered pair of participants.
///
/// Each id is percent-encoded and the encodings are sorted before joining,
/// so `resolve(a, b) == resolve(b, a)` and ids containing the separator
/// cannot produce the same key as a different pair.
pub fn resolve(a: &ParticipantId, b: &ParticipantId) -> ConversationKey {
    let mut parts = [encode(a), encode(b)];
    parts.sort();
    ConversationKey::from_encoded(format!("{}{}{}", parts[0], KEY_SEPARATOR, parts[1]))
}

fn encode(id: &ParticipantId) -> String {
    urlencoding::encode(id.as_str()).into_owned()
}

impl ConversationKey {
    /// Parses a key produced by [`resolve`], rejecting anything that is not
    /// in canonical form.
    pub fn parse(raw: &str) -> Result<Self> {
        let key = ConversationKey::from_encoded(raw.to_string());
        let (a, b) = key.participants()?;
        if resolve(&a, &b) != key {
            return Err(Error::InvalidParticipant(format!(
                "conversation key is not canonical: {}",
                raw
            )));
        }
        Ok(key)
    }

    /// The two participant ids, in key order.
    pub fn participants(&self) -> Result<(ParticipantId, ParticipantId)> {
        let invalid = || Error::InvalidParticipant(format!("malformed conversation key: {}", self));
        let (left, right) = self.as_str().split_once(KEY_SEPARATOR).ok_or_else(invalid)?;
        let left = urlencoding::decode(left).map_err(|_| invalid())?;
        let right = urlencoding::decode(right).map_err(|_| invalid())?;
        Ok((ParticipantId::new(left)?, ParticipantId::new(right)?))
    }
}

pub(crate) fn conversation_storage_key(key: &ConversationKey) -> String {
    format!("{}{}", CONVERSATION_PREFIX, key)
}

fn participant_index_key(id: &ParticipantId, key: &ConversationKey) -> String {
    format!("{}{}/{}", PARTICIPANT_INDEX_PREFIX, encode(id), key)
}

/// Sequence number and timestamp handed to a new message.
pub(crate) struct Allocation {
    pub seq: u64,
    pub created_at: u64,
}

pub struct ConversationDirectory {
    storage: Arc<dyn StorageAdapter>,
    clock: Arc<dyn Clock>,
    max_cas_retries: u32,
}

impl ConversationDirectory {
    pub fn new(storage: Arc<dyn StorageAdapter>, clock: Arc<dyn Clock>, max_cas_retries: u32) -> Self {
        Self {
            storage,
            clock,
            max_cas_retries,
        }
    }

    /// Returns the conversation for `key`, creating it on first use. Racing
    /// creators all end up with the single stored record.
    pub fn get_or_create(&self, key: &ConversationKey) -> Result<Conversation> {
        if let Some(existing) = self.get(key)? {
            self.index(&existing)?;
            return Ok(existing);
        }

        let (a, b) = key.participants()?;
        if a == b {
            return Err(Error::InvalidParticipant(format!(
                "{} cannot start a conversation with themselves",
                a
            )));
        }

        let conversation = Conversation {
            key: key.clone(),
            participants: [a, b],
            created_at: self.clock.now_millis(),
            next_seq: 0,
            last_message_at: None,
            last_message: None,
        };
        // Index first: an entry without a record is skipped by listings, a
        // record without its entries would be invisible to them.
        self.index(&conversation)?;
        let encoded = serde_json::to_string(&conversation)?;
        let storage_key = conversation_storage_key(key);
        let created = self
            .storage
            .insert_if_absent(&storage_key, encoded)
            .map_err(Error::into_persistence)?;

        if created {
            tracing::debug!(conversation = %key, "conversation created");
            return Ok(conversation);
        }

        self.get(key)?
            .ok_or_else(|| Error::PersistenceFailure(format!("conversation {} vanished", key)))
    }

    /// Writes any missing participant index entries for `conversation`.
    fn index(&self, conversation: &Conversation) -> Result<()> {
        for participant in &conversation.participants {
            let index_key = participant_index_key(participant, &conversation.key);
            if self
                .storage
                .get(&index_key)
                .map_err(Error::into_persistence)?
                .is_none()
            {
                self.storage
                    .put(&index_key, conversation.key.to_string())
                    .map_err(Error::into_persistence)?;
            }
        }
        Ok(())
    }

    pub fn get(&self, key: &ConversationKey) -> Result<Option<Conversation>> {
        read_json(self.storage.as_ref(), &conversation_storage_key(key)).map_err(Error::into_persistence)
    }

    pub fn require(&self, key: &ConversationKey) -> Result<Conversation> {
        self.get(key)?
            .ok_or_else(|| Error::ConversationNotFound(key.to_string()))
    }

    /// Conversations `participant` belongs to, most recent activity first.
    pub fn list_for_participant(&self, participant: &ParticipantId) -> Result<Vec<Conversation>> {
        let prefix = format!("{}{}/", PARTICIPANT_INDEX_PREFIX, encode(participant));
        let keys = self.storage.list(&prefix).map_err(Error::into_persistence)?;
        let mut conversations = Vec::new();
        for index_key in keys {
            let Some(raw) = index_key.strip_prefix(&prefix) else {
                continue;
            };
            let key = ConversationKey::from_encoded(raw.to_string());
            if let Some(conversation) = self.get(&key)? {
                conversations.push(conversation);
            }
        }
        conversations.sort_by(|a, b| {
            b.last_activity()
                .cmp(&a.last_activity())
                .then_with(|| a.key.cmp(&b.key))
        });
        Ok(conversations)
    }

    /// Every stored conversation, used by maintenance and tooling.
    pub fn list_all(&self) -> Result<Vec<Conversation>> {
        read_all_json(self.storage.as_ref(), CONVERSATION_PREFIX).map_err(Error::into_persistence)
    }

    /// Reserves the next sequence number. The timestamp never goes below the
    /// previous message's, so `(created_at, seq)` and `seq` order agree.
    pub(crate) fn allocate(&self, key: &ConversationKey) -> Result<Allocation> {
        let now = self.clock.now_millis();
        let mut allocation = None;
        update_json::<Conversation, _>(
            self.storage.as_ref(),
            &conversation_storage_key(key),
            self.max_cas_retries,
            |current| {
                let mut conversation =
                    current.ok_or_else(|| Error::ConversationNotFound(key.to_string()))?;
                let created_at = conversation
                    .last_message_at
                    .map(|last| last.max(now))
                    .unwrap_or(now);
                allocation = Some(Allocation {
                    seq: conversation.next_seq,
                    created_at,
                });
                conversation.next_seq += 1;
                conversation.last_message_at = Some(created_at);
                Ok(Update::Write(conversation))
            },
        )
        .map_err(Error::into_persistence)?;
        allocation.ok_or_else(|| Error::PersistenceFailure("sequence allocation failed".to_string()))
    }

    /// Moves the cached last-message summary forward; older messages never
    /// replace a newer summary. Returns whether the summary moved.
    pub(crate) fn record_last_message(&self, message: &Message) -> Result<bool> {
        update_json::<Conversation, _>(
            self.storage.as_ref(),
            &conversation_storage_key(&message.conversation),
            self.max_cas_retries,
            |current| {
                let Some(mut conversation) = current else {
                    return Ok(Update::Keep);
                };
                if conversation
                    .last_message
                    .as_ref()
                    .map(|last| last.seq >= message.seq)
                    .unwrap_or(false)
                {
                    return Ok(Update::Keep);
                }
                conversation.last_message = Some(LastMessage {
                    message_id: message.id.clone(),
                    sender_id: message.sender_id.clone(),
                    preview: message.preview(),
                    created_at: message.created_at,
                    seq: message.seq,
                });
                Ok(Update::Write(conversation))
            },
        )
        .map(|outcome| outcome.changed)
        .map_err(Error::into_persistence)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{InMemoryStorage, ManualClock};

    fn id(s: &str) -> ParticipantId {
        ParticipantId::new(s).unwrap()
    }

    fn directory(clock: &ManualClock) -> ConversationDirectory {
        ConversationDirectory::new(Arc::new(InMemoryStorage::new()), Arc::new(clock.clone()), 8)
    }

    /// Rejects writes to the participant index while `down` is set.
    struct IndexDown {
        inner: InMemoryStorage,
        down: std::sync::atomic::AtomicBool,
    }

    impl IndexDown {
        fn check(&self, key: &str) -> Result<()> {
            if key.starts_with(PARTICIPANT_INDEX_PREFIX)
                && self.down.load(std::sync::atomic::Ordering::SeqCst)
            {
                return Err(Error::Storage("index unavailable".to_string()));
            }
            Ok(())
        }
    }

    impl StorageAdapter for IndexDown {
        fn get(&self, key: &str) -> Result<Option<String>> {
            self.inner.get(key)
        }

        fn put(&self, key: &str, value: String) -> Result<()> {
            self.check(key)?;
            self.inner.put(key, value)
        }

        fn del(&self, key: &str) -> Result<()> {
            self.inner.del(key)
        }

        fn list(&self, prefix: &str) -> Result<Vec<String>> {
            self.inner.list(prefix)
        }

        fn compare_and_swap(&self, key: &str, expected: Option<&str>, value: String) -> Result<bool> {
            self.check(key)?;
            self.inner.compare_and_swap(key, expected, value)
        }
    }

    #[test]
    fn resolve_is_commutative() {
        let pairs = [("u1", "p1"), ("alice", "bob"), ("z", "a"), ("same-prefix", "same")];
        for (a, b) in pairs {
            assert_eq!(resolve(&id(a), &id(b)), resolve(&id(b), &id(a)));
        }
    }

    #[test]
    fn separator_inside_ids_does_not_collide() {
        // Naive "a:b" + "c" vs "a" + "b:c" concatenation would collide.
        let first = resolve(&id("a:b"), &id("c"));
        let second = resolve(&id("a"), &id("b:c"));
        assert_ne!(first, second);

        let (x, y) = first.participants().unwrap();
        let mut ids = vec![x.as_str().to_string(), y.as_str().to_string()];
        ids.sort();
        assert_eq!(ids, vec!["a:b".to_string(), "c".to_string()]);
    }

    #[test]
    fn parse_round_trips_and_rejects_garbage() {
        let key = resolve(&id("tourist/42"), &id("driver 7"));
        assert_eq!(ConversationKey::parse(key.as_str()).unwrap(), key);
        assert!(ConversationKey::parse("no-separator").is_err());
        assert!(ConversationKey::parse("b:a").is_err());
        assert!(ConversationKey::parse(":a").is_err());
    }

    #[test]
    fn get_or_create_is_idempotent() {
        let clock = ManualClock::new(100);
        let directory = directory(&clock);
        let key = resolve(&id("u1"), &id("p1"));

        let first = directory.get_or_create(&key).unwrap();
        clock.advance(1_000);
        for _ in 0..10 {
            let again = directory.get_or_create(&key).unwrap();
            assert_eq!(again, first);
        }
        assert_eq!(directory.list_all().unwrap().len(), 1);
        assert_eq!(first.created_at, 100);
    }

    #[test]
    fn self_conversation_is_rejected() {
        let clock = ManualClock::new(0);
        let directory = directory(&clock);
        let key = resolve(&id("u1"), &id("u1"));
        assert!(matches!(
            directory.get_or_create(&key),
            Err(Error::InvalidParticipant(_))
        ));
    }

    #[test]
    fn allocation_is_monotonic_even_if_clock_goes_back() {
        let clock = ManualClock::new(5_000);
        let directory = directory(&clock);
        let key = resolve(&id("u1"), &id("p1"));
        directory.get_or_create(&key).unwrap();

        let first = directory.allocate(&key).unwrap();
        clock.set(4_000);
        let second = directory.allocate(&key).unwrap();
        assert_eq!(first.seq, 0);
        assert_eq!(second.seq, 1);
        assert_eq!(second.created_at, 5_000);
    }

    #[test]
    fn list_for_participant_orders_by_activity() {
        let clock = ManualClock::new(0);
        let directory = directory(&clock);
        let older = resolve(&id("u1"), &id("p1"));
        let newer = resolve(&id("u1"), &id("p2"));
        directory.get_or_create(&older).unwrap();
        clock.advance(10);
        directory.get_or_create(&newer).unwrap();
        clock.advance(10);
        directory.allocate(&older).unwrap();

        let listed: Vec<_> = directory
            .list_for_participant(&id("u1"))
            .unwrap()
            .into_iter()
            .map(|c| c.key)
            .collect();
        assert_eq!(listed, vec![older.clone(), newer]);
        assert_eq!(directory.list_for_participant(&id("p1")).unwrap().len(), 1);
        assert!(directory.list_for_participant(&id("nobody")).unwrap().is_empty());
    }

    #[test]
    fn failed_index_write_is_repaired_by_a_later_call() {
        let clock = ManualClock::new(0);
        let storage = Arc::new(IndexDown {
            inner: InMemoryStorage::new(),
            down: std::sync::atomic::AtomicBool::new(true),
        });
        let directory = ConversationDirectory::new(storage.clone(), Arc::new(clock.clone()), 8);
        let key = resolve(&id("u1"), &id("p1"));

        assert!(matches!(
            directory.get_or_create(&key),
            Err(Error::PersistenceFailure(_))
        ));
        assert!(directory.get(&key).unwrap().is_none());

        storage.down.store(false, std::sync::atomic::Ordering::SeqCst);
        directory.get_or_create(&key).unwrap();
        assert_eq!(directory.list_for_participant(&id("u1")).unwrap().len(), 1);

        // A record that lost its index entry is re-indexed on the next lookup.
        storage
            .inner
            .del(&participant_index_key(&id("p1"), &key))
            .unwrap();
        assert!(directory.list_for_participant(&id("p1")).unwrap().is_empty());
        directory.get_or_create(&key).unwrap();
        assert_eq!(directory.list_for_participant(&id("p1")).unwrap().len(), 1);
    }
}
