use crate::pubsub::{Backoff, Callback, Hub, Refresh, SubscriptionHandle};
use crate::storage::{read_json, update_json, Update};
use crate::{
    ChatConfig, Clock, Error, ParticipantId, PresenceMetadata, PresenceRecord, Result, Role,
    SessionPresence, StorageAdapter, DEFAULT_SESSION,
};
use std::sync::Arc;

const PRESENCE_PREFIX: &str = "presence/";

fn presence_key(id: &ParticipantId) -> String {
    format!("{}{}", PRESENCE_PREFIX, urlencoding::encode(id.as_str()))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresenceChange {
    /// Session connected or became visible. `None` fields keep what the
    /// record already has.
    Online {
        role: Option<Role>,
        display_name: Option<String>,
        status: Option<String>,
    },
    Heartbeat,
    /// Page hidden; the session goes offline after the grace period unless
    /// something revives it first.
    Hidden,
    Offline,
    /// Every session of the participant goes offline.
    SignedOut,
}

impl PresenceChange {
    fn is_offline(&self) -> bool {
        matches!(self, PresenceChange::Offline | PresenceChange::SignedOut)
    }
}

/// One timestamped presence write. Writes are ordered per session by
/// `written_at`; on equal timestamps the offline write wins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceUpdate {
    pub participant_id: ParticipantId,
    pub session_id: String,
    pub written_at: u64,
    pub change: PresenceChange,
}

impl PresenceUpdate {
    pub fn new(participant_id: ParticipantId, written_at: u64, change: PresenceChange) -> Self {
        Self {
            participant_id,
            session_id: DEFAULT_SESSION.to_string(),
            written_at,
            change,
        }
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = session_id.into();
        self
    }
}

/// Timing the registry needs from [`ChatConfig`].
#[derive(Debug, Clone, Copy)]
struct Timing {
    heartbeat_timeout_ms: u64,
    visibility_grace_ms: u64,
    session_retention_ms: u64,
}

pub struct PresenceRegistry {
    storage: Arc<dyn StorageAdapter>,
    clock: Arc<dyn Clock>,
    timing: Timing,
    max_cas_retries: u32,
    hub: Hub<ParticipantId, Option<PresenceRecord>>,
}

impl PresenceRegistry {
    pub fn new(storage: Arc<dyn StorageAdapter>, clock: Arc<dyn Clock>, config: &ChatConfig) -> Self {
        let backoff = Backoff::new(
            config.resubscribe_backoff_base_ms,
            config.resubscribe_backoff_max_ms,
        );
        Self {
            hub: Hub::new("presence", clock.clone(), backoff),
            storage,
            clock,
            timing: Timing {
                heartbeat_timeout_ms: config.heartbeat_timeout_ms,
                visibility_grace_ms: config.visibility_grace_ms,
                session_retention_ms: config.session_retention_ms,
            },
            max_cas_retries: config.max_cas_retries,
        }
    }

    pub fn set_online(
        &self,
        id: &ParticipantId,
        role: Role,
        metadata: &PresenceMetadata,
    ) -> Result<PresenceRecord> {
        let update = PresenceUpdate::new(
            id.clone(),
            self.clock.now_millis(),
            PresenceChange::Online {
                role: Some(role),
                display_name: metadata.display_name.clone(),
                status: metadata.status.clone(),
            },
        )
        .with_session(metadata.session_id());
        self.apply_existing(update)
    }

    /// Marks every session offline. Safe to repeat and safe for participants
    /// that never came online.
    pub fn set_offline(&self, id: &ParticipantId) -> Result<PresenceRecord> {
        let update = PresenceUpdate::new(id.clone(), self.clock.now_millis(), PresenceChange::SignedOut);
        self.apply_existing(update)
    }

    /// Refreshes a session's deadline. Returns `None` for sessions the
    /// registry has never seen.
    pub fn heartbeat(&self, id: &ParticipantId, session_id: &str) -> Result<Option<PresenceRecord>> {
        let update = PresenceUpdate::new(id.clone(), self.clock.now_millis(), PresenceChange::Heartbeat)
            .with_session(session_id);
        self.apply(update)
    }

    pub fn on_visibility_change(
        &self,
        id: &ParticipantId,
        session_id: &str,
        visible: bool,
    ) -> Result<Option<PresenceRecord>> {
        let change = if visible {
            PresenceChange::Online {
                role: None,
                display_name: None,
                status: None,
            }
        } else {
            PresenceChange::Hidden
        };
        let update = PresenceUpdate::new(id.clone(), self.clock.now_millis(), change)
            .with_session(session_id);
        self.apply(update)
    }

    /// Applies a timestamped write with last-write-wins semantics and
    /// publishes the record if anything changed.
    pub fn apply(&self, update: PresenceUpdate) -> Result<Option<PresenceRecord>> {
        let timing = self.timing;
        let outcome = update_json::<PresenceRecord, _>(
            self.storage.as_ref(),
            &presence_key(&update.participant_id),
            self.max_cas_retries,
            |current| {
                let mut record =
                    current.unwrap_or_else(|| PresenceRecord::new(update.participant_id.clone()));
                if apply_update(&mut record, &update, timing) {
                    Ok(Update::Write(record))
                } else {
                    Ok(Update::Keep)
                }
            },
        )
        .map_err(|e| {
            let e = e.into_presence();
            tracing::warn!(participant = %update.participant_id, error = %e, "presence write failed");
            e
        })?;

        if outcome.changed {
            tracing::debug!(
                participant = %update.participant_id,
                session = %update.session_id,
                change = ?update.change,
                "presence updated"
            );
            self.hub.notify(&update.participant_id);
        }
        Ok(outcome.value)
    }

    fn apply_existing(&self, update: PresenceUpdate) -> Result<PresenceRecord> {
        let id = update.participant_id.clone();
        self.apply(update)?
            .ok_or_else(|| Error::PresenceWriteFailed(format!("no presence record for {}", id)))
    }

    /// Takes sessions whose heartbeat deadline or visibility grace has passed
    /// offline, and drops long-offline sessions. Returns the participants
    /// that went offline.
    pub fn sweep(&self, now: u64) -> Result<Vec<ParticipantId>> {
        let keys = self
            .storage
            .list(PRESENCE_PREFIX)
            .map_err(Error::into_presence)?;
        let timing = self.timing;
        let mut went_offline = Vec::new();

        for key in keys {
            let mut transitioned = false;
            let outcome = update_json::<PresenceRecord, _>(
                self.storage.as_ref(),
                &key,
                self.max_cas_retries,
                |current| {
                    let Some(mut record) = current else {
                        return Ok(Update::Keep);
                    };
                    let was_online = record.online;
                    if expire_sessions(&mut record, now, timing) {
                        transitioned = was_online && !record.online;
                        Ok(Update::Write(record))
                    } else {
                        Ok(Update::Keep)
                    }
                },
            );
            match outcome {
                Ok(outcome) if outcome.changed => {
                    if let Some(record) = outcome.value {
                        if transitioned {
                            tracing::debug!(participant = %record.participant_id, "presence timed out");
                            went_offline.push(record.participant_id.clone());
                        }
                        self.hub.notify(&record.participant_id);
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "presence sweep failed for record");
                }
            }
        }
        Ok(went_offline)
    }

    pub fn get(&self, id: &ParticipantId) -> Result<Option<PresenceRecord>> {
        read_json(self.storage.as_ref(), &presence_key(id)).map_err(Error::into_presence)
    }

    /// Pushes the participant's record (or `None` while unknown) now and on
    /// every change.
    pub fn subscribe(
        &self,
        id: &ParticipantId,
        callback: Callback<Option<PresenceRecord>>,
    ) -> SubscriptionHandle {
        let storage = self.storage.clone();
        let key = presence_key(id);
        let refresh: Refresh<Option<PresenceRecord>> =
            Arc::new(move || read_json(storage.as_ref(), &key).map_err(Error::into_presence));
        self.hub.subscribe(id.clone(), None, refresh, callback)
    }

    pub fn retry_subscriptions(&self) -> usize {
        self.hub.retry_due()
    }

    pub fn subscriber_count(&self, id: &ParticipantId) -> usize {
        self.hub.subscriber_count(id)
    }
}

/// Returns true if the record changed.
fn apply_update(record: &mut PresenceRecord, update: &PresenceUpdate, timing: Timing) -> bool {
    let t = update.written_at;

    if update.change == PresenceChange::SignedOut {
        let mut changed = false;
        if t > record.signed_out_at {
            record.signed_out_at = t;
            changed = true;
        }
        if record.sessions.is_empty() {
            record
                .sessions
                .insert(DEFAULT_SESSION.to_string(), offline_session(t));
            changed = true;
        }
        for session in record.sessions.values_mut() {
            if accepts(session, t, true) {
                *session = offline_session(t);
                changed = true;
            }
        }
        record.recompute();
        return changed;
    }

    if !update.change.is_offline() && t <= record.signed_out_at {
        tracing::debug!(
            participant = %update.participant_id,
            session = %update.session_id,
            written_at = t,
            signed_out_at = record.signed_out_at,
            "presence write predates sign-out"
        );
        return false;
    }

    let existing = record.sessions.get(&update.session_id);
    if let Some(session) = existing {
        if !accepts(session, t, update.change.is_offline()) {
            tracing::debug!(
                participant = %update.participant_id,
                session = %update.session_id,
                written_at = t,
                "stale presence write ignored"
            );
            return false;
        }
    }

    let next = match (&update.change, existing) {
        (PresenceChange::Online { role, display_name, status }, _) => {
            if role.is_some() {
                record.role = *role;
            }
            if display_name.is_some() {
                record.display_name = display_name.clone();
            }
            if status.is_some() {
                record.status = status.clone();
            }
            online_session(t, timing)
        }
        (PresenceChange::Heartbeat, Some(_)) => online_session(t, timing),
        (PresenceChange::Hidden, Some(session)) if session.online => SessionPresence {
            online: true,
            written_at: t,
            last_seen: t,
            heartbeat_deadline: session.heartbeat_deadline,
            offline_after: Some(t + timing.visibility_grace_ms),
        },
        (PresenceChange::Offline, _) => offline_session(t),
        (PresenceChange::Heartbeat, None) | (PresenceChange::Hidden, _) => return false,
        (PresenceChange::SignedOut, _) => return false,
    };
    record.sessions.insert(update.session_id.clone(), next);
    record.recompute();
    true
}

/// Last-write-wins with offline winning ties.
fn accepts(session: &SessionPresence, t: u64, offline_write: bool) -> bool {
    if t != session.written_at {
        return t > session.written_at;
    }
    offline_write || session.online
}

fn online_session(t: u64, timing: Timing) -> SessionPresence {
    SessionPresence {
        online: true,
        written_at: t,
        last_seen: t,
        heartbeat_deadline: Some(t + timing.heartbeat_timeout_ms),
        offline_after: None,
    }
}

fn offline_session(t: u64) -> SessionPresence {
    SessionPresence {
        online: false,
        written_at: t,
        last_seen: t,
        heartbeat_deadline: None,
        offline_after: None,
    }
}

/// Returns true if the record changed.
fn expire_sessions(record: &mut PresenceRecord, now: u64, timing: Timing) -> bool {
    let mut changed = false;
    for session in record.sessions.values_mut() {
        if !session.online {
            continue;
        }
        let expiry = [session.heartbeat_deadline, session.offline_after]
            .into_iter()
            .flatten()
            .filter(|deadline| *deadline <= now)
            .min();
        if let Some(expiry) = expiry {
            session.online = false;
            session.written_at = session.written_at.max(expiry);
            session.heartbeat_deadline = None;
            session.offline_after = None;
            changed = true;
        }
    }

    let before = record.sessions.len();
    record.sessions.retain(|_, session| {
        session.online || session.written_at.saturating_add(timing.session_retention_ms) > now
    });
    changed |= record.sessions.len() != before;

    if changed {
        record.recompute();
    }
    changed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{InMemoryStorage, ManualClock};

    fn id(s: &str) -> ParticipantId {
        ParticipantId::new(s).unwrap()
    }

    fn registry(clock: &ManualClock) -> PresenceRegistry {
        PresenceRegistry::new(
            Arc::new(InMemoryStorage::new()),
            Arc::new(clock.clone()),
            &ChatConfig::default(),
        )
    }

    #[test]
    fn set_online_is_idempotent() {
        let clock = ManualClock::new(1_000);
        let registry = registry(&clock);
        let first = registry
            .set_online(&id("p1"), Role::Provider, &PresenceMetadata::default())
            .unwrap();
        let second = registry
            .set_online(&id("p1"), Role::Provider, &PresenceMetadata::default())
            .unwrap();
        assert!(first.online && second.online);
        assert_eq!(second.role, Some(Role::Provider));
        assert_eq!(second.sessions.len(), 1);
        assert_eq!(second.last_seen, 1_000);
    }

    #[test]
    fn offline_without_record_is_safe_and_repeatable() {
        let clock = ManualClock::new(50);
        let registry = registry(&clock);
        let record = registry.set_offline(&id("ghost")).unwrap();
        assert!(!record.online);
        assert_eq!(record.role, None);
        clock.advance(10);
        let record = registry.set_offline(&id("ghost")).unwrap();
        assert_eq!(record.last_seen, 60);
    }

    #[test]
    fn heartbeat_for_unknown_participant_is_noop() {
        let clock = ManualClock::new(0);
        let registry = registry(&clock);
        assert_eq!(registry.heartbeat(&id("nobody"), DEFAULT_SESSION).unwrap(), None);
        assert!(registry.get(&id("nobody")).unwrap().is_none());
    }

    #[test]
    fn heartbeat_keeps_metadata() {
        let clock = ManualClock::new(0);
        let registry = registry(&clock);
        let metadata = PresenceMetadata {
            display_name: Some("Juma".to_string()),
            status: Some("At the lodge".to_string()),
            ..Default::default()
        };
        registry.set_online(&id("p1"), Role::Provider, &metadata).unwrap();
        clock.advance(30_000);
        let record = registry.heartbeat(&id("p1"), DEFAULT_SESSION).unwrap().unwrap();
        assert_eq!(record.display_name.as_deref(), Some("Juma"));
        assert_eq!(record.display_status(), "At the lodge");
        assert_eq!(record.last_seen, 30_000);
        assert_eq!(
            record.sessions[DEFAULT_SESSION].heartbeat_deadline,
            Some(120_000)
        );
    }

    #[test]
    fn last_write_wins_in_either_arrival_order() {
        let online = |t| {
            PresenceUpdate::new(
                id("p1"),
                t,
                PresenceChange::Online {
                    role: Some(Role::Provider),
                    display_name: None,
                    status: None,
                },
            )
        };
        let offline = |t| PresenceUpdate::new(id("p1"), t, PresenceChange::Offline);

        for newest_first in [false, true] {
            let clock = ManualClock::new(0);
            let registry = registry(&clock);
            let (older, newer) = (online(100), offline(200));
            if newest_first {
                registry.apply(newer).unwrap();
                registry.apply(older).unwrap();
            } else {
                registry.apply(older).unwrap();
                registry.apply(newer).unwrap();
            }
            let record = registry.get(&id("p1")).unwrap().unwrap();
            assert!(!record.online, "newest_first={}", newest_first);
            assert_eq!(record.last_seen, 200);
        }
    }

    #[test]
    fn offline_wins_ties() {
        let clock = ManualClock::new(0);
        let registry = registry(&clock);
        registry
            .apply(PresenceUpdate::new(id("p1"), 10, PresenceChange::Offline))
            .unwrap();
        registry
            .apply(PresenceUpdate::new(
                id("p1"),
                10,
                PresenceChange::Online {
                    role: Some(Role::Tourist),
                    display_name: None,
                    status: None,
                },
            ))
            .unwrap();
        assert!(!registry.get(&id("p1")).unwrap().unwrap().online);
    }

    #[test]
    fn hidden_goes_offline_after_grace_unless_revived() {
        let clock = ManualClock::new(0);
        let registry = registry(&clock);
        let p1 = id("p1");
        registry
            .set_online(&p1, Role::Provider, &PresenceMetadata::default())
            .unwrap();

        clock.advance(1_000);
        registry.on_visibility_change(&p1, DEFAULT_SESSION, false).unwrap();
        assert!(registry.get(&p1).unwrap().unwrap().online);
        clock.advance(5_000);
        registry.on_visibility_change(&p1, DEFAULT_SESSION, true).unwrap();
        assert!(registry.sweep(clock.advance(20_000)).unwrap().is_empty());

        registry.on_visibility_change(&p1, DEFAULT_SESSION, false).unwrap();
        assert!(registry.sweep(clock.advance(14_999)).unwrap().is_empty());
        assert_eq!(registry.sweep(clock.advance(1)).unwrap(), vec![p1.clone()]);
        let record = registry.get(&p1).unwrap().unwrap();
        assert!(!record.online);
        assert_eq!(record.last_seen, 26_000);
    }

    #[test]
    fn one_open_tab_keeps_participant_online() {
        let clock = ManualClock::new(0);
        let registry = registry(&clock);
        let p1 = id("p1");
        for tab in ["tab-a", "tab-b"] {
            registry
                .set_online(&p1, Role::Tourist, &PresenceMetadata::session(tab))
                .unwrap();
        }
        clock.advance(10);
        registry
            .apply(PresenceUpdate::new(p1.clone(), 10, PresenceChange::Offline).with_session("tab-a"))
            .unwrap();
        assert!(registry.get(&p1).unwrap().unwrap().online);
        registry.set_offline(&p1).unwrap();
        assert!(!registry.get(&p1).unwrap().unwrap().online);
    }

    #[test]
    fn late_online_for_unseen_session_loses_to_sign_out() {
        let clock = ManualClock::new(0);
        let registry = registry(&clock);
        let p1 = id("p1");
        let tab_b_online = PresenceUpdate::new(
            p1.clone(),
            100,
            PresenceChange::Online {
                role: Some(Role::Tourist),
                display_name: None,
                status: None,
            },
        )
        .with_session("tab-b");

        registry
            .apply(PresenceUpdate::new(p1.clone(), 200, PresenceChange::SignedOut))
            .unwrap();
        assert_eq!(registry.apply(tab_b_online.clone()).unwrap().map(|r| r.online), Some(false));
        let record = registry.get(&p1).unwrap().unwrap();
        assert!(!record.online);
        assert!(!record.sessions.contains_key("tab-b"));
        assert_eq!(record.signed_out_at, 200);

        // Same timestamp as the sign-out: offline still wins.
        let tie = PresenceUpdate { written_at: 200, ..tab_b_online.clone() };
        registry.apply(tie).unwrap();
        assert!(!registry.get(&p1).unwrap().unwrap().online);

        // A genuinely newer login comes back online.
        let newer = PresenceUpdate { written_at: 201, ..tab_b_online };
        assert!(registry.apply(newer).unwrap().unwrap().online);
    }

    #[test]
    fn sweep_prunes_old_offline_sessions() {
        let clock = ManualClock::new(0);
        let registry = registry(&clock);
        let p1 = id("p1");
        registry
            .set_online(&p1, Role::Tourist, &PresenceMetadata::session("old-tab"))
            .unwrap();
        registry
            .apply(PresenceUpdate::new(p1.clone(), 1, PresenceChange::Offline).with_session("old-tab"))
            .unwrap();
        let day = ChatConfig::default().session_retention_ms;
        registry.sweep(day + 10).unwrap();
        let record = registry.get(&p1).unwrap().unwrap();
        assert!(record.sessions.is_empty());
        assert_eq!(record.last_seen, 1);
    }
}
