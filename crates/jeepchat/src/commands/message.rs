use anyhow::Result;
use notify::{Event as NotifyEvent, EventKind, RecursiveMode, Watcher};
use safari_chat::{
    ChatCore, ConversationKey, DeliveryState, Message, PresenceMetadata, ReadTarget,
    SubscriptionEvent,
};
use serde::Serialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{mpsc, Arc, Mutex};
use std::time::{Duration, Instant};

use crate::config::Config;
use crate::output::Output;

use super::{open_core, parse_participant, store_dir};

#[derive(Serialize)]
struct MessageList {
    conversation: String,
    messages: Vec<Message>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct MarkReadResult {
    conversation: String,
    marked: usize,
    message_ids: Vec<String>,
}

fn conversation_with(peer: &str, core: &ChatCore, config: &Config) -> Result<ConversationKey> {
    let me = &config.identity()?.participant_id;
    let peer = parse_participant(peer)?;
    Ok(core.resolve_conversation(me, &peer))
}

/// Send a message to a peer
pub async fn send(
    peer: &str,
    text: &str,
    message_id: Option<&str>,
    data_dir: &Path,
    config: &Config,
    output: &Output,
) -> Result<()> {
    let sender = config.sender()?;
    let core = open_core(data_dir, config)?;
    let key = conversation_with(peer, &core, config)?;

    let message = match message_id {
        Some(id) => core.send_message_with_id(&key, &sender, text, id)?,
        None => core.send_message(&key, &sender, text)?,
    };

    output.success("send", message);
    Ok(())
}

/// Read messages from the conversation with a peer
pub async fn read(
    peer: &str,
    limit: usize,
    data_dir: &Path,
    config: &Config,
    output: &Output,
) -> Result<()> {
    let core = open_core(data_dir, config)?;
    let key = conversation_with(peer, &core, config)?;

    let mut messages = core.messages(&key)?;
    if messages.len() > limit {
        messages.drain(..messages.len() - limit);
    }

    output.success(
        "read",
        MessageList {
            conversation: key.to_string(),
            messages,
        },
    );
    Ok(())
}

/// Mark one message, or everything unread from the peer, as read
pub async fn mark_read(
    peer: &str,
    message_id: Option<&str>,
    data_dir: &Path,
    config: &Config,
    output: &Output,
) -> Result<()> {
    let me = config.identity()?.participant_id.clone();
    let core = open_core(data_dir, config)?;
    let key = conversation_with(peer, &core, config)?;

    let target = match message_id {
        Some(id) => ReadTarget::Message {
            id: id.to_string(),
            reader: me,
        },
        None => ReadTarget::AllUnread { reader: me },
    };
    let changed = core.mark_read(&key, &target)?;

    output.success(
        "mark-read",
        MarkReadResult {
            conversation: key.to_string(),
            marked: changed.len(),
            message_ids: changed.into_iter().map(|m| m.id).collect(),
        },
    );
    Ok(())
}

/// What the listener last printed for each message id.
#[derive(Default)]
struct Printed {
    states: HashMap<String, DeliveryState>,
}

impl Printed {
    /// Prints new messages and receipt changes from a snapshot.
    fn show(&mut self, messages: &[Message], output: &Output) {
        for message in messages {
            match self.states.get(&message.id) {
                None => output.event("message", message),
                Some(previous) if *previous != message.delivery => output.event("receipt", message),
                Some(_) => continue,
            }
            self.states.insert(message.id.clone(), message.delivery);
        }
    }
}

/// Stream the conversation with a peer until Ctrl+C, staying online meanwhile
pub async fn listen(peer: &str, data_dir: &Path, config: &Config, output: &Output) -> Result<()> {
    let identity = config.identity()?.clone();
    let me = identity.participant_id.clone();
    let core = open_core(data_dir, config)?;
    let key = conversation_with(peer, &core, config)?;
    let session = PresenceMetadata {
        session_id: Some(config.session_id.clone()),
        display_name: Some(identity.display_name.clone()),
        status: None,
    };

    let printed = Arc::new(Mutex::new(Printed::default()));
    let sink = printed.clone();
    let out = *output;
    let handle = core.subscribe_messages(
        &key,
        Some(&me),
        Arc::new(move |event: SubscriptionEvent<Vec<Message>>| match event {
            SubscriptionEvent::Update(messages) => {
                if let Ok(mut printed) = sink.lock() {
                    printed.show(&messages, &out);
                }
            }
            SubscriptionEvent::Error(error) => out.event(
                "error",
                serde_json::json!({ "message": error.message, "attempt": error.attempt }),
            ),
        }),
    )?;

    if let Err(e) = core.set_presence(&me, true, identity.role, &session) {
        tracing::warn!(error = %e, "could not go online");
    }

    // Other processes write to the same store; re-publish when files change.
    let (fs_tx, fs_rx) = mpsc::channel();
    let mut watcher =
        notify::recommended_watcher(move |res: std::result::Result<NotifyEvent, notify::Error>| {
            if let Ok(event) = res {
                if matches!(
                    event.kind,
                    EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
                ) {
                    let _ = fs_tx.send(());
                }
            }
        })?;
    watcher.watch(&store_dir(data_dir), RecursiveMode::NonRecursive)?;

    output.info(&format!("Listening on conversation {}... (Ctrl+C to stop)", key));

    let heartbeat_every = config.chat.heartbeat_interval();
    let maintenance_every = config.chat.maintenance_interval();
    let mut last_heartbeat = Instant::now();
    let mut last_maintenance = Instant::now();
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => break,
            _ = tokio::time::sleep(Duration::from_millis(250)) => {}
        }

        let mut changed = false;
        while let Ok(()) = fs_rx.try_recv() {
            changed = true;
        }
        if changed {
            if let Err(e) = core.message_store().deliver_pending(&key, &me) {
                tracing::warn!(error = %e, "delivery catch-up failed");
            }
            core.message_store().refresh(&key);
        }

        if last_heartbeat.elapsed() >= heartbeat_every {
            if let Err(e) = core.heartbeat(&me, Some(config.session_id.as_str())) {
                tracing::warn!(error = %e, "heartbeat failed");
            }
            last_heartbeat = Instant::now();
        }
        if last_maintenance.elapsed() >= maintenance_every {
            core.run_maintenance(None);
            last_maintenance = Instant::now();
        }
    }

    handle.unsubscribe();
    if let Err(e) = core.set_presence(&me, false, identity.role, &session) {
        tracing::warn!(error = %e, "could not go offline");
    }
    output.info("Stopped listening");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Identity;
    use safari_chat::{ParticipantId, Role};
    use tempfile::TempDir;

    fn login(config: &mut Config, id: &str, role: Role) {
        config
            .set_identity(Identity {
                participant_id: ParticipantId::new(id).unwrap(),
                display_name: id.to_uppercase(),
                role,
            })
            .unwrap();
    }

    #[tokio::test]
    async fn test_send_and_read_between_two_logins() {
        let temp = TempDir::new().unwrap();
        let output = Output::new(true);
        let mut config = Config::load(temp.path()).unwrap();

        login(&mut config, "u1", Role::Tourist);
        send("p1", "Jambo", None, temp.path(), &config, &output)
            .await
            .unwrap();
        send("p1", "Jambo", Some("fixed-id"), temp.path(), &config, &output)
            .await
            .unwrap();
        send("p1", "Jambo again", Some("fixed-id"), temp.path(), &config, &output)
            .await
            .unwrap();
        assert!(send("p1", "   ", None, temp.path(), &config, &output).await.is_err());

        login(&mut config, "p1", Role::Provider);
        read("u1", 10, temp.path(), &config, &output).await.unwrap();
        mark_read("u1", None, temp.path(), &config, &output)
            .await
            .unwrap();

        let core = open_core(temp.path(), &config).unwrap();
        let key = conversation_with("u1", &core, &config).unwrap();
        let messages = core.messages(&key).unwrap();
        assert_eq!(messages.len(), 2);
        assert!(messages.iter().all(|m| m.is_read() && m.is_delivered()));
        assert_eq!(messages[1].text, "Jambo");
        assert_eq!(core.notifications(&ParticipantId::new("p1").unwrap()).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_mark_single_message_read() {
        let temp = TempDir::new().unwrap();
        let output = Output::new(true);
        let mut config = Config::load(temp.path()).unwrap();
        login(&mut config, "u1", Role::Tourist);
        send("p1", "one", Some("m1"), temp.path(), &config, &output)
            .await
            .unwrap();
        send("p1", "two", Some("m2"), temp.path(), &config, &output)
            .await
            .unwrap();

        // The sender cannot acknowledge their own message.
        assert!(mark_read("p1", Some("m1"), temp.path(), &config, &output)
            .await
            .is_err());

        login(&mut config, "p1", Role::Provider);
        mark_read("u1", Some("m1"), temp.path(), &config, &output)
            .await
            .unwrap();
        assert!(mark_read("u1", Some("missing"), temp.path(), &config, &output)
            .await
            .is_err());

        let core = open_core(temp.path(), &config).unwrap();
        let key = conversation_with("u1", &core, &config).unwrap();
        let me = ParticipantId::new("p1").unwrap();
        assert_eq!(core.unread_count(&key, &me).unwrap(), 1);
    }

    #[test]
    fn test_printed_reports_new_messages_and_receipts_once() {
        let temp = TempDir::new().unwrap();
        let mut config = Config::load(temp.path()).unwrap();
        login(&mut config, "u1", Role::Tourist);
        let core = open_core(temp.path(), &config).unwrap();
        let key = conversation_with("p1", &core, &config).unwrap();
        let sender = config.sender().unwrap();
        let message = core.send_message(&key, &sender, "hi").unwrap();

        let output = Output::new(true);
        let mut printed = Printed::default();
        printed.show(&[message.clone()], &output);
        printed.show(&[message.clone()], &output);
        assert_eq!(printed.states.len(), 1);

        let peer = ParticipantId::new("p1").unwrap();
        let delivered = core.mark_delivered(&key, &message.id, &peer).unwrap();
        printed.show(&[delivered.clone()], &output);
        assert_eq!(printed.states[&message.id], delivered.delivery);
    }
}
