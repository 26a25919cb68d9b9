use anyhow::Result;
use safari_chat::{PresenceMetadata, PresenceRecord};
use serde::Serialize;
use std::path::Path;

use crate::config::Config;
use crate::output::Output;

use super::{open_core, parse_participant};

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PresenceView {
    participant_id: String,
    status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    record: Option<PresenceRecord>,
}

impl PresenceView {
    fn new(participant_id: String, record: Option<PresenceRecord>) -> Self {
        let status = record
            .as_ref()
            .map(|r| r.display_status().to_string())
            .unwrap_or_else(|| "offline".to_string());
        Self {
            participant_id,
            status,
            record,
        }
    }
}

#[derive(Serialize)]
struct SweepResult {
    expired: Vec<String>,
}

fn session<'a>(config: &'a Config, session: Option<&'a str>) -> &'a str {
    session.unwrap_or(config.session_id.as_str())
}

/// Mark this session online
pub async fn online(
    status: Option<&str>,
    session_id: Option<&str>,
    data_dir: &Path,
    config: &Config,
    output: &Output,
) -> Result<()> {
    let identity = config.identity()?;
    let core = open_core(data_dir, config)?;
    let metadata = PresenceMetadata {
        session_id: Some(session(config, session_id).to_string()),
        display_name: Some(identity.display_name.clone()),
        status: status.map(str::to_string),
    };
    let record = core.set_presence(&identity.participant_id, true, identity.role, &metadata)?;
    output.success(
        "presence.online",
        PresenceView::new(identity.participant_id.to_string(), record),
    );
    Ok(())
}

/// Mark one session offline, or sign out of every session
pub async fn offline(
    session_id: Option<&str>,
    data_dir: &Path,
    config: &Config,
    output: &Output,
) -> Result<()> {
    let identity = config.identity()?;
    let core = open_core(data_dir, config)?;
    let metadata = PresenceMetadata {
        session_id: session_id.map(str::to_string),
        ..Default::default()
    };
    core.set_presence(&identity.participant_id, false, identity.role, &metadata)?;
    let record = core.presence(&identity.participant_id)?;
    output.success(
        "presence.offline",
        PresenceView::new(identity.participant_id.to_string(), record),
    );
    Ok(())
}

/// Keep a session alive
pub async fn heartbeat(
    session_id: Option<&str>,
    data_dir: &Path,
    config: &Config,
    output: &Output,
) -> Result<()> {
    let identity = config.identity()?;
    let core = open_core(data_dir, config)?;
    let session_id = session(config, session_id);
    match core.heartbeat(&identity.participant_id, Some(session_id))? {
        Some(record) => output.success(
            "presence.heartbeat",
            PresenceView::new(identity.participant_id.to_string(), Some(record)),
        ),
        None => output.success_message(
            "presence.heartbeat",
            &format!("Session {} is not online; nothing to refresh", session_id),
        ),
    }
    Ok(())
}

/// Report a page visibility change for a session
pub async fn visibility(
    visible: bool,
    session_id: Option<&str>,
    data_dir: &Path,
    config: &Config,
    output: &Output,
) -> Result<()> {
    let identity = config.identity()?;
    let core = open_core(data_dir, config)?;
    core.visibility_changed(
        &identity.participant_id,
        Some(session(config, session_id)),
        visible,
    )?;
    let record = core.presence(&identity.participant_id)?;
    output.success(
        "presence.visibility",
        PresenceView::new(identity.participant_id.to_string(), record),
    );
    Ok(())
}

/// Show someone's presence
pub async fn show(participant: &str, data_dir: &Path, config: &Config, output: &Output) -> Result<()> {
    let participant = parse_participant(participant)?;
    let core = open_core(data_dir, config)?;
    let record = core.presence(&participant)?;
    output.success("presence.show", PresenceView::new(participant.to_string(), record));
    Ok(())
}

/// Expire sessions whose heartbeat or grace period ran out
pub async fn sweep(data_dir: &Path, config: &Config, output: &Output) -> Result<()> {
    let core = open_core(data_dir, config)?;
    let expired = core.sweep_presence()?;
    output.success(
        "presence.sweep",
        SweepResult {
            expired: expired.iter().map(ToString::to_string).collect(),
        },
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Identity;
    use safari_chat::{ParticipantId, Role};
    use tempfile::TempDir;

    fn setup() -> (TempDir, Config) {
        let temp = TempDir::new().unwrap();
        let mut config = Config::load(temp.path()).unwrap();
        config
            .set_identity(Identity {
                participant_id: ParticipantId::new("p1").unwrap(),
                display_name: "Juma".to_string(),
                role: Role::Provider,
            })
            .unwrap();
        (temp, config)
    }

    fn record(temp: &TempDir, config: &Config) -> Option<PresenceRecord> {
        let core = open_core(temp.path(), config).unwrap();
        core.presence(&ParticipantId::new("p1").unwrap()).unwrap()
    }

    #[tokio::test]
    async fn test_online_then_offline() {
        let (temp, config) = setup();
        let output = Output::new(true);

        online(Some("On a game drive"), None, temp.path(), &config, &output)
            .await
            .unwrap();
        let current = record(&temp, &config).unwrap();
        assert!(current.online);
        assert_eq!(current.display_status(), "On a game drive");
        assert_eq!(current.role, Some(Role::Provider));
        assert!(current.sessions.contains_key("cli"));

        offline(None, temp.path(), &config, &output).await.unwrap();
        let current = record(&temp, &config).unwrap();
        assert!(!current.online);
        assert_eq!(current.display_status(), "offline");
    }

    #[tokio::test]
    async fn test_offline_for_one_session_keeps_the_other() {
        let (temp, config) = setup();
        let output = Output::new(true);
        online(None, Some("phone"), temp.path(), &config, &output)
            .await
            .unwrap();
        online(None, Some("laptop"), temp.path(), &config, &output)
            .await
            .unwrap();

        offline(Some("phone"), temp.path(), &config, &output)
            .await
            .unwrap();
        let current = record(&temp, &config).unwrap();
        assert!(current.online);
        assert!(!current.sessions["phone"].online);
        assert!(current.sessions["laptop"].online);
    }

    #[tokio::test]
    async fn test_heartbeat_unknown_session_is_noop() {
        let (temp, config) = setup();
        let output = Output::new(true);
        heartbeat(None, temp.path(), &config, &output).await.unwrap();
        assert!(record(&temp, &config).is_none());
    }

    #[tokio::test]
    async fn test_hidden_page_stays_online_during_grace() {
        let (temp, config) = setup();
        let output = Output::new(true);
        online(None, None, temp.path(), &config, &output)
            .await
            .unwrap();
        visibility(false, None, temp.path(), &config, &output)
            .await
            .unwrap();
        sweep(temp.path(), &config, &output).await.unwrap();

        let current = record(&temp, &config).unwrap();
        assert!(current.online);
        assert!(current.sessions["cli"].offline_after.is_some());
    }

    #[tokio::test]
    async fn test_show_unknown_participant() {
        let (temp, config) = setup();
        let output = Output::new(true);
        show("nobody", temp.path(), &config, &output).await.unwrap();
        assert!(show("", temp.path(), &config, &output).await.is_err());
    }
}
