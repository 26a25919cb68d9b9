use anyhow::Result;
use safari_chat::{PresenceMetadata, Role};
use serde::Serialize;
use std::path::Path;

use crate::config::{Config, Identity};
use crate::output::Output;

use super::{open_core, parse_participant, store_dir};

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WhoamiResult {
    participant_id: String,
    display_name: String,
    role: String,
    logged_in: bool,
}

/// Store the identity handed over by the marketplace login
pub async fn login(
    id: &str,
    name: Option<&str>,
    role: Role,
    config: &Config,
    output: &Output,
) -> Result<()> {
    let participant_id = parse_participant(id)?;
    let display_name = name
        .map(str::trim)
        .filter(|n| !n.is_empty())
        .unwrap_or(participant_id.as_str())
        .to_string();

    let identity = Identity {
        participant_id,
        display_name,
        role,
    };
    let mut config = config.clone();
    config.set_identity(identity.clone())?;

    output.success("login", identity);
    Ok(())
}

/// Go offline, forget the identity and drop the local chat store
pub async fn logout(data_dir: &Path, config: &Config, output: &Output) -> Result<()> {
    let mut config = config.clone();
    if let Some(identity) = config.identity.clone() {
        let core = open_core(data_dir, &config)?;
        if let Err(e) = core.set_presence(
            &identity.participant_id,
            false,
            identity.role,
            &PresenceMetadata::default(),
        ) {
            tracing::warn!(error = %e, "could not publish offline presence on logout");
        }
    }
    config.clear_identity()?;

    let store = store_dir(data_dir);
    if store.exists() {
        std::fs::remove_dir_all(&store)?;
    }

    output.success_message("logout", "Logged out and cleared all data");
    Ok(())
}

/// Show current identity
pub async fn whoami(config: &Config, output: &Output) -> Result<()> {
    let result = match &config.identity {
        Some(identity) => WhoamiResult {
            participant_id: identity.participant_id.to_string(),
            display_name: identity.display_name.clone(),
            role: identity.role.to_string(),
            logged_in: true,
        },
        None => WhoamiResult {
            participant_id: String::new(),
            display_name: String::new(),
            role: String::new(),
            logged_in: false,
        },
    };
    output.success("whoami", result);
    Ok(())
}
