use anyhow::{Context, Result};
use safari_chat::{ChatConfig, ParticipantId, Role, Sender};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Who this CLI acts as, as handed over by the marketplace's login.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub participant_id: ParticipantId,
    pub display_name: String,
    pub role: Role,
}

/// CLI configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identity: Option<Identity>,

    /// Presence session this CLI reports as
    #[serde(default = "default_session")]
    pub session_id: String,

    #[serde(default)]
    pub chat: ChatConfig,

    /// Path to the config file
    #[serde(skip)]
    pub path: PathBuf,
}

fn default_session() -> String {
    "cli".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            identity: None,
            session_id: default_session(),
            chat: ChatConfig::default(),
            path: PathBuf::new(),
        }
    }
}

impl Config {
    /// Load config from the data directory
    pub fn load(data_dir: &Path) -> Result<Self> {
        let config_path = data_dir.join("config.json");

        if config_path.exists() {
            let content =
                std::fs::read_to_string(&config_path).context("Failed to read config file")?;
            let mut config: Config =
                serde_json::from_str(&content).context("Failed to parse config file")?;
            config.path = config_path;
            Ok(config)
        } else {
            Ok(Config {
                path: config_path,
                ..Default::default()
            })
        }
    }

    pub fn save(&self) -> Result<()> {
        let content = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(&self.path, content).context("Failed to write config file")?;
        Ok(())
    }

    pub fn set_identity(&mut self, identity: Identity) -> Result<()> {
        self.identity = Some(identity);
        self.save()
    }

    pub fn clear_identity(&mut self) -> Result<()> {
        self.identity = None;
        self.save()
    }

    pub fn is_logged_in(&self) -> bool {
        self.identity.is_some()
    }

    pub fn identity(&self) -> Result<&Identity> {
        self.identity
            .as_ref()
            .context("Not logged in. Use 'jeepchat login <id>' first.")
    }

    pub fn sender(&self) -> Result<Sender> {
        let identity = self.identity()?;
        Ok(Sender::new(
            identity.participant_id.clone(),
            identity.role,
            identity.display_name.clone(),
        ))
    }
}
