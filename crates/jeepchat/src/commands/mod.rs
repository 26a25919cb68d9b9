pub mod conversation;
pub mod identity;
pub mod message;
pub mod notification;
pub mod presence;

use anyhow::{Context, Result};
use safari_chat::{ChatCore, FileStorageAdapter, ParticipantId};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::Config;

/// Directory under the data dir holding the chat documents.
pub fn store_dir(data_dir: &Path) -> PathBuf {
    data_dir.join("store")
}

/// Opens the file-backed chat core shared by every command.
pub fn open_core(data_dir: &Path, config: &Config) -> Result<Arc<ChatCore>> {
    let storage = FileStorageAdapter::new(store_dir(data_dir)).context("Failed to open chat store")?;
    Ok(Arc::new(ChatCore::new(Arc::new(storage), config.chat.clone())))
}

pub(crate) fn parse_participant(raw: &str) -> Result<ParticipantId> {
    ParticipantId::new(raw).with_context(|| format!("Invalid participant id: {:?}", raw))
}
