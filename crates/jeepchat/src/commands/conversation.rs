use anyhow::Result;
use safari_chat::{resolve, ConversationSummary};
use serde::Serialize;
use std::path::Path;

use crate::config::Config;
use crate::output::Output;

use super::{open_core, parse_participant};

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ResolveResult {
    key: String,
    participants: [String; 2],
}

#[derive(Serialize)]
struct ConversationList {
    conversations: Vec<ConversationSummary>,
}

/// Print the conversation key for two participants
pub async fn resolve_key(a: &str, b: &str, output: &Output) -> Result<()> {
    let a = parse_participant(a)?;
    let b = parse_participant(b)?;
    let key = resolve(&a, &b);
    let (first, second) = key.participants()?;
    output.success(
        "conversation.resolve",
        ResolveResult {
            key: key.to_string(),
            participants: [first.to_string(), second.to_string()],
        },
    );
    Ok(())
}

/// Open (create if needed) the conversation with a peer
pub async fn open(peer: &str, data_dir: &Path, config: &Config, output: &Output) -> Result<()> {
    let me = config.identity()?.participant_id.clone();
    let peer = parse_participant(peer)?;
    let core = open_core(data_dir, config)?;
    let conversation = core.open_conversation(&me, &peer)?;
    output.success("conversation.open", conversation);
    Ok(())
}

/// List conversations, most recent first
pub async fn list(data_dir: &Path, config: &Config, output: &Output) -> Result<()> {
    let me = config.identity()?.participant_id.clone();
    let core = open_core(data_dir, config)?;
    let conversations = core.list_conversations(&me)?;
    output.success("conversation.list", ConversationList { conversations });
    Ok(())
}
