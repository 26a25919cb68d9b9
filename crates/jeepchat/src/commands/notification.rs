use anyhow::Result;
use safari_chat::{Notification, NotificationKind};
use serde::Serialize;
use std::path::Path;

use crate::config::Config;
use crate::output::Output;

use super::{open_core, parse_participant};

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct NotificationList {
    unread: usize,
    notifications: Vec<Notification>,
}

/// List my notifications, newest first
pub async fn list(unread_only: bool, data_dir: &Path, config: &Config, output: &Output) -> Result<()> {
    let me = &config.identity()?.participant_id;
    let core = open_core(data_dir, config)?;
    let mut notifications = core.notifications(me)?;
    let unread = notifications.iter().filter(|n| !n.read).count();
    if unread_only {
        notifications.retain(|n| !n.read);
    }
    output.success(
        "notifications.list",
        NotificationList {
            unread,
            notifications,
        },
    );
    Ok(())
}

/// Mark a notification read
pub async fn read(id: &str, data_dir: &Path, config: &Config, output: &Output) -> Result<()> {
    let core = open_core(data_dir, config)?;
    let notification = core.mark_notification_read(id)?;
    output.success("notifications.read", notification);
    Ok(())
}

/// Send a non-message notification, e.g. a booking update
pub async fn send(
    recipient: &str,
    kind: NotificationKind,
    title: &str,
    body: &str,
    data_dir: &Path,
    config: &Config,
    output: &Output,
) -> Result<()> {
    let recipient = parse_participant(recipient)?;
    let core = open_core(data_dir, config)?;
    let notification = core.notify(&recipient, kind, title, body)?;
    output.success("notifications.send", notification);
    Ok(())
}
