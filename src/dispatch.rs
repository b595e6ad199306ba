//! Application-level commands. Menu items, keyboard shortcuts and toolbar
//! buttons all funnel through [`CommandDispatcher`] so they reach the same
//! session functions a direct gesture would.

use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::broadcast;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AppCommand {
    NewDocument,
    Copy,
    Paste,
    DeleteSelection,
    SelectAll,
    ClearSelection,
    Save,
    Cancel,
    NewCollection,
    Refresh,
}

impl AppCommand {
    pub const ALL: [AppCommand; 10] = [
        AppCommand::NewDocument,
        AppCommand::Copy,
        AppCommand::Paste,
        AppCommand::DeleteSelection,
        AppCommand::SelectAll,
        AppCommand::ClearSelection,
        AppCommand::Save,
        AppCommand::Cancel,
        AppCommand::NewCollection,
        AppCommand::Refresh,
    ];

    /// The menu item id this command is bound to.
    pub fn as_str(&self) -> &'static str {
        match self {
            AppCommand::NewDocument => "new-document",
            AppCommand::Copy => "copy",
            AppCommand::Paste => "paste",
            AppCommand::DeleteSelection => "delete-selection",
            AppCommand::SelectAll => "select-all",
            AppCommand::ClearSelection => "clear-selection",
            AppCommand::Save => "save",
            AppCommand::Cancel => "cancel",
            AppCommand::NewCollection => "new-collection",
            AppCommand::Refresh => "refresh",
        }
    }

    pub fn from_menu_id(id: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|cmd| cmd.as_str() == id)
    }
}

impl fmt::Display for AppCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

const CHANNEL_CAPACITY: usize = 64;

/// Typed fan-out of commands to every active view.
#[derive(Clone)]
pub struct CommandDispatcher {
    tx: broadcast::Sender<AppCommand>,
}

impl Default for CommandDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandDispatcher {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AppCommand> {
        self.tx.subscribe()
    }

    /// Returns how many subscribers will see the command.
    pub fn dispatch(&self, command: AppCommand) -> usize {
        match self.tx.send(command) {
            Ok(receivers) => {
                tracing::debug!(%command, receivers, "dispatched command");
                receivers
            }
            Err(_) => {
                tracing::debug!(%command, "no view subscribed; command dropped");
                0
            }
        }
    }
}
