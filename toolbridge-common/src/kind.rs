use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::ToolbridgeError;

/// The six synchronized entity kinds. Each kind maps to one storage table
/// and one family of sync/REST routes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Note,
    Task,
    TaskList,
    Comment,
    Chat,
    ChatMessage,
}

impl EntityKind {
    pub const ALL: [EntityKind; 6] = [
        EntityKind::Note,
        EntityKind::Task,
        EntityKind::TaskList,
        EntityKind::Comment,
        EntityKind::Chat,
        EntityKind::ChatMessage,
    ];

    /// URL path segment used by both the sync and REST surfaces
    /// (`/v1/sync/notes/push`, `/v1/notes/{uid}`, ...).
    pub fn path_segment(&self) -> &'static str {
        match self {
            EntityKind::Note => "notes",
            EntityKind::Task => "tasks",
            EntityKind::TaskList => "task-lists",
            EntityKind::Comment => "comments",
            EntityKind::Chat => "chats",
            EntityKind::ChatMessage => "chat-messages",
        }
    }

    /// Singular name; the value comments carry in `parentKind`.
    pub fn singular(&self) -> &'static str {
        match self {
            EntityKind::Note => "note",
            EntityKind::Task => "task",
            EntityKind::TaskList => "task_list",
            EntityKind::Comment => "comment",
            EntityKind::Chat => "chat",
            EntityKind::ChatMessage => "chat_message",
        }
    }

    /// Storage table name for this kind.
    pub fn table(&self) -> &'static str {
        match self {
            EntityKind::Note => "note",
            EntityKind::Task => "task",
            EntityKind::TaskList => "task_list",
            EntityKind::Comment => "comment",
            EntityKind::Chat => "chat",
            EntityKind::ChatMessage => "chat_message",
        }
    }

    /// Kinds a comment may attach to via `parentKind`.
    pub fn is_comment_parent(&self) -> bool {
        matches!(self, EntityKind::Note | EntityKind::Task)
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.path_segment())
    }
}

impl FromStr for EntityKind {
    type Err = ToolbridgeError;

    /// Accepts both the plural path segment and the singular name.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        for kind in EntityKind::ALL {
            if s == kind.path_segment() || s == kind.singular() {
                return Ok(kind);
            }
        }
        Err(ToolbridgeError::Validation(format!("unknown entity kind: {s}")))
    }
}
