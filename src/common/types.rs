use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A 1:1 conversation between two participants.
///
/// `participant_a` / `participant_b` keep the order the chat was created with;
/// the unread counters follow the same sides.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chat {
    pub id: String,
    pub participant_a: String,
    pub participant_b: String,
    pub last_message_text: Option<String>,
    pub last_message_sender: Option<String>,
    pub last_message_at: Option<DateTime<Utc>>,
    pub unread_count_a: i64,
    pub unread_count_b: i64,
    pub last_activity_at: DateTime<Utc>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Chat {
    pub fn has_participant(&self, user_id: &str) -> bool {
        self.participant_a == user_id || self.participant_b == user_id
    }

    /// The participant on the other side of `user_id`, if `user_id` belongs to this chat.
    pub fn other_participant(&self, user_id: &str) -> Option<&str> {
        if self.participant_a == user_id {
            Some(&self.participant_b)
        } else if self.participant_b == user_id {
            Some(&self.participant_a)
        } else {
            None
        }
    }

    pub fn unread_for(&self, user_id: &str) -> Option<i64> {
        if self.participant_a == user_id {
            Some(self.unread_count_a)
        } else if self.participant_b == user_id {
            Some(self.unread_count_b)
        } else {
            None
        }
    }
}

/// Coarse attachment classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttachmentKind {
    Image,
    File,
}

impl AttachmentKind {
    /// `image/*` is an image, anything else is a plain file.
    pub fn from_mime(mime_type: &str) -> Self {
        if mime_type.trim().to_ascii_lowercase().starts_with("image/") {
            AttachmentKind::Image
        } else {
            AttachmentKind::File
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AttachmentKind::Image => "image",
            AttachmentKind::File => "file",
        }
    }
}

impl fmt::Display for AttachmentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AttachmentKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "image" => Ok(AttachmentKind::Image),
            "file" => Ok(AttachmentKind::File),
            other => Err(format!("unknown attachment type `{other}`")),
        }
    }
}

/// An uploaded file referenced by a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub url: String,
    pub kind: AttachmentKind,
}

/// A chat message as persisted by the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub chat_id: String,
    pub sender_id: String,
    pub content: String,
    pub attachment_url: Option<String>,
    pub attachment_type: Option<AttachmentKind>,
    pub is_read: bool,
    pub read_at: Option<DateTime<Utc>>,
    pub is_deleted: bool,
    pub created_at: DateTime<Utc>,
}

impl Message {
    /// Total order inside a chat: `(created_at, id)` ascending.
    pub fn order_cmp(&self, other: &Message) -> Ordering {
        self.created_at
            .cmp(&other.created_at)
            .then_with(|| self.id.cmp(&other.id))
    }
}

/// Ephemeral presence record published into a chat's presence group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceEntry {
    pub chat_id: String,
    pub user_id: String,
    pub typing: bool,
    pub announced_at: DateTime<Utc>,
}

/// A file picked on the client, not yet uploaded.
#[derive(Debug, Clone)]
pub struct PendingFile {
    pub name: String,
    pub mime_type: String,
    pub bytes: Vec<u8>,
}

impl PendingFile {
    pub fn new(name: impl Into<String>, mime_type: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            mime_type: mime_type.into(),
            bytes,
        }
    }

    pub fn size(&self) -> usize {
        self.bytes.len()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub full_name: String,
    pub avatar_url: Option<String>,
    pub role: String,
}

/// Identity of the signed-in user as handed over by the auth layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthSession {
    pub user_id: String,
    pub profile: Profile,
}
