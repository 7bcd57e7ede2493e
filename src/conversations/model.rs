//! Conversation and message types.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Maximum characters kept in `last_message_preview`.
pub const PREVIEW_CHARS: usize = 120;

/// A chat thread with one customer phone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: Uuid,
    pub phone: String,
    pub display_name: Option<String>,
    /// Per-conversation automation switch. Defaults to on.
    pub automation_active: bool,
    pub last_message_at: Option<DateTime<Utc>>,
    pub last_message_preview: Option<String>,
}

/// Who wrote a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageSender {
    Customer,
    Operator,
    Automation,
}

impl MessageSender {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Customer => "customer",
            Self::Operator => "operator",
            Self::Automation => "automation",
        }
    }
}

impl fmt::Display for MessageSender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageSender {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "customer" => Ok(Self::Customer),
            "operator" => Ok(Self::Operator),
            "automation" => Ok(Self::Automation),
            _ => Err(format!("Unknown message sender: {s}")),
        }
    }
}

/// An append-only chat message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub sender: MessageSender,
    pub text: String,
    pub created_at: DateTime<Utc>,
}

impl Message {
    pub fn new(
        conversation_id: Uuid,
        sender: MessageSender,
        text: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            conversation_id,
            sender,
            text: text.into(),
            created_at: now,
        }
    }

    /// Truncated text for conversation listings.
    pub fn preview(&self) -> String {
        if self.text.chars().count() <= PREVIEW_CHARS {
            self.text.clone()
        } else {
            let mut s: String = self.text.chars().take(PREVIEW_CHARS).collect();
            s.push('…');
            s
        }
    }
}
