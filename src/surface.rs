use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Address of one message on the messaging platform.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageRef {
    pub channel_id: String,
    pub message_id: String,
}

impl MessageRef {
    pub fn new(channel_id: impl Into<String>, message_id: impl Into<String>) -> Self {
        Self {
            channel_id: channel_id.into(),
            message_id: message_id.into(),
        }
    }
}

impl fmt::Display for MessageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.channel_id, self.message_id)
    }
}

/// The two operations the relay needs from a messaging platform.
///
/// Both are fallible and never retried; callers log failures and move on.
#[async_trait]
pub trait ChatSurface: Send + Sync + 'static {
    /// Post `text` as a reply to `to` and return the new message.
    async fn reply(&self, to: &MessageRef, text: &str) -> anyhow::Result<MessageRef>;

    /// Replace the text of an existing message.
    async fn edit(&self, message: &MessageRef, text: &str) -> anyhow::Result<()>;
}
