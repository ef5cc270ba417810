//! Records exchanged with a worker over its standard streams.
//!
//! Every record is a single JSON object on its own line. Output records are
//! tagged by `type` (and for some of them `subtype`); they are decoded into the
//! closed [`WorkerEvent`] enum so callers can match exhaustively instead of
//! poking at string tags.

use serde::{Deserialize, Serialize};

/// `session_id` sent with a user turn before the worker has announced its own.
pub const DEFAULT_SESSION_ID: &str = "default";

/// One content block inside an assistant record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        #[serde(default)]
        text: String,
    },
    ToolUse {
        #[serde(default)]
        name: String,
    },
    /// Thinking blocks, tool results and anything newer than this crate.
    #[serde(other)]
    Other,
}

/// A decoded output record.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(from = "RawRecord")]
pub enum WorkerEvent {
    /// `system/init`: the worker announces the token that resumes this conversation.
    Init {
        session_id: Option<String>,
        model: Option<String>,
    },
    /// `assistant`: the full current assistant turn, not a delta.
    Assistant { blocks: Vec<ContentBlock> },
    /// `result/success`
    Success { result: Option<String> },
    /// `result/error*`
    Error { error: Option<String> },
    /// Any record this relay has no use for.
    Ignored,
}

impl WorkerEvent {
    /// Parse one complete line.
    pub fn from_slice(line: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(line)
    }
}

#[derive(Debug, Default, Deserialize)]
struct AssistantMessage {
    #[serde(default)]
    content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum RawRecord {
    System {
        #[serde(default)]
        subtype: Option<String>,
        #[serde(default)]
        session_id: Option<String>,
        #[serde(default)]
        model: Option<String>,
    },
    Assistant {
        #[serde(default)]
        message: AssistantMessage,
    },
    Result {
        #[serde(default)]
        subtype: Option<String>,
        #[serde(default)]
        result: Option<String>,
        #[serde(default)]
        error: Option<String>,
    },
    #[serde(other)]
    Unknown,
}

impl From<RawRecord> for WorkerEvent {
    fn from(raw: RawRecord) -> Self {
        match raw {
            RawRecord::System {
                subtype,
                session_id,
                model,
            } => match subtype.as_deref() {
                Some("init") => WorkerEvent::Init { session_id, model },
                _ => WorkerEvent::Ignored,
            },
            RawRecord::Assistant { message } => WorkerEvent::Assistant {
                blocks: message.content,
            },
            RawRecord::Result {
                subtype,
                result,
                error,
            } => match subtype.as_deref() {
                Some("success") => WorkerEvent::Success { result },
                // error, error_max_turns, error_during_execution, ...
                Some(s) if s.starts_with("error") => WorkerEvent::Error { error },
                _ => WorkerEvent::Ignored,
            },
            RawRecord::Unknown => WorkerEvent::Ignored,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
struct UserMessage<'a> {
    role: &'static str,
    content: &'a str,
}

/// The single input record type: one user prompt.
#[derive(Debug, Clone, Serialize)]
pub struct UserTurn<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    message: UserMessage<'a>,
    session_id: &'a str,
    parent_tool_use_id: Option<&'a str>,
}

impl<'a> UserTurn<'a> {
    pub fn new(text: &'a str, resume_token: Option<&'a str>) -> Self {
        Self {
            kind: "user",
            message: UserMessage {
                role: "user",
                content: text,
            },
            session_id: resume_token.unwrap_or(DEFAULT_SESSION_ID),
            parent_tool_use_id: None,
        }
    }

    /// Serialised record including the terminating newline.
    pub fn to_line(&self) -> serde_json::Result<String> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }
}
