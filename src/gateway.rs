//! Platform-neutral front end.
//!
//! A messaging binding turns its native updates into [`IncomingMessage`]s and
//! calls into the [`Gateway`], which applies the allow-list, routes `!`
//! commands, saves attachments and submits prompts to the [`Relay`].

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::attachments::{Attachment, AttachmentStore, annotate_prompt};
use crate::command::{Command, HELP_TEXT, Input, MODEL_USAGE};
use crate::error::RelayError;
use crate::relay::{Relay, Submission};
use crate::surface::{ChatSurface, MessageRef};

pub const NO_SESSION: &str = "No active session. Send a message first.";
pub const NEW_SESSION: &str = "🔄 New session started.";
pub const ABORTED: &str = "🛑 Aborted.";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingMessage {
    pub message: MessageRef,
    pub author_id: String,
    pub author_is_bot: bool,
    pub text: String,
    pub attachments: Vec<Attachment>,
}

impl IncomingMessage {
    pub fn channel_id(&self) -> &str {
        &self.message.channel_id
    }
}

pub fn queued_reply(position: usize) -> String {
    format!("⏳ Queued (position {position}). `!abort` cancels the current task.")
}

pub fn unknown_command_reply(name: &str) -> String {
    format!("Unknown command: `!{name}`. Try `!help`.")
}

pub struct Gateway {
    relay: Arc<Relay>,
    surface: Arc<dyn ChatSurface>,
    allowed_user: Option<String>,
    attachments: AttachmentStore,
}

impl Gateway {
    pub fn new(
        relay: Arc<Relay>,
        surface: Arc<dyn ChatSurface>,
        allowed_user: Option<String>,
        attachments: AttachmentStore,
    ) -> Self {
        Self {
            relay,
            surface,
            allowed_user,
            attachments,
        }
    }

    pub fn relay(&self) -> &Arc<Relay> {
        &self.relay
    }

    fn accepts(&self, incoming: &IncomingMessage) -> bool {
        if incoming.author_is_bot {
            return false;
        }
        match &self.allowed_user {
            Some(allowed) => *allowed == incoming.author_id,
            None => true,
        }
    }

    pub async fn on_message(&self, incoming: IncomingMessage) {
        if !self.accepts(&incoming) {
            debug!(author = %incoming.author_id, "ignoring message");
            return;
        }

        match Input::parse(&incoming.text) {
            Input::Empty if incoming.attachments.is_empty() => {}
            Input::Empty => self.on_prompt(&incoming, "").await,
            Input::Prompt(prompt) => self.on_prompt(&incoming, &prompt).await,
            Input::Command(command) => self.on_command(&incoming, command).await,
        }
    }

    /// An edited message replaces the prompt it queued, if it is still queued.
    pub async fn on_edit(&self, incoming: IncomingMessage) -> bool {
        if !self.accepts(&incoming) {
            return false;
        }
        let Input::Prompt(prompt) = Input::parse(&incoming.text) else {
            return false;
        };
        let updated = self.relay.update_queued(&incoming.message, prompt);
        if updated {
            info!(message = %incoming.message, "queued prompt edited");
        }
        updated
    }

    /// A deleted message withdraws the prompt it queued, if it is still queued.
    pub async fn on_delete(&self, message: &MessageRef) -> bool {
        let removed = self.relay.remove_queued(message);
        if removed {
            info!(message = %message, "queued prompt withdrawn");
        }
        removed
    }

    async fn on_prompt(&self, incoming: &IncomingMessage, prompt: &str) {
        let channel = incoming.channel_id();
        let prompt = if incoming.attachments.is_empty() {
            prompt.to_string()
        } else {
            let saved = self
                .attachments
                .save_all(channel, &incoming.message.message_id, &incoming.attachments)
                .await;
            annotate_prompt(prompt, &saved)
        };
        if prompt.is_empty() {
            return;
        }

        match self.relay.submit(channel, prompt, incoming.message.clone()).await {
            Submission::Queued { position } => {
                self.say(&incoming.message, &queued_reply(position)).await;
            }
            Submission::Dispatched | Submission::Failed(_) => {}
        }
    }

    async fn on_command(&self, incoming: &IncomingMessage, command: Command) {
        let channel = incoming.channel_id();
        info!(channel, ?command, "command");

        let reply = match command {
            Command::Help => HELP_TEXT.to_string(),
            Command::Unknown(name) => unknown_command_reply(&name),
            Command::New => {
                self.lifecycle_reply(self.relay.reset(channel).await, NEW_SESSION.to_string())
            }
            Command::Abort => {
                self.lifecycle_reply(self.relay.abort(channel).await, ABORTED.to_string())
            }
            Command::Model(None) => match self.relay.session(channel) {
                Some(_) => MODEL_USAGE.to_string(),
                None => NO_SESSION.to_string(),
            },
            Command::Model(Some(model)) => {
                let done = format!("🔄 Restarted with model: {model}");
                self.lifecycle_reply(self.relay.switch_model(channel, &model).await, done)
            }
        };
        self.say(&incoming.message, &reply).await;
    }

    fn lifecycle_reply<T>(&self, result: Result<T, RelayError>, done: String) -> String {
        match result {
            Ok(_) => done,
            Err(RelayError::NoSession(_)) => NO_SESSION.to_string(),
            Err(RelayError::Spawn(reason)) => format!("❌ Failed to start worker: {reason:#}"),
            Err(err) => format!("❌ {err}"),
        }
    }

    async fn say(&self, to: &MessageRef, text: &str) {
        if let Err(err) = self.surface.reply(to, text).await {
            warn!(to = %to, error = %err, "reply failed");
        }
    }
}
