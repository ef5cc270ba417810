//! Telegram binding: a [`ChatSurface`] over the Bot API and the update dispatcher
//! feeding the [`Gateway`].
//!
//! Telegram does not report deletions to bots, so only new and edited messages
//! are wired.

use std::convert::Infallible;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use teloxide::prelude::*;
use teloxide::types::{FileId, MessageId, ReplyParameters};
use tracing::{error, info, warn};

use crate::attachments::{Attachment, AttachmentStore};
use crate::config::RelayConfig;
use crate::gateway::{Gateway, IncomingMessage};
use crate::relay::Relay;
use crate::surface::{ChatSurface, MessageRef};
use crate::worker::CommandLauncher;

#[derive(Clone)]
pub struct TelegramSurface {
    bot: Bot,
}

impl TelegramSurface {
    pub fn new(bot: Bot) -> Self {
        Self { bot }
    }
}

fn telegram_ids(message: &MessageRef) -> anyhow::Result<(ChatId, MessageId)> {
    let chat: i64 = message
        .channel_id
        .parse()
        .with_context(|| format!("`{}` is not a chat id", message.channel_id))?;
    let id: i32 = message
        .message_id
        .parse()
        .with_context(|| format!("`{}` is not a message id", message.message_id))?;
    Ok((ChatId(chat), MessageId(id)))
}

fn message_ref(msg: &Message) -> MessageRef {
    MessageRef::new(msg.chat.id.0.to_string(), msg.id.0.to_string())
}

#[async_trait]
impl ChatSurface for TelegramSurface {
    async fn reply(&self, to: &MessageRef, text: &str) -> anyhow::Result<MessageRef> {
        let (chat, parent) = telegram_ids(to)?;
        let sent = self
            .bot
            .send_message(chat, text)
            .reply_parameters(ReplyParameters::new(parent))
            .await?;
        Ok(message_ref(&sent))
    }

    async fn edit(&self, message: &MessageRef, text: &str) -> anyhow::Result<()> {
        let (chat, id) = telegram_ids(message)?;
        self.bot.edit_message_text(chat, id, text).await?;
        Ok(())
    }
}

/// Resolve the download URLs of a message's document and photo.
async fn attachments_of(bot: &Bot, msg: &Message) -> Vec<Attachment> {
    let mut files: Vec<(FileId, String)> = Vec::new();
    if let Some(document) = msg.document() {
        let name = document
            .file_name
            .clone()
            .unwrap_or_else(|| format!("document-{}", document.file.unique_id));
        files.push((document.file.id.clone(), name));
    }
    if let Some(photo) = msg.photo().and_then(|sizes| sizes.last()) {
        files.push((photo.file.id.clone(), format!("photo-{}.jpg", photo.file.unique_id)));
    }

    let mut attachments = Vec::with_capacity(files.len());
    for (file_id, file_name) in files {
        match bot.get_file(file_id).await {
            Ok(file) => attachments.push(Attachment {
                file_name,
                url: format!("https://api.telegram.org/file/bot{}/{}", bot.token(), file.path),
            }),
            Err(err) => warn!(file = %file_name, error = %err, "could not resolve attachment"),
        }
    }
    attachments
}

async fn incoming(bot: &Bot, msg: &Message, with_attachments: bool) -> Option<IncomingMessage> {
    let author = msg.from.as_ref()?;
    let text = msg.text().or_else(|| msg.caption()).unwrap_or_default().to_string();
    let attachments = if with_attachments {
        attachments_of(bot, msg).await
    } else {
        Vec::new()
    };
    Some(IncomingMessage {
        message: message_ref(msg),
        author_id: author.id.0.to_string(),
        author_is_bot: author.is_bot,
        text,
        attachments,
    })
}

/// Poll Telegram until Ctrl-C, then stop every worker.
pub async fn run(config: RelayConfig) -> anyhow::Result<()> {
    let bot = Bot::new(config.require_token()?);
    let surface: Arc<dyn ChatSurface> = Arc::new(TelegramSurface::new(bot.clone()));
    let relay = Arc::new(Relay::new(
        Arc::new(CommandLauncher),
        surface.clone(),
        config.relay_settings(),
    ));
    let gateway = Arc::new(Gateway::new(
        relay.clone(),
        surface,
        config.allowed_user_id.clone(),
        AttachmentStore::new(&config.upload_dir),
    ));

    let on_message = gateway.clone();
    let on_edit = gateway;
    let handler = dptree::entry()
        .branch(Update::filter_message().endpoint(move |bot: Bot, msg: Message| {
            let gateway = on_message.clone();
            async move {
                if let Some(incoming) = incoming(&bot, &msg, true).await {
                    gateway.on_message(incoming).await;
                }
                Ok::<(), Infallible>(())
            }
        }))
        .branch(Update::filter_edited_message().endpoint(move |bot: Bot, msg: Message| {
            let gateway = on_edit.clone();
            async move {
                if let Some(incoming) = incoming(&bot, &msg, false).await {
                    gateway.on_edit(incoming).await;
                }
                Ok::<(), Infallible>(())
            }
        }));

    info!(
        workspace = %config.workspace.display(),
        model = %config.default_model,
        restricted = config.allowed_user_id.is_some(),
        "relay ready"
    );
    let mut dispatcher = Dispatcher::builder(bot, handler).build();
    tokio::select! {
        _ = dispatcher.dispatch() => {
            error!("Telegram dispatcher exited");
        }
        signal = tokio::signal::ctrl_c() => {
            signal.context("listening for Ctrl-C")?;
            info!("shutting down");
        }
    }

    relay.shutdown().await;
    Ok(())
}
