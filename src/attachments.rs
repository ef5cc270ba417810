//! Attachments are copied into a per-channel upload directory so the worker can
//! read them from its workspace.

use std::path::{Path, PathBuf};

use anyhow::Context;
use reqwest::Client;
use tracing::{debug, warn};

/// A file attached to an incoming message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub file_name: String,
    pub url: String,
}

#[derive(Debug, Clone)]
pub struct AttachmentStore {
    root: PathBuf,
    client: Client,
}

impl AttachmentStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            client: Client::new(),
        }
    }

    /// `<root>/<channel>/<message>-<file name>`, with path separators stripped.
    pub fn target_path(&self, channel_id: &str, message_id: &str, file_name: &str) -> PathBuf {
        let file_name = Path::new(file_name)
            .file_name()
            .and_then(|n| n.to_str())
            .filter(|n| !n.is_empty())
            .unwrap_or("attachment");
        self.root
            .join(sanitize(channel_id))
            .join(format!("{}-{}", sanitize(message_id), file_name))
    }

    /// Download every attachment; the ones that fail are logged and skipped.
    pub async fn save_all(
        &self,
        channel_id: &str,
        message_id: &str,
        attachments: &[Attachment],
    ) -> Vec<PathBuf> {
        let mut saved = Vec::with_capacity(attachments.len());
        for attachment in attachments {
            let target = self.target_path(channel_id, message_id, &attachment.file_name);
            match self.download(&attachment.url, &target).await {
                Ok(()) => {
                    debug!(path = %target.display(), "attachment saved");
                    saved.push(target);
                }
                Err(err) => warn!(
                    file = %attachment.file_name,
                    error = %format!("{err:#}"),
                    "attachment download failed"
                ),
            }
        }
        saved
    }

    async fn download(&self, url: &str, target: &Path) -> anyhow::Result<()> {
        let bytes = self
            .client
            .get(url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            // file URLs may embed credentials
            .map_err(reqwest::Error::without_url)
            .context("request failed")?
            .bytes()
            .await
            .map_err(reqwest::Error::without_url)
            .context("reading body failed")?;
        if let Some(dir) = target.parent() {
            tokio::fs::create_dir_all(dir)
                .await
                .with_context(|| format!("creating {}", dir.display()))?;
        }
        tokio::fs::write(target, &bytes)
            .await
            .with_context(|| format!("writing {}", target.display()))?;
        Ok(())
    }
}

fn sanitize(component: &str) -> String {
    if component.chars().all(|c| c == '.') {
        return "_".repeat(component.len().max(1));
    }
    component.replace(['/', '\\'], "_")
}

/// Append the listing of saved files to a prompt.
pub fn annotate_prompt(prompt: &str, paths: &[PathBuf]) -> String {
    if paths.is_empty() {
        return prompt.to_string();
    }
    let mut text = if prompt.is_empty() {
        "Attached files:".to_string()
    } else {
        format!("{prompt}\n\nAttached files:")
    };
    for path in paths {
        text.push_str(&format!("\n- {}", path.display()));
    }
    text
}
