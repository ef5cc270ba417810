//! Mirrors an evolving response onto a chain of chat messages.
//!
//! A response is split into chunks of at most `max_len` characters; chunk `i`
//! lives in message `i` of the chain. Existing messages are edited, missing
//! ones are posted as replies to the previous message. Progress renders are
//! throttled to one per `edit_interval` and always run in order.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{oneshot, watch};
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::session::Completion;
use crate::surface::{ChatSurface, MessageRef};

pub const EDIT_INTERVAL: Duration = Duration::from_millis(1500);
pub const MAX_MESSAGE_LEN: usize = 1900;

pub const THINKING: &str = "⏳ Thinking...";
pub const IN_PROGRESS_MARKER: &str = "\n\n⏳";
pub const DONE_MARKER: &str = "\n\n✅";
pub const EMPTY_RESPONSE: &str = "*(empty response)*";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenderSettings {
    pub max_len: usize,
    pub edit_interval: Duration,
}

impl Default for RenderSettings {
    fn default() -> Self {
        Self {
            max_len: MAX_MESSAGE_LEN,
            edit_interval: EDIT_INTERVAL,
        }
    }
}

/// Split `text` into chunks of at most `max_len` characters.
///
/// A chunk ends at the last newline within reach, or exactly at `max_len`
/// when there is none. The newline itself starts the next chunk. Always
/// returns at least one chunk.
pub fn split_into_chunks(text: &str, max_len: usize) -> Vec<&str> {
    let max_len = max_len.max(1);
    let mut chunks = Vec::new();
    let mut rest = text;

    // `nth(max_len)` exists only while more than `max_len` chars remain
    while let Some((limit, ch)) = rest.char_indices().nth(max_len) {
        let cut = if ch == '\n' {
            limit
        } else {
            match rest[..limit].rfind('\n') {
                Some(pos) if pos > 0 => pos,
                _ => limit,
            }
        };
        chunks.push(&rest[..cut]);
        rest = &rest[cut..];
    }

    if !rest.is_empty() || chunks.is_empty() {
        chunks.push(rest);
    }
    chunks
}

/// Messages making up one response, in display order.
#[derive(Debug, Clone)]
pub struct MessageChain {
    anchor: MessageRef,
    messages: Vec<MessageRef>,
}

impl MessageChain {
    pub fn new(anchor: MessageRef) -> Self {
        Self {
            anchor,
            messages: Vec::new(),
        }
    }

    pub fn messages(&self) -> &[MessageRef] {
        &self.messages
    }

    fn tail(&self) -> &MessageRef {
        self.messages.last().unwrap_or(&self.anchor)
    }
}

/// Render state for exactly one request.
pub struct Renderer {
    surface: Arc<dyn ChatSurface>,
    chain: MessageChain,
    settings: RenderSettings,
    last_rendered: String,
}

impl Renderer {
    pub fn new(
        surface: Arc<dyn ChatSurface>,
        reply_target: MessageRef,
        settings: RenderSettings,
    ) -> Self {
        Self {
            surface,
            chain: MessageChain::new(reply_target),
            settings,
            last_rendered: String::new(),
        }
    }

    pub fn messages(&self) -> &[MessageRef] {
        self.chain.messages()
    }

    /// Post the visible placeholder that later renders edit in place.
    pub async fn post_placeholder(&mut self) {
        match self.surface.reply(&self.chain.anchor, THINKING).await {
            Ok(message) => self.chain.messages.push(message),
            Err(err) => warn!(
                anchor = %self.chain.anchor,
                error = %err,
                "could not post placeholder"
            ),
        }
    }

    /// One render pass. Failures are logged per message and never abort the pass.
    pub async fn render(&mut self, content: &str, done: bool) {
        let chunks = split_into_chunks(content, self.settings.max_len);
        let last = chunks.len() - 1;

        for (i, chunk) in chunks.iter().enumerate() {
            let suffix = match (done, i == last) {
                (true, true) => DONE_MARKER,
                (true, false) => "",
                (false, _) => IN_PROGRESS_MARKER,
            };
            let body = format!("{chunk}{suffix}");

            if let Some(existing) = self.chain.messages.get(i) {
                if let Err(err) = self.surface.edit(existing, &body).await {
                    warn!(message = %existing, error = %err, "edit failed");
                }
            } else {
                let parent = self.chain.tail().clone();
                match self.surface.reply(&parent, &body).await {
                    Ok(message) => self.chain.messages.push(message),
                    Err(err) => warn!(
                        parent = %parent,
                        error = %err,
                        "posting continuation failed"
                    ),
                }
            }
        }
    }

    /// Render the final text of a request.
    pub async fn finish(&mut self, text: &str) {
        let content = if text.is_empty() { EMPTY_RESPONSE } else { text };
        self.render(content, true).await;
    }

    /// Drive renders for one request until it completes or is cancelled.
    ///
    /// Returns the completion if the request ran to the end. A dropped
    /// completion sender means the request was torn down without a result.
    pub async fn run(
        mut self,
        mut increments: watch::Receiver<String>,
        mut completion: oneshot::Receiver<Completion>,
        cancel: CancellationToken,
    ) -> Option<Completion> {
        let mut deadline: Option<Instant> = None;
        let mut increments_open = true;

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    debug!(anchor = %self.chain.anchor, "render cancelled");
                    return None;
                }

                done = &mut completion => {
                    let Ok(done) = done else {
                        debug!(anchor = %self.chain.anchor, "request dropped before completion");
                        return None;
                    };
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return None,
                        _ = self.finish(&done.text) => {}
                    }
                    return Some(done);
                }

                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    deadline = None;
                    let latest = increments.borrow_and_update().clone();
                    if latest == self.last_rendered {
                        continue;
                    }
                    self.last_rendered = latest.clone();
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return None,
                        _ = self.render(&latest, false) => {}
                    }
                }

                changed = increments.changed(), if increments_open => {
                    match changed {
                        Ok(()) if deadline.is_none() => {
                            deadline = Some(Instant::now() + self.settings.edit_interval);
                        }
                        Ok(()) => {}
                        Err(_) => increments_open = false,
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{Completion, CompletionStatus};
    use crate::test_support::RecordingSurface;

    fn anchor() -> MessageRef {
        MessageRef::new("c1", "user-1")
    }

    fn settings(max_len: usize, interval_ms: u64) -> RenderSettings {
        RenderSettings {
            max_len,
            edit_interval: Duration::from_millis(interval_ms),
        }
    }

    #[test]
    fn short_text_is_one_chunk() {
        assert_eq!(split_into_chunks("hello", 10), vec!["hello"]);
    }

    #[test]
    fn empty_text_is_one_empty_chunk() {
        assert_eq!(split_into_chunks("", 10), vec![""]);
    }

    #[test]
    fn cuts_at_last_newline_in_range() {
        let text = "aaaa\nbbbb\ncccc";
        assert_eq!(split_into_chunks(text, 10), vec!["aaaa\nbbbb", "\ncccc"]);
    }

    #[test]
    fn newline_exactly_at_limit_is_a_boundary() {
        assert_eq!(split_into_chunks("abcd\nef", 4), vec!["abcd", "\nef"]);
    }

    #[test]
    fn hard_cut_without_newline() {
        assert_eq!(split_into_chunks("abcdefghij", 4), vec!["abcd", "efgh", "ij"]);
    }

    #[test]
    fn leading_newline_is_not_a_boundary() {
        assert_eq!(split_into_chunks("\nabcdef", 3), vec!["\nab", "cde", "f"]);
    }

    #[test]
    fn chunks_respect_the_limit_and_never_split_chars() {
        let text = "héllo wörld ✨ ".repeat(40) + "\n" + &"ü".repeat(55);
        for max in [1, 7, 13, 50, 64] {
            let chunks = split_into_chunks(&text, max);
            assert!(chunks.iter().all(|c| c.chars().count() <= max), "max {max}");
            assert!(!chunks.last().unwrap().is_empty());
            assert_eq!(chunks.concat(), text);
        }
    }

    #[tokio::test]
    async fn render_edits_existing_and_chains_new_messages() {
        let surface = RecordingSurface::new();
        let mut renderer = Renderer::new(surface.clone(), anchor(), settings(5, 10));
        renderer.post_placeholder().await;
        let first = renderer.messages()[0].clone();
        assert_eq!(surface.text_of(&first).as_deref(), Some(THINKING));

        renderer.render("abcdefghij", false).await;
        let messages = renderer.messages().to_vec();
        assert_eq!(messages.len(), 2);
        assert_eq!(surface.text_of(&messages[0]).unwrap(), "abcde\n\n⏳");
        assert_eq!(surface.text_of(&messages[1]).unwrap(), "fghij\n\n⏳");
        assert_eq!(surface.parent_of(&messages[1]), Some(messages[0].clone()));

        renderer.finish("abcdefghijk").await;
        let messages = renderer.messages().to_vec();
        assert_eq!(messages.len(), 3);
        assert_eq!(surface.text_of(&messages[0]).unwrap(), "abcde");
        assert_eq!(surface.text_of(&messages[1]).unwrap(), "fghij");
        assert_eq!(surface.text_of(&messages[2]).unwrap(), "k\n\n✅");
    }

    #[tokio::test]
    async fn failed_edit_does_not_stop_the_pass() {
        let surface = RecordingSurface::new();
        let mut renderer = Renderer::new(surface.clone(), anchor(), settings(3, 10));
        renderer.post_placeholder().await;
        surface.fail_edits(true);
        renderer.finish("abcdef").await;
        let messages = renderer.messages().to_vec();
        assert_eq!(messages.len(), 2);
        assert_eq!(surface.text_of(&messages[0]).unwrap(), THINKING);
        assert_eq!(surface.text_of(&messages[1]).unwrap(), "def\n\n✅");
    }

    #[tokio::test]
    async fn lost_placeholder_is_replaced_by_the_first_render() {
        let surface = RecordingSurface::new();
        let mut renderer = Renderer::new(surface.clone(), anchor(), settings(3, 10));
        surface.fail_replies(true);
        renderer.post_placeholder().await;
        assert!(renderer.messages().is_empty());

        surface.fail_replies(false);
        renderer.finish("abcdef").await;
        let messages = renderer.messages().to_vec();
        assert_eq!(messages.len(), 2);
        assert_eq!(surface.text_of(&messages[0]).unwrap(), "abc");
        assert_eq!(surface.parent_of(&messages[0]), Some(anchor()));
        assert_eq!(surface.text_of(&messages[1]).unwrap(), "def\n\n✅");
        assert_eq!(surface.parent_of(&messages[1]), Some(messages[0].clone()));
    }

    #[tokio::test]
    async fn failed_continuation_does_not_stop_the_pass() {
        let surface = RecordingSurface::new();
        let mut renderer = Renderer::new(surface.clone(), anchor(), settings(3, 10));
        renderer.post_placeholder().await;
        let placeholder = renderer.messages()[0].clone();

        surface.refuse_next_reply();
        renderer.render("abcdefghi", false).await;
        let messages = renderer.messages().to_vec();
        assert_eq!(messages.len(), 2);
        assert_eq!(surface.text_of(&placeholder).unwrap(), "abc\n\n⏳");
        assert_eq!(surface.text_of(&messages[1]).unwrap(), "ghi\n\n⏳");
        assert_eq!(surface.parent_of(&messages[1]), Some(placeholder.clone()));

        renderer.finish("abcdefghi").await;
        assert_eq!(surface.edit_count(), 3);
        assert_eq!(surface.text_of(&placeholder).unwrap(), "abc");
        assert_eq!(surface.text_of(&messages[1]).unwrap(), "def");
        let last = renderer.messages()[2].clone();
        assert_eq!(surface.text_of(&last).unwrap(), "ghi\n\n✅");
        assert_eq!(surface.parent_of(&last), Some(messages[1].clone()));
    }

    #[tokio::test]
    async fn empty_completion_gets_a_visible_body() {
        let surface = RecordingSurface::new();
        let mut renderer = Renderer::new(surface.clone(), anchor(), RenderSettings::default());
        renderer.finish("").await;
        let message = renderer.messages()[0].clone();
        assert_eq!(surface.text_of(&message).unwrap(), "*(empty response)*\n\n✅");
        assert_eq!(surface.parent_of(&message), Some(anchor()));
    }

    #[tokio::test(start_paused = true)]
    async fn increments_are_coalesced_into_one_render_per_interval() {
        let surface = RecordingSurface::new();
        let mut renderer = Renderer::new(surface.clone(), anchor(), settings(100, 1500));
        renderer.post_placeholder().await;
        let placeholder = renderer.messages()[0].clone();

        let (inc_tx, inc_rx) = watch::channel(String::new());
        let (done_tx, done_rx) = oneshot::channel();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(renderer.run(inc_rx, done_rx, cancel.clone()));

        inc_tx.send_replace("a".into());
        tokio::time::sleep(Duration::from_millis(100)).await;
        inc_tx.send_replace("ab".into());
        tokio::time::sleep(Duration::from_millis(100)).await;
        inc_tx.send_replace("abc".into());
        assert_eq!(surface.edit_count(), 0);

        tokio::time::sleep(Duration::from_millis(1400)).await;
        assert_eq!(surface.edit_count(), 1);
        assert_eq!(surface.text_of(&placeholder).unwrap(), "abc\n\n⏳");

        done_tx
            .send(Completion {
                text: "abc!".into(),
                status: CompletionStatus::Success,
            })
            .unwrap();
        let done = task.await.unwrap().expect("completed");
        assert_eq!(done.text, "abc!");
        assert_eq!(surface.edit_count(), 2);
        assert_eq!(surface.text_of(&placeholder).unwrap(), "abc!\n\n✅");
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_discards_pending_render() {
        let surface = RecordingSurface::new();
        let mut renderer = Renderer::new(surface.clone(), anchor(), RenderSettings::default());
        renderer.post_placeholder().await;

        let (inc_tx, inc_rx) = watch::channel(String::new());
        let (_done_tx, done_rx) = oneshot::channel();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(renderer.run(inc_rx, done_rx, cancel.clone()));

        inc_tx.send_replace("partial".into());
        tokio::time::sleep(Duration::from_millis(10)).await;
        cancel.cancel();
        assert!(task.await.unwrap().is_none());
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(surface.edit_count(), 0);
    }

    #[tokio::test]
    async fn dropped_completion_ends_the_render_silently() {
        let surface = RecordingSurface::new();
        let renderer = Renderer::new(surface.clone(), anchor(), RenderSettings::default());
        let (_inc_tx, inc_rx) = watch::channel(String::new());
        let (done_tx, done_rx) = oneshot::channel::<Completion>();
        drop(done_tx);
        assert!(renderer.run(inc_rx, done_rx, CancellationToken::new()).await.is_none());
        assert_eq!(surface.edit_count(), 0);
    }
}
