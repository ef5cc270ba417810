//! Per-channel session state.
//!
//! A [`Session`] ties a channel to one worker process. All mutable state sits
//! behind a single lock so admission, draining and queue edits are atomic with
//! respect to each other; nothing awaits while holding it.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

use strum_macros::AsRefStr;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{Mutex as AsyncMutex, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use worker_protocol::{OutputAccumulator, Outcome, Step, UserTurn, WorkerEvent};

use crate::error::RelayError;
use crate::surface::MessageRef;

/// A prompt waiting for (or holding) the dispatch slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingRequest {
    pub prompt: String,
    pub reply_target: MessageRef,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum CompletionStatus {
    Success,
    WorkerError,
    Exited,
    SpawnFailed,
}

/// Final text of a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub text: String,
    pub status: CompletionStatus,
}

impl From<Outcome> for Completion {
    fn from(outcome: Outcome) -> Self {
        match outcome {
            Outcome::Success(text) => Completion {
                text,
                status: CompletionStatus::Success,
            },
            Outcome::Error(text) => Completion {
                text,
                status: CompletionStatus::WorkerError,
            },
        }
    }
}

/// The subscription of the in-flight request. Replaced wholesale on dispatch.
struct ActiveRequest {
    increments: watch::Sender<String>,
    completion: oneshot::Sender<Completion>,
    render_cancel: CancellationToken,
}

impl ActiveRequest {
    fn bind(request: PendingRequest) -> (Self, Dispatch) {
        let (increments, increments_rx) = watch::channel(String::new());
        let (completion, completion_rx) = oneshot::channel();
        let render_cancel = CancellationToken::new();
        let active = ActiveRequest {
            increments,
            completion,
            render_cancel: render_cancel.clone(),
        };
        let dispatch = Dispatch {
            request,
            increments: increments_rx,
            completion: completion_rx,
            cancel: render_cancel,
        };
        (active, dispatch)
    }

    fn complete(self, completion: Completion) {
        // the renderer may already be gone; nothing left to tell then
        let _ = self.completion.send(completion);
    }
}

/// Receiving ends handed to whoever renders a freshly dispatched request.
#[derive(Debug)]
pub struct Dispatch {
    pub request: PendingRequest,
    pub increments: watch::Receiver<String>,
    pub completion: oneshot::Receiver<Completion>,
    pub cancel: CancellationToken,
}

/// Result of offering a prompt to a session.
#[derive(Debug)]
pub enum Admission {
    /// The session was idle; the caller now holds the dispatch slot.
    Dispatch(Dispatch),
    /// The session is busy; 1-based queue position.
    Queued(usize),
}

#[derive(Default)]
struct SessionState {
    resume_token: Option<String>,
    output: OutputAccumulator,
    queue: VecDeque<PendingRequest>,
    active: Option<ActiveRequest>,
}

impl SessionState {
    /// Move the head of the queue into the dispatch slot if the slot is free.
    fn drain_next(&mut self) -> Option<Dispatch> {
        if self.active.is_some() {
            return None;
        }
        let next = self.queue.pop_front()?;
        let (active, dispatch) = ActiveRequest::bind(next);
        self.output.reset();
        self.active = Some(active);
        Some(dispatch)
    }
}

pub struct Session {
    id: u64,
    channel_id: String,
    model: String,
    state: Mutex<SessionState>,
    input: AsyncMutex<Box<dyn AsyncWrite + Send + Unpin>>,
    kill: CancellationToken,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("channel_id", &self.channel_id)
            .field("model", &self.model)
            .finish_non_exhaustive()
    }
}

impl Session {
    pub fn new(
        id: u64,
        channel_id: impl Into<String>,
        model: impl Into<String>,
        resume_token: Option<String>,
        input: Box<dyn AsyncWrite + Send + Unpin>,
    ) -> Self {
        Self {
            id,
            channel_id: channel_id.into(),
            model: model.into(),
            state: Mutex::new(SessionState {
                resume_token,
                ..SessionState::default()
            }),
            input: AsyncMutex::new(input),
            kill: CancellationToken::new(),
        }
    }

    fn state(&self) -> MutexGuard<'_, SessionState> {
        // a panic while holding the lock leaves plain data behind; keep going
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn channel_id(&self) -> &str {
        &self.channel_id
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn resume_token(&self) -> Option<String> {
        self.state().resume_token.clone()
    }

    pub fn is_busy(&self) -> bool {
        self.state().active.is_some()
    }

    pub fn queue_len(&self) -> usize {
        self.state().queue.len()
    }

    pub fn queued_prompts(&self) -> Vec<String> {
        self.state().queue.iter().map(|r| r.prompt.clone()).collect()
    }

    /// Take the dispatch slot if it is free, otherwise queue the request.
    pub fn admit(&self, request: PendingRequest) -> Admission {
        let mut state = self.state();
        if state.active.is_some() {
            state.queue.push_back(request);
            return Admission::Queued(state.queue.len());
        }
        let (active, dispatch) = ActiveRequest::bind(request);
        state.output.reset();
        state.active = Some(active);
        Admission::Dispatch(dispatch)
    }

    /// Write one user turn to the worker. Caller must hold the dispatch slot.
    pub async fn send(&self, text: &str) -> Result<(), RelayError> {
        let token = self.resume_token();
        let line = UserTurn::new(text, token.as_deref()).to_line()?;
        let mut input = self.input.lock().await;
        input.write_all(line.as_bytes()).await?;
        input.flush().await?;
        Ok(())
    }

    /// Fold one worker event into the session.
    ///
    /// When the event completes the in-flight request and another prompt is
    /// queued, that prompt is moved into the slot and returned for dispatch.
    pub fn apply(&self, event: WorkerEvent) -> Option<Dispatch> {
        let mut state = self.state();
        match state.output.apply(event) {
            Step::Nothing => None,
            Step::SessionStarted { session_id, model } => {
                info!(
                    channel = %self.channel_id,
                    session_id = session_id.as_deref().unwrap_or("-"),
                    model = model.as_deref().unwrap_or("-"),
                    "worker session started"
                );
                if session_id.is_some() {
                    state.resume_token = session_id;
                }
                None
            }
            Step::Progress(text) => {
                if let Some(active) = &state.active {
                    active.increments.send_replace(text);
                }
                None
            }
            Step::Finished(outcome) => {
                if let Some(active) = state.active.take() {
                    active.complete(outcome.into());
                } else {
                    debug!(channel = %self.channel_id, "result without a subscriber");
                }
                state.drain_next()
            }
        }
    }

    /// The worker is gone. Drops the queue and completes the in-flight request.
    pub fn on_exit(&self, code: Option<i32>) {
        let mut state = self.state();
        let dropped = state.queue.len();
        state.queue.clear();
        let output = std::mem::take(&mut state.output);

        let Some(active) = state.active.take() else {
            return;
        };
        let mut text = if output.buffer().is_empty() {
            let code = code.map_or_else(|| "unknown".to_string(), |c| c.to_string());
            format!("❌ worker exited (code {code})")
        } else {
            output.buffer().to_string()
        };
        if dropped > 0 {
            text.push_str(&format!("\n\n⚠️ {dropped} queued prompt(s) dropped"));
        }
        active.complete(Completion {
            text,
            status: CompletionStatus::Exited,
        });
    }

    /// Drop the in-flight subscription without completing it and cancel its render.
    pub fn detach(&self) {
        if let Some(active) = self.state().active.take() {
            active.render_cancel.cancel();
        }
    }

    /// Discard the queue, then the in-flight subscription, so a late result
    /// has nothing left to drain. Returns how many prompts were discarded.
    pub fn retire(&self) -> usize {
        let dropped = self.clear_queue();
        self.detach();
        dropped
    }

    /// Empty the queue, returning how many prompts were discarded.
    pub fn clear_queue(&self) -> usize {
        let mut state = self.state();
        let dropped = state.queue.len();
        state.queue.clear();
        dropped
    }

    /// Remove the queued prompt anchored at `target`.
    pub fn remove_queued(&self, target: &MessageRef) -> bool {
        let mut state = self.state();
        match state.queue.iter().position(|r| &r.reply_target == target) {
            Some(index) => {
                state.queue.remove(index);
                true
            }
            None => false,
        }
    }

    /// Replace the text of the queued prompt anchored at `target`.
    pub fn update_queued(&self, target: &MessageRef, prompt: String) -> bool {
        let mut state = self.state();
        match state.queue.iter_mut().find(|r| &r.reply_target == target) {
            Some(request) => {
                request.prompt = prompt;
                true
            }
            None => false,
        }
    }

    /// Ask the supervisor to kill the worker.
    pub fn kill(&self) {
        self.kill.cancel();
    }

    pub fn kill_token(&self) -> CancellationToken {
        self.kill.clone()
    }
}
