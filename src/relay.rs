//! The session registry and everything that starts, feeds and tears down workers.
//!
//! Lifecycle operations (`spawn`, `reset`, `switch_model`, `abort`) and prompt
//! admission are serialized per relay so a channel never ends up with two live
//! workers. Each worker gets a supervisor task that decodes its output, feeds the
//! owning [`Session`] and dispatches queued prompts as the slot frees up.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use worker_protocol::LineDecoder;

use crate::error::RelayError;
use crate::render::{RenderSettings, Renderer};
use crate::session::{Admission, CompletionStatus, Dispatch, PendingRequest, Session};
use crate::surface::{ChatSurface, MessageRef};
use crate::worker::{LaunchSpec, WorkerControl, WorkerLauncher};

pub const DEFAULT_MODEL: &str = "sonnet";

const READ_BUFFER: usize = 8 * 1024;

#[derive(Debug, Clone)]
pub struct RelaySettings {
    pub program: String,
    pub workdir: PathBuf,
    pub default_model: String,
    pub render: RenderSettings,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            program: "claude".to_string(),
            workdir: PathBuf::from("."),
            default_model: DEFAULT_MODEL.to_string(),
            render: RenderSettings::default(),
        }
    }
}

/// What happened to a submitted prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Submission {
    /// Sent to the worker; its response is being rendered.
    Dispatched,
    /// Waiting behind the in-flight request, 1-based.
    Queued { position: usize },
    /// No worker could be started; the failure has been rendered.
    Failed(String),
}

type Sessions = Arc<DashMap<String, Arc<Session>>>;

/// Starts the renderer and writes the prompt for a freshly dispatched request.
#[derive(Clone)]
struct RequestRunner {
    surface: Arc<dyn ChatSurface>,
    render: RenderSettings,
}

impl RequestRunner {
    fn start(&self, session: &Arc<Session>, dispatch: Dispatch) {
        let Dispatch {
            request,
            increments,
            completion,
            cancel,
        } = dispatch;

        let mut renderer = Renderer::new(
            self.surface.clone(),
            request.reply_target.clone(),
            self.render,
        );
        let channel = session.channel_id().to_string();
        let model = session.model().to_string();
        let anchor = request.reply_target.clone();
        let started = Instant::now();
        tokio::spawn(async move {
            renderer.post_placeholder().await;
            if let Some(done) = renderer.run(increments, completion, cancel).await {
                info!(
                    target: "request",
                    channel = %channel,
                    anchor = %anchor,
                    model = %model,
                    status = done.status.as_ref(),
                    latency_ms = started.elapsed().as_millis() as u64,
                    chars = done.text.chars().count(),
                    "request completed"
                );
            }
        });

        let session = session.clone();
        tokio::spawn(async move {
            if let Err(err) = session.send(&request.prompt).await {
                warn!(
                    channel = %session.channel_id(),
                    error = %err,
                    "could not hand prompt to worker"
                );
            }
        });
    }
}

pub struct Relay {
    sessions: Sessions,
    launcher: Arc<dyn WorkerLauncher>,
    runner: RequestRunner,
    settings: RelaySettings,
    lifecycle: Mutex<()>,
    next_session: AtomicU64,
}

impl Relay {
    pub fn new(
        launcher: Arc<dyn WorkerLauncher>,
        surface: Arc<dyn ChatSurface>,
        settings: RelaySettings,
    ) -> Self {
        Self {
            sessions: Arc::new(DashMap::new()),
            launcher,
            runner: RequestRunner {
                surface,
                render: settings.render,
            },
            settings,
            lifecycle: Mutex::new(()),
            next_session: AtomicU64::new(1),
        }
    }

    pub fn session(&self, channel_id: &str) -> Option<Arc<Session>> {
        self.sessions.get(channel_id).map(|entry| entry.value().clone())
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Replace any worker of `channel_id` with a fresh one.
    pub async fn spawn(
        &self,
        channel_id: &str,
        model: Option<String>,
        resume_token: Option<String>,
    ) -> Result<Arc<Session>, RelayError> {
        let _lifecycle = self.lifecycle.lock().await;
        self.spawn_locked(channel_id, model, resume_token)
    }

    /// Hand a prompt to the channel's session, starting a worker if needed.
    pub async fn submit(
        &self,
        channel_id: &str,
        prompt: String,
        reply_target: MessageRef,
    ) -> Submission {
        let request = PendingRequest {
            prompt,
            reply_target: reply_target.clone(),
        };

        let admitted = {
            let _lifecycle = self.lifecycle.lock().await;
            self.get_or_spawn_locked(channel_id)
                .map(|session| {
                    let admission = session.admit(request);
                    (session, admission)
                })
        };

        match admitted {
            Ok((session, Admission::Dispatch(dispatch))) => {
                self.runner.start(&session, dispatch);
                Submission::Dispatched
            }
            Ok((_, Admission::Queued(position))) => {
                debug!(channel = channel_id, position, "prompt queued");
                Submission::Queued { position }
            }
            Err(err) => {
                let text = match &err {
                    RelayError::Spawn(reason) => format!("❌ Failed to start worker: {reason:#}"),
                    other => format!("❌ {other}"),
                };
                warn!(channel = channel_id, error = %err, "prompt not dispatched");
                let mut renderer = Renderer::new(
                    self.runner.surface.clone(),
                    reply_target.clone(),
                    self.runner.render,
                );
                renderer.finish(&text).await;
                info!(
                    target: "request",
                    channel = channel_id,
                    anchor = %reply_target,
                    status = CompletionStatus::SpawnFailed.as_ref(),
                    "request failed"
                );
                Submission::Failed(text)
            }
        }
    }

    /// `new`: drop queue and resume token, keep the model.
    pub async fn reset(&self, channel_id: &str) -> Result<Arc<Session>, RelayError> {
        let _lifecycle = self.lifecycle.lock().await;
        let current = self.existing(channel_id)?;
        current.clear_queue();
        let model = current.model().to_string();
        self.spawn_locked(channel_id, Some(model), None)
    }

    /// `model <name>`: restart under another model. The resume token is not carried over.
    pub async fn switch_model(
        &self,
        channel_id: &str,
        model: &str,
    ) -> Result<Arc<Session>, RelayError> {
        let _lifecycle = self.lifecycle.lock().await;
        self.existing(channel_id)?;
        self.spawn_locked(channel_id, Some(model.to_string()), None)
    }

    /// `abort`: discard queue and in-flight render, then resume the same conversation.
    pub async fn abort(&self, channel_id: &str) -> Result<Arc<Session>, RelayError> {
        let _lifecycle = self.lifecycle.lock().await;
        let current = self.existing(channel_id)?;
        let dropped = current.retire();
        let model = current.model().to_string();
        let resume_token = current.resume_token();
        info!(channel = channel_id, dropped, resume = resume_token.is_some(), "aborting request");
        self.spawn_locked(channel_id, Some(model), resume_token)
    }

    /// Forget a queued prompt whose source message was deleted.
    pub fn remove_queued(&self, message: &MessageRef) -> bool {
        self.session(&message.channel_id)
            .is_some_and(|session| session.remove_queued(message))
    }

    /// Swap in the new text of a queued prompt whose source message was edited.
    pub fn update_queued(&self, message: &MessageRef, prompt: String) -> bool {
        self.session(&message.channel_id)
            .is_some_and(|session| session.update_queued(message, prompt))
    }

    /// Kill every worker.
    pub async fn shutdown(&self) {
        let _lifecycle = self.lifecycle.lock().await;
        let channels: Vec<String> = self.sessions.iter().map(|entry| entry.key().clone()).collect();
        for channel in channels {
            self.teardown(&channel);
        }
        info!("all workers stopped");
    }

    fn existing(&self, channel_id: &str) -> Result<Arc<Session>, RelayError> {
        self.session(channel_id)
            .ok_or_else(|| RelayError::NoSession(channel_id.to_string()))
    }

    fn get_or_spawn_locked(&self, channel_id: &str) -> Result<Arc<Session>, RelayError> {
        match self.session(channel_id) {
            Some(session) => Ok(session),
            None => self.spawn_locked(channel_id, None, None),
        }
    }

    fn teardown(&self, channel_id: &str) -> Option<Arc<Session>> {
        let (_, previous) = self.sessions.remove(channel_id)?;
        previous.retire();
        previous.kill();
        debug!(channel = channel_id, session = previous.id(), "session torn down");
        Some(previous)
    }

    fn spawn_locked(
        &self,
        channel_id: &str,
        model: Option<String>,
        resume_token: Option<String>,
    ) -> Result<Arc<Session>, RelayError> {
        let previous = self.teardown(channel_id);
        let model = model
            .or_else(|| previous.map(|s| s.model().to_string()))
            .unwrap_or_else(|| self.settings.default_model.clone());

        let spec = LaunchSpec {
            channel_id: channel_id.to_string(),
            program: self.settings.program.clone(),
            workdir: self.settings.workdir.clone(),
            model: model.clone(),
            resume_token: resume_token.clone(),
        };
        let io = self.launcher.launch(&spec).map_err(RelayError::Spawn)?;

        let id = self.next_session.fetch_add(1, Ordering::Relaxed);
        let session = Arc::new(Session::new(id, channel_id, model, resume_token, io.stdin));
        info!(
            channel = channel_id,
            session = id,
            model = session.model(),
            resume = spec.resume_token.is_some(),
            "worker started"
        );

        if let Some(stderr) = io.stderr {
            tokio::spawn(log_stderr(channel_id.to_string(), stderr));
        }
        tokio::spawn(supervise(
            self.sessions.clone(),
            self.runner.clone(),
            session.clone(),
            io.stdout,
            io.control,
        ));

        self.sessions.insert(channel_id.to_string(), session.clone());
        Ok(session)
    }
}

/// Pump worker output into its session until the worker exits or is killed.
async fn supervise(
    sessions: Sessions,
    runner: RequestRunner,
    session: Arc<Session>,
    mut stdout: Box<dyn AsyncRead + Send + Unpin>,
    mut control: Box<dyn WorkerControl>,
) {
    let kill = session.kill_token();
    let mut decoder = LineDecoder::new();
    let mut buf = vec![0u8; READ_BUFFER];

    let killed = loop {
        tokio::select! {
            _ = kill.cancelled() => break true,
            read = stdout.read(&mut buf) => match read {
                Ok(0) => break false,
                Ok(n) => {
                    for event in decoder.push(&buf[..n]) {
                        if let Some(next) = session.apply(event) {
                            runner.start(&session, next);
                        }
                    }
                }
                Err(err) => {
                    warn!(
                        channel = %session.channel_id(),
                        error = %err,
                        "reading worker output failed"
                    );
                    break false;
                }
            }
        }
    };

    let code = if killed {
        control.kill().await
    } else {
        if let Some(event) = decoder.finish() {
            if let Some(next) = session.apply(event) {
                runner.start(&session, next);
            }
        }
        let exited = tokio::select! {
            _ = kill.cancelled() => None,
            code = control.wait() => Some(code),
        };
        match exited {
            Some(code) => code,
            None => control.kill().await,
        }
    };

    info!(channel = %session.channel_id(), session = session.id(), ?code, killed, "worker exited");
    session.on_exit(code);
    sessions.remove_if(session.channel_id(), |_, current| current.id() == session.id());
}

async fn log_stderr(channel: String, stderr: Box<dyn AsyncRead + Send + Unpin>) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) if line.trim().is_empty() => {}
            Ok(Some(line)) => warn!(channel = %channel, "worker stderr: {line}"),
            Ok(None) => break,
            Err(err) => {
                debug!(channel = %channel, error = %err, "worker stderr closed");
                break;
            }
        }
    }
}
