//! In-memory doubles for the chat platform and the worker process.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, bail};
use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, duplex};
use tokio::sync::{mpsc, oneshot, watch};

use crate::surface::{ChatSurface, MessageRef};
use crate::worker::{LaunchSpec, WorkerControl, WorkerIo, WorkerLauncher};

const WAIT_LIMIT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
struct Posted {
    text: String,
    parent: MessageRef,
}

#[derive(Default)]
struct Recorded {
    next_id: u64,
    messages: HashMap<MessageRef, Posted>,
    order: Vec<MessageRef>,
    edits: usize,
}

/// Chat surface that keeps every posted message in memory.
pub struct RecordingSurface {
    recorded: Mutex<Recorded>,
    fail_edits: AtomicBool,
    fail_replies: AtomicBool,
    refuse_next_reply: AtomicBool,
    version: watch::Sender<u64>,
}

impl RecordingSurface {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            recorded: Mutex::new(Recorded::default()),
            fail_edits: AtomicBool::new(false),
            fail_replies: AtomicBool::new(false),
            refuse_next_reply: AtomicBool::new(false),
            version: watch::Sender::new(0),
        })
    }

    pub fn fail_edits(&self, fail: bool) {
        self.fail_edits.store(fail, Ordering::SeqCst);
    }

    pub fn fail_replies(&self, fail: bool) {
        self.fail_replies.store(fail, Ordering::SeqCst);
    }

    /// Fail only the next reply.
    pub fn refuse_next_reply(&self) {
        self.refuse_next_reply.store(true, Ordering::SeqCst);
    }

    pub fn text_of(&self, message: &MessageRef) -> Option<String> {
        let recorded = self.recorded.lock().unwrap();
        recorded.messages.get(message).map(|p| p.text.clone())
    }

    pub fn parent_of(&self, message: &MessageRef) -> Option<MessageRef> {
        let recorded = self.recorded.lock().unwrap();
        recorded.messages.get(message).map(|p| p.parent.clone())
    }

    pub fn edit_count(&self) -> usize {
        self.recorded.lock().unwrap().edits
    }

    /// Replies posted directly to `parent`, oldest first.
    pub fn replies_to(&self, parent: &MessageRef) -> Vec<MessageRef> {
        let recorded = self.recorded.lock().unwrap();
        recorded
            .order
            .iter()
            .filter(|m| recorded.messages[*m].parent == *parent)
            .cloned()
            .collect()
    }

    /// Current text of the first reply to `parent`.
    pub fn first_reply_text(&self, parent: &MessageRef) -> Option<String> {
        self.replies_to(parent).first().and_then(|m| self.text_of(m))
    }

    /// Wait until `check` holds, panicking after a generous limit.
    pub async fn wait_until(&self, what: &str, check: impl Fn(&Self) -> bool) {
        let mut changes = self.version.subscribe();
        let waited = tokio::time::timeout(WAIT_LIMIT, async {
            loop {
                if check(self) {
                    return;
                }
                if changes.changed().await.is_err() {
                    return;
                }
            }
        })
        .await;
        assert!(waited.is_ok() && check(self), "timed out waiting for {what}");
    }

    /// Wait until the first reply to `parent` reads exactly `text`.
    pub async fn wait_for_reply(&self, parent: &MessageRef, text: &str) {
        self.wait_until(&format!("reply `{text}` to {parent}"), |s| {
            s.first_reply_text(parent).as_deref() == Some(text)
        })
        .await;
    }

    fn bump(&self) {
        self.version.send_modify(|v| *v += 1);
    }
}

#[async_trait]
impl ChatSurface for RecordingSurface {
    async fn reply(&self, to: &MessageRef, text: &str) -> anyhow::Result<MessageRef> {
        if self.fail_replies.load(Ordering::SeqCst)
            || self.refuse_next_reply.swap(false, Ordering::SeqCst)
        {
            bail!("reply refused");
        }
        let message = {
            let mut recorded = self.recorded.lock().unwrap();
            recorded.next_id += 1;
            let message = MessageRef::new(&to.channel_id, format!("bot-{}", recorded.next_id));
            recorded.messages.insert(
                message.clone(),
                Posted {
                    text: text.to_string(),
                    parent: to.clone(),
                },
            );
            recorded.order.push(message.clone());
            message
        };
        self.bump();
        Ok(message)
    }

    async fn edit(&self, message: &MessageRef, text: &str) -> anyhow::Result<()> {
        if self.fail_edits.load(Ordering::SeqCst) {
            bail!("edit refused");
        }
        {
            let mut recorded = self.recorded.lock().unwrap();
            recorded.edits += 1;
            match recorded.messages.get_mut(message) {
                Some(posted) => posted.text = text.to_string(),
                None => bail!("unknown message {message}"),
            }
        }
        self.bump();
        Ok(())
    }
}

/// Test side of one fake worker process.
pub struct FakeWorker {
    pub spec: LaunchSpec,
    turns: BufReader<DuplexStream>,
    stdout: DuplexStream,
    exit: oneshot::Sender<Option<i32>>,
    killed: Arc<AtomicBool>,
}

impl FakeWorker {
    /// Next user turn the relay wrote to the worker.
    pub async fn next_turn(&mut self) -> Value {
        let mut line = String::new();
        let read = tokio::time::timeout(WAIT_LIMIT, self.turns.read_line(&mut line))
            .await
            .expect("timed out waiting for a user turn")
            .expect("worker stdin readable");
        assert!(read > 0, "worker stdin closed");
        serde_json::from_str(line.trim_end()).expect("user turn is JSON")
    }

    /// Prompt text of the next user turn.
    pub async fn next_prompt(&mut self) -> String {
        let turn = self.next_turn().await;
        turn["message"]["content"]
            .as_str()
            .expect("content is a string")
            .to_string()
    }

    pub async fn emit(&mut self, record: Value) {
        let mut line = record.to_string();
        line.push('\n');
        self.emit_raw(line.as_bytes()).await;
    }

    pub async fn emit_raw(&mut self, bytes: &[u8]) {
        self.stdout.write_all(bytes).await.expect("relay reads stdout");
        self.stdout.flush().await.expect("flush");
    }

    pub async fn init(&mut self, session_id: &str) {
        let model = self.spec.model.clone();
        self.emit(json!({
            "type": "system",
            "subtype": "init",
            "session_id": session_id,
            "model": model,
        }))
        .await;
    }

    pub async fn say(&mut self, text: &str) {
        self.emit(json!({
            "type": "assistant",
            "message": {"content": [{"type": "text", "text": text}]},
        }))
        .await;
    }

    pub async fn succeed(&mut self, result: &str) {
        self.emit(json!({"type": "result", "subtype": "success", "result": result}))
            .await;
    }

    pub async fn fail(&mut self, error: &str) {
        self.emit(json!({"type": "result", "subtype": "error_during_execution", "error": error}))
            .await;
    }

    pub fn was_killed(&self) -> bool {
        self.killed.load(Ordering::SeqCst)
    }

    /// Close stdout and report `code` as the exit status.
    pub fn exit(self, code: Option<i32>) {
        drop(self.stdout);
        let _ = self.exit.send(code);
    }
}

struct FakeControl {
    exit: Option<oneshot::Receiver<Option<i32>>>,
    killed: Arc<AtomicBool>,
}

#[async_trait]
impl WorkerControl for FakeControl {
    async fn wait(&mut self) -> Option<i32> {
        match self.exit.take() {
            Some(exit) => exit.await.ok().flatten(),
            None => None,
        }
    }

    async fn kill(&mut self) -> Option<i32> {
        self.killed.store(true, Ordering::SeqCst);
        None
    }
}

/// Launcher handing out duplex-backed workers to the test body.
pub struct FakeLauncher {
    workers: mpsc::UnboundedSender<FakeWorker>,
    launched: tokio::sync::Mutex<mpsc::UnboundedReceiver<FakeWorker>>,
    launches: Mutex<Vec<LaunchSpec>>,
    fail_next: AtomicBool,
}

impl FakeLauncher {
    pub fn new() -> Arc<Self> {
        let (workers, launched) = mpsc::unbounded_channel();
        Arc::new(Self {
            workers,
            launched: tokio::sync::Mutex::new(launched),
            launches: Mutex::new(Vec::new()),
            fail_next: AtomicBool::new(false),
        })
    }

    pub fn fail_next(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    pub fn launches(&self) -> Vec<LaunchSpec> {
        self.launches.lock().unwrap().clone()
    }

    /// The next worker the relay started.
    pub async fn next_worker(&self) -> FakeWorker {
        let mut launched = self.launched.lock().await;
        tokio::time::timeout(WAIT_LIMIT, launched.recv())
            .await
            .expect("timed out waiting for a launch")
            .expect("launcher alive")
    }
}

impl WorkerLauncher for FakeLauncher {
    fn launch(&self, spec: &LaunchSpec) -> anyhow::Result<WorkerIo> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            bail!("no such file or directory");
        }
        self.launches.lock().unwrap().push(spec.clone());

        let (relay_stdin, worker_stdin) = duplex(64 * 1024);
        let (worker_stdout, relay_stdout) = duplex(64 * 1024);
        let (exit_tx, exit_rx) = oneshot::channel();
        let killed = Arc::new(AtomicBool::new(false));

        let worker = FakeWorker {
            spec: spec.clone(),
            turns: BufReader::new(worker_stdin),
            stdout: worker_stdout,
            exit: exit_tx,
            killed: killed.clone(),
        };
        self.workers
            .send(worker)
            .map_err(|_| anyhow!("test body dropped the launcher"))?;

        Ok(WorkerIo {
            stdin: Box::new(relay_stdin),
            stdout: Box::new(relay_stdout),
            stderr: None,
            control: Box::new(FakeControl {
                exit: Some(exit_rx),
                killed,
            }),
        })
    }
}
