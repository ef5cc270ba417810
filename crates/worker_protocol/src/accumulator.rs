use crate::event::{ContentBlock, WorkerEvent};

/// How a request ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Success(String),
    Error(String),
}

/// What folding one event produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    Nothing,
    SessionStarted {
        session_id: Option<String>,
        model: Option<String>,
    },
    /// Current display text after an assistant record.
    Progress(String),
    /// The request is over; the buffer has been reset.
    Finished(Outcome),
}

/// Folds worker events into the text shown for the in-flight request.
#[derive(Debug, Default)]
pub struct OutputAccumulator {
    buffer: String,
}

impl OutputAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn buffer(&self) -> &str {
        &self.buffer
    }

    pub fn reset(&mut self) {
        self.buffer.clear();
    }

    pub fn apply(&mut self, event: WorkerEvent) -> Step {
        match event {
            WorkerEvent::Init { session_id, model } => Step::SessionStarted { session_id, model },
            WorkerEvent::Assistant { blocks } => {
                for block in blocks {
                    match block {
                        // assistant records carry the whole text so far
                        ContentBlock::Text { text } if !text.is_empty() => self.buffer = text,
                        ContentBlock::ToolUse { name } => {
                            self.buffer.push_str(&format!("\n`[{name}]` "));
                        }
                        _ => {}
                    }
                }
                Step::Progress(self.buffer.clone())
            }
            WorkerEvent::Success { result } => {
                if let Some(result) = result.filter(|r| !r.is_empty()) {
                    self.buffer = result;
                }
                Step::Finished(Outcome::Success(std::mem::take(&mut self.buffer)))
            }
            WorkerEvent::Error { error } => {
                let error = error.unwrap_or_else(|| "Unknown error".to_string());
                self.buffer.push_str(&format!("\n❌ {error}"));
                Step::Finished(Outcome::Error(std::mem::take(&mut self.buffer)))
            }
            WorkerEvent::Ignored => Step::Nothing,
        }
    }
}
