use tracing::trace;

use crate::event::WorkerEvent;

/// Reassembles newline-terminated records from arbitrarily split reads.
///
/// Bytes after the last newline stay buffered until the next `push`. A line
/// that does not parse is dropped; it never poisons the stream.
#[derive(Debug, Default)]
pub struct LineDecoder {
    pending: Vec<u8>,
}

impl LineDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one read and return every record it completed, in stream order.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<WorkerEvent> {
        self.pending.extend_from_slice(chunk);

        let Some(last_newline) = self.pending.iter().rposition(|b| *b == b'\n') else {
            return Vec::new();
        };

        let rest = self.pending.split_off(last_newline + 1);
        let complete = std::mem::replace(&mut self.pending, rest);

        complete
            .split(|b| *b == b'\n')
            .filter_map(decode_line)
            .collect()
    }

    /// Flush whatever is left once the stream has ended.
    pub fn finish(&mut self) -> Option<WorkerEvent> {
        let rest = std::mem::take(&mut self.pending);
        decode_line(&rest)
    }

    /// Bytes waiting for their newline.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}

fn decode_line(line: &[u8]) -> Option<WorkerEvent> {
    let line = line.trim_ascii();
    if line.is_empty() {
        return None;
    }
    match WorkerEvent::from_slice(line) {
        Ok(event) => Some(event),
        Err(err) => {
            trace!(error = %err, len = line.len(), "discarding undecodable worker line");
            None
        }
    }
}
