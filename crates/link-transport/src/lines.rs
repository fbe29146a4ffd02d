use tracing::warn;

/// Reassembles newline-terminated text from arbitrary read chunks.
///
/// A trailing `\r` is stripped and blank lines are dropped. A line longer
/// than `max_len` is discarded whole, up to and including its terminator, so
/// neither an unbounded buffer nor a truncated fragment reaches the caller.
#[derive(Debug)]
pub struct LineAssembler {
    buf: Vec<u8>,
    max_len: usize,
    discarding: bool,
}

impl LineAssembler {
    pub fn new(max_len: usize) -> Self {
        Self {
            buf: Vec::with_capacity(256),
            max_len: max_len.max(1),
            discarding: false,
        }
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        for &b in chunk {
            if b == b'\n' {
                if self.discarding {
                    self.discarding = false;
                } else if let Some(line) = self.take_line() {
                    lines.push(line);
                }
                continue;
            }
            if self.discarding {
                continue;
            }
            if self.buf.len() >= self.max_len {
                warn!(max = self.max_len, "discarding oversized line");
                self.buf.clear();
                self.discarding = true;
                continue;
            }
            self.buf.push(b);
        }
        lines
    }

    /// Bytes held for a line that has not been terminated yet.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    fn take_line(&mut self) -> Option<String> {
        if self.buf.last() == Some(&b'\r') {
            self.buf.pop();
        }
        let line = String::from_utf8_lossy(&self.buf).into_owned();
        self.buf.clear();
        if line.trim().is_empty() {
            None
        } else {
            Some(line)
        }
    }
}
