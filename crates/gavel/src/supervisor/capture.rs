//! Incremental, bounded capture of exec output

use futures_util::{Stream, StreamExt};

use crate::container::OutputChunk;

/// State of a capture after accepting a chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capture {
    /// Still within the ceiling
    Open,
    /// A stream went over the ceiling; the process must be stopped
    Overflow,
}

/// How draining an output stream ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Drain {
    /// The stream closed, the process is gone
    Closed,
    /// A stream exceeded the ceiling, the process may still be running
    Overflow,
}

/// Collects stdout and stderr separately, each bounded by the same ceiling
#[derive(Debug, Default)]
pub struct OutputCapture {
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    /// Ceiling per stream in bytes (None = unbounded)
    limit: Option<usize>,
    truncated: bool,
}

impl OutputCapture {
    pub fn new(limit: Option<usize>) -> Self {
        Self {
            limit,
            ..Default::default()
        }
    }

    /// Append a chunk, keeping at most `limit` bytes per stream
    pub fn push(&mut self, chunk: OutputChunk) -> Capture {
        let limit = self.limit;
        let (buf, bytes) = match chunk {
            OutputChunk::Stdout(bytes) => (&mut self.stdout, bytes),
            OutputChunk::Stderr(bytes) => (&mut self.stderr, bytes),
        };

        match limit {
            Some(limit) if buf.len() + bytes.len() > limit => {
                let room = limit.saturating_sub(buf.len());
                buf.extend_from_slice(&bytes[..room]);
                self.truncated = true;
                Capture::Overflow
            }
            _ => {
                buf.extend_from_slice(&bytes);
                Capture::Open
            }
        }
    }

    /// Read `output` until it closes or a stream overflows
    pub async fn drain<S, E>(&mut self, output: &mut S) -> Result<Drain, E>
    where
        S: Stream<Item = Result<OutputChunk, E>> + Unpin,
    {
        while let Some(chunk) = output.next().await {
            if self.push(chunk?) == Capture::Overflow {
                return Ok(Drain::Overflow);
            }
        }
        Ok(Drain::Closed)
    }

    pub fn stdout(&self) -> &[u8] {
        &self.stdout
    }

    pub fn stderr(&self) -> &[u8] {
        &self.stderr
    }

    /// Whether any output was dropped
    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    /// Consume the capture, returning `(stdout, stderr, truncated)`
    pub fn into_parts(self) -> (Vec<u8>, Vec<u8>, bool) {
        (self.stdout, self.stderr, self.truncated)
    }
}
