//! Worker output routing.
//!
//! Every line a worker writes to stdout/stderr is prefixed with its cid and
//! either streamed into one of the orchestrator's shared [`OutputStream`]s or,
//! in grouped mode, collected in the worker's [`LogAggregator`] for the caller
//! to flush once the worker is done.

use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;

/// Lines emitted by a runtime debugger attaching to the worker.
const DEBUGGER_NOISE: &[&str] = &[
    "Debugger listening on",
    "Debugger attached",
    "Waiting for the debugger",
];

pub fn prefix_line(cid: &str, line: &str) -> String {
    format!("[{cid}] {line}")
}

/// Prefix a raw worker line, dropping debugger attach noise.
pub fn transform_line(cid: &str, line: &str) -> Option<String> {
    if DEBUGGER_NOISE.iter().any(|noise| line.starts_with(noise)) {
        return None;
    }
    Some(prefix_line(cid, line))
}

/// Shared line sink that stays open for as long as any worker holds a clone.
///
/// One writer task owns the underlying writer, so lines from different
/// workers never interleave mid-line.
#[derive(Debug, Clone)]
pub struct OutputStream {
    tx: mpsc::UnboundedSender<String>,
}

impl OutputStream {
    /// Stream to the orchestrator's stdout. Must be called within a tokio runtime.
    pub fn stdout() -> Self {
        Self::from_writer(tokio::io::stdout())
    }

    /// Stream to the orchestrator's stderr. Must be called within a tokio runtime.
    pub fn stderr() -> Self {
        Self::from_writer(tokio::io::stderr())
    }

    pub fn from_writer<W>(mut writer: W) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        tokio::spawn(async move {
            while let Some(line) = rx.recv().await {
                if let Err(e) = write_line(&mut writer, &line).await {
                    tracing::warn!(error = %e, "Failed to write worker output");
                    break;
                }
            }
        });
        Self { tx }
    }

    /// In-memory stream; the receiver sees every line written.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn write_line(&self, line: impl Into<String>) {
        // A closed sink only happens at shutdown; the line has nowhere to go.
        let _ = self.tx.send(line.into());
    }
}

async fn write_line<W: AsyncWrite + Unpin>(writer: &mut W, line: &str) -> io::Result<()> {
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await
}

/// Ordered, append-only collection of a worker's output lines.
#[derive(Debug, Clone, Default)]
pub struct LogAggregator {
    lines: Arc<Mutex<Vec<String>>>,
}

impl LogAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    fn guard(&self) -> MutexGuard<'_, Vec<String>> {
        self.lines.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn push(&self, line: String) {
        self.guard().push(line);
    }

    pub fn lines(&self) -> Vec<String> {
        self.guard().clone()
    }

    /// Take every collected line, leaving the aggregator empty.
    pub fn drain(&self) -> Vec<String> {
        std::mem::take(&mut *self.guard())
    }

    pub fn len(&self) -> usize {
        self.guard().len()
    }

    pub fn is_empty(&self) -> bool {
        self.guard().is_empty()
    }
}

/// Where transformed worker lines go.
#[derive(Debug, Clone)]
pub enum LineTarget {
    Stream(OutputStream),
    Aggregate(LogAggregator),
}

impl LineTarget {
    fn push(&self, line: String) {
        match self {
            Self::Stream(stream) => stream.write_line(line),
            Self::Aggregate(aggregator) => aggregator.push(line),
        }
    }
}

/// Read `reader` line by line until EOF, routing each transformed line.
///
/// Invalid UTF-8 is replaced rather than ending the stream.
pub async fn pipe_lines<R>(cid: &str, reader: R, target: LineTarget) -> io::Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        if reader.read_until(b'\n', &mut buf).await? == 0 {
            return Ok(());
        }
        let text = String::from_utf8_lossy(&buf);
        let line = text.trim_end_matches(['\n', '\r']);
        if let Some(out) = transform_line(cid, line) {
            target.push(out);
        }
    }
}
