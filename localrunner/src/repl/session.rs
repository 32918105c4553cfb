//! The REPL driver bound to one worker process.

use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde_json::{Map, Value};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::oneshot;

use crate::bridge::protocol::{Envelope, EvalError, EvalOutcome, ToWorker};
use crate::repl::queue::{OutputCallback, ReplQueue};
use crate::spawner::ChildLink;

pub const DEFAULT_PROMPT: &str = "\u{203a} ";
const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(5);
const EXIT_COMMAND: &str = ".exit";

/// Options of one debug session.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplConfig {
    pub prompt: String,
    /// How long an `eval` may take before the prompt comes back.
    pub command_timeout: Duration,
    /// Remaining session options, passed through untouched.
    pub options: Map<String, Value>,
}

impl Default for ReplConfig {
    fn default() -> Self {
        Self {
            prompt: DEFAULT_PROMPT.to_string(),
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
            options: Map::new(),
        }
    }
}

impl ReplConfig {
    /// Session options for a worker: its cid in the prompt, overridden by
    /// whatever the worker sent along with its request.
    pub fn for_worker(cid: &str, mut params: Map<String, Value>) -> Self {
        let mut config = Self {
            prompt: format!("[{cid}] {DEFAULT_PROMPT}"),
            ..Self::default()
        };
        if let Some(prompt) = params.get("prompt").and_then(Value::as_str) {
            config.prompt = prompt.to_string();
            params.remove("prompt");
        }
        if let Some(ms) = params.get("commandTimeout").and_then(Value::as_u64) {
            config.command_timeout = Duration::from_millis(ms);
            params.remove("commandTimeout");
        }
        config.options = params;
        config
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ReplError {
    #[error("a command is already running")]
    CommandRunning,
    #[error("command timed out after {0:?}")]
    Timeout(Duration),
    #[error("worker disconnected")]
    Disconnected,
    #[error(transparent)]
    Evaluation(#[from] EvalError),
    #[error("terminal error: {0}")]
    Io(#[from] io::Error),
}

type EvalReply = Result<Value, EvalError>;

struct ReplInner {
    id: u64,
    child: ChildLink,
    config: ReplConfig,
    on_output: OutputCallback,
    queue: ReplQueue,
    pending: Mutex<Option<oneshot::Sender<EvalReply>>>,
    finished: AtomicBool,
}

/// A granted debug session. Cloning yields another handle to the same session.
#[derive(Clone)]
pub struct RunnerRepl {
    inner: Arc<ReplInner>,
}

impl fmt::Debug for RunnerRepl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunnerRepl")
            .field("id", &self.inner.id)
            .field("cid", &self.cid())
            .field("finished", &self.is_finished())
            .finish()
    }
}

impl RunnerRepl {
    pub(crate) fn new(
        id: u64,
        child: ChildLink,
        config: ReplConfig,
        on_output: OutputCallback,
        queue: ReplQueue,
    ) -> Self {
        Self {
            inner: Arc::new(ReplInner {
                id,
                child,
                config,
                on_output,
                queue,
                pending: Mutex::new(None),
                finished: AtomicBool::new(false),
            }),
        }
    }

    fn pending(&self) -> MutexGuard<'_, Option<oneshot::Sender<EvalReply>>> {
        self.inner
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn cid(&self) -> &str {
        self.inner.child.cid()
    }

    pub fn config(&self) -> &ReplConfig {
        &self.inner.config
    }

    /// Whether this session is bound to the process behind `link`.
    pub fn belongs_to(&self, link: &ChildLink) -> bool {
        self.inner.child.same_process(link)
    }

    pub fn is_command_running(&self) -> bool {
        self.pending().is_some()
    }

    pub fn is_finished(&self) -> bool {
        self.inner.finished.load(Ordering::SeqCst)
    }

    /// Tell the worker its session has been granted.
    pub fn start(&self) -> bool {
        self.inner
            .child
            .send(ToWorker::Debugger(Envelope::debug_start()))
    }

    /// Evaluate `cmd` inside the worker and wait for its result.
    pub async fn eval(&self, cmd: &str) -> Result<Value, ReplError> {
        let rx = {
            let mut pending = self.pending();
            if pending.is_some() {
                return Err(ReplError::CommandRunning);
            }
            if self.is_finished() {
                return Err(ReplError::Disconnected);
            }
            let (tx, rx) = oneshot::channel();
            if !self
                .inner
                .child
                .send(ToWorker::Debugger(Envelope::debug_eval(cmd)))
            {
                return Err(ReplError::Disconnected);
            }
            *pending = Some(tx);
            rx
        };

        let timeout = self.inner.config.command_timeout;
        let reply = tokio::time::timeout(timeout, rx).await;
        match reply {
            Ok(Ok(reply)) => Ok(reply?),
            Ok(Err(_)) => Err(ReplError::Disconnected),
            Err(_) => {
                let mut pending = self.pending();
                // Only clear our own slot; its receiver is gone now.
                if pending.as_ref().is_some_and(oneshot::Sender::is_closed) {
                    pending.take();
                }
                Err(ReplError::Timeout(timeout))
            }
        }
    }

    /// Deliver a `debugger/result` from the worker to the waiting `eval`.
    pub fn on_result(&self, outcome: EvalOutcome) {
        let Some(tx) = self.pending().take() else {
            tracing::debug!(cid = %self.cid(), "Debug result with no command waiting");
            return;
        };
        let _ = tx.send(outcome.into_result());
    }

    /// Fail a waiting `eval` with [`ReplError::Disconnected`].
    pub(crate) fn disconnect(&self) {
        self.pending().take();
    }

    /// End the session: stop the worker's debugger, report it and hand the
    /// terminal to the next queued worker. Only the first call has an effect.
    pub fn finish(&self) {
        if self.inner.finished.swap(true, Ordering::SeqCst) {
            return;
        }
        self.disconnect();
        let stop = Envelope::debug_stop();
        self.inner.child.send(ToWorker::Debugger(stop.clone()));
        (self.inner.on_output)(stop);
        tracing::info!(cid = %self.cid(), "Debug session finished");
        self.inner.queue.release(self.inner.id);
    }

    /// Run the interactive loop on `terminal` until `.exit`, end of input or
    /// the worker going away, then finish the session.
    pub async fn run(&self, terminal: &ReplTerminal) -> io::Result<()> {
        self.start();
        let result = self.drive(terminal).await;
        self.finish();
        result
    }

    async fn drive(&self, terminal: &ReplTerminal) -> io::Result<()> {
        loop {
            terminal.write(&self.inner.config.prompt).await?;
            let line = tokio::select! {
                line = terminal.read_line() => line?,
                _ = self.inner.child.exited() => {
                    terminal.write("\n").await?;
                    return Ok(());
                }
            };
            let Some(line) = line else {
                return Ok(());
            };
            let cmd = line.trim();
            if cmd.is_empty() {
                continue;
            }
            if cmd == EXIT_COMMAND {
                return Ok(());
            }

            match self.eval(cmd).await {
                Ok(value) => terminal.write_line(&render(&value)).await?,
                Err(ReplError::Evaluation(err)) => {
                    let text = err.stack.as_deref().unwrap_or(&err.message);
                    terminal.write_line(text).await?;
                }
                Err(ReplError::Disconnected) => {
                    terminal.write_line("worker disconnected").await?;
                    return Ok(());
                }
                Err(err) => terminal.write_line(&err.to_string()).await?,
            }
        }
    }
}

fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => serde_json::to_string_pretty(other).unwrap_or_else(|_| other.to_string()),
    }
}

type TerminalInput = Box<dyn AsyncBufRead + Send + Unpin>;
type TerminalOutput = Box<dyn AsyncWrite + Send + Unpin>;

/// The terminal shared by every debug session of an orchestrator.
#[derive(Clone)]
pub struct ReplTerminal {
    input: Arc<tokio::sync::Mutex<TerminalInput>>,
    output: Arc<tokio::sync::Mutex<TerminalOutput>>,
}

impl fmt::Debug for ReplTerminal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplTerminal").finish_non_exhaustive()
    }
}

impl ReplTerminal {
    pub fn new<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            input: Arc::new(tokio::sync::Mutex::new(Box::new(BufReader::new(reader)))),
            output: Arc::new(tokio::sync::Mutex::new(Box::new(writer))),
        }
    }

    pub fn stdio() -> Self {
        Self::new(tokio::io::stdin(), tokio::io::stdout())
    }

    /// Read one line; `None` at end of input.
    pub async fn read_line(&self) -> io::Result<Option<String>> {
        let mut input = self.input.lock().await;
        let mut line = String::new();
        if input.read_line(&mut line).await? == 0 {
            return Ok(None);
        }
        Ok(Some(line))
    }

    pub async fn write(&self, text: &str) -> io::Result<()> {
        let mut output = self.output.lock().await;
        output.write_all(text.as_bytes()).await?;
        output.flush().await
    }

    pub async fn write_line(&self, text: &str) -> io::Result<()> {
        let mut output = self.output.lock().await;
        output.write_all(text.as_bytes()).await?;
        output.write_all(b"\n").await?;
        output.flush().await
    }
}
