//! Worker subprocess - the child side of the protocol.
//!
//! The parent side (spawning, message routing) is in instance.rs.
//!
//! The worker announces `ready`, then serves frames from the orchestrator:
//! - Commands run on their own task and are answered with `finishedCommand`
//! - `endSession` is run to completion, answered, and ends the loop
//! - Debugger `eval` frames are evaluated by the handler and answered with
//!   `debugger/result`

use std::io;
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use serde_json::{Map, Value, json};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::bridge::codec::JsonCodec;
use crate::bridge::protocol::{
    Envelope, EvalError, EvalOutcome, Origin, SessionStarted, ToWorker, WorkerCommand, command,
    name,
};
use crate::bridge::transport::connect_from_env;

/// Handle for sending envelopes to the orchestrator.
///
/// Envelopes are queued and written in order by a single writer task.
#[derive(Clone)]
pub struct WorkerSender {
    tx: mpsc::UnboundedSender<Envelope>,
}

impl WorkerSender {
    pub fn new(tx: mpsc::UnboundedSender<Envelope>) -> Self {
        Self { tx }
    }

    pub fn send(&self, envelope: Envelope) -> io::Result<()> {
        self.tx
            .send(envelope)
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "ipc channel closed"))
    }

    pub fn session_started(&self, session: &SessionStarted) -> io::Result<()> {
        let envelope = Envelope::session_started(session)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        self.send(envelope)
    }

    pub fn report(&self, event: impl Into<String>, content: Value) -> io::Result<()> {
        self.send(Envelope::reporter(event, content))
    }

    /// Ask the orchestrator for the terminal.
    pub fn request_debug(&self, params: Map<String, Value>) -> io::Result<()> {
        self.send(Envelope::debug_request(params))
    }
}

/// What the worker actually runs.
#[async_trait::async_trait]
pub trait CommandHandler: Send + Sync + 'static {
    /// Run one command. An error is reported to the orchestrator; the command
    /// still counts as finished.
    async fn run_command(&self, command: WorkerCommand, sender: WorkerSender)
    -> anyhow::Result<()>;

    /// Evaluate a debug session command.
    async fn eval(&self, cmd: &str) -> Result<Value, EvalError> {
        let _ = cmd;
        Err(EvalError::new("this worker does not support debug evaluation"))
    }

    /// The orchestrator granted the terminal.
    fn debug_started(&self) {}

    /// The debug session ended.
    fn debug_stopped(&self) {}
}

/// Run the worker event loop on the IPC channel set up by the orchestrator.
pub async fn run_worker<H: CommandHandler>(handler: Arc<H>) -> io::Result<()> {
    let stream = connect_from_env()?;
    tracing::info!("Connected to orchestrator");
    let (reader, writer) = stream.into_split();
    serve(handler, reader, writer).await
}

/// Serve orchestrator frames from `reader` until `endSession` or end of input.
///
/// Returns once every queued envelope has been written.
pub async fn serve<H, R, W>(handler: Arc<H>, reader: R, writer: W) -> io::Result<()>
where
    H: CommandHandler,
    R: AsyncRead + Send + Unpin + 'static,
    W: AsyncWrite + Send + Unpin + 'static,
{
    let (tx, mut rx) = mpsc::unbounded_channel::<Envelope>();
    let sender = WorkerSender::new(tx);
    let writer_task = tokio::spawn(async move {
        let mut writer = FramedWrite::new(writer, JsonCodec::<Envelope>::new());
        while let Some(envelope) = rx.recv().await {
            writer.send(envelope).await?;
        }
        Ok::<_, io::Error>(())
    });

    sender.send(Envelope::ready())?;
    tracing::debug!("Sent ready");

    let mut frames = FramedRead::new(reader, JsonCodec::<ToWorker>::new());
    let mut tasks = JoinSet::new();
    loop {
        while tasks.try_join_next().is_some() {}
        let frame = match frames.next().await {
            Some(Ok(frame)) => frame,
            Some(Err(e)) => {
                tracing::error!(error = %e, "IPC channel error");
                break;
            }
            None => {
                tracing::info!("IPC channel closed (orchestrator gone?), exiting");
                break;
            }
        };

        match frame {
            ToWorker::Command(cmd) if cmd.command == command::END_SESSION => {
                tracing::info!(cid = %cmd.cid, "Ending session");
                run_command(handler.as_ref(), cmd, &sender).await;
                break;
            }
            ToWorker::Command(cmd) => {
                tracing::debug!(cid = %cmd.cid, command = %cmd.command, "Command received");
                let handler = Arc::clone(&handler);
                let sender = sender.clone();
                tasks.spawn(async move { run_command(handler.as_ref(), cmd, &sender).await });
            }
            ToWorker::Debugger(envelope) => {
                handle_debugger(&handler, envelope, &sender, &mut tasks);
            }
        }
    }

    tasks.shutdown().await;
    drop(sender);
    match writer_task.await {
        Ok(result) => result,
        Err(e) => Err(io::Error::other(e)),
    }
}

async fn run_command<H: CommandHandler + ?Sized>(
    handler: &H,
    cmd: WorkerCommand,
    sender: &WorkerSender,
) {
    let name = cmd.command.clone();
    if let Err(e) = handler.run_command(cmd, sender.clone()).await {
        tracing::error!(command = %name, error = %e, "Command failed");
        let _ = sender.send(
            Envelope::new(Origin::Worker, "error").with_content(json!({
                "command": name,
                "message": format!("{e:#}"),
            })),
        );
    }
    let _ = sender.send(Envelope::finished_command(&name));
}

fn handle_debugger<H: CommandHandler>(
    handler: &Arc<H>,
    envelope: Envelope,
    sender: &WorkerSender,
    tasks: &mut JoinSet<()>,
) {
    if envelope.origin != Origin::Debugger {
        tracing::warn!(name = %envelope.name, "Ignoring unexpected frame");
        return;
    }
    match envelope.name.as_str() {
        name::START => handler.debug_started(),
        name::STOP => handler.debug_stopped(),
        name::EVAL => {
            let cmd = envelope
                .content
                .as_ref()
                .and_then(|c| c.get("cmd"))
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let handler = Arc::clone(handler);
            let sender = sender.clone();
            tasks.spawn(async move {
                let outcome = match handler.eval(&cmd).await {
                    Ok(result) => EvalOutcome::success(result),
                    Err(e) => EvalOutcome::failure(&e),
                };
                match Envelope::debug_result(&outcome) {
                    Ok(reply) => {
                        let _ = sender.send(reply);
                    }
                    Err(e) => tracing::error!(error = %e, "Failed to encode debug result"),
                }
            });
        }
        other => tracing::debug!(name = other, "Ignoring debugger frame"),
    }
}
