//! WorkerInstance - owns one worker process and the IPC contract with it.
//!
//! Flow:
//! 1. `dispatch` admits the command (at most one in flight), spawning the
//!    process on first use
//! 2. The delivery task holds the command until the worker announced `ready`
//!    (and `sessionStarted` when requested), then sends it
//! 3. The reader task classifies every inbound envelope, updates state and
//!    fans it out as a [`WorkerEvent`]
//! 4. On process exit: drain remaining messages, mark the instance killed and
//!    emit `Exit` with the unchanged retry budget

use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::bridge::codec::JsonCodec;
use crate::bridge::protocol::{
    BUSY_ALLOWED_COMMANDS, Envelope, Inbound, Origin, SessionStarted, ToWorker, WorkerCommand,
    name,
};
use crate::config::worker_env;
use crate::context::RunnerContext;
use crate::gate::Gate;
use crate::output::{LineTarget, LogAggregator, pipe_lines};
use crate::repl::{ReplConfig, RunnerRepl};
use crate::spawner::{
    BoxedReader, BoxedWriter, ChildLink, SpawnError, SpawnRequest, SpawnedWorker, WorkerProcess,
};

/// What a worker is asked to run.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerAssignment {
    pub cid: String,
    pub config_file: PathBuf,
    /// Requested capabilities.
    pub caps: Value,
    pub specs: Vec<String>,
    pub exec_argv: Vec<String>,
    pub retries: u32,
}

impl WorkerAssignment {
    pub fn new(cid: impl Into<String>, config_file: impl Into<PathBuf>) -> Self {
        Self {
            cid: cid.into(),
            config_file: config_file.into(),
            caps: Value::Object(Map::new()),
            specs: Vec::new(),
            exec_argv: Vec::new(),
            retries: 0,
        }
    }

    pub fn with_caps(mut self, caps: Value) -> Self {
        self.caps = caps;
        self
    }

    pub fn with_specs<I, S>(mut self, specs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.specs = specs.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_exec_argv<I, S>(mut self, argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.exec_argv = argv.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }
}

/// Outcome of [`WorkerInstance::dispatch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// Accepted; delivered once the worker is ready.
    Queued,
    /// Ignored. Nothing was spawned or sent.
    Dropped(DropReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Another command is still in flight.
    Busy,
    /// The worker process already exited.
    Killed,
    /// The process could not be spawned; an `Error` event carries the cause.
    SpawnFailed,
}

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("failed to spawn worker: {0}")]
    Spawn(#[from] SpawnError),
    #[error("ipc channel error: {0}")]
    Channel(#[source] io::Error),
    #[error("worker did not announce itself within {0:?}")]
    ReadyTimeout(Duration),
    #[error("failed to wait for worker: {0}")]
    Wait(#[source] io::Error),
}

/// Events fanned out to the pool manager and reporters.
#[derive(Debug)]
pub enum WorkerEvent {
    /// An envelope received from the worker.
    Message { cid: String, envelope: Envelope },
    /// A spawn or runtime failure. The pool keeps running.
    Error { cid: String, error: WorkerError },
    /// The worker process is gone. Always the last event of an instance.
    Exit {
        cid: String,
        exit_code: Option<i32>,
        specs: Vec<String>,
        retries: u32,
    },
}

impl WorkerEvent {
    pub fn cid(&self) -> &str {
        match self {
            Self::Message { cid, .. } | Self::Error { cid, .. } | Self::Exit { cid, .. } => cid,
        }
    }
}

/// Pool-manager-facing view of a worker.
pub trait Worker: Send + Sync {
    fn cid(&self) -> &str;
    fn specs(&self) -> &[String];
    fn retries(&self) -> u32;
    fn is_busy(&self) -> bool;
    fn is_killed(&self) -> bool;
    fn dispatch(&self, command: &str, args: Value, requires_session: bool) -> Dispatch;
    fn terminate(&self);
}

struct PendingCommand {
    command: WorkerCommand,
    requires_session: bool,
}

struct ProcessSlot {
    link: ChildLink,
    commands: mpsc::UnboundedSender<PendingCommand>,
}

struct State {
    process: Option<ProcessSlot>,
    busy: bool,
    killed: bool,
    /// Best-known capabilities; replaced by the resolved ones on session start.
    capabilities: Value,
    session_id: Option<String>,
    is_multiremote: bool,
    instances: Option<Map<String, Value>>,
    /// Remaining fields of a multiremote session payload.
    session_fields: Map<String, Value>,
    /// Worker configuration merged with session details.
    config: Map<String, Value>,
}

struct Shared {
    cid: String,
    config_file: PathBuf,
    caps: Value,
    specs: Vec<String>,
    exec_argv: Vec<String>,
    retries: u32,
    ready: Gate,
    session: Gate,
    logs: LogAggregator,
    ctx: RunnerContext,
    state: Mutex<State>,
}

/// One worker process, spawned lazily and never resurrected.
///
/// Cloning yields another handle to the same worker. Methods that may spawn
/// must be called within a tokio runtime.
#[derive(Clone)]
pub struct WorkerInstance {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for WorkerInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state();
        f.debug_struct("WorkerInstance")
            .field("cid", &self.shared.cid)
            .field("running", &state.process.is_some())
            .field("busy", &state.busy)
            .field("killed", &state.killed)
            .finish()
    }
}

impl WorkerInstance {
    pub(crate) fn new(assignment: WorkerAssignment, ctx: RunnerContext) -> Self {
        let WorkerAssignment {
            cid,
            config_file,
            caps,
            specs,
            exec_argv,
            retries,
        } = assignment;
        let state = State {
            process: None,
            busy: false,
            killed: false,
            capabilities: caps.clone(),
            session_id: None,
            is_multiremote: false,
            instances: None,
            session_fields: Map::new(),
            config: Map::new(),
        };
        Self {
            shared: Arc::new(Shared {
                cid,
                config_file,
                caps,
                specs,
                exec_argv,
                retries,
                ready: Gate::new(),
                session: Gate::new(),
                logs: LogAggregator::new(),
                ctx,
                state: Mutex::new(state),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn cid(&self) -> &str {
        &self.shared.cid
    }

    pub fn specs(&self) -> &[String] {
        &self.shared.specs
    }

    pub fn retries(&self) -> u32 {
        self.shared.retries
    }

    /// Capabilities the worker was created with.
    pub fn requested_caps(&self) -> &Value {
        &self.shared.caps
    }

    pub fn is_busy(&self) -> bool {
        self.state().busy
    }

    pub fn is_killed(&self) -> bool {
        self.state().killed
    }

    pub fn is_running(&self) -> bool {
        self.state().process.is_some()
    }

    pub fn pid(&self) -> Option<u32> {
        self.state().process.as_ref().and_then(|p| p.link.pid())
    }

    pub fn is_ready(&self) -> bool {
        self.shared.ready.is_open()
    }

    pub fn is_session_established(&self) -> bool {
        self.shared.session.is_open()
    }

    /// Wait until the worker announced `ready`.
    pub async fn ready(&self) {
        self.shared.ready.wait().await
    }

    pub fn session_id(&self) -> Option<String> {
        self.state().session_id.clone()
    }

    pub fn capabilities(&self) -> Value {
        self.state().capabilities.clone()
    }

    pub fn is_multiremote(&self) -> bool {
        self.state().is_multiremote
    }

    pub fn instances(&self) -> Option<Map<String, Value>> {
        self.state().instances.clone()
    }

    /// A configuration value, including details merged in on session start.
    pub fn config_value(&self, key: &str) -> Option<Value> {
        self.state().config.get(key).cloned()
    }

    /// A field of a multiremote session payload.
    pub fn session_field(&self, key: &str) -> Option<Value> {
        self.state().session_fields.get(key).cloned()
    }

    /// Lines collected in grouped-log mode.
    pub fn logs(&self) -> Vec<String> {
        self.shared.logs.lines()
    }

    /// Take the collected lines for flushing.
    pub fn take_logs(&self) -> Vec<String> {
        self.shared.logs.drain()
    }

    /// Run `command` in the worker.
    ///
    /// At most one command is in flight: while busy, only the commands in
    /// [`BUSY_ALLOWED_COMMANDS`] are accepted and everything else is dropped
    /// (not queued). Delivery waits for `ready`, and for `sessionStarted`
    /// when `requires_session` is set.
    pub fn dispatch(&self, command: &str, args: Value, requires_session: bool) -> Dispatch {
        let cid = &self.shared.cid;
        let mut state = self.state();

        if state.busy && !BUSY_ALLOWED_COMMANDS.contains(&command) {
            tracing::info!(
                %cid,
                command,
                "worker with cid {} already busy and can't take new commands",
                cid
            );
            return Dispatch::Dropped(DropReason::Busy);
        }
        if state.killed {
            tracing::info!(%cid, command, "Worker already exited, dropping command");
            return Dispatch::Dropped(DropReason::Killed);
        }
        let Some(link) = self.start_process_locked(&mut state) else {
            return Dispatch::Dropped(DropReason::SpawnFailed);
        };
        // The process is gone; its exit is still being reported.
        if link.is_exited() {
            tracing::info!(%cid, command, "Worker already exited, dropping command");
            return Dispatch::Dropped(DropReason::Killed);
        }

        let pending = PendingCommand {
            command: WorkerCommand {
                cid: cid.clone(),
                command: command.to_string(),
                config_file: self.shared.config_file.clone(),
                args,
                caps: state.capabilities.clone(),
                specs: self.shared.specs.clone(),
                retries: self.shared.retries,
            },
            requires_session,
        };
        let accepted = state
            .process
            .as_ref()
            .is_some_and(|slot| slot.commands.send(pending).is_ok());
        if !accepted {
            return Dispatch::Dropped(DropReason::Killed);
        }

        state.busy = true;
        tracing::debug!(%cid, command, requires_session, "Command queued for delivery");
        Dispatch::Queued
    }

    /// Spawn the worker process unless one is already running.
    ///
    /// Returns the live link, or `None` if the instance is killed or the spawn
    /// failed (reported as [`WorkerEvent::Error`]).
    pub fn start_process(&self) -> Option<ChildLink> {
        let mut state = self.state();
        self.start_process_locked(&mut state)
    }

    fn start_process_locked(&self, state: &mut State) -> Option<ChildLink> {
        if let Some(slot) = &state.process {
            return Some(slot.link.clone());
        }
        let cid = &self.shared.cid;
        if state.killed {
            tracing::debug!(%cid, "Not spawning a process for an exited worker");
            return None;
        }

        let ctx = &self.shared.ctx;
        let request = SpawnRequest {
            cid: cid.clone(),
            env: worker_env(ctx.parent_env(), &ctx.config, cid),
            exec_argv: self.shared.exec_argv.clone(),
        };
        let spawned = match ctx.spawner.spawn(request) {
            Ok(spawned) => spawned,
            Err(e) => {
                tracing::error!(%cid, error = %e, "Failed to spawn worker");
                state.killed = true;
                ctx.emit(WorkerEvent::Error {
                    cid: cid.clone(),
                    error: e.into(),
                });
                return None;
            }
        };

        let (link, outbound) = ChildLink::new(cid, spawned.process.id());
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        tracing::info!(%cid, pid = ?link.pid(), "Worker process started");
        state.process = Some(ProcessSlot {
            link: link.clone(),
            commands: commands_tx,
        });
        self.spawn_tasks(link.clone(), spawned, outbound, commands_rx);
        Some(link)
    }

    fn spawn_tasks(
        &self,
        link: ChildLink,
        spawned: SpawnedWorker,
        outbound: mpsc::UnboundedReceiver<ToWorker>,
        commands: mpsc::UnboundedReceiver<PendingCommand>,
    ) {
        let SpawnedWorker {
            ipc_read,
            ipc_write,
            stdout,
            stderr,
            process,
        } = spawned;
        let ctx = &self.shared.ctx;
        let cid = self.shared.cid.clone();

        let mut output = Vec::with_capacity(2);
        if let Some(stdout) = stdout {
            let target = if ctx.config.group_logs_by_test_spec {
                LineTarget::Aggregate(self.shared.logs.clone())
            } else {
                LineTarget::Stream(ctx.stdout.clone())
            };
            output.push(tokio::spawn(pipe_output(cid.clone(), stdout, target)));
        }
        if let Some(stderr) = stderr {
            let target = LineTarget::Stream(ctx.stderr.clone());
            output.push(tokio::spawn(pipe_output(cid.clone(), stderr, target)));
        }

        tokio::spawn(write_frames(
            ctx.clone(),
            link.clone(),
            ipc_write,
            outbound,
        ));
        tokio::spawn(self.clone().deliver_commands(link.clone(), commands));
        tokio::spawn(self.clone().supervise(link, process, ipc_read, output));
    }

    /// Wait for the gates, then hand each command to the writer in order.
    async fn deliver_commands(
        self,
        link: ChildLink,
        mut commands: mpsc::UnboundedReceiver<PendingCommand>,
    ) {
        let cid = self.shared.cid.clone();
        while let Some(pending) = commands.recv().await {
            let announced = tokio::select! {
                announced = self.wait_announced(pending.requires_session) => announced,
                _ = link.exited() => return,
            };
            if let Err(limit) = announced {
                tracing::warn!(%cid, timeout = ?limit, "Worker never announced itself, terminating");
                self.shared.ctx.emit(WorkerEvent::Error {
                    cid: cid.clone(),
                    error: WorkerError::ReadyTimeout(limit),
                });
                link.terminate();
                return;
            }
            tracing::debug!(%cid, command = %pending.command.command, "Delivering command");
            link.send(ToWorker::Command(pending.command));
        }
    }

    async fn wait_announced(&self, requires_session: bool) -> Result<(), Duration> {
        let wait = async {
            self.shared.ready.wait().await;
            if requires_session {
                self.shared.session.wait().await;
            }
        };
        match self.shared.ctx.config.ready_timeout {
            Some(limit) => tokio::time::timeout(limit, wait)
                .await
                .map_err(|_| limit),
            None => {
                wait.await;
                Ok(())
            }
        }
    }

    async fn supervise(
        self,
        link: ChildLink,
        mut process: Box<dyn WorkerProcess>,
        ipc: BoxedReader,
        output: Vec<JoinHandle<()>>,
    ) {
        let cid = self.shared.cid.clone();
        let reader = tokio::spawn(self.clone().read_frames(link.clone(), ipc));

        let exit_code = match wait_for_exit(&link, process.as_mut()).await {
            Ok(code) => code,
            Err(e) => {
                tracing::error!(%cid, error = %e, "Lost track of worker process");
                self.shared.ctx.emit(WorkerEvent::Error {
                    cid: cid.clone(),
                    error: WorkerError::Wait(e),
                });
                None
            }
        };
        link.mark_exited();

        // Messages and output lines the worker wrote before exiting are
        // collected before `Exit`.
        let mut pending = Vec::with_capacity(output.len() + 1);
        pending.push(reader);
        pending.extend(output);
        let drained = async {
            for task in pending.iter_mut() {
                let _ = task.await;
            }
        };
        match self.shared.ctx.config.exit_drain_timeout {
            Some(limit) => {
                if tokio::time::timeout(limit, drained).await.is_err() {
                    tracing::debug!(%cid, "Worker streams still open after exit, abandoning them");
                    for task in &pending {
                        task.abort();
                    }
                }
            }
            None => drained.await,
        }

        self.handle_exit(&link, exit_code);
    }

    async fn read_frames(self, link: ChildLink, ipc: BoxedReader) {
        let cid = self.shared.cid.clone();
        let mut frames = FramedRead::new(ipc, JsonCodec::<Envelope>::new());
        while let Some(frame) = frames.next().await {
            match frame {
                Ok(envelope) => self.handle_message(&link, envelope),
                Err(e) => {
                    tracing::warn!(%cid, error = %e, "Worker IPC channel failed");
                    self.shared.ctx.emit(WorkerEvent::Error {
                        cid: cid.clone(),
                        error: WorkerError::Channel(e),
                    });
                    break;
                }
            }
        }
        tracing::debug!(%cid, "Worker IPC channel closed");
    }

    fn handle_message(&self, link: &ChildLink, envelope: Envelope) {
        let cid = &self.shared.cid;
        let inbound = match envelope.classify() {
            Ok(inbound) => inbound,
            Err(e) => {
                tracing::warn!(%cid, error = %e, "Malformed worker message");
                // The session exists even when its details are unreadable.
                if envelope.is(Origin::Worker, name::SESSION_STARTED) {
                    self.open_session();
                }
                Inbound::Passthrough
            }
        };

        match inbound {
            Inbound::FinishedCommand => {
                self.state().busy = false;
                tracing::debug!(%cid, "Worker finished command");
            }
            Inbound::Ready => {
                if self.shared.ready.open() {
                    tracing::debug!(%cid, "Worker ready");
                }
            }
            Inbound::SessionStarted(session) => self.record_session(session),
            Inbound::DebugStart(params) => {
                // Re-emitted once the terminal is granted.
                self.request_debug_session(link, params, envelope);
                return;
            }
            Inbound::DebugResult(outcome) => {
                let repl = self.shared.ctx.repl_queue.running_repl();
                match repl {
                    Some(repl) if repl.belongs_to(link) => repl.on_result(outcome),
                    _ => tracing::debug!(%cid, "Debug result without a running session"),
                }
            }
            Inbound::Passthrough => {}
        }

        self.shared.ctx.emit(WorkerEvent::Message {
            cid: cid.clone(),
            envelope,
        });
    }

    fn record_session(&self, session: SessionStarted) {
        {
            let mut state = self.state();
            if session.is_multiremote {
                let SessionStarted {
                    session_id,
                    capabilities,
                    is_multiremote,
                    instances,
                    extra,
                } = session;
                state.is_multiremote = is_multiremote;
                if session_id.is_some() {
                    state.session_id = session_id;
                }
                if let Some(capabilities) = capabilities {
                    state.capabilities = capabilities;
                }
                state.instances = instances;
                state.session_fields.extend(extra);
            } else {
                let fields = session.to_fields();
                state.session_id = session.session_id;
                if let Some(capabilities) = session.capabilities {
                    state.capabilities = capabilities;
                }
                state.config.extend(fields);
            }
        }
        self.open_session();
    }

    fn open_session(&self) {
        if self.shared.session.open() {
            tracing::debug!(cid = %self.shared.cid, "Worker session established");
        }
    }

    fn request_debug_session(
        &self,
        link: &ChildLink,
        params: Map<String, Value>,
        envelope: Envelope,
    ) {
        let ctx = &self.shared.ctx;
        let cid = self.shared.cid.clone();
        let config = ReplConfig::for_worker(&cid, params);

        // Callbacks live in the shared queue; they must not hold the context.
        let on_granted = {
            let events = ctx.events.clone();
            let terminal = ctx.terminal.clone();
            let cid = cid.clone();
            move |repl: RunnerRepl| {
                let _ = events.send(WorkerEvent::Message { cid, envelope });
                match terminal {
                    Some(terminal) => {
                        tokio::spawn(async move {
                            if let Err(e) = repl.run(&terminal).await {
                                tracing::warn!(cid = %repl.cid(), error = %e, "Debug session terminal failed");
                            }
                        });
                    }
                    None => {
                        repl.start();
                    }
                }
            }
        };
        let on_output = {
            let events = ctx.events.clone();
            move |envelope: Envelope| {
                let _ = events.send(WorkerEvent::Message {
                    cid: cid.clone(),
                    envelope,
                });
            }
        };

        ctx.repl_queue.add(link.clone(), config, on_granted, on_output);
        ctx.repl_queue.next();
    }

    fn handle_exit(&self, link: &ChildLink, exit_code: Option<i32>) {
        let cid = &self.shared.cid;
        let slot = {
            let mut state = self.state();
            state.busy = false;
            state.killed = true;
            state.process.take()
        };
        if let Some(slot) = slot
            && !slot.link.same_process(link)
        {
            slot.link.terminate();
        }

        let ctx = &self.shared.ctx;
        if let Some(repl) = ctx.repl_queue.running_repl()
            && repl.belongs_to(link)
        {
            repl.disconnect();
            // An interactive loop notices the exit itself.
            if ctx.terminal.is_none() {
                repl.finish();
            }
        }

        tracing::info!(%cid, ?exit_code, retries = self.shared.retries, "Worker exited");
        ctx.emit(WorkerEvent::Exit {
            cid: cid.clone(),
            exit_code,
            specs: self.shared.specs.clone(),
            retries: self.shared.retries,
        });
    }

    /// Ask the live worker process to stop. Its exit is reported as usual.
    pub fn terminate(&self) {
        if let Some(slot) = &self.state().process {
            tracing::info!(cid = %self.shared.cid, "Terminating worker");
            slot.link.terminate();
        }
    }
}

impl Worker for WorkerInstance {
    fn cid(&self) -> &str {
        WorkerInstance::cid(self)
    }

    fn specs(&self) -> &[String] {
        WorkerInstance::specs(self)
    }

    fn retries(&self) -> u32 {
        WorkerInstance::retries(self)
    }

    fn is_busy(&self) -> bool {
        WorkerInstance::is_busy(self)
    }

    fn is_killed(&self) -> bool {
        WorkerInstance::is_killed(self)
    }

    fn dispatch(&self, command: &str, args: Value, requires_session: bool) -> Dispatch {
        WorkerInstance::dispatch(self, command, args, requires_session)
    }

    fn terminate(&self) {
        WorkerInstance::terminate(self)
    }
}

async fn pipe_output(cid: String, reader: BoxedReader, target: LineTarget) {
    if let Err(e) = pipe_lines(&cid, reader, target).await {
        tracing::debug!(%cid, error = %e, "Worker output stream failed");
    }
}

async fn write_frames(
    ctx: RunnerContext,
    link: ChildLink,
    ipc: BoxedWriter,
    mut outbound: mpsc::UnboundedReceiver<ToWorker>,
) {
    let mut writer = FramedWrite::new(ipc, JsonCodec::<ToWorker>::new());
    loop {
        let frame = tokio::select! {
            frame = outbound.recv() => frame,
            _ = link.exited() => None,
        };
        let Some(frame) = frame else {
            break;
        };
        if let Err(e) = writer.send(frame).await {
            if !link.is_exited() {
                tracing::warn!(cid = %link.cid(), error = %e, "Failed to write to worker");
                ctx.emit(WorkerEvent::Error {
                    cid: link.cid().to_string(),
                    error: WorkerError::Channel(e),
                });
            }
            break;
        }
    }
}

/// Wait for the process to exit, delivering termination requests meanwhile.
async fn wait_for_exit(
    link: &ChildLink,
    process: &mut dyn WorkerProcess,
) -> io::Result<Option<i32>> {
    let mut terminate_sent = false;
    loop {
        tokio::select! {
            status = process.wait() => return status,
            _ = link.terminate_requested(), if !terminate_sent => {
                terminate_sent = true;
                if let Err(e) = process.terminate() {
                    tracing::warn!(cid = %link.cid(), error = %e, "Failed to signal worker");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use serde_json::json;
    use tokio::io::{AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};
    use tokio::sync::watch;

    use super::*;
    use crate::bridge::protocol::{EvalOutcome, Origin, command, name};
    use crate::config::RunnerConfig;
    use crate::output::OutputStream;
    use crate::spawner::WorkerSpawner;

    const WAIT: Duration = Duration::from_secs(2);

    type ExitSignal = Arc<watch::Sender<Option<Option<i32>>>>;

    struct FakeProcess {
        exit: ExitSignal,
    }

    #[async_trait]
    impl WorkerProcess for FakeProcess {
        fn id(&self) -> Option<u32> {
            Some(4242)
        }

        fn terminate(&mut self) -> io::Result<()> {
            self.exit.send_if_modified(|status| {
                if status.is_some() {
                    return false;
                }
                *status = Some(None);
                true
            });
            Ok(())
        }

        async fn wait(&mut self) -> io::Result<Option<i32>> {
            let mut rx = self.exit.subscribe();
            let status = *rx
                .wait_for(Option::is_some)
                .await
                .map_err(|_| io::Error::other("exit signal dropped"))?;
            Ok(status.flatten())
        }
    }

    /// The worker side of a fake process.
    struct FakeChild {
        env: BTreeMap<String, String>,
        exec_argv: Vec<String>,
        inbox: FramedRead<ReadHalf<DuplexStream>, JsonCodec<ToWorker>>,
        outbox: FramedWrite<WriteHalf<DuplexStream>, JsonCodec<Envelope>>,
        stdout: DuplexStream,
        exit: ExitSignal,
    }

    impl FakeChild {
        async fn send(&mut self, envelope: Envelope) {
            self.outbox.send(envelope).await.unwrap();
        }

        async fn recv(&mut self) -> ToWorker {
            tokio::time::timeout(WAIT, self.inbox.next())
                .await
                .expect("worker should receive a frame")
                .expect("channel open")
                .unwrap()
        }

        async fn recv_command(&mut self) -> WorkerCommand {
            match self.recv().await {
                ToWorker::Command(cmd) => cmd,
                other => panic!("expected a command, got {other:?}"),
            }
        }

        async fn recv_debugger(&mut self) -> Envelope {
            match self.recv().await {
                ToWorker::Debugger(envelope) => envelope,
                other => panic!("expected a debugger frame, got {other:?}"),
            }
        }

        async fn assert_no_frame(&mut self) {
            let next = tokio::time::timeout(Duration::from_millis(100), self.inbox.next()).await;
            assert!(next.is_err(), "unexpected frame: {next:?}");
        }

        async fn write_stdout(&mut self, text: &str) {
            self.stdout.write_all(text.as_bytes()).await.unwrap();
        }

        /// Close the IPC channel and exit with `code`.
        fn exit(self, code: i32) {
            let exit = self.exit.clone();
            drop(self);
            exit.send_replace(Some(Some(code)));
        }
    }

    struct FakeSpawner {
        children: mpsc::UnboundedSender<FakeChild>,
        spawned: AtomicUsize,
        fail: bool,
    }

    impl FakeSpawner {
        fn new(fail: bool) -> (Arc<Self>, mpsc::UnboundedReceiver<FakeChild>) {
            let (children, rx) = mpsc::unbounded_channel();
            let spawner = Self {
                children,
                spawned: AtomicUsize::new(0),
                fail,
            };
            (Arc::new(spawner), rx)
        }

        fn spawned(&self) -> usize {
            self.spawned.load(Ordering::SeqCst)
        }
    }

    impl WorkerSpawner for FakeSpawner {
        fn spawn(&self, request: SpawnRequest) -> Result<SpawnedWorker, SpawnError> {
            self.spawned.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(SpawnError::Other("no runtime installed".to_string()));
            }
            let (parent_ipc, child_ipc) = tokio::io::duplex(64 * 1024);
            let (parent_read, parent_write) = tokio::io::split(parent_ipc);
            let (child_read, child_write) = tokio::io::split(child_ipc);
            let (stdout_child, stdout_parent) = tokio::io::duplex(4096);
            let (stderr_child, stderr_parent) = tokio::io::duplex(4096);
            drop(stderr_child);
            let exit: ExitSignal = Arc::new(watch::channel(None).0);

            let child = FakeChild {
                env: request.env,
                exec_argv: request.exec_argv,
                inbox: FramedRead::new(child_read, JsonCodec::new()),
                outbox: FramedWrite::new(child_write, JsonCodec::new()),
                stdout: stdout_child,
                exit: exit.clone(),
            };
            let _ = self.children.send(child);

            Ok(SpawnedWorker {
                ipc_read: Box::new(parent_read),
                ipc_write: Box::new(parent_write),
                stdout: Some(Box::new(stdout_parent)),
                stderr: Some(Box::new(stderr_parent)),
                process: Box::new(FakeProcess { exit }),
            })
        }
    }

    struct Fixture {
        ctx: RunnerContext,
        events: mpsc::UnboundedReceiver<WorkerEvent>,
        children: mpsc::UnboundedReceiver<FakeChild>,
        spawner: Arc<FakeSpawner>,
        stdout: mpsc::UnboundedReceiver<String>,
    }

    impl Fixture {
        fn new(config: RunnerConfig) -> Self {
            Self::build(config, false)
        }

        fn build(config: RunnerConfig, fail: bool) -> Self {
            let config = config.with_exit_drain_timeout(Some(Duration::from_millis(200)));
            let (spawner, children) = FakeSpawner::new(fail);
            let (ctx, events) = RunnerContext::new(config, spawner.clone());
            let (stdout, stdout_rx) = OutputStream::channel();
            let (stderr, _) = OutputStream::channel();
            let mut parent_env = BTreeMap::new();
            parent_env.insert("PATH".to_string(), "/usr/bin".to_string());
            let ctx = ctx.with_streams(stdout, stderr).with_parent_env(parent_env);
            Self {
                ctx,
                events,
                children,
                spawner,
                stdout: stdout_rx,
            }
        }

        fn worker(&self, cid: &str) -> WorkerInstance {
            self.ctx.create_worker(
                WorkerAssignment::new(cid, "/project/wdio.conf.js")
                    .with_caps(json!({ "browserName": "chrome" }))
                    .with_specs(["/project/a.test.js"])
                    .with_retries(2),
            )
        }

        async fn child(&mut self) -> FakeChild {
            tokio::time::timeout(WAIT, self.children.recv())
                .await
                .expect("a process should be spawned")
                .unwrap()
        }

        async fn event(&mut self) -> WorkerEvent {
            tokio::time::timeout(WAIT, self.events.recv())
                .await
                .expect("an event should be emitted")
                .unwrap()
        }

        async fn message(&mut self) -> Envelope {
            match self.event().await {
                WorkerEvent::Message { envelope, .. } => envelope,
                other => panic!("expected a message, got {other:?}"),
            }
        }

        async fn assert_no_event(&mut self) {
            let next = tokio::time::timeout(Duration::from_millis(100), self.events.recv()).await;
            assert!(next.is_err(), "unexpected event: {next:?}");
        }
    }

    fn session_started(content: Value) -> Envelope {
        Envelope::new(Origin::Worker, name::SESSION_STARTED).with_content(content)
    }

    #[tokio::test]
    async fn command_waits_for_ready_and_clears_busy_on_finish() {
        let mut fx = Fixture::new(RunnerConfig::new());
        let worker = fx.worker("0-0");
        assert!(!worker.is_running());

        let dispatched = worker.dispatch(command::RUN, json!({ "failFast": false }), false);
        assert_eq!(dispatched, Dispatch::Queued);
        assert!(worker.is_busy());
        assert_eq!(worker.pid(), Some(4242));

        let mut child = fx.child().await;
        child.assert_no_frame().await;

        child.send(Envelope::ready()).await;
        let cmd = child.recv_command().await;
        assert_eq!(cmd.cid, "0-0");
        assert_eq!(cmd.command, "run");
        assert_eq!(cmd.config_file, PathBuf::from("/project/wdio.conf.js"));
        assert_eq!(cmd.args, json!({ "failFast": false }));
        assert_eq!(cmd.caps, json!({ "browserName": "chrome" }));
        assert_eq!(cmd.specs, vec!["/project/a.test.js"]);
        assert_eq!(cmd.retries, 2);
        assert!(fx.message().await.is(Origin::Worker, name::READY));
        assert!(worker.is_ready());
        assert!(worker.is_busy());

        child.send(Envelope::finished_command("run")).await;
        assert!(fx.message().await.is(Origin::Worker, name::FINISHED_COMMAND));
        assert!(!worker.is_busy());
        child.assert_no_frame().await;
    }

    #[tokio::test]
    async fn busy_worker_drops_commands_without_sending() {
        let mut fx = Fixture::new(RunnerConfig::new());
        let worker = fx.worker("0-0");

        assert_eq!(worker.dispatch("run", json!({}), false), Dispatch::Queued);
        assert_eq!(
            worker.dispatch("run", json!({}), false),
            Dispatch::Dropped(DropReason::Busy)
        );
        assert!(worker.is_busy());
        assert_eq!(fx.spawner.spawned(), 1);

        let mut child = fx.child().await;
        child.send(Envelope::ready()).await;
        assert_eq!(child.recv_command().await.command, "run");
        child.assert_no_frame().await;
    }

    #[tokio::test]
    async fn allow_listed_commands_pass_while_busy() {
        let mut fx = Fixture::new(RunnerConfig::new());
        let worker = fx.worker("0-0");

        worker.dispatch(command::RUN, json!({}), false);
        assert_eq!(
            worker.dispatch(command::WORKER_REQUEST, json!({ "cmd": "x" }), false),
            Dispatch::Queued
        );
        assert_eq!(
            worker.dispatch(command::END_SESSION, json!({}), false),
            Dispatch::Queued
        );

        let mut child = fx.child().await;
        child.send(Envelope::ready()).await;
        assert_eq!(child.recv_command().await.command, "run");
        assert_eq!(child.recv_command().await.command, "workerRequest");
        assert_eq!(child.recv_command().await.command, "endSession");
    }

    #[tokio::test]
    async fn session_gate_holds_commands_that_need_a_session() {
        let mut fx = Fixture::new(RunnerConfig::new());
        let worker = fx.worker("0-0");
        worker.dispatch(command::RUN, json!({}), true);

        let mut child = fx.child().await;
        child.send(Envelope::ready()).await;
        child.assert_no_frame().await;

        child
            .send(session_started(json!({
                "sessionId": "s-1",
                "capabilities": { "browserName": "chrome", "browserVersion": "128" },
                "hostname": "localhost",
                "port": 4444
            })))
            .await;
        child.recv_command().await;

        assert!(worker.is_session_established());
        assert_eq!(worker.session_id().as_deref(), Some("s-1"));
        assert_eq!(worker.capabilities()["browserVersion"], json!("128"));
        assert_eq!(worker.config_value("port"), Some(json!(4444)));
        assert!(!worker.is_multiremote());
    }

    #[tokio::test]
    async fn later_commands_carry_resolved_capabilities() {
        let mut fx = Fixture::new(RunnerConfig::new());
        let worker = fx.worker("0-0");
        worker.dispatch(command::RUN, json!({}), false);

        let mut child = fx.child().await;
        child.send(Envelope::ready()).await;
        child.recv_command().await;
        child
            .send(session_started(json!({
                "sessionId": "s-1",
                "capabilities": { "browserName": "chrome", "platformName": "linux" }
            })))
            .await;
        child.send(Envelope::finished_command("run")).await;
        for _ in 0..3 {
            fx.message().await;
        }

        worker.dispatch(command::END_SESSION, json!({}), false);
        let cmd = child.recv_command().await;
        assert_eq!(cmd.caps["platformName"], json!("linux"));
        assert_eq!(worker.requested_caps(), &json!({ "browserName": "chrome" }));
    }

    #[tokio::test]
    async fn multiremote_session_merges_fields_onto_the_instance() {
        let mut fx = Fixture::new(RunnerConfig::new());
        let worker = fx.worker("0-0");
        worker.start_process();

        let mut child = fx.child().await;
        child
            .send(session_started(json!({
                "sessionId": "mr",
                "isMultiremote": true,
                "instances": { "a": { "sessionId": "s-a" }, "b": { "sessionId": "s-b" } },
                "capabilities": { "a": {}, "b": {} },
                "protocol": "http"
            })))
            .await;
        fx.message().await;

        assert!(worker.is_multiremote());
        assert_eq!(worker.session_id().as_deref(), Some("mr"));
        assert_eq!(worker.instances().unwrap().len(), 2);
        assert_eq!(worker.session_field("protocol"), Some(json!("http")));
        assert_eq!(worker.config_value("protocol"), None);
    }

    #[tokio::test]
    async fn exit_reports_code_specs_and_unchanged_retries() {
        let mut fx = Fixture::new(RunnerConfig::new());
        let worker = fx.worker("0-3");
        worker.dispatch(command::RUN, json!({}), false);

        let child = fx.child().await;
        child.exit(1);

        match fx.event().await {
            WorkerEvent::Exit {
                cid,
                exit_code,
                specs,
                retries,
            } => {
                assert_eq!(cid, "0-3");
                assert_eq!(exit_code, Some(1));
                assert_eq!(specs, vec!["/project/a.test.js"]);
                assert_eq!(retries, 2);
            }
            other => panic!("expected exit, got {other:?}"),
        }
        assert!(worker.is_killed());
        assert!(!worker.is_busy());
        assert!(!worker.is_running());
    }

    #[tokio::test]
    async fn exit_is_terminal() {
        let mut fx = Fixture::new(RunnerConfig::new());
        let worker = fx.worker("0-0");
        worker.start_process();
        fx.child().await.exit(0);
        assert!(matches!(fx.event().await, WorkerEvent::Exit { .. }));

        assert_eq!(
            worker.dispatch(command::RUN, json!({}), false),
            Dispatch::Dropped(DropReason::Killed)
        );
        assert!(worker.start_process().is_none());
        assert_eq!(fx.spawner.spawned(), 1);
        fx.assert_no_event().await;
    }

    #[tokio::test]
    async fn messages_written_before_exit_are_emitted_first() {
        let mut fx = Fixture::new(RunnerConfig::new());
        let worker = fx.worker("0-0");
        worker.start_process();

        let mut child = fx.child().await;
        child
            .send(Envelope::reporter("suite:end", json!({ "title": "login" })))
            .await;
        child.exit(0);

        let envelope = fx.message().await;
        assert!(envelope.is(Origin::Reporter, "suite:end"));
        assert!(matches!(fx.event().await, WorkerEvent::Exit { .. }));
    }

    #[tokio::test]
    async fn spawn_failure_is_an_error_event() {
        let mut fx = Fixture::build(RunnerConfig::new(), true);
        let worker = fx.worker("0-0");

        assert_eq!(
            worker.dispatch(command::RUN, json!({}), false),
            Dispatch::Dropped(DropReason::SpawnFailed)
        );
        match fx.event().await {
            WorkerEvent::Error { cid, error } => {
                assert_eq!(cid, "0-0");
                assert!(matches!(error, WorkerError::Spawn(_)));
            }
            other => panic!("expected error, got {other:?}"),
        }
        assert!(worker.is_killed());
        assert!(!worker.is_busy());
        fx.assert_no_event().await;
    }

    #[tokio::test]
    async fn silent_worker_times_out_and_is_terminated() {
        let mut fx =
            Fixture::new(RunnerConfig::new().with_ready_timeout(Some(Duration::from_millis(50))));
        let worker = fx.worker("0-0");
        worker.dispatch(command::RUN, json!({}), false);
        let _child = fx.child().await;

        match fx.event().await {
            WorkerEvent::Error { error, .. } => {
                assert!(matches!(error, WorkerError::ReadyTimeout(_)));
            }
            other => panic!("expected timeout error, got {other:?}"),
        }
        match fx.event().await {
            WorkerEvent::Exit { exit_code, .. } => assert_eq!(exit_code, None),
            other => panic!("expected exit, got {other:?}"),
        }
        assert!(worker.is_killed());
    }

    #[tokio::test]
    async fn terminate_kills_the_process() {
        let mut fx = Fixture::new(RunnerConfig::new());
        let worker = fx.worker("0-0");
        worker.start_process();
        let _child = fx.child().await;

        let as_pool_sees_it: &dyn Worker = &worker;
        as_pool_sees_it.terminate();
        assert!(matches!(
            fx.event().await,
            WorkerEvent::Exit { exit_code: None, .. }
        ));
        assert!(as_pool_sees_it.is_killed());
    }

    #[tokio::test]
    async fn start_process_is_idempotent() {
        let mut fx = Fixture::new(RunnerConfig::new());
        let worker = fx.worker("0-0");
        let first = worker.start_process().unwrap();
        let second = worker.start_process().unwrap();
        assert!(first.same_process(&second));
        assert_eq!(fx.spawner.spawned(), 1);
        fx.child().await;
    }

    #[tokio::test]
    async fn child_environment_carries_identity() {
        let dir = tempfile::tempdir().unwrap();
        let config = RunnerConfig::new()
            .with_output_dir(dir.path())
            .with_runner_env("WDIO_WORKER_ID", "spoofed");
        let mut fx = Fixture::new(config);
        let worker = fx.ctx.create_worker(
            WorkerAssignment::new("1-0", "wdio.conf.js").with_exec_argv(["--inspect"]),
        );
        worker.start_process();

        let child = fx.child().await;
        assert_eq!(child.env["WDIO_WORKER_ID"], "1-0");
        assert_eq!(child.env["PATH"], "/usr/bin");
        assert_eq!(
            PathBuf::from(&child.env["WDIO_LOG_PATH"]),
            dir.path().join("wdio-1-0.log")
        );
        assert_eq!(child.exec_argv, vec!["--inspect"]);
    }

    #[tokio::test]
    async fn stdout_is_prefixed_and_streamed() {
        let mut fx = Fixture::new(RunnerConfig::new());
        let worker = fx.worker("0-5");
        worker.start_process();
        let mut child = fx.child().await;

        child.write_stdout("hello\nDebugger attached.\nworld\n").await;
        let first = tokio::time::timeout(WAIT, fx.stdout.recv()).await.unwrap();
        let second = tokio::time::timeout(WAIT, fx.stdout.recv()).await.unwrap();
        assert_eq!(first.as_deref(), Some("[0-5] hello"));
        assert_eq!(second.as_deref(), Some("[0-5] world"));
        assert!(worker.logs().is_empty());
    }

    #[tokio::test]
    async fn grouped_mode_collects_stdout() {
        let mut fx = Fixture::new(RunnerConfig::new().with_grouped_logs(true));
        let worker = fx.worker("0-1");
        worker.start_process();
        let mut child = fx.child().await;

        child.write_stdout("line one\nline two\n").await;
        child.exit(0);
        assert!(matches!(fx.event().await, WorkerEvent::Exit { .. }));

        // Complete as soon as `Exit` is seen.
        assert_eq!(worker.take_logs(), vec!["[0-1] line one", "[0-1] line two"]);
        assert!(worker.logs().is_empty());
        assert!(fx.stdout.try_recv().is_err());
    }

    #[tokio::test]
    async fn debug_sessions_are_granted_one_worker_at_a_time() {
        let mut fx = Fixture::new(RunnerConfig::new());
        let first = fx.worker("0-0");
        let second = fx.worker("0-1");
        first.start_process();
        let mut child_a = fx.child().await;
        second.start_process();
        let mut child_b = fx.child().await;
        let queue = fx.ctx.repl_queue().clone();

        child_a.send(Envelope::debug_request(Map::new())).await;
        let granted = fx.event().await;
        assert_eq!(granted.cid(), "0-0");
        assert_eq!(child_a.recv_debugger().await, Envelope::debug_start());

        child_b.send(Envelope::debug_request(Map::new())).await;
        fx.assert_no_event().await;
        child_b.assert_no_frame().await;
        assert_eq!(queue.len(), 1);

        let repl = queue.running_repl().unwrap();
        assert_eq!(repl.cid(), "0-0");
        assert_eq!(repl.config().prompt, "[0-0] \u{203a} ");
        let eval = tokio::spawn({
            let repl = repl.clone();
            async move { repl.eval("browser.getUrl()").await }
        });
        assert_eq!(
            child_a.recv_debugger().await,
            Envelope::debug_eval("browser.getUrl()")
        );
        child_a
            .send(Envelope::debug_result(&EvalOutcome::success(json!("https://example.org"))).unwrap())
            .await;
        assert_eq!(eval.await.unwrap().unwrap(), json!("https://example.org"));
        assert!(fx.message().await.is(Origin::Debugger, name::RESULT));

        repl.finish();
        assert_eq!(child_a.recv_debugger().await, Envelope::debug_stop());
        match fx.event().await {
            WorkerEvent::Message { cid, envelope } => {
                assert_eq!(cid, "0-0");
                assert_eq!(envelope, Envelope::debug_stop());
            }
            other => panic!("expected stop, got {other:?}"),
        }
        let granted = fx.event().await;
        assert_eq!(granted.cid(), "0-1");
        assert_eq!(child_b.recv_debugger().await, Envelope::debug_start());
    }

    #[tokio::test]
    async fn results_from_other_workers_are_not_routed() {
        let mut fx = Fixture::new(RunnerConfig::new());
        let first = fx.worker("0-0");
        let second = fx.worker("0-1");
        first.start_process();
        let mut child_a = fx.child().await;
        second.start_process();
        let mut child_b = fx.child().await;

        child_a.send(Envelope::debug_request(Map::new())).await;
        fx.event().await;
        child_a.recv_debugger().await;

        let repl = fx.ctx.repl_queue().running_repl().unwrap();
        let eval = tokio::spawn({
            let repl = repl.clone();
            async move { repl.eval("1").await }
        });
        child_a.recv_debugger().await;

        child_b
            .send(Envelope::debug_result(&EvalOutcome::success(json!("wrong"))).unwrap())
            .await;
        assert_eq!(fx.event().await.cid(), "0-1");
        assert!(repl.is_command_running());

        child_a
            .send(Envelope::debug_result(&EvalOutcome::success(json!(1))).unwrap())
            .await;
        assert_eq!(eval.await.unwrap().unwrap(), json!(1));
    }

    #[tokio::test]
    async fn exit_of_the_session_holder_advances_the_queue() {
        let mut fx = Fixture::new(RunnerConfig::new());
        let first = fx.worker("0-0");
        let second = fx.worker("0-1");
        first.start_process();
        let mut child_a = fx.child().await;
        second.start_process();
        let mut child_b = fx.child().await;

        child_a.send(Envelope::debug_request(Map::new())).await;
        fx.event().await;
        child_b.send(Envelope::debug_request(Map::new())).await;
        child_a.recv_debugger().await;
        fx.assert_no_event().await;

        child_a.exit(1);
        // stop for 0-0, start granted to 0-1, then the exit of 0-0.
        let stop = fx.event().await;
        assert_eq!(stop.cid(), "0-0");
        let granted = fx.event().await;
        assert_eq!(granted.cid(), "0-1");
        assert!(matches!(fx.event().await, WorkerEvent::Exit { .. }));
        assert_eq!(child_b.recv_debugger().await, Envelope::debug_start());
    }

    #[tokio::test]
    async fn malformed_payloads_are_still_emitted() {
        let mut fx = Fixture::new(RunnerConfig::new());
        let worker = fx.worker("0-0");
        worker.start_process();
        let mut child = fx.child().await;

        let bad = Envelope::new(Origin::Worker, name::SESSION_STARTED).with_content(json!(42));
        child.send(bad.clone()).await;
        assert_eq!(fx.message().await, bad);
        assert!(worker.is_session_established());
        assert_eq!(worker.session_id(), None);
    }

    #[tokio::test]
    async fn unreadable_session_still_releases_waiting_commands() {
        let mut fx = Fixture::new(RunnerConfig::new().with_ready_timeout(None));
        let worker = fx.worker("0-0");
        assert_eq!(
            worker.dispatch(command::RUN, json!({}), true),
            Dispatch::Queued
        );
        let mut child = fx.child().await;
        child.send(Envelope::ready()).await;
        child
            .send(Envelope::new(Origin::Worker, name::SESSION_STARTED))
            .await;

        assert_eq!(child.recv_command().await.command, command::RUN);
        assert!(worker.is_session_established());
    }

    #[tokio::test]
    async fn commands_are_dropped_while_the_exit_is_drained() {
        let mut fx = Fixture::new(RunnerConfig::new());
        let worker = fx.worker("0-0");
        let link = worker.start_process().unwrap();
        let child = fx.child().await;

        // The process is gone but its IPC channel is still open.
        child.exit.send_replace(Some(Some(0)));
        tokio::time::timeout(WAIT, link.exited()).await.unwrap();

        assert_eq!(
            worker.dispatch(command::RUN, json!({}), false),
            Dispatch::Dropped(DropReason::Killed)
        );
        assert!(!worker.is_busy());

        drop(child);
        assert!(matches!(fx.event().await, WorkerEvent::Exit { .. }));
        assert_eq!(fx.spawner.spawned(), 1);
    }
}
