//! Composition root shared by every worker of one orchestrator.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::config::RunnerConfig;
use crate::instance::{WorkerAssignment, WorkerEvent, WorkerInstance};
use crate::output::OutputStream;
use crate::repl::{ReplQueue, ReplTerminal};
use crate::spawner::WorkerSpawner;

/// Everything a [`WorkerInstance`] needs from its orchestrator.
///
/// Cheap to clone; clones share the queue, streams and event channel. Two
/// contexts share nothing, so independent orchestrators can run side by side.
#[derive(Clone)]
pub struct RunnerContext {
    pub(crate) config: Arc<RunnerConfig>,
    pub(crate) spawner: Arc<dyn WorkerSpawner>,
    pub(crate) repl_queue: ReplQueue,
    pub(crate) stdout: OutputStream,
    pub(crate) stderr: OutputStream,
    pub(crate) terminal: Option<ReplTerminal>,
    pub(crate) events: mpsc::UnboundedSender<WorkerEvent>,
    parent_env: Option<Arc<BTreeMap<String, String>>>,
}

impl RunnerContext {
    /// Create a context writing worker output to the process's own
    /// stdout/stderr. Must be called within a tokio runtime.
    ///
    /// The receiver yields every [`WorkerEvent`] of every worker created
    /// from this context.
    pub fn new(
        config: RunnerConfig,
        spawner: Arc<dyn WorkerSpawner>,
    ) -> (Self, mpsc::UnboundedReceiver<WorkerEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let ctx = Self {
            config: Arc::new(config),
            spawner,
            repl_queue: ReplQueue::new(),
            stdout: OutputStream::stdout(),
            stderr: OutputStream::stderr(),
            terminal: None,
            events,
            parent_env: None,
        };
        (ctx, rx)
    }

    pub fn with_streams(mut self, stdout: OutputStream, stderr: OutputStream) -> Self {
        self.stdout = stdout;
        self.stderr = stderr;
        self
    }

    /// Drive granted debug sessions interactively on `terminal`.
    ///
    /// Without a terminal, a granted session is only started; the embedder
    /// evaluates through [`ReplQueue::running_repl`].
    pub fn with_terminal(mut self, terminal: ReplTerminal) -> Self {
        self.terminal = Some(terminal);
        self
    }

    /// Use `env` instead of the process environment as the base of worker
    /// environments.
    pub fn with_parent_env(mut self, env: BTreeMap<String, String>) -> Self {
        self.parent_env = Some(Arc::new(env));
        self
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    pub fn repl_queue(&self) -> &ReplQueue {
        &self.repl_queue
    }

    pub(crate) fn parent_env(&self) -> Vec<(String, String)> {
        match &self.parent_env {
            Some(env) => env
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            None => std::env::vars().collect(),
        }
    }

    pub(crate) fn emit(&self, event: WorkerEvent) {
        if self.events.send(event).is_err() {
            tracing::trace!("Worker event receiver dropped");
        }
    }

    pub fn create_worker(&self, assignment: WorkerAssignment) -> WorkerInstance {
        WorkerInstance::new(assignment, self.clone())
    }
}
