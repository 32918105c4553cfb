//! FIFO mutual exclusion over debug sessions.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::bridge::protocol::Envelope;
use crate::repl::session::{ReplConfig, RunnerRepl};
use crate::spawner::ChildLink;

/// Invoked once when an entry is granted the terminal.
pub type GrantedCallback = Box<dyn FnOnce(RunnerRepl) + Send>;
/// Invoked for every event the session reports while it holds the terminal.
pub type OutputCallback = Arc<dyn Fn(Envelope) + Send + Sync>;

struct ReplEntry {
    child: ChildLink,
    config: ReplConfig,
    on_granted: GrantedCallback,
    on_output: OutputCallback,
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<ReplEntry>,
    running: Option<RunnerRepl>,
    next_id: u64,
}

/// Shared queue of debug session requests.
///
/// Cloning yields another handle to the same queue. Each orchestrator owns its
/// own queue, so independent orchestrators never contend.
#[derive(Clone, Default)]
pub struct ReplQueue {
    state: Arc<Mutex<QueueState>>,
}

impl fmt::Debug for ReplQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("ReplQueue")
            .field("pending", &state.pending.len())
            .field("running", &state.running.as_ref().map(RunnerRepl::cid))
            .finish()
    }
}

impl ReplQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append a session request. Nothing starts until [`next`](Self::next).
    pub fn add<G, O>(&self, child: ChildLink, config: ReplConfig, on_granted: G, on_output: O)
    where
        G: FnOnce(RunnerRepl) + Send + 'static,
        O: Fn(Envelope) + Send + Sync + 'static,
    {
        let mut state = self.lock();
        tracing::debug!(
            cid = %child.cid(),
            queued = state.pending.len() + 1,
            "Queued debug session request"
        );
        state.pending.push_back(ReplEntry {
            child,
            config,
            on_granted: Box::new(on_granted),
            on_output: Arc::new(on_output),
        });
    }

    /// Grant the terminal to the head of the queue if it is free.
    ///
    /// Returns `true` if a session was granted. Requests from workers that
    /// exited while queued are discarded.
    pub fn next(&self) -> bool {
        let (repl, on_granted) = {
            let mut state = self.lock();
            if state.running.is_some() {
                return false;
            }
            loop {
                let Some(entry) = state.pending.pop_front() else {
                    return false;
                };
                if entry.child.is_exited() {
                    tracing::debug!(cid = %entry.child.cid(), "Discarding debug request of exited worker");
                    continue;
                }
                state.next_id += 1;
                let repl = RunnerRepl::new(
                    state.next_id,
                    entry.child,
                    entry.config,
                    entry.on_output,
                    self.clone(),
                );
                state.running = Some(repl.clone());
                break (repl, entry.on_granted);
            }
        };
        tracing::info!(cid = %repl.cid(), repl_id = repl.id(), "Debug session granted");
        on_granted(repl);
        true
    }

    pub fn is_running(&self) -> bool {
        self.lock().running.is_some()
    }

    pub fn running_repl(&self) -> Option<RunnerRepl> {
        self.lock().running.clone()
    }

    /// Number of requests waiting behind the running session.
    pub fn len(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().pending.is_empty()
    }

    /// Clear the running slot if `repl_id` holds it, then advance.
    pub(crate) fn release(&self, repl_id: u64) {
        {
            let mut state = self.lock();
            match &state.running {
                Some(repl) if repl.id() == repl_id => state.running = None,
                _ => return,
            }
        }
        tracing::debug!(repl_id, "Debug session released");
        self.next();
    }
}
