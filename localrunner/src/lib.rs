//! localrunner: runs test workers as local child processes.
//!
//! The orchestrator side creates one [`WorkerInstance`] per worker id through a
//! [`RunnerContext`], dispatches commands to it and consumes [`WorkerEvent`]s.
//! The worker side implements [`CommandHandler`] and calls [`run_worker`].

mod gate;

pub mod bridge;
pub mod config;
pub mod context;
pub mod instance;
pub mod logging;
pub mod output;
pub mod repl;
pub mod spawner;
pub mod worker;

pub use bridge::protocol::{
    Envelope, EvalError, EvalOutcome, Inbound, Origin, SessionStarted, ToWorker, WorkerCommand,
};
pub use config::{RunnerConfig, worker_env};
pub use context::RunnerContext;
pub use instance::{
    Dispatch, DropReason, Worker, WorkerAssignment, WorkerError, WorkerEvent, WorkerInstance,
};
pub use logging::init_tracing;
pub use output::{LogAggregator, OutputStream};
pub use repl::{ReplConfig, ReplError, ReplQueue, ReplTerminal, RunnerRepl};
pub use spawner::{CommandSpawner, SpawnError, SpawnRequest, SpawnedWorker, WorkerSpawner};
pub use worker::{CommandHandler, WorkerSender, run_worker, serve};
