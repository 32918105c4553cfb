//! Interactive debug sessions.
//!
//! Workers may ask for the terminal at any time, but only one REPL can own it.
//! [`ReplQueue`] grants it in arrival order; [`RunnerRepl`] drives one granted
//! session against its worker process.

pub mod queue;
pub mod session;

pub use queue::ReplQueue;
pub use session::{ReplConfig, ReplError, ReplTerminal, RunnerRepl};
