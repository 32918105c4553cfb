//! IPC bridge between the orchestrator and its worker processes.
//!
//! - **protocol**: Message types (Envelope, WorkerCommand, debugger payloads)
//! - **codec**: Length-delimited JSON framing for AsyncRead/AsyncWrite
//! - **transport**: The socket pair handed to each worker on a fixed fd

pub mod codec;
pub mod protocol;
pub mod transport;
