//! Minimal worker: reports a session per run, prints each spec and echoes
//! debug input back. Used to exercise the runner end to end.

use std::process;
use std::sync::Arc;
use std::sync::atomic::{AtomicI32, Ordering};

use serde_json::{Map, Value, json};

use localrunner::bridge::protocol::command;
use localrunner::{CommandHandler, EvalError, SessionStarted, WorkerCommand, WorkerSender};

#[derive(Default)]
struct EchoWorker {
    exit_code: AtomicI32,
}

#[async_trait::async_trait]
impl CommandHandler for EchoWorker {
    async fn run_command(&self, cmd: WorkerCommand, sender: WorkerSender) -> anyhow::Result<()> {
        match cmd.command.as_str() {
            command::RUN => {
                sender.session_started(&SessionStarted {
                    session_id: Some(format!("echo-{}", cmd.cid)),
                    capabilities: Some(cmd.caps.clone()),
                    ..Default::default()
                })?;
                for spec in &cmd.specs {
                    println!("running {spec}");
                }
                sender.report("runner:end", json!({ "cid": cmd.cid, "specs": cmd.specs }))?;

                if let Some(code) = cmd.args.get("exitCode").and_then(Value::as_i64) {
                    self.exit_code.store(i32::try_from(code)?, Ordering::SeqCst);
                }
                if cmd.args.get("debug").and_then(Value::as_bool) == Some(true) {
                    let mut params = Map::new();
                    params.insert("prompt".to_string(), json!(format!("[{}] echo> ", cmd.cid)));
                    sender.request_debug(params)?;
                }
                Ok(())
            }
            command::END_SESSION => {
                eprintln!("ending session of {}", cmd.cid);
                Ok(())
            }
            other => anyhow::bail!("unknown command: {other}"),
        }
    }

    async fn eval(&self, cmd: &str) -> Result<Value, EvalError> {
        match cmd.strip_prefix("throw ") {
            Some(message) => {
                Err(EvalError::new(message).with_stack(format!("Error: {message}\n    at <repl>")))
            }
            None => Ok(Value::String(cmd.to_string())),
        }
    }

    fn debug_started(&self) {
        tracing::info!("Debug session started");
    }

    fn debug_stopped(&self) {
        tracing::info!("Debug session stopped");
    }
}

#[tokio::main]
async fn main() {
    localrunner::init_tracing();

    let worker = Arc::new(EchoWorker::default());
    if let Err(e) = localrunner::run_worker(Arc::clone(&worker)).await {
        eprintln!("error: {e}");
        process::exit(1);
    }
    process::exit(worker.exit_code.load(Ordering::SeqCst));
}
