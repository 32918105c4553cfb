//! Wire protocol types for orchestrator-worker communication.
//!
//! One channel per worker carries two kinds of frames:
//! - **Parent → worker**: [`WorkerCommand`] (run a unit of work) and debugger
//!   [`Envelope`]s (`start`, `eval`, `stop`), wrapped in [`ToWorker`].
//! - **Worker → parent**: [`Envelope`]s tagged with an [`Origin`] and a name.
//!
//! Inbound envelopes are classified into the closed [`Inbound`] type so that
//! every message kind the orchestrator reacts to is matched exhaustively.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Commands that may be delivered while another command is still in flight.
///
/// `workerRequest` carries synchronous REPL pass-through, `endSession` tears
/// the session down gracefully.
pub const BUSY_ALLOWED_COMMANDS: &[&str] = &[command::WORKER_REQUEST, command::END_SESSION];

/// Well-known command names sent by the pool manager.
pub mod command {
    pub const RUN: &str = "run";
    pub const END_SESSION: &str = "endSession";
    pub const WORKER_REQUEST: &str = "workerRequest";
}

/// Well-known envelope names.
pub mod name {
    pub const READY: &str = "ready";
    pub const SESSION_STARTED: &str = "sessionStarted";
    pub const FINISHED_COMMAND: &str = "finishedCommand";
    pub const START: &str = "start";
    pub const EVAL: &str = "eval";
    pub const RESULT: &str = "result";
    pub const STOP: &str = "stop";
}

/// Subsystem an envelope belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    /// Worker lifecycle (`ready`, `sessionStarted`, `finishedCommand`, ...).
    Worker,
    /// Interactive debug session control.
    Debugger,
    /// Reporter events fanned out to the reporter sink.
    Reporter,
}

/// Message unit exchanged over the IPC channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub origin: Origin,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl Envelope {
    pub fn new(origin: Origin, name: impl Into<String>) -> Self {
        Self {
            origin,
            name: name.into(),
            content: None,
            params: None,
        }
    }

    pub fn with_content(mut self, content: Value) -> Self {
        self.content = Some(content);
        self
    }

    pub fn with_params(mut self, params: Value) -> Self {
        self.params = Some(params);
        self
    }

    pub fn ready() -> Self {
        Self::new(Origin::Worker, name::READY)
    }

    pub fn finished_command(command: &str) -> Self {
        Self::new(Origin::Worker, name::FINISHED_COMMAND)
            .with_content(serde_json::json!({ "command": command }))
    }

    pub fn session_started(session: &SessionStarted) -> Result<Self, serde_json::Error> {
        Ok(Self::new(Origin::Worker, name::SESSION_STARTED)
            .with_content(serde_json::to_value(session)?))
    }

    pub fn reporter(name: impl Into<String>, content: Value) -> Self {
        Self::new(Origin::Reporter, name).with_content(content)
    }

    /// Worker asks the orchestrator for the terminal.
    pub fn debug_request(params: Map<String, Value>) -> Self {
        Self::new(Origin::Debugger, name::START).with_params(Value::Object(params))
    }

    /// Orchestrator tells the worker its session has been granted.
    pub fn debug_start() -> Self {
        Self::new(Origin::Debugger, name::START)
    }

    pub fn debug_eval(cmd: &str) -> Self {
        Self::new(Origin::Debugger, name::EVAL).with_content(serde_json::json!({ "cmd": cmd }))
    }

    pub fn debug_result(outcome: &EvalOutcome) -> Result<Self, serde_json::Error> {
        Ok(Self::new(Origin::Debugger, name::RESULT).with_params(serde_json::to_value(outcome)?))
    }

    pub fn debug_stop() -> Self {
        Self::new(Origin::Debugger, name::STOP)
    }

    pub fn is(&self, origin: Origin, name: &str) -> bool {
        self.origin == origin && self.name == name
    }

    /// Map `(origin, name)` onto the messages the orchestrator reacts to.
    ///
    /// Unknown pairs classify as [`Inbound::Passthrough`]; a known pair with a
    /// payload of the wrong shape is a [`ProtocolError`].
    pub fn classify(&self) -> Result<Inbound, ProtocolError> {
        let inbound = match (self.origin, self.name.as_str()) {
            (Origin::Worker, name::FINISHED_COMMAND) => Inbound::FinishedCommand,
            (Origin::Worker, name::READY) => Inbound::Ready,
            (Origin::Worker, name::SESSION_STARTED) => {
                let content = self
                    .content
                    .clone()
                    .ok_or(ProtocolError::MissingPayload(name::SESSION_STARTED))?;
                let session = serde_json::from_value(content)
                    .map_err(|e| ProtocolError::InvalidPayload(name::SESSION_STARTED, e))?;
                Inbound::SessionStarted(session)
            }
            (Origin::Debugger, name::START) => match &self.params {
                None | Some(Value::Null) => Inbound::DebugStart(Map::new()),
                Some(Value::Object(params)) => Inbound::DebugStart(params.clone()),
                Some(_) => return Err(ProtocolError::NotAnObject(name::START)),
            },
            (Origin::Debugger, name::RESULT) => {
                let params = self.params.clone().unwrap_or(Value::Null);
                let outcome = serde_json::from_value(params)
                    .map_err(|e| ProtocolError::InvalidPayload(name::RESULT, e))?;
                Inbound::DebugResult(outcome)
            }
            _ => Inbound::Passthrough,
        };
        Ok(inbound)
    }
}

/// Inbound envelopes the orchestrator acts on, beyond re-emitting them.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    FinishedCommand,
    Ready,
    SessionStarted(SessionStarted),
    /// Worker requests an interactive session; carries the session options.
    DebugStart(Map<String, Value>),
    DebugResult(EvalOutcome),
    /// No orchestrator-side effect; only fanned out.
    Passthrough,
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("`{0}` message has no payload")]
    MissingPayload(&'static str),
    #[error("`{0}` message has an invalid payload: {1}")]
    InvalidPayload(&'static str, #[source] serde_json::Error),
    #[error("`{0}` message params must be an object")]
    NotAnObject(&'static str),
}

/// Payload of `worker/sessionStarted`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStarted {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capabilities: Option<Value>,
    #[serde(default)]
    pub is_multiremote: bool,
    /// Per-browser sessions of a multiremote run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instances: Option<Map<String, Value>>,
    /// Connection details (hostname, port, protocol, ...).
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl SessionStarted {
    /// All payload fields as a flat JSON object.
    pub fn to_fields(&self) -> Map<String, Value> {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        }
    }
}

/// Payload of `debugger/result`: either a result or an `{error, message, stack}` triple.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EvalOutcome {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

impl EvalOutcome {
    pub fn success(result: Value) -> Self {
        Self {
            result: Some(result),
            ..Self::default()
        }
    }

    pub fn failure(error: &EvalError) -> Self {
        Self {
            result: None,
            error: Some(Value::Bool(true)),
            message: Some(error.message.clone()),
            stack: error.stack.clone(),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.as_ref().is_some_and(is_truthy)
    }

    /// Rebuild the structured error the worker reported, if any.
    pub fn into_result(self) -> Result<Value, EvalError> {
        if self.is_error() {
            return Err(EvalError {
                message: self.message.unwrap_or_default(),
                stack: self.stack,
            });
        }
        Ok(self.result.unwrap_or(Value::Null))
    }
}

/// Error raised while evaluating a debug command inside the worker.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct EvalError {
    pub message: String,
    pub stack: Option<String>,
}

impl EvalError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stack: None,
        }
    }

    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// Unit of work sent to a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerCommand {
    pub cid: String,
    pub command: String,
    pub config_file: PathBuf,
    pub args: Value,
    /// Best-known capabilities (resolved ones once a session exists).
    pub caps: Value,
    pub specs: Vec<String>,
    pub retries: u32,
}

/// Frames sent from orchestrator to worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ToWorker {
    Command(WorkerCommand),
    Debugger(Envelope),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn inbound(value: Value) -> Inbound {
        let envelope: Envelope = serde_json::from_value(value).unwrap();
        envelope.classify().unwrap()
    }

    #[test]
    fn worker_command_serializes() {
        let cmd = ToWorker::Command(WorkerCommand {
            cid: "0-0".to_string(),
            command: command::RUN.to_string(),
            config_file: PathBuf::from("/project/wdio.conf.js"),
            args: json!({ "failFast": false }),
            caps: json!({ "browserName": "chrome" }),
            specs: vec!["/project/a.test.js".to_string()],
            retries: 1,
        });
        insta::assert_json_snapshot!(cmd, @r#"
        {
          "cid": "0-0",
          "command": "run",
          "configFile": "/project/wdio.conf.js",
          "args": {
            "failFast": false
          },
          "caps": {
            "browserName": "chrome"
          },
          "specs": [
            "/project/a.test.js"
          ],
          "retries": 1
        }
        "#);
    }

    #[test]
    fn debug_eval_serializes() {
        insta::assert_json_snapshot!(Envelope::debug_eval("browser.getTitle()"), @r#"
        {
          "origin": "debugger",
          "name": "eval",
          "content": {
            "cmd": "browser.getTitle()"
          }
        }
        "#);
    }

    #[test]
    fn to_worker_distinguishes_commands_from_envelopes() {
        let frame: ToWorker = serde_json::from_value(json!({
            "cid": "0-1",
            "command": "endSession",
            "configFile": "wdio.conf.js",
            "args": {},
            "caps": {},
            "specs": [],
            "retries": 0
        }))
        .unwrap();
        assert!(matches!(frame, ToWorker::Command(ref c) if c.command == "endSession"));

        let frame: ToWorker =
            serde_json::from_value(json!({ "origin": "debugger", "name": "stop" })).unwrap();
        assert_eq!(frame, ToWorker::Debugger(Envelope::debug_stop()));
    }

    #[test]
    fn classifies_lifecycle_messages() {
        assert_eq!(
            inbound(json!({ "origin": "worker", "name": "ready" })),
            Inbound::Ready
        );
        assert_eq!(
            inbound(json!({ "origin": "worker", "name": "finishedCommand", "content": {} })),
            Inbound::FinishedCommand
        );
    }

    #[test]
    fn lifecycle_names_from_other_origins_pass_through() {
        assert_eq!(
            inbound(json!({ "origin": "reporter", "name": "ready" })),
            Inbound::Passthrough
        );
        assert_eq!(
            inbound(json!({ "origin": "reporter", "name": "suite:start", "content": {} })),
            Inbound::Passthrough
        );
    }

    #[test]
    fn classifies_session_started_with_extra_fields() {
        let msg = inbound(json!({
            "origin": "worker",
            "name": "sessionStarted",
            "content": {
                "sessionId": "abc",
                "capabilities": { "browserName": "firefox" },
                "hostname": "localhost",
                "port": 4444
            }
        }));
        let Inbound::SessionStarted(session) = msg else {
            panic!("expected sessionStarted, got {msg:?}");
        };
        assert_eq!(session.session_id.as_deref(), Some("abc"));
        assert!(!session.is_multiremote);
        assert_eq!(session.extra.get("port"), Some(&json!(4444)));
        assert_eq!(session.to_fields().get("sessionId"), Some(&json!("abc")));
    }

    #[test]
    fn session_started_without_content_is_an_error() {
        let envelope = Envelope::new(Origin::Worker, name::SESSION_STARTED);
        assert!(matches!(
            envelope.classify(),
            Err(ProtocolError::MissingPayload(_))
        ));
    }

    #[test]
    fn debug_start_params_default_to_empty() {
        assert_eq!(
            inbound(json!({ "origin": "debugger", "name": "start" })),
            Inbound::DebugStart(Map::new())
        );
        let Inbound::DebugStart(params) = inbound(json!({
            "origin": "debugger",
            "name": "start",
            "params": { "prompt": "> " }
        })) else {
            panic!("expected debug start");
        };
        assert_eq!(params.get("prompt"), Some(&json!("> ")));
    }

    #[test]
    fn eval_error_is_reconstructed() {
        let Inbound::DebugResult(outcome) = inbound(json!({
            "origin": "debugger",
            "name": "result",
            "params": { "error": true, "message": "boom", "stack": "Error: boom\n    at <anonymous>" }
        })) else {
            panic!("expected debug result");
        };
        let err = outcome.into_result().unwrap_err();
        assert_eq!(err.message, "boom");
        assert_eq!(err.stack.as_deref(), Some("Error: boom\n    at <anonymous>"));
    }

    #[test]
    fn falsy_error_field_is_a_success() {
        let outcome: EvalOutcome =
            serde_json::from_value(json!({ "error": "", "result": 42 })).unwrap();
        assert_eq!(outcome.into_result().unwrap(), json!(42));
    }
}
