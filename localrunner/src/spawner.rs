//! Worker process spawning.
//!
//! [`WorkerSpawner`] is the seam between a [`WorkerInstance`](crate::WorkerInstance)
//! and the OS: the instance asks for a process with a given environment and
//! gets back the IPC halves, the piped output streams and a [`WorkerProcess`]
//! handle to supervise. [`CommandSpawner`] is the real implementation; tests
//! substitute in-memory fakes.

use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use nix::errno::Errno;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::bridge::protocol::ToWorker;
use crate::bridge::transport::IpcPair;

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

#[derive(Debug, Clone)]
pub struct SpawnRequest {
    pub cid: String,
    /// Complete environment of the new process.
    pub env: BTreeMap<String, String>,
    /// Runtime flags placed before the worker entry point.
    pub exec_argv: Vec<String>,
}

pub struct SpawnedWorker {
    pub ipc_read: BoxedReader,
    pub ipc_write: BoxedWriter,
    pub stdout: Option<BoxedReader>,
    pub stderr: Option<BoxedReader>,
    pub process: Box<dyn WorkerProcess>,
}

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("failed to spawn process: {0}")]
    Spawn(#[from] io::Error),
    #[error("failed to set up ipc channel: {0}")]
    Ipc(#[source] io::Error),
    #[error("spawn failed: {0}")]
    Other(String),
}

/// Extension point for different worker spawn strategies.
pub trait WorkerSpawner: Send + Sync {
    fn spawn(&self, request: SpawnRequest) -> Result<SpawnedWorker, SpawnError>;
}

/// A spawned worker process.
#[async_trait]
pub trait WorkerProcess: Send {
    fn id(&self) -> Option<u32>;

    /// Ask the process to stop. A process that already exited is not an error.
    fn terminate(&mut self) -> io::Result<()>;

    /// Wait for the process to exit. `None` means it was killed by a signal.
    ///
    /// Must be cancel safe; it is polled inside `select!`.
    async fn wait(&mut self) -> io::Result<Option<i32>>;
}

/// Spawns `program [exec_argv...] [args...]` with the IPC socket at fd 3.
#[derive(Debug, Clone)]
pub struct CommandSpawner {
    program: PathBuf,
    args: Vec<String>,
    cwd: Option<PathBuf>,
}

impl CommandSpawner {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }
}

impl WorkerSpawner for CommandSpawner {
    fn spawn(&self, request: SpawnRequest) -> Result<SpawnedWorker, SpawnError> {
        let ipc = IpcPair::new().map_err(SpawnError::Ipc)?;

        let mut command = Command::new(&self.program);
        command
            .args(&request.exec_argv)
            .args(&self.args)
            .env_clear()
            .envs(&request.env)
            .stdin(Stdio::inherit())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &self.cwd {
            command.current_dir(cwd);
        }
        ipc.install(&mut command);

        tracing::info!(
            cid = %request.cid,
            program = %self.program.display(),
            "Spawning worker process"
        );
        let mut child = command.spawn()?;
        let (ipc_read, ipc_write) = ipc.into_parent().map_err(SpawnError::Ipc)?.into_split();

        let stdout = child
            .stdout
            .take()
            .map(|s| Box::new(s) as BoxedReader);
        let stderr = child
            .stderr
            .take()
            .map(|s| Box::new(s) as BoxedReader);

        Ok(SpawnedWorker {
            ipc_read: Box::new(ipc_read),
            ipc_write: Box::new(ipc_write),
            stdout,
            stderr,
            process: Box::new(ChildProcess(child)),
        })
    }
}

struct ChildProcess(Child);

#[async_trait]
impl WorkerProcess for ChildProcess {
    fn id(&self) -> Option<u32> {
        self.0.id()
    }

    fn terminate(&mut self) -> io::Result<()> {
        // id() is None once the child has been reaped.
        let Some(pid) = self.0.id() else {
            return Ok(());
        };
        match kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(io::Error::from(e)),
        }
    }

    async fn wait(&mut self) -> io::Result<Option<i32>> {
        Ok(self.0.wait().await?.code())
    }
}

/// Cloneable handle to a live worker process, shared between the instance
/// and the REPL session it may be running.
#[derive(Clone)]
pub struct ChildLink {
    cid: Arc<str>,
    pid: Option<u32>,
    outbound: mpsc::UnboundedSender<ToWorker>,
    kill: CancellationToken,
    exited: CancellationToken,
}

impl fmt::Debug for ChildLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChildLink")
            .field("cid", &self.cid)
            .field("pid", &self.pid)
            .field("exited", &self.is_exited())
            .finish()
    }
}

impl ChildLink {
    /// Create a link and the receiver the writer task drains into the IPC channel.
    pub fn new(cid: &str, pid: Option<u32>) -> (Self, mpsc::UnboundedReceiver<ToWorker>) {
        let (outbound, rx) = mpsc::unbounded_channel();
        let link = Self {
            cid: Arc::from(cid),
            pid,
            outbound,
            kill: CancellationToken::new(),
            exited: CancellationToken::new(),
        };
        (link, rx)
    }

    pub fn cid(&self) -> &str {
        &self.cid
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Queue a frame for the worker. Returns `false` if the worker is gone.
    pub fn send(&self, frame: ToWorker) -> bool {
        if self.is_exited() {
            tracing::debug!(cid = %self.cid, "Dropping frame for exited worker");
            return false;
        }
        self.outbound.send(frame).is_ok()
    }

    /// Request termination; the supervising task delivers the signal.
    pub fn terminate(&self) {
        self.kill.cancel();
    }

    pub async fn terminate_requested(&self) {
        self.kill.cancelled().await
    }

    pub(crate) fn mark_exited(&self) {
        self.exited.cancel();
    }

    pub fn is_exited(&self) -> bool {
        self.exited.is_cancelled()
    }

    pub async fn exited(&self) {
        self.exited.cancelled().await
    }

    /// Whether both handles refer to the same spawned process.
    pub fn same_process(&self, other: &ChildLink) -> bool {
        self.outbound.same_channel(&other.outbound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use tokio::io::AsyncReadExt;
    use tokio_util::codec::FramedRead;

    use crate::bridge::codec::JsonCodec;
    use crate::bridge::protocol::Envelope;

    fn request(cid: &str) -> SpawnRequest {
        let mut env = BTreeMap::new();
        env.insert("PATH".to_string(), std::env::var("PATH").unwrap_or_default());
        env.insert("WDIO_WORKER_ID".to_string(), cid.to_string());
        SpawnRequest {
            cid: cid.to_string(),
            env,
            exec_argv: Vec::new(),
        }
    }

    async fn read_all(reader: Option<BoxedReader>) -> String {
        let mut out = String::new();
        reader.unwrap().read_to_string(&mut out).await.unwrap();
        out
    }

    #[tokio::test]
    async fn pipes_output_and_reports_exit_code() {
        let spawner = CommandSpawner::new("sh")
            .with_args(["-c", "echo \"worker $WDIO_WORKER_ID\"; echo oops >&2; exit 7"]);
        let mut worker = spawner.spawn(request("0-4")).unwrap();

        assert_eq!(read_all(worker.stdout.take()).await, "worker 0-4\n");
        assert_eq!(read_all(worker.stderr.take()).await, "oops\n");
        assert_eq!(worker.process.wait().await.unwrap(), Some(7));
    }

    #[tokio::test]
    async fn child_writes_frames_to_ipc_descriptor() {
        let script = r#"printf '\000\000\000\042{"origin":"worker","name":"ready"}' >&3"#;
        let spawner = CommandSpawner::new("sh").with_args(["-c", script]);
        let mut worker = spawner.spawn(request("0-0")).unwrap();

        let mut frames = FramedRead::new(worker.ipc_read, JsonCodec::<Envelope>::new());
        assert_eq!(frames.next().await.unwrap().unwrap(), Envelope::ready());
        assert!(frames.next().await.is_none());
        assert_eq!(worker.process.wait().await.unwrap(), Some(0));
    }

    #[tokio::test]
    async fn terminate_stops_a_running_process() {
        let spawner = CommandSpawner::new("sh").with_args(["-c", "sleep 30"]);
        let mut worker = spawner.spawn(request("0-0")).unwrap();
        assert!(worker.process.id().is_some());

        worker.process.terminate().unwrap();
        let code = tokio::time::timeout(std::time::Duration::from_secs(5), worker.process.wait())
            .await
            .expect("process should exit after SIGTERM")
            .unwrap();
        assert_eq!(code, None);

        // Terminating an exited process is fine.
        worker.process.terminate().unwrap();
    }

    #[tokio::test]
    async fn missing_program_is_a_spawn_error() {
        let spawner = CommandSpawner::new("/nonexistent/worker-binary");
        assert!(matches!(
            spawner.spawn(request("0-0")),
            Err(SpawnError::Spawn(_))
        ));
    }

    #[test]
    fn link_stops_sending_once_exited() {
        let (link, mut rx) = ChildLink::new("0-0", Some(42));
        let other = link.clone();
        assert!(link.same_process(&other));

        assert!(link.send(ToWorker::Debugger(Envelope::debug_start())));
        assert!(rx.try_recv().is_ok());

        other.mark_exited();
        assert!(link.is_exited());
        assert!(!link.send(ToWorker::Debugger(Envelope::debug_stop())));

        let (unrelated, _rx) = ChildLink::new("0-0", None);
        assert!(!link.same_process(&unrelated));
    }
}
