//! IPC channel between the orchestrator and one worker process.
//!
//! Each worker gets a connected Unix socket pair. The parent keeps one end;
//! the other end is installed in the child at [`IPC_FD`] between fork and exec,
//! and the descriptor number is advertised through [`IPC_FD_ENV`]. The child
//! adopts it with [`connect_from_env`].
//!
//! A socket is a point-to-point, in-order byte stream, so frames arrive in
//! send order. No reordering or duplicate suppression happens here.

use std::io;
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream as StdUnixStream;

use nix::fcntl::{FcntlArg, FdFlag, fcntl};
use nix::unistd::dup2;
use tokio::net::UnixStream;

/// Descriptor the child end is installed at.
pub const IPC_FD: RawFd = 3;

/// Environment variable carrying the IPC descriptor number.
pub const IPC_FD_ENV: &str = "LOCALRUNNER_IPC_FD";

/// Socket pair for one worker, before the child is spawned.
pub struct IpcPair {
    parent: StdUnixStream,
    child: OwnedFd,
}

impl IpcPair {
    pub fn new() -> io::Result<Self> {
        let (parent, child) = StdUnixStream::pair()?;
        tracing::trace!(
            parent_fd = parent.as_raw_fd(),
            child_fd = child.as_raw_fd(),
            "Created ipc socket pair"
        );
        Ok(Self {
            parent,
            child: child.into(),
        })
    }

    /// Arrange for the child end to appear at [`IPC_FD`] in the spawned process.
    pub fn install(&self, command: &mut tokio::process::Command) {
        let child_fd = self.child.as_raw_fd();
        command.env(IPC_FD_ENV, IPC_FD.to_string());
        // Safety: the closure runs in the forked child before exec and only
        // issues dup2/fcntl on descriptors that are open in that process.
        unsafe {
            command.pre_exec(move || install_child_fd(child_fd));
        }
    }

    /// Close the parent's copy of the child end and hand back the parent end.
    ///
    /// Must be called after the child has been spawned.
    pub fn into_parent(self) -> io::Result<UnixStream> {
        drop(self.child);
        self.parent.set_nonblocking(true)?;
        UnixStream::from_std(self.parent)
    }
}

fn install_child_fd(fd: RawFd) -> io::Result<()> {
    // Safety: `fd` was open in the parent and is inherited by the fork.
    let source = unsafe { BorrowedFd::borrow_raw(fd) };
    if fd == IPC_FD {
        // Already in place; only the close-on-exec flag has to go.
        fcntl(source, FcntlArg::F_SETFD(FdFlag::empty())).map_err(io::Error::from)?;
        return Ok(());
    }
    // dup2 leaves the new descriptor without close-on-exec.
    let mut target = unsafe { OwnedFd::from_raw_fd(IPC_FD) };
    let result = dup2(source, &mut target);
    std::mem::forget(target);
    result.map_err(io::Error::from)
}

/// Child side: adopt the descriptor advertised by the orchestrator.
pub fn connect_from_env() -> io::Result<UnixStream> {
    let raw = std::env::var(IPC_FD_ENV).map_err(|_| {
        io::Error::new(
            io::ErrorKind::NotFound,
            format!("{IPC_FD_ENV} not set; not started by an orchestrator"),
        )
    })?;
    let fd: RawFd = raw.parse().map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{IPC_FD_ENV} is not a descriptor number: {raw}"),
        )
    })?;
    tracing::debug!(fd, "Adopting ipc descriptor");
    // Safety: the orchestrator installed an open socket at this descriptor and
    // nothing else in this process owns it.
    let stream = unsafe { StdUnixStream::from_raw_fd(fd) };
    stream.set_nonblocking(true)?;
    UnixStream::from_std(stream)
}
