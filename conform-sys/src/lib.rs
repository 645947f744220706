//! Host abstraction consumed by the appliers.
//!
//! Every host-visible effect of an apply run goes through the [`System`]
//! trait: filesystem metadata and mutations, user/group resolution and child
//! process execution. Three implementations are provided:
//!
//! - [`LocalSystem`] performs live system calls.
//! - [`SimulatedSystem`] reads from the live host but turns every mutation
//!   into a no-op, for dry runs.
//! - [`LoggedSystem`] wraps another implementation and records one line per
//!   mutation, which is also how the tests assert idempotence.
//!
//! All the operations observe a shared [`CancelToken`]: once the token trips
//! they fail with [`SysError::Cancelled`], including a child process wait in
//! flight.

use std::io::{Read, Seek, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use thiserror::Error;

mod local;
mod logged;
mod simulated;
mod users;

pub use local::LocalSystem;
pub use logged::LoggedSystem;
pub use simulated::SimulatedSystem;
pub use users::OwnerResolver;

/// Result type of all the [`System`] operations.
pub type SysResult<T> = Result<T, SysError>;

/// An error surfaced by a [`System`] operation.
#[derive(Debug, Error)]
pub enum SysError {
    /// The cancellation signal tripped; the run is incomplete but the host is
    /// not in a worse state than before.
    #[error("interrupted by cancellation")]
    Cancelled,
    /// A user name could not be resolved to an id.
    #[error("unknown user {0:?}")]
    UnknownUser(String),
    /// A group name could not be resolved to an id.
    #[error("unknown group {0:?}")]
    UnknownGroup(String),
    /// An I/O error from the underlying host.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Cancellation signal shared between the front end, the scheduler and every
/// system operation.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// Make a new, untripped token.
    pub fn new() -> CancelToken {
        CancelToken::default()
    }

    /// Trip the token. There is no way back.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether the token has tripped.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Fail with [`SysError::Cancelled`] once the token has tripped.
    pub fn check(&self) -> SysResult<()> {
        if self.is_cancelled() {
            Err(SysError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// The kind of a filesystem object, as observed by [`System::lstat`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    /// A regular file.
    Regular,
    /// A directory.
    Directory,
    /// A symbolic link (not followed).
    Symlink,
    /// Anything else: device, socket, fifo, ...
    Other,
}

/// Metadata of a filesystem object.
#[derive(Debug, Clone)]
pub struct Metadata {
    /// The kind of the object.
    pub file_type: FileType,
    /// Size in bytes.
    pub len: u64,
    /// Raw mode bits as reported by the host.
    pub mode: u32,
    /// Numeric id of the owning user.
    pub uid: u32,
    /// Numeric id of the owning group.
    pub gid: u32,
}

impl Metadata {
    /// The permission bits plus setuid/setgid/sticky.
    pub fn permissions(&self) -> u32 {
        self.mode & 0o7777
    }

    /// Whether these permission bits match the desired ones, compared on the
    /// low 12 bits.
    pub fn same_mode(&self, desired: u32) -> bool {
        self.permissions() == desired & 0o7777
    }
}

/// An opened file as returned by [`System::open_file`]: readable, writable,
/// seekable and truncatable.
pub trait FileHandle: Read + Write + Seek + Send {
    /// Truncate the file to zero length. The cursor is left where it is.
    fn truncate(&mut self) -> std::io::Result<()>;
}

/// A fully resolved command, ready to be executed by [`System::run`].
#[derive(Debug, Clone)]
pub struct CommandSpec {
    /// Path or name of the program.
    pub program: PathBuf,
    /// Arguments, not including the program itself.
    pub args: Vec<String>,
    /// Working directory; the applier's own when `None`.
    pub workdir: Option<PathBuf>,
    /// Full replacement of the environment; inherited when `None`.
    pub env: Option<Vec<(String, String)>>,
}

/// Exit status and combined output of a completed command.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    /// Exit status code, `None` when the process was killed by a signal.
    pub status: Option<i32>,
    /// Interleaved stdout and stderr, in write order.
    pub output: Vec<u8>,
}

impl CommandOutput {
    /// Whether the command exited with status 0.
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }
}

/// The operations the appliers are allowed to perform on a host.
///
/// Implementations are shared between the workers and must be thread safe.
pub trait System: Send + Sync {
    /// Metadata of the object at `path` without following symlinks, or
    /// `None` when nothing exists there.
    fn lstat(&self, path: &Path) -> SysResult<Option<Metadata>>;

    /// Target of the symlink at `path`.
    fn read_link(&self, path: &Path) -> SysResult<PathBuf>;

    /// Create a directory with the given mode. Fails if `path` exists.
    fn mkdir(&self, path: &Path, mode: u32) -> SysResult<()>;

    /// Delete the file, empty directory or symlink at `path`. A populated
    /// directory is refused.
    fn remove(&self, path: &Path) -> SysResult<()>;

    /// Create a symlink at `path` pointing at `target`.
    fn symlink(&self, target: &Path, path: &Path) -> SysResult<()>;

    /// Create (or truncate) the regular file at `path` with the given mode
    /// and return a writer for its content.
    fn create_file(&self, path: &Path, mode: u32) -> SysResult<Box<dyn Write + Send>>;

    /// Open the regular file at `path` for reading and rewriting.
    fn open_file(&self, path: &Path) -> SysResult<Box<dyn FileHandle>>;

    /// Change the permission bits of `path`.
    fn chmod(&self, path: &Path, mode: u32) -> SysResult<()>;

    /// Change the ownership of `path`. `None` leaves that id alone.
    fn chown(&self, path: &Path, uid: Option<u32>, gid: Option<u32>) -> SysResult<()>;

    /// Numeric id of the user with this name.
    fn lookup_user(&self, name: &str) -> SysResult<u32>;

    /// Numeric id of the group with this name.
    fn lookup_group(&self, name: &str) -> SysResult<u32>;

    /// Execute a child process to completion, capturing the combined output.
    fn run(&self, cmd: &CommandSpec) -> SysResult<CommandOutput>;
}

impl SysError {
    /// Whether this error (or any error in a chain ending here) is the
    /// cancellation marker.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, SysError::Cancelled)
    }
}
