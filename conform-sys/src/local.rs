use std::fs::{DirBuilder, File, OpenOptions, Permissions};
use std::io::{ErrorKind, Read, Write};
use std::os::fd::AsFd;
use std::os::unix::fs::{chown, DirBuilderExt, MetadataExt, OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use log::trace;
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::signal::{kill, Signal};
use nix::unistd::{Group, Pid, User};

use crate::{
    CancelToken, CommandOutput, CommandSpec, FileHandle, FileType, Metadata, SysError, SysResult,
    System,
};

/// How long a child process wait may go without looking at the cancellation
/// token, in milliseconds.
const WAIT_POLL_INTERVAL_MS: u8 = 100;

/// The live host: every operation is a real system call.
pub struct LocalSystem {
    cancel: CancelToken,
}

impl LocalSystem {
    /// Make a new `LocalSystem` observing the given cancellation token.
    pub fn new(cancel: CancelToken) -> LocalSystem {
        LocalSystem { cancel }
    }
}

fn errno(e: Errno) -> SysError {
    SysError::Io(std::io::Error::from_raw_os_error(e as i32))
}

impl FileHandle for File {
    fn truncate(&mut self) -> std::io::Result<()> {
        self.set_len(0)
    }
}

impl System for LocalSystem {
    fn lstat(&self, path: &Path) -> SysResult<Option<Metadata>> {
        self.cancel.check()?;
        let meta = match std::fs::symlink_metadata(path) {
            Ok(meta) => meta,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let file_type = if meta.file_type().is_symlink() {
            FileType::Symlink
        } else if meta.is_dir() {
            FileType::Directory
        } else if meta.is_file() {
            FileType::Regular
        } else {
            FileType::Other
        };
        Ok(Some(Metadata {
            file_type,
            len: meta.len(),
            mode: meta.mode(),
            uid: meta.uid(),
            gid: meta.gid(),
        }))
    }

    fn read_link(&self, path: &Path) -> SysResult<PathBuf> {
        self.cancel.check()?;
        Ok(std::fs::read_link(path)?)
    }

    fn mkdir(&self, path: &Path, mode: u32) -> SysResult<()> {
        self.cancel.check()?;
        DirBuilder::new().mode(mode).create(path)?;
        Ok(())
    }

    fn remove(&self, path: &Path) -> SysResult<()> {
        self.cancel.check()?;
        let meta = std::fs::symlink_metadata(path)?;
        if meta.is_dir() {
            // refuses to delete a populated directory
            std::fs::remove_dir(path)?;
        } else {
            std::fs::remove_file(path)?;
        }
        Ok(())
    }

    fn symlink(&self, target: &Path, path: &Path) -> SysResult<()> {
        self.cancel.check()?;
        std::os::unix::fs::symlink(target, path)?;
        Ok(())
    }

    fn create_file(&self, path: &Path, mode: u32) -> SysResult<Box<dyn Write + Send>> {
        self.cancel.check()?;
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(mode)
            .open(path)?;
        Ok(Box::new(file))
    }

    fn open_file(&self, path: &Path) -> SysResult<Box<dyn FileHandle>> {
        self.cancel.check()?;
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        Ok(Box::new(file))
    }

    fn chmod(&self, path: &Path, mode: u32) -> SysResult<()> {
        self.cancel.check()?;
        std::fs::set_permissions(path, Permissions::from_mode(mode))?;
        Ok(())
    }

    fn chown(&self, path: &Path, uid: Option<u32>, gid: Option<u32>) -> SysResult<()> {
        self.cancel.check()?;
        chown(path, uid, gid)?;
        Ok(())
    }

    fn lookup_user(&self, name: &str) -> SysResult<u32> {
        self.cancel.check()?;
        match User::from_name(name).map_err(errno)? {
            Some(user) => Ok(user.uid.as_raw()),
            None => Err(SysError::UnknownUser(name.into())),
        }
    }

    fn lookup_group(&self, name: &str) -> SysResult<u32> {
        self.cancel.check()?;
        match Group::from_name(name).map_err(errno)? {
            Some(group) => Ok(group.gid.as_raw()),
            None => Err(SysError::UnknownGroup(name.into())),
        }
    }

    fn run(&self, cmd: &CommandSpec) -> SysResult<CommandOutput> {
        self.cancel.check()?;
        // stdout and stderr share one pipe so the captured output keeps the
        // interleaving a terminal would show
        let (read_end, write_end) = nix::unistd::pipe().map_err(errno)?;
        let write_clone = write_end.try_clone()?;
        let mut command = Command::new(&cmd.program);
        command
            .args(&cmd.args)
            .stdin(Stdio::null())
            .stdout(Stdio::from(write_end))
            .stderr(Stdio::from(write_clone));
        if let Some(workdir) = &cmd.workdir {
            command.current_dir(workdir);
        }
        if let Some(env) = &cmd.env {
            command.env_clear().envs(env.iter().cloned());
        }
        trace!("spawning {:?} {:?}", cmd.program, cmd.args);
        let mut child = command.spawn()?;
        // the Command still holds the parent's copies of the pipe write end,
        // they must go away or the read below never sees EOF
        drop(command);

        let mut reader = File::from(read_end);
        let mut output = Vec::new();
        let mut buf = [0u8; 4096];
        let mut killed = false;
        loop {
            if self.cancel.is_cancelled() {
                // do not wait for EOF: a grandchild may keep the pipe open
                let _ = kill(Pid::from_raw(child.id() as i32), Signal::SIGKILL);
                killed = true;
                break;
            }
            let ready = {
                let mut fds = [PollFd::new(reader.as_fd(), PollFlags::POLLIN)];
                poll(&mut fds, PollTimeout::from(WAIT_POLL_INTERVAL_MS))
            };
            match ready {
                Ok(0) => continue,
                Ok(_) => {
                    let n = reader.read(&mut buf)?;
                    if n == 0 {
                        break;
                    }
                    output.extend_from_slice(&buf[..n]);
                }
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(errno(e)),
            }
        }
        let status = child.wait()?;
        if killed {
            return Err(SysError::Cancelled);
        }
        Ok(CommandOutput {
            status: status.code(),
            output,
        })
    }
}
