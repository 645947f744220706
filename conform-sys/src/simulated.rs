use std::fs::File;
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use log::debug;

use crate::{
    CancelToken, CommandOutput, CommandSpec, FileHandle, LocalSystem, Metadata, SysResult, System,
};

/// Dry-run backend: reads hit the live host, mutations are no-ops.
///
/// A dry run observes the host as it is *now*, so a read issued after a
/// simulated write would silently see stale state. To surface that assumption
/// instead of diverging, [`open_file`](System::open_file) hands out handles
/// that accept writes but refuse any read issued afterwards, and
/// [`create_file`](System::create_file) refuses paths that already exist.
pub struct SimulatedSystem {
    inner: LocalSystem,
    cancel: CancelToken,
}

impl SimulatedSystem {
    /// Make a new dry-run backend observing the given cancellation token.
    pub fn new(cancel: CancelToken) -> SimulatedSystem {
        SimulatedSystem {
            inner: LocalSystem::new(cancel.clone()),
            cancel,
        }
    }
}

/// Handle over a live file that swallows writes and poisons reads after the
/// first write.
struct SimulatedHandle {
    file: File,
    written: bool,
}

impl Read for SimulatedHandle {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self.written {
            return Err(std::io::Error::other(
                "read after a simulated write: the dry run cannot know this content",
            ));
        }
        self.file.read(buf)
    }
}

impl Write for SimulatedHandle {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.written = true;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl Seek for SimulatedHandle {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        self.file.seek(pos)
    }
}

impl FileHandle for SimulatedHandle {
    fn truncate(&mut self) -> std::io::Result<()> {
        self.written = true;
        Ok(())
    }
}

impl System for SimulatedSystem {
    fn lstat(&self, path: &Path) -> SysResult<Option<Metadata>> {
        self.inner.lstat(path)
    }

    fn read_link(&self, path: &Path) -> SysResult<PathBuf> {
        self.inner.read_link(path)
    }

    fn mkdir(&self, path: &Path, _mode: u32) -> SysResult<()> {
        self.cancel.check()?;
        debug!("would mkdir {}", path.display());
        Ok(())
    }

    fn remove(&self, path: &Path) -> SysResult<()> {
        self.cancel.check()?;
        debug!("would remove {}", path.display());
        Ok(())
    }

    fn symlink(&self, target: &Path, path: &Path) -> SysResult<()> {
        self.cancel.check()?;
        debug!("would symlink {} -> {}", path.display(), target.display());
        Ok(())
    }

    fn create_file(&self, path: &Path, _mode: u32) -> SysResult<Box<dyn Write + Send>> {
        self.cancel.check()?;
        if self.inner.lstat(path)?.is_some() {
            return Err(std::io::Error::new(
                ErrorKind::AlreadyExists,
                format!("{} already exists", path.display()),
            )
            .into());
        }
        debug!("would create {}", path.display());
        Ok(Box::new(std::io::sink()))
    }

    fn open_file(&self, path: &Path) -> SysResult<Box<dyn FileHandle>> {
        self.cancel.check()?;
        let file = File::open(path)?;
        Ok(Box::new(SimulatedHandle {
            file,
            written: false,
        }))
    }

    fn chmod(&self, path: &Path, mode: u32) -> SysResult<()> {
        self.cancel.check()?;
        debug!("would chmod {:o} {}", mode & 0o7777, path.display());
        Ok(())
    }

    fn chown(&self, path: &Path, _uid: Option<u32>, _gid: Option<u32>) -> SysResult<()> {
        self.cancel.check()?;
        debug!("would chown {}", path.display());
        Ok(())
    }

    fn lookup_user(&self, name: &str) -> SysResult<u32> {
        self.inner.lookup_user(name)
    }

    fn lookup_group(&self, name: &str) -> SysResult<u32> {
        self.inner.lookup_group(name)
    }

    fn run(&self, cmd: &CommandSpec) -> SysResult<CommandOutput> {
        self.cancel.check()?;
        debug!("would run {:?} {:?}", cmd.program, cmd.args);
        Ok(CommandOutput {
            status: Some(0),
            output: vec![],
        })
    }
}
