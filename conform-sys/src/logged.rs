use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use log::info;

use crate::{
    CommandOutput, CommandSpec, FileHandle, Metadata, SysResult, System,
};

/// Wrapper backend that delegates to another [`System`] and records one line
/// per host mutation.
///
/// Reads (`lstat`, `read_link`, name lookups, content comparisons) are not
/// recorded, so a converged host produces an empty record: the idempotence
/// tests lean on exactly that.
pub struct LoggedSystem<S> {
    inner: S,
    mutations: Arc<Mutex<Vec<String>>>,
}

impl<S: System> LoggedSystem<S> {
    /// Wrap another backend.
    pub fn new(inner: S) -> LoggedSystem<S> {
        LoggedSystem {
            inner,
            mutations: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Snapshot of the mutation lines recorded so far, in order.
    pub fn mutations(&self) -> Vec<String> {
        self.mutations.lock().unwrap().clone()
    }

    fn record(&self, line: String) {
        info!("{}", line);
        self.mutations.lock().unwrap().push(line);
    }
}

/// Handle wrapper recording the first write or truncate as a single mutation.
struct LoggedHandle {
    inner: Box<dyn FileHandle>,
    path: PathBuf,
    mutations: Arc<Mutex<Vec<String>>>,
    recorded: bool,
}

impl LoggedHandle {
    fn record_write(&mut self) {
        if !self.recorded {
            let line = format!("write {}", self.path.display());
            info!("{}", line);
            self.mutations.lock().unwrap().push(line);
            self.recorded = true;
        }
    }
}

impl Read for LoggedHandle {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.inner.read(buf)
    }
}

impl Write for LoggedHandle {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.record_write();
        self.inner.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

impl Seek for LoggedHandle {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        self.inner.seek(pos)
    }
}

impl FileHandle for LoggedHandle {
    fn truncate(&mut self) -> std::io::Result<()> {
        self.record_write();
        self.inner.truncate()
    }
}

impl<S: System> System for LoggedSystem<S> {
    fn lstat(&self, path: &Path) -> SysResult<Option<Metadata>> {
        self.inner.lstat(path)
    }

    fn read_link(&self, path: &Path) -> SysResult<PathBuf> {
        self.inner.read_link(path)
    }

    fn mkdir(&self, path: &Path, mode: u32) -> SysResult<()> {
        self.inner.mkdir(path, mode)?;
        self.record(format!("mkdir {:o} {}", mode & 0o7777, path.display()));
        Ok(())
    }

    fn remove(&self, path: &Path) -> SysResult<()> {
        self.inner.remove(path)?;
        self.record(format!("remove {}", path.display()));
        Ok(())
    }

    fn symlink(&self, target: &Path, path: &Path) -> SysResult<()> {
        self.inner.symlink(target, path)?;
        self.record(format!(
            "symlink {} -> {}",
            path.display(),
            target.display()
        ));
        Ok(())
    }

    fn create_file(&self, path: &Path, mode: u32) -> SysResult<Box<dyn Write + Send>> {
        let writer = self.inner.create_file(path, mode)?;
        self.record(format!("create {:o} {}", mode & 0o7777, path.display()));
        Ok(writer)
    }

    fn open_file(&self, path: &Path) -> SysResult<Box<dyn FileHandle>> {
        // opening is a read; only a write through the handle is a mutation
        let inner = self.inner.open_file(path)?;
        Ok(Box::new(LoggedHandle {
            inner,
            path: path.to_path_buf(),
            mutations: self.mutations.clone(),
            recorded: false,
        }))
    }

    fn chmod(&self, path: &Path, mode: u32) -> SysResult<()> {
        self.inner.chmod(path, mode)?;
        self.record(format!("chmod {:o} {}", mode & 0o7777, path.display()));
        Ok(())
    }

    fn chown(&self, path: &Path, uid: Option<u32>, gid: Option<u32>) -> SysResult<()> {
        self.inner.chown(path, uid, gid)?;
        self.record(format!(
            "chown {}:{} {}",
            uid.map_or_else(|| "-".into(), |id| id.to_string()),
            gid.map_or_else(|| "-".into(), |id| id.to_string()),
            path.display()
        ));
        Ok(())
    }

    fn lookup_user(&self, name: &str) -> SysResult<u32> {
        self.inner.lookup_user(name)
    }

    fn lookup_group(&self, name: &str) -> SysResult<u32> {
        self.inner.lookup_group(name)
    }

    fn run(&self, cmd: &CommandSpec) -> SysResult<CommandOutput> {
        let out = self.inner.run(cmd)?;
        self.record(format!("run {:?} {:?}", cmd.program, cmd.args));
        Ok(out)
    }
}
