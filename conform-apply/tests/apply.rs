use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;

use conform_apply::{apply, ApplyError, ApplyOptions, CatalogError};
use conform_catalog::{
    Catalog, Command, ExecResource, FileResource, Resource, ResourceBody, ResourceId, RunCondition,
};
use conform_sys::{
    CancelToken, CommandOutput, CommandSpec, FileHandle, LocalSystem, LoggedSystem, Metadata,
    SimulatedSystem, SysResult, System,
};

fn options(jobs: usize) -> ApplyOptions {
    ApplyOptions {
        jobs,
        shell: "/bin/sh".into(),
    }
}

fn logged() -> Arc<LoggedSystem<LocalSystem>> {
    Arc::new(LoggedSystem::new(LocalSystem::new(CancelToken::new())))
}

fn plain_file(id: u64, path: &Path, content: &[u8], mode: Option<u32>) -> Resource {
    let body = match FileResource::plain(path, Some(content.to_vec())) {
        ResourceBody::File(mut file) => {
            if let conform_catalog::FileState::Plain { mode: m, .. } = &mut file.state {
                *m = mode;
            }
            ResourceBody::File(file)
        }
        body => body,
    };
    Resource::new(id, format!("file {}", path.display()), body)
}

#[test]
fn test_single_file_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("a");
    let catalog = Catalog::new(vec![plain_file(1, &path, b"hi\n", Some(0o644))]);

    let system = logged();
    let report = apply(&catalog, system.clone(), &options(1), CancelToken::new()).unwrap();
    assert_eq!(report.changed, 1);
    assert_eq!(std::fs::read(&path).unwrap(), b"hi\n");
    use std::os::unix::fs::PermissionsExt;
    let mode = std::fs::metadata(&path).unwrap().permissions().mode();
    assert_eq!(mode & 0o7777, 0o644);

    // the second run performs zero mutations
    let system = logged();
    let report = apply(&catalog, system.clone(), &options(1), CancelToken::new()).unwrap();
    assert_eq!(report.changed, 0);
    assert_eq!(report.unchanged, 1);
    assert_eq!(system.mutations(), Vec::<String>::new());
}

#[test]
fn test_directory_then_file() {
    let dir = tempfile::tempdir().unwrap();
    let sub = dir.path().join("d");
    let inner = sub.join("x");
    let catalog = Catalog::new(vec![
        Resource::new(1, "the dir", FileResource::directory(&sub, Some(0o755))),
        plain_file(2, &inner, b"x", None).depends_on(1),
    ]);

    let system = logged();
    apply(&catalog, system.clone(), &options(4), CancelToken::new()).unwrap();
    assert!(sub.is_dir());
    assert_eq!(std::fs::read(&inner).unwrap(), b"x");

    // the mkdir strictly precedes the file creation
    let mutations = system.mutations();
    let mkdir = mutations.iter().position(|l| l.starts_with("mkdir")).unwrap();
    let create = mutations.iter().position(|l| l.starts_with("create")).unwrap();
    assert!(mkdir < create);
}

#[test]
fn test_symlink_replacement() {
    let dir = tempfile::tempdir().unwrap();
    let link = dir.path().join("l");
    std::os::unix::fs::symlink("/old", &link).unwrap();

    let catalog = Catalog::new(vec![Resource::new(
        1,
        "the link",
        FileResource::symlink(&link, "/new"),
    )]);
    let report = apply(
        &catalog,
        Arc::new(LocalSystem::new(CancelToken::new())),
        &options(1),
        CancelToken::new(),
    )
    .unwrap();
    assert_eq!(report.changed, 1);
    assert_eq!(std::fs::read_link(&link).unwrap().to_str(), Some("/new"));
}

#[test]
fn test_failure_propagation() {
    let dir = tempfile::tempdir().unwrap();
    let blocker = dir.path().join("blocker");
    std::fs::write(&blocker, b"").unwrap();
    let unwritable = blocker.join("sub");
    let independent = dir.path().join("c");

    let catalog = Catalog::new(vec![
        plain_file(1, &unwritable, b"x", None),
        Resource::new(2, "dependent", ResourceBody::Noop).depends_on(1),
        plain_file(3, &independent, b"c", None),
    ]);
    let err = apply(
        &catalog,
        Arc::new(LocalSystem::new(CancelToken::new())),
        &options(2),
        CancelToken::new(),
    )
    .unwrap_err();

    // the independent branch still converged
    assert_eq!(std::fs::read(&independent).unwrap(), b"c");
    match err {
        ApplyError::Failed(report) => {
            assert!(!report.cancelled);
            assert_eq!(report.failures.len(), 1);
            assert_eq!(report.failures[0].id, ResourceId(1));
            assert!(report.failures[0].to_string().starts_with("resource 1 ("));
            assert_eq!(report.skipped, vec![ResourceId(2)]);
        }
        err => panic!("unexpected error: {:?}", err),
    }
}

#[test]
fn test_cycle_is_rejected_before_any_mutation() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("never");
    let catalog = Catalog::new(vec![
        Resource::new(1, "a", ResourceBody::Noop).depends_on(2),
        Resource::new(2, "b", ResourceBody::Noop).depends_on(1),
        plain_file(3, &path, b"x", None),
    ]);
    let system = logged();
    let err = apply(&catalog, system.clone(), &options(2), CancelToken::new()).unwrap_err();
    match err {
        ApplyError::Catalog(CatalogError::CycleDetected { ids }) => {
            assert_eq!(ids, vec![ResourceId(1), ResourceId(2)]);
        }
        err => panic!("unexpected error: {:?}", err),
    }
    // nothing ran, not even the independent file
    assert_eq!(system.mutations(), Vec::<String>::new());
    assert!(!path.exists());
}

#[test]
fn test_conditional_exec_converges() {
    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("marker");
    let exec = ExecResource::with_condition(
        ExecResource::script(format!("echo made > {}", marker.display())),
        RunCondition::Unless(Command::Argv(vec![
            "test".into(),
            "-f".into(),
            marker.to_str().unwrap().into(),
        ])),
    );
    let catalog = Catalog::new(vec![Resource::new(1, "make marker", exec)]);

    let report = apply(
        &catalog,
        Arc::new(LocalSystem::new(CancelToken::new())),
        &options(1),
        CancelToken::new(),
    )
    .unwrap();
    assert_eq!(report.changed, 1);
    assert_eq!(std::fs::read_to_string(&marker).unwrap(), "made\n");

    // the probe now succeeds: the command is skipped but the resource is done
    std::fs::write(&marker, "untouched").unwrap();
    let report = apply(
        &catalog,
        Arc::new(LocalSystem::new(CancelToken::new())),
        &options(1),
        CancelToken::new(),
    )
    .unwrap();
    assert_eq!(report.changed, 0);
    assert_eq!(report.unchanged, 1);
    assert_eq!(std::fs::read_to_string(&marker).unwrap(), "untouched");
}

#[test]
fn test_exec_runs_when_dependency_changes() {
    let dir = tempfile::tempdir().unwrap();
    let config = dir.path().join("config");
    let reloaded = dir.path().join("reloaded");
    let exec = ExecResource::with_condition(
        ExecResource::script(format!("date >> {}", reloaded.display())),
        RunCondition::IfDepsChanged,
    );
    let catalog = Catalog::new(vec![
        plain_file(1, &config, b"v1\n", None),
        Resource::new(2, "reload", exec).depends_on(1),
    ]);

    // first run writes the config, so the reload fires
    apply(
        &catalog,
        Arc::new(LocalSystem::new(CancelToken::new())),
        &options(1),
        CancelToken::new(),
    )
    .unwrap();
    assert!(reloaded.exists());
    let first = std::fs::read_to_string(&reloaded).unwrap();

    // second run: the config is converged, the reload is skipped
    apply(
        &catalog,
        Arc::new(LocalSystem::new(CancelToken::new())),
        &options(1),
        CancelToken::new(),
    )
    .unwrap();
    assert_eq!(std::fs::read_to_string(&reloaded).unwrap(), first);
}

#[test]
fn test_sequential_execution_is_deterministic() {
    let dir = tempfile::tempdir().unwrap();
    let catalog = Catalog::new(vec![
        plain_file(3, &dir.path().join("third"), b"3", None),
        plain_file(1, &dir.path().join("first"), b"1", None),
        plain_file(2, &dir.path().join("second"), b"2", None),
    ]);
    let system = logged();
    apply(&catalog, system.clone(), &options(1), CancelToken::new()).unwrap();
    let created: Vec<String> = system
        .mutations()
        .iter()
        .filter(|line| line.starts_with("create"))
        .map(|line| line.rsplit('/').next().unwrap().to_owned())
        .collect();
    assert_eq!(created, vec!["first", "second", "third"]);
}

#[test]
fn test_simulated_backend_never_mutates() {
    let dir = tempfile::tempdir().unwrap();
    let sub = dir.path().join("d");
    let file = sub.join("f");
    let marker = dir.path().join("ran");
    let catalog = Catalog::new(vec![
        Resource::new(1, "dir", FileResource::directory(&sub, None)),
        plain_file(2, &file, b"x", None).depends_on(1),
        Resource::new(
            3,
            "cmd",
            ExecResource::script(format!("touch {}", marker.display())),
        ),
    ]);

    let report = apply(
        &catalog,
        Arc::new(SimulatedSystem::new(CancelToken::new())),
        &options(2),
        CancelToken::new(),
    )
    .unwrap();
    assert_eq!(report.changed, 3);
    assert!(!sub.exists());
    assert!(!file.exists());
    assert!(!marker.exists());
}

/// Delegating wrapper counting how many appliers are inside `run` at once.
struct Gauge {
    inner: LocalSystem,
    current: AtomicUsize,
    max: AtomicUsize,
}

impl Gauge {
    fn new() -> Gauge {
        Gauge {
            inner: LocalSystem::new(CancelToken::new()),
            current: AtomicUsize::new(0),
            max: AtomicUsize::new(0),
        }
    }
}

impl System for Gauge {
    fn lstat(&self, path: &Path) -> SysResult<Option<Metadata>> {
        self.inner.lstat(path)
    }
    fn read_link(&self, path: &Path) -> SysResult<PathBuf> {
        self.inner.read_link(path)
    }
    fn mkdir(&self, path: &Path, mode: u32) -> SysResult<()> {
        self.inner.mkdir(path, mode)
    }
    fn remove(&self, path: &Path) -> SysResult<()> {
        self.inner.remove(path)
    }
    fn symlink(&self, target: &Path, path: &Path) -> SysResult<()> {
        self.inner.symlink(target, path)
    }
    fn create_file(&self, path: &Path, mode: u32) -> SysResult<Box<dyn Write + Send>> {
        self.inner.create_file(path, mode)
    }
    fn open_file(&self, path: &Path) -> SysResult<Box<dyn FileHandle>> {
        self.inner.open_file(path)
    }
    fn chmod(&self, path: &Path, mode: u32) -> SysResult<()> {
        self.inner.chmod(path, mode)
    }
    fn chown(&self, path: &Path, uid: Option<u32>, gid: Option<u32>) -> SysResult<()> {
        self.inner.chown(path, uid, gid)
    }
    fn lookup_user(&self, name: &str) -> SysResult<u32> {
        self.inner.lookup_user(name)
    }
    fn lookup_group(&self, name: &str) -> SysResult<u32> {
        self.inner.lookup_group(name)
    }
    fn run(&self, cmd: &CommandSpec) -> SysResult<CommandOutput> {
        let current = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.max.fetch_max(current, Ordering::SeqCst);
        let result = self.inner.run(cmd);
        self.current.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

#[test]
fn test_concurrency_stays_within_bound() {
    let gauge = Arc::new(Gauge::new());
    let resources = (1..=6)
        .map(|id| Resource::new(id, format!("sleep {}", id), ExecResource::argv(["sleep", "0.1"])))
        .collect();
    let catalog = Catalog::new(resources);
    apply(&catalog, gauge.clone(), &options(2), CancelToken::new()).unwrap();
    assert!(gauge.max.load(Ordering::SeqCst) <= 2);
}

#[test]
fn test_cancellation_interrupts_the_run() {
    let cancel = CancelToken::new();
    let catalog = Catalog::new(vec![
        Resource::new(1, "slow", ExecResource::argv(["sleep", "30"])),
        Resource::new(2, "after", ResourceBody::Noop).depends_on(1),
    ]);
    let canceller = std::thread::spawn({
        let cancel = cancel.clone();
        move || {
            std::thread::sleep(Duration::from_millis(300));
            cancel.cancel();
        }
    });
    let start = std::time::Instant::now();
    let err = apply(
        &catalog,
        Arc::new(LocalSystem::new(cancel.clone())),
        &options(2),
        cancel,
    )
    .unwrap_err();
    canceller.join().unwrap();
    assert!(start.elapsed() < Duration::from_secs(10));
    match err {
        ApplyError::Failed(report) => {
            assert!(report.cancelled);
            // the interruption is not a resource failure
            assert_eq!(report.failures.len(), 0);
        }
        err => panic!("unexpected error: {:?}", err),
    }
}

#[test]
fn test_duplicate_and_dangling_are_structural() {
    let catalog = Catalog::new(vec![
        Resource::new(1, "a", ResourceBody::Noop),
        Resource::new(1, "b", ResourceBody::Noop),
    ]);
    let err = apply(
        &catalog,
        Arc::new(SimulatedSystem::new(CancelToken::new())),
        &options(1),
        CancelToken::new(),
    )
    .unwrap_err();
    assert!(matches!(
        err,
        ApplyError::Catalog(CatalogError::DuplicateId { id: ResourceId(1) })
    ));

    let catalog = Catalog::new(vec![Resource::new(1, "a", ResourceBody::Noop).depends_on(9)]);
    let err = apply(
        &catalog,
        Arc::new(SimulatedSystem::new(CancelToken::new())),
        &options(1),
        CancelToken::new(),
    )
    .unwrap_err();
    assert!(matches!(
        err,
        ApplyError::Catalog(CatalogError::DanglingDependency { .. })
    ));
}
