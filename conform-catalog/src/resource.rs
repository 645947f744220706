use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// The identifier of a resource, unique within a single catalog.
///
/// Ids are assigned by the catalog producer and are never zero; zero is
/// rejected when the dependency graph is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceId(pub u64);

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for ResourceId {
    fn from(id: u64) -> ResourceId {
        ResourceId(id)
    }
}

/// A single unit of desired host state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Resource {
    /// Unique nonzero identifier of this resource within its catalog.
    pub id: ResourceId,
    /// Human readable label, used only in diagnostics.
    pub comment: String,
    /// Ids of the resources that must complete before this one runs.
    pub dependencies: Vec<ResourceId>,
    /// What this resource manages.
    pub body: ResourceBody,
}

impl Resource {
    /// Make a new resource with no dependencies.
    pub fn new<S: Into<String>>(id: u64, comment: S, body: ResourceBody) -> Resource {
        Resource {
            id: ResourceId(id),
            comment: comment.into(),
            dependencies: vec![],
            body,
        }
    }

    /// Add a dependency on another resource.
    pub fn depends_on(mut self, id: u64) -> Resource {
        self.dependencies.push(ResourceId(id));
        self
    }
}

/// The state a [`Resource`] declares, exactly one of the supported kinds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ResourceBody {
    /// Succeeds unconditionally without touching the host. Useful as an
    /// anchor point in the dependency graph.
    Noop,
    /// A filesystem object.
    File(FileResource),
    /// A command to execute.
    Exec(ExecResource),
}

/// A filesystem object at an absolute path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileResource {
    /// Absolute path of the managed object.
    pub path: PathBuf,
    /// The desired state of the object at `path`.
    pub state: FileState,
}

impl FileResource {
    /// A regular file, optionally with content, mode and ownership.
    pub fn plain<P: Into<PathBuf>>(path: P, content: Option<Vec<u8>>) -> ResourceBody {
        ResourceBody::File(FileResource {
            path: path.into(),
            state: FileState::Plain {
                content,
                mode: None,
                owner: Ownership::default(),
            },
        })
    }

    /// A directory.
    pub fn directory<P: Into<PathBuf>>(path: P, mode: Option<u32>) -> ResourceBody {
        ResourceBody::File(FileResource {
            path: path.into(),
            state: FileState::Directory {
                mode,
                owner: Ownership::default(),
            },
        })
    }

    /// A symbolic link pointing at `target`.
    pub fn symlink<P: Into<PathBuf>, T: Into<PathBuf>>(path: P, target: T) -> ResourceBody {
        ResourceBody::File(FileResource {
            path: path.into(),
            state: FileState::Symlink {
                target: target.into(),
            },
        })
    }

    /// Nothing may exist at `path`.
    pub fn absent<P: Into<PathBuf>>(path: P) -> ResourceBody {
        ResourceBody::File(FileResource {
            path: path.into(),
            state: FileState::Absent,
        })
    }
}

/// The sub-variant of a [`FileResource`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum FileState {
    /// A regular file.
    Plain {
        /// Exact bytes the file must contain. When `None` only the existence
        /// of the file is ensured and its content is left alone.
        content: Option<Vec<u8>>,
        /// Permission bits, compared on the low 12 bits.
        mode: Option<u32>,
        /// Owning user and group.
        owner: Ownership,
    },
    /// A directory.
    Directory {
        /// Permission bits, `0o755` is used when creating without one.
        mode: Option<u32>,
        /// Owning user and group.
        owner: Ownership,
    },
    /// A symbolic link. Mode does not apply to symlinks.
    Symlink {
        /// Where the link must point.
        target: PathBuf,
    },
    /// The path must not exist. Directories are only removed when empty.
    Absent,
}

/// Owning user and group of a file-like resource, by name.
///
/// Names are resolved to numeric ids through the applier's resolution caches;
/// an unknown name is an application error.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Ownership {
    /// Owning user name, left alone when `None`.
    pub user: Option<String>,
    /// Owning group name, left alone when `None`.
    pub group: Option<String>,
}

impl Ownership {
    /// True when neither a user nor a group is declared.
    pub fn is_empty(&self) -> bool {
        self.user.is_none() && self.group.is_none()
    }
}

/// A command to run, either as a direct argv or as a shell script.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Command {
    /// Program and arguments, executed directly.
    Argv(Vec<String>),
    /// Script body, executed by the configured shell interpreter.
    Script(String),
}

/// A command execution with optional working directory, environment and
/// run condition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecResource {
    /// The command to run.
    pub command: Command,
    /// Working directory of the command and of the condition probes.
    pub workdir: Option<PathBuf>,
    /// `KEY=VALUE` entries replacing (not merging with) the inherited
    /// environment. The applier's own environment is inherited when `None`.
    pub environment: Option<Vec<String>>,
    /// When present, decides whether the command runs at all.
    pub condition: Option<RunCondition>,
}

impl ExecResource {
    /// A shell script with no condition.
    pub fn script<S: Into<String>>(script: S) -> ResourceBody {
        ResourceBody::Exec(ExecResource {
            command: Command::Script(script.into()),
            workdir: None,
            environment: None,
            condition: None,
        })
    }

    /// A direct argv command with no condition.
    pub fn argv<I: IntoIterator<Item = S>, S: Into<String>>(argv: I) -> ResourceBody {
        ResourceBody::Exec(ExecResource {
            command: Command::Argv(argv.into_iter().map(Into::into).collect()),
            workdir: None,
            environment: None,
            condition: None,
        })
    }

    /// Attach a condition to an exec body built with [`script`](Self::script)
    /// or [`argv`](Self::argv).
    pub fn with_condition(body: ResourceBody, condition: RunCondition) -> ResourceBody {
        match body {
            ResourceBody::Exec(mut exec) => {
                exec.condition = Some(condition);
                ResourceBody::Exec(exec)
            }
            other => other,
        }
    }
}

/// Condition deciding whether an [`ExecResource`] runs.
///
/// A probe command exiting nonzero is a decision signal, not a failure of the
/// resource. A resource whose condition decides against running is still
/// considered successfully applied; it simply did no work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RunCondition {
    /// Run only if this probe exits with status 0.
    OnlyIf(Command),
    /// Run only if this probe exits with nonzero status.
    Unless(Command),
    /// Run only if at least one dependency reported a host mutation.
    IfDepsChanged,
}
