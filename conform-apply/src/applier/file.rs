use std::io::{Read, Seek, Write};
use std::path::Path;

use anyhow::{bail, ensure, Context, Result};
use log::debug;

use conform_catalog::{FileResource, FileState, Ownership};
use conform_sys::{FileType, Metadata};

use super::ApplyContext;

/// Reconcile a file-like resource, returning whether the host was mutated.
///
/// Every sub-variant is idempotent: on an already converged host nothing is
/// written and `false` comes back.
pub(crate) fn apply_file(file: &FileResource, ctx: &ApplyContext) -> Result<bool> {
    ensure!(
        file.path.is_absolute(),
        "path {} is not absolute",
        file.path.display()
    );
    match &file.state {
        FileState::Plain {
            content,
            mode,
            owner,
        } => apply_plain(&file.path, content.as_deref(), *mode, owner, ctx),
        FileState::Directory { mode, owner } => apply_directory(&file.path, *mode, owner, ctx),
        FileState::Symlink { target } => apply_symlink(&file.path, target, ctx),
        FileState::Absent => apply_absent(&file.path, ctx),
    }
}

fn apply_plain(
    path: &Path,
    content: Option<&[u8]>,
    mode: Option<u32>,
    owner: &Ownership,
    ctx: &ApplyContext,
) -> Result<bool> {
    let sys = ctx.system.as_ref();
    let observed = sys
        .lstat(path)
        .with_context(|| format!("cannot stat {}", path.display()))?;
    if let Some(meta) = &observed {
        if meta.file_type != FileType::Regular {
            bail!("{} exists and is not a regular file", path.display());
        }
    }

    let mut changed = false;
    match &observed {
        None => {
            let mut writer = sys
                .create_file(path, mode.unwrap_or(0o644))
                .with_context(|| format!("cannot create {}", path.display()))?;
            if let Some(bytes) = content {
                writer.write_all(bytes)?;
            }
            writer.flush()?;
            drop(writer);
            // the creation mode went through the umask
            if let Some(mode) = mode {
                sys.chmod(path, mode)?;
            }
            changed = true;
        }
        Some(meta) => {
            if let Some(bytes) = content {
                let mut handle = sys
                    .open_file(path)
                    .with_context(|| format!("cannot open {}", path.display()))?;
                if !content_matches(&mut handle, meta, bytes)? {
                    debug!("rewriting {}", path.display());
                    handle.rewind()?;
                    handle.truncate()?;
                    handle.write_all(bytes)?;
                    handle.flush()?;
                    changed = true;
                }
            }
            changed |= apply_mode(path, meta, mode, ctx)?;
        }
    }
    changed |= apply_owner(path, observed.as_ref(), owner, ctx)?;
    Ok(changed)
}

fn apply_directory(
    path: &Path,
    mode: Option<u32>,
    owner: &Ownership,
    ctx: &ApplyContext,
) -> Result<bool> {
    let sys = ctx.system.as_ref();
    let observed = sys
        .lstat(path)
        .with_context(|| format!("cannot stat {}", path.display()))?;
    if let Some(meta) = &observed {
        if meta.file_type != FileType::Directory {
            bail!("{} exists and is not a directory", path.display());
        }
    }

    let mut changed = false;
    match &observed {
        None => {
            sys.mkdir(path, mode.unwrap_or(0o755))
                .with_context(|| format!("cannot create directory {}", path.display()))?;
            if let Some(mode) = mode {
                sys.chmod(path, mode)?;
            }
            changed = true;
        }
        Some(meta) => {
            changed |= apply_mode(path, meta, mode, ctx)?;
        }
    }
    changed |= apply_owner(path, observed.as_ref(), owner, ctx)?;
    Ok(changed)
}

fn apply_symlink(path: &Path, target: &Path, ctx: &ApplyContext) -> Result<bool> {
    let sys = ctx.system.as_ref();
    let observed = sys
        .lstat(path)
        .with_context(|| format!("cannot stat {}", path.display()))?;
    if let Some(meta) = &observed {
        if meta.file_type != FileType::Symlink {
            bail!("{} exists and is not a symlink", path.display());
        }
        let current = sys
            .read_link(path)
            .with_context(|| format!("cannot read symlink {}", path.display()))?;
        if current == target {
            return Ok(false);
        }
        debug!(
            "replacing symlink {}: {} -> {}",
            path.display(),
            current.display(),
            target.display()
        );
        sys.remove(path)?;
    }
    sys.symlink(target, path)
        .with_context(|| format!("cannot create symlink {}", path.display()))?;
    Ok(true)
}

fn apply_absent(path: &Path, ctx: &ApplyContext) -> Result<bool> {
    let sys = ctx.system.as_ref();
    let observed = sys
        .lstat(path)
        .with_context(|| format!("cannot stat {}", path.display()))?;
    let Some(meta) = observed else {
        return Ok(false);
    };
    if meta.file_type == FileType::Directory {
        // only empty directories go away, recursive deletion is out
        sys.remove(path)
            .with_context(|| format!("cannot remove directory {}", path.display()))?;
    } else {
        sys.remove(path)
            .with_context(|| format!("cannot remove {}", path.display()))?;
    }
    Ok(true)
}

/// Compare the observed content against the desired bytes: sizes first, then
/// a byte comparison.
fn content_matches(
    handle: &mut Box<dyn conform_sys::FileHandle>,
    meta: &Metadata,
    desired: &[u8],
) -> Result<bool> {
    if meta.len != desired.len() as u64 {
        return Ok(false);
    }
    let mut observed = Vec::with_capacity(desired.len());
    handle.read_to_end(&mut observed)?;
    Ok(observed == desired)
}

fn apply_mode(
    path: &Path,
    observed: &Metadata,
    mode: Option<u32>,
    ctx: &ApplyContext,
) -> Result<bool> {
    let Some(mode) = mode else { return Ok(false) };
    if observed.same_mode(mode) {
        return Ok(false);
    }
    ctx.system
        .chmod(path, mode)
        .with_context(|| format!("cannot chmod {}", path.display()))?;
    Ok(true)
}

fn apply_owner(
    path: &Path,
    observed: Option<&Metadata>,
    owner: &Ownership,
    ctx: &ApplyContext,
) -> Result<bool> {
    if owner.is_empty() {
        return Ok(false);
    }
    let sys = ctx.system.as_ref();
    let uid = owner
        .user
        .as_deref()
        .map(|name| ctx.owners.uid(sys, name))
        .transpose()
        .with_context(|| format!("cannot resolve the owner of {}", path.display()))?;
    let gid = owner
        .group
        .as_deref()
        .map(|name| ctx.owners.gid(sys, name))
        .transpose()
        .with_context(|| format!("cannot resolve the group of {}", path.display()))?;
    let differs = match observed {
        // freshly created objects keep the applier's identity, fix it up
        None => true,
        Some(meta) => {
            uid.is_some_and(|uid| uid != meta.uid) || gid.is_some_and(|gid| gid != meta.gid)
        }
    };
    if !differs {
        return Ok(false);
    }
    sys.chown(path, uid, gid)
        .with_context(|| format!("cannot chown {}", path.display()))?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use std::os::unix::fs::PermissionsExt;
    use std::sync::Arc;

    use pretty_assertions::assert_eq;

    use conform_sys::{CancelToken, LocalSystem, LoggedSystem, OwnerResolver};

    use super::*;

    fn context() -> (ApplyContext, Arc<LoggedSystem<LocalSystem>>) {
        let system = Arc::new(LoggedSystem::new(LocalSystem::new(CancelToken::new())));
        let ctx = ApplyContext {
            system: system.clone(),
            shell: "/bin/sh".into(),
            owners: OwnerResolver::new(),
            cancel: CancelToken::new(),
        };
        (ctx, system)
    }

    fn plain(path: &Path, content: Option<&[u8]>, mode: Option<u32>) -> FileResource {
        FileResource {
            path: path.to_path_buf(),
            state: FileState::Plain {
                content: content.map(|c| c.to_vec()),
                mode,
                owner: Ownership::default(),
            },
        }
    }

    #[test]
    fn test_plain_create_and_converge() {
        let dir = tempfile::tempdir().unwrap();
        let (ctx, system) = context();
        let path = dir.path().join("motd");
        let resource = plain(&path, Some(b"hello\n"), Some(0o644));

        assert!(apply_file(&resource, &ctx).unwrap());
        assert_eq!(std::fs::read(&path).unwrap(), b"hello\n");
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o7777, 0o644);

        // the second run does not touch the host
        let before = system.mutations().len();
        assert!(!apply_file(&resource, &ctx).unwrap());
        assert_eq!(system.mutations().len(), before);
    }

    #[test]
    fn test_plain_rewrites_different_content() {
        let dir = tempfile::tempdir().unwrap();
        let (ctx, _) = context();
        let path = dir.path().join("config");
        std::fs::write(&path, b"old old old").unwrap();

        let resource = plain(&path, Some(b"new"), None);
        assert!(apply_file(&resource, &ctx).unwrap());
        assert_eq!(std::fs::read(&path).unwrap(), b"new");

        // same size, different bytes
        let resource = plain(&path, Some(b"NEW"), None);
        assert!(apply_file(&resource, &ctx).unwrap());
        assert_eq!(std::fs::read(&path).unwrap(), b"NEW");
    }

    #[test]
    fn test_plain_without_content_touches_once() {
        let dir = tempfile::tempdir().unwrap();
        let (ctx, _) = context();
        let path = dir.path().join("marker");
        let resource = plain(&path, None, None);

        assert!(apply_file(&resource, &ctx).unwrap());
        assert_eq!(std::fs::read(&path).unwrap(), b"");

        // existing content is left alone when the catalog declares none
        std::fs::write(&path, b"kept").unwrap();
        assert!(!apply_file(&resource, &ctx).unwrap());
        assert_eq!(std::fs::read(&path).unwrap(), b"kept");
    }

    #[test]
    fn test_plain_refuses_directory() {
        let dir = tempfile::tempdir().unwrap();
        let (ctx, _) = context();
        let resource = plain(dir.path(), Some(b"x"), None);
        let err = apply_file(&resource, &ctx).unwrap_err();
        assert!(err.to_string().contains("not a regular file"));
    }

    #[test]
    fn test_plain_mode_fixup() {
        let dir = tempfile::tempdir().unwrap();
        let (ctx, _) = context();
        let path = dir.path().join("secret");
        std::fs::write(&path, b"s").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o666)).unwrap();

        let resource = plain(&path, None, Some(0o600));
        assert!(apply_file(&resource, &ctx).unwrap());
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o7777, 0o600);
        assert!(!apply_file(&resource, &ctx).unwrap());
    }

    #[test]
    fn test_directory_create_and_converge() {
        let dir = tempfile::tempdir().unwrap();
        let (ctx, system) = context();
        let path = dir.path().join("d");
        let resource = FileResource {
            path: path.clone(),
            state: FileState::Directory {
                mode: Some(0o750),
                owner: Ownership::default(),
            },
        };

        assert!(apply_file(&resource, &ctx).unwrap());
        assert!(path.is_dir());
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o7777, 0o750);

        let before = system.mutations().len();
        assert!(!apply_file(&resource, &ctx).unwrap());
        assert_eq!(system.mutations().len(), before);
    }

    #[test]
    fn test_directory_refuses_file() {
        let dir = tempfile::tempdir().unwrap();
        let (ctx, _) = context();
        let path = dir.path().join("f");
        std::fs::write(&path, b"").unwrap();
        let resource = FileResource {
            path,
            state: FileState::Directory {
                mode: None,
                owner: Ownership::default(),
            },
        };
        let err = apply_file(&resource, &ctx).unwrap_err();
        assert!(err.to_string().contains("not a directory"));
    }

    #[test]
    fn test_symlink_create_replace_converge() {
        let dir = tempfile::tempdir().unwrap();
        let (ctx, _) = context();
        let path = dir.path().join("link");
        std::os::unix::fs::symlink("/old", &path).unwrap();

        let resource = FileResource {
            path: path.clone(),
            state: FileState::Symlink {
                target: "/new".into(),
            },
        };
        assert!(apply_file(&resource, &ctx).unwrap());
        assert_eq!(std::fs::read_link(&path).unwrap().to_str(), Some("/new"));
        assert!(!apply_file(&resource, &ctx).unwrap());
    }

    #[test]
    fn test_symlink_refuses_regular_file() {
        let dir = tempfile::tempdir().unwrap();
        let (ctx, _) = context();
        let path = dir.path().join("not-a-link");
        std::fs::write(&path, b"").unwrap();
        let resource = FileResource {
            path,
            state: FileState::Symlink {
                target: "/new".into(),
            },
        };
        let err = apply_file(&resource, &ctx).unwrap_err();
        assert!(err.to_string().contains("not a symlink"));
    }

    #[test]
    fn test_absent_variants() {
        let dir = tempfile::tempdir().unwrap();
        let (ctx, _) = context();

        // missing already: converged, no mutation
        let missing = FileResource {
            path: dir.path().join("missing"),
            state: FileState::Absent,
        };
        assert!(!apply_file(&missing, &ctx).unwrap());

        // plain files and symlinks go away unconditionally
        let file = dir.path().join("f");
        std::fs::write(&file, b"x").unwrap();
        let resource = FileResource {
            path: file.clone(),
            state: FileState::Absent,
        };
        assert!(apply_file(&resource, &ctx).unwrap());
        assert!(!file.exists());

        // empty directories go away, populated ones are refused
        let sub = dir.path().join("sub");
        std::fs::create_dir(&sub).unwrap();
        std::fs::write(sub.join("keep"), b"x").unwrap();
        let resource = FileResource {
            path: sub.clone(),
            state: FileState::Absent,
        };
        assert!(apply_file(&resource, &ctx).is_err());
        assert!(sub.exists());
        std::fs::remove_file(sub.join("keep")).unwrap();
        assert!(apply_file(&resource, &ctx).unwrap());
        assert!(!sub.exists());
    }

    #[test]
    fn test_relative_path_is_refused() {
        let (ctx, _) = context();
        let resource = plain(Path::new("relative/path"), None, None);
        assert!(apply_file(&resource, &ctx).unwrap_err().to_string().contains("not absolute"));
    }

    #[test]
    fn test_unknown_owner_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let (ctx, _) = context();
        let path = dir.path().join("owned");
        let resource = FileResource {
            path,
            state: FileState::Plain {
                content: None,
                mode: None,
                owner: Ownership {
                    user: Some("definitely-not-a-user-zzz".into()),
                    group: None,
                },
            },
        };
        let err = apply_file(&resource, &ctx).unwrap_err();
        assert!(format!("{:#}", err).contains("unknown user"));
    }
}
