use std::collections::HashMap;
use std::sync::Mutex;

use crate::{SysError, SysResult, System};

/// Name to numeric id cache. `None` records a name known to be missing, so a
/// missing user does not trigger repeated lookups.
///
/// The lock is held across the underlying lookup, making it single flight:
/// two workers racing on the same name perform one lookup.
#[derive(Default)]
struct NameCache {
    entries: Mutex<HashMap<String, Option<u32>>>,
}

impl NameCache {
    fn get_or_lookup<F>(&self, name: &str, lookup: F) -> SysResult<Option<u32>>
    where
        F: FnOnce() -> SysResult<Option<u32>>,
    {
        let mut entries = self.entries.lock().unwrap();
        if let Some(cached) = entries.get(name) {
            return Ok(*cached);
        }
        let resolved = lookup()?;
        entries.insert(name.to_owned(), resolved);
        Ok(resolved)
    }
}

/// User and group resolution caches for one apply run.
///
/// Shared across the workers; file and directory appliers populate it lazily
/// while applying ownership.
#[derive(Default)]
pub struct OwnerResolver {
    users: NameCache,
    groups: NameCache,
}

impl OwnerResolver {
    /// Make empty caches.
    pub fn new() -> OwnerResolver {
        OwnerResolver::default()
    }

    /// Numeric id of a user, resolving through `system` on the first call.
    pub fn uid(&self, system: &dyn System, name: &str) -> SysResult<u32> {
        self.users
            .get_or_lookup(name, || match system.lookup_user(name) {
                Ok(uid) => Ok(Some(uid)),
                Err(SysError::UnknownUser(_)) => Ok(None),
                Err(e) => Err(e),
            })?
            .ok_or_else(|| SysError::UnknownUser(name.to_owned()))
    }

    /// Numeric id of a group, resolving through `system` on the first call.
    pub fn gid(&self, system: &dyn System, name: &str) -> SysResult<u32> {
        self.groups
            .get_or_lookup(name, || match system.lookup_group(name) {
                Ok(gid) => Ok(Some(gid)),
                Err(SysError::UnknownGroup(_)) => Ok(None),
                Err(e) => Err(e),
            })?
            .ok_or_else(|| SysError::UnknownGroup(name.to_owned()))
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::path::{Path, PathBuf};
    use std::sync::atomic::{AtomicUsize, Ordering};

    use pretty_assertions::assert_eq;

    use crate::{
        CommandOutput, CommandSpec, FileHandle, Metadata, SysResult, System,
    };

    use super::*;

    /// Counts name lookups, resolving only the user "known".
    #[derive(Default)]
    struct CountingSystem {
        lookups: AtomicUsize,
    }

    impl System for CountingSystem {
        fn lstat(&self, _: &Path) -> SysResult<Option<Metadata>> {
            unimplemented!()
        }
        fn read_link(&self, _: &Path) -> SysResult<PathBuf> {
            unimplemented!()
        }
        fn mkdir(&self, _: &Path, _: u32) -> SysResult<()> {
            unimplemented!()
        }
        fn remove(&self, _: &Path) -> SysResult<()> {
            unimplemented!()
        }
        fn symlink(&self, _: &Path, _: &Path) -> SysResult<()> {
            unimplemented!()
        }
        fn create_file(&self, _: &Path, _: u32) -> SysResult<Box<dyn Write + Send>> {
            unimplemented!()
        }
        fn open_file(&self, _: &Path) -> SysResult<Box<dyn FileHandle>> {
            unimplemented!()
        }
        fn chmod(&self, _: &Path, _: u32) -> SysResult<()> {
            unimplemented!()
        }
        fn chown(&self, _: &Path, _: Option<u32>, _: Option<u32>) -> SysResult<()> {
            unimplemented!()
        }
        fn lookup_user(&self, name: &str) -> SysResult<u32> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            if name == "known" {
                Ok(1000)
            } else {
                Err(SysError::UnknownUser(name.into()))
            }
        }
        fn lookup_group(&self, name: &str) -> SysResult<u32> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            Err(SysError::UnknownGroup(name.into()))
        }
        fn run(&self, _: &CommandSpec) -> SysResult<CommandOutput> {
            unimplemented!()
        }
    }

    #[test]
    fn test_hits_are_cached() {
        let sys = CountingSystem::default();
        let resolver = OwnerResolver::new();
        assert_eq!(resolver.uid(&sys, "known").unwrap(), 1000);
        assert_eq!(resolver.uid(&sys, "known").unwrap(), 1000);
        assert_eq!(sys.lookups.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_misses_are_cached_too() {
        let sys = CountingSystem::default();
        let resolver = OwnerResolver::new();
        assert!(resolver.uid(&sys, "nobody-here").is_err());
        assert!(resolver.uid(&sys, "nobody-here").is_err());
        assert_eq!(sys.lookups.load(Ordering::SeqCst), 1);

        assert!(resolver.gid(&sys, "no-group").is_err());
        assert!(resolver.gid(&sys, "no-group").is_err());
        assert_eq!(sys.lookups.load(Ordering::SeqCst), 2);
    }
}
