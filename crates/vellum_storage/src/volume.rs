//! Named files and directories.
//!
//! A volume is the namespace a data directory lives in. Names are relative,
//! `/`-separated paths such as `databases/database-3/collection-7.dat`.
//!
//! ```text
//! Volume
//! ├─ open(name)          -> Box<dyn StorageBackend>   (creates if missing)
//! ├─ write_atomic(name)  -> temp file + rename        (manifest writes)
//! ├─ create_dir / rename / remove / list / exists
//! └─ read_file(name)     -> Option<bytes>
//! ```

use crate::backend::StorageBackend;
use crate::error::{StorageError, StorageResult};
use crate::file::FileBackend;
use crate::memory::InMemoryBackend;
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// A namespace of files and directories.
pub trait Volume: Send + Sync + fmt::Debug {
    /// Opens the file `name`, creating it and its parent directories if
    /// missing.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or created.
    fn open(&self, name: &str) -> StorageResult<Box<dyn StorageBackend>>;

    /// Returns true if a file or directory called `name` exists.
    fn exists(&self, name: &str) -> bool;

    /// Removes a file, or a directory and everything below it.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::NotFound`] if nothing is called `name`.
    fn remove(&self, name: &str) -> StorageResult<()>;

    /// Renames a file or directory. The target must not exist.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::NotFound`] or [`StorageError::AlreadyExists`].
    fn rename(&self, from: &str, to: &str) -> StorageResult<()>;

    /// Creates a directory and any missing parents.
    ///
    /// # Errors
    ///
    /// Returns an error if creation fails.
    fn create_dir(&self, name: &str) -> StorageResult<()>;

    /// Lists the direct children of directory `name` (`""` for the root),
    /// sorted. A missing directory lists as empty.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be read.
    fn list(&self, name: &str) -> StorageResult<Vec<String>>;

    /// Reads a whole file, or `None` if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read.
    fn read_file(&self, name: &str) -> StorageResult<Option<Vec<u8>>>;

    /// Replaces the file `name` with `data` so that a crash leaves either the
    /// old or the new content.
    ///
    /// # Errors
    ///
    /// Returns an error if any step of write, sync or rename fails.
    fn write_atomic(&self, name: &str, data: &[u8]) -> StorageResult<()>;
}

fn parent_of(name: &str) -> Option<&str> {
    name.rfind('/').map(|idx| &name[..idx])
}

fn child_prefix(name: &str) -> String {
    if name.is_empty() {
        String::new()
    } else {
        format!("{name}/")
    }
}

#[derive(Debug, Default)]
struct Tree {
    files: BTreeMap<String, InMemoryBackend>,
    dirs: BTreeSet<String>,
}

impl Tree {
    fn add_parents(&mut self, name: &str) {
        let mut current = parent_of(name);
        while let Some(dir) = current {
            if !self.dirs.insert(dir.to_string()) {
                break;
            }
            current = parent_of(dir);
        }
    }

    fn contains(&self, name: &str) -> bool {
        self.files.contains_key(name) || self.dirs.contains(name)
    }
}

/// A shared in-memory volume.
///
/// Clones refer to the same tree. [`MemoryVolume::simulate_crash`] drops
/// unflushed bytes of every file; opening an engine on the same volume
/// afterwards behaves like a restart after a killed process.
#[derive(Debug, Clone, Default)]
pub struct MemoryVolume {
    tree: Arc<RwLock<Tree>>,
}

impl MemoryVolume {
    /// Creates an empty volume.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Drops every byte that was not flushed, in every file.
    pub fn simulate_crash(&self) {
        for file in self.tree.read().files.values() {
            file.simulate_crash();
        }
    }

    /// Returns a handle onto the bytes of file `name`, if it exists.
    #[must_use]
    pub fn file(&self, name: &str) -> Option<InMemoryBackend> {
        self.tree.read().files.get(name).cloned()
    }

    /// Returns all file names, sorted.
    #[must_use]
    pub fn file_names(&self) -> Vec<String> {
        self.tree.read().files.keys().cloned().collect()
    }

    /// Copies every file into a new, independent volume. Unflushed bytes
    /// are copied as flushed.
    #[must_use]
    pub fn deep_clone(&self) -> Self {
        let tree = self.tree.read();
        let copy = Tree {
            files: tree
                .files
                .iter()
                .map(|(name, file)| (name.clone(), InMemoryBackend::with_data(file.data())))
                .collect(),
            dirs: tree.dirs.clone(),
        };
        Self {
            tree: Arc::new(RwLock::new(copy)),
        }
    }
}

impl Volume for MemoryVolume {
    fn open(&self, name: &str) -> StorageResult<Box<dyn StorageBackend>> {
        let mut tree = self.tree.write();
        if tree.dirs.contains(name) {
            return Err(StorageError::AlreadyExists {
                name: name.to_string(),
            });
        }
        tree.add_parents(name);
        let file = tree.files.entry(name.to_string()).or_default().clone();
        Ok(Box::new(file))
    }

    fn exists(&self, name: &str) -> bool {
        self.tree.read().contains(name)
    }

    fn remove(&self, name: &str) -> StorageResult<()> {
        let mut tree = self.tree.write();
        if tree.files.remove(name).is_some() {
            return Ok(());
        }
        if !tree.dirs.remove(name) {
            return Err(StorageError::not_found(name));
        }
        let prefix = child_prefix(name);
        tree.files.retain(|key, _| !key.starts_with(&prefix));
        tree.dirs.retain(|key| !key.starts_with(&prefix));
        Ok(())
    }

    fn rename(&self, from: &str, to: &str) -> StorageResult<()> {
        let mut tree = self.tree.write();
        if tree.contains(to) {
            return Err(StorageError::AlreadyExists {
                name: to.to_string(),
            });
        }
        if let Some(file) = tree.files.remove(from) {
            tree.add_parents(to);
            tree.files.insert(to.to_string(), file);
            return Ok(());
        }
        if !tree.dirs.remove(from) {
            return Err(StorageError::not_found(from));
        }
        tree.add_parents(to);
        tree.dirs.insert(to.to_string());

        let old_prefix = child_prefix(from);
        let new_prefix = child_prefix(to);
        let moved_files: Vec<String> = tree
            .files
            .keys()
            .filter(|key| key.starts_with(&old_prefix))
            .cloned()
            .collect();
        for key in moved_files {
            if let Some(file) = tree.files.remove(&key) {
                let renamed = format!("{new_prefix}{}", &key[old_prefix.len()..]);
                tree.files.insert(renamed, file);
            }
        }
        let moved_dirs: Vec<String> = tree
            .dirs
            .iter()
            .filter(|key| key.starts_with(&old_prefix))
            .cloned()
            .collect();
        for key in moved_dirs {
            tree.dirs.remove(&key);
            tree.dirs
                .insert(format!("{new_prefix}{}", &key[old_prefix.len()..]));
        }
        Ok(())
    }

    fn create_dir(&self, name: &str) -> StorageResult<()> {
        let mut tree = self.tree.write();
        if tree.files.contains_key(name) {
            return Err(StorageError::AlreadyExists {
                name: name.to_string(),
            });
        }
        tree.add_parents(name);
        tree.dirs.insert(name.to_string());
        Ok(())
    }

    fn list(&self, name: &str) -> StorageResult<Vec<String>> {
        let tree = self.tree.read();
        let prefix = child_prefix(name);
        let mut children = BTreeSet::new();
        let entries = tree
            .files
            .keys()
            .map(String::as_str)
            .chain(tree.dirs.iter().map(String::as_str));
        for entry in entries {
            if let Some(rest) = entry.strip_prefix(prefix.as_str()) {
                if let Some(child) = rest.split('/').next().filter(|c| !c.is_empty()) {
                    children.insert(child.to_string());
                }
            }
        }
        Ok(children.into_iter().collect())
    }

    fn read_file(&self, name: &str) -> StorageResult<Option<Vec<u8>>> {
        Ok(self.tree.read().files.get(name).map(InMemoryBackend::data))
    }

    fn write_atomic(&self, name: &str, data: &[u8]) -> StorageResult<()> {
        let mut tree = self.tree.write();
        tree.add_parents(name);
        tree.files
            .insert(name.to_string(), InMemoryBackend::with_data(data.to_vec()));
        Ok(())
    }
}

/// A volume rooted at a directory of the OS file system.
#[derive(Debug, Clone)]
pub struct FsVolume {
    root: PathBuf,
}

impl FsVolume {
    /// Creates a volume rooted at `root`. The directory is created if missing.
    ///
    /// # Errors
    ///
    /// Returns an error if the root cannot be created.
    pub fn new(root: &Path) -> StorageResult<Self> {
        fs::create_dir_all(root)?;
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    /// Returns the root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Maps a volume name to an OS path.
    #[must_use]
    pub fn path_of(&self, name: &str) -> PathBuf {
        name.split('/')
            .filter(|part| !part.is_empty())
            .fold(self.root.clone(), |path, part| path.join(part))
    }

    #[cfg(unix)]
    fn sync_dir(path: &Path) -> StorageResult<()> {
        fs::File::open(path)?.sync_all()?;
        Ok(())
    }

    #[cfg(not(unix))]
    fn sync_dir(_path: &Path) -> StorageResult<()> {
        Ok(())
    }

    fn sync_parent(&self, path: &Path) -> StorageResult<()> {
        match path.parent() {
            Some(parent) => Self::sync_dir(parent),
            None => Self::sync_dir(&self.root),
        }
    }
}

impl Volume for FsVolume {
    fn open(&self, name: &str) -> StorageResult<Box<dyn StorageBackend>> {
        Ok(Box::new(FileBackend::open_with_create_dirs(
            &self.path_of(name),
        )?))
    }

    fn exists(&self, name: &str) -> bool {
        self.path_of(name).exists()
    }

    fn remove(&self, name: &str) -> StorageResult<()> {
        let path = self.path_of(name);
        if path.is_dir() {
            fs::remove_dir_all(&path)?;
        } else if path.exists() {
            fs::remove_file(&path)?;
        } else {
            return Err(StorageError::not_found(name));
        }
        self.sync_parent(&path)
    }

    fn rename(&self, from: &str, to: &str) -> StorageResult<()> {
        let source = self.path_of(from);
        let target = self.path_of(to);
        if !source.exists() {
            return Err(StorageError::not_found(from));
        }
        if target.exists() {
            return Err(StorageError::AlreadyExists {
                name: to.to_string(),
            });
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::rename(&source, &target)?;
        self.sync_parent(&target)
    }

    fn create_dir(&self, name: &str) -> StorageResult<()> {
        let path = self.path_of(name);
        fs::create_dir_all(&path)?;
        self.sync_parent(&path)
    }

    fn list(&self, name: &str) -> StorageResult<Vec<String>> {
        let path = self.path_of(name);
        if !path.is_dir() {
            return Ok(Vec::new());
        }
        let mut names = Vec::new();
        for entry in fs::read_dir(&path)? {
            names.push(entry?.file_name().to_string_lossy().into_owned());
        }
        names.sort();
        Ok(names)
    }

    fn read_file(&self, name: &str) -> StorageResult<Option<Vec<u8>>> {
        let path = self.path_of(name);
        if !path.is_file() {
            return Ok(None);
        }
        Ok(Some(fs::read(path)?))
    }

    fn write_atomic(&self, name: &str, data: &[u8]) -> StorageResult<()> {
        use std::io::Write;

        let target = self.path_of(name);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        let temp = target.with_extension("tmp");
        {
            let mut file = fs::File::create(&temp)?;
            file.write_all(data)?;
            file.sync_all()?;
        }
        fs::rename(&temp, &target)?;
        self.sync_parent(&target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn exercise(volume: &dyn Volume) {
        let mut wal = volume.open("wal.log").unwrap();
        wal.append(b"entry").unwrap();
        wal.flush().unwrap();
        assert_eq!(volume.read_file("wal.log").unwrap().unwrap(), b"entry");

        volume.create_dir("databases/tmp-1").unwrap();
        let mut datafile = volume.open("databases/tmp-1/collection-2.dat").unwrap();
        datafile.append(b"doc").unwrap();
        datafile.flush().unwrap();

        volume
            .rename("databases/tmp-1", "databases/database-1")
            .unwrap();
        assert!(!volume.exists("databases/tmp-1"));
        assert!(volume.exists("databases/database-1/collection-2.dat"));
        assert_eq!(
            volume.list("databases").unwrap(),
            vec!["database-1".to_string()]
        );
        assert_eq!(
            volume.list("databases/database-1").unwrap(),
            vec!["collection-2.dat".to_string()]
        );

        volume.write_atomic("MANIFEST", b"v1").unwrap();
        volume.write_atomic("MANIFEST", b"v2").unwrap();
        assert_eq!(volume.read_file("MANIFEST").unwrap().unwrap(), b"v2");

        volume.remove("databases/database-1").unwrap();
        assert!(!volume.exists("databases/database-1/collection-2.dat"));
        assert!(matches!(
            volume.remove("databases/database-1"),
            Err(StorageError::NotFound { .. })
        ));
        assert!(volume.read_file("missing").unwrap().is_none());
        assert!(volume.list("missing").unwrap().is_empty());
    }

    #[test]
    fn memory_volume_directory_operations() {
        exercise(&MemoryVolume::new());
    }

    #[test]
    fn fs_volume_directory_operations() {
        let dir = tempdir().unwrap();
        exercise(&FsVolume::new(dir.path()).unwrap());
    }

    #[test]
    fn deep_clone_is_independent() {
        let volume = MemoryVolume::new();
        let mut file = volume.open("wal.log").unwrap();
        file.append(b"one").unwrap();

        let copy = volume.deep_clone();
        file.append(b"two").unwrap();
        copy.simulate_crash();
        assert_eq!(copy.read_file("wal.log").unwrap().unwrap(), b"one");
        assert_eq!(volume.read_file("wal.log").unwrap().unwrap(), b"onetwo");
    }

    #[test]
    fn rename_onto_existing_name_fails() {
        let volume = MemoryVolume::new();
        volume.create_dir("a").unwrap();
        volume.create_dir("b").unwrap();
        assert!(matches!(
            volume.rename("a", "b"),
            Err(StorageError::AlreadyExists { .. })
        ));
    }

    #[test]
    fn memory_volume_crash_keeps_flushed_bytes() {
        let volume = MemoryVolume::new();
        let mut file = volume.open("wal.log").unwrap();
        file.append(b"kept").unwrap();
        file.flush().unwrap();
        file.append(b"gone").unwrap();

        volume.simulate_crash();

        let reopened = volume.open("wal.log").unwrap();
        assert_eq!(reopened.read_all().unwrap(), b"kept");
    }

    #[test]
    fn fs_volume_maps_names_below_root() {
        let dir = tempdir().unwrap();
        let volume = FsVolume::new(dir.path()).unwrap();
        assert_eq!(
            volume.path_of("databases/database-1"),
            dir.path().join("databases").join("database-1")
        );
        assert_eq!(volume.root(), dir.path());
    }
}
