//! Maps from content ID to blob path.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::info;

use frz_hash::{is_base32, shard_path, ContentId, SHARD_DIGITS, SHARD_LEVELS};

use crate::fsutil::{lexical_normal, relative_from};
use crate::{Result, StoreError};

/// A map from [`ContentId`] to blob path.
pub trait HashIndex<const N: usize> {
    /// Bind `id` to `path`. Returns `true` if newly inserted, `false` if the
    /// ID was already present (the existing binding wins).
    fn insert(&mut self, id: &ContentId<N>, path: &Path) -> Result<bool>;

    fn contains(&self, id: &ContentId<N>) -> Result<bool>;

    /// Iterate every entry, removing the syntactically invalid ones and
    /// those for which `is_good` answers `false`. Idempotent.
    fn scrub(&mut self, is_good: &mut dyn FnMut(&ContentId<N>, &Path) -> bool) -> Result<()>;
}

/// In-memory index, for tooling that only needs duplicate detection.
#[derive(Default)]
pub struct MemHashIndex<const N: usize> {
    entries: HashMap<ContentId<N>, PathBuf>,
}

impl<const N: usize> MemHashIndex<N> {
    pub fn new() -> Self {
        Self { entries: HashMap::new() }
    }
}

impl<const N: usize> HashIndex<N> for MemHashIndex<N> {
    fn insert(&mut self, id: &ContentId<N>, path: &Path) -> Result<bool> {
        match self.entries.entry(*id) {
            std::collections::hash_map::Entry::Occupied(_) => Ok(false),
            std::collections::hash_map::Entry::Vacant(slot) => {
                slot.insert(path.to_path_buf());
                Ok(true)
            }
        }
    }

    fn contains(&self, id: &ContentId<N>) -> Result<bool> {
        Ok(self.entries.contains_key(id))
    }

    fn scrub(&mut self, is_good: &mut dyn FnMut(&ContentId<N>, &Path) -> bool) -> Result<()> {
        self.entries.retain(|id, path| is_good(id, path));
        Ok(())
    }
}

/// On-disk index: one symlink per entry, sharded two levels deep by the
/// leading base-32 digits of the ID. The symlink target is the blob path
/// relative to the symlink's own directory, so the whole tree can be moved
/// as a unit.
pub struct DiskHashIndex<const N: usize> {
    root: PathBuf,
}

impl<const N: usize> DiskHashIndex<N> {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn entry_path(&self, id: &ContentId<N>) -> PathBuf {
        self.root.join(shard_path(&id.to_base32()))
    }
}

impl<const N: usize> HashIndex<N> for DiskHashIndex<N> {
    fn insert(&mut self, id: &ContentId<N>, path: &Path) -> Result<bool> {
        let entry = self.entry_path(id);
        match fs::symlink_metadata(&entry) {
            Ok(meta) if meta.file_type().is_symlink() => return Ok(false),
            Ok(_) => {
                return Err(StoreError::Storage(format!(
                    "{} exists but is not a symlink",
                    entry.display()
                )))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        let entry_dir = entry.parent().ok_or_else(|| {
            StoreError::Storage(format!("{} has no parent directory", entry.display()))
        })?;
        fs::create_dir_all(entry_dir)?;
        let target = relative_from(&lexical_normal(path), &lexical_normal(entry_dir));
        match std::os::unix::fs::symlink(&target, &entry) {
            Ok(()) => Ok(true),
            // Lost a race; the existing entry wins.
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(StoreError::Storage(format!(
                "creating index symlink {}: {}",
                entry.display(),
                e
            ))),
        }
    }

    fn contains(&self, id: &ContentId<N>) -> Result<bool> {
        let entry = self.entry_path(id);
        match fs::symlink_metadata(&entry) {
            Ok(meta) if meta.file_type().is_symlink() => Ok(true),
            Ok(_) => Err(StoreError::Storage(format!(
                "{} exists but is not a symlink",
                entry.display()
            ))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn scrub(&mut self, is_good: &mut dyn FnMut(&ContentId<N>, &Path) -> bool) -> Result<()> {
        match fs::symlink_metadata(&self.root) {
            Ok(meta) if meta.is_dir() => scrub_dir::<N>(&self.root, "", is_good),
            Ok(_) => Err(StoreError::Storage(format!(
                "{} is not a directory",
                self.root.display()
            ))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

fn scrub_dir<const N: usize>(
    dir: &Path,
    prefix: &str,
    is_good: &mut dyn FnMut(&ContentId<N>, &Path) -> bool,
) -> Result<()> {
    let mut to_remove = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            info!("Removing {} because its name is not valid UTF-8.", path.display());
            to_remove.push(path);
            continue;
        };
        let file_type = entry.file_type()?;
        if prefix.len() == SHARD_LEVELS * SHARD_DIGITS {
            // Leaf level: symlinks named by the tail of a content ID.
            if !file_type.is_symlink() {
                info!("Removing {} because it isn't a symlink.", path.display());
                to_remove.push(path);
            } else if let Ok(id) = ContentId::<N>::from_base32(&format!("{prefix}{name}")) {
                match fs::read_link(&path) {
                    Ok(target) => {
                        if !is_good(&id, &dir.join(target)) {
                            // `is_good` reports its own reason.
                            to_remove.push(path);
                        }
                    }
                    Err(e) => {
                        info!(
                            "Removing {} because its target could not be read: {}.",
                            path.display(),
                            e
                        );
                        to_remove.push(path);
                    }
                }
            } else {
                info!("Removing {} because its filename is not a hash.", path.display());
                to_remove.push(path);
            }
        } else {
            // Shard level: two-digit subdirectories only.
            if !file_type.is_dir() {
                info!("Removing {} because it's not a directory.", path.display());
                to_remove.push(path);
            } else if name.len() != SHARD_DIGITS || !is_base32(name) {
                info!("Removing {} because its name is malformed.", path.display());
                to_remove.push(path);
            } else {
                scrub_dir::<N>(&path, &format!("{prefix}{name}"), is_good)?;
            }
        }
    }
    for path in to_remove {
        let is_dir = fs::symlink_metadata(&path).map(|m| m.is_dir()).unwrap_or(false);
        if is_dir {
            fs::remove_dir_all(&path)?;
        } else {
            fs::remove_file(&path)?;
        }
    }
    Ok(())
}
