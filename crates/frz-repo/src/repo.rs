//! Repository discovery, the per-directory engine cache, and bulk add.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::sync::Arc;

use frz_hash::HasherFactory;
use frz_stream::Streamer;

use crate::git::GitClient;
use crate::locator::LocatorConfig;
use crate::progress::Progress;
use crate::topdir::{is_top_dir, AddResult, FillResult, RepairResult, TopDirectory};
use crate::{RepoError, Result, METADATA_DIR};

/// Counters for a bulk `add`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AddSummary {
    pub successful: u64,
    pub duplicates: u64,
    pub non_files: u64,
    pub errors: u64,
}

/// Per-file outcomes reported during a bulk `add`.
pub enum AddEvent<'a> {
    Added(&'a Path),
    Deduplicated(&'a Path),
    Failed(&'a Path, &'a RepoError),
}

struct TopDirRef<const N: usize> {
    topdir: Rc<RefCell<TopDirectory<N>>>,
    /// How many levels down from the repository root this directory is.
    levels: usize,
}

impl<const N: usize> Clone for TopDirRef<N> {
    fn clone(&self) -> Self {
        Self { topdir: self.topdir.clone(), levels: self.levels }
    }
}

/// Zero or more frz repositories, discovered automatically by walking from
/// a working path toward the filesystem root. The cache is keyed by
/// canonical directory path; working paths that share an ancestor share one
/// engine instance.
pub struct Frz<const N: usize> {
    streamer: Arc<dyn Streamer>,
    make_hasher: HasherFactory<N>,
    hash_name: String,
    top_dirs: HashMap<PathBuf, TopDirRef<N>>,
}

/// The engine at the default 256-bit width.
pub type Frz256 = Frz<32>;

impl<const N: usize> Frz<N> {
    pub fn new(
        streamer: Arc<dyn Streamer>,
        make_hasher: HasherFactory<N>,
        hash_name: impl Into<String>,
    ) -> Self {
        Self {
            streamer,
            make_hasher,
            hash_name: hash_name.into(),
            top_dirs: HashMap::new(),
        }
    }

    /// Add one file to the repository that owns it.
    pub fn add_file(&mut self, file: &Path) -> Result<AddResult> {
        let found = self.top_dir(file)?;
        let mut topdir = found.topdir.borrow_mut();
        topdir.add_file(file, found.levels)
    }

    /// Identify and fetch missing content in the repository that owns
    /// `path`.
    pub fn fill(
        &mut self,
        path: &Path,
        content_sources: Vec<LocatorConfig>,
        progress: &dyn Progress,
    ) -> Result<FillResult> {
        let found = self.top_dir(path)?;
        let mut topdir = found.topdir.borrow_mut();
        topdir.fill(content_sources, progress)
    }

    /// Fix problems in the repository that owns `path`.
    pub fn repair(
        &mut self,
        path: &Path,
        verify_all_hashes: bool,
        content_sources: Vec<LocatorConfig>,
        progress: &dyn Progress,
    ) -> Result<RepairResult> {
        let found = self.top_dir(path)?;
        let mut topdir = found.topdir.borrow_mut();
        topdir.repair(verify_all_hashes, content_sources, progress)
    }

    /// Bulk add: files are added directly, directories recursively. Entries
    /// named like the metadata directory or ignored by git are skipped, as
    /// are non-regular non-symlink entries. Per-file errors are counted and
    /// reported through `on_event`; they never abort the sweep. Staged
    /// symlinks are flushed to git at the end.
    pub fn add_all(
        &mut self,
        working_dir: &Path,
        files: &[PathBuf],
        git: &mut GitClient,
        on_event: &mut dyn FnMut(AddEvent<'_>),
    ) -> AddSummary {
        let mut summary = AddSummary::default();
        for file in files {
            let path = working_dir.join(file);
            if is_skipped(&path, git) {
                continue;
            }
            let is_dir = fs::symlink_metadata(&path).map(|m| m.is_dir()).unwrap_or(false);
            if is_dir {
                self.add_dir_entries(&path, git, &mut summary, on_event);
            } else {
                self.add_one(&path, git, &mut summary, on_event);
            }
        }
        git.flush();
        summary
    }

    fn add_dir_entries(
        &mut self,
        dir: &Path,
        git: &mut GitClient,
        summary: &mut AddSummary,
        on_event: &mut dyn FnMut(AddEvent<'_>),
    ) {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) => {
                summary.errors += 1;
                on_event(AddEvent::Failed(dir, &RepoError::Io(e)));
                return;
            }
        };
        for entry in entries {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    summary.errors += 1;
                    on_event(AddEvent::Failed(dir, &RepoError::Io(e)));
                    continue;
                }
            };
            let path = entry.path();
            if is_skipped(&path, git) {
                continue;
            }
            match entry.file_type() {
                Ok(file_type) if file_type.is_dir() => {
                    self.add_dir_entries(&path, git, summary, on_event);
                }
                Ok(_) => self.add_one(&path, git, summary, on_event),
                Err(e) => {
                    summary.errors += 1;
                    on_event(AddEvent::Failed(&path, &RepoError::Io(e)));
                }
            }
        }
    }

    fn add_one(
        &mut self,
        path: &Path,
        git: &mut GitClient,
        summary: &mut AddSummary,
        on_event: &mut dyn FnMut(AddEvent<'_>),
    ) {
        let meta = match fs::symlink_metadata(path) {
            Ok(meta) => meta,
            Err(e) => {
                summary.errors += 1;
                on_event(AddEvent::Failed(path, &RepoError::Io(e)));
                return;
            }
        };
        if !meta.is_file() && !meta.file_type().is_symlink() {
            summary.non_files += 1;
            return;
        }
        match self.add_file(path) {
            Ok(AddResult::NewFile) => {
                summary.successful += 1;
                on_event(AddEvent::Added(path));
            }
            Ok(AddResult::DuplicateFile) => {
                summary.duplicates += 1;
                on_event(AddEvent::Deduplicated(path));
            }
            Ok(AddResult::Symlink) => {}
            Err(e) => {
                summary.errors += 1;
                on_event(AddEvent::Failed(path, &e));
                return;
            }
        }
        // The path is a symlink now; stage that, not the old file.
        git.stage(path);
    }

    /// The repository owning `path`, from the cache or by walking upward.
    fn top_dir(&mut self, path: &Path) -> Result<TopDirRef<N>> {
        let canonical = non_leaf_canonical(path).map_err(|_| RepoError::RepositoryNotFound {
            path: path.to_path_buf(),
        })?;
        let dir = if fs::metadata(&canonical).map(|m| m.is_dir()).unwrap_or(false) {
            canonical
        } else {
            canonical
                .parent()
                .ok_or_else(|| RepoError::RepositoryNotFound { path: path.to_path_buf() })?
                .to_path_buf()
        };
        self.lookup(&dir, path)
    }

    fn lookup(&mut self, dir: &Path, original: &Path) -> Result<TopDirRef<N>> {
        if let Some(cached) = self.top_dirs.get(dir) {
            return Ok(cached.clone());
        }
        let found = if is_top_dir(dir) {
            TopDirRef {
                topdir: Rc::new(RefCell::new(TopDirectory::new(
                    dir.to_path_buf(),
                    self.streamer.clone(),
                    self.make_hasher.clone(),
                    self.hash_name.clone(),
                ))),
                levels: 0,
            }
        } else {
            let parent = dir.parent().ok_or_else(|| RepoError::RepositoryNotFound {
                path: original.to_path_buf(),
            })?;
            let up = self.lookup(parent, original)?;
            TopDirRef { topdir: up.topdir, levels: up.levels + 1 }
        };
        self.top_dirs.insert(dir.to_path_buf(), found.clone());
        Ok(found)
    }
}

fn is_skipped(path: &Path, git: &mut GitClient) -> bool {
    path.file_name().is_some_and(|name| name == METADATA_DIR) || git.is_ignored(path)
}

/// Canonicalize everything but the final path element: the leaf may be a
/// symlink (possibly dangling) that must not be resolved, since frozen
/// files are exactly such symlinks.
fn non_leaf_canonical(path: &Path) -> std::io::Result<PathBuf> {
    let parent = path.parent().filter(|p| !p.as_os_str().is_empty());
    match (parent, path.file_name()) {
        (Some(parent), Some(name)) => Ok(parent.canonicalize()?.join(name)),
        _ => path.canonicalize(),
    }
}
