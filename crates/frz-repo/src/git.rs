//! The external-VCS collaborator: ignore lookups and staging of the
//! symlinks frz leaves behind, tolerant of there being no git at all.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use git2::Repository;
use tracing::{debug, warn};

/// Zero or more git repositories, discovered lazily by walking upward from
/// the paths the engine touches. Discovery results are cached per directory,
/// and each repository is opened at most once.
///
/// When no git repository owns a path, every operation is a silent success.
#[derive(Default)]
pub struct GitClient {
    /// Repository handles keyed by their gitdir path.
    repos_by_gitdir: HashMap<PathBuf, Rc<Repository>>,
    /// Discovery cache: worktree directory to owning repository, `None` when
    /// no repository owns the directory.
    by_worktree_dir: HashMap<PathBuf, Option<Rc<Repository>>>,
}

impl GitClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Is the given path ignored by the git repository that owns it?
    pub fn is_ignored(&mut self, path: &Path) -> bool {
        match self.repo_for(path) {
            Some(repo) => repo.is_path_ignored(path).unwrap_or(false),
            None => false,
        }
    }

    /// Add the given file to the in-memory index of the repository that
    /// owns it. Failures are tolerated (logged, not propagated).
    pub fn stage(&mut self, path: &Path) {
        let Some(repo) = self.repo_for(path) else {
            return;
        };
        let staged = stage_in(&repo, path);
        if let Err(e) = staged {
            warn!("could not stage {}: {}", path.display(), e);
        }
    }

    /// Write every touched index back to disk.
    pub fn flush(&mut self) {
        for repo in self.repos_by_gitdir.values() {
            let written = repo.index().and_then(|mut index| index.write());
            if let Err(e) = written {
                warn!("could not write git index for {}: {}", repo.path().display(), e);
            }
        }
    }

    /// The repository that owns `path`, or `None`. A file path is resolved
    /// to its parent directory first, so discovery never starts on a
    /// symlink.
    fn repo_for(&mut self, path: &Path) -> Option<Rc<Repository>> {
        let is_dir = fs::metadata(path).map(|m| m.is_dir()).unwrap_or(false);
        let dir = if is_dir { path } else { path.parent()? };
        if let Some(cached) = self.by_worktree_dir.get(dir) {
            return cached.clone();
        }
        let found = match Repository::discover(dir) {
            Ok(repo) => {
                let gitdir = repo.path().to_path_buf();
                let handle = self
                    .repos_by_gitdir
                    .entry(gitdir)
                    .or_insert_with(|| Rc::new(repo))
                    .clone();
                Some(handle)
            }
            Err(e) => {
                debug!("no git repository owns {}: {}", dir.display(), e);
                None
            }
        };
        self.by_worktree_dir.insert(dir.to_path_buf(), found.clone());
        found
    }
}

fn stage_in(repo: &Repository, path: &Path) -> Result<(), git2::Error> {
    let workdir = repo
        .workdir()
        .ok_or_else(|| git2::Error::from_str("repository has no worktree"))?;
    let relative = path.strip_prefix(workdir).unwrap_or(path);
    let mut index = repo.index()?;
    index.add_path(relative)?;
    Ok(())
}
