//! # frz-repo
//!
//! The repository engine. An frz repository is a directory tree whose root
//! contains a real `.frz/` metadata directory; every user file below it is
//! replaced by a relative symlink that resolves, through a per-directory
//! `.frz` indirection symlink, to a hash-keyed index entry and finally to a
//! write-protected blob in `.frz/content/`.
//!
//! [`Frz`] discovers repositories by walking upward from any working path
//! and dispatches the three operations: `add` (freeze files into content
//! storage), `fill` (fetch missing content from locator directories), and
//! `repair` (verify the index, adopt orphan blobs, then fetch what is still
//! missing).

mod git;
mod locator;
mod progress;
mod repo;
pub mod testing;
mod topdir;

pub use git::GitClient;
pub use locator::LocatorConfig;
pub use progress::{Counter, NullProgress, Progress, Task};
pub use repo::{AddEvent, AddSummary, Frz, Frz256};
pub use topdir::{AddResult, FillResult, RepairResult};

use std::path::PathBuf;

/// Name of the metadata directory (a real directory at the repository root,
/// an indirection symlink everywhere below it).
pub const METADATA_DIR: &str = ".frz";

/// Blob directory inside the metadata directory.
pub const CONTENT_DIR: &str = "content";

/// Parallel blob area for content the engine decided it did not need.
pub const UNUSED_CONTENT_DIR: &str = "unused-content";

/// Errors from the repository engine.
#[derive(Debug, thiserror::Error)]
pub enum RepoError {
    /// Walked all the way to the filesystem root without finding a
    /// metadata directory.
    #[error("found no .frz directory for {}", path.display())]
    RepositoryNotFound { path: PathBuf },

    /// A path the engine wished to create is occupied by something
    /// incompatible.
    #[error("could not create symlink {}, because something with that name already exists", path.display())]
    PathConflict { path: PathBuf },

    #[error(transparent)]
    Store(#[from] frz_store::StoreError),

    #[error(transparent)]
    Stream(#[from] frz_stream::StreamError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("git error: {0}")]
    Git(#[from] git2::Error),
}

pub type Result<T> = std::result::Result<T, RepoError>;
