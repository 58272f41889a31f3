//! # frz-store
//!
//! Durable content storage: an immutable, write-protected blob directory
//! ([`ContentStore`]) and a map from content ID to blob path ([`HashIndex`],
//! with an on-disk sharded-symlink implementation and an in-memory one).

mod fsutil;
mod index;
mod store;

pub use fsutil::{
    is_readonly, lexical_normal, relative_from, relative_subtree_path, remove_write_permissions,
};
pub use index::{DiskHashIndex, HashIndex, MemHashIndex};
pub use store::ContentStore;

/// Errors from the storage layer.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// A destination path was already occupied. Handled internally by the
    /// insert retry loops; callers normally never see it.
    #[error("destination file already exists")]
    FileExists,

    /// The on-disk layout is not what it should be (e.g. an index entry
    /// that exists but is not a symlink).
    #[error("storage error: {0}")]
    Storage(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<frz_stream::StreamError> for StoreError {
    fn from(e: frz_stream::StreamError) -> Self {
        match e {
            frz_stream::StreamError::FileExists => StoreError::FileExists,
            frz_stream::StreamError::Io(io) => StoreError::Io(io),
        }
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
