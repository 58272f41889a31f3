//! Scaffolding for tests that exercise whole repositories.
//!
//! Builds throwaway repository trees and inspects the symlink chains the
//! engine leaves behind. Only compiled into test builds of dependent
//! crates; nothing here is used by the engine itself.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use frz_hash::blake3_factory;
use frz_store::lexical_normal;
use frz_stream::{MultiThreadedStreamer, MultiThreadedStreamerOptions, Streamer};

use crate::repo::Frz256;
use crate::METADATA_DIR;

/// A scratch frz repository in a temporary directory, with builder-style
/// helpers for laying out files before an operation and inspecting the
/// result afterwards.
pub struct TestRepo {
    dir: tempfile::TempDir,
}

impl TestRepo {
    /// A fresh repository: a tempdir whose root carries a real `.frz/`.
    pub fn new() -> Self {
        let dir = tempfile::TempDir::new().expect("creating scratch directory");
        fs::create_dir(dir.path().join(METADATA_DIR)).expect("creating metadata directory");
        Self { dir }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Write a file, creating parent directories as needed.
    pub fn file(&self, path: impl AsRef<Path>, contents: impl AsRef<[u8]>) -> PathBuf {
        let full = self.dir.path().join(path.as_ref());
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent).expect("creating parent directories");
        }
        fs::write(&full, contents).expect("writing file");
        full
    }

    pub fn dir(&self, path: impl AsRef<Path>) -> PathBuf {
        let full = self.dir.path().join(path.as_ref());
        fs::create_dir_all(&full).expect("creating directory");
        full
    }

    pub fn symlink(&self, link: impl AsRef<Path>, target: impl AsRef<Path>) -> PathBuf {
        let full = self.dir.path().join(link.as_ref());
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent).expect("creating parent directories");
        }
        std::os::unix::fs::symlink(target.as_ref(), &full).expect("creating symlink");
        full
    }

    /// Follow `link` symlink by symlink: the result starts with `link`
    /// itself and ends with the first path that is not a symlink. Paths are
    /// lexically normalized.
    pub fn follow_symlinks(&self, link: impl AsRef<Path>) -> Vec<PathBuf> {
        let mut chain = vec![lexical_normal(&self.dir.path().join(link.as_ref()))];
        loop {
            let current = chain.last().expect("chain is never empty");
            let meta = match fs::symlink_metadata(current) {
                Ok(meta) => meta,
                Err(_) => break,
            };
            if !meta.file_type().is_symlink() {
                break;
            }
            let target = fs::read_link(current).expect("reading symlink");
            let parent = current.parent().expect("symlinks have parents").to_path_buf();
            chain.push(lexical_normal(&parent.join(target)));
        }
        chain
    }

    /// Every path under the repository, sorted, relative to the root.
    pub fn recursive_list(&self) -> Vec<PathBuf> {
        let mut paths = Vec::new();
        let mut stack = vec![self.dir.path().to_path_buf()];
        while let Some(dir) = stack.pop() {
            for entry in fs::read_dir(&dir).expect("listing directory") {
                let entry = entry.expect("reading directory entry");
                let path = entry.path();
                if entry.file_type().expect("entry file type").is_dir() {
                    stack.push(path.clone());
                }
                paths.push(
                    path.strip_prefix(self.dir.path())
                        .expect("entries live under the root")
                        .to_path_buf(),
                );
            }
        }
        paths.sort();
        paths
    }
}

impl Default for TestRepo {
    fn default() -> Self {
        Self::new()
    }
}

/// An engine with small streaming buffers, so multi-buffer interleaving
/// shows up even in small-file tests.
pub fn test_engine() -> Frz256 {
    let streamer: Arc<dyn Streamer> = Arc::new(MultiThreadedStreamer::new(
        MultiThreadedStreamerOptions { num_buffers: 4, bytes_per_buffer: 4096 },
    ));
    Frz256::new(streamer, blake3_factory(), "blake3")
}
