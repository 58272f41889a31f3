//! The content-addressed blob directory.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use rand::Rng;

use frz_hash::DIGITS;
use frz_stream::{FileSink, FileSource, StreamSink, Streamer};

use crate::fsutil::{relative_subtree_path, remove_write_permissions};
use crate::{Result, StoreError};

/// The maximum number of random directory levels used when suggesting
/// destination filenames.
const MAX_CONTENT_DEPTH: usize = 4;

/// A directory of immutable blobs. Blob paths inside the store are an
/// implementation detail and may be reorganized at any time; every file is
/// write-protected once fully inserted.
pub struct ContentStore {
    root: PathBuf,
}

impl ContentStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Stream the given file into the store. Returns the new blob path.
    pub fn copy_insert(&self, source: &Path, streamer: &dyn Streamer) -> Result<PathBuf> {
        let mut depth = 0;
        loop {
            let destination = self.suggest_destination(&mut depth)?;
            let mut sink = match FileSink::create_new(&destination) {
                Ok(sink) => sink,
                // Collision; try another, longer, random path name.
                Err(frz_stream::StreamError::FileExists) => continue,
                Err(e) => return Err(e.into()),
            };
            let mut file = FileSource::open(source)?;
            streamer.stream(&mut file, &mut sink)?;
            drop(sink);
            remove_write_permissions(&destination)?;
            return Ok(destination);
        }
    }

    /// Move the given file into the store, falling back to copying if the
    /// source is a symlink or lives on a different filesystem. Returns the
    /// new blob path.
    pub fn move_insert(&self, source: &Path, streamer: &dyn Streamer) -> Result<PathBuf> {
        if fs::symlink_metadata(source)?.file_type().is_symlink() {
            // Moving either the symlink or its target is unlikely to be
            // what the user expects; copy the pointed-to bytes instead.
            return self.copy_insert(source, streamer);
        }
        let mut depth = 0;
        loop {
            let destination = self.suggest_destination(&mut depth)?;
            // Hard-link-plus-unlink instead of rename: rename would
            // silently overwrite an existing destination.
            match fs::hard_link(source, &destination) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
                Err(e) if e.raw_os_error() == Some(libc::EXDEV) => {
                    return self.copy_insert(source, streamer);
                }
                Err(e) => return Err(e.into()),
            }
            fs::remove_file(source)?;
            remove_write_permissions(&destination)?;
            return Ok(destination);
        }
    }

    /// Allocate a destination and hand a write sink to `write`. If the
    /// callback answers `true` the file is kept (write-protected) and its
    /// path returned; otherwise it is removed.
    pub fn stream_insert(
        &self,
        write: &mut dyn FnMut(&mut dyn StreamSink) -> Result<bool>,
    ) -> Result<Option<PathBuf>> {
        let mut depth = 0;
        loop {
            let destination = self.suggest_destination(&mut depth)?;
            let mut sink = match FileSink::create_new(&destination) {
                Ok(sink) => sink,
                Err(frz_stream::StreamError::FileExists) => continue,
                Err(e) => return Err(e.into()),
            };
            let keep = match write(&mut sink) {
                Ok(keep) => keep,
                Err(e) => {
                    drop(sink);
                    let _ = fs::remove_file(&destination);
                    return Err(e);
                }
            };
            drop(sink);
            if keep {
                remove_write_permissions(&destination)?;
                return Ok(Some(destination));
            }
            fs::remove_file(&destination)?;
            return Ok(None);
        }
    }

    /// Visit every regular file in the store. The callback receives the
    /// file's path and its canonical (store-relative) form.
    pub fn for_each<E, F>(&self, mut callback: F) -> std::result::Result<(), E>
    where
        E: From<StoreError>,
        F: FnMut(&Path, &Path) -> std::result::Result<(), E>,
    {
        if !self.root.exists() {
            return Ok(());
        }
        for entry in walkdir::WalkDir::new(&self.root) {
            let entry = entry.map_err(|e| {
                StoreError::Io(e.into_io_error().unwrap_or_else(|| io::Error::other("walk error")))
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            let canonical = relative_subtree_path(entry.path(), &self.root)
                .ok_or_else(|| {
                    StoreError::Storage(format!(
                        "{} is not under the content directory",
                        entry.path().display()
                    ))
                })?;
            callback(entry.path(), &canonical)?;
        }
        Ok(())
    }

    /// `p` expressed relative to the store root, or `None` if `p` does not
    /// lie within the store.
    pub fn canonical_path(&self, p: &Path) -> Option<PathBuf> {
        relative_subtree_path(p, &self.root)
    }

    /// Generate a fresh random destination path with `depth` directory
    /// levels, creating the directories. Deeper names are suggested after
    /// each collision so the namespace widens as the store grows. Directory
    /// names start with a digit from the lower half of the alphabet and
    /// filenames from the upper half, so the two never collide.
    fn suggest_destination(&self, depth: &mut usize) -> Result<PathBuf> {
        let mut rng = rand::thread_rng();
        let mut destination = self.root.clone();
        for _ in 0..*depth {
            let dirname = [DIGITS[rng.gen_range(0..=15)], DIGITS[rng.gen_range(0..32)]];
            destination.push(std::str::from_utf8(&dirname).unwrap());
        }
        fs::create_dir_all(&destination)?;
        let filename = [DIGITS[rng.gen_range(16..32)], DIGITS[rng.gen_range(0..32)]];
        destination.push(std::str::from_utf8(&filename).unwrap());
        if *depth < MAX_CONTENT_DEPTH {
            *depth += 1;
        }
        Ok(destination)
    }
}
