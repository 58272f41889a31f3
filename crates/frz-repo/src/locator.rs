//! Directory-based content locators.
//!
//! A locator answers "give me the file with this content ID" for one
//! external directory tree. It starts out knowing only file sizes (one
//! relatively cheap traversal) and hashes candidates lazily: a file whose
//! size matches no requested ID is never read at all.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tracing::warn;

use frz_hash::{ContentId, HasherFactory, SizeHasher};
use frz_store::ContentStore;
use frz_stream::{
    FileSource, ForkedStream, SecondaryStreamDecision, SharedSink, Streamer,
};

use crate::progress::Progress;
use crate::Result;

/// One locator directory as configured by the user: `read_only` locators may
/// only be copied from, the rest may have matching files moved away.
#[derive(Debug, Clone)]
pub struct LocatorConfig {
    pub path: PathBuf,
    pub read_only: bool,
}

/// Outcome of a successful candidate search.
struct Found {
    /// The matching file in the locator directory.
    external: PathBuf,
    /// Set when the search already wrote the blob into the content store
    /// (the fused hash-and-insert path).
    inserted: Option<PathBuf>,
}

pub(crate) struct DirectoryLocator<const N: usize> {
    dir: PathBuf,
    read_only: bool,
    streamer: Arc<dyn Streamer>,
    make_hasher: HasherFactory<N>,
    /// Files whose hashes are known, from earlier candidate scans.
    files_by_hash: HashMap<ContentId<N>, PathBuf>,
    /// Files whose hashes are not yet known, bucketed by size. Buckets are
    /// never empty.
    files_by_size: HashMap<u64, Vec<PathBuf>>,
    files_listed: bool,
}

impl<const N: usize> DirectoryLocator<N> {
    pub(crate) fn new(
        dir: PathBuf,
        read_only: bool,
        streamer: Arc<dyn Streamer>,
        make_hasher: HasherFactory<N>,
    ) -> Self {
        Self {
            dir,
            read_only,
            streamer,
            make_hasher,
            files_by_hash: HashMap::new(),
            files_by_size: HashMap::new(),
            files_listed: false,
        }
    }

    /// Fetch a file with the given ID into the content store. Returns the
    /// inserted blob path, or `None` if this locator cannot supply the
    /// content. Failures never propagate; they degrade into `None`.
    pub(crate) fn fetch(
        &mut self,
        id: &ContentId<N>,
        content_store: &ContentStore,
        progress: &dyn Progress,
    ) -> Option<PathBuf> {
        match self.try_fetch(id, content_store, progress) {
            Ok(found) => found,
            Err(e) => {
                warn!("When fetching {}: {}", id.to_base32(), e);
                None
            }
        }
    }

    fn try_fetch(
        &mut self,
        id: &ContentId<N>,
        content_store: &ContentStore,
        progress: &dyn Progress,
    ) -> Result<Option<PathBuf>> {
        self.list_files(progress);
        let Some(found) = self.find_file(id, content_store, progress)? else {
            return Ok(None);
        };
        match found.inserted {
            Some(blob) => {
                // The fused search already copied the bytes into the store;
                // moving means the external original goes away.
                fs::remove_file(&found.external)?;
                Ok(Some(blob))
            }
            None if self.read_only => {
                Ok(Some(content_store.copy_insert(&found.external, &*self.streamer)?))
            }
            None => Ok(Some(content_store.move_insert(&found.external, &*self.streamer)?)),
        }
    }

    /// Traverse the directory tree once and bucket every regular file (not
    /// symlinks to them) by size. Per-file errors are logged and skipped.
    fn list_files(&mut self, progress: &dyn Progress) {
        if self.files_listed {
            return;
        }
        let mut task = progress.task(&format!("Listing files in {}", self.dir.display()));
        let counter = task.counter("files");
        for entry in walkdir::WalkDir::new(&self.dir) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!("While listing {}: {}", self.dir.display(), e);
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            match entry.metadata() {
                Ok(meta) => {
                    self.files_by_size.entry(meta.len()).or_default().push(entry.into_path());
                    counter.inc(1);
                }
                Err(e) => warn!("While listing {}: {}", entry.path().display(), e),
            }
        }
        self.files_listed = true;
    }

    /// Locate a file with the given ID, hashing same-sized candidates until
    /// one matches. Hashes learned along the way are cached for later
    /// requests. In move mode the candidate's bytes are streamed into the
    /// content store while being hashed, so a match needs no second read.
    fn find_file(
        &mut self,
        id: &ContentId<N>,
        content_store: &ContentStore,
        progress: &dyn Progress,
    ) -> Result<Option<Found>> {
        if let Some(path) = self.files_by_hash.get(id) {
            return Ok(Some(Found { external: path.clone(), inserted: None }));
        }
        let Some(mut bucket) = self.files_by_size.remove(&id.size()) else {
            return Ok(None);
        };
        let mut task = progress.task("Hashing files");
        let file_counter = task.counter("files");
        let byte_counter = task.counter("bytes");

        while let Some(path) = bucket.pop() {
            let hashed = if self.read_only {
                self.hash_only(&path, &byte_counter)
            } else {
                self.hash_into_store(&path, id, content_store, &byte_counter)
            };
            file_counter.inc(1);
            let (candidate_id, inserted) = match hashed {
                Ok(outcome) => outcome,
                Err(e) => {
                    warn!("When reading {}: {}", path.display(), e);
                    continue;
                }
            };
            self.files_by_hash.entry(candidate_id).or_insert_with(|| path.clone());
            if candidate_id == *id {
                if !bucket.is_empty() {
                    self.files_by_size.insert(id.size(), bucket);
                }
                return Ok(Some(Found { external: path, inserted }));
            }
        }
        Ok(None)
    }

    fn hash_only(
        &self,
        path: &Path,
        byte_counter: &crate::progress::Counter,
    ) -> Result<(ContentId<N>, Option<PathBuf>)> {
        let mut source = FileSource::open(path)?;
        let mut hasher = SizeHasher::new((self.make_hasher)());
        let counter = byte_counter.clone();
        self.streamer
            .stream_with_progress(&mut source, &mut hasher, &mut move |n| counter.inc(n as u64))?;
        Ok((hasher.finish(), None))
    }

    /// Hash the candidate and write it into the store in one pass through a
    /// forked stream. The written blob is kept only when the hash matches.
    fn hash_into_store(
        &self,
        path: &Path,
        wanted: &ContentId<N>,
        content_store: &ContentStore,
        byte_counter: &crate::progress::Counter,
    ) -> Result<(ContentId<N>, Option<PathBuf>)> {
        let mut source = FileSource::open(path)?;
        let hasher = Mutex::new(SizeHasher::new((self.make_hasher)()));
        let mut hashed: Option<ContentId<N>> = None;
        let inserted = content_store.stream_insert(&mut |content_sink| {
            let mut primary = SharedSink::new(&hasher);
            let hashed = &mut hashed;
            let counter = byte_counter.clone();
            self.streamer
                .forked_stream(ForkedStream {
                    source: &mut source,
                    primary_sink: &mut primary,
                    secondary_sink: content_sink,
                    primary_done: &mut || {
                        let id = hasher.lock().unwrap().finish();
                        let matched = id == *wanted;
                        *hashed = Some(id);
                        if matched {
                            SecondaryStreamDecision::Finish
                        } else {
                            SecondaryStreamDecision::Abandon
                        }
                    },
                    primary_progress: &mut move |n| counter.inc(n as u64),
                    secondary_progress: &mut |_| {},
                })
                .map_err(frz_store::StoreError::from)?;
            Ok(hashed.is_some_and(|id| id == *wanted))
        })?;
        let id = hashed.expect("forked stream finished without a primary verdict");
        Ok((id, inserted))
    }
}
