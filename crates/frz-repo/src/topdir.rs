//! One frz repository and its three operations.

use std::collections::HashSet;
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::info;

use frz_hash::{shard_path, symlink_target_base32, ContentId, HasherFactory, SizeHasher};
use frz_store::{
    is_readonly, remove_write_permissions, ContentStore, DiskHashIndex, HashIndex,
};
use frz_stream::{fill_buffer, FileSource, Streamer};

use crate::locator::{DirectoryLocator, LocatorConfig};
use crate::progress::{Counter, Progress};
use crate::{RepoError, Result, CONTENT_DIR, METADATA_DIR, UNUSED_CONTENT_DIR};

/// What `add` did with one file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddResult {
    /// The file's bytes were new; they are now the indexed blob.
    NewFile,
    /// Identical bytes were already stored; the spare copy went to the
    /// unused-content area.
    DuplicateFile,
    /// The path was already a symlink; nothing to do.
    Symlink,
}

/// Result of `fill`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FillResult {
    /// Missing content files we were able to fetch.
    pub num_fetched: u64,
    /// Content files that are still missing.
    pub num_still_missing: u64,
}

/// Result of `repair`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RepairResult {
    /// Index symlinks that point to good content. (Kept.)
    pub num_good_index_symlinks: u64,
    /// Index symlinks that didn't point to the content they were supposed
    /// to. (Removed.)
    pub num_bad_index_symlinks: u64,
    /// Content files that didn't have index symlinks. (Now they do.)
    pub num_missing_index_symlinks: u64,
    /// Content files that couldn't be indexed because another file already
    /// carries their hash. (Moved to unused-content/.)
    pub num_duplicate_content_files: u64,
    /// Missing content files we were able to fetch.
    pub num_fetched: u64,
    /// Content files that are still missing.
    pub num_still_missing: u64,
}

/// Does this directory contain a real (non-symlink) metadata directory?
pub(crate) fn is_top_dir(dir: &Path) -> bool {
    let meta_dir = dir.join(METADATA_DIR);
    fs::symlink_metadata(dir).map(|m| m.is_dir()).unwrap_or(false)
        && fs::symlink_metadata(meta_dir).map(|m| m.is_dir()).unwrap_or(false)
}

/// One repository, rooted at the directory that holds the real `.frz/`.
pub(crate) struct TopDirectory<const N: usize> {
    path: PathBuf,
    hash_index: DiskHashIndex<N>,
    content_store: ContentStore,
    unused_content_store: ContentStore,
    streamer: Arc<dyn Streamer>,
    make_hasher: HasherFactory<N>,
    hash_name: String,
}

impl<const N: usize> TopDirectory<N> {
    pub(crate) fn new(
        path: PathBuf,
        streamer: Arc<dyn Streamer>,
        make_hasher: HasherFactory<N>,
        hash_name: String,
    ) -> Self {
        let metadata = path.join(METADATA_DIR);
        Self {
            hash_index: DiskHashIndex::new(metadata.join(&hash_name)),
            content_store: ContentStore::new(metadata.join(CONTENT_DIR)),
            unused_content_store: ContentStore::new(metadata.join(UNUSED_CONTENT_DIR)),
            path,
            streamer,
            make_hasher,
            hash_name,
        }
    }

    /// Freeze one file: hash it, move its bytes into content storage, and
    /// leave a relative symlink in its place.
    pub(crate) fn add_file(&mut self, file: &Path, subdir_levels: usize) -> Result<AddResult> {
        let dir = file.parent().ok_or_else(|| RepoError::RepositoryNotFound {
            path: file.to_path_buf(),
        })?;
        self.ensure_indirection_chain(dir, subdir_levels)?;
        if fs::symlink_metadata(file)?.file_type().is_symlink() {
            return Ok(AddResult::Symlink);
        }

        let mut source = FileSource::open(file)?;
        let mut hasher = SizeHasher::new((self.make_hasher)());
        self.streamer.stream(&mut source, &mut hasher)?;
        drop(source);
        let id = hasher.finish();
        let base32 = id.to_base32();

        // Move the file aside under a name containing its hash, then put the
        // symlink where it used to be. Only then does the content move into
        // the store, so an interruption leaves the bytes next to the link.
        let temp = temp_filename(file, &self.hash_name, &base32);
        fs::rename(file, &temp)?;
        std::os::unix::fs::symlink(self.symlink_target(&base32), file)?;

        let content_path = self.content_store.move_insert(&temp, &*self.streamer)?;
        if self.hash_index.insert(&id, &content_path)? {
            Ok(AddResult::NewFile)
        } else {
            self.unused_content_store.move_insert(&content_path, &*self.streamer)?;
            Ok(AddResult::DuplicateFile)
        }
    }

    pub(crate) fn fill(
        &mut self,
        content_sources: Vec<LocatorConfig>,
        progress: &dyn Progress,
    ) -> Result<FillResult> {
        let fetched = self.fetch_missing_content(content_sources, progress)?;
        Ok(FillResult {
            num_fetched: fetched.num_fetched,
            num_still_missing: fetched.num_still_missing,
        })
    }

    pub(crate) fn repair(
        &mut self,
        verify_all_hashes: bool,
        content_sources: Vec<LocatorConfig>,
        progress: &dyn Progress,
    ) -> Result<RepairResult> {
        let index_check = self.check_index_symlinks(verify_all_hashes, progress)?;
        let content_check = self.check_content_files(&index_check.indexed_content_files, progress)?;
        let fetched = self.fetch_missing_content(content_sources, progress)?;
        Ok(RepairResult {
            num_good_index_symlinks: index_check.num_good_index_symlinks,
            num_bad_index_symlinks: index_check.num_bad_index_symlinks,
            num_missing_index_symlinks: content_check.num_missing_index_symlinks,
            num_duplicate_content_files: content_check.num_duplicate_content_files,
            num_fetched: fetched.num_fetched,
            num_still_missing: fetched.num_still_missing,
        })
    }

    /// Indirection symlinks for `dir` and every directory between it and
    /// the repository root, so user-facing symlinks resolve from any depth.
    fn ensure_indirection_chain(&self, dir: &Path, subdir_levels: usize) -> Result<()> {
        if subdir_levels == 0 {
            return self.ensure_indirection(dir, 0);
        }
        let mut current = dir.to_path_buf();
        let mut level = subdir_levels;
        loop {
            self.ensure_indirection(&current, level)?;
            level -= 1;
            if level == 0 {
                return Ok(());
            }
            match current.parent() {
                Some(parent) => current = parent.to_path_buf(),
                None => return Ok(()),
            }
        }
    }

    /// Make sure `dir` carries the `.frz` indirection symlink pointing back
    /// up to the repository root. Idempotent; replaces a wrong-target
    /// symlink, refuses to touch anything that isn't a symlink.
    pub(crate) fn ensure_indirection(&self, dir: &Path, subdir_levels: usize) -> Result<()> {
        let link = dir.join(METADATA_DIR);
        if subdir_levels == 0 {
            // The repository root holds the real metadata directory.
            return match fs::symlink_metadata(&link) {
                Ok(meta) if meta.is_dir() => Ok(()),
                _ => Err(RepoError::PathConflict { path: link }),
            };
        }
        let mut target = PathBuf::new();
        for _ in 0..subdir_levels {
            target.push("..");
        }
        target.push(METADATA_DIR);

        match fs::symlink_metadata(&link) {
            Ok(meta) if meta.file_type().is_symlink() => {
                if fs::read_link(&link)? == target {
                    return Ok(());
                }
                fs::remove_file(&link)?;
            }
            Ok(_) => return Err(RepoError::PathConflict { path: link }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        std::os::unix::fs::symlink(&target, &link)?;
        Ok(())
    }

    /// Target string written into user-facing symlinks. Resolves through
    /// the per-directory indirection symlink, so it works from any depth.
    fn symlink_target(&self, base32: &str) -> PathBuf {
        Path::new(METADATA_DIR).join(&self.hash_name).join(shard_path(base32))
    }
}

fn temp_filename(file: &Path, hash_name: &str, base32: &str) -> PathBuf {
    let mut name = OsString::from(file.as_os_str());
    name.push(format!(".frz-{hash_name}-{base32}"));
    PathBuf::from(name)
}

/// Phase A result: which index entries survived.
struct CheckIndexResult {
    num_good_index_symlinks: u64,
    num_bad_index_symlinks: u64,
    /// Canonical (store-relative) paths of content files with good entries.
    indexed_content_files: HashSet<PathBuf>,
}

/// Phase B result: orphan and duplicate accounting.
#[derive(Default)]
struct CheckContentResult {
    num_missing_index_symlinks: u64,
    num_duplicate_content_files: u64,
}

#[derive(Default)]
struct FetchResult {
    num_fetched: u64,
    num_still_missing: u64,
}

impl<const N: usize> TopDirectory<N> {
    /// Repair phase A: verify every index entry, keeping the good ones and
    /// removing the bad ones. Verification failures never propagate; they
    /// mark the entry bad.
    fn check_index_symlinks(
        &mut self,
        verify_all_hashes: bool,
        progress: &dyn Progress,
    ) -> Result<CheckIndexResult> {
        let mut task = progress.task("Checking index links and content files");
        let link_counter = task.counter("links");
        let file_counter = task.counter("files");

        let mut result = CheckIndexResult {
            num_good_index_symlinks: 0,
            num_bad_index_symlinks: 0,
            indexed_content_files: HashSet::new(),
        };
        let content_store = &self.content_store;
        let streamer = &*self.streamer;
        let make_hasher = &self.make_hasher;

        let mut verify = |id: &ContentId<N>,
                          content_path: &Path|
         -> std::result::Result<PathBuf, String> {
            let canonical = content_store.canonical_path(content_path).ok_or_else(|| {
                format!(
                    "it points to {}, which is outside the content directory",
                    content_path.display()
                )
            })?;
            let meta = fs::metadata(content_path).map_err(|e| {
                format!("it points to {}, which cannot be read: {}", canonical.display(), e)
            })?;
            if !meta.is_file() {
                return Err(format!(
                    "it points to {}, which isn't a regular file",
                    canonical.display()
                ));
            }
            if meta.len() != id.size() {
                return Err(format!(
                    "it points to {}, which has the wrong size (expected {}, actual {})",
                    canonical.display(),
                    id.size(),
                    meta.len()
                ));
            }
            file_counter.inc(1);
            if verify_all_hashes {
                let mut source = FileSource::open(content_path)
                    .map_err(|e| format!("opening {}: {}", canonical.display(), e))?;
                let mut hasher = SizeHasher::new(make_hasher());
                streamer
                    .stream(&mut source, &mut hasher)
                    .map_err(|e| format!("reading {}: {}", canonical.display(), e))?;
                let actual = hasher.finish();
                if actual != *id {
                    return Err(format!(
                        "it points to {}, which has the wrong hash ({})",
                        canonical.display(),
                        actual.to_base32()
                    ));
                }
            } else {
                let mut source = FileSource::open(content_path)
                    .map_err(|e| format!("opening {}: {}", canonical.display(), e))?;
                let mut first_byte = [0u8; 1];
                let outcome = fill_buffer(&mut source, &mut first_byte)
                    .map_err(|e| format!("reading {}: {}", canonical.display(), e))?;
                if outcome.num_bytes == 0 && id.size() >= 1 {
                    return Err(format!(
                        "it points to {}; reading the first byte immediately hit end-of-file",
                        canonical.display()
                    ));
                }
                if outcome.num_bytes == 1 && id.size() < 1 {
                    return Err(format!(
                        "it points to {}; it's supposed to be an empty file, but reading the \
                         first byte succeeded",
                        canonical.display()
                    ));
                }
            }
            Ok(canonical)
        };

        self.hash_index.scrub(&mut |id, content_path| {
            link_counter.inc(1);
            match verify(id, content_path) {
                Ok(canonical) => {
                    result.num_good_index_symlinks += 1;
                    result.indexed_content_files.insert(canonical);
                    true
                }
                Err(reason) => {
                    info!("Removing {} from the index because {}.", id.to_base32(), reason);
                    result.num_bad_index_symlinks += 1;
                    false
                }
            }
        })?;
        Ok(result)
    }

    /// Repair phase B: walk the content store, re-protect writable blobs,
    /// index orphans, and demote duplicates to unused-content/. Files in
    /// `indexed_content_files` are trusted to have index entries already.
    fn check_content_files(
        &mut self,
        indexed_content_files: &HashSet<PathBuf>,
        progress: &dyn Progress,
    ) -> Result<CheckContentResult> {
        let mut task = progress.task("Checking orphaned content files");
        let file_counter = task.counter("files");
        let byte_counter = task.counter("bytes");

        let mut result = CheckContentResult::default();
        let content_store = &self.content_store;
        let unused_content_store = &self.unused_content_store;
        let hash_index = &mut self.hash_index;
        let streamer = &*self.streamer;
        let make_hasher = &self.make_hasher;

        content_store.for_each::<RepoError, _>(|path, canonical| {
            if !is_readonly(&fs::metadata(path)?) {
                info!("Removing write permissions from {}.", canonical.display());
                remove_write_permissions(path)?;
            }
            if indexed_content_files.contains(canonical) {
                return Ok(());
            }
            let mut source = FileSource::open(path)?;
            let mut hasher = SizeHasher::new(make_hasher());
            let counter = byte_counter.clone();
            streamer.stream_with_progress(&mut source, &mut hasher, &mut move |n| {
                counter.inc(n as u64)
            })?;
            let id = hasher.finish();
            if hash_index.insert(&id, path)? {
                info!(
                    "Adding {} to the index, pointing to {} (content was already present, but \
                     not indexed).",
                    id.to_base32(),
                    canonical.display()
                );
                result.num_missing_index_symlinks += 1;
            } else {
                unused_content_store.move_insert(path, streamer)?;
                info!(
                    "Moving duplicate content file {} to unused-content/ (hash {}).",
                    canonical.display(),
                    id.to_base32()
                );
                result.num_duplicate_content_files += 1;
            }
            file_counter.inc(1);
            Ok(())
        })?;
        Ok(result)
    }

    /// Fill / repair phase C: walk the repository's user files and fetch
    /// content the index doesn't have, trying unused-content/ first and
    /// then the configured locators in order.
    fn fetch_missing_content(
        &mut self,
        content_sources: Vec<LocatorConfig>,
        progress: &dyn Progress,
    ) -> Result<FetchResult> {
        let mut task = progress.task("Checking that referenced content is present");
        let link_counter = task.counter("links");

        let mut locators = Vec::new();
        let unused_content_path = self.path.join(METADATA_DIR).join(UNUSED_CONTENT_DIR);
        if unused_content_path.exists() {
            locators.push(DirectoryLocator::new(
                unused_content_path,
                false,
                self.streamer.clone(),
                self.make_hasher.clone(),
            ));
        }
        for source in content_sources {
            locators.push(DirectoryLocator::new(
                source.path,
                source.read_only,
                self.streamer.clone(),
                self.make_hasher.clone(),
            ));
        }

        let mut result = FetchResult::default();
        let root = self.path.clone();
        self.fetch_missing_in_dir(&mut result, &link_counter, &mut locators, &root, 0, progress)?;
        Ok(result)
    }

    fn fetch_missing_in_dir(
        &mut self,
        result: &mut FetchResult,
        link_counter: &Counter,
        locators: &mut [DirectoryLocator<N>],
        dir: &Path,
        subdir_levels: usize,
        progress: &dyn Progress,
    ) -> Result<()> {
        if subdir_levels > 0 && is_top_dir(dir) {
            // A nested repository owns its own content; leave it alone.
            return Ok(());
        }
        let mut good_indirection = false;
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            if entry.file_name() == METADATA_DIR {
                continue;
            }
            let file_type = entry.file_type()?;
            if file_type.is_dir() {
                self.fetch_missing_in_dir(
                    result,
                    link_counter,
                    locators,
                    &entry.path(),
                    subdir_levels + 1,
                    progress,
                )?;
            } else if file_type.is_symlink() {
                let target = fs::read_link(entry.path())?;
                let Some(base32) = symlink_target_base32(METADATA_DIR, &self.hash_name, &target)
                else {
                    continue;
                };
                let Ok(id) = ContentId::<N>::from_base32(&base32) else {
                    continue;
                };

                // One of ours.
                link_counter.inc(1);
                if !good_indirection {
                    self.ensure_indirection(dir, subdir_levels)?;
                    good_indirection = true;
                }
                if self.hash_index.contains(&id)? {
                    continue;
                }
                let mut fetched = false;
                for locator in locators.iter_mut() {
                    if let Some(content_path) = locator.fetch(&id, &self.content_store, progress) {
                        fetched = self.hash_index.insert(&id, &content_path)?;
                        debug_assert!(fetched, "freshly fetched ID was already indexed");
                        break;
                    }
                }
                if fetched {
                    result.num_fetched += 1;
                } else {
                    result.num_still_missing += 1;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn temp_filename_embeds_hash_name_and_id() {
        let temp = temp_filename(Path::new("/w/data.bin"), "blake3", "abc123");
        assert_eq!(temp, Path::new("/w/data.bin.frz-blake3-abc123"));
    }

    #[test]
    fn is_top_dir_requires_a_real_metadata_directory() {
        let dir = tempfile::tempdir().unwrap();
        assert!(!is_top_dir(dir.path()));
        fs::create_dir(dir.path().join(METADATA_DIR)).unwrap();
        assert!(is_top_dir(dir.path()));

        let sub = dir.path().join("sub");
        fs::create_dir(&sub).unwrap();
        std::os::unix::fs::symlink("../.frz", sub.join(METADATA_DIR)).unwrap();
        assert!(!is_top_dir(&sub));
    }
}
