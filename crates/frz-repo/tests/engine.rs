//! End-to-end tests for the repository engine: add, fill, and repair
//! against real directory trees.

use std::fs;
use std::os::unix::fs::{symlink, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tempfile::TempDir;

use frz_hash::blake3_factory;
use frz_repo::{
    AddResult, Frz256, GitClient, LocatorConfig, NullProgress, RepoError, METADATA_DIR,
};
use frz_stream::{MultiThreadedStreamer, MultiThreadedStreamerOptions};

fn engine() -> Frz256 {
    let streamer = MultiThreadedStreamer::new(MultiThreadedStreamerOptions {
        num_buffers: 4,
        bytes_per_buffer: 4096,
    });
    Frz256::new(Arc::new(streamer), blake3_factory(), "blake3")
}

/// A scratch repository: a tempdir with a real `.frz` at its root.
fn new_repo() -> TempDir {
    let dir = TempDir::new().unwrap();
    fs::create_dir(dir.path().join(METADATA_DIR)).unwrap();
    dir
}

fn copy_from(path: &Path) -> LocatorConfig {
    LocatorConfig { path: path.to_path_buf(), read_only: true }
}

fn move_from(path: &Path) -> LocatorConfig {
    LocatorConfig { path: path.to_path_buf(), read_only: false }
}

/// Regular files under `dir`, recursively.
fn files_under(dir: &Path) -> Vec<PathBuf> {
    let mut found = Vec::new();
    if !dir.exists() {
        return found;
    }
    let mut stack = vec![dir.to_path_buf()];
    while let Some(d) = stack.pop() {
        for entry in fs::read_dir(&d).unwrap() {
            let entry = entry.unwrap();
            let file_type = entry.file_type().unwrap();
            if file_type.is_dir() {
                stack.push(entry.path());
            } else if file_type.is_file() {
                found.push(entry.path());
            }
        }
    }
    found
}

/// Symlinks under `dir`, recursively.
fn symlinks_under(dir: &Path) -> Vec<PathBuf> {
    let mut found = Vec::new();
    let mut stack = vec![dir.to_path_buf()];
    while let Some(d) = stack.pop() {
        for entry in fs::read_dir(&d).unwrap() {
            let entry = entry.unwrap();
            let file_type = entry.file_type().unwrap();
            if file_type.is_dir() {
                stack.push(entry.path());
            } else if file_type.is_symlink() {
                found.push(entry.path());
            }
        }
    }
    found
}

fn is_readonly(path: &Path) -> bool {
    fs::metadata(path).unwrap().permissions().mode() & 0o222 == 0
}

/// Make the single blob in `.frz/content` writable and rewrite its bytes.
fn corrupt_the_blob(root: &Path, new_contents: &[u8]) -> PathBuf {
    let blobs = files_under(&root.join(".frz/content"));
    assert_eq!(blobs.len(), 1);
    let blob = blobs[0].clone();
    let mut permissions = fs::metadata(&blob).unwrap().permissions();
    permissions.set_mode(permissions.mode() | 0o200);
    fs::set_permissions(&blob, permissions).unwrap();
    fs::write(&blob, new_contents).unwrap();
    blob
}

#[test]
fn add_single_small_file() {
    let repo = new_repo();
    let foo = repo.path().join("foo");
    fs::write(&foo, b"bar").unwrap();

    let mut frz = engine();
    assert_eq!(frz.add_file(&foo).unwrap(), AddResult::NewFile);

    // The file is now a symlink into the metadata directory.
    assert!(fs::symlink_metadata(&foo).unwrap().file_type().is_symlink());
    let target = fs::read_link(&foo).unwrap();
    assert!(target.starts_with(".frz/blake3"), "target was {target:?}");

    // One read-only blob with the original contents.
    let blobs = files_under(&repo.path().join(".frz/content"));
    assert_eq!(blobs.len(), 1);
    assert_eq!(fs::read(&blobs[0]).unwrap(), b"bar");
    assert!(is_readonly(&blobs[0]));

    // Exactly one index symlink, resolving to that blob.
    let index_links = symlinks_under(&repo.path().join(".frz/blake3"));
    assert_eq!(index_links.len(), 1);
    assert_eq!(fs::canonicalize(&index_links[0]).unwrap(), fs::canonicalize(&blobs[0]).unwrap());

    // Reading through the whole chain still yields the bytes.
    assert_eq!(fs::read(&foo).unwrap(), b"bar");
}

#[test]
fn add_nested_file_creates_indirection_symlinks() {
    let repo = new_repo();
    let nested = repo.path().join("sub/dir");
    fs::create_dir_all(&nested).unwrap();
    let foo = nested.join("foo");
    fs::write(&foo, b"gg").unwrap();

    let mut frz = engine();
    assert_eq!(frz.add_file(&foo).unwrap(), AddResult::NewFile);

    assert_eq!(fs::read_link(repo.path().join("sub/.frz")).unwrap(), Path::new("../.frz"));
    assert_eq!(fs::read_link(repo.path().join("sub/dir/.frz")).unwrap(), Path::new("../../.frz"));
    let target = fs::read_link(&foo).unwrap();
    assert!(target.starts_with(".frz/blake3"));
    assert_eq!(fs::read(&foo).unwrap(), b"gg");
}

#[test]
fn add_deduplicates_identical_contents() {
    let repo = new_repo();
    for name in ["a", "b", "c"] {
        fs::write(repo.path().join(name), b"12").unwrap();
    }

    let mut frz = engine();
    let mut git = GitClient::new();
    let paths: Vec<PathBuf> = ["a", "b", "c"].iter().map(PathBuf::from).collect();
    let summary = frz.add_all(repo.path(), &paths, &mut git, &mut |_| {});
    assert_eq!(summary.successful, 1);
    assert_eq!(summary.duplicates, 2);
    assert_eq!(summary.errors, 0);

    let blobs = files_under(&repo.path().join(".frz/content"));
    assert_eq!(blobs.len(), 1);
    assert_eq!(fs::read(&blobs[0]).unwrap(), b"12");

    let spares = files_under(&repo.path().join(".frz/unused-content"));
    assert_eq!(spares.len(), 2);
    for spare in &spares {
        assert_eq!(fs::read(spare).unwrap(), b"12");
    }

    for name in ["a", "b", "c"] {
        let path = repo.path().join(name);
        assert!(fs::symlink_metadata(&path).unwrap().file_type().is_symlink());
        assert_eq!(fs::read(&path).unwrap(), b"12");
    }
}

#[test]
fn adding_a_symlink_is_a_no_op() {
    let repo = new_repo();
    let link = repo.path().join("link");
    symlink("wherever", &link).unwrap();
    let mut frz = engine();
    assert_eq!(frz.add_file(&link).unwrap(), AddResult::Symlink);
    assert_eq!(fs::read_link(&link).unwrap(), Path::new("wherever"));
}

#[test]
fn adding_the_same_file_twice_is_a_no_op_the_second_time() {
    let repo = new_repo();
    let foo = repo.path().join("foo");
    fs::write(&foo, b"once").unwrap();
    let mut frz = engine();
    assert_eq!(frz.add_file(&foo).unwrap(), AddResult::NewFile);
    let target = fs::read_link(&foo).unwrap();
    // The second add sees the frozen symlink and leaves everything alone.
    assert_eq!(frz.add_file(&foo).unwrap(), AddResult::Symlink);
    assert_eq!(fs::read_link(&foo).unwrap(), target);
    assert_eq!(files_under(&repo.path().join(".frz/content")).len(), 1);
    assert!(files_under(&repo.path().join(".frz/unused-content")).is_empty());
}

#[test]
fn add_reports_path_conflict_for_occupied_indirection_name() {
    let repo = new_repo();
    let sub = repo.path().join("sub");
    fs::create_dir(&sub).unwrap();
    // A regular file squatting on the indirection symlink's name.
    fs::write(sub.join(METADATA_DIR), b"squatter").unwrap();
    let file = sub.join("data");
    fs::write(&file, b"x").unwrap();

    let mut frz = engine();
    match frz.add_file(&file) {
        Err(RepoError::PathConflict { .. }) => {}
        other => panic!("expected PathConflict, got {other:?}"),
    }
}

#[test]
fn add_empty_file_and_fast_repair_accepts_it() {
    let repo = new_repo();
    let empty = repo.path().join("empty");
    fs::write(&empty, b"").unwrap();

    let mut frz = engine();
    assert_eq!(frz.add_file(&empty).unwrap(), AddResult::NewFile);
    let blobs = files_under(&repo.path().join(".frz/content"));
    assert_eq!(blobs.len(), 1);
    assert_eq!(fs::metadata(&blobs[0]).unwrap().len(), 0);

    let result = frz.repair(repo.path(), false, Vec::new(), &NullProgress).unwrap();
    assert_eq!(result.num_good_index_symlinks, 1);
    assert_eq!(result.num_bad_index_symlinks, 0);
    assert_eq!(result.num_still_missing, 0);
}

#[test]
fn repair_detects_size_change_and_restores_from_locator() {
    let repo = new_repo();
    let foo = repo.path().join("foo");
    fs::write(&foo, b"bar").unwrap();
    let mut frz = engine();
    frz.add_file(&foo).unwrap();

    // Grow the blob by one byte.
    corrupt_the_blob(repo.path(), b"barX");

    let result = frz.repair(repo.path(), true, Vec::new(), &NullProgress).unwrap();
    assert_eq!(result.num_bad_index_symlinks, 1);
    assert_eq!(result.num_good_index_symlinks, 0);
    assert_eq!(result.num_still_missing, 1);

    // A directory with the correct bytes brings the repository back.
    let rescue = TempDir::new().unwrap();
    fs::write(rescue.path().join("whatever-name"), b"bar").unwrap();
    let result = frz
        .repair(repo.path(), true, vec![copy_from(rescue.path())], &NullProgress)
        .unwrap();
    assert_eq!(result.num_fetched, 1);
    assert_eq!(result.num_still_missing, 0);

    assert_eq!(fs::read(&foo).unwrap(), b"bar");
    for blob in files_under(&repo.path().join(".frz/content")) {
        assert!(is_readonly(&blob));
    }
}

#[test]
fn fast_repair_misses_a_bitflip_but_full_repair_catches_it() {
    let repo = new_repo();
    let foo = repo.path().join("foo");
    fs::write(&foo, b"bar").unwrap();
    let mut frz = engine();
    frz.add_file(&foo).unwrap();

    // Same size, different bytes.
    corrupt_the_blob(repo.path(), b"baz");

    let fast = frz.repair(repo.path(), false, Vec::new(), &NullProgress).unwrap();
    assert_eq!(fast.num_bad_index_symlinks, 0);
    assert_eq!(fast.num_good_index_symlinks, 1);
    assert_eq!(fast.num_still_missing, 0);

    let full = frz.repair(repo.path(), true, Vec::new(), &NullProgress).unwrap();
    assert_eq!(full.num_bad_index_symlinks, 1);
    assert_eq!(full.num_still_missing, 1);
}

#[test]
fn fill_honors_locator_priority_order() {
    let repo = new_repo();
    let c1 = b"first contents".to_vec();
    let c2 = b"second contents!".to_vec();
    let c3 = b"third, longer contents".to_vec();
    for (name, contents) in [("x1", &c1), ("x2", &c2), ("x3", &c3)] {
        fs::write(repo.path().join(name), contents).unwrap();
    }
    let mut frz = engine();
    for name in ["x1", "x2", "x3"] {
        frz.add_file(&repo.path().join(name)).unwrap();
    }

    // Wipe the stored content and the index.
    fs::remove_dir_all(repo.path().join(".frz/content")).unwrap();
    fs::remove_dir_all(repo.path().join(".frz/blake3")).unwrap();

    // Overlapping candidates: sub1 and sub2 both hold c1; sub2 and sub3
    // both hold c2; only sub3 holds c3.
    let sub1 = TempDir::new().unwrap();
    let sub2 = TempDir::new().unwrap();
    let sub3 = TempDir::new().unwrap();
    fs::write(sub1.path().join("f1"), &c1).unwrap();
    fs::write(sub2.path().join("f1"), &c1).unwrap();
    fs::write(sub2.path().join("f2"), &c2).unwrap();
    fs::write(sub3.path().join("f2"), &c2).unwrap();
    fs::write(sub3.path().join("f3"), &c3).unwrap();

    let result = frz
        .fill(
            repo.path(),
            vec![move_from(sub1.path()), copy_from(sub2.path()), move_from(sub3.path())],
            &NullProgress,
        )
        .unwrap();
    assert_eq!(result.num_fetched, 3);
    assert_eq!(result.num_still_missing, 0);

    // c1 was moved out of sub1 (highest priority); sub2 is read-only and
    // keeps everything; c3 was moved out of sub3. c2 came from sub2 by
    // copy, so sub3's copy stayed put.
    assert!(!sub1.path().join("f1").exists());
    assert!(sub2.path().join("f1").exists());
    assert!(sub2.path().join("f2").exists());
    assert!(sub3.path().join("f2").exists());
    assert!(!sub3.path().join("f3").exists());

    for (name, contents) in [("x1", &c1), ("x2", &c2), ("x3", &c3)] {
        assert_eq!(&fs::read(repo.path().join(name)).unwrap(), contents);
    }
    for blob in files_under(&repo.path().join(".frz/content")) {
        assert!(is_readonly(&blob));
    }
}

#[test]
fn fill_prefers_unused_content_over_configured_locators() {
    let repo = new_repo();
    fs::write(repo.path().join("a"), b"same bytes").unwrap();
    fs::write(repo.path().join("b"), b"same bytes").unwrap();
    let mut frz = engine();
    frz.add_file(&repo.path().join("a")).unwrap();
    frz.add_file(&repo.path().join("b")).unwrap();

    // Lose the indexed copy; the spare still sits in unused-content/.
    fs::remove_dir_all(repo.path().join(".frz/content")).unwrap();
    fs::remove_dir_all(repo.path().join(".frz/blake3")).unwrap();
    assert_eq!(files_under(&repo.path().join(".frz/unused-content")).len(), 1);

    let result = frz.fill(repo.path(), Vec::new(), &NullProgress).unwrap();
    assert_eq!(result.num_fetched, 1);
    assert_eq!(result.num_still_missing, 0);

    // The spare was moved back into service.
    assert!(files_under(&repo.path().join(".frz/unused-content")).is_empty());
    assert_eq!(fs::read(repo.path().join("a")).unwrap(), b"same bytes");
    assert_eq!(fs::read(repo.path().join("b")).unwrap(), b"same bytes");
}

#[test]
fn fill_reports_unfillable_content() {
    let repo = new_repo();
    let foo = repo.path().join("foo");
    fs::write(&foo, b"irreplaceable").unwrap();
    let mut frz = engine();
    frz.add_file(&foo).unwrap();

    fs::remove_dir_all(repo.path().join(".frz/content")).unwrap();
    fs::remove_dir_all(repo.path().join(".frz/blake3")).unwrap();

    let empty = TempDir::new().unwrap();
    let result = frz.fill(repo.path(), vec![copy_from(empty.path())], &NullProgress).unwrap();
    assert_eq!(result.num_fetched, 0);
    assert_eq!(result.num_still_missing, 1);
}

#[test]
fn repair_is_idempotent_on_a_healthy_repository() {
    let repo = new_repo();
    for (name, contents) in [("a", b"alpha" as &[u8]), ("b", b"beta"), ("c", b"gamma")] {
        fs::write(repo.path().join(name), contents).unwrap();
    }
    let mut frz = engine();
    for name in ["a", "b", "c"] {
        frz.add_file(&repo.path().join(name)).unwrap();
    }

    let first = frz.repair(repo.path(), true, Vec::new(), &NullProgress).unwrap();
    let second = frz.repair(repo.path(), true, Vec::new(), &NullProgress).unwrap();
    assert_eq!(first, second);
    assert_eq!(second.num_good_index_symlinks, 3);
    assert_eq!(second.num_bad_index_symlinks, 0);
    assert_eq!(second.num_missing_index_symlinks, 0);
    assert_eq!(second.num_duplicate_content_files, 0);
    assert_eq!(second.num_fetched, 0);
    assert_eq!(second.num_still_missing, 0);
}

#[test]
fn repair_adopts_orphan_blobs_and_restores_write_protection() {
    let repo = new_repo();
    let foo = repo.path().join("foo");
    fs::write(&foo, b"precious").unwrap();
    let mut frz = engine();
    frz.add_file(&foo).unwrap();

    // Delete the index and flip the blob writable; repair must undo both.
    fs::remove_dir_all(repo.path().join(".frz/blake3")).unwrap();
    let blob = files_under(&repo.path().join(".frz/content"))[0].clone();
    let mut permissions = fs::metadata(&blob).unwrap().permissions();
    permissions.set_mode(permissions.mode() | 0o200);
    fs::set_permissions(&blob, permissions).unwrap();

    let result = frz.repair(repo.path(), true, Vec::new(), &NullProgress).unwrap();
    assert_eq!(result.num_missing_index_symlinks, 1);
    assert_eq!(result.num_still_missing, 0);
    assert!(is_readonly(&blob));
    assert_eq!(fs::read(&foo).unwrap(), b"precious");
}

#[test]
fn repair_demotes_duplicate_blobs() {
    let repo = new_repo();
    let foo = repo.path().join("foo");
    fs::write(&foo, b"twice stored").unwrap();
    let mut frz = engine();
    frz.add_file(&foo).unwrap();

    // Plant a second, unindexed copy of the same bytes in the store.
    let planted = repo.path().join(".frz/content/zz");
    fs::write(&planted, b"twice stored").unwrap();

    let result = frz.repair(repo.path(), true, Vec::new(), &NullProgress).unwrap();
    assert_eq!(result.num_duplicate_content_files, 1);
    assert_eq!(result.num_good_index_symlinks, 1);
    assert_eq!(files_under(&repo.path().join(".frz/content")).len(), 1);
    assert_eq!(files_under(&repo.path().join(".frz/unused-content")).len(), 1);
}

#[test]
fn user_symlink_targets_survive_fill_and_repair() {
    let repo = new_repo();
    let foo = repo.path().join("foo");
    fs::write(&foo, b"stable").unwrap();
    let mut frz = engine();
    frz.add_file(&foo).unwrap();
    let target_before = fs::read_link(&foo).unwrap();

    frz.fill(repo.path(), Vec::new(), &NullProgress).unwrap();
    frz.repair(repo.path(), true, Vec::new(), &NullProgress).unwrap();

    assert_eq!(fs::read_link(&foo).unwrap(), target_before);
}

#[test]
fn nested_repositories_are_left_alone() {
    let outer = new_repo();
    let inner = outer.path().join("inner");
    fs::create_dir(&inner).unwrap();
    fs::create_dir(inner.join(METADATA_DIR)).unwrap();

    // The inner repository references content it doesn't have.
    let inner_file = inner.join("lost");
    fs::write(&inner_file, b"inner bytes").unwrap();
    let mut inner_frz = engine();
    inner_frz.add_file(&inner_file).unwrap();
    fs::remove_dir_all(inner.join(".frz/content")).unwrap();
    fs::remove_dir_all(inner.join(".frz/blake3")).unwrap();

    // Filling the outer repository must not touch (or count) the inner one.
    let mut outer_frz = engine();
    let result = outer_frz.fill(outer.path(), Vec::new(), &NullProgress).unwrap();
    assert_eq!(result.num_fetched, 0);
    assert_eq!(result.num_still_missing, 0);
}

#[test]
fn add_all_skips_gitignored_files_and_stages_symlinks() {
    let repo = new_repo();
    git2::Repository::init(repo.path()).unwrap();
    fs::write(repo.path().join(".gitignore"), "*.skip\n.frz/\n").unwrap();
    let sub = repo.path().join("sub");
    fs::create_dir(&sub).unwrap();
    fs::write(sub.join("wanted"), b"wanted").unwrap();
    fs::write(sub.join("noise.skip"), b"noise").unwrap();

    let mut frz = engine();
    let mut git = GitClient::new();
    let summary = frz.add_all(repo.path(), &[PathBuf::from("sub")], &mut git, &mut |_| {});
    assert_eq!(summary.successful, 1);
    assert_eq!(summary.duplicates, 0);
    assert_eq!(summary.errors, 0);

    // The ignored file is untouched, the wanted one froze.
    assert!(fs::symlink_metadata(sub.join("wanted")).unwrap().file_type().is_symlink());
    assert!(fs::symlink_metadata(sub.join("noise.skip")).unwrap().is_file());

    let git_repo = git2::Repository::open(repo.path()).unwrap();
    let index = git_repo.index().unwrap();
    assert!(index.get_path(Path::new("sub/wanted"), 0).is_some());
}

#[test]
fn discovery_fails_cleanly_outside_any_repository() {
    let plain = TempDir::new().unwrap();
    let file = plain.path().join("f");
    fs::write(&file, b"x").unwrap();
    let mut frz = engine();
    match frz.add_file(&file) {
        Err(RepoError::RepositoryNotFound { .. }) => {}
        other => panic!("expected RepositoryNotFound, got {other:?}"),
    }
}
