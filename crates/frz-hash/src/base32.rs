//! The base-32 digit set and the symlink path grammar built on it.

use std::path::{Component, Path, PathBuf};

/// Base-32 digits, chosen so that letters easily mistaken for digits
/// (`i`, `l`, `o`, `v`) are omitted.
pub const DIGITS: &[u8; 32] = b"0123456789abcdefghjkmnpqrstuwxyz";

/// Number of subdirectory levels used for sharded symlink names.
pub const SHARD_LEVELS: usize = 2;

/// Number of base-32 digits per shard directory name.
pub const SHARD_DIGITS: usize = 2;

/// The value of one base-32 digit, accepting either case. `None` for
/// characters outside the digit set.
pub const fn digit_value(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'a'..=b'h' => Some(c - b'a' + 10),
        b'A'..=b'H' => Some(c - b'A' + 10),
        b'j' | b'J' => Some(18),
        b'k' | b'K' => Some(19),
        b'm' | b'M' => Some(20),
        b'n' | b'N' => Some(21),
        b'p' | b'P' => Some(22),
        b'q' | b'Q' => Some(23),
        b'r' | b'R' => Some(24),
        b's' | b'S' => Some(25),
        b't' | b'T' => Some(26),
        b'u' | b'U' => Some(27),
        b'w' | b'W' => Some(28),
        b'x' | b'X' => Some(29),
        b'y' | b'Y' => Some(30),
        b'z' | b'Z' => Some(31),
        _ => None,
    }
}

/// Is every character a base-32 digit?
pub fn is_base32(s: &str) -> bool {
    s.bytes().all(|c| digit_value(c).is_some())
}

/// Sharded relative path for a base-32 string: the first two digits become a
/// directory, the next two a subdirectory, the rest the filename.
pub fn shard_path(base32: &str) -> PathBuf {
    assert!(base32.len() > SHARD_LEVELS * SHARD_DIGITS);
    Path::new(&base32[0..2]).join(&base32[2..4]).join(&base32[4..])
}

/// Parse a user-facing symlink target of the form
/// `<metadata_dir>/<hash_name>/DD/DD/REST` and return the concatenated
/// base-32 digits. `None` for anything that does not match the grammar.
pub fn symlink_target_base32(
    metadata_dir: &str,
    hash_name: &str,
    target: &Path,
) -> Option<String> {
    let mut base32 = String::new();
    let mut seen = 0usize;
    for component in target.components() {
        let Component::Normal(element) = component else {
            return None;
        };
        let element = element.to_str()?;
        match seen {
            0 => {
                if element != metadata_dir {
                    return None;
                }
            }
            1 => {
                if element != hash_name {
                    return None;
                }
            }
            n if n - 2 < SHARD_LEVELS => {
                if element.len() != SHARD_DIGITS || !is_base32(element) {
                    return None;
                }
                base32.push_str(element);
            }
            n if n - 2 == SHARD_LEVELS => {
                if !is_base32(element) {
                    return None;
                }
                base32.push_str(element);
            }
            _ => return None,
        }
        seen += 1;
    }
    if seen == SHARD_LEVELS + 3 {
        Some(base32)
    } else {
        None
    }
}
