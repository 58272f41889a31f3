//! # frz-hash
//!
//! Content identifiers and the hashing machinery behind them.
//!
//! A [`ContentId`] is a fixed-width cryptographic digest plus a nonnegative
//! 63-bit file size; together they address one blob of content. The
//! canonical textual form is base-32 over a homoglyph-free alphabet, with
//! the size encoded in as few bits as possible (see [`ContentId::to_base32`]).
//!
//! Hashing is polymorphic over [`IncrementalHasher`]; BLAKE3 (the default
//! family) and SHA-256 implementations are provided. [`SizeHasher`] adapts
//! any hasher into a stream sink that also counts bytes, yielding a complete
//! `ContentId` when the stream ends.

mod base32;
mod digest;
mod hasher;
mod id;

pub use base32::{
    digit_value, is_base32, shard_path, symlink_target_base32, DIGITS, SHARD_DIGITS, SHARD_LEVELS,
};
pub use digest::Digest;
pub use hasher::{
    blake3_factory, hash_source, sha256_factory, sha512_256_factory, Blake3Hasher, HasherFactory,
    IncrementalHasher, Sha256Hasher, Sha512_256Hasher, SizeHasher, BLAKE3_NAME, SHA256_NAME,
    SHA512_256_NAME,
};
pub use id::{ContentId, ParseIdError};

/// The default content ID width: a 256-bit digest.
pub const DEFAULT_DIGEST_BYTES: usize = 32;

/// `ContentId` at the default width.
pub type ContentId256 = ContentId<DEFAULT_DIGEST_BYTES>;
