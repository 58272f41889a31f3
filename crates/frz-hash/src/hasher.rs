//! Incremental hashers and the byte-counting hasher sink.

use std::sync::Arc;

use frz_stream::{StreamSink, StreamSource, Streamer};
use sha2::Digest as _;

use crate::digest::Digest;
use crate::id::ContentId;

pub const BLAKE3_NAME: &str = "blake3";
pub const SHA256_NAME: &str = "sha256";
pub const SHA512_256_NAME: &str = "sha512_256";

/// An incremental byte hash producing a fixed-width digest.
pub trait IncrementalHasher<const N: usize>: Send {
    fn update(&mut self, bytes: &[u8]);
    fn finish(self: Box<Self>) -> Digest<N>;
}

/// Produces fresh hasher instances; shared across the engine so every
/// component hashes with the same family.
pub type HasherFactory<const N: usize> =
    Arc<dyn Fn() -> Box<dyn IncrementalHasher<N>> + Send + Sync>;

/// Stream sink that feeds an [`IncrementalHasher`] and counts the bytes
/// passing through, yielding a complete [`ContentId`] at the end.
pub struct SizeHasher<const N: usize> {
    hasher: Option<Box<dyn IncrementalHasher<N>>>,
    num_bytes: u64,
}

impl<const N: usize> SizeHasher<N> {
    pub fn new(hasher: Box<dyn IncrementalHasher<N>>) -> Self {
        Self { hasher: Some(hasher), num_bytes: 0 }
    }

    /// Compute the ID of everything written so far. May only be called once.
    pub fn finish(&mut self) -> ContentId<N> {
        let hasher = self.hasher.take().expect("SizeHasher::finish called twice");
        ContentId::new(hasher.finish(), self.num_bytes)
    }
}

impl<const N: usize> StreamSink for SizeHasher<N> {
    fn write(&mut self, bytes: &[u8]) -> frz_stream::Result<()> {
        let hasher = self.hasher.as_mut().expect("SizeHasher used after finish");
        hasher.update(bytes);
        self.num_bytes += bytes.len() as u64;
        Ok(())
    }
}

/// Stream a whole source through a fresh hasher and return its content ID.
pub fn hash_source<const N: usize>(
    streamer: &dyn Streamer,
    make_hasher: &HasherFactory<N>,
    source: &mut dyn StreamSource,
) -> frz_stream::Result<ContentId<N>> {
    let mut hasher = SizeHasher::new(make_hasher());
    streamer.stream(source, &mut hasher)?;
    Ok(hasher.finish())
}

pub struct Blake3Hasher(blake3::Hasher);

impl Blake3Hasher {
    pub fn new() -> Self {
        Self(blake3::Hasher::new())
    }
}

impl Default for Blake3Hasher {
    fn default() -> Self {
        Self::new()
    }
}

impl IncrementalHasher<32> for Blake3Hasher {
    fn update(&mut self, bytes: &[u8]) {
        self.0.update(bytes);
    }

    fn finish(self: Box<Self>) -> Digest<32> {
        Digest(*self.0.finalize().as_bytes())
    }
}

/// Factory for the default 256-bit BLAKE3 family.
pub fn blake3_factory() -> HasherFactory<32> {
    Arc::new(|| Box::new(Blake3Hasher::new()))
}

pub struct Sha256Hasher(sha2::Sha256);

impl Sha256Hasher {
    pub fn new() -> Self {
        Self(sha2::Sha256::new())
    }
}

impl Default for Sha256Hasher {
    fn default() -> Self {
        Self::new()
    }
}

impl IncrementalHasher<32> for Sha256Hasher {
    fn update(&mut self, bytes: &[u8]) {
        self.0.update(bytes);
    }

    fn finish(self: Box<Self>) -> Digest<32> {
        Digest(self.0.finalize().into())
    }
}

pub fn sha256_factory() -> HasherFactory<32> {
    Arc::new(|| Box::new(Sha256Hasher::new()))
}

/// SHA-512 truncated to 256 bits; same ID width as the default family, but
/// faster on 64-bit hardware without SHA extensions.
pub struct Sha512_256Hasher(sha2::Sha512_256);

impl Sha512_256Hasher {
    pub fn new() -> Self {
        Self(sha2::Sha512_256::new())
    }
}

impl Default for Sha512_256Hasher {
    fn default() -> Self {
        Self::new()
    }
}

impl IncrementalHasher<32> for Sha512_256Hasher {
    fn update(&mut self, bytes: &[u8]) {
        self.0.update(bytes);
    }

    fn finish(self: Box<Self>) -> Digest<32> {
        Digest(self.0.finalize().into())
    }
}

pub fn sha512_256_factory() -> HasherFactory<32> {
    Arc::new(|| Box::new(Sha512_256Hasher::new()))
}
