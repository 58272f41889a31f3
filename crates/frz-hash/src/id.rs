//! Content identifiers and their canonical base-32 form.

use std::fmt;

use crate::base32::{digit_value, DIGITS};
use crate::digest::Digest;

/// Why a base-32 string failed to parse as a [`ContentId`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ParseIdError {
    #[error("character {0:?} is not a base-32 digit")]
    InvalidDigit(char),
    #[error("too few digits to hold the digest")]
    TooShort,
    #[error("file size does not fit in 63 bits")]
    SizeOverflow,
    #[error("file size is encoded with more digits than necessary")]
    NonCanonicalSize,
}

/// A digest of `N` bytes plus a nonnegative 63-bit file size: the primary
/// key for every content-indexed lookup.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContentId<const N: usize> {
    digest: Digest<N>,
    size: u64,
}

impl<const N: usize> ContentId<N> {
    pub fn new(digest: Digest<N>, size: u64) -> Self {
        debug_assert!(size < 1 << 63);
        Self { digest, size }
    }

    pub fn digest(&self) -> &Digest<N> {
        &self.digest
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Canonical base-32 form: the digest bits followed by the size in as
    /// few bits as possible, zero-padded on the left so the total is a
    /// multiple of five bits.
    pub fn to_base32(&self) -> String {
        let digest_bits = N * 8;
        let needed = 64 - self.size.leading_zeros() as usize;
        let size_bits = (digest_bits + needed).div_ceil(5) * 5 - digest_bits;
        let mut out = String::with_capacity((digest_bits + size_bits) / 5);

        let mut acc: u32 = 0;
        let mut nbits = 0u32;
        for &byte in self.digest.0.iter() {
            acc = (acc << 8) | byte as u32;
            nbits += 8;
            while nbits >= 5 {
                nbits -= 5;
                out.push(DIGITS[((acc >> nbits) & 0x1f) as usize] as char);
                acc &= (1 << nbits) - 1;
            }
        }
        // size_bits can exceed the leading-zero count of a u64 by the
        // padding, so widen before shifting.
        let size = self.size as u128;
        for i in (0..size_bits).rev() {
            acc = (acc << 1) | ((size >> i) & 1) as u32;
            nbits += 1;
            if nbits == 5 {
                out.push(DIGITS[(acc & 0x1f) as usize] as char);
                acc = 0;
                nbits = 0;
            }
        }
        debug_assert_eq!(nbits, 0);
        out
    }

    /// Parse the canonical base-32 form. Case-insensitive on input. The
    /// first `N * 8` bits become the digest and the remaining bits the file
    /// size; a size carrying five or more leading zero padding bits is
    /// rejected so that values and canonical strings correspond 1:1.
    pub fn from_base32(s: &str) -> Result<Self, ParseIdError> {
        let mut digits = s.bytes();
        let mut value: u64 = 0;
        let mut bits: u32 = 0;

        let mut digest = [0u8; N];
        for byte in digest.iter_mut() {
            while bits < 8 {
                let c = digits.next().ok_or(ParseIdError::TooShort)?;
                let d = digit_value(c).ok_or(ParseIdError::InvalidDigit(c as char))?;
                value = (value << 5) | d as u64;
                bits += 5;
            }
            bits -= 8;
            *byte = (value >> bits) as u8;
            value &= (1 << bits) - 1;
        }

        for c in digits {
            let d = digit_value(c).ok_or(ParseIdError::InvalidDigit(c as char))?;
            if value.leading_zeros() < 6 {
                return Err(ParseIdError::SizeOverflow);
            }
            value = (value << 5) | d as u64;
            bits += 5;
        }

        let actual_bits = 64 - value.leading_zeros();
        if bits - actual_bits >= 5 {
            return Err(ParseIdError::NonCanonicalSize);
        }
        Ok(Self { digest: Digest(digest), size: value })
    }
}

impl<const N: usize> fmt::Debug for ContentId<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{digest:{},size:{},base32:{}}}",
            self.digest.to_hex(),
            self.size,
            self.to_base32()
        )
    }
}
