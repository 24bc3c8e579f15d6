//! Fixed-width perceptual hash type.
//!
//! A `Hash` is a bit-string of configurable length, represented as a
//! big-endian byte buffer so that lexicographic byte comparison matches
//! numeric ordering and bit `i` (0 = most significant) maps directly to
//! `bytes[i / 8]` bit `7 - (i % 8)`.

use crate::{ImgcatError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A fixed-length binary perceptual hash.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Hash {
    bits: usize,
    bytes: Vec<u8>,
}

impl Hash {
    /// Builds a hash from raw big-endian bytes. `bits` must equal `bytes.len() * 8`.
    pub fn from_bytes(bytes: Vec<u8>, bits: usize) -> Result<Self> {
        if bytes.len() * 8 != bits {
            return Err(ImgcatError::ValidationError {
                message: format!(
                    "hash byte length {} does not match bit length {}",
                    bytes.len(),
                    bits
                ),
            });
        }
        Ok(Self { bits, bytes })
    }

    /// Parses a hex string (with or without a leading `0x`) into a hash of
    /// exactly `bits` bits. Odd-length digit counts are zero-padded on the
    /// left, matching the canonical "hex without separators" textual form.
    pub fn from_hex(s: &str, bits: usize) -> Result<Self> {
        let digits = s.strip_prefix("0x").unwrap_or(s);
        let nbytes = bits.div_ceil(8);
        let expected_digits = nbytes * 2;
        if digits.len() > expected_digits {
            return Err(ImgcatError::ValidationError {
                message: format!("hex hash '{s}' longer than {bits} bits"),
            });
        }
        let padded = format!("{:0>width$}", digits, width = expected_digits);
        let mut bytes = Vec::with_capacity(nbytes);
        for i in 0..nbytes {
            let byte = u8::from_str_radix(&padded[i * 2..i * 2 + 2], 16).map_err(|e| {
                ImgcatError::ValidationError {
                    message: format!("invalid hex hash '{s}': {e}"),
                }
            })?;
            bytes.push(byte);
        }
        Self::from_bytes(bytes, bits)
    }

    /// Canonical textual form: lowercase hex, no separators, zero-padded to
    /// the full bit width.
    pub fn to_hex(&self) -> String {
        self.bytes.iter().map(|b| format!("{b:02x}")).collect()
    }

    /// Number of bits in this hash.
    pub fn bits(&self) -> usize {
        self.bits
    }

    /// Reads bit `i` (0 = most significant, matching root-to-leaf trie
    /// traversal order).
    pub fn bit(&self, i: usize) -> u8 {
        let byte = self.bytes[i / 8];
        (byte >> (7 - (i % 8))) & 1
    }

    /// Rebuilds a hash from a sequence of 0/1 bit values, MSB first.
    pub fn from_bits(bits: &[u8]) -> Self {
        let nbits = bits.len();
        let mut bytes = vec![0u8; nbits.div_ceil(8)];
        for (i, &b) in bits.iter().enumerate() {
            if b != 0 {
                bytes[i / 8] |= 1 << (7 - (i % 8));
            }
        }
        Self { bits: nbits, bytes }
    }

    /// Raw big-endian byte view.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// `popcount(self XOR other)`. Panics if the two hashes have different
    /// bit widths — callers never compare hashes of mismatched width within
    /// a single trie.
    pub fn hamming_distance(&self, other: &Hash) -> u32 {
        assert_eq!(self.bits, other.bits, "hamming_distance: bit width mismatch");
        self.bytes
            .iter()
            .zip(other.bytes.iter())
            .map(|(a, b)| (a ^ b).count_ones())
            .sum()
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_round_trip() {
        let h = Hash::from_hex(
            "0f9101c9eb59dace6cbcef38fa433a6338683c759c268c4ec51883155cb2a53f",
            256,
        )
        .unwrap();
        assert_eq!(h.bits(), 256);
        assert_eq!(
            h.to_hex(),
            "0f9101c9eb59dace6cbcef38fa433a6338683c759c268c4ec51883155cb2a53f"
        );
    }

    #[test]
    fn bit_accessor_matches_hex() {
        let h = Hash::from_hex("80", 8).unwrap();
        assert_eq!(h.bit(0), 1);
        for i in 1..8 {
            assert_eq!(h.bit(i), 0);
        }
    }

    #[test]
    fn hamming_distance_basic() {
        let a = Hash::from_hex("0f", 8).unwrap();
        let b = Hash::from_hex("00", 8).unwrap();
        assert_eq!(a.hamming_distance(&b), 4);
    }

    #[test]
    fn from_bits_round_trips_through_bit() {
        let bits = vec![1, 0, 1, 1, 0, 0, 1, 0];
        let h = Hash::from_bits(&bits);
        for (i, &b) in bits.iter().enumerate() {
            assert_eq!(h.bit(i), b);
        }
    }

    #[test]
    fn rejects_overlong_hex() {
        assert!(Hash::from_hex("ffff", 8).is_err());
    }
}
