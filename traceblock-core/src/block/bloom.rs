//! Bloom filter over object ids

use crate::{BlockError, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use siphasher::sip::SipHasher13;
use std::hash::Hasher;

// Fixed keys keep bit positions stable across builds and platforms.
const HASH_KEY_0: u64 = 0x7472_6163_6562_6c6b;
const HASH_KEY_1: u64 = 0x626c_6f6f_6d66_6c74;

const MIN_BITS: usize = 64;
// Bit count is serialized as a u32
const MAX_BITS: usize = u32::MAX as usize;
const MAX_HASHES: usize = 30;

/// Bloom filter implementation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BloomFilter {
    bits: Vec<u8>,
    num_bits: usize,
    num_hashes: usize,
}

impl BloomFilter {
    /// Header size in serialized form
    pub const HEADER_SIZE: usize = 5;

    /// Create a filter sized for `expected_items` at the given false positive rate
    pub fn with_rate(expected_items: usize, false_positive_rate: f64) -> Result<Self> {
        if expected_items == 0 {
            return Err(BlockError::InvalidArgument(
                "bloom filter needs a non-zero expected item count".into(),
            ));
        }
        if !(false_positive_rate > 0.0 && false_positive_rate < 1.0) {
            return Err(BlockError::InvalidArgument(format!(
                "bloom false positive rate must be in (0, 1), got {}",
                false_positive_rate
            )));
        }

        let n = expected_items as f64;
        let ln2 = std::f64::consts::LN_2;
        let num_bits = (-n * false_positive_rate.ln() / (ln2 * ln2)).ceil();
        if num_bits > MAX_BITS as f64 {
            return Err(BlockError::InvalidArgument(format!(
                "bloom filter for {} items at fp {} needs more than {} bits",
                expected_items, false_positive_rate, MAX_BITS
            )));
        }
        let num_bits = (num_bits as usize).max(MIN_BITS);

        // Optimal number of hash functions
        let num_hashes = ((num_bits as f64 / n) * ln2).round() as usize;
        let num_hashes = num_hashes.clamp(1, MAX_HASHES);

        Ok(Self {
            bits: vec![0u8; (num_bits + 7) / 8],
            num_bits,
            num_hashes,
        })
    }

    /// Add a key to the filter
    pub fn add(&mut self, key: &[u8]) {
        let (h1, h2) = Self::hash_key(key);

        for i in 0..self.num_hashes {
            let bit = self.bit_position(h1, h2, i);
            self.set_bit(bit);
        }
    }

    /// Check if a key may be in the set
    pub fn test(&self, key: &[u8]) -> bool {
        let (h1, h2) = Self::hash_key(key);

        for i in 0..self.num_hashes {
            let bit = self.bit_position(h1, h2, i);
            if !self.get_bit(bit) {
                return false;
            }
        }

        true
    }

    /// Number of bits in the filter
    pub fn num_bits(&self) -> usize {
        self.num_bits
    }

    /// Get number of hash functions
    pub fn num_hashes(&self) -> usize {
        self.num_hashes
    }

    /// Estimated false positive rate after `num_keys` insertions
    pub fn false_positive_rate(&self, num_keys: usize) -> f64 {
        let k = self.num_hashes as f64;
        let m = self.num_bits as f64;
        let n = num_keys as f64;
        (1.0 - (-k * n / m).exp()).powf(k)
    }

    /// Serialize as `u32 num_bits | u8 num_hashes | bits`
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::HEADER_SIZE + self.bits.len());
        buf.put_u32_le(self.num_bits as u32);
        buf.put_u8(self.num_hashes as u8);
        buf.put_slice(&self.bits);
        buf.freeze()
    }

    /// Deserialize from bytes produced by [`BloomFilter::to_bytes`]
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < Self::HEADER_SIZE {
            return Err(BlockError::InvalidFormat("Bloom filter too short".into()));
        }

        let mut cursor = std::io::Cursor::new(data);
        let num_bits = cursor.get_u32_le() as usize;
        let num_hashes = cursor.get_u8() as usize;
        let bits = data[Self::HEADER_SIZE..].to_vec();

        if num_bits == 0 || (num_bits + 7) / 8 != bits.len() {
            return Err(BlockError::InvalidFormat(format!(
                "Bloom filter declares {} bits but carries {} bytes",
                num_bits,
                bits.len()
            )));
        }
        if num_hashes == 0 || num_hashes > MAX_HASHES {
            return Err(BlockError::InvalidFormat(format!(
                "Invalid bloom hash count: {}",
                num_hashes
            )));
        }

        Ok(Self {
            bits,
            num_bits,
            num_hashes,
        })
    }

    fn hash_key(key: &[u8]) -> (u64, u64) {
        let mut hasher = SipHasher13::new_with_keys(HASH_KEY_0, HASH_KEY_1);
        hasher.write(key);
        let h1 = hasher.finish();

        // Second hash derived from the first
        let mut hasher = SipHasher13::new_with_keys(HASH_KEY_1, HASH_KEY_0);
        hasher.write_u64(h1);
        let h2 = hasher.finish();

        (h1, h2)
    }

    fn bit_position(&self, h1: u64, h2: u64, i: usize) -> usize {
        let hash = h1.wrapping_add((i as u64).wrapping_mul(h2));
        (hash % self.num_bits as u64) as usize
    }

    fn set_bit(&mut self, bit: usize) {
        self.bits[bit / 8] |= 1 << (bit % 8);
    }

    fn get_bit(&self, bit: usize) -> bool {
        (self.bits[bit / 8] >> (bit % 8)) & 1 == 1
    }
}
