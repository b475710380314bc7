//! Bloom filter used as an existence hint for measurements and tag values.
//!
//! May return false positives but never false negatives. Hashing is SipHash-1-3 over the
//! raw bytes with fixed keys, so the persisted bits are portable across platforms.

use crate::encoding::{u32_at, u64_at, write_u32, write_u64, write_var_bytes};
use bitvec::prelude::*;
use siphasher::sip::SipHasher13;
use std::hash::Hasher;

const SIP_KEYS_A: (u64, u64) = (0x7473_6931_6964_7831, 0x626c_6f6f_6d5f_6831);
const SIP_KEYS_B: (u64, u64) = (0x7473_6931_6964_7832, 0x626c_6f6f_6d5f_6832);

const MAX_HASHES: u32 = 16;

#[derive(Debug, Clone)]
pub(crate) struct BloomFilter {
    bits: BitVec<u8, Msb0>,
    num_hashes: u32,
}

impl BloomFilter {
    /// Sizes the filter for `expected_elements` at the given false positive rate.
    pub(crate) fn new(expected_elements: u64, false_positive_rate: f64) -> Self {
        let n = expected_elements.max(1) as f64;
        let p = false_positive_rate.clamp(1e-9, 0.5);
        // m = -n * ln(p) / (ln(2)^2)
        let m = (-n * p.ln() / (std::f64::consts::LN_2.powi(2))).ceil().max(64.0);
        // k = (m/n) * ln(2)
        let k = ((m / n) * std::f64::consts::LN_2).round() as u32;
        let num_bits = (m as usize).next_multiple_of(8);
        Self {
            bits: bitvec![u8, Msb0; 0; num_bits],
            num_hashes: k.clamp(1, MAX_HASHES),
        }
    }

    pub(crate) fn insert(&mut self, item: &[u8]) {
        let len = self.bits.len() as u64;
        for idx in bit_positions(item, self.num_hashes, len) {
            self.bits.set(idx, true);
        }
    }

    pub(crate) fn contains(&self, item: &[u8]) -> bool {
        let len = self.bits.len() as u64;
        bit_positions(item, self.num_hashes, len).all(|idx| self.bits[idx])
    }

    /// Layout: `num_hashes u32 | num_bits u64 | bit bytes`.
    pub(crate) fn encode_into(&self, out: &mut Vec<u8>) {
        write_u32(out, self.num_hashes);
        write_u64(out, self.bits.len() as u64);
        out.extend_from_slice(self.bits.as_raw_slice());
    }

    pub(crate) fn decode(bytes: &[u8]) -> Result<Self, String> {
        let num_hashes = u32_at(bytes, 0).ok_or("Truncated bloom header")?;
        let num_bits = u64_at(bytes, 4).ok_or("Truncated bloom header")?;
        if num_hashes == 0 || num_hashes > MAX_HASHES {
            return Err(format!("Invalid bloom hash count {}", num_hashes));
        }
        if num_bits == 0 || num_bits % 8 != 0 {
            return Err(format!("Invalid bloom bit count {}", num_bits));
        }
        let raw = &bytes[12..];
        if raw.len() as u64 != num_bits / 8 {
            return Err("Bloom payload length mismatch".to_string());
        }
        Ok(Self {
            bits: BitVec::from_vec(raw.to_vec()),
            num_hashes,
        })
    }
}

fn bit_positions(item: &[u8], k: u32, len: u64) -> impl Iterator<Item = usize> {
    let mut a = SipHasher13::new_with_keys(SIP_KEYS_A.0, SIP_KEYS_A.1);
    a.write(item);
    let h1 = a.finish();
    let mut b = SipHasher13::new_with_keys(SIP_KEYS_B.0, SIP_KEYS_B.1);
    b.write(item);
    let h2 = b.finish() | 1;
    (0..k as u64).map(move |i| (h1.wrapping_add(i.wrapping_mul(h2)) % len) as usize)
}

/// Filter key for a measurement name.
pub(crate) fn measurement_key(name: &[u8]) -> Vec<u8> {
    let mut k = Vec::with_capacity(name.len() + 2);
    k.push(1);
    write_var_bytes(&mut k, name);
    k
}

/// Filter key for a (measurement, tag key, tag value) triple.
pub(crate) fn tag_value_key(name: &[u8], key: &[u8], value: &[u8]) -> Vec<u8> {
    let mut k = Vec::with_capacity(name.len() + key.len() + value.len() + 4);
    k.push(2);
    write_var_bytes(&mut k, name);
    write_var_bytes(&mut k, key);
    write_var_bytes(&mut k, value);
    k
}
