//! Cuckatoo SipHash-2-4 and job key derivation
//!
//! Node values are `siphash24(keys, 2 * edge + side) & edge_mask`. Rounds and
//! finalization (`v2 ^= 0xff`, four rounds, xor of the state) are those of
//! reference SipHash-2-4. The Cuckatoo variant seeds the state directly with the
//! four keys instead of deriving it from a 128-bit key, and hashes the single
//! nonce word without the trailing length block. The same function is
//! implemented in the WGSL kernels with 32-bit limbs.

use blake2::digest::consts::U32;
use blake2::{Blake2b, Digest};

/// Number of 64-bit SipHash keys
pub const SIPHASH_KEYS_SIZE: usize = 4;

/// The four SipHash keys of one job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct SipHashKeys(pub [u64; SIPHASH_KEYS_SIZE]);

impl SipHashKeys {
    /// Keys split into little-endian 32-bit limbs, the layout the kernels read
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn to_limbs(&self) -> [u32; SIPHASH_KEYS_SIZE * 2] {
        let mut limbs = [0u32; SIPHASH_KEYS_SIZE * 2];
        for (i, key) in self.0.iter().enumerate() {
            limbs[i * 2] = *key as u32;
            limbs[i * 2 + 1] = (*key >> 32) as u32;
        }
        limbs
    }

    /// Node on `side` (0 or 1) of `edge`, masked to `edge_mask`
    #[must_use]
    pub fn node(&self, edge: u64, side: u32, edge_mask: u64) -> u64 {
        siphash24(self, 2 * edge + u64::from(side)) & edge_mask
    }
}

#[inline]
fn sip_round(v: &mut [u64; 4]) {
    v[0] = v[0].wrapping_add(v[1]);
    v[2] = v[2].wrapping_add(v[3]);
    v[1] = v[1].rotate_left(13);
    v[3] = v[3].rotate_left(16);
    v[1] ^= v[0];
    v[3] ^= v[2];
    v[0] = v[0].rotate_left(32);
    v[2] = v[2].wrapping_add(v[1]);
    v[0] = v[0].wrapping_add(v[3]);
    v[1] = v[1].rotate_left(17);
    v[3] = v[3].rotate_left(21);
    v[1] ^= v[2];
    v[3] ^= v[0];
    v[2] = v[2].rotate_left(32);
}

/// Unmasked SipHash-2-4 of `nonce` under `keys`
#[must_use]
pub fn siphash24(keys: &SipHashKeys, nonce: u64) -> u64 {
    let mut v = keys.0;
    v[3] ^= nonce;
    sip_round(&mut v);
    sip_round(&mut v);
    v[0] ^= nonce;
    v[2] ^= 0xff;
    for _ in 0..4 {
        sip_round(&mut v);
    }
    v[0] ^ v[1] ^ v[2] ^ v[3]
}

/// Source of per-job SipHash keys
///
/// Called once per job with the current header and the nonce the job consumed.
pub trait KeyDeriver {
    /// Derive the keys for `header` at `nonce`
    fn derive_keys(&self, header: &[u8], nonce: u64) -> SipHashKeys;
}

/// BLAKE2b-256 of `header || nonce` (big-endian), read as four little-endian words
#[derive(Debug, Clone, Copy, Default)]
pub struct Blake2bKeys;

impl KeyDeriver for Blake2bKeys {
    fn derive_keys(&self, header: &[u8], nonce: u64) -> SipHashKeys {
        let mut hasher = Blake2b::<U32>::new();
        hasher.update(header);
        hasher.update(nonce.to_be_bytes());
        let digest = hasher.finalize();

        let mut keys = [0u64; SIPHASH_KEYS_SIZE];
        for (key, chunk) in keys.iter_mut().zip(digest.chunks_exact(8)) {
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(chunk);
            *key = u64::from_le_bytes(bytes);
        }
        SipHashKeys(keys)
    }
}

impl<F> KeyDeriver for F
where
    F: Fn(&[u8], u64) -> SipHashKeys,
{
    fn derive_keys(&self, header: &[u8], nonce: u64) -> SipHashKeys {
        self(header, nonce)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_siphash_is_deterministic_and_keyed() {
        let zero = SipHashKeys::default();
        let other = SipHashKeys([1, 2, 3, 4]);
        assert_eq!(siphash24(&zero, 7), siphash24(&zero, 7));
        assert_ne!(siphash24(&zero, 7), siphash24(&zero, 8));
        assert_ne!(siphash24(&zero, 7), siphash24(&other, 7));
    }

    #[test]
    fn test_known_values() {
        assert_eq!(siphash24(&SipHashKeys::default(), 0), 0x3c4c_eb5c_c070_daa0);
        assert_eq!(siphash24(&SipHashKeys::default(), 1), 0x0da9_9d5b_1e93_37b3);
        assert_eq!(siphash24(&SipHashKeys([1, 2, 3, 4]), 10), 0x0ce2_46a5_72ae_2495);
    }

    #[test]
    fn test_differs_from_reference_only_by_length_block() {
        // key 00..0f and message 00..07: reference SipHash-2-4 gives
        // 0x93f5f5799a932462. Seeding the same state without the length block
        // gives a different word.
        let k0 = u64::from_le_bytes([0, 1, 2, 3, 4, 5, 6, 7]);
        let k1 = u64::from_le_bytes([8, 9, 10, 11, 12, 13, 14, 15]);
        let seeded = SipHashKeys([
            k0 ^ 0x736f_6d65_7073_6575,
            k1 ^ 0x646f_7261_6e64_6f6d,
            k0 ^ 0x6c79_6765_6e65_7261,
            k1 ^ 0x7465_6462_7974_6573,
        ]);
        let message = u64::from_le_bytes([0, 1, 2, 3, 4, 5, 6, 7]);
        assert_eq!(siphash24(&seeded, message), 0xab02_00f5_8b01_d137);
        assert_ne!(siphash24(&seeded, message), 0x93f5_f579_9a93_2462);
    }

    #[test]
    fn test_node_sides_differ_and_are_masked() {
        let keys = SipHashKeys([0x0123_4567_89ab_cdef, 42, 7, u64::MAX]);
        let mask = (1u64 << 12) - 1;
        let mut differing = 0;
        for edge in 0..256 {
            let u = keys.node(edge, 0, mask);
            let v = keys.node(edge, 1, mask);
            assert!(u <= mask && v <= mask);
            if u != v {
                differing += 1;
            }
        }
        assert!(differing > 240);
    }

    #[test]
    fn test_node_uses_doubled_edge_nonce() {
        let keys = SipHashKeys([9, 8, 7, 6]);
        let mask = u64::from(u32::MAX);
        assert_eq!(keys.node(5, 0, mask), siphash24(&keys, 10) & mask);
        assert_eq!(keys.node(5, 1, mask), siphash24(&keys, 11) & mask);
    }

    #[test]
    fn test_limbs_are_little_endian() {
        let keys = SipHashKeys([0x1111_2222_3333_4444, 0, u64::MAX, 1]);
        let limbs = keys.to_limbs();
        assert_eq!(limbs[0], 0x3333_4444);
        assert_eq!(limbs[1], 0x1111_2222);
        assert_eq!(limbs[4], u32::MAX);
        assert_eq!(limbs[5], u32::MAX);
        assert_eq!(limbs[6], 1);
        assert_eq!(limbs[7], 0);
    }

    #[test]
    fn test_blake2b_keys_depend_on_header_and_nonce() {
        let header = [0xabu8; 64];
        let a = Blake2bKeys.derive_keys(&header, 1);
        let b = Blake2bKeys.derive_keys(&header, 2);
        let c = Blake2bKeys.derive_keys(&[0u8; 64], 1);
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_eq!(a, Blake2bKeys.derive_keys(&header, 1));
    }

    #[test]
    fn test_closure_deriver() {
        let fixed = |_: &[u8], nonce: u64| SipHashKeys([nonce, 0, 0, 0]);
        assert_eq!(fixed.derive_keys(b"header", 9), SipHashKeys([9, 0, 0, 0]));
    }
}
