//! Packed bitmaps
//!
//! Bit `i` lives in word `i / 32` at position `i % 32`. Stored as `u32` words
//! on both backends, so the little-endian byte view handed to consumers has
//! bit `i` in byte `i / 8` at position `i % 8`.

/// Growable-once bitmap backed by `u32` words
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitmap {
    words: Vec<u32>,
    bits: u64,
}

impl Bitmap {
    /// All-zero bitmap of `bits` bits
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn new(bits: u64) -> Self {
        Self {
            words: vec![0; bits.div_ceil(32) as usize],
            bits,
        }
    }

    /// Number of bits
    #[must_use]
    pub fn len(&self) -> u64 {
        self.bits
    }

    /// Whether the bitmap holds no bits
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bits == 0
    }

    /// Clear every bit
    pub fn clear(&mut self) {
        self.words.fill(0);
    }

    /// Set bit `index`
    #[allow(clippy::cast_possible_truncation)]
    pub fn set(&mut self, index: u64) {
        self.words[(index / 32) as usize] |= 1 << (index % 32);
    }

    /// Clear bit `index`
    #[allow(clippy::cast_possible_truncation)]
    pub fn unset(&mut self, index: u64) {
        self.words[(index / 32) as usize] &= !(1 << (index % 32));
    }

    /// Test bit `index`
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn get(&self, index: u64) -> bool {
        self.words[(index / 32) as usize] & (1 << (index % 32)) != 0
    }

    /// Number of set bits
    #[must_use]
    pub fn count_ones(&self) -> u64 {
        self.words.iter().map(|w| u64::from(w.count_ones())).sum()
    }

    /// Backing words
    #[must_use]
    pub fn words(&self) -> &[u32] {
        &self.words
    }

    /// Little-endian byte image, `len() / 8` bytes
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        self.words.iter().flat_map(|w| w.to_le_bytes()).collect()
    }
}

/// Test bit `index` of a little-endian byte bitmap
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn bit_is_set(bytes: &[u8], index: u64) -> bool {
    bytes[(index / 8) as usize] & (1 << (index % 8)) != 0
}

/// Number of set bits in a byte bitmap
#[must_use]
pub fn count_set_bits(bytes: &[u8]) -> u64 {
    bytes.iter().map(|b| u64::from(b.count_ones())).sum()
}

/// Indices of set bits in a byte bitmap, ascending
pub fn set_bits(bytes: &[u8]) -> impl Iterator<Item = u64> + '_ {
    bytes.iter().enumerate().flat_map(|(byte_index, &byte)| {
        (0..8u64)
            .filter(move |bit| byte & (1 << bit) != 0)
            .map(move |bit| byte_index as u64 * 8 + bit)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_get_unset() {
        let mut bitmap = Bitmap::new(128);
        assert!(!bitmap.get(77));
        bitmap.set(77);
        bitmap.set(0);
        bitmap.set(127);
        assert!(bitmap.get(77));
        assert_eq!(bitmap.count_ones(), 3);
        bitmap.unset(77);
        assert!(!bitmap.get(77));
        assert_eq!(bitmap.count_ones(), 2);
    }

    #[test]
    fn test_byte_view_matches_bit_positions() {
        let mut bitmap = Bitmap::new(64);
        bitmap.set(9);
        bitmap.set(40);
        let bytes = bitmap.to_bytes();
        assert_eq!(bytes.len(), 8);
        assert_eq!(bytes[1], 0b10);
        assert!(bit_is_set(&bytes, 9));
        assert!(bit_is_set(&bytes, 40));
        assert!(!bit_is_set(&bytes, 41));
        assert_eq!(count_set_bits(&bytes), 2);
        assert_eq!(set_bits(&bytes).collect::<Vec<_>>(), vec![9, 40]);
    }

    #[test]
    fn test_clear_resets_every_word() {
        let mut bitmap = Bitmap::new(96);
        for i in 0..96 {
            bitmap.set(i);
        }
        assert_eq!(bitmap.count_ones(), 96);
        bitmap.clear();
        assert_eq!(bitmap.count_ones(), 0);
        assert!(bitmap.words().iter().all(|&w| w == 0));
    }
}
