//! Fast free-slot selection over 64- and 256-bit identifier spaces.

/// A 64-bit scratch bitfield, used for free-slot selection over
/// identifier spaces of up to 64 entries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Bitfield64(u64);

impl Bitfield64 {
    pub const fn empty() -> Self {
        Bitfield64(0)
    }

    pub const fn full() -> Self {
        Bitfield64(u64::MAX)
    }

    pub fn set_bit(&mut self, i: u8) {
        self.0 |= 1u64 << i;
    }

    pub fn clear_bit(&mut self, i: u8) {
        self.0 &= !(1u64 << i);
    }

    pub fn get_bit(&self, i: u8) -> bool {
        (self.0 >> i) & 1 != 0
    }

    pub fn set_all(&mut self) {
        self.0 = u64::MAX;
    }

    pub fn clear_all(&mut self) {
        self.0 = 0;
    }

    /// Lowest set bit, or `None` if empty.
    pub fn first_one(&self) -> Option<u8> {
        if self.0 == 0 {
            None
        } else {
            Some(self.0.trailing_zeros() as u8)
        }
    }

    /// First set bit when the search begins at `start` and wraps
    /// modulo 64: a left-rotate by `start` followed by `first_one`,
    /// then the result index is rotated back.
    pub fn first_one_ex(&self, start: u8) -> Option<u8> {
        debug_assert!(start < 64);
        let rotated = self.0.rotate_right(start as u32);
        Bitfield64(rotated)
            .first_one()
            .map(|i| (i as u16 + start as u16).rem_euclid(64) as u8)
    }

    /// Alternate implementation of [`Self::first_one`] using the
    /// "isolate lowest set bit" identity (`x & -x`), kept only to
    /// cross-check the `trailing_zeros` path above in tests.
    fn first_one_via_isolate(bits: u64) -> Option<u8> {
        if bits == 0 {
            return None;
        }
        let isolated = bits & bits.wrapping_neg();
        Some(isolated.trailing_zeros() as u8)
    }
}

/// A 256-bit scratch bitfield, composed of four 64-bit words addressed
/// by `i >> 6` / `i & 0x3f`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Bitfield256([Bitfield64; 4]);

impl Bitfield256 {
    pub const fn empty() -> Self {
        Bitfield256([Bitfield64::empty(); 4])
    }

    pub const fn full() -> Self {
        Bitfield256([Bitfield64::full(); 4])
    }

    fn word_and_bit(i: u16) -> (usize, u8) {
        ((i >> 6) as usize, (i & 0x3f) as u8)
    }

    pub fn set_bit(&mut self, i: u16) {
        let (w, b) = Self::word_and_bit(i);
        self.0[w].set_bit(b);
    }

    pub fn clear_bit(&mut self, i: u16) {
        let (w, b) = Self::word_and_bit(i);
        self.0[w].clear_bit(b);
    }

    pub fn get_bit(&self, i: u16) -> bool {
        let (w, b) = Self::word_and_bit(i);
        self.0[w].get_bit(b)
    }

    pub fn set_all(&mut self) {
        for w in &mut self.0 {
            w.set_all();
        }
    }

    pub fn clear_all(&mut self) {
        for w in &mut self.0 {
            w.clear_all();
        }
    }

    /// Lowest set bit across all four words, or `None` if empty.
    pub fn first_one(&self) -> Option<u16> {
        for (w, word) in self.0.iter().enumerate() {
            if let Some(b) = word.first_one() {
                return Some((w as u16) * 64 + b as u16);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_set_get_clear() {
        let mut bf = Bitfield64::empty();
        bf.set_bit(5);
        assert!(bf.get_bit(5));
        bf.clear_bit(5);
        assert!(!bf.get_bit(5));
    }

    #[test]
    fn first_one_matches_lowest_set_bit() {
        let mut bf = Bitfield64::empty();
        assert_eq!(bf.first_one(), None);
        bf.set_bit(10);
        bf.set_bit(3);
        bf.set_bit(40);
        assert_eq!(bf.first_one(), Some(3));
    }

    #[test]
    fn first_one_matches_isolate_lowest_bit_fallback() {
        for pattern in [0u64, 1, 2, 0xF00D, 1 << 63, u64::MAX, 0x8000_0000_0000_0001] {
            let bf = Bitfield64(pattern);
            assert_eq!(
                bf.first_one(),
                Bitfield64::first_one_via_isolate(pattern),
                "mismatch for pattern {pattern:#x}"
            );
        }
    }

    #[test]
    fn first_one_ex_finds_nearest_set_bit_by_rotation() {
        let mut bf = Bitfield64::empty();
        bf.set_bit(2);
        bf.set_bit(50);
        for start in 0..64u8 {
            let got = bf.first_one_ex(start);
            let expected = (0..64u8)
                .filter(|&i| bf.get_bit(i))
                .min_by_key(|&i| (i as i32 - start as i32).rem_euclid(64))
                .unwrap();
            assert_eq!(got, Some(expected), "start={start}");
        }
    }

    #[test]
    fn first_one_ex_empty_is_none() {
        let bf = Bitfield64::empty();
        for start in 0..64u8 {
            assert_eq!(bf.first_one_ex(start), None);
        }
    }

    #[test]
    fn bitfield256_spans_four_words() {
        let mut bf = Bitfield256::empty();
        bf.set_bit(0);
        bf.set_bit(200);
        assert!(bf.get_bit(0));
        assert!(bf.get_bit(200));
        assert_eq!(bf.first_one(), Some(0));
        bf.clear_bit(0);
        assert_eq!(bf.first_one(), Some(200));
    }

    #[test]
    fn set_all_clear_all() {
        let mut bf = Bitfield256::empty();
        bf.set_all();
        for i in 0..256u16 {
            assert!(bf.get_bit(i));
        }
        bf.clear_all();
        assert_eq!(bf.first_one(), None);
    }
}
