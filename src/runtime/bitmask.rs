use std::fmt;

const WORD_BITS: usize = u64::BITS as usize;

/// A growable bit-set for tracking which of N participants have reported an
/// event.
///
/// Bits past `len` are always zero, so two masks can be compared word by word.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Bitmask {
    words: Vec<u64>,
    len: usize,
}

fn words_for(len: usize) -> usize {
    (len + WORD_BITS - 1) / WORD_BITS
}

impl Bitmask {
    /// Creates a mask with `len` cleared bits.
    pub fn new(len: usize) -> Self {
        Self {
            words: vec![0; words_for(len)],
            len,
        }
    }

    /// Creates a mask of `len` bits, all set.
    pub fn full(len: usize) -> Self {
        let mut mask = Self::new(len);
        for index in 0..len {
            mask.set(index);
        }
        mask
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Extends the mask to `len` bits. Never shrinks.
    pub fn grow(&mut self, len: usize) {
        if len > self.len {
            self.len = len;
            self.words.resize(words_for(len), 0);
        }
    }

    /// Sets a bit, growing the mask if the index is past the end.
    pub fn set(&mut self, index: usize) {
        self.grow(index + 1);
        self.words[index / WORD_BITS] |= 1 << (index % WORD_BITS);
    }

    pub fn clear(&mut self, index: usize) {
        if index < self.len {
            self.words[index / WORD_BITS] &= !(1 << (index % WORD_BITS));
        }
    }

    pub fn get(&self, index: usize) -> bool {
        index < self.len && self.words[index / WORD_BITS] & (1 << (index % WORD_BITS)) != 0
    }

    /// Number of set bits.
    pub fn count(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// True once every bit in `0..len` is set. An empty mask is trivially
    /// full.
    pub fn is_set_all(&self) -> bool {
        self.count() == self.len
    }

    /// True if every bit set in `mask` is also set here.
    pub fn covers(&self, mask: &Bitmask) -> bool {
        mask.words.iter().enumerate().all(|(i, want)| {
            let have = self.words.get(i).copied().unwrap_or(0);
            have & want == *want
        })
    }

    pub fn reset(&mut self) {
        self.words.iter_mut().for_each(|w| *w = 0);
    }

    /// Indices of the set bits in ascending order.
    pub fn ones(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.len).filter(move |&i| self.get(i))
    }
}

impl fmt::Debug for Bitmask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Bitmask(")?;
        for index in 0..self.len {
            write!(f, "{}", if self.get(index) { '1' } else { '0' })?;
        }
        write!(f, ")")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fills_up_bit_by_bit() {
        let mut mask = Bitmask::new(3);
        assert!(!mask.is_set_all());
        mask.set(0);
        mask.set(2);
        assert!(!mask.is_set_all());
        assert_eq!(mask.count(), 2);
        mask.set(1);
        assert!(mask.is_set_all());
    }

    #[test]
    fn empty_mask_is_full() {
        assert!(Bitmask::new(0).is_set_all());
        assert!(Bitmask::default().is_set_all());
    }

    #[test]
    fn set_past_end_grows() {
        let mut mask = Bitmask::new(2);
        mask.set(130);
        assert_eq!(mask.len(), 131);
        assert!(mask.get(130));
        assert!(!mask.get(129));
        assert!(!mask.get(500));
    }

    #[test]
    fn clear_and_reset() {
        let mut mask = Bitmask::full(70);
        assert!(mask.is_set_all());
        mask.clear(65);
        assert!(!mask.get(65));
        assert_eq!(mask.count(), 69);
        mask.reset();
        assert_eq!(mask.count(), 0);
        assert_eq!(mask.len(), 70);
    }

    #[test]
    fn covers_compares_against_a_reference_mask() {
        let mut local = Bitmask::new(8);
        local.set(1);
        local.set(5);

        let mut arrived = Bitmask::new(8);
        arrived.set(1);
        assert!(!arrived.covers(&local));
        arrived.set(5);
        assert!(arrived.covers(&local));
        arrived.set(7);
        assert!(arrived.covers(&local));

        // a shorter mask only covers masks whose high words are empty
        let short = Bitmask::full(3);
        let mut wide = Bitmask::new(100);
        wide.set(99);
        assert!(!short.covers(&wide));
    }

    #[test]
    fn debug_prints_bits() {
        let mut mask = Bitmask::new(4);
        mask.set(1);
        assert_eq!(format!("{:?}", mask), "Bitmask(0100)");
        assert_eq!(mask.ones().collect::<Vec<_>>(), vec![1]);
    }
}
