//! Allocation mask of a directory's index blocks ($BITMAP:$I30).
//!
//! Bit `i` covers the `i`-th index block of the $INDEX_ALLOCATION stream,
//! counted across its runs in VCN order.

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Bitmap {
    bytes: Vec<u8>,
}

impl Bitmap {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    /// Number of bits the mask can describe.
    pub fn len(&self) -> u64 {
        self.bytes.len() as u64 * 8
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Bits past the end read as clear.
    pub fn get(&self, bit: u64) -> bool {
        self.bytes
            .get((bit / 8) as usize)
            .is_some_and(|b| b & (1 << (bit % 8)) != 0)
    }

    pub fn highest_set(&self) -> Option<u64> {
        let (i, byte) = self
            .bytes
            .iter()
            .enumerate()
            .rev()
            .find(|(_, b)| **b != 0)?;
        Some(i as u64 * 8 + (7 - byte.leading_zeros() as u64))
    }

    pub fn count_set(&self) -> u64 {
        self.bytes.iter().map(|b| b.count_ones() as u64).sum()
    }

    pub fn iter_set(&self) -> impl Iterator<Item = u64> + '_ {
        (0..self.len()).filter(move |&bit| self.get(bit))
    }
}
