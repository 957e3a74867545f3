/// A contiguous block of data within a piece, addressed the way it travels
/// on the wire in `request` and `piece` messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Block {
    /// Index of the piece (0-based)
    pub index: u32,
    /// Offset (in bytes) from the start of the piece, a multiple of the block length
    pub begin: u32,
    /// Length of the block in bytes
    pub length: u32,
}

impl Block {
    pub fn new(index: u32, begin: u32, length: u32) -> Self {
        Self {
            index,
            begin,
            length,
        }
    }

    /// Position of this block inside its piece, or `None` when `begin` does
    /// not fall on a block boundary.
    pub fn slot(&self, block_length: u32) -> Option<usize> {
        (self.begin % block_length == 0).then(|| (self.begin / block_length) as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_requires_a_block_boundary() {
        assert_eq!(Block::new(0, 0, 8).slot(8), Some(0));
        assert_eq!(Block::new(3, 16, 8).slot(8), Some(2));
        assert_eq!(Block::new(0, 3, 1).slot(8), None);
    }
}
