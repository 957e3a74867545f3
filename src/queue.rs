use std::collections::VecDeque;
use std::sync::Arc;

use crate::piece::Block;
use crate::torrent::Layout;

/// Per-connection FIFO of pieces the remote peer advertised, handed out one
/// block at a time.
pub struct BlockQueue {
    layout:  Arc<Layout>,
    pieces:  VecDeque<u32>,
    current: VecDeque<Block>,
    /// Whether the remote peer is choking us; no requests while set.
    pub choked: bool,
}

impl BlockQueue {
    pub fn new(layout: Arc<Layout>) -> Self {
        Self {
            layout,
            pieces: VecDeque::new(),
            current: VecDeque::new(),
            choked: true,
        }
    }

    /// Queues a piece announced by `have`. Indices outside the torrent are dropped.
    pub fn push_piece(&mut self, index: u32) {
        if (index as usize) < self.layout.piece_count {
            self.pieces.push_back(index);
        }
    }

    /// Queues every piece set in a `bitfield` payload, most significant bit first.
    pub fn push_bitfield(&mut self, bitfield: &[u8]) {
        for (i, byte) in bitfield.iter().enumerate() {
            for bit in 0..8 {
                if byte & (0b1000_0000 >> bit) != 0 {
                    self.push_piece((i * 8 + bit) as u32);
                }
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.current.is_empty() && self.pieces.is_empty()
    }

    /// Next candidate block, expanding the oldest queued piece when the
    /// current one runs out.
    pub fn pop(&mut self) -> Option<Block> {
        if self.current.is_empty() {
            let index = self.pieces.pop_front()?;
            self.current = self.expand(index);
        }
        self.current.pop_front()
    }

    fn expand(&self, index: u32) -> VecDeque<Block> {
        let count = self.layout.blocks_per_piece(index as usize);
        (0..count)
            .map(|b| {
                Block::new(
                    index,
                    b as u32 * self.layout.block_length,
                    self.layout.block_length_at(index as usize, b),
                )
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue() -> BlockQueue {
        BlockQueue::new(Arc::new(Layout {
            info_hash:    [0u8; 20],
            piece_length: 16,
            total_length: 16 * 9 + 5,
            piece_count:  10,
            block_length: 8,
        }))
    }

    #[test]
    fn starts_choked_and_empty() {
        let q = queue();
        assert!(q.choked);
        assert!(q.is_empty());
    }

    #[test]
    fn expands_pieces_in_fifo_order() {
        let mut q = queue();
        q.push_piece(3);
        q.push_piece(1);

        let popped: Vec<_> = std::iter::from_fn(|| q.pop()).collect();
        assert_eq!(
            popped,
            vec![
                Block::new(3, 0, 8),
                Block::new(3, 8, 8),
                Block::new(1, 0, 8),
                Block::new(1, 8, 8),
            ]
        );
        assert!(q.is_empty());
    }

    #[test]
    fn last_piece_block_is_truncated() {
        let mut q = queue();
        q.push_piece(9);
        assert_eq!(q.pop(), Some(Block::new(9, 0, 5)));
        assert_eq!(q.pop(), None);
    }

    #[test]
    fn bitfield_is_read_msb_first() {
        let mut q = queue();
        q.push_bitfield(&[0b0100_0001, 0b1000_0000]);

        let pieces: Vec<_> = std::iter::from_fn(|| q.pop())
            .filter(|b| b.begin == 0)
            .map(|b| b.index)
            .collect();
        assert_eq!(pieces, vec![1, 7, 8]);
    }

    #[test]
    fn partially_consumed_piece_keeps_queue_non_empty() {
        let mut q = queue();
        q.push_piece(0);
        q.pop();
        assert!(!q.is_empty());
        q.pop();
        assert!(q.is_empty());
    }

    #[test]
    fn drops_out_of_range_pieces() {
        let mut q = queue();
        q.push_piece(10);
        q.push_bitfield(&[0, 0b0011_0000]);
        assert!(q.is_empty());
    }
}
