use crate::piece::Block;
use crate::torrent::Layout;

/// Shared record of which blocks are leased to an outstanding request and
/// which have arrived.
///
/// Both bitmaps are indexed `[piece][block in piece]`. A `received` entry is
/// never cleared; `requested` is a lease set that gets reclaimed in bulk.
pub struct PieceManager {
    requested:    Vec<Vec<bool>>,
    received:     Vec<Vec<bool>>,
    block_length: u32,
}

impl PieceManager {
    pub fn new(layout: &Layout) -> Self {
        let blocks: Vec<Vec<bool>> = (0..layout.piece_count)
            .map(|i| vec![false; layout.blocks_per_piece(i)])
            .collect();

        Self {
            requested:    blocks.clone(),
            received:     blocks,
            block_length: layout.block_length,
        }
    }

    /// Leases `block` to an outstanding request. Returns `false` if the block
    /// lies outside the torrent or off a block boundary.
    pub fn add_requested(&mut self, block: &Block) -> bool {
        entry(&mut self.requested, block, self.block_length)
            .map(|b| *b = true)
            .is_some()
    }

    /// Records `block` as downloaded. Returns `false` if the block lies
    /// outside the torrent or off a block boundary.
    pub fn add_received(&mut self, block: &Block) -> bool {
        entry(&mut self.received, block, self.block_length)
            .map(|b| *b = true)
            .is_some()
    }

    /// Whether `block` should be requested from a peer.
    ///
    /// Once every block is leased while some are still missing, the stale
    /// leases are dropped so stalled or vanished peers cannot hold them.
    pub fn needed(&mut self, block: &Block) -> bool {
        if all_set(&self.requested) {
            self.requested = self.received.clone();
        }
        self.requested
            .get(block.index as usize)
            .zip(block.slot(self.block_length))
            .and_then(|(p, slot)| p.get(slot))
            .is_some_and(|leased| !leased)
    }

    pub fn is_done(&self) -> bool {
        all_set(&self.received)
    }

    /// Releases every lease that has not been fulfilled yet.
    pub fn reset_requested_state(&mut self) {
        self.requested = self.received.clone();
    }

    /// Blocks received so far and total blocks in the torrent.
    pub fn progress(&self) -> (usize, usize) {
        let received = self.received.iter().flatten().filter(|b| **b).count();
        let total = self.received.iter().map(Vec::len).sum();
        (received, total)
    }
}

fn entry<'a>(map: &'a mut [Vec<bool>], block: &Block, block_length: u32) -> Option<&'a mut bool> {
    map.get_mut(block.index as usize)
        .zip(block.slot(block_length))
        .and_then(|(p, slot)| p.get_mut(slot))
}

fn all_set(map: &[Vec<bool>]) -> bool {
    map.iter().all(|p| p.iter().all(|b| *b))
}
