use std::collections::{BTreeSet, HashMap};
use std::net::SocketAddr;
use crate::block::{block_len, num_blocks, BlockInfo};

// Per-piece download state while its blocks are fanned out across peers.
#[derive(Debug)]
pub struct PieceDownload {

    pub piece: usize,

    pub piece_len: usize,

    // Block indices not yet requested from anyone.
    pub pending: BTreeSet<usize>,

    // Block index -> peer currently fetching it.
    pub in_progress: HashMap<usize, SocketAddr>,

    // Completed block counts per peer, for completion stats.
    pub received: HashMap<SocketAddr, usize>,

}

impl PieceDownload {

    pub fn new(piece: usize, piece_len: usize) -> Self {
        Self {
            piece,
            piece_len,
            pending: (0..num_blocks(piece_len)).collect(),
            in_progress: HashMap::new(),
            received: HashMap::new(),
        }
    }

    pub fn block_info(&self, block_idx: usize) -> BlockInfo {
        BlockInfo {
            piece_idx: self.piece,
            offset: block_idx * crate::BLOCK_SIZE,
            len: block_len(self.piece_len, block_idx),
        }
    }

    pub fn assign(&mut self, block_idx: usize, peer: SocketAddr) {
        self.pending.remove(&block_idx);
        self.in_progress.insert(block_idx, peer);
    }

    // Records a received block; unsolicited duplicates are ignored.
    pub fn block_received(&mut self, block: &BlockInfo, peer: SocketAddr) {
        let block_idx = block.idx_in_piece();
        if self.in_progress.remove(&block_idx).is_some() || self.pending.remove(&block_idx) {
            *self.received.entry(peer).or_insert(0) += 1;
        }
    }

    // Blocks the departed peer was fetching go back to pending; returns them
    // for the immediate retry pass.
    pub fn release_peer(&mut self, peer: &SocketAddr) -> Vec<usize> {
        let released: Vec<usize> = self.in_progress
            .iter()
            .filter(|(_, p)| *p == peer)
            .map(|(b, _)| *b)
            .collect();
        for block_idx in &released {
            self.in_progress.remove(block_idx);
            self.pending.insert(*block_idx);
        }
        released
    }

    // Hash mismatch: everything returns to pending and stats restart.
    pub fn reset(&mut self) {
        self.pending = (0..num_blocks(self.piece_len)).collect();
        self.in_progress.clear();
        self.received.clear();
    }

    pub fn all_received(&self) -> bool {
        self.pending.is_empty() && self.in_progress.is_empty()
    }
}
