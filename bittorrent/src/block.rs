use crate::BLOCK_SIZE;

// Identifies a block on the wire: (piece, begin offset, length).
#[derive(Debug, Hash, PartialEq, Eq, Clone, Copy)]
pub struct BlockInfo {

    pub piece_idx: usize,

    pub offset: usize,

    pub len: usize,

}

impl BlockInfo {
    #[inline]
    pub fn idx_in_piece(&self) -> usize {
        self.offset / BLOCK_SIZE
    }
}

// A block together with its payload, as carried by a PIECE message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockData {

    pub piece_idx: usize,

    pub offset: usize,

    pub data: Vec<u8>,

}

// Length of the block at block_idx within a piece of piece_len bytes.
pub fn block_len(piece_len: usize, block_idx: usize) -> usize {
    BLOCK_SIZE.min(piece_len - (block_idx * BLOCK_SIZE))
}

pub fn num_blocks(piece_len: usize) -> usize {
    (piece_len + (BLOCK_SIZE - 1)) / BLOCK_SIZE
}
