pub mod block;
mod config;
mod de;
mod metainfo;
mod store;

pub mod overlay;
pub mod p2p;
pub mod swarm;
pub mod torrent;
pub mod tracker;

// Wire transfer unit. Blocks are 16 KiB except possibly the tail of a piece.
pub const BLOCK_SIZE: usize = 0x4000;

// Upper bound tolerated for a remote block request; anything larger is refused.
pub const MAX_REQUEST_LEN: usize = 0x8000;

pub type Bitfield = bitvec::vec::BitVec<u8, bitvec::order::Msb0>;

// 20-byte identifier, used for both info-hashes and peer ids.
pub type ID = [u8; 20];

pub use config::{gen_client_id, DiscoveryMode, TorrentConfig};
pub use metainfo::MetaInfo;
pub use store::{PieceStore, StoreError};
pub use torrent::{Torrent, TorrentContext};
