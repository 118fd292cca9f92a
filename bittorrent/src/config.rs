use std::{
    net::{Ipv4Addr, SocketAddr},
    path::PathBuf,
};
use crate::ID;

const CLIENT_ID_PREFIX: &[u8; 8] = b"-JC0001-";

// Fixed 8-byte prefix followed by 12 random hex characters, fresh per
// process.
pub fn gen_client_id() -> ID {
    let mut id = [0u8; 20];
    id[..8].copy_from_slice(CLIENT_ID_PREFIX);
    let suffix = hex::encode(rand::random::<[u8; 6]>());
    id[8..].copy_from_slice(suffix.as_bytes());
    id
}

// How the client finds peers for a torrent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum DiscoveryMode {
    Tracker,
    Overlay,
    Both,
}

impl DiscoveryMode {
    pub fn uses_tracker(&self) -> bool {
        matches!(self, DiscoveryMode::Tracker | DiscoveryMode::Both)
    }

    pub fn uses_overlay(&self) -> bool {
        matches!(self, DiscoveryMode::Overlay | DiscoveryMode::Both)
    }
}

#[derive(Debug, Clone)]
pub struct TorrentConfig {

    // Unique 20-byte identifier used by this client.
    pub client_id: ID,

    // Address on which the client listens for incoming peers.
    pub listen_address: SocketAddr,

    // Directory the torrent writes its file into.
    pub output_dir: PathBuf,

    pub discovery: DiscoveryMode,

    // Overlay settings, used when discovery involves the overlay.
    pub overlay_listen: String,

    pub overlay_bootstraps: Vec<String>,

    // Name other peers should use to reach us, forwarded to the tracker and
    // used in overlay announces. Defaults to the listen address.
    pub hostname: Option<String>,

}

impl Default for TorrentConfig {
    fn default() -> Self {
        Self {
            client_id: gen_client_id(),
            listen_address: SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), 6881),
            output_dir: PathBuf::from("downloads"),
            discovery: DiscoveryMode::Tracker,
            overlay_listen: "0.0.0.0:7681".to_string(),
            overlay_bootstraps: Vec::new(),
            hostname: None,
        }
    }
}
