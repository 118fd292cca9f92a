use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::Arc,
};
use tokio::{net::TcpStream, sync::mpsc, task::JoinHandle};
use crate::{
    block::BlockInfo,
    p2p::{PeerCommand, PeerHandle},
    torrent::TorrentContext,
    Bitfield,
};

mod download;
pub use download::PieceDownload;

pub type Result<T> = std::result::Result<T, SwarmError>;
pub type SwarmTx = mpsc::UnboundedSender<SwarmCommand>;
pub type SwarmRx = mpsc::UnboundedReceiver<SwarmCommand>;

#[derive(Debug, thiserror::Error)]
pub enum SwarmError {

    #[error("channel error: {0}")]
    Channel(String),

}

impl<T> From<mpsc::error::SendError<T>> for SwarmError {
    fn from(e: mpsc::error::SendError<T>) -> Self {
        SwarmError::Channel(e.to_string())
    }
}

// Commands into the swarm manager task. Peer sessions report their lifecycle
// and wire events; the torrent task feeds it discovered peers and inbound
// connections.
#[derive(Debug)]
pub enum SwarmCommand {

    // Discovered peers to dial.
    Dial(Vec<SocketAddr>),

    // Inbound connection accepted by the listener.
    Accepted { stream: TcpStream, address: SocketAddr },

    // Handshake succeeded.
    Connected { address: SocketAddr, id: crate::ID },

    // Session ended for any reason.
    Disconnected { address: SocketAddr },

    Bitfield { address: SocketAddr, bitfield: Bitfield },

    Have { address: SocketAddr, piece: usize },

    Unchoked { address: SocketAddr },

    Choked { address: SocketAddr },

    BlockReceived { address: SocketAddr, block: BlockInfo },

    // The session could not issue these scheduled requests.
    BlocksAbandoned { address: SocketAddr, blocks: Vec<BlockInfo> },

    // Store reported a hash mismatch for this piece.
    PieceFailed { piece: usize },

    // Store verified and flushed this piece.
    PieceComplete { piece: usize },

    Shutdown,

}

// Per-peer state mirrored from session reports, keyed by remote ip:port. The
// manager owns the handles; sessions only hold a sender back to the manager,
// which keeps ownership acyclic.
struct PeerEntry {

    handle: PeerHandle,

    id: Option<crate::ID>,

    bitfield: Option<Bitfield>,

    peer_choking: bool,

}

impl PeerEntry {
    fn has_piece(&self, piece: usize) -> bool {
        self.bitfield.as_ref().map_or(false, |bf| bf[piece])
    }
}

pub struct SwarmManager {

    ctx: Arc<TorrentContext>,

    swarm_rx: SwarmRx,

    peers: HashMap<SocketAddr, PeerEntry>,

    // Reserved pieces currently being fetched, keyed by piece index.
    downloads: HashMap<usize, PieceDownload>,

}

// Spawn the manager task. The paired sender is already wired into the
// context handed to peer sessions.
pub fn spawn(ctx: Arc<TorrentContext>, swarm_rx: SwarmRx) -> JoinHandle<()> {
    let mut manager = SwarmManager::new(ctx, swarm_rx);
    tokio::spawn(async move {
        manager.run().await;
    })
}

impl SwarmManager {

    pub fn new(ctx: Arc<TorrentContext>, swarm_rx: SwarmRx) -> Self {
        Self {
            ctx,
            swarm_rx,
            peers: HashMap::new(),
            downloads: HashMap::new(),
        }
    }

    #[tracing::instrument(name = "swarm", skip_all)]
    pub async fn run(&mut self) {
        tracing::debug!("swarm manager running");
        while let Some(cmd) = self.swarm_rx.recv().await {
            if matches!(cmd, SwarmCommand::Shutdown) {
                self.shutdown().await;
                break;
            }
            self.handle_command(cmd);
        }
        tracing::debug!("swarm manager stopped");
    }

    fn handle_command(&mut self, cmd: SwarmCommand) {
        match cmd {

            SwarmCommand::Dial(addresses) => {
                for address in addresses {
                    // Dedup by ip:port.
                    if self.peers.contains_key(&address) {
                        tracing::trace!("already connected to {}", address);
                        continue;
                    }
                    let handle = PeerHandle::start_session(address, self.ctx.clone(), None);
                    self.register_peer(address, handle);
                }
            },

            SwarmCommand::Accepted { stream, address } => {
                if self.peers.contains_key(&address) {
                    tracing::trace!("dropping duplicate inbound connection from {}", address);
                    drop(stream);
                    return;
                }
                let handle = PeerHandle::start_session(address, self.ctx.clone(), Some(stream));
                self.register_peer(address, handle);
            },

            SwarmCommand::Connected { address, id } => {
                if let Some(peer) = self.peers.get_mut(&address) {
                    peer.id = Some(id);
                }
            },

            SwarmCommand::Disconnected { address } => self.remove_peer(address),

            SwarmCommand::Bitfield { address, bitfield } => {
                if let Some(peer) = self.peers.get_mut(&address) {
                    peer.bitfield = Some(bitfield);
                }
                self.schedule();
            },

            SwarmCommand::Have { address, piece } => {
                let num_pieces = self.ctx.store.num_pieces();
                if let Some(peer) = self.peers.get_mut(&address) {
                    peer.bitfield
                        .get_or_insert_with(|| Bitfield::repeat(false, num_pieces))
                        .set(piece, true);
                }
                self.schedule();
            },

            SwarmCommand::Unchoked { address } => {
                if let Some(peer) = self.peers.get_mut(&address) {
                    peer.peer_choking = false;
                }
                self.schedule();
            },

            SwarmCommand::Choked { address } => {
                if let Some(peer) = self.peers.get_mut(&address) {
                    peer.peer_choking = true;
                }
            },

            SwarmCommand::BlockReceived { address, block } => {
                if let Some(pd) = self.downloads.get_mut(&block.piece_idx) {
                    pd.block_received(&block, address);
                }
            },

            SwarmCommand::BlocksAbandoned { address, blocks } => {
                tracing::debug!("{} abandoned {} blocks", address, blocks.len());
                for block in &blocks {
                    if let Some(pd) = self.downloads.get_mut(&block.piece_idx) {
                        pd.in_progress.remove(&block.idx_in_piece());
                        pd.pending.insert(block.idx_in_piece());
                    }
                }
                for piece in blocks.iter().map(|b| b.piece_idx).collect::<std::collections::BTreeSet<_>>() {
                    self.distribute(piece);
                }
            },

            SwarmCommand::PieceFailed { piece } => {
                if let Some(pd) = self.downloads.get_mut(&piece) {
                    pd.reset();
                    self.distribute(piece);
                }
            },

            SwarmCommand::PieceComplete { piece } => self.piece_complete(piece),

            SwarmCommand::Shutdown => unreachable!("handled in run"),

        }
    }

    fn register_peer(&mut self, address: SocketAddr, handle: PeerHandle) {
        tracing::debug!("registering peer {}", address);
        self.peers.insert(address, PeerEntry {
            handle,
            id: None,
            bitfield: None,
            peer_choking: true,
        });
    }

    // Peer departure: its in-flight blocks return to pending and an immediate
    // retry pass redistributes them across the remaining peers.
    fn remove_peer(&mut self, address: SocketAddr) {
        if self.peers.remove(&address).is_none() {
            return;
        }
        tracing::debug!("deregistered peer {}", address);

        let mut touched = Vec::new();
        for (piece, pd) in self.downloads.iter_mut() {
            if !pd.release_peer(&address).is_empty() {
                touched.push(*piece);
            }
        }
        for piece in touched {
            self.distribute(piece);
        }
    }

    // Peers that advertise the piece and are not choking us, in stable order.
    fn eligible_peers(&self, piece: usize) -> Vec<SocketAddr> {
        let mut eligible: Vec<SocketAddr> = self.peers
            .iter()
            .filter(|(_, peer)| peer.has_piece(piece) && !peer.peer_choking)
            .map(|(address, _)| *address)
            .collect();
        eligible.sort_unstable();
        eligible
    }

    fn send_to_peer(&self, address: &SocketAddr, cmd: PeerCommand) {
        if let Some(peer) = self.peers.get(address) {
            peer.handle.peer_tx.send(cmd).ok();
        }
    }

    // First-needed picking: reserve the lowest piece we lack that an unchoked
    // peer advertises, up to one active piece per connected peer.
    fn schedule(&mut self) {
        // Blocks stranded pending by departures or chokes get another chance
        // whenever peer availability changes.
        let stranded: Vec<usize> = self.downloads
            .iter()
            .filter(|(_, pd)| !pd.pending.is_empty())
            .map(|(piece, _)| *piece)
            .collect();
        for piece in stranded {
            self.distribute(piece);
        }

        let cap = self.peers.values().filter(|p| !p.peer_choking).count().max(1);
        while self.downloads.len() < cap {
            match self.pick_piece() {
                Some(piece) => {
                    if !self.start_download(piece) {
                        break;
                    }
                },
                None => break,
            }
        }
    }

    fn pick_piece(&self) -> Option<usize> {
        let bitfield = self.ctx.store.bitfield();
        (0..self.ctx.store.num_pieces()).find(|&piece| {
            !bitfield[piece]
                && !self.downloads.contains_key(&piece)
                && self.peers.values().any(|p| p.has_piece(piece) && !p.peer_choking)
        })
    }

    // Reserve the piece and fan its blocks out Round-Robin. Returns false if
    // no peer could take it, in which case the reservation is dropped.
    fn start_download(&mut self, piece: usize) -> bool {
        if self.downloads.contains_key(&piece) || self.ctx.store.has_piece(piece) {
            return false;
        }
        // Reserve before enumerating peers so a racing trigger cannot
        // double-schedule the piece.
        let piece_len = self.ctx.store.piece_size(piece);
        self.downloads.insert(piece, PieceDownload::new(piece, piece_len));

        if !self.distribute(piece) {
            self.downloads.remove(&piece);
            return false;
        }
        true
    }

    // Assign all pending blocks of the piece Round-Robin over the eligible
    // peers: block j goes to peer j mod k. Used for the initial fan-out and
    // for every retry pass.
    fn distribute(&mut self, piece: usize) -> bool {

        let eligible = self.eligible_peers(piece);
        if eligible.is_empty() {
            tracing::debug!("no eligible peers for piece {}", piece);
            return false;
        }

        let pd = match self.downloads.get_mut(&piece) {
            Some(pd) => pd,
            None => return false,
        };

        let pending: Vec<usize> = pd.pending.iter().copied().collect();
        if pending.is_empty() {
            return true;
        }

        tracing::debug!("distributing {} blocks of piece {} over {} peers", pending.len(), piece, eligible.len());
        let mut batches: HashMap<SocketAddr, Vec<BlockInfo>> = HashMap::new();
        for (j, block_idx) in pending.into_iter().enumerate() {
            let peer = eligible[j % eligible.len()];
            pd.assign(block_idx, peer);
            batches.entry(peer).or_default().push(pd.block_info(block_idx));
        }

        for (address, blocks) in batches {
            self.send_to_peer(&address, PeerCommand::RequestBlocks(blocks));
        }
        true
    }

    // Store verified the piece: log per-peer stats, drop the entry, broadcast
    // HAVE to every registered peer, then keep the pipeline busy.
    fn piece_complete(&mut self, piece: usize) {
        if let Some(pd) = self.downloads.remove(&piece) {
            let mut stats: Vec<(SocketAddr, usize)> = pd.received.into_iter().collect();
            stats.sort_unstable();
            tracing::info!("piece {} complete; blocks per peer: {:?}", piece, stats);
        }

        for peer in self.peers.values() {
            peer.handle.peer_tx.send(PeerCommand::Have(piece)).ok();
        }

        self.schedule();
    }

    async fn shutdown(&mut self) {
        tracing::debug!("disconnecting {} peers", self.peers.len());
        for peer in self.peers.values() {
            peer.handle.peer_tx.send(PeerCommand::Shutdown).ok();
        }
        for (_, mut peer) in self.peers.drain() {
            if let Some(handle) = peer.handle.session_handle.take() {
                handle.await.ok();
            }
        }
    }

    // Test hooks: drive the manager without live sessions.
    #[cfg(test)]
    fn insert_test_peer(&mut self, address: SocketAddr) -> mpsc::UnboundedReceiver<PeerCommand> {
        let (peer_tx, peer_rx) = mpsc::unbounded_channel();
        self.peers.insert(address, PeerEntry {
            handle: PeerHandle { peer_tx, session_handle: None },
            id: None,
            bitfield: None,
            peer_choking: true,
        });
        peer_rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{PieceStore, torrent::TorrentContext, BLOCK_SIZE};

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{}", port).parse().unwrap()
    }

    // One piece of 6 blocks (5 * 16 KiB + 1000), piece length = total length.
    fn test_manager() -> (tempfile::TempDir, SwarmManager, SwarmTx) {
        let dir = tempfile::TempDir::new().unwrap();
        let total = (BLOCK_SIZE * 5 + 1000) as u64;
        let store = PieceStore::create(dir.path().join("f.part"), BLOCK_SIZE * 5 + 1000, total).unwrap();
        let (swarm_tx, swarm_rx) = mpsc::unbounded_channel();
        let ctx = Arc::new(TorrentContext {
            info_hash: [1; 20],
            client_id: [2; 20],
            store: Arc::new(store),
            swarm_tx: swarm_tx.clone(),
        });
        (dir, SwarmManager::new(ctx, swarm_rx), swarm_tx)
    }

    fn full_bitfield(n: usize) -> Bitfield {
        Bitfield::repeat(true, n)
    }

    fn drain_requests(rx: &mut mpsc::UnboundedReceiver<PeerCommand>) -> Vec<BlockInfo> {
        let mut blocks = Vec::new();
        while let Ok(cmd) = rx.try_recv() {
            if let PeerCommand::RequestBlocks(batch) = cmd {
                blocks.extend(batch);
            }
        }
        blocks
    }

    #[tokio::test]
    async fn test_round_robin_across_three_peers() {
        let (_dir, mut manager, _tx) = test_manager();

        let mut rxs: Vec<_> = (1..=3).map(|p| manager.insert_test_peer(addr(p))).collect();
        for p in 1..=3u16 {
            manager.handle_command(SwarmCommand::Bitfield { address: addr(p), bitfield: full_bitfield(1) });
        }
        // All three eligible before the fan-out happens.
        for p in 2..=3u16 {
            manager.peers.get_mut(&addr(p)).unwrap().peer_choking = false;
        }
        manager.handle_command(SwarmCommand::Unchoked { address: addr(1) });

        // Blocks 0..6 assigned j -> peer (j mod 3): two each.
        let per_peer: Vec<Vec<BlockInfo>> = rxs.iter_mut().map(drain_requests).collect();
        assert_eq!(per_peer[0].iter().map(|b| b.idx_in_piece()).collect::<Vec<_>>(), vec![0, 3]);
        assert_eq!(per_peer[1].iter().map(|b| b.idx_in_piece()).collect::<Vec<_>>(), vec![1, 4]);
        assert_eq!(per_peer[2].iter().map(|b| b.idx_in_piece()).collect::<Vec<_>>(), vec![2, 5]);

        // Completion stats come out even.
        for (i, blocks) in per_peer.iter().enumerate() {
            for block in blocks {
                manager.handle_command(SwarmCommand::BlockReceived { address: addr(i as u16 + 1), block: *block });
            }
        }
        let pd = manager.downloads.get(&0).unwrap();
        assert!(pd.all_received());
        assert_eq!(pd.received[&addr(1)], 2);
        assert_eq!(pd.received[&addr(2)], 2);
        assert_eq!(pd.received[&addr(3)], 2);
    }

    #[tokio::test]
    async fn test_peer_failure_retry() {
        let (_dir, mut manager, _tx) = test_manager();

        let mut rxs: Vec<_> = (1..=3).map(|p| manager.insert_test_peer(addr(p))).collect();
        for p in 1..=3u16 {
            manager.handle_command(SwarmCommand::Bitfield { address: addr(p), bitfield: full_bitfield(1) });
        }
        for p in 2..=3u16 {
            manager.peers.get_mut(&addr(p)).unwrap().peer_choking = false;
        }
        manager.handle_command(SwarmCommand::Unchoked { address: addr(1) });
        for rx in rxs.iter_mut() {
            drain_requests(rx);
        }

        // P2 (blocks 1 and 4) departs; its blocks are reissued to P1/P3.
        manager.handle_command(SwarmCommand::Disconnected { address: addr(2) });

        let reissued_1: Vec<usize> = drain_requests(&mut rxs[0]).iter().map(|b| b.idx_in_piece()).collect();
        let reissued_3: Vec<usize> = drain_requests(&mut rxs[2]).iter().map(|b| b.idx_in_piece()).collect();
        let mut all: Vec<usize> = reissued_1.iter().chain(reissued_3.iter()).copied().collect();
        all.sort_unstable();
        assert_eq!(all, vec![1, 4]);

        let pd = manager.downloads.get(&0).unwrap();
        assert!(pd.pending.is_empty());
        assert!(!pd.in_progress.values().any(|p| *p == addr(2)));
    }

    #[tokio::test]
    async fn test_no_eligible_peers_drops_reservation() {
        let (_dir, mut manager, _tx) = test_manager();
        let _rx = manager.insert_test_peer(addr(1));
        // Peer advertises the piece but is still choking us.
        manager.handle_command(SwarmCommand::Bitfield { address: addr(1), bitfield: full_bitfield(1) });
        assert!(manager.downloads.is_empty());
    }

    #[tokio::test]
    async fn test_piece_failed_resets_and_redistributes() {
        let (_dir, mut manager, _tx) = test_manager();
        let mut rx = manager.insert_test_peer(addr(1));
        manager.handle_command(SwarmCommand::Bitfield { address: addr(1), bitfield: full_bitfield(1) });
        manager.handle_command(SwarmCommand::Unchoked { address: addr(1) });
        let first = drain_requests(&mut rx);
        assert_eq!(first.len(), 6);
        for block in &first {
            manager.handle_command(SwarmCommand::BlockReceived { address: addr(1), block: *block });
        }

        manager.handle_command(SwarmCommand::PieceFailed { piece: 0 });
        let retried = drain_requests(&mut rx);
        assert_eq!(retried.len(), 6, "all blocks rescheduled after hash failure");
        assert!(manager.downloads.get(&0).unwrap().received.is_empty());
    }

    #[tokio::test]
    async fn test_have_broadcast_on_completion() {
        let (_dir, mut manager, _tx) = test_manager();
        let mut rx1 = manager.insert_test_peer(addr(1));
        let mut rx2 = manager.insert_test_peer(addr(2));

        manager.handle_command(SwarmCommand::PieceComplete { piece: 0 });
        assert!(matches!(rx1.try_recv(), Ok(PeerCommand::Have(0))));
        assert!(matches!(rx2.try_recv(), Ok(PeerCommand::Have(0))));
    }
}
