use std::{net::SocketAddr, sync::Arc};
use tokio::{net::TcpStream, sync::mpsc, task::JoinHandle};
use tracing::Instrument;
use crate::{block::BlockInfo, torrent::TorrentContext};

mod handshake;
mod message;
mod session;
pub mod state;

pub use handshake::{Handshake, HandshakeCodec, PROTOCOL};
pub use message::{Message, MessageCodec};
pub use session::PeerSession;

pub type Result<T> = std::result::Result<T, PeerError>;
type PeerRx = mpsc::UnboundedReceiver<PeerCommand>;
pub type PeerTx = mpsc::UnboundedSender<PeerCommand>;

#[derive(thiserror::Error, Debug)]
pub enum PeerError {

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("handshake provided incorrect protocol")]
    IncorrectProtocol,

    #[error("handshake provided incorrect info-hash")]
    IncorrectInfoHash,

    #[error("no handshake received")]
    NoHandshake,

    // Wrong length or spare bits set past the last piece.
    #[error("malformed bitfield")]
    InvalidBitfield,

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("connection timeout")]
    Timeout,

    #[error("connection closed by remote")]
    Closed,

    #[error("store error: {0}")]
    Store(#[from] crate::StoreError),

    #[error("channel error: {0}")]
    Channel(String),

}

impl<T> From<mpsc::error::SendError<T>> for PeerError {
    fn from(e: mpsc::error::SendError<T>) -> Self {
        PeerError::Channel(e.to_string())
    }
}

// Commands that can be sent to a peer session.
#[derive(Debug)]
pub enum PeerCommand {

    // Issue wire REQUESTs for these blocks.
    RequestBlocks(Vec<BlockInfo>),

    // Broadcast that we completed a piece.
    Have(usize),

    Shutdown,

}

#[derive(Debug)]
pub struct PeerHandle {

    // Commands into the session task.
    pub peer_tx: PeerTx,

    // Handle to the session task, awaited on shutdown.
    pub session_handle: Option<JoinHandle<()>>,

}

impl PeerHandle {
    // Spawns a session task for an outbound dial (socket None) or an accepted
    // inbound stream. The session reports its lifecycle to the swarm manager
    // over the context's command channel.
    pub fn start_session(
        address: SocketAddr,
        ctx: Arc<TorrentContext>,
        socket: Option<TcpStream>,
    ) -> Self {

        let (mut session, peer_tx) = PeerSession::new(address, ctx);
        let session_handle = tokio::spawn(async move {
            if let Err(e) = session.start_session(socket).await {
                tracing::debug!("session ended: {}", e);
            }
            session.disconnect();
        }.instrument(tracing::info_span!("peer", addr = %address)));

        PeerHandle {
            peer_tx,
            session_handle: Some(session_handle),
        }
    }
}
