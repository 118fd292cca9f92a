use std::{net::SocketAddr, sync::Arc, time::Duration};
use futures::{stream::SplitSink, SinkExt, StreamExt};
use tokio::{net::TcpStream, sync::mpsc, time};
use tokio_util::codec::Framed;
use crate::{
    block::{BlockData, BlockInfo},
    swarm::SwarmCommand,
    torrent::TorrentContext,
    Bitfield, MAX_REQUEST_LEN,
};
use super::{*, handshake::*, message::*, state::*};

type MessageSink = SplitSink<Framed<TcpStream, MessageCodec>, Message>;

// Progressive read deadlines; three consecutive expiries close the session.
const READ_TIMEOUTS: [Duration; 3] = [
    Duration::from_secs(1),
    Duration::from_secs(2),
    Duration::from_secs(4),
];

const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

pub struct PeerSession {

    // The peer's address, which doubles as its registry key.
    address: SocketAddr,

    // Read-only state shared across the torrent.
    ctx: Arc<TorrentContext>,

    // Commands from the swarm manager.
    peer_rx: PeerRx,

    // Pieces the peer holds; None until a bitfield or first HAVE arrives.
    bitfield: Option<Bitfield>,

    state: SessionState,

}

impl PeerSession {

    pub fn new(address: SocketAddr, ctx: Arc<TorrentContext>) -> (PeerSession, PeerTx) {
        let (peer_tx, peer_rx) = mpsc::unbounded_channel();
        (
            PeerSession {
                address,
                ctx,
                peer_rx,
                bitfield: None,
                state: SessionState::default(),
            },
            peer_tx,
        )
    }

    pub async fn start_session(&mut self, inbound_stream: Option<TcpStream>) -> Result<()> {

        self.state.conn_state = ConnState::Connecting;
        let inbound = inbound_stream.is_some();
        let mut socket = if let Some(stream) = inbound_stream {
            Framed::new(stream, HandshakeCodec)
        } else {
            let stream = time::timeout(DIAL_TIMEOUT, TcpStream::connect(self.address))
                .await
                .map_err(|_| PeerError::Timeout)??;
            tracing::trace!("outbound connection successful");
            Framed::new(stream, HandshakeCodec)
        };

        self.exchange_handshake(&mut socket, inbound).await?;

        // map_codec keeps any bytes already buffered past the handshake.
        let socket = socket.map_codec(|_| MessageCodec);
        self.run(socket).await
    }

    // Always runs at session teardown so the manager can release any blocks
    // still assigned to this peer.
    pub fn disconnect(&mut self) {
        self.state = SessionState::default();
        self.ctx.swarm_tx.send(SwarmCommand::Disconnected { address: self.address }).ok();
    }

    async fn exchange_handshake(
        &mut self,
        socket: &mut Framed<TcpStream, HandshakeCodec>,
        inbound: bool,
    ) -> Result<()> {

        self.state.conn_state = ConnState::Handshaking;
        let handshake = Handshake::new(self.ctx.info_hash, self.ctx.client_id);

        if !inbound {
            tracing::trace!("send handshake");
            socket.send(handshake).await?;
        }

        match socket.next().await {
            Some(Ok(remote)) => {
                if remote.protocol != PROTOCOL {
                    return Err(PeerError::IncorrectProtocol);
                }
                if remote.info_hash != self.ctx.info_hash {
                    return Err(PeerError::IncorrectInfoHash);
                }

                // Respond with our handshake if the connection is inbound.
                if inbound {
                    let reply = Handshake::new(self.ctx.info_hash, self.ctx.client_id);
                    socket.send(reply).await?;
                }

                tracing::debug!("handshake successful, peer {}", String::from_utf8_lossy(&remote.peer_id));
                self.ctx.swarm_tx.send(SwarmCommand::Connected {
                    address: self.address,
                    id: remote.peer_id,
                })?;
                Ok(())
            },
            Some(Err(e)) => Err(e),
            None => Err(PeerError::NoHandshake),
        }
    }

    async fn run(&mut self, socket: Framed<TcpStream, MessageCodec>) -> Result<()> {

        self.state.conn_state = ConnState::Introducing;
        let (mut sink, mut stream) = socket.split();

        // Advertise what we already have, skipping an all-zero bitfield.
        let own = self.ctx.store.bitfield();
        if own.any() {
            self.send_message(&mut sink, Message::Bitfield(own)).await?;
        }

        let mut timeouts = 0;
        loop { tokio::select! {

            // Message from the peer, bounded by the progressive deadline.
            read = time::timeout(READ_TIMEOUTS[timeouts], stream.next()) => {
                match read {
                    Err(_) => {
                        timeouts += 1;
                        if timeouts == READ_TIMEOUTS.len() {
                            tracing::debug!("{} consecutive read timeouts", timeouts);
                            return Err(PeerError::Timeout);
                        }
                    },
                    Ok(Some(Ok(msg))) => {
                        timeouts = 0;
                        self.handle_msg(&mut sink, msg).await?;
                    },
                    Ok(Some(Err(e))) => return Err(e),
                    Ok(None) => return Err(PeerError::Closed),
                }
            }

            // Command from the swarm manager.
            Some(cmd) = self.peer_rx.recv() => {
                match cmd {

                    PeerCommand::RequestBlocks(blocks) => self.request_blocks(&mut sink, blocks).await?,

                    PeerCommand::Have(piece) => {
                        self.send_message(&mut sink, Message::Have { idx: piece as u32 }).await?;
                    },

                    PeerCommand::Shutdown => {
                        tracing::debug!("session shutdown");
                        return Ok(());
                    },

                }
            }

        }}
    }

    #[inline]
    async fn send_message(&mut self, sink: &mut MessageSink, msg: Message) -> Result<()> {
        tracing::trace!("send: {}", msg);
        sink.send(msg).await
    }

    async fn handle_msg(&mut self, sink: &mut MessageSink, msg: Message) -> Result<()> {
        tracing::trace!("read: {}", msg);

        // A bitfield is only valid as the first message after the handshake.
        let msg = match msg {
            Message::Bitfield(bitfield) => {
                if self.state.conn_state != ConnState::Introducing {
                    return Err(PeerError::ProtocolViolation("bitfield after first message".to_string()));
                }
                self.state.conn_state = ConnState::Connected;
                return self.handle_bitfield(sink, bitfield).await;
            },
            other => other,
        };
        self.state.conn_state = ConnState::Connected;

        match msg {

            Message::Bitfield(_) => unreachable!("handled above"),

            Message::KeepAlive => {},

            Message::Choke => {
                if !self.state.peer_choking {
                    self.state.peer_choking = true;
                    self.ctx.swarm_tx.send(SwarmCommand::Choked { address: self.address })?;
                }
            },

            Message::Unchoke => {
                if self.state.peer_choking {
                    self.state.peer_choking = false;
                    // The manager assigns this peer blocks on the next tick.
                    self.ctx.swarm_tx.send(SwarmCommand::Unchoked { address: self.address })?;
                }
            },

            Message::Interested => {
                // Unchoke reciprocally, no upload slot limits in this design.
                if !self.state.peer_interested {
                    self.state.peer_interested = true;
                    self.state.am_choking = false;
                    self.send_message(sink, Message::Unchoke).await?;
                }
            },

            Message::NotInterested => self.state.peer_interested = false,

            Message::Have { idx } => self.handle_have(sink, idx).await?,

            Message::Request(request) => self.handle_request(sink, request).await?,

            Message::Block(block) => self.handle_block(block)?,

            Message::Cancel(request) => {
                // Blocks are served immediately, so there is nothing queued to
                // cancel.
                tracing::trace!("cancel for {:?}", request);
            },

            Message::Port { port } => {
                tracing::trace!("peer DHT port {}", port);
            },

            Message::Unknown { id } => {
                tracing::debug!("ignored unknown message id {}", id);
            },

        }

        Ok(())
    }

    async fn handle_bitfield(&mut self, sink: &mut MessageSink, bitfield: Bitfield) -> Result<()> {

        let num_pieces = self.ctx.store.num_pieces();
        // The advertised field must be exactly ceil(N/8) bytes...
        if bitfield.as_raw_slice().len() != (num_pieces + 7) / 8 {
            return Err(PeerError::InvalidBitfield);
        }
        // ...with no spare bits set beyond the last piece.
        if bitfield[num_pieces..].any() {
            return Err(PeerError::InvalidBitfield);
        }
        let mut bitfield = bitfield;
        bitfield.truncate(num_pieces);

        tracing::debug!("peer has {}/{} pieces", bitfield.count_ones(), num_pieces);
        self.ctx.swarm_tx.send(SwarmCommand::Bitfield {
            address: self.address,
            bitfield: bitfield.clone(),
        })?;
        self.bitfield = Some(bitfield);
        self.update_interest(sink).await
    }

    async fn handle_have(&mut self, sink: &mut MessageSink, idx: u32) -> Result<()> {

        let num_pieces = self.ctx.store.num_pieces();
        if idx as usize >= num_pieces {
            return Err(PeerError::ProtocolViolation(format!("have with invalid index {}", idx)));
        }

        let bitfield = self.bitfield.get_or_insert_with(|| Bitfield::repeat(false, num_pieces));
        if bitfield[idx as usize] {
            return Ok(());
        }
        bitfield.set(idx as usize, true);

        self.ctx.swarm_tx.send(SwarmCommand::Have {
            address: self.address,
            piece: idx as usize,
        })?;
        self.update_interest(sink).await
    }

    // Interested iff the peer has a piece we lack. Only flag transitions to
    // true are announced.
    async fn update_interest(&mut self, sink: &mut MessageSink) -> Result<()> {

        let own = self.ctx.store.bitfield();
        let interested = match &self.bitfield {
            Some(remote) => remote.iter_ones().any(|i| !own[i]),
            None => false,
        };

        if interested && !self.state.am_interested {
            self.state.am_interested = true;
            self.send_message(sink, Message::Interested).await?;
        } else if !interested {
            self.state.am_interested = false;
        }
        Ok(())
    }

    // Upload path: read the block from the store and reply with PIECE.
    async fn handle_request(&mut self, sink: &mut MessageSink, request: BlockInfo) -> Result<()> {

        // Requests are only legal once the peer declared interest and we
        // unchoked it.
        if !(self.state.peer_interested && !self.state.am_choking) {
            return Err(PeerError::ProtocolViolation("request whilst choked".to_string()));
        }

        // 16 KiB is standard, 32 KiB tolerated, anything above refused.
        if request.len == 0 || request.len > MAX_REQUEST_LEN {
            tracing::warn!("refusing request with length {}", request.len);
            return Ok(());
        }

        let data = match self.ctx.store.read_block(request.piece_idx, request.offset, request.len) {
            Ok(data) => data,
            Err(e) => {
                tracing::warn!("cannot serve {:?}: {}", request, e);
                return Ok(());
            },
        };

        self.send_message(sink, Message::Block(BlockData {
            piece_idx: request.piece_idx,
            offset: request.offset,
            data,
        })).await
    }

    // Download path: write through the store; the swarm manager tracks the
    // block and the store detects completion.
    fn handle_block(&mut self, block: BlockData) -> Result<()> {

        let info = BlockInfo {
            piece_idx: block.piece_idx,
            offset: block.offset,
            len: block.data.len(),
        };
        // Accounting first so the manager observes the block before any
        // completion event fired by the store.
        self.ctx.swarm_tx.send(SwarmCommand::BlockReceived {
            address: self.address,
            block: info,
        })?;

        match self.ctx.store.write_block(block.piece_idx, block.offset, &block.data) {
            Ok(true) => {
                tracing::debug!("piece {} complete and verified", block.piece_idx);
                Ok(())
            },
            Ok(false) => Ok(()),
            Err(crate::StoreError::HashMismatch(piece)) => {
                tracing::warn!("piece {} failed verification, rescheduling", piece);
                self.ctx.swarm_tx.send(SwarmCommand::PieceFailed { piece })?;
                Ok(())
            },
            Err(crate::StoreError::PieceOutOfRange(_)) | Err(crate::StoreError::BlockOutOfRange) => {
                Err(PeerError::ProtocolViolation(format!("block out of range: {:?}", info)))
            },
            Err(e) => Err(e.into()),
        }
    }

    async fn request_blocks(&mut self, sink: &mut MessageSink, blocks: Vec<BlockInfo>) -> Result<()> {

        // The peer may have choked us between scheduling and send; hand the
        // blocks back instead of letting them dangle in-progress.
        if self.state.peer_choking || !self.state.am_interested {
            tracing::debug!("abandoning {} scheduled blocks (choked)", blocks.len());
            self.ctx.swarm_tx.send(SwarmCommand::BlocksAbandoned {
                address: self.address,
                blocks,
            })?;
            return Ok(());
        }

        for block in blocks {
            self.send_message(sink, Message::Request(block)).await?;
        }
        Ok(())
    }
}
