use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use crate::{block, Bitfield};
use super::PeerError;

// One peer-wire message. Every frame is <u32 length BE><u8 id><payload>;
// a zero-length frame is a keep-alive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {

    KeepAlive,

    // No further requests will be satisfied.
    Choke,

    // Requests from the peer will be served again.
    Unchoke,

    // The client wants to request blocks from the peer.
    Interested,

    NotInterested,

    // The client has the piece with this index.
    Have { idx: u32 },

    // Short form advertisement of held pieces, only valid directly after the
    // handshake.
    Bitfield(Bitfield),

    // Request for a block: piece index, begin offset, length.
    Request(block::BlockInfo),

    // A block of data, referencing piece index and begin offset.
    Block(block::BlockData),

    // Withdraw a previous request.
    Cancel(block::BlockInfo),

    // DHT listen port; parsed but unused here.
    Port { port: u16 },

    // Unrecognised id, payload already consumed. Logged and ignored.
    Unknown { id: u8 },

}

pub struct MessageCodec;

impl Encoder<Message> for MessageCodec {

    type Error = PeerError;

    fn encode(&mut self, msg: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match msg {

            // keep-alive: <len=0000>
            Message::KeepAlive => dst.put_u32(0),

            // choke: <len=0001><id=0>
            Message::Choke => {
                dst.put_u32(1);
                dst.put_u8(0);
            },

            // unchoke: <len=0001><id=1>
            Message::Unchoke => {
                dst.put_u32(1);
                dst.put_u8(1);
            },

            // interested: <len=0001><id=2>
            Message::Interested => {
                dst.put_u32(1);
                dst.put_u8(2);
            },

            // not interested: <len=0001><id=3>
            Message::NotInterested => {
                dst.put_u32(1);
                dst.put_u8(3);
            },

            // have: <len=0005><id=4><piece index>
            Message::Have { idx } => {
                dst.put_u32(5);
                dst.put_u8(4);
                dst.put_u32(idx);
            },

            // bitfield: <len=0001+X><id=5><bitfield>
            Message::Bitfield(bitfield) => {
                let raw = bitfield.as_raw_slice();
                dst.put_u32(1 + raw.len() as u32);
                dst.put_u8(5);
                dst.extend_from_slice(raw);
            },

            // request: <len=0013><id=6><index><begin><length>
            Message::Request(block) => {
                dst.put_u32(13);
                dst.put_u8(6);
                dst.put_u32(block.piece_idx as u32);
                dst.put_u32(block.offset as u32);
                dst.put_u32(block.len as u32);
            },

            // piece: <len=0009+X><id=7><index><begin><block>
            Message::Block(block) => {
                dst.put_u32(9 + block.data.len() as u32);
                dst.put_u8(7);
                dst.put_u32(block.piece_idx as u32);
                dst.put_u32(block.offset as u32);
                dst.extend_from_slice(&block.data);
            },

            // cancel: <len=0013><id=8><index><begin><length>
            Message::Cancel(block) => {
                dst.put_u32(13);
                dst.put_u8(8);
                dst.put_u32(block.piece_idx as u32);
                dst.put_u32(block.offset as u32);
                dst.put_u32(block.len as u32);
            },

            // port: <len=0003><id=9><listen-port>
            Message::Port { port } => {
                dst.put_u32(3);
                dst.put_u8(9);
                dst.put_u16(port);
            },

            Message::Unknown { .. } => {},
        }

        Ok(())
    }
}

impl Decoder for MessageCodec {

    type Item = Message;
    type Error = PeerError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {

        // Can't read message length.
        if src.remaining() < 4 {
            return Ok(None);
        }

        let msg_len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if src.remaining() < 4 + msg_len {
            // Haven't received the whole message yet.
            return Ok(None);
        }
        src.advance(4);
        if msg_len == 0 {
            return Ok(Some(Message::KeepAlive));
        }

        let id = src.get_u8();
        let payload_len = msg_len - 1;

        let msg = match (id, payload_len) {
            (0, 0) => Message::Choke,
            (1, 0) => Message::Unchoke,
            (2, 0) => Message::Interested,
            (3, 0) => Message::NotInterested,
            (4, 4) => Message::Have { idx: src.get_u32() },
            (5, _) => {
                let mut raw = vec![0; payload_len];
                src.copy_to_slice(&mut raw);
                Message::Bitfield(Bitfield::from_vec(raw))
            },
            (6, 12) => {
                let piece_idx = src.get_u32() as usize;
                let offset = src.get_u32() as usize;
                let len = src.get_u32() as usize;
                Message::Request(block::BlockInfo { piece_idx, offset, len })
            },
            (7, n) if n >= 8 => {
                let piece_idx = src.get_u32() as usize;
                let offset = src.get_u32() as usize;
                let mut data = vec![0; payload_len - 8];
                src.copy_to_slice(&mut data);
                Message::Block(block::BlockData { piece_idx, offset, data })
            },
            (8, 12) => {
                let piece_idx = src.get_u32() as usize;
                let offset = src.get_u32() as usize;
                let len = src.get_u32() as usize;
                Message::Cancel(block::BlockInfo { piece_idx, offset, len })
            },
            (9, 2) => Message::Port { port: src.get_u16() },
            (id, _) => {
                // Unknown or malformed: swallow the payload and carry on.
                tracing::warn!("ignoring message id {} with {} payload bytes", id, payload_len);
                src.advance(payload_len);
                Message::Unknown { id }
            },
        };

        Ok(Some(msg))
    }
}

impl std::fmt::Display for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Message::KeepAlive => write!(f, "keep alive"),
            Message::Choke => write!(f, "choke"),
            Message::Unchoke => write!(f, "unchoke"),
            Message::Interested => write!(f, "interested"),
            Message::NotInterested => write!(f, "not interested"),
            Message::Have { idx } => write!(f, "have piece {}", idx),
            Message::Bitfield(bf) => write!(f, "bitfield with {} pieces", bf.count_ones()),
            Message::Request(block) => write!(f, "request {{ piece: {}, offset: {}, length: {} }}",
                block.piece_idx,
                block.offset,
                block.len,
            ),
            Message::Block(block) => write!(f, "block {{ piece: {}, offset: {}, length: {} }}",
                block.piece_idx,
                block.offset,
                block.data.len(),
            ),
            Message::Cancel(block) => write!(f, "cancel {{ piece: {}, offset: {}, length: {} }}",
                block.piece_idx,
                block.offset,
                block.len,
            ),
            Message::Port { port } => write!(f, "port {}", port),
            Message::Unknown { id } => write!(f, "unknown id {}", id),
        }
    }
}
