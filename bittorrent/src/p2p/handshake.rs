use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use super::PeerError;

pub const PROTOCOL: [u8; 19] = *b"BitTorrent protocol";

// Exactly 68 bytes on the wire.
const HANDSHAKE_LEN: usize = 68;

pub struct Handshake {
    pub protocol:  [u8; 19],
    pub reserved:  [u8; 8],
    pub info_hash: [u8; 20],
    pub peer_id:   [u8; 20],
}

impl Handshake {
    pub fn new(info_hash: [u8; 20], peer_id: [u8; 20]) -> Self {
        Self {
            protocol: PROTOCOL,
            reserved: [0; 8],
            info_hash,
            peer_id,
        }
    }
}

pub struct HandshakeCodec;

impl Encoder<Handshake> for HandshakeCodec {

    type Error = PeerError;

    fn encode(&mut self, item: Handshake, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.put_u8(19);
        dst.extend_from_slice(&item.protocol);
        dst.extend_from_slice(&item.reserved);
        dst.extend_from_slice(&item.info_hash);
        dst.extend_from_slice(&item.peer_id);
        debug_assert_eq!(dst.len(), HANDSHAKE_LEN, "encoded handshake length is not 68 bytes");
        Ok(())
    }
}

impl Decoder for HandshakeCodec {

    type Item = Handshake;
    type Error = PeerError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {

        if src.is_empty() {
            return Ok(None);
        }
        // The length prefix is checkable before the rest arrives.
        if src[0] as usize != PROTOCOL.len() {
            return Err(PeerError::IncorrectProtocol);
        }
        if src.remaining() < HANDSHAKE_LEN {
            return Ok(None);
        }
        src.advance(1);

        let mut protocol = [0; 19];
        src.copy_to_slice(&mut protocol);

        let mut reserved = [0; 8];
        src.copy_to_slice(&mut reserved);

        let mut info_hash = [0; 20];
        src.copy_to_slice(&mut info_hash);

        let mut peer_id = [0; 20];
        src.copy_to_slice(&mut peer_id);

        Ok(Some(Handshake {
            protocol,
            reserved,
            info_hash,
            peer_id,
        }))
    }
}

impl std::fmt::Debug for Handshake {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handshake")
            .field("protocol", &String::from_utf8_lossy(&self.protocol))
            .field("reserved", &self.reserved)
            .field("info_hash", &hex::encode(self.info_hash))
            .field("peer_id", &String::from_utf8_lossy(&self.peer_id))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handshake_round_trip() {
        let mut buf = BytesMut::new();
        HandshakeCodec.encode(Handshake::new([0xaa; 20], *b"-JC0001-0123456789ab"), &mut buf).unwrap();
        assert_eq!(buf.len(), 68);

        let decoded = HandshakeCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.protocol, PROTOCOL);
        assert_eq!(decoded.reserved, [0; 8]);
        assert_eq!(decoded.info_hash, [0xaa; 20]);
        assert_eq!(&decoded.peer_id, b"-JC0001-0123456789ab");
    }

    // A truncated handshake must leave the buffer untouched until the rest
    // arrives; the decoder only commits once all 68 bytes are in.
    #[test]
    fn test_handshake_decode_waits_for_full_frame() {
        let mut full = BytesMut::new();
        HandshakeCodec.encode(Handshake::new([0x42; 20], *b"-JC0001-feedc0ffee00"), &mut full).unwrap();

        let mut src = BytesMut::new();
        src.extend_from_slice(&full[..HANDSHAKE_LEN - 1]);
        assert!(HandshakeCodec.decode(&mut src).unwrap().is_none());
        assert_eq!(src.len(), HANDSHAKE_LEN - 1);

        src.extend_from_slice(&full[HANDSHAKE_LEN - 1..]);
        let decoded = HandshakeCodec.decode(&mut src).unwrap().unwrap();
        assert_eq!(decoded.info_hash, [0x42; 20]);
        assert!(src.is_empty());
    }

    // A wrong length prefix is rejected from the very first byte, before the
    // remainder of the frame shows up.
    #[test]
    fn test_handshake_rejects_wrong_protocol_len() {
        let mut src = BytesMut::new();
        src.put_u8(18);
        assert!(matches!(
            HandshakeCodec.decode(&mut src),
            Err(PeerError::IncorrectProtocol)
        ));
    }

    // Bytes past the handshake (typically the peer's bitfield) stay in the
    // buffer for the next codec.
    #[test]
    fn test_handshake_leaves_trailing_bytes() {
        let mut src = BytesMut::new();
        HandshakeCodec.encode(Handshake::new([0x42; 20], *b"-JC0001-feedc0ffee00"), &mut src).unwrap();
        src.extend_from_slice(&[0, 0, 0, 2, 5, 0x80]); // one-byte bitfield frame

        let decoded = HandshakeCodec.decode(&mut src).unwrap().unwrap();
        assert_eq!(&decoded.peer_id, b"-JC0001-feedc0ffee00");
        assert_eq!(&src[..], &[0, 0, 0, 2, 5, 0x80]);
    }
}
