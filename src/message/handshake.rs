use tokio_util::bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::core::{PeerId, Sha1};
use crate::error::ProtocolError;

pub const PROTOCOL: &[u8; 19] = b"BitTorrent protocol";
pub const HANDSHAKE_LENGTH: usize = 1 + PROTOCOL.len() + 8 + 20 + 20;

/// The handshake is a required message and must be the first message transmitted by the client. It
/// is (49+len(pstr)) bytes long.
///
/// _handshake: <pstrlen><pstr><reserved><info\_hash><peer\_id>_
///
/// * **pstrlen**: string length of <pstr>, as a single raw byte
/// * **pstr**: string identifier of the protocol
/// * **reserved**: eight (8) reserved bytes. All current implementations use all zeroes.
/// * **info\_hash**: 20-byte SHA1 hash of the info key in the metainfo file.
/// * **peer\_id**: 20-byte string used as a unique ID for the client.
///
/// In version 1.0 of the BitTorrent protocol, pstrlen = 19, and pstr = "BitTorrent protocol".
/// Both sides send their handshake as soon as the connection is up.
#[derive(Debug, PartialEq, Clone)]
pub struct Handshake {
    pub reserved: [u8; 8],
    pub info_hash: Sha1,
    pub peer_id: PeerId,
}

impl Handshake {
    pub fn new(info_hash: Sha1, peer_id: PeerId) -> Self {
        Self {
            reserved: [0; 8],
            info_hash,
            peer_id,
        }
    }
}

/// Decodes exactly one handshake; only "BitTorrent protocol" is accepted.
#[derive(Debug, Default)]
pub struct HandshakeCodec;

impl Decoder for HandshakeCodec {
    type Item = Handshake;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Handshake>, ProtocolError> {
        let Some(&pstrlen) = src.first() else {
            return Ok(None);
        };
        if pstrlen as usize != PROTOCOL.len() {
            let prefix = src[1..].iter().take(PROTOCOL.len()).copied().collect();
            return Err(ProtocolError::HandshakeProtocol(prefix));
        }
        if src.len() < HANDSHAKE_LENGTH {
            src.reserve(HANDSHAKE_LENGTH - src.len());
            return Ok(None);
        }
        if &src[1..=PROTOCOL.len()] != PROTOCOL {
            return Err(ProtocolError::HandshakeProtocol(
                src[1..=PROTOCOL.len()].to_vec(),
            ));
        }

        src.advance(1 + PROTOCOL.len());
        let mut reserved = [0; 8];
        src.copy_to_slice(&mut reserved);
        let mut info_hash = [0; 20];
        src.copy_to_slice(&mut info_hash);
        let mut peer_id = [0; 20];
        src.copy_to_slice(&mut peer_id);
        Ok(Some(Handshake {
            reserved,
            info_hash: Sha1(info_hash),
            peer_id: PeerId(peer_id),
        }))
    }
}

impl Encoder<&Handshake> for HandshakeCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: &Handshake, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        encode_handshake(item, dst);
        Ok(())
    }
}

pub fn encode_handshake(item: &Handshake, dst: &mut BytesMut) {
    dst.reserve(HANDSHAKE_LENGTH);
    dst.put_u8(PROTOCOL.len() as u8);
    dst.extend_from_slice(PROTOCOL);
    dst.extend_from_slice(&item.reserved);
    dst.extend_from_slice(&item.info_hash.0);
    dst.extend_from_slice(&item.peer_id.0);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encoded(handshake: &Handshake) -> BytesMut {
        let mut buf = BytesMut::new();
        HandshakeCodec.encode(handshake, &mut buf).unwrap();
        buf
    }

    #[test]
    fn handshake_layout() {
        let handshake = Handshake::new(Sha1([1; 20]), PeerId([2; 20]));
        let buf = encoded(&handshake);

        assert_eq!(buf.len(), 68);
        assert_eq!(buf[0], 19);
        assert_eq!(&buf[1..20], b"BitTorrent protocol");
        assert_eq!(&buf[20..28], &[0; 8]);
        assert_eq!(&buf[28..48], &[1; 20]);
        assert_eq!(&buf[48..68], &[2; 20]);
    }

    #[test]
    fn decode_waits_for_full_handshake() {
        let handshake = Handshake::new(Sha1([1; 20]), PeerId([2; 20]));
        let full = encoded(&handshake);

        let mut buf = BytesMut::from(&full[..40]);
        assert!(HandshakeCodec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&full[40..]);
        buf.extend_from_slice(&[0, 0, 0, 0]);
        assert_eq!(HandshakeCodec.decode(&mut buf).unwrap(), Some(handshake));

        // Bytes after the handshake stay buffered for the message codec
        assert_eq!(&buf[..], &[0, 0, 0, 0]);
    }

    #[test]
    fn reject_foreign_protocol() {
        let mut buf = BytesMut::new();
        buf.put_u8(19);
        buf.extend_from_slice(b"BitTorrent Protocol");
        buf.extend_from_slice(&[0; 48]);

        assert!(matches!(
            HandshakeCodec.decode(&mut buf),
            Err(ProtocolError::HandshakeProtocol(_))
        ));
    }

    #[test]
    fn reject_wrong_protocol_length() {
        let mut buf = BytesMut::from(&b"\x04HTTP"[..]);

        assert!(matches!(
            HandshakeCodec.decode(&mut buf),
            Err(ProtocolError::HandshakeProtocol(_))
        ));
    }
}
