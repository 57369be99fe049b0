use std::collections::{HashSet, VecDeque};
use std::time::Instant;

use bit_set::BitSet;
use log::trace;
use tokio_util::bytes::BytesMut;
use tokio_util::codec::Decoder;

use crate::config::Config;
use crate::core::{Bitfield, PeerId, RateMeter, TransferRate};
use crate::engine::{CancelToken, ConnId};
use crate::error::ProtocolError;
use crate::message::{Block, Handshake, HandshakeCodec, Message, MessageCodec};

/// Where the connection is in the protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    /// Waiting for the remote handshake
    Handshake,
    /// Handshakes exchanged. A bitfield is only accepted before any other message
    Established { seen_message: bool },
}

/// A decoded unit of inbound traffic.
#[derive(Debug, PartialEq)]
pub enum Inbound {
    Handshake(Handshake),
    Message(Message),
}

/// Client to peer direction: what we send to the remote.
#[derive(Debug)]
pub struct UploadState {
    /// We are choking the remote. Only the choker changes this
    pub choked: bool,
    /// The remote wants data from us
    pub interested: bool,
    /// Requests from the remote not yet served, oldest first
    pub pending: VecDeque<Block>,
    /// A piece message is written and not yet flushed
    pub sending: bool,
    pub rate: RateMeter,
}

/// Peer to client direction: what we fetch from the remote.
#[derive(Debug)]
pub struct DownloadState {
    /// The remote is choking us
    pub choked: bool,
    /// The remote has a piece we lack
    pub interested: bool,
    /// Our requests to the remote that are still outstanding
    pub active: HashSet<Block>,
    pub rate: RateMeter,
}

/// Per-connection protocol state: framing, the remote's pieces and both transfer directions.
#[derive(Debug)]
pub struct PeerSession {
    pub conn: ConnId,
    pub peer_id: Option<PeerId>,
    /// Pieces the remote announced. A bit is credited to the availability table exactly when
    /// it is set here
    pub remote: Bitfield,
    pub upload: UploadState,
    pub download: DownloadState,
    /// Pending liveness timer
    pub liveness: Option<CancelToken>,
    stage: Stage,
    buffer: BytesMut,
    handshake_codec: HandshakeCodec,
    message_codec: MessageCodec,
}

impl PeerSession {
    pub fn new(conn: ConnId, piece_count: usize, config: &Config) -> Self {
        let max_frame = config.max_frame_length().max(1 + piece_count.div_ceil(8));
        Self {
            conn,
            peer_id: None,
            remote: Bitfield::new(piece_count),
            upload: UploadState {
                choked: true,
                interested: false,
                pending: VecDeque::new(),
                sending: false,
                rate: RateMeter::new(config.rate_window),
            },
            download: DownloadState {
                choked: true,
                interested: false,
                active: HashSet::new(),
                rate: RateMeter::new(config.rate_window),
            },
            liveness: None,
            stage: Stage::Handshake,
            buffer: BytesMut::new(),
            handshake_codec: HandshakeCodec,
            message_codec: MessageCodec::new(max_frame),
        }
    }

    pub fn is_established(&self) -> bool {
        matches!(self.stage, Stage::Established { .. })
    }

    /// Appends received bytes to the inbound buffer.
    pub fn feed(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Decodes the next complete handshake or message from the inbound buffer, if any.
    pub fn next_inbound(&mut self) -> Result<Option<Inbound>, ProtocolError> {
        match self.stage {
            Stage::Handshake => {
                let Some(handshake) = self.handshake_codec.decode(&mut self.buffer)? else {
                    return Ok(None);
                };
                self.peer_id = Some(handshake.peer_id.clone());
                self.stage = Stage::Established {
                    seen_message: false,
                };
                Ok(Some(Inbound::Handshake(handshake)))
            }
            Stage::Established { .. } => {
                let message = self.message_codec.decode(&mut self.buffer)?;
                Ok(message.map(Inbound::Message))
            }
        }
    }

    /// Marks that a message other than bitfield or keep-alive arrived.
    pub fn message_seen(&mut self) {
        if let Stage::Established { seen_message } = &mut self.stage {
            *seen_message = true;
        }
    }

    /// Installs the remote bitfield. Only allowed as the first message after the handshake.
    pub fn accept_bitfield(&mut self, bits: BitSet) -> Result<(), ProtocolError> {
        if self.stage != (Stage::Established { seen_message: false }) {
            return Err(ProtocolError::UnexpectedBitfield);
        }
        let bitfield = Bitfield::from_wire(bits, self.remote.len())?;
        // Have messages never precede a bitfield, so the remote bitfield is still empty
        self.remote = bitfield;
        self.stage = Stage::Established { seen_message: true };
        Ok(())
    }

    /// Records that the remote has `piece`. Returns `true` the first time only.
    pub fn peer_has(&mut self, piece: usize) -> Result<bool, ProtocolError> {
        if piece >= self.remote.len() {
            return Err(ProtocolError::PieceOutOfRange {
                piece,
                pieces: self.remote.len(),
            });
        }
        Ok(self.remote.set(piece))
    }

    /// Recomputes download interest against the local bitfield. Returns the new value if it
    /// changed.
    pub fn update_interest(&mut self, local: &Bitfield) -> Option<bool> {
        let interested = self.remote.has_any_missing_from(local);
        if interested == self.download.interested {
            return None;
        }
        self.download.interested = interested;
        Some(interested)
    }

    /// The remote choked us. Every outstanding request is implicitly dropped and returned.
    pub fn peer_choked(&mut self) -> Vec<Block> {
        self.download.choked = true;
        self.download.active.drain().collect()
    }

    pub fn peer_unchoked(&mut self) {
        self.download.choked = false;
    }

    /// Whether requests may be sent to the remote.
    pub fn can_request(&self) -> bool {
        !self.download.choked && self.download.interested
    }

    pub fn block_requested(&mut self, block: Block) {
        self.download.active.insert(block);
    }

    /// A block arrived from the remote. Returns `false` if it was not requested.
    pub fn block_arrived(&mut self, block: Block, now: Instant) -> bool {
        self.download.rate.record(block.length, now);
        self.download.active.remove(&block)
    }

    /// Withdraws an outstanding request (endgame duplicate). Returns `false` if it was not
    /// outstanding.
    pub fn cancel_request(&mut self, block: Block) -> bool {
        self.download.active.remove(&block)
    }

    pub fn peer_interested(&mut self) {
        self.upload.interested = true;
    }

    pub fn peer_not_interested(&mut self) {
        self.upload.interested = false;
        self.upload.pending.clear();
    }

    /// Returns `true` if the remote was unchoked before.
    pub fn choke(&mut self) -> bool {
        let changed = !self.upload.choked;
        self.upload.choked = true;
        self.upload.pending.clear();
        changed
    }

    /// Returns `true` if the remote was choked before.
    pub fn unchoke(&mut self) -> bool {
        let changed = self.upload.choked;
        self.upload.choked = false;
        changed
    }

    /// Queues a request from the remote. Requests while choked are dropped.
    pub fn enqueue_request(&mut self, block: Block) -> bool {
        if self.upload.choked || self.upload.pending.contains(&block) {
            trace!("{} dropping request {:?}", self.conn, block);
            return false;
        }
        self.upload.pending.push_back(block);
        true
    }

    pub fn cancel_upload(&mut self, block: Block) {
        self.upload.pending.retain(|pending| *pending != block);
    }

    /// Next request to serve, unless a block is already being sent.
    pub fn next_upload(&mut self) -> Option<Block> {
        if self.upload.sending {
            return None;
        }
        let block = self.upload.pending.pop_front()?;
        self.upload.sending = true;
        Some(block)
    }

    pub fn block_sent(&mut self, block: Block, now: Instant) {
        self.upload.rate.record(block.length, now);
    }

    pub fn flushed(&mut self) {
        self.upload.sending = false;
    }

    pub fn download_rate(&mut self, now: Instant) -> TransferRate {
        self.download.rate.rate(now)
    }

    pub fn upload_rate(&mut self, now: Instant) -> TransferRate {
        self.upload.rate.rate(now)
    }
}

#[cfg(test)]
mod tests {
    use tokio_util::bytes::BufMut;
    use tokio_util::codec::Encoder;

    use super::*;
    use crate::core::Sha1;

    fn session(pieces: usize) -> PeerSession {
        PeerSession::new(ConnId(1), pieces, &Config::default())
    }

    fn established(pieces: usize) -> PeerSession {
        let mut session = session(pieces);
        let mut buf = BytesMut::new();
        HandshakeCodec
            .encode(&Handshake::new(Sha1([1; 20]), PeerId([2; 20])), &mut buf)
            .unwrap();
        session.feed(&buf);
        assert!(matches!(
            session.next_inbound().unwrap(),
            Some(Inbound::Handshake(_))
        ));
        session
    }

    fn bitset(bytes: &[u8]) -> BitSet {
        BitSet::from_bytes(bytes)
    }

    #[test]
    fn handshake_then_messages() {
        let mut session = session(8);
        let mut buf = BytesMut::new();
        HandshakeCodec
            .encode(&Handshake::new(Sha1([1; 20]), PeerId([2; 20])), &mut buf)
            .unwrap();
        MessageCodec::new(16)
            .encode(Message::Interested, &mut buf)
            .unwrap();

        // Split in the middle of the handshake
        session.feed(&buf[..30]);
        assert_eq!(session.next_inbound().unwrap(), None);
        assert!(!session.is_established());

        session.feed(&buf[30..]);
        assert!(matches!(
            session.next_inbound().unwrap(),
            Some(Inbound::Handshake(_))
        ));
        assert_eq!(session.peer_id, Some(PeerId([2; 20])));
        assert_eq!(
            session.next_inbound().unwrap(),
            Some(Inbound::Message(Message::Interested))
        );
        assert_eq!(session.next_inbound().unwrap(), None);
    }

    #[test]
    fn bitfield_only_first() {
        let mut session = established(8);
        session.accept_bitfield(bitset(&[0b1000_0001])).unwrap();

        assert_eq!(session.remote.iter().collect::<Vec<_>>(), vec![0, 7]);
        assert!(matches!(
            session.accept_bitfield(bitset(&[0xff])),
            Err(ProtocolError::UnexpectedBitfield)
        ));
    }

    #[test]
    fn bitfield_after_other_message_is_rejected() {
        let mut session = established(8);
        session.message_seen();

        assert!(matches!(
            session.accept_bitfield(bitset(&[0xff])),
            Err(ProtocolError::UnexpectedBitfield)
        ));
    }

    #[test]
    fn have_is_credited_once() {
        let mut session = established(4);

        assert!(session.peer_has(2).unwrap());
        assert!(!session.peer_has(2).unwrap());
        assert!(matches!(
            session.peer_has(4),
            Err(ProtocolError::PieceOutOfRange {
                piece: 4,
                pieces: 4
            })
        ));
    }

    #[test]
    fn interest_follows_missing_pieces() {
        let mut session = established(4);
        let mut local = Bitfield::new(4);

        assert_eq!(session.update_interest(&local), None);
        session.peer_has(1).unwrap();
        assert_eq!(session.update_interest(&local), Some(true));
        assert_eq!(session.update_interest(&local), None);
        local.set(1);
        assert_eq!(session.update_interest(&local), Some(false));
    }

    #[test]
    fn choke_drops_outstanding_requests() {
        let mut session = established(4);
        session.peer_unchoked();
        session.block_requested(Block::new(0, 0, 16));
        session.block_requested(Block::new(0, 16, 16));

        let mut dropped = session.peer_choked();
        dropped.sort();

        assert_eq!(dropped, vec![Block::new(0, 0, 16), Block::new(0, 16, 16)]);
        assert!(session.download.active.is_empty());
        assert!(!session.can_request());
    }

    #[test]
    fn requests_while_choked_are_dropped() {
        let mut session = established(4);

        assert!(!session.enqueue_request(Block::new(0, 0, 16)));
        session.unchoke();
        assert!(session.enqueue_request(Block::new(0, 0, 16)));
        assert!(!session.enqueue_request(Block::new(0, 0, 16)));
        assert_eq!(session.upload.pending.len(), 1);
    }

    #[test]
    fn choking_clears_pending_requests() {
        let mut session = established(4);
        session.unchoke();
        session.enqueue_request(Block::new(0, 0, 16));

        assert!(session.choke());
        assert!(session.upload.pending.is_empty());
        assert!(!session.choke());
    }

    #[test]
    fn not_interested_clears_pending_requests() {
        let mut session = established(4);
        session.peer_interested();
        session.unchoke();
        session.enqueue_request(Block::new(0, 0, 16));

        session.peer_not_interested();

        assert!(!session.upload.interested);
        assert!(session.upload.pending.is_empty());
    }

    #[test]
    fn cancel_removes_unsent_request() {
        let mut session = established(4);
        session.unchoke();
        session.enqueue_request(Block::new(0, 0, 16));
        session.enqueue_request(Block::new(1, 0, 16));

        session.cancel_upload(Block::new(0, 0, 16));

        assert_eq!(session.next_upload(), Some(Block::new(1, 0, 16)));
    }

    #[test]
    fn one_upload_in_flight_at_a_time() {
        let mut session = established(4);
        session.unchoke();
        session.enqueue_request(Block::new(0, 0, 16));
        session.enqueue_request(Block::new(0, 16, 16));

        assert_eq!(session.next_upload(), Some(Block::new(0, 0, 16)));
        assert_eq!(session.next_upload(), None);
        session.flushed();
        assert_eq!(session.next_upload(), Some(Block::new(0, 16, 16)));
    }

    #[test]
    fn frames_above_limit_are_rejected() {
        let mut session = established(4);
        let mut buf = BytesMut::new();
        buf.put_u32(u32::MAX);
        buf.put_u8(7);
        session.feed(&buf);

        assert!(matches!(
            session.next_inbound(),
            Err(ProtocolError::FrameTooLong { .. })
        ));
    }
}
