mod reactor;
mod stats;
#[cfg(test)]
pub(crate) mod testing;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Instant;

use log::{debug, error, info, trace, warn};
use tokio_util::bytes::BytesMut;

use crate::config::Config;
use crate::core::Bitfield;
use crate::error::{EngineError, ProtocolError, SessionError, StorageError};
use crate::message::{
    Block, BlockData, HANDSHAKE_LENGTH, Handshake, Message, encode_handshake, encode_message,
};
use crate::peer::{Choker, Inbound, PeerSession};
use crate::scheduler::Picker;
use crate::storage::{PieceAssembler, Status, StorageMap};
use crate::torrent::{Descriptor, Piece, PieceState};

pub use reactor::{CancelToken, ConnId, Reactor, TimerKey};
pub use stats::Stats;

/// The piece exchange engine for one torrent.
///
/// The engine owns every piece of protocol state: peer sessions, piece availability, choking
/// and storage. It performs no I/O itself. A [`Reactor`] reports connections, received bytes,
/// flushed writes and fired timers through the `on_*` callbacks, and the engine reacts by
/// asking the reactor to write, close or schedule.
///
/// Protocol violations close the offending connection only. A storage failure halts the
/// engine: the failing call returns the error and every later call returns
/// [`EngineError::Halted`].
pub struct Engine {
    config: Config,
    descriptor: Arc<Descriptor>,
    pieces: Vec<Piece>,
    /// Pieces verified and stored locally
    local: Bitfield,
    picker: Picker,
    choker: Choker,
    storage: StorageMap,
    assembler: PieceAssembler,
    sessions: BTreeMap<ConnId, PeerSession>,
    uploaded: u64,
    downloaded: u64,
    halted: bool,
}

impl Engine {
    /// Creates an engine that already has the pieces in `local`, stored in `storage`.
    pub fn new(
        config: Config,
        descriptor: Arc<Descriptor>,
        storage: StorageMap,
        local: Bitfield,
    ) -> Result<Self, EngineError> {
        if local.len() != descriptor.piece_count() {
            return Err(EngineError::PieceCount {
                expected: descriptor.piece_count(),
                actual: local.len(),
            });
        }
        let mut pieces = descriptor.build_pieces();
        for piece in local.iter() {
            pieces[piece].state = PieceState::Have;
        }
        let picker = Picker::new(Arc::clone(&descriptor), &local, &config);
        let choker = Choker::new(&config);
        Ok(Self {
            config,
            descriptor,
            pieces,
            local,
            picker,
            choker,
            storage,
            assembler: PieceAssembler::new(),
            sessions: BTreeMap::new(),
            uploaded: 0,
            downloaded: 0,
            halted: false,
        })
    }

    /// Arms the periodic timers.
    pub fn start(&mut self, reactor: &mut impl Reactor) -> Result<(), EngineError> {
        self.check_running()?;
        info!(
            "starting with {}/{} pieces",
            self.local.count(),
            self.local.len()
        );
        reactor.schedule(self.config.choking_interval, TimerKey::Rechoke);
        reactor.schedule(
            self.config.optimistic_unchoke_interval,
            TimerKey::OptimisticUnchoke,
        );
        reactor.schedule(self.config.keep_alive_interval, TimerKey::KeepAlive);
        Ok(())
    }

    /// A connection was established, in either direction. Our handshake goes out right away.
    pub fn on_connect(
        &mut self,
        reactor: &mut impl Reactor,
        conn: ConnId,
    ) -> Result<(), EngineError> {
        self.check_running()?;
        debug!("{} connected", conn);
        if self.remove_session(reactor, conn) {
            warn!("{} was already connected, dropping the old session", conn);
            self.request_all(reactor);
        }
        let session = PeerSession::new(conn, self.descriptor.piece_count(), &self.config);
        self.sessions.insert(conn, session);

        let handshake = Handshake::new(
            self.descriptor.info_hash.clone(),
            self.config.client_id.clone(),
        );
        let mut buf = BytesMut::with_capacity(HANDSHAKE_LENGTH);
        encode_handshake(&handshake, &mut buf);
        reactor.write(conn, buf.freeze());
        self.arm_liveness(reactor, conn);
        Ok(())
    }

    /// Bytes arrived on `conn`. Every complete frame in the buffer is handled.
    pub fn on_data(
        &mut self,
        reactor: &mut impl Reactor,
        conn: ConnId,
        data: &[u8],
    ) -> Result<(), EngineError> {
        self.check_running()?;
        let Some(session) = self.sessions.get_mut(&conn) else {
            warn!("{} data for unknown connection", conn);
            return Ok(());
        };
        session.feed(data);

        // Handling a message may disconnect this very connection
        while let Some(session) = self.sessions.get_mut(&conn) {
            let inbound = match session.next_inbound() {
                Ok(Some(inbound)) => inbound,
                Ok(None) => break,
                Err(err) => return self.fail(reactor, conn, err.into()),
            };
            self.arm_liveness(reactor, conn);
            if let Err(err) = self.handle_inbound(reactor, conn, inbound) {
                return self.fail(reactor, conn, err);
            }
        }
        Ok(())
    }

    /// Everything written to `conn` so far has been handed to the OS.
    pub fn on_flushed(
        &mut self,
        reactor: &mut impl Reactor,
        conn: ConnId,
    ) -> Result<(), EngineError> {
        self.check_running()?;
        if let Some(session) = self.sessions.get_mut(&conn) {
            session.flushed();
        }
        if let Err(err) = self.serve_upload(reactor, conn) {
            return self.fail(reactor, conn, err.into());
        }
        Ok(())
    }

    /// The connection went away on its own (EOF, reset, connect failure).
    pub fn on_closed(
        &mut self,
        reactor: &mut impl Reactor,
        conn: ConnId,
    ) -> Result<(), EngineError> {
        self.check_running()?;
        if self.remove_session(reactor, conn) {
            info!("{} closed", conn);
            self.request_all(reactor);
        }
        Ok(())
    }

    pub fn on_timer(
        &mut self,
        reactor: &mut impl Reactor,
        key: TimerKey,
    ) -> Result<(), EngineError> {
        self.check_running()?;
        match key {
            TimerKey::Rechoke => {
                self.rechoke(reactor, false);
                reactor.schedule(self.config.choking_interval, key);
            }
            TimerKey::OptimisticUnchoke => {
                self.rechoke(reactor, true);
                reactor.schedule(self.config.optimistic_unchoke_interval, key);
            }
            TimerKey::KeepAlive => {
                for conn in self.established() {
                    send(reactor, conn, Message::KeepAlive);
                }
                reactor.schedule(self.config.keep_alive_interval, key);
            }
            TimerKey::Liveness(conn) => {
                if let Some(session) = self.sessions.get_mut(&conn) {
                    session.liveness = None;
                    warn!("{} has been idle for too long", conn);
                    self.disconnect(reactor, conn);
                }
            }
        }
        Ok(())
    }

    pub fn stats(&mut self, now: Instant) -> Stats {
        let mut upload = Vec::with_capacity(self.sessions.len());
        let mut download = Vec::with_capacity(self.sessions.len());
        for session in self.sessions.values_mut() {
            upload.push(session.upload_rate(now));
            download.push(session.download_rate(now));
        }
        Stats {
            total_pieces: self.local.len(),
            completed_pieces: self.local.count(),
            connected_peers: self.established().len(),
            uploaded: self.uploaded,
            downloaded: self.downloaded,
            upload_rate: stats::combined_rate(upload),
            download_rate: stats::combined_rate(download),
        }
    }

    pub fn local(&self) -> &Bitfield {
        &self.local
    }

    pub fn is_complete(&self) -> bool {
        self.local.is_complete()
    }

    pub fn is_halted(&self) -> bool {
        self.halted
    }

    pub fn piece_state(&self, piece: usize) -> Option<PieceState> {
        self.pieces.get(piece).map(|piece| piece.state)
    }

    /// Number of connected peers that announced `piece`.
    pub fn availability(&self, piece: usize) -> usize {
        self.picker.availability(piece)
    }

    pub fn session(&self, conn: ConnId) -> Option<&PeerSession> {
        self.sessions.get(&conn)
    }

    pub fn read_piece(&mut self, piece: usize) -> Result<Vec<u8>, EngineError> {
        Ok(self.storage.read_piece(piece)?)
    }

    fn check_running(&self) -> Result<(), EngineError> {
        if self.halted {
            return Err(EngineError::Halted);
        }
        Ok(())
    }

    fn fail(
        &mut self,
        reactor: &mut impl Reactor,
        conn: ConnId,
        err: SessionError,
    ) -> Result<(), EngineError> {
        match err {
            SessionError::Protocol(err) => {
                warn!("{} protocol violation: {}", conn, err);
                self.disconnect(reactor, conn);
                Ok(())
            }
            SessionError::Storage(err) => {
                error!("storage failure, halting: {}", err);
                self.halted = true;
                Err(err.into())
            }
        }
    }

    fn established(&self) -> Vec<ConnId> {
        self.sessions
            .iter()
            .filter(|(_, session)| session.is_established())
            .map(|(conn, _)| *conn)
            .collect()
    }

    fn arm_liveness(&mut self, reactor: &mut impl Reactor, conn: ConnId) {
        let Some(session) = self.sessions.get_mut(&conn) else {
            return;
        };
        if let Some(token) = session.liveness.take() {
            reactor.cancel(token);
        }
        let token = reactor.schedule(self.config.idle_peer_timeout, TimerKey::Liveness(conn));
        session.liveness = Some(token);
    }

    fn handle_inbound(
        &mut self,
        reactor: &mut impl Reactor,
        conn: ConnId,
        inbound: Inbound,
    ) -> Result<(), SessionError> {
        match inbound {
            Inbound::Handshake(handshake) => {
                Ok(self.handshake_received(reactor, conn, handshake)?)
            }
            Inbound::Message(message) => self.handle_message(reactor, conn, message),
        }
    }

    fn handshake_received(
        &mut self,
        reactor: &mut impl Reactor,
        conn: ConnId,
        handshake: Handshake,
    ) -> Result<(), ProtocolError> {
        if handshake.info_hash != self.descriptor.info_hash {
            return Err(ProtocolError::InfoHashMismatch);
        }
        info!("{} handshake from {:?}", conn, handshake.peer_id);
        if !self.local.is_empty() {
            send(reactor, conn, Message::Bitfield(self.local.to_wire()));
        }
        Ok(())
    }

    fn handle_message(
        &mut self,
        reactor: &mut impl Reactor,
        conn: ConnId,
        message: Message,
    ) -> Result<(), SessionError> {
        trace!("{} < {:?}", conn, message);
        match &message {
            Message::Request(block) => self.check_request(*block)?,
            Message::Piece(data) => self.check_block(Block::from(data))?,
            _ => {}
        }

        let Some(session) = self.sessions.get_mut(&conn) else {
            return Ok(());
        };
        if !matches!(message, Message::KeepAlive | Message::Bitfield(_)) {
            session.message_seen();
        }

        match message {
            Message::KeepAlive => {}

            Message::Choke => {
                debug!("{} choked us", conn);
                for block in session.peer_choked() {
                    self.release(conn, block);
                }
                self.request_all(reactor);
            }

            Message::Unchoke => {
                debug!("{} unchoked us", conn);
                session.peer_unchoked();
                self.request_more(reactor, conn);
            }

            Message::Interested => session.peer_interested(),

            Message::NotInterested => session.peer_not_interested(),

            Message::Have(piece) => {
                if session.peer_has(piece)? {
                    self.picker.peer_has_piece(conn, piece);
                }
                self.remote_pieces_changed(reactor, conn);
            }

            Message::Bitfield(bits) => {
                session.accept_bitfield(bits)?;
                for piece in session.remote.iter() {
                    self.picker.peer_has_piece(conn, piece);
                }
                self.remote_pieces_changed(reactor, conn);
            }

            Message::Request(block) => {
                if !self.local.has(block.piece) {
                    warn!("{} requested piece {} which we don't have", conn, block.piece);
                } else if session.enqueue_request(block) {
                    self.serve_upload(reactor, conn)?;
                }
            }

            Message::Piece(data) => self.block_received(reactor, conn, data)?,

            Message::Cancel(block) => session.cancel_upload(block),
        }
        Ok(())
    }

    fn check_block(&self, block: Block) -> Result<(), ProtocolError> {
        let pieces = self.descriptor.piece_count();
        if block.piece >= pieces {
            return Err(ProtocolError::PieceOutOfRange {
                piece: block.piece,
                pieces,
            });
        }
        if !block.fits(self.descriptor.piece_length(block.piece)) {
            return Err(ProtocolError::BlockOutOfBounds {
                piece: block.piece,
                offset: block.offset,
                length: block.length,
            });
        }
        Ok(())
    }

    fn check_request(&self, block: Block) -> Result<(), ProtocolError> {
        self.check_block(block)?;
        let max = self.config.max_block_length.bytes() as usize;
        if block.length > max {
            return Err(ProtocolError::BlockTooLong {
                length: block.length,
                max,
            });
        }
        Ok(())
    }

    /// The remote announced new pieces: update our interest and fill its request pipeline.
    fn remote_pieces_changed(&mut self, reactor: &mut impl Reactor, conn: ConnId) {
        let Some(session) = self.sessions.get_mut(&conn) else {
            return;
        };
        match session.update_interest(&self.local) {
            Some(true) => send(reactor, conn, Message::Interested),
            Some(false) => send(reactor, conn, Message::NotInterested),
            None => {}
        }
        self.request_more(reactor, conn);
    }

    fn request_more(&mut self, reactor: &mut impl Reactor, conn: ConnId) {
        let Some(session) = self.sessions.get_mut(&conn) else {
            return;
        };
        if !session.can_request() {
            return;
        }
        let in_flight = session.download.active.len();
        for block in self.picker.next_requests(conn, &session.remote, in_flight) {
            session.block_requested(block);
            let piece = &mut self.pieces[block.piece];
            if piece.state == PieceState::Missing {
                piece.state = PieceState::Requesting;
            }
            send(reactor, conn, Message::Request(block));
        }
    }

    /// `conn` will not deliver `block`. A piece nobody is fetching any more is Missing again.
    fn release(&mut self, conn: ConnId, block: Block) {
        self.picker.release(conn, block);
        let piece = &mut self.pieces[block.piece];
        if piece.state == PieceState::Requesting && !self.picker.is_requesting(block.piece) {
            piece.state = PieceState::Missing;
        }
    }

    fn request_all(&mut self, reactor: &mut impl Reactor) {
        let conns: Vec<ConnId> = self.sessions.keys().copied().collect();
        for conn in conns {
            self.request_more(reactor, conn);
        }
    }

    fn block_received(
        &mut self,
        reactor: &mut impl Reactor,
        conn: ConnId,
        data: BlockData,
    ) -> Result<(), StorageError> {
        let block = Block::from(&data);
        let now = reactor.now();
        let Some(session) = self.sessions.get_mut(&conn) else {
            return Ok(());
        };
        let requested = session.block_arrived(block, now);
        let Some(accepted) = self.picker.block_received(conn, block) else {
            if requested {
                trace!("{} sent {:?} which already arrived", conn, block);
            } else {
                warn!("{} sent block {:?} which was not requested", conn, block);
            }
            return Ok(());
        };

        self.downloaded += block.length as u64;
        let piece_length = self.pieces[block.piece].length;
        self.assembler.add(conn, piece_length, data);
        for other in accepted.duplicates {
            if let Some(session) = self.sessions.get_mut(&other) {
                if session.cancel_request(block) {
                    send(reactor, other, Message::Cancel(block));
                }
            }
        }

        if accepted.piece_complete {
            self.piece_downloaded(reactor, block.piece)?;
        }
        self.request_more(reactor, conn);
        Ok(())
    }

    fn piece_downloaded(
        &mut self,
        reactor: &mut impl Reactor,
        piece: usize,
    ) -> Result<(), StorageError> {
        self.pieces[piece].state = PieceState::Verifying;
        let expected = self.descriptor.piece_hash(piece);
        match self.assembler.finish(piece, expected) {
            None => warn!("piece {} has no buffered data", piece),
            Some(Status::Invalid { contributors }) => {
                warn!(
                    "piece {} failed verification, contributors: {:?}",
                    piece, contributors
                );
                self.pieces[piece].state = PieceState::Missing;
                self.picker.piece_failed(piece);
                if self.config.disconnect_on_hash_failure {
                    for conn in contributors {
                        self.disconnect(reactor, conn);
                    }
                }
                self.request_all(reactor);
            }
            Some(Status::Complete { data, .. }) => {
                self.storage.write_piece(piece, &data)?;
                self.piece_verified(reactor, piece);
            }
        }
        Ok(())
    }

    fn piece_verified(&mut self, reactor: &mut impl Reactor, piece: usize) {
        self.pieces[piece].state = PieceState::Have;
        self.local.set(piece);
        self.picker.piece_completed(piece);
        info!(
            "piece {} verified ({}/{})",
            piece,
            self.local.count(),
            self.local.len()
        );

        for conn in self.established() {
            send(reactor, conn, Message::Have(piece));
            if let Some(session) = self.sessions.get_mut(&conn) {
                if session.update_interest(&self.local) == Some(false) {
                    send(reactor, conn, Message::NotInterested);
                }
            }
        }
        if self.local.is_complete() {
            info!("download complete, seeding");
        }
        self.request_all(reactor);
    }

    fn serve_upload(
        &mut self,
        reactor: &mut impl Reactor,
        conn: ConnId,
    ) -> Result<(), StorageError> {
        let now = reactor.now();
        let Some(session) = self.sessions.get_mut(&conn) else {
            return Ok(());
        };
        let Some(block) = session.next_upload() else {
            return Ok(());
        };
        let data = self.storage.read(block.piece, block.offset, block.length)?;
        session.block_sent(block, now);
        self.uploaded += block.length as u64;
        trace!("{} uploading {:?}", conn, block);
        let data = BlockData {
            piece: block.piece,
            offset: block.offset,
            data,
        };
        send(reactor, conn, Message::Piece(data));
        Ok(())
    }

    /// Re-ranks interested peers and applies the choker's decision. Peers are ranked by how
    /// fast they send to us, or by how fast we send to them once we are seeding.
    fn rechoke(&mut self, reactor: &mut impl Reactor, rotate: bool) {
        let now = reactor.now();
        let seeding = self.local.is_complete();
        let mut interested = Vec::new();
        let mut unchoked = BTreeSet::new();
        for (conn, session) in self.sessions.iter_mut() {
            if !session.is_established() {
                continue;
            }
            if session.upload.interested {
                let rate = if seeding {
                    session.upload_rate(now)
                } else {
                    session.download_rate(now)
                };
                interested.push((*conn, rate));
            }
            if !session.upload.choked {
                unchoked.insert(*conn);
            }
        }

        let decision = self.choker.rechoke(&interested, &unchoked, rotate);
        for conn in decision.peers_to_choke {
            if let Some(session) = self.sessions.get_mut(&conn) {
                if session.choke() {
                    debug!("{} choked", conn);
                    send(reactor, conn, Message::Choke);
                }
            }
        }
        for conn in decision.peers_to_unchoke {
            if let Some(session) = self.sessions.get_mut(&conn) {
                if session.unchoke() {
                    debug!("{} unchoked", conn);
                    send(reactor, conn, Message::Unchoke);
                }
            }
        }
    }

    /// Closes the connection and forgets everything about it.
    fn disconnect(&mut self, reactor: &mut impl Reactor, conn: ConnId) {
        if self.remove_session(reactor, conn) {
            reactor.close(conn);
            info!("{} disconnected", conn);
            self.request_all(reactor);
        }
    }

    /// Withdraws the session's contribution to availability, choking and in-flight requests.
    fn remove_session(&mut self, reactor: &mut impl Reactor, conn: ConnId) -> bool {
        let Some(mut session) = self.sessions.remove(&conn) else {
            return false;
        };
        if let Some(token) = session.liveness.take() {
            reactor.cancel(token);
        }
        for piece in session.remote.iter() {
            self.picker.peer_lost_piece(conn, piece);
        }
        for block in session.download.active.drain() {
            self.release(conn, block);
        }
        self.choker.peer_disconnected(conn);
        true
    }
}

fn send(reactor: &mut impl Reactor, conn: ConnId, message: Message) {
    trace!("{} > {:?}", conn, message);
    let mut buf = BytesMut::with_capacity(message.transport_bytes());
    encode_message(message, &mut buf);
    reactor.write(conn, buf.freeze());
}
