use std::io;

/// Violations of the peer wire protocol. Always fatal for the offending connection only.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("unsupported handshake protocol {0:?}")]
    HandshakeProtocol(Vec<u8>),

    #[error("handshake info hash mismatch")]
    InfoHashMismatch,

    #[error("message length {length} exceeds maximum of {max}")]
    FrameTooLong { length: usize, max: usize },

    #[error("unknown message id {0}")]
    UnknownMessage(u8),

    #[error("invalid length {length} for message id {id}")]
    InvalidLength { id: u8, length: usize },

    #[error("bitfield has {actual} bytes, expected {expected}")]
    BitfieldSize { expected: usize, actual: usize },

    #[error("bitfield has spare bits set")]
    BitfieldSpareBits,

    #[error("bitfield received after other messages")]
    UnexpectedBitfield,

    #[error("piece {piece} out of range ({pieces} pieces)")]
    PieceOutOfRange { piece: usize, pieces: usize },

    #[error("block {offset}+{length} outside piece {piece}")]
    BlockOutOfBounds {
        piece: usize,
        offset: usize,
        length: usize,
    },

    #[error("requested block length {length} exceeds maximum of {max}")]
    BlockTooLong { length: usize, max: usize },
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("range {offset}+{length} outside torrent of {total} bytes")]
    OutOfRange { offset: u64, length: u64, total: u64 },

    #[error("invalid piece index {0}")]
    InvalidPiece(usize),

    #[error("piece {piece} has {actual} bytes, expected {expected}")]
    PieceLength {
        piece: usize,
        expected: usize,
        actual: usize,
    },

    #[error("piece {0} is not stored")]
    PieceNotStored(usize),

    #[error("no free slot for piece {0}")]
    NoFreeSlot(usize),
}

/// Failure while handling traffic on one connection.
#[derive(Debug, thiserror::Error)]
pub(crate) enum SessionError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Failures that escape the engine. Anything here ends the torrent session.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("storage failure: {0}")]
    Storage(#[from] StorageError),

    #[error("engine halted after a storage failure")]
    Halted,

    #[error("local bitfield has {actual} pieces, torrent has {expected}")]
    PieceCount { expected: usize, actual: usize },
}

impl EngineError {
    pub fn is_storage(&self) -> bool {
        matches!(self, Self::Storage(_))
    }
}
