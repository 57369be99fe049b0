mod block;
mod codec;
mod handshake;

use std::fmt::Formatter;

use bit_set::BitSet;

pub use block::*;
pub use codec::*;
pub use handshake::*;

/// All of the remaining messages in the protocol take the form of <length prefix><message
/// ID><payload>. The length prefix is a four byte big-endian value. The message ID is a single
/// decimal byte. The payload is message dependent.
#[derive(PartialEq, Eq, Clone)]
pub enum Message {
    /// # keep-alive: <len=0000>
    ///
    /// The **keep-alive** message is a message with zero bytes, specified with the length prefix
    /// set to zero. There is no message ID and no payload. Peers may close a connection if they
    /// receive no messages (**keep-alive** or any other message) for a certain period of time, so
    /// a keep-alive message must be sent to maintain the connection *alive* if no command has been
    /// sent for a given amount of time. This amount of time is generally two minutes.
    KeepAlive,

    /// # choke: <len=0001><id=0>
    Choke,

    /// # unchoke: <len=0001><id=1>
    Unchoke,

    /// # interested: <len=0001><id=2>
    Interested,

    /// # not interested: <len=0001><id=3>
    NotInterested,

    /// # have: <len=0005><id=4><piece index>
    ///
    /// The payload is the zero-based index of a piece that has just been successfully
    /// downloaded and verified via the hash.
    Have(usize),

    /// # bitfield: <len=0001+X><id=5><bitfield>
    ///
    /// May only be sent immediately after the handshake. The high bit in the first byte
    /// corresponds to piece index 0. Spare bits at the end are set to zero.
    ///
    /// *A bitfield of the wrong length is considered an error. Clients should drop the connection
    /// if they receive bitfields that are not of the correct size, or if the bitfield has any of
    /// the spare bits set.*
    Bitfield(BitSet),

    /// # request: <len=0013><id=6><index><begin><length>
    Request(Block),

    /// # piece: <len=0009+X><id=7><index><begin><block>
    Piece(BlockData),

    /// # cancel: <len=0013><id=8><index><begin><length>
    ///
    /// Identical payload to **request**. Typically used during "End Game".
    Cancel(Block),
}

impl Message {
    /// Total bytes on the wire, length prefix included.
    pub fn transport_bytes(&self) -> usize {
        let payload_size = match self {
            Self::KeepAlive => 0,
            Self::Choke | Self::Unchoke | Self::Interested | Self::NotInterested => 1,
            Self::Have(_) => 5,
            Self::Bitfield(bitset) => 1 + bitset.get_ref().len().div_ceil(8),
            Self::Request(_) | Self::Cancel(_) => 13,
            Self::Piece(block) => 9 + block.data.len(),
        };
        LENGTH_SIZE + payload_size
    }
}

impl std::fmt::Debug for Message {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Message::KeepAlive => write!(f, "KeepAlive"),
            Message::Choke => write!(f, "Choke"),
            Message::Unchoke => write!(f, "Unchoke"),
            Message::Interested => write!(f, "Interested"),
            Message::NotInterested => write!(f, "NotInterested"),
            Message::Have(piece) => write!(f, "Have {{ piece: {} }}", piece),
            Message::Bitfield(bitset) => write!(f, "Bitfield(<{} pieces>)", bitset.len()),
            Message::Request(block) => write!(f, "Request({:?})", block),
            Message::Piece(block) => {
                write!(
                    f,
                    "Piece {{ piece: {}, offset: {}, data: <{} bytes> }}",
                    block.piece,
                    block.offset,
                    block.data.len()
                )
            }
            Message::Cancel(block) => write!(f, "Cancel({:?})", block),
        }
    }
}
