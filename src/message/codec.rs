use bit_set::BitSet;
use tokio_util::bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::ProtocolError;
use crate::message::{Block, BlockData, Message};

const ID_CHOKE: u8 = 0;
const ID_UNCHOKE: u8 = 1;
const ID_INTERESTED: u8 = 2;
const ID_NOT_INTERESTED: u8 = 3;
const ID_HAVE: u8 = 4;
const ID_BITFIELD: u8 = 5;
const ID_REQUEST: u8 = 6;
const ID_PIECE: u8 = 7;
const ID_CANCEL: u8 = 8;
pub const LENGTH_SIZE: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecodeState {
    /// Waiting for the 4-byte length prefix
    Length,
    /// Waiting for this many payload bytes
    Payload(usize),
}

/// Frames peer wire messages. Decoding alternates between reading a length prefix and reading
/// exactly that many payload bytes, so a frame split over any number of reads decodes the same.
#[derive(Debug)]
pub struct MessageCodec {
    max_length: usize,
    state: DecodeState,
}

impl MessageCodec {
    pub fn new(max_length: usize) -> Self {
        Self {
            max_length,
            state: DecodeState::Length,
        }
    }
}

impl Encoder<Message> for MessageCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        encode_message(item, dst);
        Ok(())
    }
}

/// Appends the wire form of `item` to `dst`.
pub fn encode_message(item: Message, dst: &mut BytesMut) {
    dst.reserve(item.transport_bytes());
    match item {
        Message::KeepAlive => dst.put_u32(0),
        Message::Choke => {
            dst.put_u32(1);
            dst.put_u8(ID_CHOKE);
        }
        Message::Unchoke => {
            dst.put_u32(1);
            dst.put_u8(ID_UNCHOKE);
        }
        Message::Interested => {
            dst.put_u32(1);
            dst.put_u8(ID_INTERESTED);
        }
        Message::NotInterested => {
            dst.put_u32(1);
            dst.put_u8(ID_NOT_INTERESTED);
        }
        Message::Have(piece) => {
            dst.put_u32(5);
            dst.put_u8(ID_HAVE);
            dst.put_u32(piece as u32);
        }
        Message::Bitfield(bitset) => {
            let bytes = bitset.get_ref().to_bytes();
            dst.put_u32(1 + (bytes.len() as u32));
            dst.put_u8(ID_BITFIELD);
            dst.extend_from_slice(&bytes);
        }
        Message::Request(block) => {
            dst.put_u32(13);
            dst.put_u8(ID_REQUEST);
            encode_block(block, dst);
        }
        Message::Piece(BlockData {
            piece,
            offset,
            data,
        }) => {
            let length = 9 + data.len();
            dst.put_u32(length as u32);
            dst.put_u8(ID_PIECE);
            dst.put_u32(piece as u32);
            dst.put_u32(offset as u32);
            dst.extend_from_slice(&data);
        }
        Message::Cancel(block) => {
            dst.put_u32(13);
            dst.put_u8(ID_CANCEL);
            encode_block(block, dst);
        }
    }
}

fn encode_block(block: Block, dst: &mut BytesMut) {
    dst.put_u32(block.piece as u32);
    dst.put_u32(block.offset as u32);
    dst.put_u32(block.length as u32);
}

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>, ProtocolError> {
        loop {
            match self.state {
                DecodeState::Length => {
                    if src.len() < LENGTH_SIZE {
                        // Not enough data to read length marker.
                        return Ok(None);
                    }
                    let length = src.get_u32() as usize;
                    if length == 0 {
                        return Ok(Some(Message::KeepAlive));
                    }
                    if length > self.max_length {
                        return Err(ProtocolError::FrameTooLong {
                            length,
                            max: self.max_length,
                        });
                    }
                    src.reserve(length.saturating_sub(src.len()));
                    self.state = DecodeState::Payload(length);
                }
                DecodeState::Payload(length) => {
                    if src.len() < length {
                        return Ok(None);
                    }
                    let payload = src.split_to(length);
                    self.state = DecodeState::Length;
                    return decode_payload(payload).map(Some);
                }
            }
        }
    }
}

fn decode_payload(mut payload: BytesMut) -> Result<Message, ProtocolError> {
    let length = payload.len();
    let id = payload.get_u8();
    match (id, length) {
        (ID_CHOKE, 1) => Ok(Message::Choke),
        (ID_UNCHOKE, 1) => Ok(Message::Unchoke),
        (ID_INTERESTED, 1) => Ok(Message::Interested),
        (ID_NOT_INTERESTED, 1) => Ok(Message::NotInterested),
        (ID_HAVE, 5) => Ok(Message::Have(payload.get_u32() as usize)),
        (ID_BITFIELD, _) => Ok(Message::Bitfield(BitSet::from_bytes(&payload))),
        (ID_REQUEST, 13) => Ok(Message::Request(decode_block(&mut payload))),
        (ID_PIECE, 9..) => {
            let piece = payload.get_u32() as usize;
            let offset = payload.get_u32() as usize;
            Ok(Message::Piece(BlockData {
                piece,
                offset,
                data: payload.to_vec(),
            }))
        }
        (ID_CANCEL, 13) => Ok(Message::Cancel(decode_block(&mut payload))),
        (ID_CHOKE..=ID_CANCEL, _) => Err(ProtocolError::InvalidLength { id, length }),
        _ => Err(ProtocolError::UnknownMessage(id)),
    }
}

fn decode_block(src: &mut BytesMut) -> Block {
    let piece = src.get_u32() as usize;
    let offset = src.get_u32() as usize;
    let length = src.get_u32() as usize;
    Block::new(piece, offset, length)
}
