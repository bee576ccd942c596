//! # Messages
//!
//! https://www.bittorrent.org/beps/bep_0003.html#peer-messages
//!
//! https://wiki.theory.org/BitTorrentSpecification#Messages
//!
//! All messages in the protocol take the form of `<length prefix><message ID><payload>`.
//! Framing is done by [`MessageCodec`], which is used with [`tokio_util::codec::FramedRead`]
//! and [`tokio_util::codec::FramedWrite`] on the two halves of a peer connection.

use std::fmt::{Display, Formatter};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::constants::MAX_FRAME_SIZE;
use crate::errors::{MessageCodecError, PeerError};

/// Message types
///
/// All non-keepalive messages contain a single byte which holds their type.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MessageId {
    /// choke: `<len=0001><id=0>`
    Choke = 0,

    /// unchoke: `<len=0001><id=1>`
    Unchoke = 1,

    /// interested: `<len=0001><id=2>`
    Interested = 2,

    /// not interested: `<len=0001><id=3>`
    NotInterested = 3,

    /// have: `<len=0005><id=4><piece index>`
    Have = 4,

    /// bitfield: `<len=0001+X><id=5><bitfield>`
    ///
    /// The payload is a bitfield representing the pieces that the peer has.
    /// We don't look inside it; its arrival only means that the peer is ready.
    Bitfield = 5,

    /// request: `<len=0013><id=6><index><begin><length>`
    ///
    /// Used to request a block; see [`RequestPayload`].
    Request = 6,

    /// piece: `<len=0009+X><id=7><index><begin><block>`
    ///
    /// Carries a block; see [`PiecePayload`].
    ///
    /// Note that the `piece` messages are correlated with `request` messages implicitly.
    Piece = 7,

    /// cancel: `<len=0013><id=8><index><begin><length>`
    Cancel = 8,

    /// port: `<len=0003><id=9><listen-port>`
    Port = 9,

    /// Any message ID we don't know, extension messages included.
    ///
    /// Such messages are received and ignored, but never sent.
    Unsupported,
}

impl From<u8> for MessageId {
    fn from(value: u8) -> MessageId {
        match value {
            0 => MessageId::Choke,
            1 => MessageId::Unchoke,
            2 => MessageId::Interested,
            3 => MessageId::NotInterested,
            4 => MessageId::Have,
            5 => MessageId::Bitfield,
            6 => MessageId::Request,
            7 => MessageId::Piece,
            8 => MessageId::Cancel,
            9 => MessageId::Port,
            _ => MessageId::Unsupported,
        }
    }
}

/// A framed message, without its length prefix
///
/// The keep-alive message is a message with zero bytes, specified with the length prefix set to zero.
/// It is consumed by the codec and never surfaces as a [`Message`].
#[derive(Clone, Debug, PartialEq)]
pub struct Message {
    pub id: MessageId,
    pub payload: Bytes,
}

impl Message {
    pub fn new(id: MessageId, payload: Bytes) -> Self {
        Self { id, payload }
    }

    /// A message that has no payload, such as `interested` or `unchoke`.
    pub fn bare(id: MessageId) -> Self {
        Self::new(id, Bytes::new())
    }

    /// Length of the message as stated in its length prefix
    pub fn length_prefix(&self) -> usize {
        1 + self.payload.len()
    }
}

impl Display for Message {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Message {{ len: {}, id: {:?}, payload: {} bytes }}",
            self.length_prefix(),
            self.id,
            self.payload.len()
        )
    }
}

impl From<RequestPayload> for Message {
    fn from(value: RequestPayload) -> Message {
        Message::new(MessageId::Request, value.to_bytes())
    }
}

impl From<PiecePayload> for Message {
    fn from(value: PiecePayload) -> Message {
        let mut buf = BytesMut::with_capacity(8 + value.block.len());
        buf.put_u32(value.index);
        buf.put_u32(value.begin);
        buf.extend_from_slice(&value.block);
        Message::new(MessageId::Piece, buf.freeze())
    }
}

/// Payload for the [`MessageId::Request`] message
///
/// The payload contains the following information:
///   - index: integer specifying the zero-based piece index
///   - begin: integer specifying the zero-based byte offset within the piece
///   - length: integer specifying the requested length
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RequestPayload {
    pub index: u32,
    pub begin: u32,
    pub length: u32,
}

impl RequestPayload {
    pub const LEN: usize = 12;

    pub fn new(index: u32, begin: u32, length: u32) -> Self {
        Self {
            index,
            begin,
            length,
        }
    }

    /// Serializes a [`RequestPayload`] for a send transfer over the wire.
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::LEN);
        buf.put_u32(self.index);
        buf.put_u32(self.begin);
        buf.put_u32(self.length);
        buf.freeze()
    }
}

impl Display for RequestPayload {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "-> piece_i = {:3}, begin = {:6}, length = {:5}",
            self.index, self.begin, self.length
        )
    }
}

impl TryFrom<&Message> for RequestPayload {
    type Error = PeerError;

    fn try_from(value: &Message) -> Result<RequestPayload, PeerError> {
        let mut payload = &value.payload[..];
        if value.id != MessageId::Request || payload.len() != Self::LEN {
            return Err(PeerError::MalformedPayload(value.id, payload.len()));
        }

        Ok(Self::new(
            payload.get_u32(),
            payload.get_u32(),
            payload.get_u32(),
        ))
    }
}

/// Payload for the [`MessageId::Piece`] message
///
/// The payload contains the following information:
///   - index: integer specifying the zero-based piece index
///   - begin: integer specifying the zero-based byte offset within the piece
///   - block: block of data, which is a subset of the piece specified by index
#[derive(Clone, Debug, PartialEq)]
pub struct PiecePayload {
    pub index: u32,
    pub begin: u32,
    pub block: Bytes,
}

impl TryFrom<&Message> for PiecePayload {
    type Error = PeerError;

    /// Splits the payload of a [`MessageId::Piece`] message without copying the block.
    ///
    /// This function is not aware of the requested length of the block of data,
    /// hence it can't check whether it has received the entire requested block.
    fn try_from(value: &Message) -> Result<PiecePayload, PeerError> {
        if value.id != MessageId::Piece || value.payload.len() < 8 {
            return Err(PeerError::MalformedPayload(value.id, value.payload.len()));
        }

        let mut block = value.payload.clone();
        let index = block.get_u32();
        let begin = block.get_u32();

        Ok(Self {
            index,
            begin,
            block,
        })
    }
}

//////////////////////////////////////////////////////////////////////////////

/*                            Message Codec                                 */

//////////////////////////////////////////////////////////////////////////////

/// Length-prefixed framing of peer messages
#[derive(Debug, Default)]
pub struct MessageCodec;

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = MessageCodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            if src.len() < 4 {
                // Not enough data to read length prefix.
                return Ok(None);
            }

            // Read length prefix.
            let mut length_bytes = [0u8; 4];
            length_bytes.copy_from_slice(&src[..4]);
            let length = u32::from_be_bytes(length_bytes) as usize;

            // Keep-alive: discard it, and try again in case the buffer holds more messages.
            if length == 0 {
                src.advance(4);
                continue;
            }

            // Check that the length is not too large.
            if length > MAX_FRAME_SIZE - 4 {
                return Err(MessageCodecError::LengthError(length));
            }

            if src.len() < 4 + length {
                // The full message has not yet arrived.
                src.reserve(4 + length - src.len());
                return Ok(None);
            }

            let mut frame = src.split_to(4 + length);
            frame.advance(4);
            let id = MessageId::from(frame.get_u8());

            return Ok(Some(Message::new(id, frame.freeze())));
        }
    }
}

impl Encoder<Message> for MessageCodec {
    type Error = MessageCodecError;

    fn encode(&mut self, msg: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if msg.id == MessageId::Unsupported {
            return Err(MessageCodecError::Unsendable(msg.id));
        }

        let length = msg.length_prefix();

        // Don't send a message if it is longer than the other end will accept.
        if length > MAX_FRAME_SIZE - 4 {
            return Err(MessageCodecError::LengthError(length));
        }

        dst.reserve(4 + length);
        // The cast to u32 cannot overflow due to the length check above.
        dst.put_u32(length as u32);
        dst.put_u8(msg.id as u8);
        dst.extend_from_slice(&msg.payload);

        Ok(())
    }
}
