//! # Errors
//!
//! Error types used in the application
//!
//! Every layer has its own error type, and they wrap each other through [`From`]
//! conversions, so that `?` works across layer boundaries.

use std::io;
use std::net::SocketAddrV4;

use thiserror::Error;
use tokio::task::JoinError;

use crate::message::MessageId;

/// Errors related to working with [`crate::bencode`]
#[derive(Debug, Error, PartialEq)]
pub enum BencodeError {
    #[error("unexpected end of input at byte {0}")]
    UnexpectedEof(usize),

    #[error("unexpected byte {0:?} at byte {1}")]
    UnexpectedByte(char, usize),

    #[error("invalid integer at byte {0}")]
    InvalidInteger(usize),

    #[error("integer with leading zero at byte {0}")]
    LeadingZero(usize),

    #[error("negative zero at byte {0}")]
    NegativeZero(usize),

    #[error("invalid string length at byte {0}")]
    InvalidLength(usize),

    #[error("string of length {len} at byte {pos} exceeds the remaining {remaining} bytes")]
    StringTooLong {
        pos: usize,
        len: usize,
        remaining: usize,
    },

    #[error("dictionary key at byte {0} is not a byte string")]
    NonStringKey(usize),

    #[error("trailing data at byte {0}")]
    TrailingData(usize),

    #[error("nesting deeper than {0} levels")]
    DepthExceeded(usize),
}

/// Errors related to working with [`crate::meta_info`]
#[derive(Debug, Error)]
pub enum MetaInfoError {
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),

    #[error("Bencode error: {0}")]
    BencodeError(#[from] BencodeError),

    #[error("Deserialize error: {0}")]
    DeserializeError(#[from] serde_bencode::Error),

    #[error("the torrent file has no 'info' dictionary")]
    MissingInfo,

    #[error("piece length must be positive")]
    ZeroPieceLength,

    #[error("file length {length} with piece length {plen} needs {expected} pieces, but {actual} hashes are given")]
    PieceCountMismatch {
        length: usize,
        plen: usize,
        expected: usize,
        actual: usize,
    },
}

/// Errors related to working with [`crate::tracker`]
#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("Metainfo error: {0}")]
    MetaInfoError(#[from] MetaInfoError),

    #[error("Reqwest error: {0}")]
    ReqwestError(#[from] reqwest::Error),

    #[error("Deserialize error: {0}")]
    DeserializeError(#[from] serde_bencode::Error),

    #[error("tracker failure: {0}")]
    Failure(String),

    #[error("the tracker response has no peers")]
    NoPeersFound,
}

/// Errors related to working with [`crate::handshake`]
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),

    #[error("Wrong handshake length: expected {0}, got {1} bytes")]
    WrongLen(usize, usize),

    #[error("Wrong protocol string length: {0}")]
    WrongProtocolLen(u8),

    #[error("Wrong protocol string: {0:?}")]
    WrongProtocol(String),

    #[error("Info hash mismatch: expected {0}, received {1}")]
    InfoHashMismatch(String, String),
}

/// Errors related to working with [`crate::message::MessageCodec`]
#[derive(Debug, Error)]
pub enum MessageCodecError {
    #[error("Frame of length {0} is too large.")]
    LengthError(usize),

    #[error("Message {0:?} can't be sent")]
    Unsendable(MessageId),

    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),
}

/// Errors related to working with [`crate::piece::PieceBuffer`]
#[derive(Debug, Error)]
pub enum PieceError {
    #[error("block at offset {offset} of length {len} exceeds the piece length {piece_len}")]
    OutOfBounds {
        offset: usize,
        len: usize,
        piece_len: usize,
    },

    #[error("unexpected block at offset {offset} of length {len}")]
    UnexpectedBlock { offset: usize, len: usize },

    #[error("short write: {written} of {expected} bytes")]
    ShortWrite { written: usize, expected: usize },

    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),
}

/// Errors related to working with [`crate::peer::PeerConnection`]
#[derive(Debug, Error)]
pub enum PeerError {
    #[error("Handshake error: {0}")]
    HandshakeError(#[from] HandshakeError),

    #[error(transparent)]
    FrameError(#[from] MessageCodecError),

    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),

    #[error(transparent)]
    PieceError(#[from] PieceError),

    #[error("Wrong piece index: {0}; expected index < {1}")]
    WrongPieceIndex(usize, usize),

    #[error("Piece index mismatch: requested {0}, received {1}")]
    IndexMismatch(usize, usize),

    #[error("Malformed {0:?} payload of {1} bytes")]
    MalformedPayload(MessageId, usize),

    #[error("Hash mismatch for piece {index}: expected {expected}, calculated {calculated}")]
    HashMismatch {
        index: usize,
        expected: String,
        calculated: String,
    },

    #[error("Connection to {0} closed")]
    ConnectionClosed(SocketAddrV4),

    #[error("Task error: {0}")]
    TaskFailed(#[from] JoinError),
}

/// Errors related to working with [`crate::download`]
#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("Metainfo error: {0}")]
    MetaInfoError(#[from] MetaInfoError),

    #[error("Tracker error: {0}")]
    TrackerError(#[from] TrackerError),

    #[error("Peer error: {0}")]
    PeerError(#[from] PeerError),

    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),

    #[error("No peers to download from")]
    NoPeers,

    #[error("Piece {index} failed {attempts} times, giving up")]
    RetriesExhausted { index: usize, attempts: usize },

    #[error("Every peer refused the handshake")]
    NoPeerReachable,

    #[error("Task error: {0}")]
    TaskFailed(#[from] JoinError),

    #[error("{0} pieces were left without a worker")]
    Incomplete(usize),
}

/// Errors related to reading [`crate::config::Config`]
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),

    #[error("{0} is not formatted properly: {1}")]
    JsonError(String, serde_json::Error),

    #[error("{0} must be positive")]
    ZeroValue(&'static str),
}
