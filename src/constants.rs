//! # Constants
//!
//! Protocol constants and the default values used by [`crate::config::Config`]

use std::ops::Range;

/// Length of the used hash sum, which is the [`sha1::Sha1`] sum, and its length is always 20
pub const SHA1_LEN: usize = 20;

/// A plain (not hex-encoded) SHA1 sum
pub type HashType = [u8; SHA1_LEN];

/// Prefix of our own Peer ID; the rest of the ID is random per process.
///
/// https://wiki.theory.org/BitTorrentSpecification#peer_id
pub const PEER_ID_PREFIX: &[u8; 8] = b"-RS0001-";

/// A 20-byte peer identity, exchanged in the handshake and reported to the tracker
pub type PeerId = [u8; SHA1_LEN];

pub const PORT: u16 = 6881;
pub const UPLOADED: usize = 0;
pub const DOWNLOADED: usize = 0;

/// https://www.bittorrent.org/beps/bep_0023.html
pub const COMPACT: u8 = 1;

/// Peer length in compact form
pub const PEER_LEN: usize = 6;

/// Length of the protocol identifier string
pub const BT_PROTO_LEN: usize = 19;

/// The protocol identifier string sent in the handshake
pub const BT_PROTOCOL: &str = "BitTorrent protocol";

/// Handshake: `<pstrlen=19><pstr><reserved=8><info_hash=20><peer_id=20>`
pub const HANDSHAKE_MSG_LEN: usize = 1 + BT_PROTO_LEN + 8 + SHA1_LEN + SHA1_LEN;

/// Outbound reserved bytes are all zero; we don't advertise any extension.
pub const HANDSHAKE_RESERVED: [u8; 8] = [0; 8];

pub const BT_PROTOCOL_RANGE: Range<usize> = 1..1 + BT_PROTO_LEN;
pub const HANDSHAKE_RESERVED_RANGE: Range<usize> = 1 + BT_PROTO_LEN..1 + BT_PROTO_LEN + 8;
pub const INFO_HASH_RANGE: Range<usize> = 1 + BT_PROTO_LEN + 8..1 + BT_PROTO_LEN + 8 + SHA1_LEN;
pub const PEER_ID_RANGE: Range<usize> = 1 + BT_PROTO_LEN + 8 + SHA1_LEN..HANDSHAKE_MSG_LEN;

/// Block size: 16 kB; the last block of a piece can be smaller.
pub const BLOCK_SIZE: usize = 1 << 14;

/// Upper bound for a single frame, including the length prefix.
///
/// A piece message carries at most one block plus its 13 bytes of framing,
/// so this leaves plenty of headroom for bitfields of large torrents.
pub const MAX_FRAME_SIZE: usize = 1 << 20;

/// [BitTorrent Economics Paper](http://bittorrent.org/bittorrentecon.pdf)
/// recommends having 5 requests pending at once.
pub const MAX_PIPELINED_REQUESTS: usize = 5;

/// Number of download workers allowed to run at the same time
pub const MAX_WORKERS: usize = 5;

/// Capacity of the per-connection event queue
pub const EVENT_QUEUE_SIZE: usize = 15;

/// Nesting limit for bencoded lists and dictionaries
pub const MAX_BENCODE_DEPTH: usize = 256;

/// Optional configuration file, read from the working directory
pub const CONFIG_FILE_PATH: &str = "config.json";
