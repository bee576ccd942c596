//! # Handshake
//!
//! https://www.bittorrent.org/beps/bep_0003.html#peer-protocol
//!
//! https://wiki.theory.org/BitTorrentSpecification#Handshake
//!
//! The handshake is a required message and must be the first message transmitted by the client.
//!
//! `handshake: <pstrlen><pstr><reserved><info_hash><peer_id>`
//!
//! It is 68 bytes long with the protocol identifier "BitTorrent protocol".

use std::net::SocketAddrV4;

use rand::distributions::Alphanumeric;
use rand::Rng;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::constants::*;
use crate::errors::HandshakeError;

/// The handshake message
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Handshake {
    /// Eight (8) reserved bytes; all zeroes when we send it, but the peer may set any of them.
    pub reserved: [u8; 8],

    /// 20-byte SHA1 hash of the info key in the metainfo file.
    /// This is the same info_hash that is transmitted in tracker requests.
    pub info_hash: HashType,

    /// 20-byte string used as a unique ID for the client.
    pub peer_id: PeerId,
}

impl Handshake {
    pub fn new(info_hash: HashType, peer_id: PeerId) -> Self {
        Self {
            reserved: HANDSHAKE_RESERVED,
            info_hash,
            peer_id,
        }
    }

    /// Serializes the handshake for a send transfer over the wire.
    pub fn to_bytes(&self) -> [u8; HANDSHAKE_MSG_LEN] {
        let mut buf = [0u8; HANDSHAKE_MSG_LEN];
        buf[0] = BT_PROTO_LEN as u8;
        buf[BT_PROTOCOL_RANGE].copy_from_slice(BT_PROTOCOL.as_bytes());
        buf[HANDSHAKE_RESERVED_RANGE].copy_from_slice(&self.reserved);
        buf[INFO_HASH_RANGE].copy_from_slice(&self.info_hash);
        buf[PEER_ID_RANGE].copy_from_slice(&self.peer_id);
        buf
    }

    /// Deserializes a handshake received from a wire transfer.
    ///
    /// Checks the length and the protocol identifier; reserved bytes are taken as they are.
    ///
    /// # Errors
    /// - [`HandshakeError::WrongLen`] unless exactly [`HANDSHAKE_MSG_LEN`] bytes are given,
    /// - [`HandshakeError::WrongProtocolLen`] and [`HandshakeError::WrongProtocol`]
    ///   if the protocol identifier isn't "BitTorrent protocol".
    pub fn from_bytes(buf: &[u8]) -> Result<Self, HandshakeError> {
        if buf.len() != HANDSHAKE_MSG_LEN {
            return Err(HandshakeError::WrongLen(HANDSHAKE_MSG_LEN, buf.len()));
        }
        if buf[0] as usize != BT_PROTO_LEN {
            return Err(HandshakeError::WrongProtocolLen(buf[0]));
        }
        if &buf[BT_PROTOCOL_RANGE] != BT_PROTOCOL.as_bytes() {
            return Err(HandshakeError::WrongProtocol(
                String::from_utf8_lossy(&buf[BT_PROTOCOL_RANGE]).into_owned(),
            ));
        }

        let mut handshake = Handshake::new([0; SHA1_LEN], [0; SHA1_LEN]);
        handshake.reserved.copy_from_slice(&buf[HANDSHAKE_RESERVED_RANGE]);
        handshake.info_hash.copy_from_slice(&buf[INFO_HASH_RANGE]);
        handshake.peer_id.copy_from_slice(&buf[PEER_ID_RANGE]);

        Ok(handshake)
    }

    /// Checks that the peer is talking about the same torrent.
    pub fn validate(&self, info_hash: &HashType) -> Result<(), HandshakeError> {
        if &self.info_hash != info_hash {
            return Err(HandshakeError::InfoHashMismatch(
                hex::encode(info_hash),
                hex::encode(self.info_hash),
            ));
        }
        Ok(())
    }
}

/// Generates our own Peer ID: [`PEER_ID_PREFIX`] followed by random alphanumeric characters.
pub fn new_peer_id() -> PeerId {
    let mut peer_id = [0u8; SHA1_LEN];
    peer_id[..PEER_ID_PREFIX.len()].copy_from_slice(PEER_ID_PREFIX);

    let mut rng = rand::thread_rng();
    for byte in &mut peer_id[PEER_ID_PREFIX.len()..] {
        *byte = rng.sample(Alphanumeric);
    }

    peer_id
}

/// Connects to a peer, sends a handshake, and receives and validates a handshake from the peer.
///
/// Returns the open stream and the 20 bytes long Peer ID received during the handshake.
pub async fn perform_handshake(
    peer_id: &PeerId,
    addr: SocketAddrV4,
    info_hash: &HashType,
) -> Result<(TcpStream, PeerId), HandshakeError> {
    let mut stream = TcpStream::connect(addr).await?;
    let remote_id = exchange_handshakes(&mut stream, peer_id, info_hash).await?;

    Ok((stream, remote_id))
}

/// Writes our handshake, then waits for the full handshake of the other side and validates it.
pub(crate) async fn exchange_handshakes<S>(
    stream: &mut S,
    peer_id: &PeerId,
    info_hash: &HashType,
) -> Result<PeerId, HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let ours = Handshake::new(*info_hash, *peer_id);
    stream.write_all(&ours.to_bytes()).await?;
    stream.flush().await?;

    let mut buf = [0u8; HANDSHAKE_MSG_LEN];
    stream.read_exact(&mut buf).await?;

    let theirs = Handshake::from_bytes(&buf)?;
    theirs.validate(info_hash)?;

    Ok(theirs.peer_id)
}
