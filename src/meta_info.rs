//! # Meta Info
//!
//! Metainfo File Structure
//!
//! All data in a metainfo file is bencoded.
//!
//! https://wiki.theory.org/BitTorrentSpecification#Metainfo_File_Structure
//!
//! https://www.bittorrent.org/beps/bep_0003.html#metainfo-files
//!
//! Only single-file torrents are supported.
//!
//! `$ ./your_bittorrent.sh info sample.torrent`
//!
//! ```text
//! Tracker URL: http://bittorrent-test-tracker.codecrafters.io/announce
//! Length: 92063
//! Info Hash: d69f91e6b2ae4c542468d1073a71d4ea13879a7f
//! Piece Length: 32768
//! Piece Hashes:
//! e876f67a2a8886e8f36b136726c30fa29703022d
//! 6e2275e604a0766656736e81ff10b55204ad8d35
//! f00d937a0213df1982bc8d097227ad9e909acc17
//! ```

use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::path::Path;

use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

use crate::bencode::{self, Value};
use crate::constants::HashType;
use crate::errors::MetaInfoError;
use crate::pieces::Pieces;

/// The contents of a torrent file
///
/// Immutable once loaded; shared read-only between connections.
#[derive(Clone, Debug)]
pub struct MetaInfo {
    /// The "announce" URL of the tracker (string)
    pub announce: String,

    /// Info Dictionary: describes the file of the torrent
    pub info: Info,

    /// SHA1 sum of the bencoded Info dictionary
    ///
    /// It identifies the torrent towards the tracker and the peers.
    pub info_hash: HashType,
}

/// Info Dictionary, single-file form
///
/// https://wiki.theory.org/BitTorrentSpecification#Info_Dictionary
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Info {
    /// Length of the file in bytes (integer)
    pub length: usize,

    /// Suggested name of the file; not used for downloading.
    pub name: String,

    /// Piece length: number of bytes in each piece (integer)
    #[serde(rename = "piece length")]
    pub plen: usize,

    /// The SHA1 sum of each piece
    pub pieces: Pieces,
}

/// Typed view of the whole file
#[derive(Deserialize)]
struct MetaInfoFile {
    announce: String,
    info: Info,
}

impl MetaInfo {
    /// Parses the contents of a torrent file.
    ///
    /// The info hash is computed over the re-encoded `info` value, so keys this
    /// model doesn't know about still count towards it.
    pub fn from_bytes(contents: &[u8]) -> Result<Self, MetaInfoError> {
        let decoded = bencode::decode(contents)?;
        let info = decoded.get("info").ok_or(MetaInfoError::MissingInfo)?;
        let info_hash = sha1_of(&bencode::encode(info));

        let file: MetaInfoFile = serde_bencode::from_bytes(contents)?;

        Self::validated(file.announce, file.info, info_hash)
    }

    /// Reads and parses a torrent file.
    pub async fn from_file(path: &Path) -> Result<Self, MetaInfoError> {
        let contents = tokio::fs::read(path).await?;
        Self::from_bytes(&contents)
    }

    /// Builds the meta info of a single file from its parts.
    pub fn new(
        announce: &str,
        name: &str,
        length: usize,
        plen: usize,
        pieces: Vec<HashType>,
    ) -> Result<Self, MetaInfoError> {
        let info = Info {
            length,
            name: name.to_string(),
            plen,
            pieces: Pieces(pieces),
        };
        let info_hash = sha1_of(&bencode::encode(&info.to_value()));

        Self::validated(announce.to_string(), info, info_hash)
    }

    fn validated(announce: String, info: Info, info_hash: HashType) -> Result<Self, MetaInfoError> {
        if info.plen == 0 {
            return Err(MetaInfoError::ZeroPieceLength);
        }

        let expected = info.length.div_ceil(info.plen);
        if expected != info.pieces.len() {
            return Err(MetaInfoError::PieceCountMismatch {
                length: info.length,
                plen: info.plen,
                expected,
                actual: info.pieces.len(),
            });
        }

        Ok(Self {
            announce,
            info,
            info_hash,
        })
    }

    /// Total length of the file in bytes
    pub fn length(&self) -> usize {
        self.info.length
    }

    pub fn num_pieces(&self) -> usize {
        self.info.pieces.len()
    }

    /// Length of the piece at `index`; only the last piece can be shorter than the piece length.
    pub fn piece_len(&self, index: usize) -> usize {
        length_for_index(self.info.length, self.info.plen, index)
    }

    /// Where the piece at `index` begins in the file
    pub fn piece_offset(&self, index: usize) -> u64 {
        index as u64 * self.info.plen as u64
    }

    pub fn piece_hash(&self, index: usize) -> Option<&HashType> {
        self.info.pieces.get(index)
    }

    pub fn info_hash_hex(&self) -> String {
        hex::encode(self.info_hash)
    }
}

impl Info {
    fn to_value(&self) -> Value {
        let mut dict = BTreeMap::new();
        dict.insert(b"length".to_vec(), Value::Int(self.length as i64));
        dict.insert(b"name".to_vec(), Value::from(self.name.as_str()));
        dict.insert(b"piece length".to_vec(), Value::Int(self.plen as i64));
        dict.insert(b"pieces".to_vec(), Value::Bytes(self.pieces.0.concat()));
        Value::Dict(dict)
    }
}

/// Length of the piece at `index`, for a file of `total` bytes split into pieces of `plen` bytes.
///
/// All pieces are `plen` long except possibly the last one, which holds the remainder.
/// If the remainder is zero, the last piece is a full piece.
pub fn length_for_index(total: usize, plen: usize, index: usize) -> usize {
    let num_pcs = total.div_ceil(plen);
    if index + 1 == num_pcs {
        match total % plen {
            0 => plen,
            rem => rem,
        }
    } else {
        plen
    }
}

fn sha1_of(bytes: &[u8]) -> HashType {
    Sha1::digest(bytes).into()
}

impl Display for MetaInfo {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Tracker URL: {}\nLength: {}\nInfo Hash: {}\nPiece Length: {}\nPiece Hashes:\n",
            self.announce,
            self.info.length,
            self.info_hash_hex(),
            self.info.plen
        )?;

        for piece in &self.info.pieces.0 {
            writeln!(f, "{}", hex::encode(piece))?
        }

        Ok(())
    }
}
