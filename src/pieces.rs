//! # Pieces
//!
//! Piece hashes are SHA1 sums, concatenated into a single byte string in a torrent file.

use std::fmt;

use serde::de::{Deserialize, Deserializer, Error, Visitor};
use serde::ser::{Serialize, Serializer};

use crate::constants::{HashType, SHA1_LEN};

/// The expected SHA1 sum of every piece, in piece index order
///
/// In the torrent file this is a byte string whose length is a multiple of 20,
/// each 20-byte run being the hash of the piece at the corresponding index.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Pieces(pub Vec<HashType>);

impl Pieces {
    /// Splits a concatenation of hashes; `None` if its length isn't a multiple of [`SHA1_LEN`].
    pub fn from_concatenated(bytes: &[u8]) -> Option<Self> {
        if bytes.len() % SHA1_LEN != 0 {
            return None;
        }

        let mut hashes = Vec::with_capacity(bytes.len() / SHA1_LEN);
        for chunk in bytes.chunks_exact(SHA1_LEN) {
            let mut hash: HashType = [0; SHA1_LEN];
            hash.copy_from_slice(chunk);
            hashes.push(hash);
        }

        Some(Pieces(hashes))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&HashType> {
        self.0.get(index)
    }
}

struct PiecesVisitor;

impl<'de> Visitor<'de> for PiecesVisitor {
    type Value = Pieces;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        write!(
            formatter,
            "a byte string whose length is a multiple of {}",
            SHA1_LEN
        )
    }

    fn visit_bytes<E>(self, v: &[u8]) -> Result<Self::Value, E>
    where
        E: Error,
    {
        Pieces::from_concatenated(v).ok_or_else(|| {
            E::custom(format!(
                "length of 'pieces', {}, is not divisible by SHA1 sum length, which is {}",
                v.len(),
                SHA1_LEN
            ))
        })
    }
}

impl<'de> Deserialize<'de> for Pieces {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_bytes(PiecesVisitor)
    }
}

impl Serialize for Pieces {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_bytes(&self.0.concat())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_concatenated_hashes() {
        let mut bytes = vec![1u8; SHA1_LEN];
        bytes.extend([2u8; SHA1_LEN]);

        let pieces = Pieces::from_concatenated(&bytes).unwrap();

        assert_eq!(2, pieces.len());
        assert_eq!(&[2u8; SHA1_LEN], pieces.get(1).unwrap());
    }

    #[test]
    fn reject_partial_hash() {
        assert!(Pieces::from_concatenated(&[0u8; SHA1_LEN + 1]).is_none());
    }

    #[test]
    fn deserialize_from_bencode() {
        let mut encoded = b"40:".to_vec();
        encoded.extend([7u8; 2 * SHA1_LEN]);

        let pieces: Pieces = serde_bencode::from_bytes(&encoded).unwrap();

        assert_eq!(Pieces(vec![[7u8; SHA1_LEN]; 2]), pieces);
    }

    #[test]
    fn deserialize_rejects_bad_length() {
        let encoded = b"3:abc";
        assert!(serde_bencode::from_bytes::<Pieces>(encoded).is_err());
    }
}
