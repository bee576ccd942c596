//! # Piece Buffer
//!
//! Pieces are transferred as blocks, which are assembled into a [`PieceBuffer`].
//! Once every byte has arrived the piece is checked against its SHA1 sum from the
//! torrent file, and only then written out.

use std::collections::{HashMap, HashSet};

use sha1::{Digest, Sha1};
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::constants::HashType;
use crate::errors::PieceError;
use crate::requester::plan_blocks;

/// One in-flight piece
///
/// Only the blocks that were requested are accepted: each one at its planned offset and with
/// its planned length. Blocks land in disjoint regions of the buffer, so the byte count can't
/// go past the piece length. A block whose offset was already written is dropped and not
/// counted, so a peer that sends a block twice can't make a piece look complete early.
#[derive(Debug)]
pub struct PieceBuffer {
    index: usize,
    data: Vec<u8>,
    written: usize,
    /// Offset to length, for the blocks still missing
    missing: HashMap<usize, usize>,
    received: HashSet<usize>,
}

impl PieceBuffer {
    /// A buffer for a piece of `len` bytes, requested in blocks of at most `block_size` bytes
    pub fn new(index: usize, len: usize, block_size: usize) -> Self {
        let missing = plan_blocks(len, block_size)
            .into_iter()
            .map(|block| (block.begin, block.length))
            .collect();

        Self {
            index,
            data: vec![0; len],
            written: 0,
            missing,
            received: HashSet::new(),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Number of distinct bytes received so far
    pub fn bytes_written(&self) -> usize {
        self.written
    }

    /// Copies a block into the buffer.
    ///
    /// Returns `false` if a block at the same offset was already written; nothing changes then.
    ///
    /// # Errors
    /// The buffer is left untouched in both cases.
    /// - [`PieceError::OutOfBounds`] if the block doesn't fit into the piece,
    /// - [`PieceError::UnexpectedBlock`] if no block with this offset and length was requested.
    pub fn write_block(&mut self, offset: usize, block: &[u8]) -> Result<bool, PieceError> {
        let end = offset
            .checked_add(block.len())
            .filter(|end| *end <= self.data.len())
            .ok_or(PieceError::OutOfBounds {
                offset,
                len: block.len(),
                piece_len: self.data.len(),
            })?;

        match self.missing.get(&offset) {
            Some(&len) if len == block.len() => {}
            None if self.received.contains(&offset) => return Ok(false),
            _ => {
                return Err(PieceError::UnexpectedBlock {
                    offset,
                    len: block.len(),
                })
            }
        }

        self.missing.remove(&offset);
        self.received.insert(offset);
        self.data[offset..end].copy_from_slice(block);
        self.written += block.len();

        Ok(true)
    }

    pub fn is_complete(&self) -> bool {
        self.missing.is_empty()
    }

    pub fn hash(&self) -> HashType {
        Sha1::digest(&self.data).into()
    }

    /// Compares the SHA1 sum of the whole buffer with the expected one.
    pub fn verify(&self, expected: &HashType) -> bool {
        &self.hash() == expected
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Writes the whole piece to `sink` and flushes it.
    ///
    /// # Errors
    /// [`PieceError::ShortWrite`] if the sink stops accepting bytes before the piece is written out.
    pub async fn commit<W>(&self, sink: &mut W) -> Result<(), PieceError>
    where
        W: AsyncWrite + Unpin,
    {
        let mut written = 0;
        while written < self.data.len() {
            let n = sink.write(&self.data[written..]).await?;
            if n == 0 {
                return Err(PieceError::ShortWrite {
                    written,
                    expected: self.data.len(),
                });
            }
            written += n;
        }
        sink.flush().await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io;
    use std::pin::Pin;
    use std::task::{Context, Poll};

    use super::*;

    /// A sink that accepts at most `capacity` bytes
    struct LimitedSink {
        capacity: usize,
        data: Vec<u8>,
    }

    impl AsyncWrite for LimitedSink {
        fn poll_write(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            let n = buf.len().min(self.capacity - self.data.len());
            self.data.extend_from_slice(&buf[..n]);
            Poll::Ready(Ok(n))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    fn assembled(data: &[u8], block_len: usize) -> PieceBuffer {
        let mut piece = PieceBuffer::new(0, data.len(), block_len);
        for (i, block) in data.chunks(block_len).enumerate() {
            assert!(piece.write_block(i * block_len, block).unwrap());
        }
        piece
    }

    fn sample_data() -> Vec<u8> {
        (0..300u32).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn complete_after_all_blocks() {
        let data = sample_data();
        let mut piece = PieceBuffer::new(3, data.len(), 256);

        piece.write_block(256, &data[256..]).unwrap();
        assert!(!piece.is_complete());
        piece.write_block(0, &data[..256]).unwrap();

        assert!(piece.is_complete());
        assert_eq!(3, piece.index());
        assert_eq!(&data[..], piece.as_bytes());
    }

    #[test]
    fn out_of_bounds_block_leaves_buffer_untouched() {
        let mut piece = PieceBuffer::new(0, 300, 256);

        let result = piece.write_block(256, &[0xff; 45]);

        assert!(matches!(
            result,
            Err(PieceError::OutOfBounds {
                offset: 256,
                len: 45,
                piece_len: 300
            })
        ));
        assert_eq!(0, piece.bytes_written());
        assert!(piece.as_bytes().iter().all(|b| *b == 0));

        // The same offset is still writable afterwards.
        assert!(piece.write_block(256, &[0xff; 44]).unwrap());
    }

    #[test]
    fn offset_overflow_is_out_of_bounds() {
        let mut piece = PieceBuffer::new(0, 16, 16);
        assert!(piece.write_block(usize::MAX, &[1]).is_err());
    }

    #[test]
    fn duplicate_block_is_not_counted() {
        let data = sample_data();
        let mut piece = PieceBuffer::new(0, data.len(), 150);

        assert!(piece.write_block(0, &data[..150]).unwrap());
        assert!(!piece.write_block(0, &data[..150]).unwrap());

        assert_eq!(150, piece.bytes_written());
        assert!(!piece.is_complete());
    }

    #[test]
    fn overlapping_blocks_are_rejected() {
        let mut piece = PieceBuffer::new(0, 300, 200);

        assert!(piece.write_block(0, &[1; 200]).unwrap());
        assert!(matches!(
            piece.write_block(100, &[2; 200]),
            Err(PieceError::UnexpectedBlock {
                offset: 100,
                len: 200
            })
        ));
        assert_eq!(200, piece.bytes_written());

        assert!(piece.write_block(200, &[3; 100]).unwrap());
        assert_eq!(300, piece.bytes_written());
        assert!(piece.is_complete());
    }

    #[test]
    fn short_or_empty_block_does_not_shadow_the_real_one() {
        let mut piece = PieceBuffer::new(0, 300, 300);

        for short in [&[][..], &[7; 120][..]] {
            assert!(matches!(
                piece.write_block(0, short),
                Err(PieceError::UnexpectedBlock { offset: 0, .. })
            ));
        }

        assert!(piece.write_block(0, &[7; 300]).unwrap());
        assert!(piece.is_complete());
    }

    #[test]
    fn last_block_holds_the_remainder() {
        let data = sample_data();
        let mut piece = PieceBuffer::new(0, data.len(), 128);

        assert!(piece.write_block(256, &data[256..]).is_ok());
        assert!(piece.write_block(128, &data[128..256]).is_ok());
        assert!(!piece.is_complete());
        assert!(piece.write_block(0, &data[..128]).is_ok());

        assert!(piece.is_complete());
        assert_eq!(&data[..], piece.as_bytes());
    }

    #[test]
    fn verify_detects_single_byte_change() {
        let data = sample_data();
        let expected: HashType = Sha1::digest(&data).into();

        assert!(assembled(&data, 64).verify(&expected));

        for i in [0, 150, data.len() - 1] {
            let mut corrupt = data.clone();
            corrupt[i] ^= 0x01;
            assert!(!assembled(&corrupt, 64).verify(&expected));
        }
    }

    #[tokio::test]
    async fn commit_writes_whole_piece() {
        let data = sample_data();
        let piece = assembled(&data, 100);
        let mut sink = Vec::new();

        piece.commit(&mut sink).await.unwrap();

        assert_eq!(data, sink);
    }

    #[tokio::test]
    async fn commit_reports_short_write() {
        let piece = assembled(&sample_data(), 100);
        let mut sink = LimitedSink {
            capacity: 200,
            data: Vec::new(),
        };

        assert!(matches!(
            piece.commit(&mut sink).await,
            Err(PieceError::ShortWrite {
                written: 200,
                expected: 300
            })
        ));
    }
}
