//! # Block Requests
//!
//! A piece is downloaded in blocks of at most [`crate::constants::BLOCK_SIZE`] bytes;
//! the last block of a piece can be smaller.
//!
//! Requests for all blocks of a piece are pipelined: several of them may be on their way
//! at the same time, which avoids idling between blocks.
//! [BitTorrent Economics Paper](http://bittorrent.org/bittorrentecon.pdf)
//! recommends having 5 requests pending at once.

use std::net::SocketAddrV4;
use std::sync::Arc;

use futures::SinkExt;
use tokio::io::AsyncWrite;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio_util::codec::FramedWrite;

use crate::errors::PeerError;
use crate::logger::Logger;
use crate::message::{Message, MessageCodec, RequestPayload};

/// The write half of a peer connection, shared by everyone who sends on it
pub type SharedWriter<W> = Arc<Mutex<FramedWrite<W, MessageCodec>>>;

/// A block of a piece: `length` bytes starting at `begin`
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Block {
    pub begin: usize,
    pub length: usize,
}

/// Splits a piece of `piece_len` bytes into blocks of `block_size` bytes.
///
/// Every block but the last one is `block_size` long; the last one holds the remainder,
/// or is a full block if there is no remainder.
pub fn plan_blocks(piece_len: usize, block_size: usize) -> Vec<Block> {
    (0..piece_len.div_ceil(block_size))
        .map(|i| {
            let begin = i * block_size;
            Block {
                begin,
                length: block_size.min(piece_len - begin),
            }
        })
        .collect()
}

/// Sends block requests for a piece
///
/// At most `max_pipelined_requests` requests are being sent at any moment: a request holds a
/// slot of the gate while it's written out and gives it back as soon as the write completes,
/// not when the block arrives.
pub struct Requester<W> {
    addr: SocketAddrV4,
    writer: SharedWriter<W>,
    gate: Arc<Semaphore>,
    block_size: usize,
    logger: Logger,
}

impl<W> Clone for Requester<W> {
    fn clone(&self) -> Self {
        Self {
            addr: self.addr,
            writer: Arc::clone(&self.writer),
            gate: Arc::clone(&self.gate),
            block_size: self.block_size,
            logger: self.logger.clone(),
        }
    }
}

impl<W> Requester<W>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(
        addr: SocketAddrV4,
        writer: SharedWriter<W>,
        max_pipelined_requests: usize,
        block_size: usize,
        logger: Logger,
    ) -> Self {
        Self {
            addr,
            writer,
            gate: Arc::new(Semaphore::new(max_pipelined_requests)),
            block_size,
            logger,
        }
    }

    /// Requests every block of the piece at `index`.
    ///
    /// Resolves once all requests are written, or with the first error; the remaining
    /// requests are abandoned then. Blocks aren't retried one by one.
    pub async fn request_piece(&self, index: usize, piece_len: usize) -> Result<(), PeerError> {
        let blocks = plan_blocks(piece_len, self.block_size);
        self.logger.trace(format_args!(
            "requesting {} blocks of piece {index}",
            blocks.len()
        ));

        let mut requests = JoinSet::new();
        for block in blocks {
            let requester = self.clone();
            requests.spawn(async move { requester.request_block(index, block).await });
        }

        while let Some(sent) = requests.join_next().await {
            sent??;
        }

        Ok(())
    }

    async fn request_block(&self, index: usize, block: Block) -> Result<(), PeerError> {
        let _slot = self
            .gate
            .acquire()
            .await
            .map_err(|_| PeerError::ConnectionClosed(self.addr))?;

        let request = RequestPayload::new(index as u32, block.begin as u32, block.length as u32);
        self.logger.trace(format_args!("{request}"));

        self.writer.lock().await.send(Message::from(request)).await?;

        Ok(())
    }

    /// Fails every request that is still waiting for a slot, and all later ones.
    pub fn close(&self) {
        self.gate.close();
    }
}
