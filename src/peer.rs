//! # Peer Connection
//!
//! One [`PeerConnection`] per TCP session with a peer.
//!
//! After the handshake, two tasks run for the connection:
//! - the reader, which turns incoming frames into [`Input`]s for the event queue,
//! - the processor, which takes the queue in arrival order and drives the [`State`] machine.
//!
//! Piece requests from the owner of the connection go through the same queue, so they are
//! served one at a time; a request made while another piece is in flight waits its turn.
//!
//! | State           | Event      | Next state      | Action                      |
//! |-----------------|------------|-----------------|-----------------------------|
//! | WaitBitfield    | bitfield   | HaveBitfield    | unblock waiting requests    |
//! | HaveBitfield    | initiated  | SentInterested  | send `interested`           |
//! | SentInterested  | unchoke    | ReceivedUnchoke | start requesting blocks     |
//! | ReceivedUnchoke | piece      | ReceivingPieces | store the block             |
//! | ReceivingPieces | piece      | ReceivingPieces | store the block             |
//!
//! Everything else is ignored. When a piece is done, verified or failed, the machine goes
//! back to `HaveBitfield`.

use std::collections::{HashSet, VecDeque};
use std::fmt::{Display, Formatter};
use std::net::SocketAddrV4;
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use tokio::io::AsyncWrite;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::config::Config;
use crate::constants::{HashType, PeerId};
use crate::errors::PeerError;
use crate::handshake::perform_handshake;
use crate::logger::Logger;
use crate::message::{Message, MessageCodec, MessageId, PiecePayload};
use crate::meta_info::MetaInfo;
use crate::piece::PieceBuffer;
use crate::requester::{Requester, SharedWriter};

/// States of a peer connection
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
    WaitBitfield,
    HaveBitfield,
    SentInterested,
    ReceivedUnchoke,
    ReceivingPieces,
}

/// Events that can move a connection to another state
#[derive(Debug)]
pub(crate) enum Event {
    Bitfield,
    Initiated(PieceRequest),
    Unchoke,
    Piece(PiecePayload),
}

/// What to do after a transition
#[derive(Debug)]
pub(crate) enum Action {
    UnblockTransfer,
    SendInterested(PieceRequest),
    StartRequests,
    StoreBlock(PiecePayload),
}

/// The transition table
///
/// An event that has no row for the current state is handed back.
pub(crate) fn transition(state: State, event: Event) -> Result<(State, Action), Event> {
    use State::*;

    match (state, event) {
        (WaitBitfield, Event::Bitfield) => Ok((HaveBitfield, Action::UnblockTransfer)),
        (HaveBitfield, Event::Initiated(request)) => {
            Ok((SentInterested, Action::SendInterested(request)))
        }
        (SentInterested, Event::Unchoke) => Ok((ReceivedUnchoke, Action::StartRequests)),
        (ReceivedUnchoke | ReceivingPieces, Event::Piece(block)) => {
            Ok((ReceivingPieces, Action::StoreBlock(block)))
        }
        (_, event) => Err(event),
    }
}

/// A request for one piece, and where to deliver it
#[derive(Debug)]
pub(crate) struct PieceRequest {
    index: usize,
    len: usize,
    hash: HashType,
    reply: oneshot::Sender<Result<PieceBuffer, PeerError>>,
}

/// Everything the processor of a connection reacts to
#[derive(Debug)]
pub(crate) enum Input {
    /// A frame from the peer
    Message(Message),

    /// The owner of the connection wants a piece.
    Ask(PieceRequest),

    /// Requests for the attempt numbered `serial` couldn't be sent.
    RequestFailed { serial: u64, error: PeerError },

    /// The peer closed the connection, or sent something we can't frame.
    Closed,
}

/// A live connection to a peer
///
/// Created through [`PeerConnection::establish`], which performs the handshake.
///
/// Pieces are requested through [`PeerConnection::ask_for_piece`] or
/// [`PeerConnection::fetch_piece`]. The connection only reads the shared [`MetaInfo`].
///
/// [`PeerConnection`] implements [`Display`] so it can be printed as the 40 characters long
/// hexadecimal representation of the peer ID received during the handshake.
#[derive(Debug)]
pub struct PeerConnection {
    addr: SocketAddrV4,
    remote_id: PeerId,
    meta: Arc<MetaInfo>,
    events: mpsc::Sender<Input>,
    reader: JoinHandle<()>,
    processor: JoinHandle<()>,
    logger: Logger,
}

impl PeerConnection {
    /// Connects to a peer, performs the handshake, and starts the reader and the processor.
    pub async fn establish(
        peer_id: &PeerId,
        addr: SocketAddrV4,
        meta: Arc<MetaInfo>,
        config: &Config,
        logger: &Logger,
    ) -> Result<Self, PeerError> {
        let logger = logger.child(format_args!("peer {addr}"));

        let (stream, remote_id) = perform_handshake(peer_id, addr, &meta.info_hash).await?;
        logger.debug(format_args!("handshake done, peer id {}", hex::encode(remote_id)));

        Ok(Self::start(stream, addr, remote_id, meta, config, logger))
    }

    fn start(
        stream: TcpStream,
        addr: SocketAddrV4,
        remote_id: PeerId,
        meta: Arc<MetaInfo>,
        config: &Config,
        logger: Logger,
    ) -> Self {
        let (read_half, write_half) = stream.into_split();
        let (events, queue) = mpsc::channel(config.event_queue_size);

        let reader = tokio::spawn(read_frames(
            FramedRead::new(read_half, MessageCodec),
            events.clone(),
            logger.clone(),
        ));

        let processor = Processor::new(
            addr,
            write_half,
            config,
            events.downgrade(),
            logger.clone(),
        );
        let processor = tokio::spawn(processor.run(queue));

        Self {
            addr,
            remote_id,
            meta,
            events,
            reader,
            processor,
            logger,
        }
    }

    pub fn addr(&self) -> SocketAddrV4 {
        self.addr
    }

    /// The 20 bytes long Peer ID received during the handshake
    pub fn remote_id(&self) -> &PeerId {
        &self.remote_id
    }

    /// Downloads the piece at `index`, verifies it, and writes it to `sink`.
    ///
    /// Waits until the piece is committed or has failed.
    pub async fn ask_for_piece<W>(&self, index: usize, sink: &mut W) -> Result<(), PeerError>
    where
        W: AsyncWrite + Unpin,
    {
        let piece = self.fetch_piece(index).await?;
        piece.commit(sink).await?;
        self.logger.debug(format_args!("piece {index} committed"));

        Ok(())
    }

    /// Downloads the piece at `index` and returns it once its hash checks out.
    ///
    /// # Errors
    /// - [`PeerError::WrongPieceIndex`] if there is no such piece,
    /// - [`PeerError::IndexMismatch`] if the peer sends blocks of another piece,
    /// - [`PeerError::HashMismatch`] if the assembled piece is corrupt,
    /// - [`PeerError::ConnectionClosed`] if the connection goes away,
    /// - any error from sending the requests.
    pub async fn fetch_piece(&self, index: usize) -> Result<PieceBuffer, PeerError> {
        let num_pcs = self.meta.num_pieces();
        let hash = *self
            .meta
            .piece_hash(index)
            .ok_or(PeerError::WrongPieceIndex(index, num_pcs))?;

        let (reply, result) = oneshot::channel();
        let request = PieceRequest {
            index,
            len: self.meta.piece_len(index),
            hash,
            reply,
        };

        self.events
            .send(Input::Ask(request))
            .await
            .map_err(|_| PeerError::ConnectionClosed(self.addr))?;

        result
            .await
            .map_err(|_| PeerError::ConnectionClosed(self.addr))?
    }

    /// Stops the reader and the processor, which releases the stream.
    pub async fn close(mut self) {
        self.reader.abort();
        self.processor.abort();
        let _ = (&mut self.reader).await;
        let _ = (&mut self.processor).await;
        self.logger.trace(format_args!("closed"));
    }
}

impl Drop for PeerConnection {
    fn drop(&mut self) {
        self.reader.abort();
        self.processor.abort();
    }
}

/// Displays the 40 characters long hexadecimal representation of the peer ID received during the handshake.
impl Display for PeerConnection {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.remote_id))
    }
}

/// The reader task
async fn read_frames(
    mut frames: FramedRead<OwnedReadHalf, MessageCodec>,
    events: mpsc::Sender<Input>,
    logger: Logger,
) {
    while let Some(frame) = frames.next().await {
        match frame {
            Ok(msg) => {
                logger.trace(format_args!("<- {msg}"));
                if events.send(Input::Message(msg)).await.is_err() {
                    return;
                }
            }
            Err(err) => {
                logger.warn(format_args!("dropping connection: {err}"));
                break;
            }
        }
    }

    let _ = events.send(Input::Closed).await;
}

/// The piece currently being downloaded
struct InFlight {
    /// Numbers the attempts on this connection, to tell stale failures from current ones
    serial: u64,
    buffer: PieceBuffer,
    hash: HashType,
    reply: oneshot::Sender<Result<PieceBuffer, PeerError>>,
}

/// The processor task's state
struct Processor {
    addr: SocketAddrV4,
    state: State,
    unchoked: bool,
    closed: bool,
    current: Option<InFlight>,
    serial: u64,
    /// Pieces that failed here while their blocks may still be on the way
    abandoned: HashSet<usize>,
    deferred: VecDeque<PieceRequest>,
    writer: SharedWriter<OwnedWriteHalf>,
    requester: Requester<OwnedWriteHalf>,
    block_size: usize,
    requests_task: Option<JoinHandle<()>>,
    events: mpsc::WeakSender<Input>,
    logger: Logger,
}

impl Processor {
    fn new(
        addr: SocketAddrV4,
        write_half: OwnedWriteHalf,
        config: &Config,
        events: mpsc::WeakSender<Input>,
        logger: Logger,
    ) -> Self {
        let writer: SharedWriter<OwnedWriteHalf> =
            Arc::new(Mutex::new(FramedWrite::new(write_half, MessageCodec)));
        let requester = Requester::new(
            addr,
            Arc::clone(&writer),
            config.max_pipelined_requests,
            config.block_size,
            logger.clone(),
        );

        Self {
            addr,
            state: State::WaitBitfield,
            unchoked: false,
            closed: false,
            current: None,
            serial: 0,
            abandoned: HashSet::new(),
            deferred: VecDeque::new(),
            writer,
            requester,
            block_size: config.block_size,
            requests_task: None,
            events,
            logger,
        }
    }

    async fn run(mut self, mut queue: mpsc::Receiver<Input>) {
        while let Some(input) = queue.recv().await {
            match input {
                Input::Message(msg) => self.on_message(msg).await,
                Input::Ask(request) => self.on_ask(request).await,
                Input::RequestFailed { serial, error } => {
                    self.on_request_failed(serial, error).await
                }
                Input::Closed => self.on_closed(),
            }
        }
    }

    async fn on_message(&mut self, msg: Message) {
        let event = match msg.id {
            MessageId::Bitfield => Event::Bitfield,
            MessageId::Unchoke => {
                self.unchoked = true;
                Event::Unchoke
            }
            MessageId::Choke => {
                self.unchoked = false;
                return;
            }
            MessageId::Piece => match PiecePayload::try_from(&msg) {
                Ok(block) => Event::Piece(block),
                Err(err) => {
                    self.finish(Err(err));
                    return self.resume().await;
                }
            },
            MessageId::Unsupported => {
                self.logger.trace(format_args!(
                    "ignoring message with unknown id, {} bytes of payload",
                    msg.payload.len()
                ));
                return;
            }
            _ => return,
        };

        self.dispatch(event).await
    }

    async fn on_ask(&mut self, request: PieceRequest) {
        if self.closed {
            let _ = request.reply.send(Err(PeerError::ConnectionClosed(self.addr)));
            return;
        }

        self.dispatch(Event::Initiated(request)).await
    }

    async fn on_request_failed(&mut self, serial: u64, error: PeerError) {
        let is_current = self
            .current
            .as_ref()
            .is_some_and(|current| current.serial == serial);

        if is_current {
            self.requests_task = None;
            self.finish(Err(error));
            self.resume().await;
        }
    }

    fn on_closed(&mut self) {
        self.closed = true;
        self.requester.close();
        self.finish(Err(PeerError::ConnectionClosed(self.addr)));
        for request in self.deferred.drain(..) {
            let _ = request.reply.send(Err(PeerError::ConnectionClosed(self.addr)));
        }
    }

    /// Starts the oldest waiting request, if the connection is free.
    async fn resume(&mut self) {
        if self.state == State::HaveBitfield && self.current.is_none() {
            if let Some(request) = self.deferred.pop_front() {
                self.dispatch(Event::Initiated(request)).await;
            }
        }
    }

    /// Runs an event and the events that follow from it through the transition table.
    async fn dispatch(&mut self, event: Event) {
        let mut pending = VecDeque::from([event]);

        while let Some(event) = pending.pop_front() {
            let action = match transition(self.state, event) {
                Ok((next, action)) => {
                    self.logger
                        .trace(format_args!("{:?} -> {:?}", self.state, next));
                    self.state = next;
                    action
                }
                Err(Event::Initiated(request)) => {
                    self.deferred.push_back(request);
                    continue;
                }
                Err(event) => {
                    self.logger
                        .trace(format_args!("ignoring {event:?} in {:?}", self.state));
                    continue;
                }
            };

            match action {
                Action::UnblockTransfer => {
                    self.logger.debug(format_args!("transfer unblocked"));
                }
                Action::SendInterested(request) => {
                    self.begin(request).await;
                    // The peer won't repeat an unchoke it has already sent.
                    if self.state == State::SentInterested && self.unchoked {
                        pending.push_back(Event::Unchoke);
                    }
                }
                Action::StartRequests => self.start_requests(),
                Action::StoreBlock(block) => self.store_block(block),
            }

            if self.state == State::HaveBitfield && self.current.is_none() {
                if let Some(request) = self.deferred.pop_front() {
                    pending.push_back(Event::Initiated(request));
                }
            }
        }
    }

    async fn begin(&mut self, request: PieceRequest) {
        self.logger.debug(format_args!(
            "downloading piece {} ({} bytes)",
            request.index, request.len
        ));

        self.serial += 1;
        self.abandoned.remove(&request.index);
        self.current = Some(InFlight {
            serial: self.serial,
            buffer: PieceBuffer::new(request.index, request.len, self.block_size),
            hash: request.hash,
            reply: request.reply,
        });

        let interested = Message::bare(MessageId::Interested);
        let sent = self.writer.lock().await.send(interested).await;
        if let Err(err) = sent {
            self.finish(Err(err.into()));
        }
    }

    fn start_requests(&mut self) {
        let Some(current) = &self.current else {
            return;
        };
        let Some(events) = self.events.upgrade() else {
            return;
        };

        let serial = current.serial;
        let index = current.buffer.index();
        let len = current.buffer.len();
        let requester = self.requester.clone();

        self.requests_task = Some(tokio::spawn(async move {
            if let Err(error) = requester.request_piece(index, len).await {
                let _ = events.send(Input::RequestFailed { serial, error }).await;
            }
        }));
    }

    fn store_block(&mut self, block: PiecePayload) {
        let Some(current) = self.current.as_mut() else {
            return;
        };

        let index = current.buffer.index();
        if block.index as usize != index && self.abandoned.contains(&(block.index as usize)) {
            self.logger.trace(format_args!(
                "dropping late block at {} of piece {}",
                block.begin, block.index
            ));
            return;
        }

        let outcome = if block.index as usize != index {
            Some(Err(PeerError::IndexMismatch(index, block.index as usize)))
        } else {
            match current.buffer.write_block(block.begin as usize, &block.block) {
                Err(err) => Some(Err(err.into())),
                Ok(false) => {
                    self.logger.trace(format_args!(
                        "duplicate block at {} of piece {index}",
                        block.begin
                    ));
                    None
                }
                Ok(true) if current.buffer.is_complete() => {
                    if current.buffer.verify(&current.hash) {
                        Some(Ok(()))
                    } else {
                        Some(Err(PeerError::HashMismatch {
                            index,
                            expected: hex::encode(current.hash),
                            calculated: hex::encode(current.buffer.hash()),
                        }))
                    }
                }
                Ok(true) => None,
            }
        };

        if let Some(result) = outcome {
            self.finish(result);
        }
    }

    /// Hands the current piece, or the reason it failed, to whoever asked for it.
    fn finish(&mut self, result: Result<(), PeerError>) {
        if let Some(task) = self.requests_task.take() {
            task.abort();
        }

        let Some(current) = self.current.take() else {
            return;
        };
        self.state = State::HaveBitfield;

        let index = current.buffer.index();
        match &result {
            Ok(()) => self.logger.debug(format_args!("piece {index} verified")),
            Err(err) => {
                self.logger.warn(format_args!("piece {index} failed: {err}"));
                self.abandoned.insert(index);
            }
        }

        let _ = current.reply.send(result.map(|()| current.buffer));
    }
}

impl Drop for Processor {
    fn drop(&mut self) {
        if let Some(task) = self.requests_task.take() {
            task.abort();
        }
    }
}
