//! Loopback fakes of a seeding peer and of a tracker

use std::collections::{BTreeMap, HashSet};
use std::net::{SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use sha1::{Digest, Sha1};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::bencode::{self, Value};
use crate::constants::{HashType, PeerId, HANDSHAKE_MSG_LEN, SHA1_LEN};
use crate::handshake::Handshake;
use crate::message::{Message, MessageCodec, MessageId, PiecePayload, RequestPayload};
use crate::meta_info::{length_for_index, MetaInfo};

/// Meta info and contents of a file whose pieces have the given lengths
///
/// All lengths but the last one must be equal.
pub(crate) fn sample_torrent(piece_lens: &[usize]) -> (Arc<MetaInfo>, Vec<u8>) {
    let total: usize = piece_lens.iter().sum();
    let data: Vec<u8> = (0..total as u32)
        .map(|i| (i.wrapping_mul(2_654_435_761) >> 13) as u8)
        .collect();

    let plen = piece_lens[0];
    let hashes = data
        .chunks(plen)
        .map(|piece| -> HashType { Sha1::digest(piece).into() })
        .collect();

    let meta = MetaInfo::new("http://127.0.0.1/announce", "sample.txt", total, plen, hashes)
        .unwrap();

    (Arc::new(meta), data)
}

/// The bencoded torrent file of `meta`, announcing to `announce`
pub(crate) fn torrent_bytes(meta: &MetaInfo, announce: &str) -> Vec<u8> {
    let mut info = BTreeMap::new();
    info.insert(b"length".to_vec(), Value::Int(meta.info.length as i64));
    info.insert(b"name".to_vec(), Value::from(meta.info.name.as_str()));
    info.insert(b"piece length".to_vec(), Value::Int(meta.info.plen as i64));
    info.insert(b"pieces".to_vec(), Value::Bytes(meta.info.pieces.0.concat()));

    let mut torrent = BTreeMap::new();
    torrent.insert(b"announce".to_vec(), Value::from(announce));
    torrent.insert(b"info".to_vec(), Value::Dict(info));

    bencode::encode(&Value::Dict(torrent))
}

/// How a [`FakeSeeder`] misbehaves
#[derive(Clone, Debug, Default)]
pub(crate) struct Behavior {
    /// Pieces whose first block is corrupted the first time it's served
    pub corrupt_once: Vec<usize>,

    /// Pieces whose first block is one byte short the first time it's served
    pub truncate_once: Vec<usize>,

    /// Pieces whose first block is labeled with the next index the first time it's served
    pub mislabel_once: Vec<usize>,

    /// Answer every request with a block of the next piece.
    pub wrong_index: bool,

    /// Send a message with an id outside the protocol before the bitfield.
    pub unknown_message: bool,

    /// Answer the handshake with another info hash.
    pub wrong_info_hash: bool,

    /// Close the connection right after the handshake.
    pub hang_up_after_handshake: bool,
}

struct Seed {
    info_hash: HashType,
    peer_id: PeerId,
    plen: usize,
    num_pcs: usize,
    data: Vec<u8>,
    behavior: Behavior,
    corrupt: Mutex<HashSet<usize>>,
    truncate: Mutex<HashSet<usize>>,
    mislabel: Mutex<HashSet<usize>>,
    blocks: AtomicUsize,
    pieces: AtomicUsize,
    connections: AtomicUsize,
}

/// A peer that has the whole file, listening on 127.0.0.1
pub(crate) struct FakeSeeder {
    addr: SocketAddrV4,
    seed: Arc<Seed>,
    listener: JoinHandle<()>,
}

impl FakeSeeder {
    pub(crate) async fn start(meta: &MetaInfo, data: Vec<u8>, behavior: Behavior) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = match listener.local_addr().unwrap() {
            SocketAddr::V4(addr) => addr,
            SocketAddr::V6(addr) => panic!("expected an IPv4 address, got {addr}"),
        };

        let seed = Arc::new(Seed {
            info_hash: meta.info_hash,
            peer_id: *b"-FK0001-fakeseeder00",
            plen: meta.info.plen,
            num_pcs: meta.num_pieces(),
            data,
            corrupt: Mutex::new(behavior.corrupt_once.iter().copied().collect()),
            truncate: Mutex::new(behavior.truncate_once.iter().copied().collect()),
            mislabel: Mutex::new(behavior.mislabel_once.iter().copied().collect()),
            behavior,
            blocks: AtomicUsize::new(0),
            pieces: AtomicUsize::new(0),
            connections: AtomicUsize::new(0),
        });

        let accepting = Arc::clone(&seed);
        let listener = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(serve(stream, Arc::clone(&accepting)));
            }
        });

        Self {
            addr,
            seed,
            listener,
        }
    }

    pub(crate) fn addr(&self) -> SocketAddrV4 {
        self.addr
    }

    pub(crate) fn remote_id(&self) -> &PeerId {
        &self.seed.peer_id
    }

    /// Number of blocks sent so far
    pub(crate) fn served_blocks(&self) -> usize {
        self.seed.blocks.load(Ordering::SeqCst)
    }

    /// Number of times the last block of a piece was sent
    pub(crate) fn served_pieces(&self) -> usize {
        self.seed.pieces.load(Ordering::SeqCst)
    }

    pub(crate) fn connections(&self) -> usize {
        self.seed.connections.load(Ordering::SeqCst)
    }
}

impl Drop for FakeSeeder {
    fn drop(&mut self) {
        self.listener.abort();
    }
}

impl Seed {
    fn block(&self, request: &RequestPayload) -> Option<PiecePayload> {
        let index = request.index as usize;
        let begin = request.begin as usize;
        let length = request.length as usize;
        if index >= self.num_pcs {
            return None;
        }

        let piece_len = length_for_index(self.data.len(), self.plen, index);
        if begin + length > piece_len {
            return None;
        }

        let start = index * self.plen + begin;
        let mut block = self.data[start..start + length].to_vec();
        if begin == 0 && self.corrupt.lock().unwrap().remove(&index) {
            block[0] ^= 0xff;
        }
        if begin == 0 && self.truncate.lock().unwrap().remove(&index) {
            block.pop();
        }
        let mislabeled = begin == 0 && self.mislabel.lock().unwrap().remove(&index);

        self.blocks.fetch_add(1, Ordering::SeqCst);
        if begin + length == piece_len {
            self.pieces.fetch_add(1, Ordering::SeqCst);
        }

        let index = if self.behavior.wrong_index || mislabeled {
            request.index + 1
        } else {
            request.index
        };

        Some(PiecePayload {
            index,
            begin: request.begin,
            block: Bytes::from(block),
        })
    }
}

async fn serve(mut stream: TcpStream, seed: Arc<Seed>) {
    seed.connections.fetch_add(1, Ordering::SeqCst);

    let mut buf = [0u8; HANDSHAKE_MSG_LEN];
    if stream.read_exact(&mut buf).await.is_err() {
        return;
    }

    let info_hash = if seed.behavior.wrong_info_hash {
        [0xee; SHA1_LEN]
    } else {
        seed.info_hash
    };
    let reply = Handshake::new(info_hash, seed.peer_id).to_bytes();
    if stream.write_all(&reply).await.is_err() || seed.behavior.hang_up_after_handshake {
        return;
    }

    let (read_half, write_half) = stream.into_split();
    let mut frames = FramedRead::new(read_half, MessageCodec);
    let mut sink = FramedWrite::new(write_half, MessageCodec);

    // Id 20 is the extension protocol, which we never advertise.
    if seed.behavior.unknown_message
        && sink.get_mut().write_all(&[0, 0, 0, 3, 20, 0, 0]).await.is_err()
    {
        return;
    }

    let bitfield = Bytes::from(vec![0xff; seed.num_pcs.div_ceil(8)]);
    if sink
        .send(Message::new(MessageId::Bitfield, bitfield))
        .await
        .is_err()
    {
        return;
    }

    let mut unchoked = false;
    while let Some(Ok(msg)) = frames.next().await {
        let reply = match msg.id {
            MessageId::Interested if !unchoked => {
                unchoked = true;
                Message::bare(MessageId::Unchoke)
            }
            MessageId::Request => {
                let Some(block) = RequestPayload::try_from(&msg)
                    .ok()
                    .and_then(|request| seed.block(&request))
                else {
                    continue;
                };
                Message::from(block)
            }
            _ => continue,
        };

        if sink.send(reply).await.is_err() {
            return;
        }
    }
}

/// Answers a single announce with `body`.
///
/// Resolves to the text of the request it received.
pub(crate) async fn serve_announce(body: Vec<u8>) -> (SocketAddr, JoinHandle<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let tracker = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut request = Vec::new();
        let mut buf = [0u8; 1024];
        while !request.windows(4).any(|w| w == b"\r\n\r\n") {
            let n = stream.read(&mut buf).await.unwrap();
            assert_ne!(0, n);
            request.extend(&buf[..n]);
        }

        let head = format!(
            "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
            body.len()
        );
        stream.write_all(head.as_bytes()).await.unwrap();
        stream.write_all(&body).await.unwrap();
        stream.flush().await.unwrap();

        String::from_utf8_lossy(&request).into_owned()
    });

    (addr, tracker)
}

/// A tracker response naming `peers`
pub(crate) fn announce_body(peers: &[SocketAddrV4]) -> Vec<u8> {
    let compact = crate::tracker::peers::Peers(peers.to_vec()).to_compact();
    let mut body = format!("d8:intervali60e5:peers{}:", compact.len()).into_bytes();
    body.extend(compact);
    body.push(b'e');
    body
}
