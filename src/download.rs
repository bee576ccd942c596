//! # Download
//!
//! Downloads a whole file from a set of peers.
//!
//! Every piece index starts in the queue of pending pieces. Up to
//! [`Config::max_workers`] workers run at the same time; each of them takes one index,
//! connects to a randomly chosen peer, downloads and verifies that one piece, and closes
//! the connection. A piece whose attempt fails for any reason goes back to the queue and
//! is tried again, possibly with another peer.
//!
//! Verified pieces are written to the output by the download loop itself, at offset
//! `index * piece length`, so each index is committed exactly once.
//!
//! `$ ./your_bittorrent.sh download -o /tmp/test.txt sample.torrent`

use std::collections::VecDeque;
use std::io::SeekFrom;
use std::net::SocketAddrV4;
use std::path::Path;
use std::sync::Arc;

use rand::seq::SliceRandom;
use tokio::io::{AsyncSeek, AsyncSeekExt, AsyncWrite};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::config::Config;
use crate::constants::PeerId;
use crate::errors::{DownloadError, PeerError, PieceError};
use crate::logger::Logger;
use crate::meta_info::MetaInfo;
use crate::peer::PeerConnection;
use crate::piece::PieceBuffer;

/// What a finished download did
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DownloadReport {
    /// Pieces written to the output
    pub pieces: usize,

    /// Piece downloads started, including the failed ones
    pub attempts: usize,

    pub failed_attempts: usize,
}

/// Downloads all pieces of a torrent from a fixed list of peers
#[derive(Debug)]
pub struct Downloader {
    meta: Arc<MetaInfo>,
    peers: Arc<[SocketAddrV4]>,
    peer_id: PeerId,
    config: Config,
    logger: Logger,
}

impl Downloader {
    /// # Errors
    /// [`DownloadError::NoPeers`] if `peers` is empty.
    pub fn new(
        meta: Arc<MetaInfo>,
        peers: Vec<SocketAddrV4>,
        peer_id: PeerId,
        config: Config,
        logger: &Logger,
    ) -> Result<Self, DownloadError> {
        if peers.is_empty() {
            return Err(DownloadError::NoPeers);
        }

        Ok(Self {
            meta,
            peers: peers.into(),
            peer_id,
            config,
            logger: logger.child("download"),
        })
    }

    /// Creates the file at `path` and downloads into it.
    pub async fn download_to_file(&self, path: &Path) -> Result<DownloadReport, DownloadError> {
        let mut file = tokio::fs::File::create(path).await?;
        file.set_len(self.meta.length() as u64).await?;

        let report = self.run(&mut file).await?;
        file.sync_all().await?;

        Ok(report)
    }

    /// Downloads every piece and writes it to `sink` at its offset in the file.
    ///
    /// Returns once all pieces are committed. Failed pieces are retried without limit unless
    /// [`Config::max_retries`] is set.
    ///
    /// # Errors
    /// - [`DownloadError::RetriesExhausted`] if a piece failed [`Config::max_retries`] times,
    /// - [`DownloadError::TaskFailed`] if a worker panicked,
    /// - [`DownloadError::Incomplete`] if the loop ran out of work with pieces still missing.
    pub async fn run<W>(&self, sink: &mut W) -> Result<DownloadReport, DownloadError>
    where
        W: AsyncWrite + AsyncSeek + Unpin,
    {
        let num_pcs = self.meta.num_pieces();
        self.logger.info(format_args!(
            "downloading {} pieces from {} peers",
            num_pcs,
            self.peers.len()
        ));

        let mut pending: VecDeque<usize> = (0..num_pcs).collect();
        let mut committed = vec![false; num_pcs];
        let mut tries = vec![0usize; num_pcs];
        let mut remaining = num_pcs;
        let mut report = DownloadReport::default();

        let gate = Arc::new(Semaphore::new(self.config.max_workers));
        let mut workers: JoinSet<(usize, Result<PieceBuffer, PeerError>)> = JoinSet::new();
        let mut backoff: JoinSet<usize> = JoinSet::new();

        while remaining > 0 {
            tokio::select! {
                permit = Arc::clone(&gate).acquire_owned(), if !pending.is_empty() => {
                    let Ok(permit) = permit else {
                        break;
                    };
                    let Some(index) = pending.pop_front() else {
                        continue;
                    };
                    let Some(&addr) = self.peers.choose(&mut rand::thread_rng()) else {
                        return Err(DownloadError::NoPeers);
                    };

                    tries[index] += 1;
                    report.attempts += 1;

                    let worker = self.worker(index, addr, tries[index]);
                    workers.spawn(async move {
                        let result = worker.await;
                        drop(permit);
                        (index, result)
                    });
                }
                Some(joined) = workers.join_next() => {
                    let (index, result) = joined?;
                    let result = match result {
                        Ok(piece) if committed[index] => {
                            self.logger.warn(format_args!("piece {} already committed", piece.index()));
                            continue;
                        }
                        Ok(piece) => commit(sink, &piece, self.meta.piece_offset(index))
                            .await
                            .map_err(PeerError::from),
                        Err(err) => Err(err),
                    };

                    match result {
                        Ok(()) => {
                            committed[index] = true;
                            remaining -= 1;
                            report.pieces += 1;
                            self.logger.debug(format_args!(
                                "piece {index} committed, {remaining} left"
                            ));
                        }
                        Err(err) => {
                            report.failed_attempts += 1;
                            self.logger.warn(format_args!(
                                "piece {index}, attempt {}: {err}",
                                tries[index]
                            ));
                            self.retry(index, tries[index], &mut pending, &mut backoff)?;
                        }
                    }
                }
                Some(ready) = backoff.join_next() => {
                    pending.push_back(ready?);
                }
                else => break,
            }
        }

        if remaining > 0 {
            return Err(DownloadError::Incomplete(remaining));
        }

        self.logger.info(format_args!(
            "download complete: {} pieces in {} attempts",
            report.pieces, report.attempts
        ));

        Ok(report)
    }

    /// One attempt at one piece, on a fresh connection
    fn worker(
        &self,
        index: usize,
        addr: SocketAddrV4,
        attempt: usize,
    ) -> impl std::future::Future<Output = Result<PieceBuffer, PeerError>> + Send + 'static {
        let meta = Arc::clone(&self.meta);
        let peer_id = self.peer_id;
        let config = self.config.clone();
        let logger = self.logger.child(format_args!("piece {index}"));

        async move {
            logger.trace(format_args!("attempt {attempt} with {addr}"));

            let conn = PeerConnection::establish(&peer_id, addr, meta, &config, &logger).await?;
            let result = conn.fetch_piece(index).await;
            conn.close().await;

            result
        }
    }

    /// Puts a failed piece back in the queue, right away or after the configured backoff.
    fn retry(
        &self,
        index: usize,
        attempts: usize,
        pending: &mut VecDeque<usize>,
        backoff: &mut JoinSet<usize>,
    ) -> Result<(), DownloadError> {
        if self.config.max_retries.is_some_and(|max| attempts >= max) {
            self.logger
                .error(format_args!("giving up on piece {index} after {attempts} attempts"));
            return Err(DownloadError::RetriesExhausted { index, attempts });
        }

        let delay = self.config.retry_backoff();
        if delay.is_zero() {
            pending.push_back(index);
        } else {
            backoff.spawn(async move {
                tokio::time::sleep(delay).await;
                index
            });
        }

        Ok(())
    }
}

async fn commit<W>(sink: &mut W, piece: &PieceBuffer, offset: u64) -> Result<(), PieceError>
where
    W: AsyncWrite + AsyncSeek + Unpin,
{
    sink.seek(SeekFrom::Start(offset)).await?;
    piece.commit(sink).await
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;
    use std::net::SocketAddr;

    use tokio::net::TcpListener;

    use super::*;
    use crate::handshake::new_peer_id;
    use crate::test_peer::{sample_torrent, Behavior, FakeSeeder};

    fn downloader(meta: &Arc<MetaInfo>, peers: Vec<SocketAddrV4>, config: Config) -> Downloader {
        Downloader::new(
            Arc::clone(meta),
            peers,
            new_peer_id(),
            config,
            &Logger::new("test"),
        )
        .unwrap()
    }

    fn small_blocks() -> Config {
        Config {
            block_size: 128,
            ..Config::default()
        }
    }

    /// An address nobody listens on
    async fn dead_addr() -> SocketAddrV4 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        match listener.local_addr().unwrap() {
            SocketAddr::V4(addr) => addr,
            SocketAddr::V6(addr) => panic!("expected an IPv4 address, got {addr}"),
        }
    }

    #[tokio::test]
    async fn downloads_from_two_peers() {
        let (meta, data) = sample_torrent(&[512, 512, 512, 300]);
        let first = FakeSeeder::start(&meta, data.clone(), Behavior::default()).await;
        let second = FakeSeeder::start(&meta, data.clone(), Behavior::default()).await;

        let downloader = downloader(&meta, vec![first.addr(), second.addr()], small_blocks());
        let mut sink = Cursor::new(Vec::new());
        let report = downloader.run(&mut sink).await.unwrap();

        let output = sink.into_inner();
        assert_eq!(3 * 512 + 300, output.len());
        assert_eq!(data, output);
        assert_eq!(
            DownloadReport {
                pieces: 4,
                attempts: 4,
                failed_attempts: 0
            },
            report
        );
        assert_eq!(4, first.served_pieces() + second.served_pieces());
    }

    #[tokio::test]
    async fn failed_pieces_are_retried_and_written_once() {
        let (meta, data) = sample_torrent(&[512, 512, 512, 300]);
        let behavior = Behavior {
            corrupt_once: vec![0, 3],
            ..Behavior::default()
        };
        let seeder = FakeSeeder::start(&meta, data.clone(), behavior).await;

        let downloader = downloader(&meta, vec![seeder.addr()], small_blocks());
        let mut sink = Cursor::new(Vec::new());
        let report = downloader.run(&mut sink).await.unwrap();

        assert_eq!(data, sink.into_inner());
        assert_eq!(4, report.pieces);
        assert_eq!(2, report.failed_attempts);
        assert_eq!(6, report.attempts);
        assert_eq!(6, seeder.connections());
    }

    #[tokio::test]
    async fn retries_after_backoff() {
        let (meta, data) = sample_torrent(&[512, 300]);
        let behavior = Behavior {
            corrupt_once: vec![1],
            ..Behavior::default()
        };
        let seeder = FakeSeeder::start(&meta, data.clone(), behavior).await;
        let config = Config {
            retry_backoff_ms: 20,
            ..small_blocks()
        };

        let downloader = downloader(&meta, vec![seeder.addr()], config);
        let mut sink = Cursor::new(Vec::new());
        let report = downloader.run(&mut sink).await.unwrap();

        assert_eq!(data, sink.into_inner());
        assert_eq!(1, report.failed_attempts);
    }

    #[tokio::test]
    async fn unreachable_peer_is_retried_elsewhere() {
        let (meta, data) = sample_torrent(&[512, 512, 300]);
        let seeder = FakeSeeder::start(&meta, data.clone(), Behavior::default()).await;
        let peers = vec![dead_addr().await, seeder.addr()];

        let downloader = downloader(&meta, peers, small_blocks());
        let mut sink = Cursor::new(Vec::new());
        let report = downloader.run(&mut sink).await.unwrap();

        assert_eq!(data, sink.into_inner());
        assert_eq!(3, report.pieces);
        assert_eq!(report.attempts, report.pieces + report.failed_attempts);
    }

    #[tokio::test]
    async fn gives_up_after_max_retries() {
        let (meta, data) = sample_torrent(&[512, 300]);
        let behavior = Behavior {
            wrong_info_hash: true,
            ..Behavior::default()
        };
        let seeder = FakeSeeder::start(&meta, data, behavior).await;
        let config = Config {
            max_retries: Some(3),
            ..Config::default()
        };

        let downloader = downloader(&meta, vec![seeder.addr()], config);
        let result = downloader.run(&mut Cursor::new(Vec::new())).await;

        assert!(matches!(
            result,
            Err(DownloadError::RetriesExhausted { attempts: 3, .. })
        ));
    }

    #[tokio::test]
    async fn downloads_to_file() {
        let (meta, data) = sample_torrent(&[512, 512, 512, 300]);
        let seeder = FakeSeeder::start(&meta, data.clone(), Behavior::default()).await;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sample.txt");

        let downloader = downloader(&meta, vec![seeder.addr()], Config::default());
        let report = downloader.download_to_file(&path).await.unwrap();

        assert_eq!(4, report.pieces);
        assert_eq!(data, tokio::fs::read(&path).await.unwrap());
    }

    #[test]
    fn no_peers_is_an_error() {
        let (meta, _) = sample_torrent(&[512]);
        let result = Downloader::new(
            meta,
            Vec::new(),
            new_peer_id(),
            Config::default(),
            &Logger::new("test"),
        );

        assert!(matches!(result, Err(DownloadError::NoPeers)));
    }
}
