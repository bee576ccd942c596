//! # Peer Communication Facilities
//!
//! These back the CLI commands that talk to peers.
//!
//! ## Peer Wire Protocol & Handshake
//!
//! https://www.bittorrent.org/beps/bep_0003.html#peer-protocol
//!
//! https://wiki.theory.org/BitTorrentSpecification#Peer_wire_protocol_.28TCP.29
//!
//! `$ ./your_bittorrent.sh handshake sample.torrent <peer_ip>:<peer_port>`
//!
//! `Peer ID: 0102030405060708090a0b0c0d0e0f1011121314`
//!
//! Exact value will be different as it is randomly generated.
//!
//! *Note:* To get a peer IP & port to test this locally, run `./your_bittorrent.sh peers sample.torrent`
//! and pick any peer from the list.
//!
//! ## Peer Messages
//!
//! https://www.bittorrent.org/beps/bep_0003.html#peer-messages
//!
//! https://wiki.theory.org/BitTorrentSpecification#Messages
//!
//! `$ ./your_bittorrent.sh download_piece -o /tmp/test-piece sample.torrent <piece_index>`
//!
//! `$ ./your_bittorrent.sh download -o /tmp/test.txt sample.torrent`

use std::net::SocketAddrV4;
use std::path::Path;
use std::sync::Arc;

use crate::config::Config;
use crate::constants::PeerId;
use crate::download::{DownloadReport, Downloader};
use crate::errors::{DownloadError, PeerError};
use crate::handshake::{new_peer_id, perform_handshake};
use crate::logger::Logger;
use crate::meta_info::MetaInfo;
use crate::peer::PeerConnection;
use crate::tracker::get_peers;
use crate::tracker::peers::Peers;

/// Our side of every exchange: the configuration, and the Peer ID we present
#[derive(Clone, Debug)]
pub struct Client {
    config: Config,
    peer_id: PeerId,
    logger: Logger,
}

impl Client {
    /// Creates a client with a freshly generated Peer ID.
    pub fn new(config: Config, logger: &Logger) -> Self {
        Self::with_peer_id(config, new_peer_id(), logger)
    }

    pub fn with_peer_id(config: Config, peer_id: PeerId, logger: &Logger) -> Self {
        Self {
            config,
            peer_id,
            logger: logger.clone(),
        }
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    /// Asks the tracker of the torrent for its peers.
    pub async fn peers(&self, torrent: &Path) -> Result<Peers, DownloadError> {
        let meta = MetaInfo::from_file(torrent).await?;
        self.discover(&meta).await
    }

    async fn discover(&self, meta: &MetaInfo) -> Result<Peers, DownloadError> {
        let peers = get_peers(meta, &self.peer_id, self.config.port, &self.logger).await?;
        Ok(peers)
    }

    /// Sends a handshake to a single peer, and receives a handshake from the peer, in the same format.
    ///
    /// Arguments:
    /// - torrent: &[`Path`], path to a torrent file, from which the info hash is calculated
    /// - peer: [`SocketAddrV4`], peer's socket address, <peer_ip>:<peer_port> (example: 127.0.0.1:8080)
    ///
    /// Returns the 20 bytes long Peer ID received during the handshake.
    ///
    /// The handshake is a required message and must be the first message transmitted by the client.
    pub async fn handshake(&self, torrent: &Path, peer: SocketAddrV4) -> Result<PeerId, DownloadError> {
        let meta = MetaInfo::from_file(torrent).await?;

        let (_stream, remote_id) = perform_handshake(&self.peer_id, peer, &meta.info_hash)
            .await
            .map_err(PeerError::from)?;

        Ok(remote_id)
    }

    /// Downloads a single piece of a file and stores it.
    ///
    /// Arguments:
    /// - output: &[`Path`], path to the output file for storing the downloaded piece
    /// - torrent: &[`Path`], path to a torrent file
    /// - piece_index: [`usize`], zero-based piece index
    ///
    /// The last piece can be smaller than other pieces which are of same fixed size that
    /// is defined in the torrent file.
    ///
    /// Peers are tried in the order the tracker lists them, until one completes the handshake.
    pub async fn download_piece(
        &self,
        output: &Path,
        torrent: &Path,
        piece_index: usize,
    ) -> Result<(), DownloadError> {
        let meta = Arc::new(MetaInfo::from_file(torrent).await?);
        let num_pcs = meta.num_pieces();
        if piece_index >= num_pcs {
            return Err(PeerError::WrongPieceIndex(piece_index, num_pcs).into());
        }

        let peers = self.discover(&meta).await?;
        let conn = self.connect_any(&peers.0, &meta).await?;

        let mut file = tokio::fs::File::create(output).await?;
        let result = conn.ask_for_piece(piece_index, &mut file).await;
        conn.close().await;
        result?;

        self.logger
            .info(format_args!("piece {piece_index} saved to {}", output.display()));

        Ok(())
    }

    /// Downloads the whole file and stores it.
    ///
    /// Arguments:
    /// - output: &[`Path`], path to the output file
    /// - torrent: &[`Path`], path to a torrent file
    ///
    /// Pieces are downloaded from all peers the tracker knows about; see [`crate::download`].
    pub async fn download(&self, output: &Path, torrent: &Path) -> Result<DownloadReport, DownloadError> {
        let meta = Arc::new(MetaInfo::from_file(torrent).await?);
        let peers = self.discover(&meta).await?;

        let downloader = Downloader::new(
            meta,
            peers.0,
            self.peer_id,
            self.config.clone(),
            &self.logger,
        )?;
        let report = downloader.download_to_file(output).await?;

        self.logger.info(format_args!(
            "{} saved: {} pieces, {} failed attempts",
            output.display(),
            report.pieces,
            report.failed_attempts
        ));

        Ok(report)
    }

    async fn connect_any(
        &self,
        peers: &[SocketAddrV4],
        meta: &Arc<MetaInfo>,
    ) -> Result<PeerConnection, DownloadError> {
        for &addr in peers {
            match PeerConnection::establish(
                &self.peer_id,
                addr,
                Arc::clone(meta),
                &self.config,
                &self.logger,
            )
            .await
            {
                Ok(conn) => return Ok(conn),
                Err(err) => self.logger.warn(format_args!("{addr}: {err}")),
            }
        }

        Err(DownloadError::NoPeerReachable)
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::path::PathBuf;

    use tempfile::TempDir;
    use tokio::net::TcpListener;

    use super::*;
    use crate::test_peer::{
        announce_body, sample_torrent, serve_announce, torrent_bytes, Behavior, FakeSeeder,
    };

    fn client() -> Client {
        Client::with_peer_id(
            Config::default(),
            *b"-RS0001-testclient00",
            &Logger::new("test"),
        )
    }

    /// Writes a torrent file for `meta` that announces to `tracker`.
    async fn torrent_file(dir: &TempDir, meta: &MetaInfo, tracker: SocketAddr) -> PathBuf {
        let path = dir.path().join("sample.torrent");
        let contents = torrent_bytes(meta, &format!("http://{tracker}/announce"));
        tokio::fs::write(&path, contents).await.unwrap();
        path
    }

    async fn dead_addr() -> SocketAddrV4 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        match listener.local_addr().unwrap() {
            SocketAddr::V4(addr) => addr,
            SocketAddr::V6(addr) => panic!("expected an IPv4 address, got {addr}"),
        }
    }

    #[tokio::test]
    async fn handshake_returns_remote_id() {
        let (meta, data) = sample_torrent(&[512, 300]);
        let seeder = FakeSeeder::start(&meta, data, Behavior::default()).await;
        let dir = tempfile::tempdir().unwrap();
        let unused = dead_addr().await;
        let torrent = torrent_file(&dir, &meta, SocketAddr::V4(unused)).await;

        let remote_id = client().handshake(&torrent, seeder.addr()).await.unwrap();

        assert_eq!(seeder.remote_id(), &remote_id);
    }

    #[tokio::test]
    async fn peers_come_from_the_tracker() {
        let (meta, _) = sample_torrent(&[512, 300]);
        let listed = vec![
            SocketAddrV4::new([10, 0, 0, 1].into(), 6881),
            SocketAddrV4::new([10, 0, 0, 2].into(), 51413),
        ];
        let (tracker, request) = serve_announce(announce_body(&listed)).await;
        let dir = tempfile::tempdir().unwrap();
        let torrent = torrent_file(&dir, &meta, tracker).await;

        let peers = client().peers(&torrent).await.unwrap();

        assert_eq!(listed, peers.0);
        let request = request.await.unwrap();
        assert!(request.contains("peer_id=-RS0001-testclient00"));
        assert!(request.contains("left=812"));
    }

    #[tokio::test]
    async fn download_piece_skips_unreachable_peers() {
        let (meta, data) = sample_torrent(&[512, 512, 300]);
        let seeder = FakeSeeder::start(&meta, data.clone(), Behavior::default()).await;
        let (tracker, _) = serve_announce(announce_body(&[dead_addr().await, seeder.addr()])).await;
        let dir = tempfile::tempdir().unwrap();
        let torrent = torrent_file(&dir, &meta, tracker).await;
        let output = dir.path().join("piece-2");

        client().download_piece(&output, &torrent, 2).await.unwrap();

        assert_eq!(&data[1024..], &tokio::fs::read(&output).await.unwrap()[..]);
        assert_eq!(1, seeder.served_pieces());
    }

    #[tokio::test]
    async fn download_piece_without_reachable_peer_fails() {
        let (meta, _) = sample_torrent(&[512, 300]);
        let (tracker, _) = serve_announce(announce_body(&[dead_addr().await])).await;
        let dir = tempfile::tempdir().unwrap();
        let torrent = torrent_file(&dir, &meta, tracker).await;

        let result = client()
            .download_piece(&dir.path().join("piece"), &torrent, 0)
            .await;

        assert!(matches!(result, Err(DownloadError::NoPeerReachable)));
    }

    #[tokio::test]
    async fn download_piece_rejects_wrong_index() {
        let (meta, _) = sample_torrent(&[512, 300]);
        let dir = tempfile::tempdir().unwrap();
        let torrent = torrent_file(&dir, &meta, SocketAddr::V4(dead_addr().await)).await;

        let result = client()
            .download_piece(&dir.path().join("piece"), &torrent, 2)
            .await;

        assert!(matches!(
            result,
            Err(DownloadError::PeerError(PeerError::WrongPieceIndex(2, 2)))
        ));
    }

    #[tokio::test]
    async fn download_whole_file() {
        let (meta, data) = sample_torrent(&[512, 512, 512, 300]);
        let first = FakeSeeder::start(&meta, data.clone(), Behavior::default()).await;
        let second = FakeSeeder::start(&meta, data.clone(), Behavior::default()).await;
        let (tracker, _) = serve_announce(announce_body(&[first.addr(), second.addr()])).await;
        let dir = tempfile::tempdir().unwrap();
        let torrent = torrent_file(&dir, &meta, tracker).await;
        let output = dir.path().join("sample.txt");

        let report = client().download(&output, &torrent).await.unwrap();

        assert_eq!(4, report.pieces);
        assert_eq!(data, tokio::fs::read(&output).await.unwrap());
    }
}
