//! # Tracker Request & Response, and Peers
//!
//! https://www.bittorrent.org/beps/bep_0003.html#trackers
//!
//! https://wiki.theory.org/BitTorrentSpecification#Tracker_HTTP.2FHTTPS_Protocol
//!
//! Only the compact mode for peers is supported, but this is the only recommended mode in practice anyway.
//! https://www.bittorrent.org/beps/bep_0023.html
//!
//! `$ ./your_bittorrent.sh peers sample.torrent`
//!
//! `165.232.41.73:51556`
//!
//! `165.232.38.164:51532`
//!
//! `165.232.35.114:51437`

use serde::{Deserialize, Serialize};

use crate::constants::{PeerId, COMPACT, DOWNLOADED, UPLOADED};
use crate::errors::TrackerError;
use crate::logger::Logger;
use crate::meta_info::MetaInfo;
use crate::tracker::peers::Peers;

/// Fetches the list of peers that share the torrent described by `meta`.
///
/// Sends an HTTP GET request with query parameters obtained from the meta info to the tracker,
/// from which it then gets the peers list in the response, in the compact mode.
///
/// # Errors
/// - [`reqwest::Error`] if the tracker can't be reached or doesn't answer with a success status,
/// - [`serde_bencode::Error`] if the response isn't a proper bencoded dictionary,
/// - [`TrackerError::Failure`] if the tracker reports a failure,
/// - [`TrackerError::NoPeersFound`] if the list of peers is missing or empty.
pub async fn get_peers(
    meta: &MetaInfo,
    peer_id: &PeerId,
    port: u16,
    logger: &Logger,
) -> Result<Peers, TrackerError> {
    let url = announce_url(&meta.announce, &meta.info_hash, peer_id);

    let query = TrackerRequest {
        port,
        uploaded: UPLOADED,
        downloaded: DOWNLOADED,
        left: meta.length(),
        compact: COMPACT,
    };

    logger.debug(format_args!("announcing to {}", meta.announce));

    let client = reqwest::Client::new();
    let resp = client
        .get(&url)
        .query(&query)
        .send()
        .await?
        .error_for_status()?
        .bytes()
        .await?;

    let peers = parse_tracker_response(&resp)?;
    logger.info(format_args!("tracker returned {} peers", peers.0.len()));

    Ok(peers)
}

/// Parses a bencoded tracker response into the list of peers.
pub fn parse_tracker_response(body: &[u8]) -> Result<Peers, TrackerError> {
    let response: TrackerResponse = serde_bencode::from_bytes(body)?;

    if let Some(reason) = response.failure_reason {
        return Err(TrackerError::Failure(reason));
    }

    match response.peers {
        Some(peers) if !peers.0.is_empty() => Ok(peers),
        _ => Err(TrackerError::NoPeersFound),
    }
}

/// The announce URL with the binary parameters appended.
///
/// `info_hash` and `peer_id` are raw bytes, so they are percent-encoded by hand;
/// the remaining parameters go through [`reqwest::RequestBuilder::query`].
fn announce_url(announce: &str, info_hash: &[u8], peer_id: &[u8]) -> String {
    let separator = if announce.contains('?') { '&' } else { '?' };
    format!(
        "{announce}{separator}info_hash={}&peer_id={}",
        url_encode(info_hash),
        url_encode(peer_id)
    )
}

/// Uses the crate [`urlencoding`] for percent-encoding of the input.
///
/// For percent-encoding explanation see:
/// - https://en.wikipedia.org/wiki/Percent-encoding
/// - https://en.wikipedia.org/wiki/Percent-encoding#Types_of_URI_characters
pub(crate) fn url_encode(s: &[u8]) -> String {
    urlencoding::encode_binary(s).into_owned()
}

/// Query parameters for the HTTP GET request
///
/// *Note:* `info_hash` and `peer_id` are deliberately omitted, because they are binary;
/// see [`announce_url`].
#[derive(Debug, Serialize)]
struct TrackerRequest {
    /// The port number this peer is listening on.
    port: u16,

    /// The total amount uploaded so far, encoded in base ten ascii.
    uploaded: usize,

    /// The total amount downloaded so far, encoded in base ten ascii.
    downloaded: usize,

    /// The number of bytes this peer still has to download, encoded in base ten ascii.
    left: usize,

    /// Setting this to 1 indicates that the client accepts a compact response.
    /// The peers list is replaced by a peers string with 6 bytes per peer.
    compact: u8,
}

/// Tracker responses are bencoded dictionaries.
///
/// If a tracker response has a key `failure reason`, then that maps to a human-readable string
/// which explains why the query failed, and no other keys are required.
/// Otherwise, it has two keys: `interval`, which maps to the number of seconds the downloader should wait
/// between regular re-requests, and `peers`, a compact representation of the peer list.
#[derive(Debug, Deserialize)]
pub struct TrackerResponse {
    #[serde(rename = "failure reason")]
    pub failure_reason: Option<String>,

    /// Interval in seconds that the client should wait between sending regular requests to the tracker.
    ///
    /// Not used, as we announce only once. Some trackers omit it.
    pub interval: Option<usize>,

    /// (binary model) A string consisting of multiples of 6 bytes.
    /// First 4 bytes are the IP address and last 2 bytes are the port number. All in network (big endian) notation.
    pub peers: Option<Peers>,
}

pub mod peers {
    //! A compact representation of the peer list

    use std::fmt::{Display, Formatter};
    use std::net::{Ipv4Addr, SocketAddrV4};

    use serde::de::{Deserialize, Deserializer, Error, Visitor};
    use serde::ser::{Serialize, Serializer};

    use crate::constants::PEER_LEN;

    /// Wrapper around a vector of peers' socket addresses
    #[derive(Clone, Debug, Default, PartialEq)]
    pub struct Peers(pub Vec<SocketAddrV4>);

    impl Peers {
        /// Parses the compact form; `None` if its length isn't a multiple of [`PEER_LEN`].
        pub fn from_compact(bytes: &[u8]) -> Option<Self> {
            if bytes.len() % PEER_LEN != 0 {
                return None;
            }

            Some(Peers(
                bytes
                    .chunks_exact(PEER_LEN)
                    .map(|peer| {
                        SocketAddrV4::new(
                            Ipv4Addr::new(peer[0], peer[1], peer[2], peer[3]),
                            u16::from_be_bytes([peer[4], peer[5]]),
                        )
                    })
                    .collect(),
            ))
        }

        pub fn to_compact(&self) -> Vec<u8> {
            let mut seq = Vec::with_capacity(PEER_LEN * self.0.len());
            for peer in &self.0 {
                seq.extend(peer.ip().octets());
                seq.extend(peer.port().to_be_bytes());
            }
            seq
        }
    }

    /// One peer per line
    impl Display for Peers {
        fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
            for peer in &self.0 {
                writeln!(f, "{peer}")?;
            }
            Ok(())
        }
    }

    struct PeersVisitor;

    impl<'de> Visitor<'de> for PeersVisitor {
        type Value = Peers;

        fn expecting(&self, formatter: &mut Formatter) -> std::fmt::Result {
            write!(
                formatter,
                "a byte string whose length is a multiple of {} (compact mode)",
                PEER_LEN
            )
        }

        fn visit_bytes<E>(self, v: &[u8]) -> Result<Self::Value, E>
        where
            E: Error,
        {
            Peers::from_compact(v).ok_or_else(|| {
                E::custom(format!(
                    "length of 'peers', {}, is not divisible by {} (compact mode)",
                    v.len(),
                    PEER_LEN
                ))
            })
        }
    }

    impl<'de> Deserialize<'de> for Peers {
        fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
        where
            D: Deserializer<'de>,
        {
            deserializer.deserialize_bytes(PeersVisitor)
        }
    }

    impl Serialize for Peers {
        fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            serializer.serialize_bytes(&self.to_compact())
        }
    }
}
