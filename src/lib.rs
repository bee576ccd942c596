//! # A BitTorrent Client Library

pub mod bencode;
pub mod cli;
pub mod config;
pub mod constants;
pub mod download;
pub mod errors;
pub mod handshake;
pub mod logger;
pub mod message;
pub mod meta_info;
pub mod peer;
pub mod peer_comm;
pub mod piece;
pub mod pieces;
pub mod requester;
pub mod tracker;

#[cfg(test)]
pub(crate) mod test_peer;
