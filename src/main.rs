//! Usage:
//! - `./your_bittorrent.sh decode <encoded_value>`
//! - `./your_bittorrent.sh info <path_to_torrent_file>`
//! - `./your_bittorrent.sh peers <path_to_torrent_file>`
//! - `./your_bittorrent.sh handshake <path_to_torrent_file> <peer_ip>:<peer_port>`
//! - `./your_bittorrent.sh download_piece -o <output_file> <path_to_torrent_file> <piece_index>`
//! - `./your_bittorrent.sh download -o <output_file> <path_to_torrent_file>`
//!
//! Log verbosity is controlled by `RUST_LOG`, e.g. `RUST_LOG=debug`.

use anyhow::Result;
use clap::Parser;

use bittorrent_client::bencode::decode_bencoded_value;
use bittorrent_client::cli::{Args, Commands};
use bittorrent_client::config::get_config;
use bittorrent_client::logger::Logger;
use bittorrent_client::meta_info::MetaInfo;
use bittorrent_client::peer_comm::Client;

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let args = Args::parse();
    let config = get_config()?;
    let client = Client::new(config, &Logger::new("client"));

    match &args.command {
        Commands::Decode { encoded_value } => {
            let decoded_value = decode_bencoded_value(encoded_value.as_bytes())?;
            println!("{}", decoded_value);
        }
        Commands::Info { torrent } => {
            let meta = MetaInfo::from_file(torrent).await?;
            println!("{}", meta);
        }
        Commands::Peers { torrent } => {
            let peers = client.peers(torrent).await?;
            print!("{}", peers);
        }
        Commands::Handshake { torrent, peer } => {
            let peer_id = client.handshake(torrent, *peer).await?;
            println!("Peer ID: {}", hex::encode(peer_id));
        }
        Commands::DownloadPiece {
            output,
            torrent,
            piece_index,
        } => {
            client.download_piece(output, torrent, *piece_index).await?;
            println!("Piece {} downloaded to {}.", piece_index, output.display());
        }
        Commands::Download { output, torrent } => {
            client.download(output, torrent).await?;
            println!("Downloaded {} to {}.", torrent.display(), output.display());
        }
    }

    Ok(())
}
