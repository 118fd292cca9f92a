use std::{net::SocketAddr, path::PathBuf};
use clap::Parser;
use bittorrent::{gen_client_id, DiscoveryMode, MetaInfo, Torrent, TorrentConfig};

#[derive(Parser, Debug)]
#[command(about = "BitTorrent client with tracker and gossip-overlay discovery")]
struct Args {

    // Path to the .torrent file.
    #[arg(long)]
    torrent: PathBuf,

    #[arg(long, default_value = "downloads")]
    output: PathBuf,

    // Port to accept peer connections on; 0 picks an ephemeral port.
    #[arg(long, default_value_t = 6881)]
    port: u16,

    #[arg(long, value_enum, default_value_t = DiscoveryMode::Tracker)]
    discovery: DiscoveryMode,

    #[arg(long, default_value = "0.0.0.0:7681")]
    overlay_listen: String,

    // Comma-separated host:port list of overlay bootstrap peers.
    #[arg(long, value_delimiter = ',')]
    overlay_bootstrap: Vec<String>,

    // Name other peers should use to reach this client.
    #[arg(long)]
    hostname: Option<String>,

}

#[tokio::main]
async fn main() {

    tracing::subscriber::set_global_default(
        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::INFO)
            .finish(),
    ).expect("failed to set tracing subscriber");

    // A missing --torrent exits with status 2 via clap.
    let args = Args::parse();

    let metainfo = match MetaInfo::new(&args.torrent) {
        Ok(metainfo) => metainfo,
        Err(e) => {
            tracing::error!("cannot load {}: {}", args.torrent.display(), e);
            std::process::exit(1);
        },
    };

    let config = TorrentConfig {
        client_id: gen_client_id(),
        listen_address: SocketAddr::new(std::net::Ipv4Addr::UNSPECIFIED.into(), args.port),
        output_dir: args.output,
        discovery: args.discovery,
        overlay_listen: args.overlay_listen,
        overlay_bootstraps: args.overlay_bootstrap,
        hostname: args.hostname,
    };

    let mut torrent = match Torrent::new(metainfo, config) {
        Ok(torrent) => torrent,
        Err(e) => {
            tracing::error!("startup failed: {}", e);
            std::process::exit(1);
        },
    };

    if let Err(e) = torrent.start().await {
        tracing::error!("torrent failed: {}", e);
        std::process::exit(1);
    }
}
