use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};
use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tracker::{load_from_file, router, save_to_file, spawn_sync_push, App, Tracker};

const GC_PERIOD: Duration = Duration::from_secs(60);

#[derive(Parser, Debug)]
#[command(about = "BitTorrent tracker with HLC-replicated swarm state")]
struct Args {

    #[arg(long, default_value = "0.0.0.0:8000")]
    listen: SocketAddr,

    // Unique id of this tracker instance; random when omitted.
    #[arg(long)]
    node_id: Option<String>,

    // Seconds clients should wait between announces.
    #[arg(long, default_value_t = 60)]
    interval_secs: u64,

    // Seconds of silence before a peer is tombstoned.
    #[arg(long, default_value_t = 120)]
    peer_timeout_secs: u64,

    #[arg(long, default_value_t = 50)]
    max_peers: usize,

    // JSON state file; no persistence when omitted.
    #[arg(long)]
    data: Option<PathBuf>,

    // Sibling trackers (host:port) to replicate to, comma separated.
    #[arg(long, value_delimiter = ',')]
    sync_peer: Vec<String>,

    #[arg(long, default_value_t = 15)]
    sync_interval_secs: u64,

    // Shared secret signing /sync pushes.
    #[arg(long, default_value = "bittorrent-tracker-sync-secret-2025")]
    secret: String,

}

#[tokio::main]
async fn main() {

    tracing::subscriber::set_global_default(
        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::INFO)
            .finish(),
    ).expect("failed to set tracing subscriber");

    let args = Args::parse();
    let node_id = args.node_id
        .unwrap_or_else(|| hex::encode(rand::random::<[u8; 4]>()));

    let tracker = Arc::new(Tracker::new(
        &node_id,
        Duration::from_secs(args.interval_secs),
        Duration::from_secs(args.peer_timeout_secs),
        args.max_peers,
        args.data,
    ));
    if let Err(e) = load_from_file(&tracker) {
        tracing::error!("cannot load state: {}", e);
        std::process::exit(1);
    }

    let app = Arc::new(App {
        tracker: tracker.clone(),
        secret: args.secret,
    });

    tracing::info!("tracker node {} listening on {}", node_id, args.listen);
    tracing::info!("sync signatures enabled (hmac-sha256)");

    if !args.sync_peer.is_empty() {
        spawn_sync_push(app.clone(), args.sync_peer, Duration::from_secs(args.sync_interval_secs));
    }

    // Expire silent peers and old tombstones once a minute, persisting when
    // anything changed.
    {
        let tracker = tracker.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(GC_PERIOD);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let expired = tracker.gc();
                if expired > 0 {
                    tracing::info!("gc expired {} peers", expired);
                    if let Err(e) = save_to_file(&tracker) {
                        tracing::warn!("persist after gc failed: {}", e);
                    }
                }
            }
        });
    }

    let listener = match tokio::net::TcpListener::bind(args.listen).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!("cannot bind {}: {}", args.listen, e);
            std::process::exit(1);
        },
    };

    let serve = axum::serve(
        listener,
        router(app).into_make_service_with_connect_info::<SocketAddr>(),
    ).with_graceful_shutdown(shutdown_signal());

    if let Err(e) = serve.await {
        tracing::error!("server error: {}", e);
        std::process::exit(1);
    }

    if let Err(e) = save_to_file(&tracker) {
        tracing::warn!("final persist failed: {}", e);
    }
    tracing::info!("tracker stopped");
}

async fn shutdown_signal() {
    let mut sigterm = signal(SignalKind::terminate()).expect("signal handler");
    let mut sighup = signal(SignalKind::hangup()).expect("signal handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {},
        _ = sigterm.recv() => {},
        _ = sighup.recv() => {},
    }
    tracing::info!("shutdown signal received");
}
