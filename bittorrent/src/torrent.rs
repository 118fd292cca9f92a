use std::{path::PathBuf, sync::Arc, time::Duration};
use tokio::{
    net::TcpListener,
    signal::unix::{signal, SignalKind},
    sync::mpsc,
    task::JoinHandle,
    time,
};
use crate::{
    config::TorrentConfig,
    metainfo::MetaInfo,
    overlay::{Overlay, Provider, DISCOVERY_TTL},
    store::PieceStore,
    swarm::{self, SwarmCommand, SwarmTx},
    tracker::{AnnounceParams, Event, TrackerClient, TrackerError},
    ID,
};

pub type Result<T> = std::result::Result<T, TorrentError>;
pub type TorrentTx = mpsc::UnboundedSender<CommandToTorrent>;
pub type TorrentRx = mpsc::UnboundedReceiver<CommandToTorrent>;

#[derive(Debug, thiserror::Error)]
pub enum TorrentError {

    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("store error: {0}")]
    StoreError(#[from] crate::StoreError),

    #[error("tracker error: {0}")]
    TrackerError(#[from] TrackerError),

    #[error("overlay error: {0}")]
    OverlayError(#[from] crate::overlay::OverlayError),

    #[error("no discovery path produced any peers")]
    NoPeers,

    #[error("channel error: {0}")]
    Channel(String),

}

impl<T> From<mpsc::error::SendError<T>> for TorrentError {
    fn from(e: mpsc::error::SendError<T>) -> Self {
        TorrentError::Channel(e.to_string())
    }
}

// Commands that can be sent to a torrent from other tasks.
#[derive(Debug)]
pub enum CommandToTorrent {

    // Sent by the store callback when a piece verified and flushed.
    PieceComplete { idx: usize },

    Shutdown,

}

// Read-only state shared with peer sessions and the swarm manager.
#[derive(Debug)]
pub struct TorrentContext {

    pub info_hash: ID,

    pub client_id: ID,

    pub store: Arc<PieceStore>,

    // Command channel into the swarm manager.
    pub swarm_tx: SwarmTx,

}

pub struct Torrent {

    ctx: Arc<TorrentContext>,

    config: TorrentConfig,

    metainfo: MetaInfo,

    tracker: Option<TrackerClient>,

    overlay: Option<Arc<Overlay>>,

    torrent_tx: TorrentTx,

    torrent_rx: TorrentRx,

    swarm_handle: Option<JoinHandle<()>>,

    // Download target and its temporary name while incomplete.
    final_path: PathBuf,

    part_path: PathBuf,

    // True when we already had the complete file at startup.
    seeding: bool,

    announce_interval: Duration,

}

impl Torrent {

    pub fn new(metainfo: MetaInfo, config: TorrentConfig) -> Result<Self> {

        std::fs::create_dir_all(&config.output_dir)?;
        let final_path = config.output_dir.join(metainfo.name());
        let part_path = config.output_dir.join(format!("{}.part", metainfo.name()));

        // Pre-existing complete file means seed mode; a .part of the right
        // size resumes; anything else starts fresh.
        let total_len = metainfo.total_len();
        let (store, seeding, resume) = match std::fs::metadata(&final_path) {
            Ok(meta) if meta.len() == total_len => {
                tracing::info!("found complete file, seeding {}", final_path.display());
                (PieceStore::open_existing(&final_path, metainfo.piece_len(), total_len)?, true, true)
            },
            _ => match std::fs::metadata(&part_path) {
                Ok(meta) if meta.len() == total_len => {
                    tracing::info!("resuming partial download {}", part_path.display());
                    (PieceStore::open_existing(&part_path, metainfo.piece_len(), total_len)?, false, true)
                },
                _ => (PieceStore::create(&part_path, metainfo.piece_len(), total_len)?, false, false),
            },
        };

        if let Some(hashes) = metainfo.piece_hashes() {
            store.set_expected_hashes(hashes);
            if resume {
                store.scan_and_mark_complete()?;
            }
        }

        let store = Arc::new(store);
        let (swarm_tx, swarm_rx) = mpsc::unbounded_channel();
        let (torrent_tx, torrent_rx) = mpsc::unbounded_channel();

        let ctx = Arc::new(TorrentContext {
            info_hash: metainfo.info_hash(),
            client_id: config.client_id,
            store: store.clone(),
            swarm_tx: swarm_tx.clone(),
        });

        // Completion events fan out to the swarm manager (HAVE broadcast) and
        // to the torrent task (finalisation).
        {
            let swarm_tx = swarm_tx.clone();
            let torrent_tx = torrent_tx.clone();
            store.on_piece_complete(move |idx| {
                swarm_tx.send(SwarmCommand::PieceComplete { piece: idx }).ok();
                torrent_tx.send(CommandToTorrent::PieceComplete { idx }).ok();
            });
        }

        let swarm_handle = swarm::spawn(ctx.clone(), swarm_rx);

        let tracker = config.discovery.uses_tracker()
            .then(|| TrackerClient::new(metainfo.announce_urls()));
        let overlay = config.discovery.uses_overlay()
            .then(|| Overlay::new(config.overlay_bootstraps.clone()));

        Ok(Torrent {
            ctx,
            config,
            metainfo,
            tracker,
            overlay,
            torrent_tx,
            torrent_rx,
            swarm_handle: Some(swarm_handle),
            final_path,
            part_path,
            seeding,
            announce_interval: Duration::from_secs(1800),
        })
    }

    pub fn context(&self) -> Arc<TorrentContext> {
        self.ctx.clone()
    }

    #[tracing::instrument(name = "torrent", skip_all, fields(info_hash = %self.metainfo.info_hash_hex()))]
    pub async fn start(&mut self) -> Result<()> {

        tracing::info!("starting torrent {}", self.metainfo.name());
        let listener = TcpListener::bind(self.config.listen_address).await?;
        let listen_address = listener.local_addr()?;
        tracing::info!("listening for peers on {}", listen_address);

        // Discover peers through whichever paths are configured; one working
        // path is enough.
        let mut discovered = false;
        if let Some(overlay) = self.overlay.clone() {
            overlay.start(&self.config.overlay_listen).await?;
            match overlay
                .discover(&self.metainfo.info_hash_hex(), &self.config.overlay_bootstraps, DISCOVERY_TTL)
                .await
            {
                Ok(()) => discovered = true,
                Err(e) => tracing::warn!("overlay discovery failed: {}", e),
            }
            overlay.announce(&self.metainfo.info_hash_hex(), self.local_provider(listen_address.port()));

            let providers = overlay.lookup(&self.metainfo.info_hash_hex(), 50).await;
            let peers = providers
                .iter()
                .filter_map(|p| p.addr.parse().ok())
                .collect::<Vec<_>>();
            if !peers.is_empty() {
                self.ctx.swarm_tx.send(SwarmCommand::Dial(peers))?;
            }
        }

        if self.tracker.is_some() {
            match self.announce(Some(Event::Started), listen_address.port()).await {
                Ok(()) => discovered = true,
                Err(e) => tracing::warn!("start announce failed: {}", e),
            }
        }
        if !discovered {
            self.shutdown_swarm().await;
            return Err(TorrentError::NoPeers);
        }

        let result = self.run(listener, listen_address.port()).await;
        self.shutdown_swarm().await;
        result
    }

    async fn run(&mut self, listener: TcpListener, port: u16) -> Result<()> {

        let mut announce_ticker = time::interval(self.announce_interval);
        announce_ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        announce_ticker.tick().await; // first tick is immediate, skip it

        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sighup = signal(SignalKind::hangup())?;

        loop { tokio::select! {

            inbound = listener.accept() => {
                match inbound {
                    Ok((stream, address)) => {
                        self.ctx.swarm_tx.send(SwarmCommand::Accepted { stream, address })?;
                    },
                    Err(e) => tracing::warn!("inbound peer connection error: {}", e),
                }
            }

            Some(cmd) = self.torrent_rx.recv() => {
                match cmd {
                    CommandToTorrent::PieceComplete { idx } => self.handle_piece_complete(idx, port).await?,
                    CommandToTorrent::Shutdown => break,
                }
            }

            _ = announce_ticker.tick() => {
                if let Err(e) = self.announce(None, port).await {
                    tracing::warn!("periodic announce failed: {}", e);
                }
                if let Some(overlay) = &self.overlay {
                    overlay.announce(&self.metainfo.info_hash_hex(), self.local_provider(port));
                }
                // The tracker may have changed the interval.
                if announce_ticker.period() != self.announce_interval {
                    announce_ticker = time::interval(self.announce_interval);
                    announce_ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
                    announce_ticker.tick().await;
                }
            }

            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupt received, shutting down");
                break;
            }

            _ = sigterm.recv() => {
                tracing::info!("terminate received, shutting down");
                break;
            }

            _ = sighup.recv() => {
                tracing::info!("hangup received, shutting down");
                break;
            }

        }}

        // Final farewell on whichever discovery paths are live.
        if self.tracker.is_some() {
            if let Err(e) = self.announce(Some(Event::Stopped), port).await {
                tracing::warn!("stopped announce failed: {}", e);
            }
        }
        if let Some(overlay) = &self.overlay {
            overlay.announce(&self.metainfo.info_hash_hex(), self.local_provider(port));
            overlay.stop();
        }

        Ok(())
    }

    async fn handle_piece_complete(&mut self, idx: usize, port: u16) -> Result<()> {

        let left = self.ctx.store.bytes_left();
        tracing::info!("piece {} written, {} bytes left", idx, left);

        if left == 0 && !self.seeding {
            self.seeding = true;
            // Swap the .part name for the final one; the open handle stays
            // valid across the rename.
            std::fs::rename(&self.part_path, &self.final_path)?;
            tracing::info!("download complete: {}", self.final_path.display());

            if self.tracker.is_some() {
                if let Err(e) = self.announce(Some(Event::Completed), port).await {
                    tracing::warn!("completed announce failed: {}", e);
                }
            }
            // Keep seeding until told to stop.
        }
        Ok(())
    }

    async fn announce(&mut self, event: Option<Event>, port: u16) -> Result<()> {

        let tracker = match self.tracker.as_mut() {
            Some(tracker) => tracker,
            None => return Ok(()),
        };

        if event == Some(Event::Started) {
            tracker.select_by_latency().await;
        }

        let left = self.ctx.store.bytes_left();
        let params = AnnounceParams {
            info_hash: self.ctx.info_hash,
            peer_id: self.ctx.client_id,
            port,
            // Upload accounting is not tracked in this design.
            uploaded: 0,
            downloaded: self.ctx.store.total_length() - left,
            left,
            event,
            hostname: self.config.hostname.clone(),
            key: hex::encode(&self.ctx.client_id[14..20]),
        };

        let response = tracker.announce(&params).await?;
        tracing::debug!(
            "announce ok: {} peers, interval {:?}",
            response.peers.len(),
            response.interval,
        );
        self.announce_interval = response.interval;

        if !response.peers.is_empty() {
            self.ctx.swarm_tx.send(SwarmCommand::Dial(response.peers))?;
        }
        Ok(())
    }

    fn local_provider(&self, port: u16) -> Provider {
        let host = self.config.hostname.clone().unwrap_or_else(|| "127.0.0.1".to_string());
        Provider {
            addr: format!("{}:{}", host, port),
            peer_id: String::from_utf8_lossy(&self.ctx.client_id).to_string(),
            left: self.ctx.store.bytes_left() as i64,
            last_seen: crate::overlay::unix_now(),
        }
    }

    async fn shutdown_swarm(&mut self) {
        self.ctx.swarm_tx.send(SwarmCommand::Shutdown).ok();
        if let Some(handle) = self.swarm_handle.take() {
            handle.await.ok();
        }
    }
}
