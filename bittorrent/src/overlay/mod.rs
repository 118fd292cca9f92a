use std::{collections::HashMap, net::SocketAddr, sync::Arc, time::Duration};
use serde_derive::{Deserialize, Serialize};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{TcpListener, TcpStream},
    sync::watch,
    time,
};

mod discovery;
mod store;

pub use store::{unix_now, Provider, ProviderStore};

pub type Result<T> = std::result::Result<T, OverlayError>;

// Providers not refreshed within the TTL are ignored by lookups.
pub const PROVIDER_TTL: Duration = Duration::from_secs(90);

// Default BFS depth for discovery.
pub const DISCOVERY_TTL: usize = 3;

const GOSSIP_INTERVAL: Duration = Duration::from_secs(8);
const HEALTH_INTERVAL: Duration = Duration::from_secs(10);
const DEAD_AFTER_SECS: i64 = 20;
const DIAL_TIMEOUT: Duration = Duration::from_millis(800);
const WRITE_TIMEOUT: Duration = Duration::from_millis(1200);
const LOOKUP_FANOUT: usize = 3;
const LOOKUP_LIMIT: usize = 50;

#[derive(Debug, thiserror::Error)]
pub enum OverlayError {

    #[error(transparent)]
    IoError(#[from] std::io::Error),

    #[error("json error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("overlay peer timed out")]
    Timeout,

    #[error("no providers found for info-hash")]
    NoProviders,

}

// One JSON object per TCP connection, newline-delimited. Gossip and announce
// carry providers to merge and get no reply; lookup is answered with a JSON
// array of providers.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum WireMessage {

    Gossip { info_hash: String, providers: Vec<Provider> },

    Announce { info_hash: String, providers: Vec<Provider> },

    Lookup { info_hash: String, limit: usize },

}

pub struct Overlay {

    pub store: ProviderStore,

    // Peers we push gossip to and query during lookups.
    bootstraps: Vec<String>,

    shutdown: watch::Sender<bool>,

}

impl Overlay {

    pub fn new(bootstraps: Vec<String>) -> Arc<Overlay> {
        let (shutdown, _) = watch::channel(false);
        Arc::new(Overlay {
            store: ProviderStore::new(PROVIDER_TTL),
            bootstraps,
            shutdown,
        })
    }

    // Binds the listener and spawns the serve, gossip and health-check tasks.
    // Returns the bound address (useful when listening on port 0).
    pub async fn start(self: &Arc<Self>, listen_addr: &str) -> Result<SocketAddr> {

        let listener = TcpListener::bind(listen_addr).await?;
        let local_addr = listener.local_addr()?;
        tracing::info!("overlay listening on {} with {} bootstrap peers", local_addr, self.bootstraps.len());

        let this = self.clone();
        let mut shutdown_rx = self.shutdown.subscribe();
        tokio::spawn(async move {
            loop { tokio::select! {
                accepted = listener.accept() => {
                    let (stream, _) = match accepted {
                        Ok(conn) => conn,
                        Err(e) => {
                            tracing::warn!("overlay accept error: {}", e);
                            continue;
                        },
                    };
                    let this = this.clone();
                    tokio::spawn(async move {
                        if let Err(e) = this.handle_conn(stream).await {
                            tracing::trace!("overlay connection error: {}", e);
                        }
                    });
                }
                _ = shutdown_rx.changed() => return,
            }}
        });

        let this = self.clone();
        let mut shutdown_rx = self.shutdown.subscribe();
        tokio::spawn(async move {
            let mut ticker = time::interval(GOSSIP_INTERVAL);
            loop { tokio::select! {
                _ = ticker.tick() => this.gossip_once(),
                _ = shutdown_rx.changed() => return,
            }}
        });

        let this = self.clone();
        let mut shutdown_rx = self.shutdown.subscribe();
        tokio::spawn(async move {
            let mut ticker = time::interval(HEALTH_INTERVAL);
            loop { tokio::select! {
                _ = ticker.tick() => this.drop_dead_providers(),
                _ = shutdown_rx.changed() => return,
            }}
        });

        Ok(local_addr)
    }

    pub fn stop(&self) {
        self.shutdown.send(true).ok();
    }

    async fn handle_conn(&self, stream: TcpStream) -> Result<()> {

        let (read_half, mut write_half) = stream.into_split();
        let mut line = String::new();
        BufReader::new(read_half).read_line(&mut line).await?;

        match serde_json::from_str(&line)? {

            WireMessage::Gossip { info_hash, providers }
            | WireMessage::Announce { info_hash, providers } => {
                if !info_hash.is_empty() && !providers.is_empty() {
                    self.store.merge(&info_hash, providers);
                }
            },

            WireMessage::Lookup { info_hash, limit } => {
                if info_hash.is_empty() {
                    return Ok(());
                }
                let providers = self.store.lookup(&info_hash, limit);
                let mut reply = serde_json::to_vec(&providers)?;
                reply.push(b'\n');
                time::timeout(WRITE_TIMEOUT, write_half.write_all(&reply))
                    .await
                    .map_err(|_| OverlayError::Timeout)??;
            },

        }
        Ok(())
    }

    // Register ourselves locally, then push to every bootstrap peer. The push
    // is fire-and-forget: at-most-once delivery, the next gossip tick repeats
    // the advertisement anyway.
    pub fn announce(&self, info_hash: &str, provider: Provider) {
        self.store.announce(info_hash, provider.clone());
        let msg = WireMessage::Announce {
            info_hash: info_hash.to_string(),
            providers: vec![provider],
        };
        if let Ok(payload) = encode_line(&msg) {
            for peer in &self.bootstraps {
                let peer = peer.clone();
                let payload = payload.clone();
                tokio::spawn(async move {
                    send_payload(&peer, &payload).await.ok();
                });
            }
        }
    }

    // Local results plus whatever up to `fanout` bootstrap peers hold,
    // deduplicated by addr, freshest first.
    pub async fn lookup(&self, info_hash: &str, limit: usize) -> Vec<Provider> {

        let mut merged: HashMap<String, Provider> = HashMap::new();
        for provider in self.store.lookup(info_hash, limit) {
            merged.insert(provider.addr.clone(), provider);
        }

        for peer in self.bootstraps.iter().take(LOOKUP_FANOUT) {
            for provider in query_lookup(peer, info_hash, limit).await.unwrap_or_default() {
                merged.entry(provider.addr.clone()).or_insert(provider);
            }
        }

        let mut out: Vec<Provider> = merged.into_values().collect();
        out.sort_by(|a, b| b.last_seen.cmp(&a.last_seen));
        if limit > 0 {
            out.truncate(limit);
        }
        out
    }

    // Push the full provider list of every known info-hash to every
    // bootstrap peer.
    fn gossip_once(&self) {
        for info_hash in self.store.info_hashes() {
            let providers = self.store.providers(&info_hash);
            if providers.is_empty() {
                continue;
            }
            let msg = WireMessage::Gossip {
                info_hash: info_hash.clone(),
                providers,
            };
            let payload = match encode_line(&msg) {
                Ok(payload) => payload,
                Err(_) => continue,
            };
            for peer in &self.bootstraps {
                let peer = peer.clone();
                let payload = payload.clone();
                tokio::spawn(async move {
                    send_payload(&peer, &payload).await.ok();
                });
            }
        }
    }

    // Providers silent for longer than 20 s are dropped outright.
    fn drop_dead_providers(&self) {
        let now = unix_now();
        for info_hash in self.store.info_hashes() {
            let providers = self.store.providers(&info_hash);
            let alive: Vec<Provider> = providers
                .into_iter()
                .filter(|p| {
                    let dead = now - p.last_seen >= DEAD_AFTER_SECS;
                    if dead {
                        tracing::debug!("overlay provider {} timed out", p.addr);
                    }
                    !dead
                })
                .collect();
            self.store.replace(&info_hash, alive);
        }
    }
}

fn encode_line(msg: &WireMessage) -> Result<Vec<u8>> {
    let mut payload = serde_json::to_vec(msg)?;
    payload.push(b'\n');
    Ok(payload)
}

async fn send_payload(addr: &str, payload: &[u8]) -> Result<()> {
    let mut stream = time::timeout(DIAL_TIMEOUT, TcpStream::connect(addr))
        .await
        .map_err(|_| OverlayError::Timeout)??;
    time::timeout(WRITE_TIMEOUT, stream.write_all(payload))
        .await
        .map_err(|_| OverlayError::Timeout)??;
    Ok(())
}

// One lookup round trip against a single peer.
async fn query_lookup(addr: &str, info_hash: &str, limit: usize) -> Result<Vec<Provider>> {

    let stream = time::timeout(DIAL_TIMEOUT, TcpStream::connect(addr))
        .await
        .map_err(|_| OverlayError::Timeout)??;
    let (read_half, mut write_half) = stream.into_split();

    let payload = encode_line(&WireMessage::Lookup {
        info_hash: info_hash.to_string(),
        limit,
    })?;
    time::timeout(WRITE_TIMEOUT, write_half.write_all(&payload))
        .await
        .map_err(|_| OverlayError::Timeout)??;

    let mut line = String::new();
    time::timeout(WRITE_TIMEOUT, BufReader::new(read_half).read_line(&mut line))
        .await
        .map_err(|_| OverlayError::Timeout)??;
    Ok(serde_json::from_str(&line)?)
}

// Probe used by discovery: a node is alive when it accepts a TCP dial.
async fn node_alive(addr: &str) -> bool {
    matches!(
        time::timeout(DIAL_TIMEOUT, TcpStream::connect(addr)).await,
        Ok(Ok(_))
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_message_json_shape() {
        let msg = WireMessage::Lookup { info_hash: "abcd".to_string(), limit: 50 };
        let json = serde_json::to_string(&msg).unwrap();
        assert_eq!(json, r#"{"type":"lookup","info_hash":"abcd","limit":50}"#);

        let gossip: WireMessage = serde_json::from_str(
            r#"{"type":"gossip","info_hash":"abcd","providers":[{"addr":"1.2.3.4:5","peer_id":"","left":0,"last_seen":7}]}"#
        ).unwrap();
        match gossip {
            WireMessage::Gossip { info_hash, providers } => {
                assert_eq!(info_hash, "abcd");
                assert_eq!(providers[0].addr, "1.2.3.4:5");
            },
            _ => panic!("wrong variant"),
        }
    }

    #[tokio::test]
    async fn test_lookup_round_trip() {
        let overlay = Overlay::new(Vec::new());
        let addr = overlay.start("127.0.0.1:0").await.unwrap();

        overlay.store.announce("ih1", Provider {
            addr: "9.9.9.9:6881".to_string(),
            peer_id: "p1".to_string(),
            left: 100,
            last_seen: 0,
        });

        let providers = query_lookup(&addr.to_string(), "ih1", 50).await.unwrap();
        assert_eq!(providers.len(), 1);
        assert_eq!(providers[0].addr, "9.9.9.9:6881");

        // Unknown hash answers with an empty array.
        let none = query_lookup(&addr.to_string(), "other", 50).await.unwrap();
        assert!(none.is_empty());
        overlay.stop();
    }

    #[tokio::test]
    async fn test_announce_reaches_bootstrap() {
        let remote = Overlay::new(Vec::new());
        let remote_addr = remote.start("127.0.0.1:0").await.unwrap();

        let local = Overlay::new(vec![remote_addr.to_string()]);
        local.announce("ih1", Provider {
            addr: "7.7.7.7:1".to_string(),
            peer_id: "me".to_string(),
            left: 0,
            last_seen: 0,
        });

        // Fire-and-forget push; poll briefly for the merge to land.
        let mut found = false;
        for _ in 0..50 {
            if !remote.store.lookup("ih1", 1).is_empty() {
                found = true;
                break;
            }
            time::sleep(Duration::from_millis(20)).await;
        }
        assert!(found, "announce push never reached the bootstrap peer");
        local.stop();
        remote.stop();
    }
}
