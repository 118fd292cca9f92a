use std::{
    collections::HashMap,
    path::PathBuf,
    sync::RwLock,
    time::Duration,
};
use serde_derive::{Deserialize, Serialize};
use crate::{hlc::Hlc, sync::SyncMessage};

// A swarm member. Tombstones (deleted=true) are retained so deletions
// propagate through replication before being physically erased.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Peer {

    pub peer_id: String,

    pub ip: String,

    pub port: u16,

    pub last_seen: Hlc,

    pub completed: bool,

    pub host_name: String,

    pub deleted: bool,

}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Swarm {
    // Keyed by peer id hex.
    pub peers: HashMap<String, Peer>,
}

// Replicated tracker state: swarms keyed by info-hash hex plus the node's
// HLC. Mutation takes the exclusive lock; snapshots for sync and persistence
// take the shared one.
pub struct Tracker {

    state: RwLock<TrackerState>,

    pub interval: Duration,

    pub peer_timeout: Duration,

    pub max_peers_resp: usize,

    pub data_path: Option<PathBuf>,

    pub node_id: String,

}

struct TrackerState {
    swarms: HashMap<String, Swarm>,
    hlc: Hlc,
}

impl Tracker {

    pub fn new(
        node_id: &str,
        interval: Duration,
        peer_timeout: Duration,
        max_peers_resp: usize,
        data_path: Option<PathBuf>,
    ) -> Self {
        Self {
            state: RwLock::new(TrackerState {
                swarms: HashMap::new(),
                hlc: Hlc::new(node_id),
            }),
            interval,
            peer_timeout,
            max_peers_resp,
            data_path,
            node_id: node_id.to_string(),
        }
    }

    // Upsert a peer on announce. A tombstoned peer announcing again is
    // resurrected.
    pub fn add_peer(
        &self,
        info_hash_hex: &str,
        peer_id_hex: &str,
        ip: &str,
        port: u16,
        completed: bool,
        host_name: &str,
    ) {
        let mut state = self.state.write().expect("tracker lock poisoned");
        state.hlc.tick();
        let stamp = state.hlc.clone();

        let swarm = state.swarms.entry(info_hash_hex.to_string()).or_default();
        let peer = swarm.peers.entry(peer_id_hex.to_string()).or_insert_with(|| Peer {
            peer_id: peer_id_hex.to_string(),
            ip: ip.to_string(),
            port,
            last_seen: stamp.clone(),
            completed: false,
            host_name: host_name.to_string(),
            deleted: false,
        });

        peer.deleted = false;
        peer.ip = ip.to_string();
        peer.host_name = host_name.to_string();
        peer.port = port;
        peer.last_seen = stamp;
        peer.completed = completed || peer.completed;
    }

    // event=stopped: mark the peer deleted rather than erasing it, so the
    // removal wins over stale state on the other trackers.
    pub fn remove_peer(&self, info_hash_hex: &str, peer_id_hex: &str) {
        let mut state = self.state.write().expect("tracker lock poisoned");
        state.hlc.tick();
        let stamp = state.hlc.clone();

        if let Some(peer) = state.swarms
            .get_mut(info_hash_hex)
            .and_then(|swarm| swarm.peers.get_mut(peer_id_hex))
        {
            peer.deleted = true;
            peer.last_seen = stamp;
        }
    }

    // Live peers of a swarm, excluding the requester, truncated to max.
    pub fn get_peers(&self, info_hash_hex: &str, exclude_peer_id_hex: &str, max: usize) -> Vec<Peer> {
        let state = self.state.read().expect("tracker lock poisoned");
        let swarm = match state.swarms.get(info_hash_hex) {
            Some(swarm) => swarm,
            None => return Vec::new(),
        };
        swarm.peers
            .iter()
            .filter(|(id, peer)| id.as_str() != exclude_peer_id_hex && !peer.deleted)
            .map(|(_, peer)| peer.clone())
            .take(max)
            .collect()
    }

    // Seeder / leecher counts, tombstones excluded.
    pub fn count_peers(&self, info_hash_hex: &str) -> (usize, usize) {
        let state = self.state.read().expect("tracker lock poisoned");
        let mut complete = 0;
        let mut incomplete = 0;
        if let Some(swarm) = state.swarms.get(info_hash_hex) {
            for peer in swarm.peers.values().filter(|p| !p.deleted) {
                if peer.completed { complete += 1 } else { incomplete += 1 }
            }
        }
        (complete, incomplete)
    }

    // Tombstone lifecycle: silent live peers become tombstones, tombstones
    // older than twice the timeout are physically erased. Returns how many
    // peers changed state.
    pub fn gc(&self) -> usize {
        let mut state = self.state.write().expect("tracker lock poisoned");
        state.hlc.tick();

        let TrackerState { swarms, hlc } = &mut *state;
        let threshold_inactive = hlc.minus(self.peer_timeout);
        let threshold_tombstone = hlc.minus(2 * self.peer_timeout);

        let mut expired = 0;
        for swarm in swarms.values_mut() {
            swarm.peers.retain(|_, peer| {
                if peer.deleted && threshold_tombstone.after(&peer.last_seen) {
                    expired += 1;
                    return false;
                }
                true
            });
            for peer in swarm.peers.values_mut() {
                if !peer.deleted && threshold_inactive.after(&peer.last_seen) {
                    peer.deleted = true;
                    peer.last_seen = hlc.clone();
                    expired += 1;
                }
            }
        }
        swarms.retain(|_, swarm| !swarm.peers.is_empty());
        expired
    }

    // Snapshot the entire state (tombstones included) into a sync message,
    // stamping it with a fresh HLC.
    pub fn new_sync_message(&self) -> SyncMessage {
        let mut state = self.state.write().expect("tracker lock poisoned");
        state.hlc.tick();

        SyncMessage {
            from_node_id: self.node_id.clone(),
            timestamp: state.hlc.clone(),
            swarms: state.swarms
                .iter()
                .map(|(info_hash, swarm)| (info_hash.clone(), swarm.peers.clone()))
                .collect(),
        }
    }

    // LWW merge with tombstone semantics. Per remote peer:
    // - unknown locally: insert verbatim, tombstone or live;
    // - remote newer and local tombstoned while remote is live: resurrect;
    // - remote newer otherwise: overwrite all fields including deleted;
    // - remote older or equal: ignore.
    pub fn merge_swarms(&self, msg: &SyncMessage) {
        let mut state = self.state.write().expect("tracker lock poisoned");
        state.hlc.observe(&msg.timestamp);

        tracing::debug!("merging {} swarms from node {}", msg.swarms.len(), msg.from_node_id);
        for (info_hash, remote_peers) in &msg.swarms {
            let swarm = state.swarms.entry(info_hash.clone()).or_default();
            for (peer_id, remote) in remote_peers {
                merge_peer(swarm, peer_id, remote);
            }
        }
    }

    // Shared-lock snapshot for persistence.
    pub(crate) fn swarms_snapshot(&self) -> HashMap<String, Swarm> {
        self.state.read().expect("tracker lock poisoned").swarms.clone()
    }

    pub(crate) fn install_swarms(&self, swarms: HashMap<String, Swarm>) {
        self.state.write().expect("tracker lock poisoned").swarms = swarms;
    }

    #[cfg(test)]
    pub(crate) fn peer(&self, info_hash_hex: &str, peer_id_hex: &str) -> Option<Peer> {
        self.state
            .read()
            .unwrap()
            .swarms
            .get(info_hash_hex)
            .and_then(|swarm| swarm.peers.get(peer_id_hex))
            .cloned()
    }
}

fn merge_peer(swarm: &mut Swarm, peer_id: &str, remote: &Peer) {

    let local = match swarm.peers.get_mut(peer_id) {
        None => {
            swarm.peers.insert(peer_id.to_string(), remote.clone());
            return;
        },
        Some(local) => local,
    };

    if !remote.last_seen.after(&local.last_seen) {
        // Local state is at least as recent.
        return;
    }

    if local.deleted && !remote.deleted {
        tracing::debug!("resurrecting peer {}", peer_id);
    }
    *local = remote.clone();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker(node_id: &str) -> Tracker {
        Tracker::new(node_id, Duration::from_secs(60), Duration::from_secs(120), 50, None)
    }

    const IH: &str = "aa00000000000000000000000000000000000000";
    const Q: &str = "bb00000000000000000000000000000000000000";

    #[test]
    fn test_announce_upsert_and_listing() {
        let t = tracker("n1");
        t.add_peer(IH, Q, "10.0.0.1", 6881, false, "hosta");
        t.add_peer(IH, "cc", "10.0.0.2", 6882, true, "hostb");

        let peers = t.get_peers(IH, Q, 50);
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].ip, "10.0.0.2");

        assert_eq!(t.count_peers(IH), (1, 1));

        // Re-announce moves the peer and keeps completed sticky.
        t.add_peer(IH, "cc", "10.0.0.3", 6883, false, "hostb");
        let peer = t.peer(IH, "cc").unwrap();
        assert_eq!(peer.ip, "10.0.0.3");
        assert!(peer.completed);
    }

    #[test]
    fn test_stop_tombstones_not_erases() {
        let t = tracker("n1");
        t.add_peer(IH, Q, "10.0.0.1", 6881, false, "h");
        t.remove_peer(IH, Q);

        let peer = t.peer(IH, Q).unwrap();
        assert!(peer.deleted);
        assert!(t.get_peers(IH, "", 50).is_empty());
        assert_eq!(t.count_peers(IH), (0, 0));
    }

    #[test]
    fn test_gc_lifecycle() {
        // Zero timeout: everything is instantly stale.
        let t = Tracker::new("n1", Duration::from_secs(60), Duration::ZERO, 50, None);
        t.add_peer(IH, Q, "10.0.0.1", 6881, false, "h");

        // First pass tombstones the silent peer.
        assert_eq!(t.gc(), 1);
        assert!(t.peer(IH, Q).unwrap().deleted);

        // Second pass erases the (now old) tombstone and drops the swarm.
        assert_eq!(t.gc(), 1);
        assert!(t.peer(IH, Q).is_none());
    }

    #[test]
    fn test_merge_insert_and_ignore_older() {
        let t1 = tracker("n1");
        let t2 = tracker("n2");

        t1.add_peer(IH, Q, "10.0.0.1", 1, false, "h");
        t2.merge_swarms(&t1.new_sync_message());
        assert_eq!(t2.peer(IH, Q).unwrap().ip, "10.0.0.1");

        // A stale copy of Q does not clobber newer local state.
        let stale = t1.new_sync_message();
        t2.add_peer(IH, Q, "10.0.0.9", 9, false, "h");
        t2.merge_swarms(&stale);
        assert_eq!(t2.peer(IH, Q).unwrap().ip, "10.0.0.9");
    }

    #[test]
    fn test_tombstone_propagates() {
        let t1 = tracker("n1");
        let t2 = tracker("n2");

        t1.add_peer(IH, Q, "10.0.0.1", 1, false, "h");
        t2.merge_swarms(&t1.new_sync_message());

        t1.remove_peer(IH, Q);
        t2.merge_swarms(&t1.new_sync_message());
        assert!(t2.peer(IH, Q).unwrap().deleted);
    }

    // S7: T2 tombstones Q, then T1 sees a fresh announce from Q. After
    // syncing both ways, both trackers report Q live with the newest stamp.
    #[test]
    fn test_lww_tombstone_resurrection() {
        let t1 = tracker("n1");
        let t2 = tracker("n2");

        // T1 learns of Q and replicates to T2.
        t1.add_peer(IH, Q, "10.0.0.1", 1, false, "h");
        t2.merge_swarms(&t1.new_sync_message());

        // T2 deletes Q (h2 > h1).
        t2.remove_peer(IH, Q);
        t1.merge_swarms(&t2.new_sync_message());
        assert!(t1.peer(IH, Q).unwrap().deleted);

        // Fresh announce reaches T1 (h3 > h2): resurrection.
        t1.add_peer(IH, Q, "10.0.0.1", 1, false, "h");
        let h3 = t1.peer(IH, Q).unwrap().last_seen.clone();

        // Sync both ways; both converge on the live peer at h3.
        t2.merge_swarms(&t1.new_sync_message());
        t1.merge_swarms(&t2.new_sync_message());

        let p1 = t1.peer(IH, Q).unwrap();
        let p2 = t2.peer(IH, Q).unwrap();
        assert!(!p1.deleted && !p2.deleted);
        assert_eq!(p1.last_seen, h3);
        assert_eq!(p2.last_seen, h3);
    }

    // Two trackers exchanging full states converge to identical swarms.
    #[test]
    fn test_bidirectional_convergence() {
        let t1 = tracker("n1");
        let t2 = tracker("n2");

        t1.add_peer(IH, "p1", "10.0.0.1", 1, false, "a");
        t2.add_peer(IH, "p2", "10.0.0.2", 2, true, "b");
        t2.remove_peer(IH, "p2");

        for _ in 0..3 {
            t2.merge_swarms(&t1.new_sync_message());
            t1.merge_swarms(&t2.new_sync_message());
        }

        let s1 = t1.swarms_snapshot();
        let s2 = t2.swarms_snapshot();
        let p = |s: &HashMap<String, Swarm>, id: &str| s[IH].peers[id].clone();
        assert_eq!(p(&s1, "p1").deleted, p(&s2, "p1").deleted);
        assert_eq!(p(&s1, "p2").deleted, p(&s2, "p2").deleted);
        assert!(p(&s1, "p2").deleted);
        assert_eq!(p(&s1, "p1").last_seen, p(&s2, "p1").last_seen);
        assert_eq!(p(&s1, "p2").last_seen, p(&s2, "p2").last_seen);
    }
}
