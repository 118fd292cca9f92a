use std::{collections::HashMap, fs, io::Write, time::{SystemTime, UNIX_EPOCH}};
use serde_derive::{Deserialize, Serialize};
use crate::state::{Swarm, Tracker};

pub type Result<T> = std::result::Result<T, PersistError>;

#[derive(Debug, thiserror::Error)]
pub enum PersistError {

    #[error(transparent)]
    IoError(#[from] std::io::Error),

    #[error("json error: {0}")]
    JsonError(#[from] serde_json::Error),

}

// On-disk snapshot of the swarm state as JSON.
#[derive(Serialize, Deserialize)]
struct TrackerDisk {
    torrents: HashMap<String, Swarm>,
}

fn wall_now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

// Atomic save: write a temp file, flush, then rename over the target. The
// snapshot is taken under the shared lock so handlers keep running.
pub fn save_to_file(tracker: &Tracker) -> Result<()> {

    let path = match &tracker.data_path {
        Some(path) => path.clone(),
        None => return Ok(()),
    };
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)?;
    }

    let snapshot = TrackerDisk { torrents: tracker.swarms_snapshot() };
    let json = serde_json::to_vec_pretty(&snapshot)?;

    let tmp = path.with_extension("tmp");
    let mut file = fs::File::create(&tmp)?;
    file.write_all(&json)?;
    file.sync_all()?;
    drop(file);
    fs::rename(&tmp, &path)?;
    Ok(())
}

// Load a previous snapshot, dropping peers so old they would only
// reintroduce stale state (4x the peer timeout).
pub fn load_from_file(tracker: &Tracker) -> Result<()> {

    let path = match &tracker.data_path {
        Some(path) => path.clone(),
        None => return Ok(()),
    };
    let raw = match fs::read(&path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    let disk: TrackerDisk = serde_json::from_slice(&raw)?;

    let cutoff = wall_now_ms() - 4 * tracker.peer_timeout.as_millis() as i64;
    let mut swarms = HashMap::new();
    for (info_hash, mut swarm) in disk.torrents {
        swarm.peers.retain(|_, peer| peer.last_seen.physical >= cutoff);
        if !swarm.peers.is_empty() {
            swarms.insert(info_hash, swarm);
        }
    }

    tracing::info!("loaded {} swarms from {}", swarms.len(), path.display());
    tracker.install_swarms(swarms);
    Ok(())
}
