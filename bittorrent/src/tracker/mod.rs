use std::time::Duration;
use url::Url;
use crate::ID;

mod http;
pub use http::{Announced, HttpTracker, ScrapeStats};

pub type Result<T> = std::result::Result<T, TrackerError>;

// Probe deadline for the startup latency measurement.
const LATENCY_PROBE_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(thiserror::Error, Debug)]
pub enum TrackerError {

    #[error("request error: {0}")]
    ReqwestError(#[from] reqwest::Error),

    #[error("error deserializing response: {0}")]
    BencodeError(#[from] bencode::Error),

    #[error("timeout")]
    Timeout(#[from] tokio::time::error::Elapsed),

    // Scrape only works on URLs whose last path segment is "announce".
    #[error("invalid tracker url: {0}")]
    InvalidUrl(String),

    // The tracker's "failure reason"; treated as permanent.
    #[error("tracker failure: {0}")]
    Failure(String),

    #[error("tracker holds no stats for this info-hash")]
    UnknownInfoHash,

    #[error("all trackers failed, last error: {0}")]
    AllTrackersFailed(String),

}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Event {
    Started,
    Stopped,
    Completed,
}

impl std::fmt::Display for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Event::Started => write!(f, "started"),
            Event::Stopped => write!(f, "stopped"),
            Event::Completed => write!(f, "completed"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AnnounceParams {

    pub info_hash: ID,

    pub peer_id: ID,

    // Port we accept peer connections on.
    pub port: u16,

    pub uploaded: u64,

    pub downloaded: u64,

    // Bytes still needed for a complete copy.
    pub left: u64,

    pub event: Option<Event>,

    // Forwarded so trackers behind NAT setups can hand out a reachable name.
    pub hostname: Option<String>,

    // Session key, random per process.
    pub key: String,

}

impl AnnounceParams {
    // 50 peers wanted when starting, none when stopping.
    pub fn num_want(&self) -> Option<usize> {
        match self.event {
            Some(Event::Started) => Some(50),
            Some(Event::Stopped) => Some(0),
            _ => None,
        }
    }
}

// Orders the announce URLs by measured latency at startup and walks them as a
// failover list afterwards.
pub struct TrackerClient {

    trackers: Vec<HttpTracker>,

    // Index of the tracker that last answered.
    cursor: usize,

}

impl TrackerClient {

    pub fn new(urls: Vec<Url>) -> Self {
        Self {
            trackers: urls.into_iter().map(HttpTracker::new).collect(),
            cursor: 0,
        }
    }

    pub fn urls(&self) -> Vec<&Url> {
        self.trackers.iter().map(|t| &t.url).collect()
    }

    // Probe every tracker once and sort ascending by latency, failures last.
    // Measured a single time; failover afterwards just rotates the list.
    pub async fn select_by_latency(&mut self) {
        if self.trackers.len() <= 1 {
            return;
        }

        let mut measured = Vec::with_capacity(self.trackers.len());
        for tracker in self.trackers.drain(..) {
            let latency = match tracker.measure_latency(LATENCY_PROBE_TIMEOUT).await {
                Ok(latency) => {
                    tracing::info!("tracker {} responded in {:?}", tracker.url, latency);
                    latency
                },
                Err(e) => {
                    tracing::warn!("tracker {} probe failed: {}", tracker.url, e);
                    Duration::MAX
                },
            };
            measured.push((latency, tracker));
        }
        measured.sort_by_key(|(latency, _)| *latency);

        self.trackers = measured.into_iter().map(|(_, t)| t).collect();
        self.cursor = 0;
        tracing::info!("tracker failover order: {:?}", self.urls().iter().map(|u| u.as_str()).collect::<Vec<_>>());
    }

    // Announce with failover: on error rotate to the next URL, at most one
    // full pass over the list per attempt.
    pub async fn announce(&mut self, params: &AnnounceParams) -> Result<Announced> {

        let mut last_err = None;
        for i in 0..self.trackers.len() {
            let idx = (self.cursor + i) % self.trackers.len();
            match self.trackers[idx].announce(params).await {
                Ok(response) => {
                    self.cursor = idx;
                    return Ok(response);
                },
                Err(e) => {
                    tracing::warn!("announce to {} failed: {}", self.trackers[idx].url, e);
                    last_err = Some(e);
                },
            }
        }
        Err(TrackerError::AllTrackersFailed(
            last_err.map(|e| e.to_string()).unwrap_or_else(|| "no trackers".to_string()),
        ))
    }

    pub async fn scrape(&self, info_hash: ID) -> Result<ScrapeStats> {
        self.trackers
            .get(self.cursor)
            .ok_or_else(|| TrackerError::InvalidUrl("no trackers".to_string()))?
            .scrape(info_hash)
            .await
    }
}
