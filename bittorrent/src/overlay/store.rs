use std::{
    collections::HashMap,
    sync::RwLock,
    time::{Duration, SystemTime, UNIX_EPOCH},
};
use serde_derive::{Deserialize, Serialize};

// A peer that announced it holds (some of) an info-hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provider {

    // "host:port" the provider accepts peer connections on.
    pub addr: String,

    pub peer_id: String,

    // Bytes the provider still needs; 0 means it seeds.
    pub left: i64,

    // Unix seconds of the last announce that reached us.
    pub last_seen: i64,

}

pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

// info_hash -> addr -> provider, with a staleness TTL applied on lookup.
pub struct ProviderStore {

    records: RwLock<HashMap<String, HashMap<String, Provider>>>,

    ttl: Duration,

}

impl ProviderStore {

    pub fn new(ttl: Duration) -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    // Upsert a provider we heard from directly; stamps last_seen now.
    pub fn announce(&self, info_hash: &str, mut provider: Provider) {
        if info_hash.is_empty() || provider.addr.is_empty() {
            return;
        }
        provider.last_seen = unix_now();
        let mut records = self.records.write().expect("overlay store poisoned");
        records
            .entry(info_hash.to_string())
            .or_default()
            .insert(provider.addr.clone(), provider);
    }

    // Gossip merge: per address the entry with the greater last_seen wins.
    pub fn merge(&self, info_hash: &str, providers: Vec<Provider>) {
        let mut records = self.records.write().expect("overlay store poisoned");
        let known = records.entry(info_hash.to_string()).or_default();
        for provider in providers {
            if provider.addr.is_empty() {
                continue;
            }
            match known.get(&provider.addr) {
                Some(existing) if existing.last_seen >= provider.last_seen => {},
                _ => { known.insert(provider.addr.clone(), provider); },
            }
        }
    }

    // Non-stale providers, most recently seen first, truncated to limit.
    pub fn lookup(&self, info_hash: &str, limit: usize) -> Vec<Provider> {
        let records = self.records.read().expect("overlay store poisoned");
        let known = match records.get(info_hash) {
            Some(known) => known,
            None => return Vec::new(),
        };

        let cutoff = unix_now() - self.ttl.as_secs() as i64;
        let mut out: Vec<Provider> = known
            .values()
            .filter(|p| p.last_seen >= cutoff)
            .cloned()
            .collect();
        out.sort_by(|a, b| b.last_seen.cmp(&a.last_seen));
        if limit > 0 {
            out.truncate(limit);
        }
        out
    }

    pub fn info_hashes(&self) -> Vec<String> {
        self.records.read().expect("overlay store poisoned").keys().cloned().collect()
    }

    pub fn providers(&self, info_hash: &str) -> Vec<Provider> {
        self.records
            .read()
            .expect("overlay store poisoned")
            .get(info_hash)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default()
    }

    // Health check support: replace the provider set with the survivors.
    pub fn replace(&self, info_hash: &str, providers: Vec<Provider>) {
        let mut records = self.records.write().expect("overlay store poisoned");
        if providers.is_empty() {
            records.remove(info_hash);
        } else {
            records.insert(
                info_hash.to_string(),
                providers.into_iter().map(|p| (p.addr.clone(), p)).collect(),
            );
        }
    }
}
