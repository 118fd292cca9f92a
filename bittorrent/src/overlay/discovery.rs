use std::collections::{HashSet, VecDeque};
use super::{
    node_alive, query_lookup, unix_now, Overlay, OverlayError, Provider, Result, LOOKUP_LIMIT,
};

impl Overlay {

    // Breadth-first provider discovery over the gossip mesh, bounded by a TTL
    // depth: bootstrap nodes sit at depth 0 and only nodes shallower than the
    // TTL are queried, so their replies (depth ttl) still land in the store.
    //
    // Bootstrap addresses are seeded into the store up front so they persist
    // even when unresponsive.
    pub async fn discover(&self, info_hash: &str, bootstraps: &[String], ttl: usize) -> Result<()> {

        tracing::info!("discovery for {} over {} bootstraps, ttl {}", info_hash, bootstraps.len(), ttl);

        let seeds: Vec<&String> = bootstraps.iter().filter(|b| !b.trim().is_empty()).collect();
        if seeds.is_empty() {
            return Err(OverlayError::NoProviders);
        }

        let now = unix_now();
        let mut queue: VecDeque<(String, usize)> = VecDeque::new();
        for seed in &seeds {
            self.store.merge(info_hash, vec![Provider {
                addr: seed.to_string(),
                peer_id: String::new(),
                left: 0,
                last_seen: now,
            }]);
            queue.push_back((seed.to_string(), 0));
        }

        let mut visited: HashSet<String> = HashSet::new();
        while let Some((addr, depth)) = queue.pop_front() {

            if depth >= ttl || !visited.insert(addr.clone()) {
                continue;
            }

            // Unresponsive nodes are not explored.
            if !node_alive(&addr).await {
                tracing::debug!("discovery: {} unreachable", addr);
                continue;
            }

            let providers = query_lookup(&addr, info_hash, LOOKUP_LIMIT)
                .await
                .unwrap_or_default();
            if providers.is_empty() {
                continue;
            }

            self.store.merge(info_hash, providers.clone());
            for provider in providers {
                if !provider.addr.is_empty() && !visited.contains(&provider.addr) {
                    queue.push_back((provider.addr, depth + 1));
                }
            }
        }

        if self.store.lookup(info_hash, 1).is_empty() {
            return Err(OverlayError::NoProviders);
        }
        Ok(())
    }
}
