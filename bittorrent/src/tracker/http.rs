use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    time::{Duration, Instant},
};
use bytes::Buf;
use serde::de;
use serde_derive::Deserialize;
use url::Url;
use crate::ID;
use super::{AnnounceParams, Result, TrackerError};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_INTERVAL: u64 = 1800;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScrapeStats {

    pub complete: u64,

    pub incomplete: u64,

    pub downloaded: u64,

}

#[derive(Debug)]
pub struct Announced {

    // Seconds to wait until the next regular announce.
    pub interval: Duration,

    pub peers: Vec<SocketAddr>,

    pub complete: Option<u64>,

    pub incomplete: Option<u64>,

}

pub struct HttpTracker {

    client: reqwest::Client,

    pub url: Url,

}

impl HttpTracker {

    pub fn new(url: Url) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .build()
                .unwrap_or_default(),
            url,
        }
    }

    // The query carries the raw 20-byte identifiers percent-encoded.
    fn announce_url(&self, params: &AnnounceParams) -> String {
        let mut url = format!(
            "{}?info_hash={}&peer_id={}&port={}&uploaded={}&downloaded={}&left={}&compact=1&key={}",
            self.url.as_str(),
            urlencoding::encode_binary(&params.info_hash),
            urlencoding::encode_binary(&params.peer_id),
            params.port,
            params.uploaded,
            params.downloaded,
            params.left,
            params.key,
        );
        if let Some(event) = params.event {
            url.push_str(&format!("&event={}", event));
        }
        if let Some(num_want) = params.num_want() {
            url.push_str(&format!("&numwant={}", num_want));
        }
        if let Some(hostname) = &params.hostname {
            url.push_str(&format!("&hostname={}", urlencoding::encode(hostname)));
        }
        url
    }

    pub async fn announce(&self, params: &AnnounceParams) -> Result<Announced> {

        let url = self.announce_url(params);
        tracing::debug!("announce url: {}", url);

        let raw = self.client
            .get(url)
            .send()
            .await?
            .bytes()
            .await?;

        let resp: HttpResponse = bencode::decode_bytes(&raw)?;
        tracing::debug!("announce response: {:?}", resp);

        if let Some(failure) = resp.failure_reason {
            return Err(TrackerError::Failure(failure));
        }
        if let Some(warning) = resp.warning_message {
            tracing::warn!("tracker warning: {}", warning);
        }

        // Respect the minimum interval when the tracker states one.
        let interval = resp.interval
            .unwrap_or(DEFAULT_INTERVAL)
            .max(resp.min_interval.unwrap_or(0));

        Ok(Announced {
            interval: Duration::from_secs(interval),
            peers: resp.peers,
            complete: resp.complete,
            incomplete: resp.incomplete,
        })
    }

    // Scrape is only defined when the last path segment is "announce".
    fn scrape_url(&self) -> Result<Url> {
        let path = self.url.path();
        let (head, last) = path
            .rsplit_once('/')
            .ok_or_else(|| TrackerError::InvalidUrl(self.url.to_string()))?;
        if !last.starts_with("announce") {
            return Err(TrackerError::InvalidUrl(self.url.to_string()));
        }
        let scrape_path = format!("{}/{}", head, last.replacen("announce", "scrape", 1));
        let mut url = self.url.clone();
        url.set_path(&scrape_path);
        Ok(url)
    }

    pub async fn scrape(&self, info_hash: ID) -> Result<ScrapeStats> {

        let url = format!(
            "{}?info_hash={}",
            self.scrape_url()?,
            urlencoding::encode_binary(&info_hash),
        );
        let raw = self.client
            .get(url)
            .send()
            .await?
            .bytes()
            .await?;

        // The files dictionary is keyed by the raw 20-byte info-hash, so this
        // goes through the dynamic value tree rather than a derive.
        let tree = bencode::Value::decode(&raw)?;
        let stats = tree
            .get(b"files")
            .and_then(|files| files.get(&info_hash))
            .ok_or(TrackerError::UnknownInfoHash)?;

        Ok(ScrapeStats {
            complete: stats.get(b"complete").and_then(bencode::Value::as_int).unwrap_or(0) as u64,
            incomplete: stats.get(b"incomplete").and_then(bencode::Value::as_int).unwrap_or(0) as u64,
            downloaded: stats.get(b"downloaded").and_then(bencode::Value::as_int).unwrap_or(0) as u64,
        })
    }

    // Lightweight HEAD against the tracker base, falling back to GET, timing
    // the exchange.
    pub async fn measure_latency(&self, timeout: Duration) -> Result<Duration> {

        let base = self.url.as_str().strip_suffix("/announce").unwrap_or(self.url.as_str());
        let start = Instant::now();

        let head = tokio::time::timeout(timeout, self.client.head(base).send()).await;
        match head {
            Ok(Ok(_)) => return Ok(start.elapsed()),
            Ok(Err(e)) => tracing::debug!("HEAD probe failed, retrying with GET: {}", e),
            Err(e) => return Err(e.into()),
        }

        tokio::time::timeout(timeout, self.client.get(base).send()).await??;
        Ok(start.elapsed())
    }
}

#[derive(Deserialize, Debug, Default)]
struct HttpResponse {

    // If present no other keys matter; human-readable error.
    #[serde(rename = "failure reason")]
    failure_reason: Option<String>,

    #[serde(rename = "warning message")]
    warning_message: Option<String>,

    // Seconds the client should wait between regular announces.
    interval: Option<u64>,

    #[serde(rename = "min interval")]
    min_interval: Option<u64>,

    // Seeder count.
    complete: Option<u64>,

    // Leecher count.
    incomplete: Option<u64>,

    #[serde(default)]
    #[serde(deserialize_with = "peer_deserialize")]
    peers: Vec<SocketAddr>,
}

// The tracker returns either the compact string (6 bytes per peer, IPv4 +
// big-endian port) or a list of {ip, port} dictionaries, regardless of what
// the request asked for.
fn peer_deserialize<'de, D>(deserializer: D) -> std::result::Result<Vec<SocketAddr>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    struct PeerVisitor;

    impl<'de> de::Visitor<'de> for PeerVisitor {

        type Value = Vec<SocketAddr>;

        fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
            formatter.write_str("a compact peer string or a list of dictionaries")
        }

        fn visit_bytes<E>(self, mut v: &[u8]) -> std::result::Result<Self::Value, E>
        where
            E: de::Error,
        {
            if v.len() % 6 != 0 {
                return Err(E::custom("peer string not a multiple of 6"));
            }

            let num_peers = v.len() / 6;
            let mut peers = Vec::with_capacity(num_peers);
            for _ in 0..num_peers {
                peers.push(SocketAddr::new(
                    IpAddr::V4(Ipv4Addr::from(v.get_u32())),
                    v.get_u16(),
                ));
            }
            Ok(peers)
        }

        fn visit_seq<A>(self, mut seq: A) -> std::result::Result<Self::Value, A::Error>
        where
            A: de::SeqAccess<'de>,
        {
            #[derive(Deserialize)]
            struct PeerItem {
                ip: String,
                port: u16,
            }

            let mut peers = Vec::new();
            while let Some(peer) = seq.next_element::<PeerItem>()? {
                match peer.ip.parse::<Ipv4Addr>() {
                    Ok(ip) => peers.push(SocketAddr::new(IpAddr::V4(ip), peer.port)),
                    Err(_) => continue,
                }
            }
            Ok(peers)
        }
    }

    deserializer.deserialize_any(PeerVisitor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracker::Event;

    fn params() -> AnnounceParams {
        AnnounceParams {
            info_hash: [0xff; 20],
            peer_id: *b"-JC0001-0123456789ab",
            port: 6881,
            uploaded: 0,
            downloaded: 100,
            left: 900,
            event: Some(Event::Started),
            hostname: None,
            key: "k1".to_string(),
        }
    }

    #[test]
    fn test_announce_url() {
        let tracker = HttpTracker::new(Url::parse("http://t.example/announce").unwrap());
        let url = tracker.announce_url(&params());
        assert!(url.starts_with("http://t.example/announce?info_hash="));
        // 20 bytes of 0xff percent-encoded.
        assert!(url.contains(&"%FF".repeat(20)));
        assert!(url.contains("peer_id=-JC0001-0123456789ab"));
        assert!(url.contains("&compact=1"));
        assert!(url.contains("&event=started"));
        assert!(url.contains("&numwant=50"));
        assert!(url.contains("&left=900"));
    }

    #[test]
    fn test_numwant_zero_on_stopped() {
        let mut p = params();
        p.event = Some(Event::Stopped);
        let tracker = HttpTracker::new(Url::parse("http://t.example/announce").unwrap());
        let url = tracker.announce_url(&p);
        assert!(url.contains("&event=stopped"));
        assert!(url.contains("&numwant=0"));
    }

    #[test]
    fn test_scrape_url_derivation() {
        let tracker = HttpTracker::new(Url::parse("http://t.example/announce").unwrap());
        assert_eq!(tracker.scrape_url().unwrap().as_str(), "http://t.example/scrape");

        let tracker = HttpTracker::new(Url::parse("http://t.example/x/announce.php").unwrap());
        assert_eq!(tracker.scrape_url().unwrap().as_str(), "http://t.example/x/scrape.php");

        let tracker = HttpTracker::new(Url::parse("http://t.example/a").unwrap());
        assert!(tracker.scrape_url().is_err());
    }

    #[test]
    fn test_parse_response_compact() {
        let raw = b"d8:completei9e10:incompletei1e8:intervali1800e5:peers12:\x7f\x00\x00\x01\x1a\xe1\x0a\x00\x00\x02\x1b\x39e";
        let resp: HttpResponse = bencode::decode_bytes(raw).unwrap();
        assert_eq!(resp.interval, Some(1800));
        assert_eq!(resp.complete, Some(9));
        assert_eq!(resp.incomplete, Some(1));
        assert_eq!(resp.peers, vec![
            "127.0.0.1:6881".parse().unwrap(),
            "10.0.0.2:6969".parse().unwrap(),
        ]);
    }

    #[test]
    fn test_parse_response_dictionary_model() {
        let raw = b"d8:intervali60e5:peersld2:ip9:127.0.0.14:porti6881eed2:ip7:8.8.8.84:porti51413eeee";
        let resp: HttpResponse = bencode::decode_bytes(raw).unwrap();
        assert_eq!(resp.peers, vec![
            "127.0.0.1:6881".parse().unwrap(),
            "8.8.8.8:51413".parse().unwrap(),
        ]);
    }

    #[test]
    fn test_failure_reason() {
        let raw = b"d14:failure reason15:unknown torrente";
        let resp: HttpResponse = bencode::decode_bytes(raw).unwrap();
        assert_eq!(resp.failure_reason.as_deref(), Some("unknown torrent"));
    }
}
