use std::{
    collections::BTreeMap,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::Arc,
};
use axum::{
    extract::{ConnectInfo, RawQuery, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use serde_bytes::ByteBuf;
use serde_derive::Serialize;
use crate::state::{Peer, Tracker};

pub struct App {

    pub tracker: Arc<Tracker>,

    // Shared secret authenticating /sync pushes.
    pub secret: String,

}

// Typed response documents, bencoded on the way out.

#[derive(Serialize)]
struct AnnounceResponse {

    complete: i64,

    incomplete: i64,

    // Seconds until the client's next regular announce.
    interval: i64,

    // Compact form: 6 bytes per peer.
    #[serde(with = "serde_bytes")]
    peers: Vec<u8>,

}

#[derive(Serialize)]
struct ScrapeResponse {
    // Keyed by the raw 20-byte info-hash.
    files: BTreeMap<ByteBuf, ScrapeEntry>,
}

#[derive(Serialize)]
struct ScrapeEntry {

    complete: i64,

    // Not tracked by this implementation.
    downloaded: i64,

    incomplete: i64,

}

#[derive(Serialize)]
struct FailureResponse {
    #[serde(rename = "failure reason")]
    failure_reason: String,
}

pub fn router(app: Arc<App>) -> Router {
    Router::new()
        .route("/announce", get(announce))
        .route("/scrape", get(scrape))
        .route("/sync", post(crate::sync::handle_sync))
        .with_state(app)
}

// GET /announce: validate, upsert (or tombstone on event=stopped), reply
// with the compact peer list excluding the requester.
async fn announce(
    State(app): State<Arc<App>>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    RawQuery(query): RawQuery,
) -> Response {

    let query = query.unwrap_or_default();

    let info_hash = match raw20(&query, "info_hash") {
        Some(info_hash) => info_hash,
        None => return failure("missing or invalid info_hash"),
    };
    let peer_id = match raw20(&query, "peer_id") {
        Some(peer_id) => peer_id,
        None => return failure("missing or invalid peer_id"),
    };

    let port = match param(&query, "port").and_then(|p| p.parse::<u16>().ok()) {
        Some(port) if port >= 1 => port,
        _ => return failure("invalid port"),
    };

    // Counters must be non-negative integers when present.
    let mut counters = [0u64; 3];
    for (i, key) in ["uploaded", "downloaded", "left"].iter().enumerate() {
        match param(&query, key) {
            Some(raw) => match raw.parse::<u64>() {
                Ok(v) => counters[i] = v,
                Err(_) => return failure("invalid counter"),
            },
            None => {},
        }
    }
    let left = counters[2];

    // Client address: optional override, otherwise the connection source.
    // IPv4 only.
    let ip = match param(&query, "ip") {
        Some(raw) => match raw.parse::<IpAddr>() {
            Ok(ip) => ip,
            Err(_) => return failure("invalid ip"),
        },
        None => remote.ip(),
    };
    let ip = match ip {
        IpAddr::V4(ip) => ip,
        IpAddr::V6(_) => return failure("ipv4 required"),
    };

    let info_hex = hex::encode(info_hash);
    let peer_hex = hex::encode(peer_id);
    let event = param(&query, "event");
    tracing::debug!(
        "announce from {} ih={} pid={} port={} event={:?}",
        ip, &info_hex[..8], &peer_hex[..8], port, event,
    );

    match event.as_deref() {
        Some("stopped") => app.tracker.remove_peer(&info_hex, &peer_hex),
        other => {
            let completed = other == Some("completed") || left == 0;
            let hostname = param(&query, "hostname").unwrap_or_else(|| ip.to_string());
            app.tracker.add_peer(&info_hex, &peer_hex, &ip.to_string(), port, completed, &hostname);
        },
    }
    if let Err(e) = crate::persist::save_to_file(&app.tracker) {
        tracing::warn!("persist failed: {}", e);
    }

    let num_want = param(&query, "numwant").and_then(|n| n.parse::<usize>().ok());
    let max = num_want
        .unwrap_or(app.tracker.max_peers_resp)
        .min(app.tracker.max_peers_resp);
    let peers = app.tracker.get_peers(&info_hex, &peer_hex, max);
    let (complete, incomplete) = app.tracker.count_peers(&info_hex);

    bencoded(StatusCode::OK, &AnnounceResponse {
        complete: complete as i64,
        incomplete: incomplete as i64,
        interval: app.tracker.interval.as_secs() as i64,
        peers: compact_peers(&peers),
    })
}

// GET /scrape: per-info-hash stats for the requested hashes. Without an
// info_hash parameter the files dictionary is empty; this implementation
// does not enumerate all torrents.
async fn scrape(State(app): State<Arc<App>>, RawQuery(query): RawQuery) -> Response {

    let query = query.unwrap_or_default();
    let mut files = BTreeMap::new();

    for info_hash in raw20_multi(&query, "info_hash") {
        let (complete, incomplete) = app.tracker.count_peers(&hex::encode(info_hash));
        files.insert(ByteBuf::from(info_hash.to_vec()), ScrapeEntry {
            complete: complete as i64,
            downloaded: 0,
            incomplete: incomplete as i64,
        });
    }

    bencoded(StatusCode::OK, &ScrapeResponse { files })
}

fn bencoded<T: serde::Serialize>(status: StatusCode, reply: &T) -> Response {
    (
        status,
        [(header::CONTENT_TYPE, "application/x-bittorrent")],
        bencode::encode_to_raw(reply).unwrap_or_default(),
    ).into_response()
}

fn failure(reason: &str) -> Response {
    tracing::debug!("announce failure: {}", reason);
    bencoded(StatusCode::BAD_REQUEST, &FailureResponse {
        failure_reason: reason.to_string(),
    })
}

// 4 IPv4 bytes + 2 big-endian port bytes per peer.
fn compact_peers(peers: &[Peer]) -> Vec<u8> {
    let mut out = Vec::with_capacity(peers.len() * 6);
    for peer in peers {
        let ip: Ipv4Addr = match peer.ip.parse() {
            Ok(ip) => ip,
            Err(_) => continue,
        };
        out.extend_from_slice(&ip.octets());
        out.extend_from_slice(&peer.port.to_be_bytes());
    }
    out
}

// Binary-safe extraction of a percent-encoded query value: the raw bytes are
// decoded without going through a UTF-8 string, since info_hash and peer_id
// are arbitrary 20-byte values.
fn raw20(query: &str, key: &str) -> Option<[u8; 20]> {
    raw20_multi(query, key).into_iter().next()
}

fn raw20_multi(query: &str, key: &str) -> Vec<[u8; 20]> {
    let mut out = Vec::new();
    for part in query.split('&') {
        let (k, v) = match part.split_once('=') {
            Some(kv) => kv,
            None => continue,
        };
        if k != key {
            continue;
        }
        let decoded = urlencoding::decode_binary(v.as_bytes());
        if let Ok(bytes) = <[u8; 20]>::try_from(decoded.as_ref()) {
            out.push(bytes);
        }
    }
    out
}

// Text parameter, percent-decoded.
fn param(query: &str, key: &str) -> Option<String> {
    for part in query.split('&') {
        if let Some((k, v)) = part.split_once('=') {
            if k == key {
                return urlencoding::decode(v).ok().map(|s| s.into_owned());
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use bencode::Value;
    use tower::util::ServiceExt;

    fn test_app() -> Arc<App> {
        Arc::new(App {
            tracker: Arc::new(Tracker::new(
                "n1",
                Duration::from_secs(60),
                Duration::from_secs(120),
                50,
                None,
            )),
            secret: "s".to_string(),
        })
    }

    fn announce_request(query: &str) -> Request<Body> {
        let mut request = Request::get(format!("/announce?{}", query))
            .body(Body::empty())
            .unwrap();
        request.extensions_mut().insert(ConnectInfo::<SocketAddr>("10.1.2.3:9999".parse().unwrap()));
        request
    }

    fn encoded_id(byte: u8) -> String {
        urlencoding::encode_binary(&[byte; 20]).into_owned()
    }

    async fn body_value(response: Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        Value::decode(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_announce_registers_and_lists_peers() {
        let app = test_app();

        // First peer announces.
        let response = router(app.clone())
            .oneshot(announce_request(&format!(
                "info_hash={}&peer_id={}&port=6881&uploaded=0&downloaded=0&left=100&compact=1",
                encoded_id(0xaa), encoded_id(0x01),
            )))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "application/x-bittorrent",
        );
        let value = body_value(response).await;
        assert_eq!(value.get(b"interval").and_then(Value::as_int), Some(60));
        // Requester is excluded from its own reply.
        assert_eq!(value.get(b"peers").and_then(Value::as_bytes), Some(&[][..]));

        // Second peer sees the first in compact form.
        let response = router(app.clone())
            .oneshot(announce_request(&format!(
                "info_hash={}&peer_id={}&port=7000&left=0",
                encoded_id(0xaa), encoded_id(0x02),
            )))
            .await
            .unwrap();
        let value = body_value(response).await;
        let peers = value.get(b"peers").and_then(Value::as_bytes).unwrap();
        assert_eq!(peers, [10, 1, 2, 3, 0x1a, 0xe1]);
        assert_eq!(value.get(b"incomplete").and_then(Value::as_int), Some(1));
        assert_eq!(value.get(b"complete").and_then(Value::as_int), Some(1));
    }

    #[tokio::test]
    async fn test_announce_validation() {
        let app = test_app();

        // Missing info_hash.
        let response = router(app.clone())
            .oneshot(announce_request(&format!("peer_id={}&port=6881", encoded_id(1))))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let value = body_value(response).await;
        assert!(value.get(b"failure reason").is_some());

        // Port out of range.
        let response = router(app.clone())
            .oneshot(announce_request(&format!(
                "info_hash={}&peer_id={}&port=0", encoded_id(0xaa), encoded_id(1),
            )))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        // Truncated info_hash.
        let response = router(app.clone())
            .oneshot(announce_request(&format!(
                "info_hash=abc&peer_id={}&port=6881", encoded_id(1),
            )))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        // Negative counter.
        let response = router(app)
            .oneshot(announce_request(&format!(
                "info_hash={}&peer_id={}&port=6881&left=-5", encoded_id(0xaa), encoded_id(1),
            )))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_stopped_tombstones_peer() {
        let app = test_app();
        let ih = encoded_id(0xaa);
        let pid = encoded_id(0x01);

        router(app.clone())
            .oneshot(announce_request(&format!("info_hash={}&peer_id={}&port=6881&left=10", ih, pid)))
            .await
            .unwrap();
        assert_eq!(app.tracker.count_peers(&hex::encode([0xaa; 20])), (0, 1));

        router(app.clone())
            .oneshot(announce_request(&format!(
                "info_hash={}&peer_id={}&port=6881&event=stopped&numwant=0", ih, pid,
            )))
            .await
            .unwrap();
        assert_eq!(app.tracker.count_peers(&hex::encode([0xaa; 20])), (0, 0));
    }

    #[tokio::test]
    async fn test_scrape_stats() {
        let app = test_app();
        app.tracker.add_peer(&hex::encode([0xaa; 20]), "01", "10.0.0.1", 6881, true, "h");
        app.tracker.add_peer(&hex::encode([0xaa; 20]), "02", "10.0.0.2", 6882, false, "h");

        let response = router(app.clone())
            .oneshot(
                Request::get(format!("/scrape?info_hash={}", encoded_id(0xaa)))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let value = body_value(response).await;
        let stats = value.get(b"files").unwrap().get(&[0xaa; 20][..]).unwrap();
        assert_eq!(stats.get(b"complete").and_then(Value::as_int), Some(1));
        assert_eq!(stats.get(b"incomplete").and_then(Value::as_int), Some(1));
        assert_eq!(stats.get(b"downloaded").and_then(Value::as_int), Some(0));

        // No info_hash parameter: empty files dictionary.
        let response = router(app)
            .oneshot(Request::get("/scrape").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let value = body_value(response).await;
        assert!(value.get(b"files").and_then(Value::as_dict).unwrap().is_empty());
    }
}
