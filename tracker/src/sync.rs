use std::{collections::HashMap, sync::Arc, time::Duration};
use axum::{body::Bytes, extract::State, http::{HeaderMap, StatusCode}, response::IntoResponse};
use serde_derive::{Deserialize, Serialize};
use tokio::{task::JoinHandle, time};
use crate::{http::App, hlc::Hlc, security, state::Peer};

pub const SIGNATURE_HEADER: &str = "x-sync-signature";

const PUSH_TIMEOUT: Duration = Duration::from_secs(10);

// Full-state push exchanged between tracker instances, tombstones included.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncMessage {

    pub from_node_id: String,

    pub timestamp: Hlc,

    // info-hash hex -> peer-id hex -> peer.
    pub swarms: HashMap<String, HashMap<String, Peer>>,

}

// Periodic push replication: serialize the whole swarm map and POST it to
// every sibling's /sync, signed. Fire-and-forget; an unreachable sibling
// simply catches up on a later round.
pub fn spawn_sync_push(app: Arc<App>, siblings: Vec<String>, interval: Duration) -> JoinHandle<()> {

    tracing::info!("sync push every {:?} to {} siblings", interval, siblings.len());
    let client = reqwest::Client::builder()
        .timeout(PUSH_TIMEOUT)
        .build()
        .unwrap_or_default();

    tokio::spawn(async move {
        let mut ticker = time::interval(interval);
        ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            push_to_all(&app, &client, &siblings).await;
        }
    })
}

async fn push_to_all(app: &Arc<App>, client: &reqwest::Client, siblings: &[String]) {

    let msg = app.tracker.new_sync_message();
    let body = match serde_json::to_vec(&msg) {
        Ok(body) => body,
        Err(e) => {
            tracing::error!("sync message serialization failed: {}", e);
            return;
        },
    };
    let signature = security::sign(&app.secret, &body);

    tracing::debug!("pushing {} swarms to {} siblings", msg.swarms.len(), siblings.len());
    for sibling in siblings {
        let url = format!("http://{}/sync", sibling);
        let request = client
            .post(&url)
            .header(SIGNATURE_HEADER, signature.clone())
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body.clone());
        tokio::spawn(async move {
            match request.send().await {
                Ok(response) if response.status().is_success() => {
                    tracing::trace!("pushed to {}", url);
                },
                Ok(response) => {
                    tracing::warn!("push to {} answered {}", url, response.status());
                },
                Err(e) => {
                    tracing::warn!("push to {} failed: {}", url, e);
                },
            }
        });
    }
}

// POST /sync: verify the HMAC over the raw body, then LWW-merge. A bad
// signature is rejected before any state is touched.
pub async fn handle_sync(
    State(app): State<Arc<App>>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {

    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if !security::verify(&app.secret, &body, signature) {
        tracing::warn!("rejecting sync push with invalid signature");
        return (StatusCode::UNAUTHORIZED, "invalid signature");
    }

    let msg: SyncMessage = match serde_json::from_slice(&body) {
        Ok(msg) => msg,
        Err(e) => {
            tracing::warn!("malformed sync message: {}", e);
            return (StatusCode::BAD_REQUEST, "malformed sync message");
        },
    };

    tracing::debug!("sync from {} with {} swarms", msg.from_node_id, msg.swarms.len());
    app.tracker.merge_swarms(&msg);
    (StatusCode::OK, "OK")
}
