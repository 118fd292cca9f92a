// Two tracker instances wired together over real HTTP push replication:
// state added on one side converges onto the other, and a forged signature
// never mutates state.

use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::time;
use tracker::{router, spawn_sync_push, App, Tracker};

const IH: &str = "aa00000000000000000000000000000000000000";

fn make_app(node_id: &str, secret: &str) -> Arc<App> {
    Arc::new(App {
        tracker: Arc::new(Tracker::new(
            node_id,
            Duration::from_secs(60),
            Duration::from_secs(120),
            50,
            None,
        )),
        secret: secret.to_string(),
    })
}

async fn serve(app: Arc<App>) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(
            listener,
            router(app).into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });
    addr
}

async fn wait_until(deadline: Duration, mut check: impl FnMut() -> bool) -> bool {
    let start = time::Instant::now();
    while start.elapsed() < deadline {
        if check() {
            return true;
        }
        time::sleep(Duration::from_millis(50)).await;
    }
    false
}

#[tokio::test]
async fn test_two_trackers_converge() {

    let app1 = make_app("n1", "shared");
    let app2 = make_app("n2", "shared");
    let addr1 = serve(app1.clone()).await;
    let addr2 = serve(app2.clone()).await;

    // Push both directions at a tight interval.
    spawn_sync_push(app1.clone(), vec![addr2.to_string()], Duration::from_millis(100));
    spawn_sync_push(app2.clone(), vec![addr1.to_string()], Duration::from_millis(100));

    // A peer announces to tracker 1 only.
    app1.tracker.add_peer(IH, "peer1", "10.0.0.1", 6881, false, "h");

    let converged = wait_until(Duration::from_secs(5), || {
        app2.tracker.get_peers(IH, "", 50).len() == 1
    }).await;
    assert!(converged, "peer never replicated to tracker 2");

    // Stop on tracker 2 tombstones everywhere.
    app2.tracker.remove_peer(IH, "peer1");
    let tombstoned = wait_until(Duration::from_secs(5), || {
        app1.tracker.get_peers(IH, "", 50).is_empty()
    }).await;
    assert!(tombstoned, "tombstone never replicated back to tracker 1");
}

#[tokio::test]
async fn test_mismatched_secret_never_merges() {

    let app1 = make_app("n1", "secret-a");
    let app2 = make_app("n2", "secret-b");
    let addr2 = serve(app2.clone()).await;

    spawn_sync_push(app1.clone(), vec![addr2.to_string()], Duration::from_millis(100));
    app1.tracker.add_peer(IH, "peer1", "10.0.0.1", 6881, false, "h");

    // Give several push rounds a chance, then confirm nothing landed.
    time::sleep(Duration::from_millis(600)).await;
    assert!(app2.tracker.get_peers(IH, "", 50).is_empty());
}
