//! Integration tests for collection sync over the WebSocket transport.
//!
//! These tests start a real server and connect real clients,
//! verifying the full fetch / subscribe / reconcile pipeline.

use std::sync::Arc;

use range_core::{CollectionConfig, Ioc, NetworkAsset, SecurityEvent, Severity};
use range_sync::backend::{Backend, BackendError};
use range_sync::client::{ConnectionState, SyncClient};
use range_sync::server::{ServerConfig, SyncServer};
use range_sync::store::{CollectionStore, ReconnectPolicy, StoreError, StoreOptions, StreamState};
use range_sync::{NetworkAssetStore, RangeStores};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::time::{sleep, timeout, Duration};

/// Start a server on a free port, return the server handle and its URL.
async fn start_test_server() -> (Arc<SyncServer>, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let config = ServerConfig {
        bind_addr: format!("127.0.0.1:{port}"),
        broadcast_capacity: 64,
        heartbeat_interval_secs: 30,
    };
    let server = Arc::new(SyncServer::new(config));
    let serving = Arc::clone(&server);
    tokio::spawn(async move {
        serving.serve(listener).await.unwrap();
    });
    (server, format!("ws://127.0.0.1:{port}"))
}

fn fast_options() -> StoreOptions {
    StoreOptions {
        reconnect: ReconnectPolicy {
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(50),
            multiplier: 2.0,
            max_attempts: None,
        },
    }
}

/// Poll `check` until it holds or two seconds pass.
async fn wait_until<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    timeout(Duration::from_secs(2), async {
        while !check().await {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn test_client_connects() {
    let (server, url) = start_test_server().await;
    let client = SyncClient::connect(&url).await.unwrap();
    assert_eq!(client.state(), ConnectionState::Connected);

    wait_until(|| {
        let server = Arc::clone(&server);
        async move { server.stats().await.active_connections == 1 }
    })
    .await;
}

#[tokio::test]
async fn test_remote_crud_round_trip() {
    let (_server, url) = start_test_server().await;
    let client = SyncClient::connect(&url).await.unwrap();

    let stored = client
        .insert("iocs", json!({"value": "198.51.100.7", "custom": {"feed": "osint"}}))
        .await
        .unwrap();
    let id = stored["id"].as_str().unwrap().to_string();
    assert_eq!(stored["custom"]["feed"], "osint");

    let patched = client.patch("iocs", &id, json!({"active": true})).await.unwrap();
    assert_eq!(patched["active"], true);

    client.delete("iocs", &id).await.unwrap();
    let err = client.delete("iocs", &id).await.unwrap_err();
    assert!(matches!(err, BackendError::NotFound { .. }));
}

#[tokio::test]
async fn test_store_mirrors_remote_writes() {
    let (server, url) = start_test_server().await;
    server
        .backend()
        .insert("security_events", json!({"id": "seed", "event_type": "scan", "detected_at": "2024-01-01"}))
        .await
        .unwrap();

    let reader: Arc<dyn Backend> = Arc::new(SyncClient::connect(&url).await.unwrap());
    let writer: Arc<dyn Backend> = Arc::new(SyncClient::connect(&url).await.unwrap());

    let store: CollectionStore<SecurityEvent> =
        CollectionStore::new(reader, CollectionConfig::security_events(), fast_options());
    store.start().await.unwrap();
    assert!(store.is_loaded().await);
    assert_eq!(store.len().await, 1);

    let remote: CollectionStore<SecurityEvent> =
        CollectionStore::new(writer, CollectionConfig::security_events(), fast_options());
    let created = remote
        .add(&SecurityEvent {
            event_type: "lateral_movement".into(),
            severity: Severity::Critical,
            ..SecurityEvent::default()
        })
        .await
        .unwrap();

    wait_until(|| {
        let store = store.clone();
        let id = created.id.clone();
        async move { store.get(&id).await.is_some() }
    })
    .await;

    remote.update(&created.id, &json!({"status": "contained"})).await.unwrap();
    wait_until(|| {
        let store = store.clone();
        let id = created.id.clone();
        async move {
            store.get(&id).await.and_then(|e| e.status).as_deref() == Some("contained")
        }
    })
    .await;

    remote.remove("seed").await.unwrap();
    wait_until(|| {
        let store = store.clone();
        async move { store.len().await == 1 }
    })
    .await;

    let err = remote.remove("seed").await.unwrap_err();
    assert!(matches!(err, StoreError::Backend(BackendError::NotFound { .. })));
}

#[tokio::test]
async fn test_bounded_store_over_the_wire() {
    let (server, url) = start_test_server().await;
    let client: Arc<dyn Backend> = Arc::new(SyncClient::connect(&url).await.unwrap());
    let store: CollectionStore<Ioc> =
        CollectionStore::new(client, CollectionConfig::iocs().with_limit(2), fast_options());
    store.subscribe().await.unwrap();

    for id in ["A", "B", "C"] {
        server.backend().insert("iocs", json!({"id": id})).await.unwrap();
    }
    wait_until(|| {
        let store = store.clone();
        async move {
            let rows = store.snapshot().await;
            rows.iter().map(|r| r.id.as_str()).collect::<Vec<_>>() == ["C", "B"]
        }
    })
    .await;
}

#[tokio::test]
async fn test_store_recovers_after_connection_drop() {
    let (server, url) = start_test_server().await;
    let client = SyncClient::connect(&url).await.unwrap();
    let backend: Arc<dyn Backend> = Arc::new(client.clone());

    let store: CollectionStore<Ioc> =
        CollectionStore::new(backend, CollectionConfig::iocs(), fast_options());
    store.start().await.unwrap();

    client.disconnect();
    assert_eq!(client.state(), ConnectionState::Disconnected);
    server.backend().insert("iocs", json!({"id": "while-down"})).await.unwrap();

    // Resubscribe redials, then the resync picks up the missed row.
    wait_until(|| {
        let store = store.clone();
        async move { store.get("while-down").await.is_some() }
    })
    .await;
    wait_until(|| {
        let store = store.clone();
        async move { store.stream_state().await == StreamState::Live }
    })
    .await;
    assert!(client.is_connected());

    server.backend().insert("iocs", json!({"id": "after"})).await.unwrap();
    wait_until(|| {
        let store = store.clone();
        async move { store.len().await == 2 }
    })
    .await;
}

#[tokio::test]
async fn test_store_reports_unreachable_server() {
    let client: Arc<dyn Backend> = Arc::new(SyncClient::lazy("ws://127.0.0.1:9"));
    let options = StoreOptions {
        reconnect: ReconnectPolicy {
            max_attempts: Some(2),
            ..fast_options().reconnect
        },
    };
    let store: CollectionStore<Ioc> = CollectionStore::new(client, CollectionConfig::iocs(), options);

    assert!(store.initialize().await.is_err());
    assert!(store.is_loaded().await);
    assert!(matches!(
        store.last_error().await,
        Some(StoreError::Backend(BackendError::Unavailable(_)))
    ));
    assert!(store.subscribe().await.is_err());
    assert_eq!(store.stream_state().await, StreamState::Idle);
}

#[tokio::test]
async fn test_dashboard_bundle_over_the_wire() {
    let (server, url) = start_test_server().await;
    server
        .backend()
        .insert(
            "network_assets",
            json!({
                "id": "h1",
                "name": "host1",
                "zone": "dmz",
                "risk_score": 7.5,
                "vulnerabilities": [{"cve": "CVE-1", "severity": "high"}]
            }),
        )
        .await
        .unwrap();

    let client: Arc<dyn Backend> = Arc::new(SyncClient::connect(&url).await.unwrap());
    let stores = RangeStores::new(client);
    stores.subscribe_all().await.unwrap();
    stores.initialize_all().await.unwrap();

    stores
        .network_assets
        .add(&NetworkAsset::new("host2").with_finding("CVE-1", Severity::Critical).compromised())
        .await
        .unwrap();

    let assets: &NetworkAssetStore = &stores.network_assets;
    wait_until(|| async move { assets.len().await == 2 }).await;

    let correlation = assets.vulnerability_correlation().await;
    assert_eq!(correlation.len(), 1);
    assert_eq!(correlation[0].cve, "CVE-1");
    assert_eq!(correlation[0].severity, Severity::Critical);
    assert_eq!(correlation[0].count, 2);

    let by_zone = assets.assets_by_zone().await;
    assert_eq!(by_zone["dmz"].len(), 1);
    assert_eq!(by_zone["Unknown"].len(), 1);
    assert_eq!(assets.compromised_assets().await[0].name, "host2");

    stores.close_all().await;
}
