//! Persistence integration tests.
//!
//! Verifies:
//! - Documents survive a restart through RocksDB (checkpoint + log replay)
//! - A stale client resubmits against the recovered revision
//! - Multi-document isolation under persistence
//! - Checkpoints land on the configured interval

use flowsync_collab::auth::Identity;
use flowsync_collab::client::{ClientConfig, ConnectionState, SyncClient};
use flowsync_collab::hub::{HubConfig, SyncHub};
use flowsync_collab::server::{ServerConfig, SyncServer};
use flowsync_collab::storage::{DocumentStorage, RocksStore, StoreConfig};
use flowsync_core::graph::{self, Node};
use flowsync_core::Value;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;
use uuid::Uuid;

// ─── Helpers ─────────────────────────────────────────────────────────────────

fn open_store(path: &Path) -> Arc<RocksStore> {
    Arc::new(RocksStore::open(StoreConfig::for_testing(path)).unwrap())
}

async fn commit_nodes(hub: &SyncHub, doc_id: &str, ids: &[&str]) {
    let identity = Identity("writer".into());
    for id in ids {
        let (_, revision) = hub.snapshot(doc_id).await.unwrap();
        hub.submit(doc_id, Uuid::nil(), &identity, Uuid::new_v4(), revision, graph::add_node(id, &Node::new(*id)))
            .await
            .unwrap();
    }
}

/// RocksDB holds a directory lock until every handle is gone; a dropped
/// server may take a moment to release its connections.
async fn open_server_when_released(config: ServerConfig) -> SyncServer {
    for _ in 0..100 {
        match SyncServer::new(config.clone()) {
            Ok(server) => return server,
            Err(_) => tokio::time::sleep(Duration::from_millis(50)).await,
        }
    }
    panic!("store at {:?} never released", config.storage_path);
}

async fn wait_for_revision(client: &SyncClient, revision: u64) {
    for _ in 0..250 {
        if client.connection_state().await == ConnectionState::Synced
            && client.pending_len().await == 0
            && client.revision().await == revision
        {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("client never reached revision {revision}");
}

// ─── Hub over RocksDB ────────────────────────────────────────────────────────

#[tokio::test]
async fn test_hub_restart_recovers_document() {
    let dir = tempdir().unwrap();
    let config = HubConfig {
        checkpoint_interval: 4,
        ..HubConfig::for_testing()
    };

    let before = {
        let hub = SyncHub::new(config.clone(), open_store(dir.path()));
        commit_nodes(&hub, "flow", &["a", "b", "c", "d", "e", "f"]).await;
        hub.snapshot("flow").await.unwrap()
    };
    assert_eq!(before.1, 6);

    let store = open_store(dir.path());
    // checkpoint at 4, ops 5 and 6 replayed on load
    let (_, checkpoint) = store.load_snapshot("flow").unwrap().unwrap();
    assert_eq!(checkpoint, 4);
    assert_eq!(store.load_operations("flow", checkpoint).unwrap().len(), 2);

    let hub = SyncHub::new(config, store);
    let after = hub.snapshot("flow").await.unwrap();
    assert_eq!(after, before);

    // Log stays contiguous after recovery
    commit_nodes(&hub, "flow", &["g"]).await;
    let revisions: Vec<u64> = hub
        .operations_since("flow", 0)
        .await
        .unwrap()
        .iter()
        .map(|c| c.revision)
        .collect();
    assert_eq!(revisions, (1..=7).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_stale_submit_after_restart() {
    let dir = tempdir().unwrap();
    let identity = Identity("writer".into());

    {
        let hub = SyncHub::new(HubConfig::for_testing(), open_store(dir.path()));
        commit_nodes(&hub, "flow", &["a", "b", "c"]).await;
    }

    let hub = SyncHub::new(
        HubConfig {
            history_limit: 1,
            ..HubConfig::for_testing()
        },
        open_store(dir.path()),
    );
    // base 1: transformed against revisions 2 and 3 read back from disk
    let receipt = hub
        .submit("flow", Uuid::nil(), &identity, Uuid::new_v4(), 1, graph::add_node("late", &Node::new("late")))
        .await
        .unwrap();
    assert_eq!(receipt.revision, 4);
    assert!(receipt.conflicts.is_empty());

    let (doc, _) = hub.snapshot("flow").await.unwrap();
    assert_eq!(graph::nodes(&doc).len(), 4);
}

#[tokio::test]
async fn test_documents_isolated_on_disk() {
    let dir = tempdir().unwrap();
    {
        let hub = SyncHub::new(HubConfig::for_testing(), open_store(dir.path()));
        commit_nodes(&hub, "one", &["x"]).await;
        commit_nodes(&hub, "two", &["y", "z"]).await;
    }

    let store = open_store(dir.path());
    let mut docs = store.list_documents().unwrap();
    docs.sort();
    assert_eq!(docs, vec!["one", "two"]);

    let hub = SyncHub::new(HubConfig::for_testing(), store);
    let (one, rev_one) = hub.snapshot("one").await.unwrap();
    let (two, rev_two) = hub.snapshot("two").await.unwrap();
    assert_eq!((rev_one, rev_two), (1, 2));
    assert!(one.at(&graph::node_path("x")).is_some());
    assert!(two.at(&graph::node_path("x")).is_none());
    assert_eq!(graph::nodes(&two).len(), 2);
}

#[tokio::test]
async fn test_metadata_tracks_log() {
    let dir = tempdir().unwrap();
    let store = open_store(dir.path());
    let hub = SyncHub::new(
        HubConfig {
            checkpoint_interval: 2,
            ..HubConfig::for_testing()
        },
        store.clone(),
    );
    commit_nodes(&hub, "flow", &["a", "b", "c"]).await;

    let meta = store.load_metadata("flow").unwrap().unwrap();
    assert_eq!(meta.revision, 3);
    assert_eq!(meta.checkpoint_revision, 2);
    assert_eq!(meta.operation_count, 3);
}

// ─── Full server restart ─────────────────────────────────────────────────────

#[tokio::test]
async fn test_server_restart_keeps_client_edits() {
    let dir = tempdir().unwrap();
    let port = {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    };
    let url = format!("ws://127.0.0.1:{port}");
    let config = ServerConfig {
        storage_path: Some(dir.path().to_path_buf()),
        ..ServerConfig::for_testing(format!("127.0.0.1:{port}"))
    };

    // First run
    let server = SyncServer::new(config.clone()).unwrap();
    let running = tokio::spawn(async move { server.run().await });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut client = SyncClient::new(ClientConfig::for_testing(&url, "flow"));
    client.start();
    for id in ["a", "b", "c"] {
        client.submit(graph::add_node(id, &Node::new(id))).await.unwrap();
    }
    wait_for_revision(&client, 3).await;
    let committed: Value = client.snapshot().await;

    client.shutdown().await;
    running.abort();
    let _ = running.await;

    // Second run over the same directory
    let server = open_server_when_released(config).await;
    let hub = server.hub();
    tokio::spawn(async move { server.run().await });
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(hub.snapshot("flow").await.unwrap(), (committed.clone(), 3));

    // The old client picks up where it left off
    client.submit(graph::add_node("d", &Node::new("d"))).await.unwrap();
    client.start();
    wait_for_revision(&client, 4).await;
    let (doc, _) = hub.snapshot("flow").await.unwrap();
    assert_eq!(graph::nodes(&doc).len(), 4);
    assert_eq!(client.snapshot().await, doc);
}
