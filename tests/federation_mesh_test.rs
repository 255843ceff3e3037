//! Two live federation instances gossiping over real CADP endpoints.

use std::sync::Arc;

use tokio::net::TcpListener;

use cortex_kernel::adapters::http::CadpServer;
use cortex_kernel::domain::models::{AgentDnsRecord, TrustLevel};
use cortex_kernel::services::{AgentDirectory, FederationConfig, FederationService};

/// Spin up one instance: a federation service plus its CADP endpoint.
async fn spawn_instance(peer_id: &str) -> (Arc<FederationService>, String) {
    let federation = Arc::new(FederationService::new(
        FederationConfig {
            peer_id: peer_id.to_string(),
            peer_name: format!("instance-{peer_id}"),
            ..Default::default()
        },
        AgentDirectory::new(),
    ));
    let server = CadpServer::new("127.0.0.1", 0, Arc::clone(&federation));
    let router = server.build_router();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    (federation, format!("http://{addr}"))
}

#[tokio::test]
async fn handshake_carries_identity_and_capabilities() {
    let (instance_a, _url_a) = spawn_instance("peer-a").await;
    let (instance_b, url_b) = spawn_instance("peer-b").await;

    instance_b
        .directory()
        .register(AgentDnsRecord::new("b-agent", "b.example", 600).with_capability("review"))
        .await;

    let peer = instance_a.add_peer(url_b, TrustLevel::Full).await.unwrap();
    assert_eq!(peer.source_id.as_deref(), Some("peer-b"));
    assert_eq!(peer.name, "instance-peer-b");
    assert_eq!(peer.capabilities, vec!["review".to_string()]);
    assert_eq!(instance_a.stats().await.connected_peers, 1);
    drop(instance_b);
}

#[tokio::test]
async fn sync_pulls_remote_records_with_provenance() {
    let (instance_a, _url_a) = spawn_instance("peer-a").await;
    let (instance_b, url_b) = spawn_instance("peer-b").await;

    instance_b
        .directory()
        .register(AgentDnsRecord::new("b-agent", "b.example", 600).with_capability("deploy"))
        .await;
    instance_a
        .directory()
        .register(AgentDnsRecord::new("a-agent", "a.example", 600))
        .await;

    let peer = instance_a.add_peer(url_b, TrustLevel::Full).await.unwrap();
    let outcome = instance_a.sync_with_peer(peer.id).await.unwrap();
    assert_eq!(outcome.sent, 1);
    assert_eq!(outcome.merged, 1);

    let merged = instance_a.directory().lookup("b-agent").await.unwrap();
    assert_eq!(merged.federated_from(), Some("peer-b"));

    // B received A's offer but does not know A as a peer: untrusted, so the
    // record is rejected and B's registry stays clean.
    assert!(instance_b.directory().lookup("a-agent").await.is_none());
    assert_eq!(instance_b.stats().await.records_rejected, 1);
    assert_eq!(instance_b.stats().await.total_synced, 0);
}

#[tokio::test]
async fn untrusted_peer_records_never_merge_locally() {
    let (instance_a, _url_a) = spawn_instance("peer-a").await;
    let (instance_b, url_b) = spawn_instance("peer-b").await;

    instance_b
        .directory()
        .register(AgentDnsRecord::new("b-agent", "b.example", 600))
        .await;

    let peer = instance_a
        .add_peer(url_b, TrustLevel::Untrusted)
        .await
        .unwrap();
    // Health-check still succeeds against an untrusted peer.
    assert_eq!(peer.source_id.as_deref(), Some("peer-b"));

    let outcome = instance_a.sync_with_peer(peer.id).await.unwrap();
    assert_eq!(outcome.merged, 0);
    assert_eq!(outcome.rejected, 1);
    assert!(instance_a.directory().lookup("b-agent").await.is_none());
    assert_eq!(instance_a.stats().await.total_synced, 0);
}

#[tokio::test]
async fn federated_lookup_resolves_and_caches_capped() {
    let (instance_a, _url_a) = spawn_instance("peer-a").await;
    let (instance_b, url_b) = spawn_instance("peer-b").await;
    let (instance_c, url_c) = spawn_instance("peer-c").await;

    instance_b
        .directory()
        .register(AgentDnsRecord::new("far-agent", "b.example", 3600))
        .await;

    instance_a.add_peer(url_b, TrustLevel::Full).await.unwrap();
    instance_a.add_peer(url_c, TrustLevel::Full).await.unwrap();

    let record = instance_a.federated_lookup("far-agent").await.unwrap();
    assert_eq!(record.agent_id, "far-agent");
    assert_eq!(record.ttl_seconds, 300);
    assert_eq!(record.federated_from(), Some("peer-b"));

    // Cached locally now; a second lookup needs no mesh round trip.
    let cached = instance_a.directory().lookup("far-agent").await.unwrap();
    assert_eq!(cached.domain, "b.example");
    drop(instance_c);
}

#[tokio::test]
async fn federated_search_merges_mesh_results() {
    let (instance_a, _url_a) = spawn_instance("peer-a").await;
    let (instance_b, url_b) = spawn_instance("peer-b").await;

    instance_a
        .directory()
        .register(
            AgentDnsRecord::new("local-reviewer", "a.example", 600)
                .with_capability("review")
                .with_priority(7),
        )
        .await;
    instance_b
        .directory()
        .register(
            AgentDnsRecord::new("remote-reviewer", "b.example", 600)
                .with_capability("review")
                .with_priority(3),
        )
        .await;

    instance_a.add_peer(url_b, TrustLevel::Full).await.unwrap();

    let results = instance_a.federated_search("review").await;
    assert_eq!(results.len(), 2);
    assert_eq!(results[0].agent_id, "remote-reviewer");
    assert_eq!(results[1].agent_id, "local-reviewer");
}
