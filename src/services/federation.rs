//! CADP federation: a horizontal mesh of agent-discovery peers.
//!
//! Every instance holds a local [`AgentDirectory`] and swaps snapshots with
//! trusted peers on a fixed interval and on demand. Peer calls are plain
//! JSON over HTTP (`POST {peer_url}/cadp`) with a hard 10-second timeout;
//! failures mark the peer and are never propagated to lookup callers.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::stream::{FuturesUnordered, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::discovery::AgentDirectory;
use crate::domain::models::{
    AgentDnsRecord, CadpMessage, CadpMessageType, FederationPeer, PeerStatus, TrustLevel,
    META_FEDERATED_LOOKUP,
};
use crate::domain::{KernelError, KernelResult};

/// Hard deadline on any peer HTTP call.
const PEER_TIMEOUT: Duration = Duration::from_secs(10);

/// TTL cap applied to records cached by a federated lookup, in seconds.
const FEDERATED_LOOKUP_TTL_CAP: u64 = 300;

/// Runtime configuration for the federation service.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FederationConfig {
    /// This instance's peer id, announced in every message.
    pub peer_id: String,
    /// Human-readable instance name.
    pub peer_name: String,
    /// Port the CADP server adapter listens on.
    pub listen_port: u16,
    /// Periodic sync cadence.
    pub sync_interval_ms: u64,
    /// Upper bound on mesh membership.
    pub max_peers: usize,
    /// Whether local records are offered to peers.
    pub share_capabilities: bool,
    /// Whether remote records may be merged locally at all.
    pub accept_remote_agents: bool,
}

impl Default for FederationConfig {
    fn default() -> Self {
        Self {
            peer_id: Uuid::new_v4().to_string(),
            peer_name: "cortex-kernel".to_string(),
            listen_port: 9100,
            sync_interval_ms: 60_000,
            max_peers: 50,
            share_capabilities: true,
            accept_remote_agents: true,
        }
    }
}

/// Typed events emitted by the federation service.
#[derive(Debug, Clone)]
pub enum FederationEvent {
    PeerConnected { peer_id: Uuid, url: String },
    PeerDisconnected { peer_id: Uuid, url: String },
    SyncCompleted { peer_id: Uuid, merged: usize, rejected: usize },
    RecordRejected { agent_id: String, source: String },
}

/// Point-in-time federation statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FederationStats {
    pub peers: usize,
    pub connected_peers: usize,
    /// Records merged from peers over the lifetime of the service.
    pub total_synced: u64,
    /// Records refused because of trust policy or config.
    pub records_rejected: u64,
    /// Records skipped because a local record shadows them.
    pub records_shadowed: u64,
    pub lookups: u64,
    pub lookup_hits: u64,
}

/// Outcome of one peer sync.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncOutcome {
    pub sent: usize,
    pub merged: usize,
    pub rejected: usize,
    pub shadowed: usize,
}

/// Handshake payload of a `health-response`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct HealthPayload {
    #[serde(rename = "peerId")]
    peer_id: String,
    #[serde(rename = "peerName", default)]
    peer_name: String,
    #[serde(default)]
    capabilities: Vec<String>,
}

/// Record list payload of sync messages.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct SyncPayload {
    #[serde(default)]
    records: Vec<AgentDnsRecord>,
}

/// Payload of `lookup` / `lookup-response` messages.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct LookupPayload {
    #[serde(rename = "agentId", default, skip_serializing_if = "Option::is_none")]
    agent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    capability: Option<String>,
    #[serde(default)]
    found: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    records: Vec<AgentDnsRecord>,
}

struct Inner {
    peers: HashMap<Uuid, FederationPeer>,
    total_synced: u64,
    records_rejected: u64,
    records_shadowed: u64,
    lookups: u64,
    lookup_hits: u64,
}

/// Peer mesh over the local agent directory.
#[derive(Clone)]
pub struct FederationService {
    config: FederationConfig,
    directory: AgentDirectory,
    http: reqwest::Client,
    inner: Arc<RwLock<Inner>>,
    events: broadcast::Sender<FederationEvent>,
    sync_task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl FederationService {
    pub fn new(config: FederationConfig, directory: AgentDirectory) -> Self {
        let http = reqwest::Client::builder()
            .timeout(PEER_TIMEOUT)
            .build()
            .expect("reqwest client construction cannot fail with static options");
        let (events, _) = broadcast::channel(256);
        Self {
            config,
            directory,
            http,
            inner: Arc::new(RwLock::new(Inner {
                peers: HashMap::new(),
                total_synced: 0,
                records_rejected: 0,
                records_shadowed: 0,
                lookups: 0,
                lookup_hits: 0,
            })),
            events,
            sync_task: Arc::new(Mutex::new(None)),
        }
    }

    /// Subscribe to federation events.
    pub fn subscribe(&self) -> broadcast::Receiver<FederationEvent> {
        self.events.subscribe()
    }

    /// The local directory this service gossips from.
    pub fn directory(&self) -> &AgentDirectory {
        &self.directory
    }

    pub fn peer_id(&self) -> &str {
        &self.config.peer_id
    }

    /// Add a peer and perform the handshake.
    ///
    /// Refuses when the mesh is full or the URL is already a member. The
    /// peer is kept even when the handshake fails, with status
    /// `Disconnected`.
    pub async fn add_peer(
        &self,
        url: impl Into<String>,
        trust_level: TrustLevel,
    ) -> KernelResult<FederationPeer> {
        let url = url.into();
        {
            let inner = self.inner.read().await;
            if inner.peers.len() >= self.config.max_peers {
                return Err(KernelError::CapacityExceeded(format!(
                    "peer limit {} reached",
                    self.config.max_peers
                )));
            }
            if inner.peers.values().any(|p| p.url == url) {
                return Err(KernelError::ValidationFailed(format!(
                    "peer with URL {url} already exists"
                )));
            }
        }

        let mut peer = FederationPeer::new(url.clone(), trust_level);
        let check = CadpMessage::new(
            CadpMessageType::HealthCheck,
            self.config.peer_id.clone(),
            json!({}),
        );
        match self.send_to_peer(&url, &check).await {
            Ok(response) if response.message_type == CadpMessageType::HealthResponse => {
                let payload: HealthPayload =
                    serde_json::from_value(response.payload).unwrap_or_default();
                peer.source_id = Some(payload.peer_id);
                peer.name = payload.peer_name;
                peer.capabilities = payload.capabilities;
                peer.status = PeerStatus::Connected;
                let _ = self.events.send(FederationEvent::PeerConnected {
                    peer_id: peer.id,
                    url: url.clone(),
                });
                info!(peer = %url, "peer connected");
            }
            Ok(response) => {
                warn!(peer = %url, message_type = ?response.message_type, "unexpected handshake reply");
                peer.status = PeerStatus::Disconnected;
            }
            Err(e) => {
                warn!(peer = %url, error = %e, "handshake failed");
                peer.status = PeerStatus::Disconnected;
                let _ = self.events.send(FederationEvent::PeerDisconnected {
                    peer_id: peer.id,
                    url: url.clone(),
                });
            }
        }

        let mut inner = self.inner.write().await;
        inner.peers.insert(peer.id, peer.clone());
        Ok(peer)
    }

    /// Remove a peer by local id.
    pub async fn remove_peer(&self, peer_id: Uuid) -> bool {
        self.inner.write().await.peers.remove(&peer_id).is_some()
    }

    /// Every known peer.
    pub async fn get_peers(&self) -> Vec<FederationPeer> {
        let inner = self.inner.read().await;
        let mut peers: Vec<FederationPeer> = inner.peers.values().cloned().collect();
        peers.sort_by(|a, b| a.id.cmp(&b.id));
        peers
    }

    /// Find a peer by either its local id or its self-reported id. The
    /// local id is authoritative; no second entry is ever created.
    pub async fn find_peer_by_source_id(&self, source_id: &str) -> Option<FederationPeer> {
        let inner = self.inner.read().await;
        if let Ok(local) = Uuid::parse_str(source_id) {
            if let Some(peer) = inner.peers.get(&local) {
                return Some(peer.clone());
            }
        }
        inner
            .peers
            .values()
            .find(|p| p.source_id.as_deref() == Some(source_id))
            .cloned()
    }

    /// Exchange snapshots with one peer.
    pub async fn sync_with_peer(&self, peer_id: Uuid) -> KernelResult<SyncOutcome> {
        let peer = {
            let mut inner = self.inner.write().await;
            let peer = inner
                .peers
                .get_mut(&peer_id)
                .ok_or_else(|| KernelError::PeerNotFound(peer_id.to_string()))?;
            peer.status = PeerStatus::Syncing;
            peer.clone()
        };

        let local_records = if self.config.share_capabilities {
            self.directory.all_records().await
        } else {
            Vec::new()
        };
        let sent = local_records.len();

        let request = CadpMessage::new(
            CadpMessageType::SyncRequest,
            self.config.peer_id.clone(),
            serde_json::to_value(SyncPayload { records: local_records })?,
        );

        let response = match self.send_to_peer(&peer.url, &request).await {
            Ok(response) if response.message_type == CadpMessageType::SyncResponse => response,
            Ok(response) => {
                self.mark_peer(peer_id, PeerStatus::Error).await;
                return Err(KernelError::PeerUnreachable(format!(
                    "unexpected sync reply {:?} from {}",
                    response.message_type, peer.url
                )));
            }
            Err(e) => {
                self.mark_peer(peer_id, PeerStatus::Error).await;
                return Err(e);
            }
        };

        let payload: SyncPayload = serde_json::from_value(response.payload).unwrap_or_default();
        let marker = peer
            .source_id
            .clone()
            .unwrap_or_else(|| peer.id.to_string());
        let outcome = self
            .merge_remote_records(payload.records, peer.trust_level, &marker)
            .await;

        {
            let mut inner = self.inner.write().await;
            if let Some(peer) = inner.peers.get_mut(&peer_id) {
                peer.status = PeerStatus::Connected;
                peer.last_sync_at = Some(Utc::now());
            }
        }
        let _ = self.events.send(FederationEvent::SyncCompleted {
            peer_id,
            merged: outcome.merged,
            rejected: outcome.rejected,
        });
        debug!(peer = %peer.url, merged = outcome.merged, "sync completed");
        Ok(SyncOutcome { sent, ..outcome })
    }

    /// Sync with every connected peer; failures only mark peer status.
    pub async fn sync_all(&self) {
        let peer_ids: Vec<Uuid> = {
            let inner = self.inner.read().await;
            inner
                .peers
                .values()
                .filter(|p| p.status == PeerStatus::Connected)
                .map(|p| p.id)
                .collect()
        };
        for peer_id in peer_ids {
            if let Err(e) = self.sync_with_peer(peer_id).await {
                warn!(peer_id = %peer_id, error = %e, "peer sync failed");
            }
        }
    }

    /// Resolve an agent, racing the mesh when it is not local.
    ///
    /// The first peer answering `found: true` wins; its record is cached
    /// locally with a capped TTL. Peer errors count as misses and are never
    /// propagated.
    pub async fn federated_lookup(&self, agent_id: &str) -> Option<AgentDnsRecord> {
        {
            let mut inner = self.inner.write().await;
            inner.lookups += 1;
        }
        if let Some(local) = self.directory.lookup(agent_id).await {
            let mut inner = self.inner.write().await;
            inner.lookup_hits += 1;
            return Some(local);
        }

        let peers: Vec<FederationPeer> = {
            let inner = self.inner.read().await;
            inner
                .peers
                .values()
                .filter(|p| p.status == PeerStatus::Connected)
                .cloned()
                .collect()
        };
        if peers.is_empty() {
            return None;
        }

        let mut in_flight: FuturesUnordered<_> = peers
            .into_iter()
            .map(|peer| {
                let service = self.clone();
                let agent_id = agent_id.to_string();
                async move {
                    let message = CadpMessage::new(
                        CadpMessageType::Lookup,
                        service.config.peer_id.clone(),
                        json!({ "agentId": agent_id }),
                    );
                    match service.send_to_peer(&peer.url, &message).await {
                        Ok(reply) if reply.message_type == CadpMessageType::LookupResponse => {
                            let payload: LookupPayload =
                                serde_json::from_value(reply.payload).unwrap_or_default();
                            if payload.found {
                                payload.records.into_iter().next().map(|r| (peer, r))
                            } else {
                                None
                            }
                        }
                        Ok(_) => None,
                        Err(e) => {
                            debug!(peer = %peer.url, error = %e, "federated lookup peer failed");
                            service.mark_peer(peer.id, PeerStatus::Error).await;
                            None
                        }
                    }
                }
            })
            .collect();

        while let Some(result) = in_flight.next().await {
            if let Some((peer, mut record)) = result {
                let marker = peer.source_id.clone().unwrap_or_else(|| peer.id.to_string());
                let capped_ttl = record.ttl_seconds.min(FEDERATED_LOOKUP_TTL_CAP);
                // Cache lifetime is anchored at merge time, not at the
                // record's original creation.
                record.created_at = Utc::now();
                record = record.with_ttl_seconds(capped_ttl);
                record.mark_federated_from(&marker);
                record
                    .metadata
                    .insert(META_FEDERATED_LOOKUP.to_string(), serde_json::json!(true));
                self.directory.register(record.clone()).await;
                let mut inner = self.inner.write().await;
                inner.lookup_hits += 1;
                return Some(record);
            }
        }
        None
    }

    /// Search the mesh for a capability, merging by agent id with local
    /// records winning, sorted by ascending priority.
    pub async fn federated_search(&self, capability: &str) -> Vec<AgentDnsRecord> {
        let mut merged: HashMap<String, AgentDnsRecord> = HashMap::new();
        for record in self.directory.search(capability).await {
            merged.insert(record.agent_id.clone(), record);
        }

        let peers: Vec<FederationPeer> = {
            let inner = self.inner.read().await;
            inner
                .peers
                .values()
                .filter(|p| p.status == PeerStatus::Connected)
                .cloned()
                .collect()
        };

        let lookups = peers.into_iter().map(|peer| {
            let service = self.clone();
            let capability = capability.to_string();
            async move {
                let message = CadpMessage::new(
                    CadpMessageType::Lookup,
                    service.config.peer_id.clone(),
                    json!({ "capability": capability }),
                );
                match service.send_to_peer(&peer.url, &message).await {
                    Ok(reply) if reply.message_type == CadpMessageType::LookupResponse => {
                        let payload: LookupPayload =
                            serde_json::from_value(reply.payload).unwrap_or_default();
                        payload.records
                    }
                    Ok(_) => Vec::new(),
                    Err(e) => {
                        debug!(peer = %peer.url, error = %e, "federated search peer failed");
                        service.mark_peer(peer.id, PeerStatus::Error).await;
                        Vec::new()
                    }
                }
            }
        });

        for records in futures::future::join_all(lookups).await {
            for record in records {
                if record.is_expired() {
                    continue;
                }
                // Local (and earlier) entries win.
                merged.entry(record.agent_id.clone()).or_insert(record);
            }
        }

        let mut results: Vec<AgentDnsRecord> = merged.into_values().collect();
        results.sort_by(|a, b| a.priority.cmp(&b.priority).then(a.agent_id.cmp(&b.agent_id)));
        results
    }

    /// Serve one inbound CADP message (the `POST /cadp` handler body).
    pub async fn handle_message(&self, message: CadpMessage) -> CadpMessage {
        match message.message_type {
            CadpMessageType::HealthCheck => {
                let capabilities = if self.config.share_capabilities {
                    let mut capabilities: Vec<String> = self
                        .directory
                        .all_records()
                        .await
                        .into_iter()
                        .flat_map(|r| r.capabilities)
                        .collect();
                    capabilities.sort();
                    capabilities.dedup();
                    capabilities
                } else {
                    Vec::new()
                };
                let payload = HealthPayload {
                    peer_id: self.config.peer_id.clone(),
                    peer_name: self.config.peer_name.clone(),
                    capabilities,
                };
                message.reply(
                    CadpMessageType::HealthResponse,
                    &self.config.peer_id,
                    serde_json::to_value(payload).unwrap_or_default(),
                )
            }
            CadpMessageType::SyncRequest => {
                // Records offered by an unknown sender get untrusted handling.
                let trust = self
                    .find_peer_by_source_id(&message.source)
                    .await
                    .map_or(TrustLevel::Untrusted, |p| p.trust_level);
                let payload: SyncPayload =
                    serde_json::from_value(message.payload.clone()).unwrap_or_default();
                let _ = self
                    .merge_remote_records(payload.records, trust, &message.source)
                    .await;

                let records = if self.config.share_capabilities {
                    self.directory.all_records().await
                } else {
                    Vec::new()
                };
                message.reply(
                    CadpMessageType::SyncResponse,
                    &self.config.peer_id,
                    serde_json::to_value(SyncPayload { records }).unwrap_or_default(),
                )
            }
            CadpMessageType::Lookup => {
                let payload: LookupPayload =
                    serde_json::from_value(message.payload.clone()).unwrap_or_default();
                let records = if let Some(agent_id) = payload.agent_id.as_deref() {
                    self.directory.lookup(agent_id).await.into_iter().collect()
                } else if let Some(capability) = payload.capability.as_deref() {
                    self.directory.search(capability).await
                } else {
                    Vec::new()
                };
                let reply = LookupPayload {
                    found: !records.is_empty(),
                    records,
                    ..Default::default()
                };
                message.reply(
                    CadpMessageType::LookupResponse,
                    &self.config.peer_id,
                    serde_json::to_value(reply).unwrap_or_default(),
                )
            }
            CadpMessageType::Announce => {
                let trust = self
                    .find_peer_by_source_id(&message.source)
                    .await
                    .map_or(TrustLevel::Untrusted, |p| p.trust_level);
                let payload: SyncPayload =
                    serde_json::from_value(message.payload.clone()).unwrap_or_default();
                let outcome = self
                    .merge_remote_records(payload.records, trust, &message.source)
                    .await;
                message.reply(
                    CadpMessageType::SyncResponse,
                    &self.config.peer_id,
                    json!({ "merged": outcome.merged }),
                )
            }
            _ => message.error_reply(
                &self.config.peer_id,
                &format!("unsupported message type {:?}", message.message_type),
            ),
        }
    }

    /// Start the periodic sync loop.
    pub async fn start_sync(&self) {
        let mut task = self.sync_task.lock().await;
        if task.is_some() {
            return;
        }
        let service = self.clone();
        let interval = Duration::from_millis(self.config.sync_interval_ms.max(1));
        *task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await; // The first tick fires immediately.
            loop {
                ticker.tick().await;
                service.sync_all().await;
            }
        }));
    }

    /// Stop the periodic sync loop.
    pub async fn stop_sync(&self) {
        if let Some(task) = self.sync_task.lock().await.take() {
            task.abort();
        }
    }

    /// Point-in-time statistics.
    pub async fn stats(&self) -> FederationStats {
        let inner = self.inner.read().await;
        FederationStats {
            peers: inner.peers.len(),
            connected_peers: inner
                .peers
                .values()
                .filter(|p| p.status == PeerStatus::Connected)
                .count(),
            total_synced: inner.total_synced,
            records_rejected: inner.records_rejected,
            records_shadowed: inner.records_shadowed,
            lookups: inner.lookups,
            lookup_hits: inner.lookup_hits,
        }
    }

    /// Merge records offered by a peer under its trust level.
    ///
    /// Untrusted (or policy-disabled) offers are counted and dropped. A
    /// non-federated local record always shadows a remote one; a federated
    /// record is only updated by the peer it came from.
    async fn merge_remote_records(
        &self,
        records: Vec<AgentDnsRecord>,
        trust: TrustLevel,
        marker: &str,
    ) -> SyncOutcome {
        let mut outcome = SyncOutcome::default();
        for mut record in records {
            if record.is_expired() {
                continue;
            }
            if !self.config.accept_remote_agents || !trust.allows_record_merge() {
                outcome.rejected += 1;
                let _ = self.events.send(FederationEvent::RecordRejected {
                    agent_id: record.agent_id.clone(),
                    source: marker.to_string(),
                });
                continue;
            }

            match self.directory.lookup(&record.agent_id).await {
                None => {
                    record.mark_federated_from(marker);
                    self.directory.register(record).await;
                    outcome.merged += 1;
                }
                Some(existing) if existing.federated_from() == Some(marker) => {
                    record.mark_federated_from(marker);
                    self.directory.register(record).await;
                    outcome.merged += 1;
                }
                Some(_) => {
                    // Shadowed by a local or differently-sourced record.
                    outcome.shadowed += 1;
                }
            }
        }

        let mut inner = self.inner.write().await;
        inner.total_synced += outcome.merged as u64;
        inner.records_rejected += outcome.rejected as u64;
        inner.records_shadowed += outcome.shadowed as u64;
        outcome
    }

    async fn mark_peer(&self, peer_id: Uuid, status: PeerStatus) {
        let mut inner = self.inner.write().await;
        if let Some(peer) = inner.peers.get_mut(&peer_id) {
            peer.status = status;
        }
    }

    /// One CADP round trip.
    async fn send_to_peer(&self, url: &str, message: &CadpMessage) -> KernelResult<CadpMessage> {
        let endpoint = format!("{}/cadp", url.trim_end_matches('/'));
        let response = self
            .http
            .post(&endpoint)
            .json(message)
            .send()
            .await?
            .error_for_status()
            .map_err(|e| KernelError::PeerUnreachable(e.to_string()))?;
        Ok(response.json::<CadpMessage>().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

    /// Mock peer answering CADP messages like a healthy remote instance.
    struct PeerResponder {
        peer_id: String,
        records: Vec<AgentDnsRecord>,
    }

    impl Respond for PeerResponder {
        fn respond(&self, request: &Request) -> ResponseTemplate {
            let message: CadpMessage = serde_json::from_slice(&request.body).unwrap();
            let reply = match message.message_type {
                CadpMessageType::HealthCheck => message.reply(
                    CadpMessageType::HealthResponse,
                    &self.peer_id,
                    json!({
                        "peerId": self.peer_id,
                        "peerName": "mock-peer",
                        "capabilities": ["review"],
                    }),
                ),
                CadpMessageType::SyncRequest => message.reply(
                    CadpMessageType::SyncResponse,
                    &self.peer_id,
                    serde_json::to_value(SyncPayload {
                        records: self.records.clone(),
                    })
                    .unwrap(),
                ),
                CadpMessageType::Lookup => {
                    let payload: LookupPayload =
                        serde_json::from_value(message.payload.clone()).unwrap_or_default();
                    let records: Vec<AgentDnsRecord> = self
                        .records
                        .iter()
                        .filter(|r| {
                            payload
                                .agent_id
                                .as_deref()
                                .map_or(true, |id| r.agent_id == id)
                        })
                        .filter(|r| {
                            payload
                                .capability
                                .as_deref()
                                .map_or(true, |c| r.has_capability(c))
                        })
                        .cloned()
                        .collect();
                    message.reply(
                        CadpMessageType::LookupResponse,
                        &self.peer_id,
                        serde_json::to_value(LookupPayload {
                            found: !records.is_empty(),
                            records,
                            ..Default::default()
                        })
                        .unwrap(),
                    )
                }
                _ => message.error_reply(&self.peer_id, "unsupported"),
            };
            ResponseTemplate::new(200).set_body_json(reply)
        }
    }

    async fn mock_peer(peer_id: &str, records: Vec<AgentDnsRecord>) -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/cadp"))
            .respond_with(PeerResponder {
                peer_id: peer_id.to_string(),
                records,
            })
            .mount(&server)
            .await;
        server
    }

    fn service() -> FederationService {
        FederationService::new(FederationConfig::default(), AgentDirectory::new())
    }

    #[tokio::test]
    async fn test_add_peer_handshake() {
        let server = mock_peer("remote-1", vec![]).await;
        let federation = service();

        let peer = federation
            .add_peer(server.uri(), TrustLevel::Full)
            .await
            .unwrap();
        assert_eq!(peer.status, PeerStatus::Connected);
        assert_eq!(peer.source_id.as_deref(), Some("remote-1"));
        assert_eq!(peer.name, "mock-peer");
        assert_eq!(peer.capabilities, vec!["review".to_string()]);
    }

    #[tokio::test]
    async fn test_add_peer_unreachable_is_kept_disconnected() {
        let federation = service();
        let peer = federation
            .add_peer("http://127.0.0.1:1/cadp-root", TrustLevel::Partial)
            .await
            .unwrap();
        assert_eq!(peer.status, PeerStatus::Disconnected);
        assert_eq!(federation.stats().await.peers, 1);
    }

    #[tokio::test]
    async fn test_add_peer_duplicate_url_refused() {
        let server = mock_peer("remote-1", vec![]).await;
        let federation = service();
        federation
            .add_peer(server.uri(), TrustLevel::Full)
            .await
            .unwrap();
        assert!(federation
            .add_peer(server.uri(), TrustLevel::Full)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_add_peer_capacity() {
        let federation = FederationService::new(
            FederationConfig {
                max_peers: 1,
                ..Default::default()
            },
            AgentDirectory::new(),
        );
        federation
            .add_peer("http://127.0.0.1:1", TrustLevel::Full)
            .await
            .unwrap();
        assert!(matches!(
            federation.add_peer("http://127.0.0.1:2", TrustLevel::Full).await,
            Err(KernelError::CapacityExceeded(_))
        ));
    }

    #[tokio::test]
    async fn test_sync_merges_remote_records() {
        let remote = AgentDnsRecord::new("remote-agent", "peer.example", 600)
            .with_capability("review");
        let server = mock_peer("remote-1", vec![remote]).await;
        let federation = service();
        let peer = federation
            .add_peer(server.uri(), TrustLevel::Full)
            .await
            .unwrap();

        let outcome = federation.sync_with_peer(peer.id).await.unwrap();
        assert_eq!(outcome.merged, 1);
        assert_eq!(outcome.rejected, 0);

        let merged = federation
            .directory()
            .lookup("remote-agent")
            .await
            .unwrap();
        assert_eq!(merged.federated_from(), Some("remote-1"));
        assert_eq!(federation.stats().await.total_synced, 1);
    }

    #[tokio::test]
    async fn test_sync_rejects_untrusted_peer_records() {
        let remote = AgentDnsRecord::new("remote-agent", "peer.example", 600);
        let server = mock_peer("remote-1", vec![remote]).await;
        let federation = service();
        let peer = federation
            .add_peer(server.uri(), TrustLevel::Untrusted)
            .await
            .unwrap();
        assert_eq!(peer.status, PeerStatus::Connected);

        let outcome = federation.sync_with_peer(peer.id).await.unwrap();
        assert_eq!(outcome.merged, 0);
        assert_eq!(outcome.rejected, 1);
        assert!(federation.directory().lookup("remote-agent").await.is_none());
        assert_eq!(federation.stats().await.total_synced, 0);
        assert_eq!(federation.stats().await.records_rejected, 1);
    }

    #[tokio::test]
    async fn test_sync_never_overwrites_local_records() {
        let remote = AgentDnsRecord::new("shared-agent", "remote.example", 600);
        let server = mock_peer("remote-1", vec![remote]).await;
        let federation = service();
        federation
            .directory()
            .register(AgentDnsRecord::new("shared-agent", "local.example", 600))
            .await;
        let peer = federation
            .add_peer(server.uri(), TrustLevel::Full)
            .await
            .unwrap();

        let outcome = federation.sync_with_peer(peer.id).await.unwrap();
        assert_eq!(outcome.merged, 0);
        assert_eq!(outcome.shadowed, 1);

        let kept = federation.directory().lookup("shared-agent").await.unwrap();
        assert_eq!(kept.domain, "local.example");
        assert!(!kept.is_federated());
    }

    #[tokio::test]
    async fn test_sync_updates_previously_federated_record() {
        let first = AgentDnsRecord::new("remote-agent", "v1.example", 600);
        let server = mock_peer("remote-1", vec![first]).await;
        let federation = service();
        let peer = federation
            .add_peer(server.uri(), TrustLevel::Full)
            .await
            .unwrap();
        federation.sync_with_peer(peer.id).await.unwrap();
        server.reset().await;
        Mock::given(method("POST"))
            .and(path("/cadp"))
            .respond_with(PeerResponder {
                peer_id: "remote-1".to_string(),
                records: vec![AgentDnsRecord::new("remote-agent", "v2.example", 600)],
            })
            .mount(&server)
            .await;

        let outcome = federation.sync_with_peer(peer.id).await.unwrap();
        assert_eq!(outcome.merged, 1);
        let updated = federation.directory().lookup("remote-agent").await.unwrap();
        assert_eq!(updated.domain, "v2.example");
    }

    #[tokio::test]
    async fn test_federated_lookup_prefers_local() {
        let federation = service();
        federation
            .directory()
            .register(AgentDnsRecord::new("agent-1", "local.example", 600))
            .await;
        let record = federation.federated_lookup("agent-1").await.unwrap();
        assert_eq!(record.domain, "local.example");
        assert_eq!(federation.stats().await.lookup_hits, 1);
    }

    #[tokio::test]
    async fn test_federated_lookup_races_mesh_and_caches() {
        let hit = AgentDnsRecord::new("far-agent", "peer.example", 6000);
        let hit_server = mock_peer("remote-hit", vec![hit]).await;
        let miss_server = mock_peer("remote-miss", vec![]).await;

        let federation = service();
        federation
            .add_peer(hit_server.uri(), TrustLevel::Full)
            .await
            .unwrap();
        federation
            .add_peer(miss_server.uri(), TrustLevel::Full)
            .await
            .unwrap();

        let record = federation.federated_lookup("far-agent").await.unwrap();
        assert_eq!(record.agent_id, "far-agent");
        // The cached TTL is capped at 300 seconds.
        assert_eq!(record.ttl_seconds, 300);
        assert_eq!(
            record.metadata.get(META_FEDERATED_LOOKUP),
            Some(&json!(true))
        );

        // Now resolvable locally without the mesh.
        let cached = federation.directory().lookup("far-agent").await.unwrap();
        assert_eq!(cached.federated_from(), Some("remote-hit"));
    }

    #[tokio::test]
    async fn test_federated_lookup_miss() {
        let miss_server = mock_peer("remote-miss", vec![]).await;
        let federation = service();
        federation
            .add_peer(miss_server.uri(), TrustLevel::Full)
            .await
            .unwrap();
        assert!(federation.federated_lookup("nobody").await.is_none());
    }

    #[tokio::test]
    async fn test_federated_search_merges_local_wins() {
        let remote_shared = AgentDnsRecord::new("shared", "remote.example", 600)
            .with_capability("review")
            .with_priority(1);
        let remote_only = AgentDnsRecord::new("remote-only", "remote.example", 600)
            .with_capability("review")
            .with_priority(9);
        let server = mock_peer("remote-1", vec![remote_shared, remote_only]).await;

        let federation = service();
        federation
            .directory()
            .register(
                AgentDnsRecord::new("shared", "local.example", 600)
                    .with_capability("review")
                    .with_priority(5),
            )
            .await;
        federation
            .add_peer(server.uri(), TrustLevel::Full)
            .await
            .unwrap();

        let results = federation.federated_search("review").await;
        assert_eq!(results.len(), 2);
        // Sorted by ascending priority; the local record for "shared" wins.
        assert_eq!(results[0].agent_id, "shared");
        assert_eq!(results[0].domain, "local.example");
        assert_eq!(results[1].agent_id, "remote-only");
    }

    #[tokio::test]
    async fn test_handle_health_check() {
        let federation = service();
        federation
            .directory()
            .register(AgentDnsRecord::new("a", "x", 600).with_capability("deploy"))
            .await;

        let request = CadpMessage::new(CadpMessageType::HealthCheck, "caller", json!({}));
        let reply = federation.handle_message(request).await;
        assert_eq!(reply.message_type, CadpMessageType::HealthResponse);
        let payload: HealthPayload = serde_json::from_value(reply.payload).unwrap();
        assert_eq!(payload.peer_id, federation.peer_id());
        assert_eq!(payload.capabilities, vec!["deploy".to_string()]);
    }

    #[tokio::test]
    async fn test_handle_sync_request_from_unknown_sender_rejects_records() {
        let federation = service();
        let offered = AgentDnsRecord::new("intruder", "x", 600);
        let request = CadpMessage::new(
            CadpMessageType::SyncRequest,
            "stranger",
            serde_json::to_value(SyncPayload { records: vec![offered] }).unwrap(),
        );

        let reply = federation.handle_message(request).await;
        assert_eq!(reply.message_type, CadpMessageType::SyncResponse);
        // Registry unchanged, rejection observable in stats.
        assert!(federation.directory().lookup("intruder").await.is_none());
        assert_eq!(federation.stats().await.records_rejected, 1);
        assert_eq!(federation.stats().await.total_synced, 0);
    }

    #[tokio::test]
    async fn test_handle_lookup_by_agent_and_capability() {
        let federation = service();
        federation
            .directory()
            .register(AgentDnsRecord::new("a", "x", 600).with_capability("deploy"))
            .await;

        let by_id = federation
            .handle_message(CadpMessage::new(
                CadpMessageType::Lookup,
                "caller",
                json!({ "agentId": "a" }),
            ))
            .await;
        let payload: LookupPayload = serde_json::from_value(by_id.payload).unwrap();
        assert!(payload.found);
        assert_eq!(payload.records.len(), 1);

        let by_capability = federation
            .handle_message(CadpMessage::new(
                CadpMessageType::Lookup,
                "caller",
                json!({ "capability": "deploy" }),
            ))
            .await;
        let payload: LookupPayload = serde_json::from_value(by_capability.payload).unwrap();
        assert!(payload.found);

        let missing = federation
            .handle_message(CadpMessage::new(
                CadpMessageType::Lookup,
                "caller",
                json!({ "agentId": "nobody" }),
            ))
            .await;
        let payload: LookupPayload = serde_json::from_value(missing.payload).unwrap();
        assert!(!payload.found);
    }

    #[tokio::test]
    async fn test_handle_unsupported_type_errors() {
        let federation = service();
        let reply = federation
            .handle_message(CadpMessage::new(
                CadpMessageType::Error,
                "caller",
                json!({}),
            ))
            .await;
        assert_eq!(reply.message_type, CadpMessageType::Error);
    }

    #[tokio::test]
    async fn test_find_peer_by_source_id_checks_both() {
        let server = mock_peer("remote-1", vec![]).await;
        let federation = service();
        let peer = federation
            .add_peer(server.uri(), TrustLevel::Full)
            .await
            .unwrap();

        let by_local = federation
            .find_peer_by_source_id(&peer.id.to_string())
            .await
            .unwrap();
        assert_eq!(by_local.id, peer.id);

        let by_source = federation.find_peer_by_source_id("remote-1").await.unwrap();
        assert_eq!(by_source.id, peer.id);

        assert!(federation.find_peer_by_source_id("unknown").await.is_none());
    }

    #[tokio::test]
    async fn test_stop_sync_aborts_loop() {
        let federation = service();
        federation.start_sync().await;
        assert!(federation.sync_task.lock().await.is_some());
        federation.stop_sync().await;
        assert!(federation.sync_task.lock().await.is_none());
    }
}
