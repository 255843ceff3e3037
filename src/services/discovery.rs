//! Agent discovery directory.
//!
//! The local registry every federation peer gossips from. TTL filtering
//! happens on read: expired records are never returned by lookups, never
//! shared in sync payloads, and are purged opportunistically.

use std::collections::HashMap;
use std::sync::Arc;
use chrono::Utc;
use tokio::sync::RwLock;
use tracing::debug;

use crate::domain::models::AgentDnsRecord;

/// Point-in-time directory statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DirectoryStats {
    pub records: usize,
    pub lookups: u64,
    pub hits: u64,
    pub expired_purged: u64,
}

struct Inner {
    records: HashMap<String, AgentDnsRecord>,
    lookups: u64,
    hits: u64,
    expired_purged: u64,
}

/// In-process DNS-style registry of agent discovery records.
#[derive(Clone)]
pub struct AgentDirectory {
    inner: Arc<RwLock<Inner>>,
}

impl Default for AgentDirectory {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentDirectory {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(Inner {
                records: HashMap::new(),
                lookups: 0,
                hits: 0,
                expired_purged: 0,
            })),
        }
    }

    /// Register a record, replacing any previous record for the agent.
    pub async fn register(&self, record: AgentDnsRecord) {
        let mut inner = self.inner.write().await;
        debug!(agent = %record.agent_id, domain = %record.domain, "record registered");
        inner.records.insert(record.agent_id.clone(), record);
    }

    /// Look up a non-expired record by agent id.
    pub async fn lookup(&self, agent_id: &str) -> Option<AgentDnsRecord> {
        let mut inner = self.inner.write().await;
        inner.lookups += 1;
        let now = Utc::now();
        let expired = inner.records.get(agent_id).map(|r| r.is_expired_at(now));
        match expired {
            Some(false) => {
                inner.hits += 1;
                inner.records.get(agent_id).cloned()
            }
            Some(true) => {
                // Expired on read: drop it.
                inner.records.remove(agent_id);
                inner.expired_purged += 1;
                None
            }
            None => None,
        }
    }

    /// Non-expired records advertising `capability`, sorted by ascending
    /// priority.
    pub async fn search(&self, capability: &str) -> Vec<AgentDnsRecord> {
        let inner = self.inner.read().await;
        let now = Utc::now();
        let mut records: Vec<AgentDnsRecord> = inner
            .records
            .values()
            .filter(|r| !r.is_expired_at(now) && r.has_capability(capability))
            .cloned()
            .collect();
        records.sort_by(|a, b| a.priority.cmp(&b.priority).then(a.agent_id.cmp(&b.agent_id)));
        records
    }

    /// Every non-expired record (the sync payload source).
    pub async fn all_records(&self) -> Vec<AgentDnsRecord> {
        let inner = self.inner.read().await;
        let now = Utc::now();
        let mut records: Vec<AgentDnsRecord> = inner
            .records
            .values()
            .filter(|r| !r.is_expired_at(now))
            .cloned()
            .collect();
        records.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        records
    }

    /// Remove a record by agent id.
    pub async fn remove(&self, agent_id: &str) -> bool {
        self.inner.write().await.records.remove(agent_id).is_some()
    }

    /// Drop every expired record and return how many were purged.
    pub async fn purge_expired(&self) -> u64 {
        let mut inner = self.inner.write().await;
        let now = Utc::now();
        let before = inner.records.len();
        inner.records.retain(|_, r| !r.is_expired_at(now));
        let purged = (before - inner.records.len()) as u64;
        inner.expired_purged += purged;
        purged
    }

    pub async fn stats(&self) -> DirectoryStats {
        let inner = self.inner.read().await;
        DirectoryStats {
            records: inner.records.len(),
            lookups: inner.lookups,
            hits: inner.hits,
            expired_purged: inner.expired_purged,
        }
    }
}
