//! Context manager (MMU): two-tier memory with value-weighted eviction,
//! compression, and automatic promotion.
//!
//! Purely in-process; the only durability surface is
//! [`ContextManager::export_ltm`] / [`ContextManager::import_ltm`]. Every
//! operation is serialized behind one `RwLock`; retrieval takes the write
//! lock because it bumps access metadata.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tracing::debug;
use uuid::Uuid;

use crate::domain::models::{KnowledgeBlock, MemoryEntry, MemoryScope};
use crate::domain::{KernelError, KernelResult};

/// Bound on retained knowledge blocks; the oldest block is dropped when full.
const KNOWLEDGE_BLOCK_CAP: usize = 200;

/// Number of distinct keywords indexed per entry.
const KEYWORDS_PER_ENTRY: usize = 20;

/// Runtime configuration for the context manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    pub stm_capacity: usize,
    pub ltm_capacity: usize,
    /// Learning rate α of the Q-update.
    pub q_learning_rate: f64,
    /// Discount factor γ of the Q-update.
    pub q_discount_factor: f64,
    /// STM occupancy fraction that triggers compression after an insert.
    pub auto_compress_threshold: f64,
    /// Q-value at or above which an STM entry is promoted.
    pub promotion_q_threshold: f64,
    /// Whether per-entry keyword sets are maintained and used for scoring.
    pub enable_semantic_index: bool,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            stm_capacity: 100,
            ltm_capacity: 1000,
            q_learning_rate: 0.1,
            q_discount_factor: 0.95,
            auto_compress_threshold: 0.8,
            promotion_q_threshold: 0.7,
            enable_semantic_index: true,
        }
    }
}

/// Typed lifecycle events emitted by the context manager.
#[derive(Debug, Clone)]
pub enum MemoryEvent {
    Stored { id: Uuid, key: String, scope: MemoryScope },
    Updated { id: Uuid, q_value: f64 },
    Evicted { id: Uuid, key: String, scope: MemoryScope },
    Promoted { id: Uuid, key: String },
    Demoted { id: Uuid, key: String },
    Compressed { block_id: Uuid, source_count: usize },
}

/// Options for a store operation.
#[derive(Debug, Clone)]
pub struct StoreOptions {
    pub scope: MemoryScope,
    pub tags: Vec<String>,
    /// Seeds the Q-value on insert; updates importance on an existing entry.
    pub importance: Option<f64>,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            scope: MemoryScope::Stm,
            tags: Vec::new(),
            importance: None,
        }
    }
}

/// Options for a retrieve operation.
#[derive(Debug, Clone)]
pub struct RetrieveOptions {
    /// Restrict to one scope; `None` searches both.
    pub scope: Option<MemoryScope>,
    /// Entries must carry every listed tag.
    pub tags: Vec<String>,
    /// Maximum entries returned.
    pub limit: usize,
    /// Minimum composite score.
    pub min_score: f64,
}

impl Default for RetrieveOptions {
    fn default() -> Self {
        Self {
            scope: None,
            tags: Vec::new(),
            limit: 10,
            min_score: 0.0,
        }
    }
}

/// A retrieval hit with its composite score.
#[derive(Debug, Clone)]
pub struct ScoredEntry {
    pub entry: MemoryEntry,
    pub score: f64,
}

/// Point-in-time memory statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryStats {
    pub stm_size: usize,
    pub ltm_size: usize,
    pub stm_capacity: usize,
    pub ltm_capacity: usize,
    pub knowledge_blocks: usize,
    pub evictions: u64,
    pub promotions: u64,
    pub demotions: u64,
    pub compressions: u64,
}

/// Result of an LTM import.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImportSummary {
    pub imported: usize,
    /// Entries skipped because the LTM cap was reached.
    pub skipped: usize,
}

struct Inner {
    stm: HashMap<Uuid, MemoryEntry>,
    ltm: HashMap<Uuid, MemoryEntry>,
    /// `(scope, key) → id`; rewritten atomically with every move.
    key_index: HashMap<(MemoryScope, String), Uuid>,
    tag_index: HashMap<String, HashSet<Uuid>>,
    /// Per-entry keyword set (the semantic index).
    keyword_index: HashMap<Uuid, HashSet<String>>,
    blocks: VecDeque<KnowledgeBlock>,
    evictions: u64,
    promotions: u64,
    demotions: u64,
    compressions: u64,
}

impl Inner {
    fn store_for(&self, scope: MemoryScope) -> &HashMap<Uuid, MemoryEntry> {
        match scope {
            MemoryScope::Stm => &self.stm,
            MemoryScope::Ltm => &self.ltm,
        }
    }

    fn store_for_mut(&mut self, scope: MemoryScope) -> &mut HashMap<Uuid, MemoryEntry> {
        match scope {
            MemoryScope::Stm => &mut self.stm,
            MemoryScope::Ltm => &mut self.ltm,
        }
    }

    fn index_tags(&mut self, entry: &MemoryEntry) {
        for tag in &entry.tags {
            self.tag_index.entry(tag.clone()).or_default().insert(entry.id);
        }
    }

    fn unindex(&mut self, entry: &MemoryEntry) {
        self.key_index.remove(&(entry.scope, entry.key.clone()));
        for tag in &entry.tags {
            if let Some(ids) = self.tag_index.get_mut(tag) {
                ids.remove(&entry.id);
                if ids.is_empty() {
                    self.tag_index.remove(tag);
                }
            }
        }
        self.keyword_index.remove(&entry.id);
    }

    /// Remove and return the entry with the lowest Q-value in `scope`,
    /// tie-broken by oldest last access.
    fn evict_lowest(&mut self, scope: MemoryScope) -> Option<MemoryEntry> {
        let victim_id = self
            .store_for(scope)
            .values()
            .min_by(|a, b| {
                a.q_value
                    .partial_cmp(&b.q_value)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then(a.last_accessed_at.cmp(&b.last_accessed_at))
            })
            .map(|e| e.id)?;
        let entry = self.store_for_mut(scope).remove(&victim_id)?;
        self.unindex(&entry);
        self.evictions += 1;
        Some(entry)
    }
}

/// Two-tier context memory with reinforcement-style value updates.
#[derive(Clone)]
pub struct ContextManager {
    config: MemoryConfig,
    inner: Arc<RwLock<Inner>>,
    events: broadcast::Sender<MemoryEvent>,
}

impl ContextManager {
    pub fn new(config: MemoryConfig) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            config,
            inner: Arc::new(RwLock::new(Inner {
                stm: HashMap::new(),
                ltm: HashMap::new(),
                key_index: HashMap::new(),
                tag_index: HashMap::new(),
                keyword_index: HashMap::new(),
                blocks: VecDeque::new(),
                evictions: 0,
                promotions: 0,
                demotions: 0,
                compressions: 0,
            })),
            events,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(MemoryConfig::default())
    }

    /// Subscribe to memory lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<MemoryEvent> {
        self.events.subscribe()
    }

    /// Store a fact. An existing `(scope, key)` entry is updated in place;
    /// otherwise the entry is inserted, evicting the lowest-Q entry when the
    /// target store is full.
    pub async fn store(
        &self,
        key: impl Into<String>,
        value: impl Into<String>,
        options: StoreOptions,
    ) -> MemoryEntry {
        let key = key.into();
        let value = value.into();
        let scope = options.scope;

        let mut inner = self.inner.write().await;

        if let Some(&id) = inner.key_index.get(&(scope, key.clone())) {
            // Update path: no eviction, tags and keywords re-indexed.
            let old_tags = inner
                .store_for(scope)
                .get(&id)
                .map(|e| e.tags.clone())
                .unwrap_or_default();
            for tag in &old_tags {
                if let Some(ids) = inner.tag_index.get_mut(tag) {
                    ids.remove(&id);
                    if ids.is_empty() {
                        inner.tag_index.remove(tag);
                    }
                }
            }
            let keywords = self.keywords_of(&key, &value);
            let updated = inner.store_for_mut(scope).get_mut(&id).map(|entry| {
                entry.value = value.clone();
                entry.tags = options.tags.clone();
                if let Some(importance) = options.importance {
                    entry.importance = importance.clamp(0.0, 1.0);
                }
                entry.record_access();
                entry.clone()
            });
            if let Some(updated) = updated {
                inner.index_tags(&updated);
                if let Some(keywords) = keywords {
                    inner.keyword_index.insert(id, keywords);
                }
                let _ = self.events.send(MemoryEvent::Updated {
                    id,
                    q_value: updated.q_value,
                });
                return updated;
            }
        }

        let capacity = match scope {
            MemoryScope::Stm => self.config.stm_capacity,
            MemoryScope::Ltm => self.config.ltm_capacity,
        };
        if inner.store_for(scope).len() >= capacity {
            if let Some(victim) = inner.evict_lowest(scope) {
                debug!(key = %victim.key, scope = %scope, "evicted lowest-value entry");
                let _ = self.events.send(MemoryEvent::Evicted {
                    id: victim.id,
                    key: victim.key,
                    scope,
                });
            }
        }

        let importance = options.importance.unwrap_or(0.5);
        let entry = MemoryEntry::new(key.clone(), value.clone(), scope, importance)
            .with_tags(options.tags);
        inner.key_index.insert((scope, key.clone()), entry.id);
        inner.index_tags(&entry);
        if let Some(keywords) = self.keywords_of(&key, &value) {
            inner.keyword_index.insert(entry.id, keywords);
        }
        inner.store_for_mut(scope).insert(entry.id, entry.clone());
        let _ = self.events.send(MemoryEvent::Stored {
            id: entry.id,
            key: entry.key.clone(),
            scope,
        });

        // STM growth is the only compression trigger.
        if scope == MemoryScope::Stm {
            let threshold =
                (self.config.auto_compress_threshold * self.config.stm_capacity as f64).ceil()
                    as usize;
            if inner.stm.len() >= threshold {
                self.compress_locked(&mut inner);
            }
        }

        entry
    }

    /// Retrieve the top entries for a query.
    ///
    /// Side effect: every returned entry has its access count incremented
    /// and its access stamp set to now.
    pub async fn retrieve(&self, query: &str, options: RetrieveOptions) -> Vec<ScoredEntry> {
        let query_words: Vec<String> = tokenize(query).collect();
        let mut inner = self.inner.write().await;

        let mut scored: Vec<(Uuid, MemoryScope, f64)> = Vec::new();
        let scopes: &[MemoryScope] = match options.scope {
            Some(MemoryScope::Stm) => &[MemoryScope::Stm],
            Some(MemoryScope::Ltm) => &[MemoryScope::Ltm],
            None => &[MemoryScope::Stm, MemoryScope::Ltm],
        };
        for &scope in scopes {
            for entry in inner.store_for(scope).values() {
                if !options.tags.iter().all(|t| entry.tags.contains(t)) {
                    continue;
                }
                let score = self.score(entry, &query_words, inner.keyword_index.get(&entry.id));
                if score >= options.min_score {
                    scored.push((entry.id, scope, score));
                }
            }
        }

        scored.sort_by(|a, b| b.2.partial_cmp(&a.2).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(options.limit);

        let mut results = Vec::with_capacity(scored.len());
        for (id, scope, score) in scored {
            if let Some(entry) = inner.store_for_mut(scope).get_mut(&id) {
                entry.record_access();
                results.push(ScoredEntry {
                    entry: entry.clone(),
                    score,
                });
            }
        }
        results
    }

    /// Apply a Bellman-style Q-update and promote the entry if it crosses
    /// the promotion threshold while in STM.
    ///
    /// ```text
    /// Q ← (1−α)·Q + α·(reward + γ·max Q over every other entry)
    /// ```
    pub async fn update_q(&self, id: Uuid, reward: f64) -> KernelResult<MemoryEntry> {
        let mut inner = self.inner.write().await;

        let scope = if inner.stm.contains_key(&id) {
            MemoryScope::Stm
        } else if inner.ltm.contains_key(&id) {
            MemoryScope::Ltm
        } else {
            return Err(KernelError::MemoryNotFound(id));
        };

        let max_q_other = inner
            .stm
            .values()
            .chain(inner.ltm.values())
            .filter(|e| e.id != id)
            .map(|e| e.q_value)
            .fold(0.0_f64, f64::max);

        let alpha = self.config.q_learning_rate;
        let gamma = self.config.q_discount_factor;
        let Some(entry) = inner.store_for_mut(scope).get_mut(&id) else {
            return Err(KernelError::MemoryNotFound(id));
        };
        let new_q = (1.0 - alpha) * entry.q_value + alpha * (reward + gamma * max_q_other);
        entry.set_q(new_q);
        let q_value = entry.q_value;
        let _ = self.events.send(MemoryEvent::Updated { id, q_value });

        if scope == MemoryScope::Stm && q_value >= self.config.promotion_q_threshold {
            self.promote_locked(&mut inner, id)?;
        }

        inner
            .stm
            .get(&id)
            .or_else(|| inner.ltm.get(&id))
            .cloned()
            .ok_or(KernelError::MemoryNotFound(id))
    }

    /// Move an STM entry to LTM.
    pub async fn promote(&self, id: Uuid) -> KernelResult<MemoryEntry> {
        let mut inner = self.inner.write().await;
        if !inner.stm.contains_key(&id) {
            return Err(KernelError::MemoryNotFound(id));
        }
        self.promote_locked(&mut inner, id)?;
        inner
            .ltm
            .get(&id)
            .cloned()
            .ok_or(KernelError::MemoryNotFound(id))
    }

    /// Move an LTM entry back to STM.
    pub async fn demote(&self, id: Uuid) -> KernelResult<MemoryEntry> {
        let mut inner = self.inner.write().await;
        if !inner.ltm.contains_key(&id) {
            return Err(KernelError::MemoryNotFound(id));
        }
        self.move_entry(&mut inner, id, MemoryScope::Ltm, MemoryScope::Stm)?;
        inner.demotions += 1;
        let entry = inner
            .stm
            .get(&id)
            .cloned()
            .ok_or(KernelError::MemoryNotFound(id))?;
        let _ = self.events.send(MemoryEvent::Demoted {
            id,
            key: entry.key.clone(),
        });
        Ok(entry)
    }

    /// Fold the bottom 30% of STM (by Q-value) into a knowledge block.
    ///
    /// Returns `None` when fewer than two entries qualify.
    pub async fn compress(&self) -> Option<KnowledgeBlock> {
        let mut inner = self.inner.write().await;
        self.compress_locked(&mut inner)
    }

    /// Get an entry by id from either store.
    pub async fn get(&self, id: Uuid) -> Option<MemoryEntry> {
        let inner = self.inner.read().await;
        inner.stm.get(&id).or_else(|| inner.ltm.get(&id)).cloned()
    }

    /// Get an entry by `(scope, key)`.
    pub async fn get_by_key(&self, scope: MemoryScope, key: &str) -> Option<MemoryEntry> {
        let inner = self.inner.read().await;
        let id = inner.key_index.get(&(scope, key.to_string()))?;
        inner.store_for(scope).get(id).cloned()
    }

    /// Retained knowledge blocks, oldest first.
    pub async fn knowledge_blocks(&self) -> Vec<KnowledgeBlock> {
        self.inner.read().await.blocks.iter().cloned().collect()
    }

    /// Export the raw LTM entry list.
    pub async fn export_ltm(&self) -> Vec<MemoryEntry> {
        let inner = self.inner.read().await;
        let mut entries: Vec<MemoryEntry> = inner.ltm.values().cloned().collect();
        entries.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        entries
    }

    /// Import entries into LTM, preserving ids. Entries past the LTM cap
    /// are skipped silently (the count is reported back).
    pub async fn import_ltm(&self, entries: Vec<MemoryEntry>) -> ImportSummary {
        let mut inner = self.inner.write().await;
        let mut imported = 0;
        let mut skipped = 0;
        for mut entry in entries {
            if inner.ltm.len() >= self.config.ltm_capacity {
                skipped += 1;
                continue;
            }
            entry.scope = MemoryScope::Ltm;
            // A same-key resident is replaced, keeping (scope, key) unique.
            if let Some(&existing) = inner.key_index.get(&(MemoryScope::Ltm, entry.key.clone())) {
                if let Some(old) = inner.ltm.remove(&existing) {
                    inner.unindex(&old);
                }
            }
            inner
                .key_index
                .insert((MemoryScope::Ltm, entry.key.clone()), entry.id);
            inner.index_tags(&entry);
            if let Some(keywords) = self.keywords_of(&entry.key, &entry.value) {
                inner.keyword_index.insert(entry.id, keywords);
            }
            inner.ltm.insert(entry.id, entry);
            imported += 1;
        }
        ImportSummary { imported, skipped }
    }

    /// Point-in-time statistics.
    pub async fn stats(&self) -> MemoryStats {
        let inner = self.inner.read().await;
        MemoryStats {
            stm_size: inner.stm.len(),
            ltm_size: inner.ltm.len(),
            stm_capacity: self.config.stm_capacity,
            ltm_capacity: self.config.ltm_capacity,
            knowledge_blocks: inner.blocks.len(),
            evictions: inner.evictions,
            promotions: inner.promotions,
            demotions: inner.demotions,
            compressions: inner.compressions,
        }
    }

    /// Composite retrieval score.
    ///
    /// ```text
    /// score = 0.4·q + 0.3·keyword_hit_rate + 0.2·recency + 0.1·frequency
    /// recency   = 1 / (1 + age_ms / 86_400_000)
    /// frequency = log2(access_count + 1) / 10
    /// ```
    fn score(
        &self,
        entry: &MemoryEntry,
        query_words: &[String],
        keywords: Option<&HashSet<String>>,
    ) -> f64 {
        let hit_rate = if query_words.is_empty() {
            0.0
        } else {
            let hits = match (self.config.enable_semantic_index, keywords) {
                (true, Some(keywords)) => query_words
                    .iter()
                    .filter(|w| keywords.contains(w.as_str()))
                    .count(),
                _ => {
                    let words: HashSet<String> =
                        tokenize(&format!("{} {}", entry.key, entry.value)).collect();
                    query_words.iter().filter(|w| words.contains(w.as_str())).count()
                }
            };
            hits as f64 / query_words.len() as f64
        };

        let age_ms = (chrono::Utc::now() - entry.last_accessed_at)
            .num_milliseconds()
            .max(0) as f64;
        let recency = 1.0 / (1.0 + age_ms / 86_400_000.0);
        let frequency = ((entry.access_count + 1) as f64).log2() / 10.0;

        0.4 * entry.q_value.clamp(0.0, 1.0) + 0.3 * hit_rate + 0.2 * recency + 0.1 * frequency
    }

    /// Top distinct keywords of an entry, when the semantic index is on.
    fn keywords_of(&self, key: &str, value: &str) -> Option<HashSet<String>> {
        if !self.config.enable_semantic_index {
            return None;
        }
        let mut keywords = HashSet::new();
        for word in tokenize(&format!("{key} {value}")) {
            keywords.insert(word);
            if keywords.len() >= KEYWORDS_PER_ENTRY {
                break;
            }
        }
        Some(keywords)
    }

    fn promote_locked(&self, inner: &mut Inner, id: Uuid) -> KernelResult<()> {
        if inner.ltm.len() >= self.config.ltm_capacity {
            if let Some(victim) = inner.evict_lowest(MemoryScope::Ltm) {
                let _ = self.events.send(MemoryEvent::Evicted {
                    id: victim.id,
                    key: victim.key,
                    scope: MemoryScope::Ltm,
                });
            }
        }
        self.move_entry(inner, id, MemoryScope::Stm, MemoryScope::Ltm)?;
        inner.promotions += 1;
        let key = inner
            .ltm
            .get(&id)
            .map(|e| e.key.clone())
            .unwrap_or_default();
        let _ = self.events.send(MemoryEvent::Promoted { id, key });
        Ok(())
    }

    /// Move an entry between stores, rewriting every index atomically with
    /// the move. The entry is owned by exactly one store at any time.
    fn move_entry(
        &self,
        inner: &mut Inner,
        id: Uuid,
        from: MemoryScope,
        to: MemoryScope,
    ) -> KernelResult<()> {
        let mut entry = inner
            .store_for_mut(from)
            .remove(&id)
            .ok_or(KernelError::MemoryNotFound(id))?;
        inner.key_index.remove(&(from, entry.key.clone()));

        // A same-key resident in the destination is evicted first.
        if let Some(&existing) = inner.key_index.get(&(to, entry.key.clone())) {
            if let Some(old) = inner.store_for_mut(to).remove(&existing) {
                inner.unindex(&old);
                inner.evictions += 1;
                let _ = self.events.send(MemoryEvent::Evicted {
                    id: old.id,
                    key: old.key,
                    scope: to,
                });
            }
        }

        entry.scope = to;
        inner.key_index.insert((to, entry.key.clone()), id);
        inner.store_for_mut(to).insert(id, entry);
        Ok(())
    }

    fn compress_locked(&self, inner: &mut Inner) -> Option<KnowledgeBlock> {
        let mut candidates: Vec<(Uuid, f64)> = inner
            .stm
            .values()
            .map(|e| (e.id, e.q_value))
            .collect();
        candidates.sort_by(|a, b| {
            a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal)
        });
        let take = ((candidates.len() as f64 * 0.3).floor() as usize).max(1);
        if take < 2 {
            return None;
        }

        let sources: Vec<MemoryEntry> = candidates
            .into_iter()
            .take(take)
            .filter_map(|(id, _)| inner.stm.remove(&id))
            .collect();
        for entry in &sources {
            inner.unindex(entry);
        }

        let block = KnowledgeBlock::from_entries(&sources);
        if inner.blocks.len() >= KNOWLEDGE_BLOCK_CAP {
            inner.blocks.pop_front();
        }
        inner.blocks.push_back(block.clone());
        inner.compressions += 1;
        let _ = self.events.send(MemoryEvent::Compressed {
            block_id: block.id,
            source_count: block.source_ids.len(),
        });
        Some(block)
    }
}

/// Lowercased words of length > 2.
fn tokenize(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split_whitespace()
        .map(|w| {
            w.trim_matches(|c: char| !c.is_alphanumeric())
                .to_lowercase()
        })
        .filter(|w| w.len() > 2)
}
