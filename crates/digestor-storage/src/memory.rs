//! In-memory [`Repository`] for tests and dry runs.
//!
//! All state lives behind one `std::sync::Mutex`. Advisory locks are a set of
//! held ids, so a second holder in the same process is refused just like a
//! second replica would be. [`InMemoryRepository::fail_next`] injects a
//! one-shot transient failure into a named operation.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use digestor_core::{
    ChannelInfo, Cluster, ClusterSummaryCacheEntry, DigestEntry, DigestRecord, DigestWindowStats,
    FactCheck, Item, ItemEvidence, RatingSample, RollingStats, ThresholdTuningLogEntry, Window,
};
use uuid::Uuid;

use super::Repository;

#[derive(Debug, Clone)]
struct StoredItem {
    item: Item,
    ready: bool,
    digested_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
struct StoredCluster {
    id: String,
    window: Window,
    topic: String,
    item_ids: Vec<String>,
}

/// A send failure recorded for a window.
#[derive(Debug, Clone, PartialEq)]
pub struct DigestErrorRecord {
    pub window: Window,
    pub chat_id: i64,
    pub error: String,
}

#[derive(Default)]
struct State {
    settings: HashMap<String, serde_json::Value>,
    held_locks: HashSet<i64>,
    items: Vec<StoredItem>,
    evidence: Vec<ItemEvidence>,
    fact_checks: Vec<FactCheck>,
    digests: Vec<DigestRecord>,
    digest_errors: Vec<DigestErrorRecord>,
    digest_stats: Vec<DigestWindowStats>,
    clusters: Vec<StoredCluster>,
    channels: BTreeMap<i64, ChannelInfo>,
    ratings: Vec<RatingSample>,
    messages: Vec<(i64, DateTime<Utc>)>,
    backlog: u64,
    tuning_log: Vec<ThresholdTuningLogEntry>,
    summary_cache: HashMap<(String, String), ClusterSummaryCacheEntry>,
    failures: HashSet<String>,
}

#[derive(Default)]
pub struct InMemoryRepository {
    state: Mutex<State>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> Result<MutexGuard<'_, State>> {
        self.state
            .lock()
            .map_err(|_| anyhow!("in-memory repository state poisoned"))
    }

    /// Lock state for `op`, failing once if a failure was injected for it.
    fn enter(&self, op: &str) -> Result<MutexGuard<'_, State>> {
        let mut state = self.state()?;
        if state.failures.remove(op) {
            bail!("injected transient failure in {op}");
        }
        Ok(state)
    }

    /// Make the next call of the named operation fail.
    pub fn fail_next(&self, op: &str) {
        if let Ok(mut state) = self.state() {
            state.failures.insert(op.to_string());
        }
    }

    pub fn insert_item(&self, item: Item) {
        self.insert_item_with_status(item, true);
    }

    /// Insert an item whose ingestion is still in progress.
    pub fn insert_pending_item(&self, item: Item) {
        self.insert_item_with_status(item, false);
    }

    fn insert_item_with_status(&self, item: Item, ready: bool) {
        if let Ok(mut state) = self.state() {
            state.items.retain(|s| s.item.id != item.id);
            state.items.push(StoredItem {
                item,
                ready,
                digested_at: None,
            });
        }
    }

    pub fn item(&self, id: &str) -> Option<Item> {
        self.state()
            .ok()?
            .items
            .iter()
            .find(|s| s.item.id == id)
            .map(|s| s.item.clone())
    }

    pub fn is_digested(&self, id: &str) -> bool {
        self.state()
            .map(|state| {
                state
                    .items
                    .iter()
                    .any(|s| s.item.id == id && s.digested_at.is_some())
            })
            .unwrap_or(false)
    }

    pub fn add_evidence(&self, evidence: ItemEvidence) {
        if let Ok(mut state) = self.state() {
            state.evidence.push(evidence);
        }
    }

    pub fn add_fact_check(&self, fact_check: FactCheck) {
        if let Ok(mut state) = self.state() {
            state.fact_checks.push(fact_check);
        }
    }

    pub fn upsert_channel(&self, channel: ChannelInfo) {
        if let Ok(mut state) = self.state() {
            state.channels.insert(channel.id, channel);
        }
    }

    pub fn channel(&self, id: i64) -> Option<ChannelInfo> {
        self.state().ok()?.channels.get(&id).cloned()
    }

    pub fn add_rating(&self, sample: RatingSample) {
        if let Ok(mut state) = self.state() {
            state.ratings.push(sample);
        }
    }

    /// Record a raw message received from a channel.
    pub fn record_message(&self, channel_id: i64, received_at: DateTime<Utc>) {
        if let Ok(mut state) = self.state() {
            state.messages.push((channel_id, received_at));
        }
    }

    pub fn set_backlog_count(&self, backlog: u64) {
        if let Ok(mut state) = self.state() {
            state.backlog = backlog;
        }
    }

    /// Simulate another replica holding a lease.
    pub fn hold_lock_externally(&self, lock_id: i64) {
        if let Ok(mut state) = self.state() {
            state.held_locks.insert(lock_id);
        }
    }

    pub fn is_lock_held(&self, lock_id: i64) -> bool {
        self.state()
            .map(|state| state.held_locks.contains(&lock_id))
            .unwrap_or(false)
    }

    pub fn digests(&self) -> Vec<DigestRecord> {
        self.state().map(|s| s.digests.clone()).unwrap_or_default()
    }

    pub fn digest_errors(&self) -> Vec<DigestErrorRecord> {
        self.state()
            .map(|s| s.digest_errors.clone())
            .unwrap_or_default()
    }

    pub fn digest_stats(&self) -> Vec<DigestWindowStats> {
        self.state()
            .map(|s| s.digest_stats.clone())
            .unwrap_or_default()
    }

    pub fn tuning_log(&self) -> Vec<ThresholdTuningLogEntry> {
        self.state()
            .map(|s| s.tuning_log.clone())
            .unwrap_or_default()
    }

    pub fn setting(&self, key: &str) -> Option<serde_json::Value> {
        self.state().ok()?.settings.get(key).cloned()
    }
}

fn window_items<'a>(state: &'a State, window: &'a Window) -> impl Iterator<Item = &'a StoredItem> {
    state
        .items
        .iter()
        .filter(move |s| window.contains(s.item.published_at))
}

fn select_items(
    state: &State,
    window: &Window,
    importance_threshold: f64,
    limit: usize,
    with_media: bool,
) -> Vec<Item> {
    let mut items = window_items(state, window)
        .filter(|s| {
            s.ready && s.digested_at.is_none() && s.item.importance_score >= importance_threshold
        })
        .map(|s| {
            let mut item = s.item.clone();
            if !with_media {
                item.media = None;
            }
            item
        })
        .collect::<Vec<_>>();
    items.sort_by(|a, b| {
        b.importance_score
            .total_cmp(&a.importance_score)
            .then(b.relevance_score.total_cmp(&a.relevance_score))
    });
    items.truncate(limit);
    items
}

#[async_trait]
impl Repository for InMemoryRepository {
    async fn get_setting(&self, key: &str) -> Result<Option<serde_json::Value>> {
        Ok(self.enter("get_setting")?.settings.get(key).cloned())
    }

    async fn set_setting(&self, key: &str, value: serde_json::Value) -> Result<()> {
        self.enter("set_setting")?
            .settings
            .insert(key.to_string(), value);
        Ok(())
    }

    async fn try_acquire_advisory_lock(&self, lock_id: i64) -> Result<bool> {
        Ok(self.enter("try_acquire_advisory_lock")?.held_locks.insert(lock_id))
    }

    async fn release_advisory_lock(&self, lock_id: i64) -> Result<()> {
        self.enter("release_advisory_lock")?
            .held_locks
            .remove(&lock_id);
        Ok(())
    }

    async fn digest_exists(&self, window: &Window) -> Result<bool> {
        Ok(self
            .enter("digest_exists")?
            .digests
            .iter()
            .any(|d| d.window_start == window.start && d.window_end == window.end))
    }

    async fn save_digest(&self, record: &DigestRecord) -> Result<Uuid> {
        let mut state = self.enter("save_digest")?;
        if let Some(existing) = state
            .digests
            .iter()
            .find(|d| d.window_start == record.window_start && d.window_end == record.window_end)
        {
            return Ok(existing.id);
        }
        state.digests.push(record.clone());
        Ok(record.id)
    }

    async fn save_digest_error(&self, window: &Window, chat_id: i64, error: &str) -> Result<()> {
        let mut state = self.enter("save_digest_error")?;
        state
            .digest_errors
            .retain(|e| !(e.window == *window && e.chat_id == chat_id));
        state.digest_errors.push(DigestErrorRecord {
            window: *window,
            chat_id,
            error: error.to_string(),
        });
        Ok(())
    }

    async fn save_digest_entries(&self, digest_id: Uuid, entries: &[DigestEntry]) -> Result<()> {
        let mut state = self.enter("save_digest_entries")?;
        let record = state
            .digests
            .iter_mut()
            .find(|d| d.id == digest_id)
            .ok_or_else(|| anyhow!("digest {digest_id} not found"))?;
        record.entries = entries.to_vec();
        Ok(())
    }

    async fn save_digest_stats(&self, stats: &DigestWindowStats) -> Result<()> {
        self.enter("save_digest_stats")?
            .digest_stats
            .push(stats.clone());
        Ok(())
    }

    async fn get_items_for_window(
        &self,
        window: &Window,
        importance_threshold: f64,
        limit: usize,
    ) -> Result<Vec<Item>> {
        let state = self.enter("get_items_for_window")?;
        Ok(select_items(&state, window, importance_threshold, limit, false))
    }

    async fn get_items_for_window_with_media(
        &self,
        window: &Window,
        importance_threshold: f64,
        limit: usize,
    ) -> Result<Vec<Item>> {
        let state = self.enter("get_items_for_window_with_media")?;
        Ok(select_items(&state, window, importance_threshold, limit, true))
    }

    async fn count_items_in_window(&self, window: &Window) -> Result<u64> {
        let state = self.enter("count_items_in_window")?;
        Ok(window_items(&state, window).count() as u64)
    }

    async fn count_ready_items_in_window(&self, window: &Window) -> Result<u64> {
        let state = self.enter("count_ready_items_in_window")?;
        Ok(window_items(&state, window).filter(|s| s.ready).count() as u64)
    }

    async fn get_backlog_count(&self) -> Result<u64> {
        Ok(self.enter("get_backlog_count")?.backlog)
    }

    async fn mark_items_as_digested(&self, item_ids: &[String], at: DateTime<Utc>) -> Result<()> {
        let mut state = self.enter("mark_items_as_digested")?;
        for stored in state.items.iter_mut() {
            if item_ids.contains(&stored.item.id) {
                stored.digested_at = Some(at);
            }
        }
        Ok(())
    }

    async fn update_item_importance(&self, updates: &[(String, f64)]) -> Result<()> {
        let mut state = self.enter("update_item_importance")?;
        for (id, score) in updates {
            if let Some(stored) = state.items.iter_mut().find(|s| &s.item.id == id) {
                stored.item.importance_score = *score;
            }
        }
        Ok(())
    }

    async fn get_evidence_for_items(&self, item_ids: &[String]) -> Result<Vec<ItemEvidence>> {
        Ok(self
            .enter("get_evidence_for_items")?
            .evidence
            .iter()
            .filter(|e| item_ids.contains(&e.item_id))
            .cloned()
            .collect())
    }

    async fn get_fact_checks_for_items(&self, item_ids: &[String]) -> Result<Vec<FactCheck>> {
        Ok(self
            .enter("get_fact_checks_for_items")?
            .fact_checks
            .iter()
            .filter(|f| item_ids.contains(&f.item_id))
            .cloned()
            .collect())
    }

    async fn get_clusters_for_window(&self, window: &Window) -> Result<Vec<Cluster>> {
        let state = self.enter("get_clusters_for_window")?;
        let clusters = state
            .clusters
            .iter()
            .filter(|c| c.window == *window)
            .map(|c| Cluster {
                id: c.id.clone(),
                topic: c.topic.clone(),
                items: c
                    .item_ids
                    .iter()
                    .filter_map(|id| state.items.iter().find(|s| &s.item.id == id))
                    .map(|s| s.item.clone())
                    .collect(),
                window_start: c.window.start,
                window_end: c.window.end,
            })
            .collect();
        Ok(clusters)
    }

    async fn delete_clusters_for_window(&self, window: &Window) -> Result<()> {
        self.enter("delete_clusters_for_window")?
            .clusters
            .retain(|c| c.window != *window);
        Ok(())
    }

    async fn create_cluster(&self, window: &Window, topic: &str) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        self.enter("create_cluster")?.clusters.push(StoredCluster {
            id: id.clone(),
            window: *window,
            topic: topic.to_string(),
            item_ids: Vec::new(),
        });
        Ok(id)
    }

    async fn add_to_cluster(
        &self,
        cluster_id: &str,
        window: &Window,
        item_ids: &[String],
    ) -> Result<()> {
        let mut state = self.enter("add_to_cluster")?;
        for id in item_ids {
            let taken = state
                .clusters
                .iter()
                .any(|c| c.window == *window && c.id != cluster_id && c.item_ids.contains(id));
            if taken {
                bail!("item {id} already clustered in window {window}");
            }
        }
        let cluster = state
            .clusters
            .iter_mut()
            .find(|c| c.id == cluster_id)
            .ok_or_else(|| anyhow!("cluster {cluster_id} not found"))?;
        for id in item_ids {
            if !cluster.item_ids.contains(id) {
                cluster.item_ids.push(id.clone());
            }
        }
        Ok(())
    }

    async fn list_channels(&self) -> Result<Vec<ChannelInfo>> {
        Ok(self
            .enter("list_channels")?
            .channels
            .values()
            .cloned()
            .collect())
    }

    async fn get_rating_samples_since(&self, since: DateTime<Utc>) -> Result<Vec<RatingSample>> {
        Ok(self
            .enter("get_rating_samples_since")?
            .ratings
            .iter()
            .filter(|r| r.created_at >= since)
            .cloned()
            .collect())
    }

    async fn get_channel_rolling_stats(
        &self,
        channel_id: i64,
        since: DateTime<Utc>,
    ) -> Result<RollingStats> {
        let state = self.enter("get_channel_rolling_stats")?;
        let total_messages = state
            .messages
            .iter()
            .filter(|(channel, at)| *channel == channel_id && *at >= since)
            .count() as u64;
        let created = state
            .items
            .iter()
            .filter(|s| s.item.source_channel_id == channel_id && s.item.first_seen_at >= since)
            .collect::<Vec<_>>();
        let digested = created
            .iter()
            .filter(|s| s.digested_at.is_some())
            .collect::<Vec<_>>();
        let avg_importance_digested = if digested.is_empty() {
            None
        } else {
            Some(
                digested.iter().map(|s| s.item.importance_score).sum::<f64>()
                    / digested.len() as f64,
            )
        };
        Ok(RollingStats {
            total_messages,
            items_created: created.len() as u64,
            items_digested: digested.len() as u64,
            avg_importance_digested,
        })
    }

    async fn update_channel_auto_weight(
        &self,
        channel_id: i64,
        weight: f64,
        _at: DateTime<Utc>,
    ) -> Result<()> {
        let mut state = self.enter("update_channel_auto_weight")?;
        let channel = state
            .channels
            .get_mut(&channel_id)
            .ok_or_else(|| anyhow!("channel {channel_id} not found"))?;
        channel.importance_weight = weight;
        Ok(())
    }

    async fn update_channel_relevance_delta(
        &self,
        channel_id: i64,
        delta: f64,
        _at: DateTime<Utc>,
    ) -> Result<()> {
        let mut state = self.enter("update_channel_relevance_delta")?;
        let channel = state
            .channels
            .get_mut(&channel_id)
            .ok_or_else(|| anyhow!("channel {channel_id} not found"))?;
        channel.relevance_delta = delta;
        Ok(())
    }

    async fn insert_threshold_tuning_log(&self, entry: &ThresholdTuningLogEntry) -> Result<()> {
        self.enter("insert_threshold_tuning_log")?
            .tuning_log
            .push(entry.clone());
        Ok(())
    }

    async fn get_cluster_summary_cache_entry(
        &self,
        language: &str,
        fingerprint: &str,
    ) -> Result<Option<ClusterSummaryCacheEntry>> {
        Ok(self
            .enter("get_cluster_summary_cache_entry")?
            .summary_cache
            .get(&(language.to_string(), fingerprint.to_string()))
            .cloned())
    }

    async fn get_cluster_summary_cache_since(
        &self,
        language: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<ClusterSummaryCacheEntry>> {
        let state = self.enter("get_cluster_summary_cache_since")?;
        let mut entries = state
            .summary_cache
            .values()
            .filter(|e| e.digest_language == language && e.created_at >= since)
            .cloned()
            .collect::<Vec<_>>();
        entries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(entries)
    }

    async fn upsert_cluster_summary_cache_entry(
        &self,
        entry: &ClusterSummaryCacheEntry,
    ) -> Result<()> {
        self.enter("upsert_cluster_summary_cache_entry")?.summary_cache.insert(
            (entry.digest_language.clone(), entry.fingerprint.clone()),
            entry.clone(),
        );
        Ok(())
    }
}
