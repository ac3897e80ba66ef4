//! Repository contract for the digest engine plus in-memory and Postgres backends.
//!
//! The [`Repository`] trait is the single source of truth for the engine:
//! settings, items, clusters, posted digests, adaptive state and the
//! cluster-summary cache all flow through it. Every method is potentially
//! blocking I/O and may fail transiently.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use digestor_core::{
    ChannelInfo, Cluster, ClusterSummaryCacheEntry, DigestEntry, DigestRecord, DigestWindowStats,
    FactCheck, Item, ItemEvidence, RatingSample, RollingStats, ThresholdTuningLogEntry, Window,
};
use sha2::{Digest, Sha256};
use uuid::Uuid;

pub mod memory;
pub mod postgres;

pub use memory::InMemoryRepository;
pub use postgres::PgRepository;

pub const CRATE_NAME: &str = "digestor-storage";

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Stable, non-negative 63-bit lock id for a lease name.
pub fn advisory_lock_id(lease_name: &str) -> i64 {
    let digest = Sha256::digest(lease_name.as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    (u64::from_be_bytes(prefix) & 0x7FFF_FFFF_FFFF_FFFF) as i64
}

/// Abstract persistent store consumed by the composition engine.
///
/// | group | methods |
/// |-------|---------|
/// | settings | [`get_setting`](Repository::get_setting), [`set_setting`](Repository::set_setting) |
/// | leader election | [`try_acquire_advisory_lock`](Repository::try_acquire_advisory_lock), [`release_advisory_lock`](Repository::release_advisory_lock) |
/// | digests | `digest_exists`, `save_digest`, `save_digest_error`, `save_digest_entries`, `save_digest_stats` |
/// | items | `get_items_for_window*`, counts, `mark_items_as_digested`, `update_item_importance` |
/// | clusters | get / delete-for-window / create / add |
/// | adaptive | channels, ratings, rolling stats, weight and delta updates, tuning log |
/// | summary cache | exact lookup, range scan, upsert |
#[async_trait]
pub trait Repository: Send + Sync {
    /// Raw JSON value of a dynamic setting.
    async fn get_setting(&self, key: &str) -> Result<Option<serde_json::Value>>;

    async fn set_setting(&self, key: &str, value: serde_json::Value) -> Result<()>;

    /// Non-blocking attempt at the cross-replica lease. `false` means another
    /// replica holds it.
    async fn try_acquire_advisory_lock(&self, lock_id: i64) -> Result<bool>;

    async fn release_advisory_lock(&self, lock_id: i64) -> Result<()>;

    async fn digest_exists(&self, window: &Window) -> Result<bool>;

    /// Persist a posted digest; idempotent by window.
    async fn save_digest(&self, record: &DigestRecord) -> Result<Uuid>;

    async fn save_digest_error(&self, window: &Window, chat_id: i64, error: &str) -> Result<()>;

    async fn save_digest_entries(&self, digest_id: Uuid, entries: &[DigestEntry]) -> Result<()>;

    async fn save_digest_stats(&self, stats: &DigestWindowStats) -> Result<()>;

    /// Undigested items published in `window` with importance at or above
    /// the threshold, ordered by importance (then relevance) descending.
    async fn get_items_for_window(
        &self,
        window: &Window,
        importance_threshold: f64,
        limit: usize,
    ) -> Result<Vec<Item>>;

    /// Same as [`get_items_for_window`](Repository::get_items_for_window) with media hydrated.
    async fn get_items_for_window_with_media(
        &self,
        window: &Window,
        importance_threshold: f64,
        limit: usize,
    ) -> Result<Vec<Item>>;

    async fn count_items_in_window(&self, window: &Window) -> Result<u64>;

    /// Items in the window whose ingestion has completed.
    async fn count_ready_items_in_window(&self, window: &Window) -> Result<u64>;

    /// Messages received but not yet turned into items.
    async fn get_backlog_count(&self) -> Result<u64>;

    async fn mark_items_as_digested(&self, item_ids: &[String], at: DateTime<Utc>) -> Result<()>;

    async fn update_item_importance(&self, updates: &[(String, f64)]) -> Result<()>;

    async fn get_evidence_for_items(&self, item_ids: &[String]) -> Result<Vec<ItemEvidence>>;

    async fn get_fact_checks_for_items(&self, item_ids: &[String]) -> Result<Vec<FactCheck>>;

    async fn get_clusters_for_window(&self, window: &Window) -> Result<Vec<Cluster>>;

    async fn delete_clusters_for_window(&self, window: &Window) -> Result<()>;

    /// Create an empty cluster and return its id.
    async fn create_cluster(&self, window: &Window, topic: &str) -> Result<String>;

    /// Append items (in order) to a cluster. An item may belong to at most
    /// one cluster per window.
    async fn add_to_cluster(&self, cluster_id: &str, window: &Window, item_ids: &[String])
        -> Result<()>;

    async fn list_channels(&self) -> Result<Vec<ChannelInfo>>;

    async fn get_rating_samples_since(&self, since: DateTime<Utc>) -> Result<Vec<RatingSample>>;

    async fn get_channel_rolling_stats(
        &self,
        channel_id: i64,
        since: DateTime<Utc>,
    ) -> Result<RollingStats>;

    async fn update_channel_auto_weight(
        &self,
        channel_id: i64,
        weight: f64,
        at: DateTime<Utc>,
    ) -> Result<()>;

    async fn update_channel_relevance_delta(
        &self,
        channel_id: i64,
        delta: f64,
        at: DateTime<Utc>,
    ) -> Result<()>;

    async fn insert_threshold_tuning_log(&self, entry: &ThresholdTuningLogEntry) -> Result<()>;

    async fn get_cluster_summary_cache_entry(
        &self,
        language: &str,
        fingerprint: &str,
    ) -> Result<Option<ClusterSummaryCacheEntry>>;

    /// Entries for `language` created at or after `since`.
    async fn get_cluster_summary_cache_since(
        &self,
        language: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<ClusterSummaryCacheEntry>>;

    /// Insert or replace by `(digest_language, fingerprint)`.
    async fn upsert_cluster_summary_cache_entry(&self, entry: &ClusterSummaryCacheEntry)
        -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hashing_is_stable() {
        assert_eq!(
            sha256_hex(b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn lock_id_is_stable_and_non_negative() {
        let a = advisory_lock_id("digest-composer");
        assert_eq!(a, advisory_lock_id("digest-composer"));
        assert!(a >= 0);
        assert_ne!(a, advisory_lock_id("digest-composer-2"));
        // b94d27b9934d3e08 with the top bit cleared.
        assert_eq!(advisory_lock_id("hello world"), 0x394d_27b9_934d_3e08);
    }
}
