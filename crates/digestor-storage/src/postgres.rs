//! Postgres-backed [`Repository`] over a `sqlx` pool.
//!
//! Advisory locks are session-scoped in Postgres, so each held lock pins the
//! pooled connection it was taken on until it is released.

use std::collections::HashMap;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use digestor_core::{
    ChannelInfo, Cluster, ClusterSummaryCacheEntry, DigestEntry, DigestRecord, DigestWindowStats,
    FactCheck, Item, ItemEvidence, Rating, RatingSample, RollingStats, ThresholdTuningLogEntry,
    Window,
};
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, Row};
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use super::Repository;

const ITEM_COLUMNS: &str = r#"
    i.id, i.importance_score, i.relevance_score, i.published_at, i.first_seen_at,
    ch.username, i.channel_id, ch.title, i.source_msg_id, i.summary, i.topic, i.embedding
"#;

pub struct PgRepository {
    pool: PgPool,
    held_locks: Mutex<HashMap<i64, PoolConnection<Postgres>>>,
}

impl PgRepository {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            held_locks: Mutex::new(HashMap::new()),
        }
    }

    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(8)
            .connect(database_url)
            .await
            .context("connecting to postgres")?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the embedded schema migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("running digest engine migrations")
    }

    async fn items_for_window(
        &self,
        window: &Window,
        importance_threshold: f64,
        limit: usize,
        with_media: bool,
    ) -> Result<Vec<Item>> {
        let media = if with_media { "i.media" } else { "NULL::bytea AS media" };
        let sql = format!(
            r#"
            SELECT {ITEM_COLUMNS}, {media}
              FROM items i
              JOIN channels ch ON ch.id = i.channel_id
             WHERE i.published_at >= $1
               AND i.published_at < $2
               AND i.importance_score >= $3
               AND i.digested_at IS NULL
               AND i.status = 'ready'
             ORDER BY i.importance_score DESC, i.relevance_score DESC, i.id
             LIMIT $4
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(window.start)
            .bind(window.end)
            .bind(importance_threshold)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .with_context(|| format!("loading items for window {window}"))?;
        rows.iter().map(item_from_row).collect()
    }
}

fn item_from_row(row: &PgRow) -> Result<Item> {
    let embedding: Option<Vec<f32>> = row.try_get("embedding")?;
    Ok(Item {
        id: row.try_get("id")?,
        importance_score: row.try_get("importance_score")?,
        relevance_score: row.try_get("relevance_score")?,
        published_at: row.try_get("published_at")?,
        first_seen_at: row.try_get("first_seen_at")?,
        source_channel: row.try_get("username")?,
        source_channel_id: row.try_get("channel_id")?,
        source_channel_title: row.try_get("title")?,
        source_msg_id: row.try_get("source_msg_id")?,
        summary: row.try_get("summary")?,
        topic: row.try_get("topic")?,
        embedding: embedding.unwrap_or_default(),
        media: row.try_get("media")?,
    })
}

fn cache_entry_from_row(row: &PgRow) -> Result<ClusterSummaryCacheEntry> {
    Ok(ClusterSummaryCacheEntry {
        digest_language: row.try_get("digest_language")?,
        fingerprint: row.try_get("fingerprint")?,
        item_ids: row.try_get("item_ids")?,
        summary: row.try_get("summary")?,
        created_at: row.try_get("created_at")?,
    })
}

#[async_trait]
impl Repository for PgRepository {
    async fn get_setting(&self, key: &str) -> Result<Option<serde_json::Value>> {
        let value = sqlx::query_scalar::<_, serde_json::Value>(
            "SELECT value FROM settings WHERE key = $1",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .with_context(|| format!("reading setting {key}"))?;
        Ok(value)
    }

    async fn set_setting(&self, key: &str, value: serde_json::Value) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO settings (key, value, updated_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (key) DO UPDATE
               SET value = EXCLUDED.value,
                   updated_at = NOW()
            "#,
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await
        .with_context(|| format!("writing setting {key}"))?;
        Ok(())
    }

    async fn try_acquire_advisory_lock(&self, lock_id: i64) -> Result<bool> {
        let mut held = self.held_locks.lock().await;
        if held.contains_key(&lock_id) {
            return Ok(false);
        }
        let mut conn = self
            .pool
            .acquire()
            .await
            .context("acquiring connection for advisory lock")?;
        let acquired = sqlx::query_scalar::<_, bool>("SELECT pg_try_advisory_lock($1)")
            .bind(lock_id)
            .fetch_one(&mut *conn)
            .await
            .with_context(|| format!("pg_try_advisory_lock({lock_id})"))?;
        if acquired {
            held.insert(lock_id, conn);
        }
        Ok(acquired)
    }

    async fn release_advisory_lock(&self, lock_id: i64) -> Result<()> {
        let Some(mut conn) = self.held_locks.lock().await.remove(&lock_id) else {
            debug!(lock_id, "release requested for a lock this process does not hold");
            return Ok(());
        };
        let released = sqlx::query_scalar::<_, bool>("SELECT pg_advisory_unlock($1)")
            .bind(lock_id)
            .fetch_one(&mut *conn)
            .await
            .with_context(|| format!("pg_advisory_unlock({lock_id})"))?;
        if !released {
            warn!(lock_id, "advisory unlock reported the lock was not held");
        }
        Ok(())
    }

    async fn digest_exists(&self, window: &Window) -> Result<bool> {
        let exists = sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS (SELECT 1 FROM digests WHERE window_start = $1 AND window_end = $2)",
        )
        .bind(window.start)
        .bind(window.end)
        .fetch_one(&self.pool)
        .await
        .with_context(|| format!("checking digest for window {window}"))?;
        Ok(exists)
    }

    async fn save_digest(&self, record: &DigestRecord) -> Result<Uuid> {
        let id = sqlx::query_scalar::<_, Uuid>(
            r#"
            INSERT INTO digests (id, window_start, window_end, chat_id, message_id, posted_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (window_start, window_end) DO UPDATE
               SET message_id = EXCLUDED.message_id
            RETURNING id
            "#,
        )
        .bind(record.id)
        .bind(record.window_start)
        .bind(record.window_end)
        .bind(record.chat_id)
        .bind(record.message_id)
        .bind(record.posted_at)
        .fetch_one(&self.pool)
        .await
        .context("saving digest")?;
        Ok(id)
    }

    async fn save_digest_error(&self, window: &Window, chat_id: i64, error: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO digest_errors (window_start, window_end, chat_id, error, created_at)
            VALUES ($1, $2, $3, $4, NOW())
            ON CONFLICT (window_start, window_end, chat_id) DO UPDATE
               SET error = EXCLUDED.error,
                   created_at = NOW()
            "#,
        )
        .bind(window.start)
        .bind(window.end)
        .bind(chat_id)
        .bind(error)
        .execute(&self.pool)
        .await
        .context("saving digest error")?;
        Ok(())
    }

    async fn save_digest_entries(&self, digest_id: Uuid, entries: &[DigestEntry]) -> Result<()> {
        let mut tx = self.pool.begin().await.context("beginning entries tx")?;
        sqlx::query("DELETE FROM digest_entries WHERE digest_id = $1")
            .bind(digest_id)
            .execute(&mut *tx)
            .await
            .context("clearing digest entries")?;
        for entry in entries {
            sqlx::query(
                r#"
                INSERT INTO digest_entries
                    (digest_id, position, title, body, topic, item_ids, channel_ids)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                "#,
            )
            .bind(digest_id)
            .bind(entry.position as i32)
            .bind(&entry.title)
            .bind(&entry.body)
            .bind(&entry.topic)
            .bind(&entry.item_ids)
            .bind(&entry.channel_ids)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("inserting digest entry {}", entry.position))?;
        }
        tx.commit().await.context("committing digest entries")?;
        Ok(())
    }

    async fn save_digest_stats(&self, stats: &DigestWindowStats) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO digest_stats
                (window_start, window_end, candidates, selected, clusters,
                 topic_balance_relaxed, posted_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (window_start, window_end) DO UPDATE
               SET candidates = EXCLUDED.candidates,
                   selected = EXCLUDED.selected,
                   clusters = EXCLUDED.clusters,
                   topic_balance_relaxed = EXCLUDED.topic_balance_relaxed,
                   posted_at = EXCLUDED.posted_at
            "#,
        )
        .bind(stats.window_start)
        .bind(stats.window_end)
        .bind(stats.candidates as i32)
        .bind(stats.selected as i32)
        .bind(stats.clusters as i32)
        .bind(stats.topic_balance_relaxed)
        .bind(stats.posted_at)
        .execute(&self.pool)
        .await
        .context("saving digest stats")?;
        Ok(())
    }

    async fn get_items_for_window(
        &self,
        window: &Window,
        importance_threshold: f64,
        limit: usize,
    ) -> Result<Vec<Item>> {
        self.items_for_window(window, importance_threshold, limit, false)
            .await
    }

    async fn get_items_for_window_with_media(
        &self,
        window: &Window,
        importance_threshold: f64,
        limit: usize,
    ) -> Result<Vec<Item>> {
        self.items_for_window(window, importance_threshold, limit, true)
            .await
    }

    async fn count_items_in_window(&self, window: &Window) -> Result<u64> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM items WHERE published_at >= $1 AND published_at < $2",
        )
        .bind(window.start)
        .bind(window.end)
        .fetch_one(&self.pool)
        .await
        .context("counting items in window")?;
        Ok(count.max(0) as u64)
    }

    async fn count_ready_items_in_window(&self, window: &Window) -> Result<u64> {
        let count = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT COUNT(*) FROM items
             WHERE published_at >= $1 AND published_at < $2 AND status = 'ready'
            "#,
        )
        .bind(window.start)
        .bind(window.end)
        .fetch_one(&self.pool)
        .await
        .context("counting ready items in window")?;
        Ok(count.max(0) as u64)
    }

    async fn get_backlog_count(&self) -> Result<u64> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM raw_messages WHERE processed_at IS NULL",
        )
        .fetch_one(&self.pool)
        .await
        .context("counting backlog")?;
        Ok(count.max(0) as u64)
    }

    async fn mark_items_as_digested(&self, item_ids: &[String], at: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE items SET digested_at = $2 WHERE id = ANY($1)")
            .bind(item_ids)
            .bind(at)
            .execute(&self.pool)
            .await
            .context("marking items digested")?;
        Ok(())
    }

    async fn update_item_importance(&self, updates: &[(String, f64)]) -> Result<()> {
        if updates.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await.context("beginning importance tx")?;
        for (id, score) in updates {
            sqlx::query("UPDATE items SET importance_score = $2 WHERE id = $1")
                .bind(id)
                .bind(score)
                .execute(&mut *tx)
                .await
                .with_context(|| format!("updating importance of {id}"))?;
        }
        tx.commit().await.context("committing importance updates")?;
        Ok(())
    }

    async fn get_evidence_for_items(&self, item_ids: &[String]) -> Result<Vec<ItemEvidence>> {
        let rows = sqlx::query(
            r#"
            SELECT item_id, url, agreement_score, is_contradiction
              FROM item_evidence
             WHERE item_id = ANY($1)
             ORDER BY item_id, url
            "#,
        )
        .bind(item_ids)
        .fetch_all(&self.pool)
        .await
        .context("loading item evidence")?;
        rows.iter()
            .map(|row| {
                Ok(ItemEvidence {
                    item_id: row.try_get("item_id")?,
                    url: row.try_get("url")?,
                    agreement_score: row.try_get("agreement_score")?,
                    is_contradiction: row.try_get("is_contradiction")?,
                })
            })
            .collect()
    }

    async fn get_fact_checks_for_items(&self, item_ids: &[String]) -> Result<Vec<FactCheck>> {
        let rows = sqlx::query(
            r#"
            SELECT item_id, claim, verdict, url
              FROM item_fact_checks
             WHERE item_id = ANY($1)
             ORDER BY id
            "#,
        )
        .bind(item_ids)
        .fetch_all(&self.pool)
        .await
        .context("loading fact checks")?;
        rows.iter()
            .map(|row| {
                Ok(FactCheck {
                    item_id: row.try_get("item_id")?,
                    claim: row.try_get("claim")?,
                    verdict: row.try_get("verdict")?,
                    url: row.try_get("url")?,
                })
            })
            .collect()
    }

    async fn get_clusters_for_window(&self, window: &Window) -> Result<Vec<Cluster>> {
        let sql = format!(
            r#"
            SELECT c.id AS cluster_id, c.topic AS cluster_topic, {ITEM_COLUMNS},
                   NULL::bytea AS media
              FROM clusters c
              JOIN cluster_items ci ON ci.cluster_id = c.id
              JOIN items i ON i.id = ci.item_id
              JOIN channels ch ON ch.id = i.channel_id
             WHERE c.window_start = $1 AND c.window_end = $2
             ORDER BY c.created_at, c.id, ci.position
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(window.start)
            .bind(window.end)
            .fetch_all(&self.pool)
            .await
            .context("loading clusters for window")?;

        let mut clusters: Vec<Cluster> = Vec::new();
        for row in &rows {
            let cluster_id: Uuid = row.try_get("cluster_id")?;
            let cluster_id = cluster_id.to_string();
            let item = item_from_row(row)?;
            match clusters.last_mut() {
                Some(current) if current.id == cluster_id => current.items.push(item),
                _ => clusters.push(Cluster {
                    id: cluster_id,
                    topic: row.try_get("cluster_topic")?,
                    items: vec![item],
                    window_start: window.start,
                    window_end: window.end,
                }),
            }
        }
        Ok(clusters)
    }

    async fn delete_clusters_for_window(&self, window: &Window) -> Result<()> {
        sqlx::query("DELETE FROM clusters WHERE window_start = $1 AND window_end = $2")
            .bind(window.start)
            .bind(window.end)
            .execute(&self.pool)
            .await
            .context("deleting clusters for window")?;
        Ok(())
    }

    async fn create_cluster(&self, window: &Window, topic: &str) -> Result<String> {
        let id = Uuid::new_v4();
        sqlx::query(
            "INSERT INTO clusters (id, window_start, window_end, topic) VALUES ($1, $2, $3, $4)",
        )
        .bind(id)
        .bind(window.start)
        .bind(window.end)
        .bind(topic)
        .execute(&self.pool)
        .await
        .context("creating cluster")?;
        Ok(id.to_string())
    }

    async fn add_to_cluster(
        &self,
        cluster_id: &str,
        window: &Window,
        item_ids: &[String],
    ) -> Result<()> {
        let cluster_uuid: Uuid = cluster_id
            .parse()
            .with_context(|| format!("cluster id {cluster_id} is not a uuid"))?;
        let mut tx = self.pool.begin().await.context("beginning cluster tx")?;
        let next_position = sqlx::query_scalar::<_, i32>(
            "SELECT COALESCE(MAX(position) + 1, 0) FROM cluster_items WHERE cluster_id = $1",
        )
        .bind(cluster_uuid)
        .fetch_one(&mut *tx)
        .await
        .context("reading cluster size")?;
        for (offset, item_id) in item_ids.iter().enumerate() {
            sqlx::query(
                r#"
                INSERT INTO cluster_items (cluster_id, item_id, window_start, window_end, position)
                VALUES ($1, $2, $3, $4, $5)
                ON CONFLICT (cluster_id, item_id) DO NOTHING
                "#,
            )
            .bind(cluster_uuid)
            .bind(item_id)
            .bind(window.start)
            .bind(window.end)
            .bind(next_position + offset as i32)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("adding {item_id} to cluster {cluster_id}"))?;
        }
        tx.commit().await.context("committing cluster members")?;
        Ok(())
    }

    async fn list_channels(&self) -> Result<Vec<ChannelInfo>> {
        let rows = sqlx::query(
            r#"
            SELECT id, username, title, auto_weight_enabled, weight_override,
                   importance_weight, relevance_delta
              FROM channels
             ORDER BY id
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("listing channels")?;
        rows.iter()
            .map(|row| {
                Ok(ChannelInfo {
                    id: row.try_get("id")?,
                    username: row.try_get("username")?,
                    title: row.try_get("title")?,
                    auto_weight_enabled: row.try_get("auto_weight_enabled")?,
                    weight_override: row.try_get("weight_override")?,
                    importance_weight: row.try_get("importance_weight")?,
                    relevance_delta: row.try_get("relevance_delta")?,
                })
            })
            .collect()
    }

    async fn get_rating_samples_since(&self, since: DateTime<Utc>) -> Result<Vec<RatingSample>> {
        let rows = sqlx::query(
            r#"
            SELECT r.item_id, r.rating, r.created_at, i.channel_id
              FROM item_ratings r
              JOIN items i ON i.id = r.item_id
             WHERE r.created_at >= $1
            "#,
        )
        .bind(since)
        .fetch_all(&self.pool)
        .await
        .context("loading rating samples")?;
        rows.iter()
            .map(|row| {
                let raw: String = row.try_get("rating")?;
                Ok(RatingSample {
                    item_id: row.try_get("item_id")?,
                    rating: Rating::parse_lenient(&raw),
                    created_at: row.try_get("created_at")?,
                    channel_id: row.try_get("channel_id")?,
                })
            })
            .collect()
    }

    async fn get_channel_rolling_stats(
        &self,
        channel_id: i64,
        since: DateTime<Utc>,
    ) -> Result<RollingStats> {
        let row = sqlx::query(
            r#"
            SELECT
              (SELECT COUNT(*) FROM raw_messages
                WHERE channel_id = $1 AND received_at >= $2) AS total_messages,
              (SELECT COUNT(*) FROM items
                WHERE channel_id = $1 AND first_seen_at >= $2) AS items_created,
              (SELECT COUNT(*) FROM items
                WHERE channel_id = $1 AND first_seen_at >= $2
                  AND digested_at IS NOT NULL) AS items_digested,
              (SELECT AVG(importance_score) FROM items
                WHERE channel_id = $1 AND first_seen_at >= $2
                  AND digested_at IS NOT NULL) AS avg_importance_digested
            "#,
        )
        .bind(channel_id)
        .bind(since)
        .fetch_one(&self.pool)
        .await
        .with_context(|| format!("loading rolling stats for channel {channel_id}"))?;
        let total_messages: i64 = row.try_get("total_messages")?;
        let items_created: i64 = row.try_get("items_created")?;
        let items_digested: i64 = row.try_get("items_digested")?;
        Ok(RollingStats {
            total_messages: total_messages.max(0) as u64,
            items_created: items_created.max(0) as u64,
            items_digested: items_digested.max(0) as u64,
            avg_importance_digested: row.try_get("avg_importance_digested")?,
        })
    }

    async fn update_channel_auto_weight(
        &self,
        channel_id: i64,
        weight: f64,
        at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE channels SET importance_weight = $2, weight_updated_at = $3 WHERE id = $1",
        )
        .bind(channel_id)
        .bind(weight)
        .bind(at)
        .execute(&self.pool)
        .await
        .with_context(|| format!("updating weight of channel {channel_id}"))?;
        Ok(())
    }

    async fn update_channel_relevance_delta(
        &self,
        channel_id: i64,
        delta: f64,
        at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE channels SET relevance_delta = $2, delta_updated_at = $3 WHERE id = $1",
        )
        .bind(channel_id)
        .bind(delta)
        .bind(at)
        .execute(&self.pool)
        .await
        .with_context(|| format!("updating relevance delta of channel {channel_id}"))?;
        Ok(())
    }

    async fn insert_threshold_tuning_log(&self, entry: &ThresholdTuningLogEntry) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO threshold_tuning_log
                (tuned_at, net_score, delta, importance_threshold, relevance_threshold)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(entry.tuned_at)
        .bind(entry.net_score)
        .bind(entry.delta)
        .bind(entry.importance_threshold)
        .bind(entry.relevance_threshold)
        .execute(&self.pool)
        .await
        .context("inserting threshold tuning log")?;
        Ok(())
    }

    async fn get_cluster_summary_cache_entry(
        &self,
        language: &str,
        fingerprint: &str,
    ) -> Result<Option<ClusterSummaryCacheEntry>> {
        let row = sqlx::query(
            r#"
            SELECT digest_language, fingerprint, item_ids, summary, created_at
              FROM cluster_summary_cache
             WHERE digest_language = $1 AND fingerprint = $2
            "#,
        )
        .bind(language)
        .bind(fingerprint)
        .fetch_optional(&self.pool)
        .await
        .context("reading cluster summary cache")?;
        row.as_ref().map(cache_entry_from_row).transpose()
    }

    async fn get_cluster_summary_cache_since(
        &self,
        language: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<ClusterSummaryCacheEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT digest_language, fingerprint, item_ids, summary, created_at
              FROM cluster_summary_cache
             WHERE digest_language = $1 AND created_at >= $2
             ORDER BY created_at DESC
            "#,
        )
        .bind(language)
        .bind(since)
        .fetch_all(&self.pool)
        .await
        .context("scanning cluster summary cache")?;
        rows.iter().map(cache_entry_from_row).collect()
    }

    async fn upsert_cluster_summary_cache_entry(
        &self,
        entry: &ClusterSummaryCacheEntry,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO cluster_summary_cache
                (digest_language, fingerprint, item_ids, summary, created_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (digest_language, fingerprint) DO UPDATE
               SET item_ids = EXCLUDED.item_ids,
                   summary = EXCLUDED.summary,
                   created_at = EXCLUDED.created_at
            "#,
        )
        .bind(&entry.digest_language)
        .bind(&entry.fingerprint)
        .bind(&entry.item_ids)
        .bind(&entry.summary)
        .bind(entry.created_at)
        .execute(&self.pool)
        .await
        .context("upserting cluster summary cache")?;
        Ok(())
    }
}
