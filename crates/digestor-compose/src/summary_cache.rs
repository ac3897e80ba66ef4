//! Content-addressed cache of cluster summaries with near-match reuse.

use std::collections::HashSet;

use chrono::{DateTime, Duration, Utc};
use digestor_adapters::ClusterSummarizer;
use digestor_core::{ClusterSummaryCacheEntry, Item};
use digestor_storage::{sha256_hex, Repository};
use tracing::debug;

use crate::context::RunContext;
use crate::error::{ComposeError, ComposeResult};

pub const DEFAULT_MAX_AGE_DAYS: i64 = 7;
pub const MIN_OVERLAP: f64 = 0.8;

fn sorted_ids(ids: &[String]) -> Vec<String> {
    let mut sorted = ids.to_vec();
    sorted.sort();
    sorted.dedup();
    sorted
}

/// `hex(sha256(sorted ids joined by "|"))`; independent of input order.
pub fn fingerprint(ids: &[String]) -> String {
    sha256_hex(sorted_ids(ids).join("|").as_bytes())
}

pub fn jaccard(a: &[String], b: &[String]) -> f64 {
    let a = a.iter().collect::<HashSet<_>>();
    let b = b.iter().collect::<HashSet<_>>();
    let union = a.union(&b).count();
    if union == 0 {
        return 0.0;
    }
    a.intersection(&b).count() as f64 / union as f64
}

pub struct SummaryCache<'a> {
    repo: &'a dyn Repository,
    ctx: &'a RunContext,
    language: &'a str,
    max_age: Duration,
}

impl<'a> SummaryCache<'a> {
    pub fn new(repo: &'a dyn Repository, ctx: &'a RunContext, language: &'a str) -> Self {
        Self {
            repo,
            ctx,
            language,
            max_age: Duration::days(DEFAULT_MAX_AGE_DAYS),
        }
    }

    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = max_age;
        self
    }

    /// Exact fingerprint first, then the best overlapping recent entry.
    pub async fn lookup(&self, ids: &[String], now: DateTime<Utc>) -> ComposeResult<Option<String>> {
        let fp = fingerprint(ids);
        let exact = self
            .ctx
            .guard(
                "get_cluster_summary_cache_entry",
                self.repo.get_cluster_summary_cache_entry(self.language, &fp),
            )
            .await?;
        if let Some(entry) = exact {
            return Ok(Some(entry.summary));
        }

        let recent = self
            .ctx
            .guard(
                "get_cluster_summary_cache_since",
                self.repo
                    .get_cluster_summary_cache_since(self.language, now - self.max_age),
            )
            .await?;
        let best = recent
            .into_iter()
            .map(|entry| (jaccard(ids, &entry.item_ids), entry))
            .filter(|(overlap, _)| *overlap >= MIN_OVERLAP)
            .max_by(|(a, _), (b, _)| a.total_cmp(b));
        Ok(best.map(|(overlap, entry)| {
            debug!(overlap, fingerprint = %entry.fingerprint, "summary cache near match");
            entry.summary
        }))
    }

    pub async fn store(&self, ids: &[String], summary: &str, now: DateTime<Utc>) -> ComposeResult<()> {
        let entry = ClusterSummaryCacheEntry {
            digest_language: self.language.to_string(),
            fingerprint: fingerprint(ids),
            item_ids: sorted_ids(ids),
            summary: summary.to_string(),
            created_at: now,
        };
        self.ctx
            .guard(
                "upsert_cluster_summary_cache_entry",
                self.repo.upsert_cluster_summary_cache_entry(&entry),
            )
            .await
    }

    /// Cached summary for a multi-item cluster, generating and caching one on a miss.
    pub async fn summary_for(
        &self,
        summarizer: &dyn ClusterSummarizer,
        items: &[Item],
        now: DateTime<Utc>,
    ) -> ComposeResult<String> {
        let ids = items.iter().map(|i| i.id.clone()).collect::<Vec<_>>();
        if let Some(summary) = self.lookup(&ids, now).await? {
            return Ok(summary);
        }
        let summary = self
            .ctx
            .guard("summarize", async {
                summarizer
                    .summarize(items, self.language)
                    .await
                    .map_err(ComposeError::Summarizer)
            })
            .await?;
        self.store(&ids, &summary, now).await?;
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use digestor_storage::InMemoryRepository;

    fn ids(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|s| s.to_string()).collect()
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 12, 0, 0).unwrap()
    }

    fn ctx() -> RunContext {
        RunContext::detached(std::time::Duration::from_secs(5))
    }

    #[test]
    fn fingerprint_ignores_order() {
        assert_eq!(
            fingerprint(&ids(&["b", "a", "c"])),
            fingerprint(&ids(&["c", "b", "a"]))
        );
        assert_eq!(fingerprint(&ids(&["a", "b"])), sha256_hex(b"a|b"));
        assert_ne!(fingerprint(&ids(&["a", "b"])), fingerprint(&ids(&["a", "c"])));
    }

    #[test]
    fn jaccard_overlap() {
        assert_eq!(jaccard(&ids(&["a", "b"]), &ids(&["a", "b"])), 1.0);
        assert!((jaccard(&ids(&["a", "b", "c"]), &ids(&["a", "b"])) - 2.0 / 3.0).abs() < 1e-9);
        assert_eq!(jaccard(&[], &[]), 0.0);
    }

    #[tokio::test]
    async fn exact_hits_then_near_matches() {
        let repo = InMemoryRepository::new();
        let ctx = ctx();
        let cache = SummaryCache::new(&repo, &ctx, "en");
        let five = ids(&["a", "b", "c", "d", "e"]);
        cache.store(&five, "five", now()).await.unwrap();

        assert_eq!(
            cache.lookup(&ids(&["e", "d", "c", "b", "a"]), now()).await.unwrap(),
            Some("five".to_string())
        );
        // 5/6 overlap clears 0.8.
        assert_eq!(
            cache
                .lookup(&ids(&["a", "b", "c", "d", "e", "f"]), now())
                .await
                .unwrap(),
            Some("five".to_string())
        );
        // 3/5 does not.
        assert_eq!(cache.lookup(&ids(&["a", "b", "c"]), now()).await.unwrap(), None);
        // Other languages never match.
        let other = SummaryCache::new(&repo, &ctx, "de");
        assert_eq!(other.lookup(&five, now()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn stale_entries_only_match_exactly() {
        let repo = InMemoryRepository::new();
        let ctx = ctx();
        let cache = SummaryCache::new(&repo, &ctx, "en");
        let old = now() - Duration::days(10);
        cache
            .store(&ids(&["a", "b", "c", "d", "e"]), "old", old)
            .await
            .unwrap();
        assert_eq!(
            cache
                .lookup(&ids(&["a", "b", "c", "d", "e", "f"]), now())
                .await
                .unwrap(),
            None
        );
    }

    struct CountingSummarizer(AtomicUsize);

    #[async_trait]
    impl ClusterSummarizer for CountingSummarizer {
        async fn summarize(&self, items: &[Item], language: &str) -> anyhow::Result<String> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(format!("{language}: {} reports", items.len()))
        }
    }

    #[tokio::test]
    async fn summaries_are_generated_once() {
        let repo = InMemoryRepository::new();
        let ctx = ctx();
        let cache = SummaryCache::new(&repo, &ctx, "en");
        let summarizer = CountingSummarizer(AtomicUsize::new(0));
        let t = now();
        let items = ["a", "b"]
            .iter()
            .map(|id| Item {
                id: id.to_string(),
                importance_score: 0.5,
                relevance_score: 0.5,
                published_at: t,
                first_seen_at: t,
                source_channel: String::new(),
                source_channel_id: 1,
                source_channel_title: String::new(),
                source_msg_id: 1,
                summary: String::new(),
                topic: String::new(),
                embedding: vec![],
                media: None,
            })
            .collect::<Vec<_>>();

        let first = cache.summary_for(&summarizer, &items, t).await.unwrap();
        let second = cache.summary_for(&summarizer, &items, t).await.unwrap();
        assert_eq!(first, "en: 2 reports");
        assert_eq!(first, second);
        assert_eq!(summarizer.0.load(Ordering::SeqCst), 1);
    }
}
