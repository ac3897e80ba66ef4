//! Topic-aware clustering over the selected items.
//!
//! Clusters are plans over indices into the caller's item slice; the caller
//! owns the items and applies any score changes through the same indices.

use std::collections::HashMap;

use digestor_core::scoring::{cosine_similarity, normalize_topic};
use digestor_core::{Item, ItemEvidence, Window, DEFAULT_TOPIC};
use digestor_storage::Repository;
use tracing::{debug, warn};

use crate::context::RunContext;
use crate::error::ComposeResult;

pub const DEFAULT_COHERENCE_THRESHOLD: f64 = 0.7;
pub const DEFAULT_MAX_POOL: usize = 2000;

#[derive(Debug, Clone, PartialEq)]
pub struct ClusteringConfig {
    /// Zero means "use the global threshold".
    pub similarity_threshold: f64,
    pub cross_topic_enabled: bool,
    /// Zero means "same as `similarity_threshold`".
    pub cross_topic_threshold: f64,
    /// Zero means [`DEFAULT_COHERENCE_THRESHOLD`].
    pub coherence_threshold: f64,
    /// Maximum publish-time distance to the anchor; zero disables the check.
    pub cluster_window_hours: f64,
    pub evidence_enabled: bool,
    pub evidence_boost: f64,
    pub evidence_min_agreement: f64,
    pub max_pool: usize,
}

impl Default for ClusteringConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: 0.0,
            cross_topic_enabled: false,
            cross_topic_threshold: 0.0,
            coherence_threshold: 0.0,
            cluster_window_hours: 24.0,
            evidence_enabled: true,
            evidence_boost: 0.1,
            evidence_min_agreement: 0.6,
            max_pool: DEFAULT_MAX_POOL,
        }
    }
}

impl ClusteringConfig {
    /// Fill zero-valued thresholds from their fallbacks.
    pub fn resolved(mut self, global_similarity: f64) -> Self {
        if self.similarity_threshold <= 0.0 {
            self.similarity_threshold = global_similarity;
        }
        if self.cross_topic_threshold <= 0.0 {
            self.cross_topic_threshold = self.similarity_threshold;
        }
        if self.coherence_threshold <= 0.0 {
            self.coherence_threshold = DEFAULT_COHERENCE_THRESHOLD;
        }
        if self.max_pool == 0 {
            self.max_pool = DEFAULT_MAX_POOL;
        }
        self
    }
}

/// Outcome of evaluating a candidate against a cluster anchor.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PairVerdict {
    SameTopic(f64),
    CrossTopic(f64),
    Reject,
}

impl PairVerdict {
    pub fn admits(&self) -> bool {
        !matches!(self, PairVerdict::Reject)
    }
}

/// One cluster as indices into the clustered slice, representative first.
///
/// Plans built by this module always hold at least the anchor.
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterPlan {
    pub topic: String,
    pub members: Vec<usize>,
}

impl ClusterPlan {
    pub fn representative(&self) -> Option<usize> {
        debug_assert!(!self.members.is_empty(), "cluster plan without members");
        self.members.first().copied()
    }

    pub fn is_consolidated(&self) -> bool {
        self.members.len() > 1
    }

    pub fn item_ids(&self, items: &[Item]) -> Vec<String> {
        self.members
            .iter()
            .filter_map(|&i| items.get(i))
            .map(|item| item.id.clone())
            .collect()
    }
}

/// Qualifying evidence per item: url to agreement score.
#[derive(Debug, Default)]
struct EvidenceIndex {
    by_item: HashMap<String, HashMap<String, f64>>,
}

impl EvidenceIndex {
    fn build(evidence: &[ItemEvidence], min_agreement: f64) -> Self {
        let mut by_item: HashMap<String, HashMap<String, f64>> = HashMap::new();
        for e in evidence {
            if e.is_contradiction || e.agreement_score < min_agreement {
                continue;
            }
            let urls = by_item.entry(e.item_id.clone()).or_default();
            let score = urls.entry(e.url.clone()).or_insert(e.agreement_score);
            *score = score.max(e.agreement_score);
        }
        Self { by_item }
    }

    /// Lowest agreement across URLs both items cite, each URL scored by the
    /// weaker of the two citations.
    fn min_shared_agreement(&self, a: &str, b: &str) -> Option<f64> {
        let ua = self.by_item.get(a)?;
        let ub = self.by_item.get(b)?;
        ua.iter()
            .filter_map(|(url, sa)| ub.get(url).map(|sb| sa.min(*sb)))
            .reduce(f64::min)
    }
}

pub struct TopicClusterer<'a> {
    config: &'a ClusteringConfig,
    evidence: EvidenceIndex,
    topics_enabled: bool,
}

impl<'a> TopicClusterer<'a> {
    pub fn new(config: &'a ClusteringConfig, evidence: &[ItemEvidence], topics_enabled: bool) -> Self {
        let evidence = if config.evidence_enabled {
            EvidenceIndex::build(evidence, config.evidence_min_agreement)
        } else {
            EvidenceIndex::default()
        };
        Self {
            config,
            evidence,
            topics_enabled,
        }
    }

    fn topic_of(&self, item: &Item) -> String {
        if self.topics_enabled {
            normalize_topic(&item.topic)
        } else {
            DEFAULT_TOPIC.to_string()
        }
    }

    /// Cosine similarity plus the evidence boost, capped at 1.
    pub fn boosted_similarity(&self, a: &Item, b: &Item) -> f64 {
        let base = cosine_similarity(&a.embedding, &b.embedding);
        if !self.config.evidence_enabled || self.config.evidence_boost <= 0.0 {
            return base;
        }
        match self.evidence.min_shared_agreement(&a.id, &b.id) {
            Some(agreement) => (base + self.config.evidence_boost * agreement).min(1.0),
            None => base,
        }
    }

    pub fn evaluate(&self, anchor: &Item, candidate: &Item, same_topic: bool) -> PairVerdict {
        if !anchor.has_embedding() || !candidate.has_embedding() {
            return PairVerdict::Reject;
        }
        if self.config.cluster_window_hours > 0.0 {
            let distance_secs = (anchor.published_at - candidate.published_at)
                .num_seconds()
                .abs() as f64;
            if distance_secs > self.config.cluster_window_hours * 3600.0 {
                return PairVerdict::Reject;
            }
        }
        let sim = self.boosted_similarity(anchor, candidate);
        if same_topic {
            if sim >= self.config.similarity_threshold {
                return PairVerdict::SameTopic(sim);
            }
        } else if self.config.cross_topic_enabled && sim >= self.config.cross_topic_threshold {
            return PairVerdict::CrossTopic(sim);
        }
        PairVerdict::Reject
    }

    /// Partition the first `max_pool` items into clusters. Every item inside
    /// the cap lands in exactly one plan; items past the cap are left out.
    pub fn cluster(&self, items: &[Item]) -> Vec<ClusterPlan> {
        let n = items.len().min(self.config.max_pool);
        if items.len() > n {
            warn!(
                pool = items.len(),
                cap = self.config.max_pool,
                "cluster pool over cap, excess items dropped"
            );
        }
        let items = &items[..n];
        let topics = items.iter().map(|i| self.topic_of(i)).collect::<Vec<_>>();

        let mut groups: Vec<(String, Vec<usize>)> = Vec::new();
        for (idx, topic) in topics.iter().enumerate() {
            match groups.iter_mut().find(|(t, _)| t == topic) {
                Some((_, members)) => members.push(idx),
                None => groups.push((topic.clone(), vec![idx])),
            }
        }

        let mut assigned = vec![false; n];
        let mut plans = Vec::new();
        for (topic, members) in &groups {
            for &anchor in members {
                if assigned[anchor] {
                    continue;
                }
                let mut cluster = vec![anchor];
                let cross = self
                    .config
                    .cross_topic_enabled
                    .then(|| (0..n).filter(|&j| topics[j] != *topic))
                    .into_iter()
                    .flatten();
                for candidate in members.iter().copied().chain(cross) {
                    if candidate == anchor || assigned[candidate] || cluster.contains(&candidate) {
                        continue;
                    }
                    let same_topic = topics[candidate] == *topic;
                    if self
                        .evaluate(&items[anchor], &items[candidate], same_topic)
                        .admits()
                    {
                        cluster.push(candidate);
                    }
                }

                if cluster.len() > 2 {
                    let coherence = mean_pairwise_similarity(items, &cluster);
                    if coherence + 1e-9 < self.config.coherence_threshold {
                        debug!(
                            anchor = %items[anchor].id,
                            size = cluster.len(),
                            coherence,
                            "incoherent cluster released"
                        );
                        cluster.truncate(1);
                    }
                }

                cluster.sort_by(|&a, &b| {
                    items[b]
                        .importance_score
                        .total_cmp(&items[a].importance_score)
                        .then(
                            items[b]
                                .summary
                                .chars()
                                .count()
                                .cmp(&items[a].summary.chars().count()),
                        )
                });
                for &m in &cluster {
                    assigned[m] = true;
                }
                plans.push(ClusterPlan {
                    topic: topic.clone(),
                    members: cluster,
                });
            }
        }
        plans
    }
}

/// Mean cosine similarity over all pairs of members that carry an embedding.
pub fn mean_pairwise_similarity(items: &[Item], members: &[usize]) -> f64 {
    let embedded = members
        .iter()
        .map(|&i| &items[i])
        .filter(|i| i.has_embedding())
        .collect::<Vec<_>>();
    let mut total = 0.0;
    let mut pairs = 0usize;
    for (i, a) in embedded.iter().enumerate() {
        for b in embedded.iter().skip(i + 1) {
            total += cosine_similarity(&a.embedding, &b.embedding);
            pairs += 1;
        }
    }
    if pairs == 0 {
        1.0
    } else {
        total / pairs as f64
    }
}

/// One singleton plan per item, used when clustering is off.
pub fn singleton_plans(items: &[Item], topics_enabled: bool) -> Vec<ClusterPlan> {
    items
        .iter()
        .enumerate()
        .map(|(idx, item)| ClusterPlan {
            topic: if topics_enabled {
                normalize_topic(&item.topic)
            } else {
                DEFAULT_TOPIC.to_string()
            },
            members: vec![idx],
        })
        .collect()
}

/// Replace the window's stored clusters with `plans`.
pub async fn persist_clusters(
    repo: &dyn Repository,
    ctx: &RunContext,
    window: &Window,
    items: &[Item],
    plans: &[ClusterPlan],
) -> ComposeResult<()> {
    ctx.guard(
        "delete_clusters_for_window",
        repo.delete_clusters_for_window(window),
    )
    .await?;
    for plan in plans {
        let cluster_id = ctx
            .guard("create_cluster", repo.create_cluster(window, &plan.topic))
            .await?;
        let ids = plan.item_ids(items);
        ctx.guard(
            "add_to_cluster",
            repo.add_to_cluster(&cluster_id, window, &ids),
        )
        .await?;
    }
    debug!(window = %window, clusters = plans.len(), "clusters persisted");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};
    use digestor_storage::InMemoryRepository;

    fn item(id: &str, topic: &str, importance: f64, embedding: Vec<f32>) -> Item {
        let t = Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap();
        Item {
            id: id.into(),
            importance_score: importance,
            relevance_score: 0.5,
            published_at: t,
            first_seen_at: t,
            source_channel: format!("ch-{id}"),
            source_channel_id: id.len() as i64,
            source_channel_title: String::new(),
            source_msg_id: 1,
            summary: format!("summary of {id}"),
            topic: topic.into(),
            embedding,
            media: None,
        }
    }

    fn config() -> ClusteringConfig {
        ClusteringConfig {
            evidence_enabled: false,
            ..ClusteringConfig::default()
        }
        .resolved(0.8)
    }

    fn evidence(item: &str, url: &str, agreement: f64) -> ItemEvidence {
        ItemEvidence {
            item_id: item.into(),
            url: url.into(),
            agreement_score: agreement,
            is_contradiction: false,
        }
    }

    #[test]
    fn representative_is_the_first_member() {
        let plan = ClusterPlan {
            topic: "Tech".into(),
            members: vec![2, 0],
        };
        assert_eq!(plan.representative(), Some(2));
        assert!(plan.is_consolidated());
    }

    #[test]
    fn zero_thresholds_take_fallbacks() {
        let c = ClusteringConfig::default().resolved(0.8);
        assert_eq!(c.similarity_threshold, 0.8);
        assert_eq!(c.cross_topic_threshold, 0.8);
        assert_eq!(c.coherence_threshold, 0.7);
    }

    #[test]
    fn groups_similar_items_within_a_topic() {
        let items = vec![
            item("a", "chips", 0.6, vec![1.0, 0.0]),
            item("b", "Chips ", 0.9, vec![0.99, 0.05]),
            item("c", "chips", 0.5, vec![0.0, 1.0]),
            item("d", "weather", 0.4, vec![1.0, 0.0]),
        ];
        let cfg = config();
        let plans = TopicClusterer::new(&cfg, &[], true).cluster(&items);
        assert_eq!(plans.len(), 3);
        assert_eq!(plans[0].topic, "Chips");
        // Representative is the most important member.
        assert_eq!(plans[0].members, vec![1, 0]);
        assert_eq!(plans[1].members, vec![2]);
        assert_eq!(plans[2].topic, "Weather");
        assert_eq!(plans[2].members, vec![3]);
    }

    #[test]
    fn cross_topic_admission_uses_its_own_threshold() {
        let items = vec![
            item("a", "chips", 0.6, vec![1.0, 0.0]),
            item("b", "trade", 0.5, vec![0.95, 0.1]),
        ];
        let mut cfg = config();
        cfg.cross_topic_enabled = true;
        cfg.cross_topic_threshold = 0.9;
        let clusterer = TopicClusterer::new(&cfg, &[], true);
        assert!(matches!(
            clusterer.evaluate(&items[0], &items[1], false),
            PairVerdict::CrossTopic(_)
        ));
        let plans = clusterer.cluster(&items);
        assert_eq!(plans.len(), 1);

        cfg.cross_topic_threshold = 0.999;
        let plans = TopicClusterer::new(&cfg, &[], true).cluster(&items);
        assert_eq!(plans.len(), 2);
    }

    #[test]
    fn incoherent_clusters_keep_only_the_anchor() {
        let items = vec![
            item("a", "t", 0.9, vec![1.0, 0.0, 0.0]),
            item("b", "t", 0.8, vec![0.0, 1.0, 0.0]),
            item("c", "t", 0.7, vec![0.0, 0.0, 1.0]),
        ];
        let ev = vec![
            evidence("a", "https://x/1", 0.95),
            evidence("b", "https://x/1", 0.95),
            evidence("c", "https://x/1", 0.95),
        ];
        let cfg = ClusteringConfig {
            evidence_boost: 1.0,
            coherence_threshold: 0.9,
            ..ClusteringConfig::default()
        }
        .resolved(0.75);
        let clusterer = TopicClusterer::new(&cfg, &ev, true);
        assert!(clusterer.boosted_similarity(&items[0], &items[1]) >= 0.75);
        let plans = clusterer.cluster(&items);
        assert_eq!(plans[0].members, vec![0]);
        // Released items are free to form their own cluster.
        assert_eq!(plans[1].members, vec![1, 2]);
    }

    #[test]
    fn full_coherence_rejects_non_identical_clusters() {
        let items = vec![
            item("a", "t", 0.9, vec![1.0, 0.0]),
            item("b", "t", 0.8, vec![0.99, 0.01]),
            item("c", "t", 0.7, vec![1.0, 0.0]),
        ];
        let cfg = ClusteringConfig {
            coherence_threshold: 1.0,
            evidence_enabled: false,
            ..ClusteringConfig::default()
        }
        .resolved(0.9);
        let plans = TopicClusterer::new(&cfg, &[], true).cluster(&items);
        assert_eq!(plans[0].members, vec![0]);

        let same = vec![
            item("a", "t", 0.9, vec![1.0, 0.0]),
            item("b", "t", 0.8, vec![1.0, 0.0]),
            item("c", "t", 0.7, vec![1.0, 0.0]),
        ];
        let plans = TopicClusterer::new(&cfg, &[], true).cluster(&same);
        assert_eq!(plans[0].members.len(), 3);
    }

    #[test]
    fn evidence_boost_uses_weakest_shared_agreement() {
        let items = vec![
            item("a", "t", 0.9, vec![1.0, 0.0]),
            item("b", "t", 0.8, vec![0.0, 1.0]),
        ];
        let ev = vec![
            evidence("a", "u1", 0.9),
            evidence("b", "u1", 0.7),
            evidence("a", "u2", 0.8),
            evidence("b", "u2", 0.8),
            evidence("a", "u3", 0.3),
            evidence("b", "u3", 0.3),
        ];
        let cfg = ClusteringConfig {
            evidence_boost: 0.5,
            ..ClusteringConfig::default()
        }
        .resolved(0.8);
        let clusterer = TopicClusterer::new(&cfg, &ev, true);
        let sim = clusterer.boosted_similarity(&items[0], &items[1]);
        assert!((sim - 0.35).abs() < 1e-9);
    }

    #[test]
    fn items_outside_the_cluster_window_are_rejected() {
        let mut late = item("b", "t", 0.8, vec![1.0, 0.0]);
        late.published_at = late.published_at + Duration::hours(30);
        let items = vec![item("a", "t", 0.9, vec![1.0, 0.0]), late];
        let cfg = config();
        let plans = TopicClusterer::new(&cfg, &[], true).cluster(&items);
        assert_eq!(plans.len(), 2);
    }

    #[test]
    fn missing_embeddings_stay_single() {
        let items = vec![
            item("a", "t", 0.9, vec![]),
            item("b", "t", 0.8, vec![1.0, 0.0]),
        ];
        let cfg = config();
        let plans = TopicClusterer::new(&cfg, &[], true).cluster(&items);
        assert_eq!(plans.len(), 2);
    }

    #[test]
    fn pool_cap_drops_the_tail() {
        let items = (0..5)
            .map(|n| item(&format!("i{n}"), &format!("t{n}"), 0.5, vec![1.0]))
            .collect::<Vec<_>>();
        let cfg = ClusteringConfig {
            max_pool: 3,
            ..config()
        };
        let plans = TopicClusterer::new(&cfg, &[], true).cluster(&items);
        assert_eq!(plans.len(), 3);
    }

    #[tokio::test]
    async fn persisting_replaces_stale_clusters() {
        let repo = InMemoryRepository::new();
        let items = vec![
            item("a", "t", 0.9, vec![1.0, 0.0]),
            item("b", "t", 0.8, vec![1.0, 0.0]),
        ];
        for it in &items {
            repo.insert_item(it.clone());
        }
        let window = Window::new(
            Utc.with_ymd_and_hms(2026, 3, 2, 8, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2026, 3, 2, 12, 0, 0).unwrap(),
        )
        .unwrap();
        let ctx = RunContext::detached(std::time::Duration::from_secs(5));
        let cfg = config();
        let plans = TopicClusterer::new(&cfg, &[], true).cluster(&items);

        persist_clusters(&repo, &ctx, &window, &items, &plans)
            .await
            .unwrap();
        persist_clusters(&repo, &ctx, &window, &items, &plans)
            .await
            .unwrap();
        let stored = repo.get_clusters_for_window(&window).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].item_ids(), vec!["a", "b"]);
    }
}
