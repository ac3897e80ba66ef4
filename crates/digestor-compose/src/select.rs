//! Candidate selection for one window.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use digestor_core::scoring::{apply_freshness, clamp01, topic_key};
use digestor_core::{Anomaly, Item, Window};
use digestor_storage::Repository;
use tracing::{debug, info};

use crate::context::RunContext;
use crate::error::ComposeResult;

/// Bonus for an item whose source appears exactly once in the pool.
pub const DIVERSITY_BONUS: f64 = 0.1;

#[derive(Debug, Clone, PartialEq)]
pub struct SelectionConfig {
    pub top_n: usize,
    pub pool_multiplier: usize,
    pub importance_threshold: f64,
    pub freshness_decay_hours: f64,
    pub freshness_floor: f64,
    pub backlog_anomaly_threshold: u64,
    pub with_media: bool,
}

impl SelectionConfig {
    pub fn pool_limit(&self) -> usize {
        self.top_n.saturating_mul(self.pool_multiplier.max(1))
    }
}

/// The sorted, scored candidate pool for a window, or the reason it is empty.
#[derive(Debug, Clone, PartialEq)]
pub struct CandidatePool {
    pub items: Vec<Item>,
    /// Importance as read from the repository, before decay and bonuses.
    pub stored_importance: HashMap<String, f64>,
    pub anomaly: Option<Anomaly>,
}

pub struct Selector<'a> {
    repo: &'a dyn Repository,
    ctx: &'a RunContext,
    config: &'a SelectionConfig,
}

impl<'a> Selector<'a> {
    pub fn new(repo: &'a dyn Repository, ctx: &'a RunContext, config: &'a SelectionConfig) -> Self {
        Self { repo, ctx, config }
    }

    /// Read, rescore and sort the pool. `relevance_deltas` is keyed by channel id.
    pub async fn candidate_pool(
        &self,
        window: &Window,
        now: DateTime<Utc>,
        relevance_deltas: &HashMap<i64, f64>,
    ) -> ComposeResult<CandidatePool> {
        let limit = self.config.pool_limit();
        let threshold = self.config.importance_threshold;
        let items = if self.config.with_media {
            self.ctx
                .guard(
                    "get_items_for_window_with_media",
                    self.repo
                        .get_items_for_window_with_media(window, threshold, limit),
                )
                .await?
        } else {
            self.ctx
                .guard(
                    "get_items_for_window",
                    self.repo.get_items_for_window(window, threshold, limit),
                )
                .await?
        };

        if items.is_empty() {
            let anomaly = self.classify_empty(window).await?;
            return Ok(CandidatePool {
                items,
                stored_importance: HashMap::new(),
                anomaly,
            });
        }

        let stored_importance = items
            .iter()
            .map(|i| (i.id.clone(), i.importance_score))
            .collect();

        let mut items = apply_freshness_decay(
            items,
            now,
            self.config.freshness_decay_hours,
            self.config.freshness_floor,
        );
        apply_diversity_bonus(&mut items);
        apply_relevance_deltas(&mut items, relevance_deltas);
        sort_candidates(&mut items);
        debug!(window = %window, pool = items.len(), "candidate pool");
        Ok(CandidatePool {
            items,
            stored_importance,
            anomaly: None,
        })
    }

    async fn classify_empty(&self, window: &Window) -> ComposeResult<Option<Anomaly>> {
        let threshold = self.config.importance_threshold;
        let total = self
            .ctx
            .guard("count_items_in_window", self.repo.count_items_in_window(window))
            .await?;
        if total > 0 {
            let ready = self
                .ctx
                .guard(
                    "count_ready_items_in_window",
                    self.repo.count_ready_items_in_window(window),
                )
                .await?;
            info!(window = %window, total, ready, threshold, "threshold-starved window");
            return Ok(Some(Anomaly::ThresholdStarved {
                window: *window,
                total_items: total,
                ready_items: ready,
                threshold,
            }));
        }

        let backlog = self
            .ctx
            .guard("get_backlog_count", self.repo.get_backlog_count())
            .await?;
        if backlog > self.config.backlog_anomaly_threshold {
            info!(window = %window, backlog, "empty window with ingestion backlog");
            return Ok(Some(Anomaly::Backlog {
                window: *window,
                backlog_size: backlog,
                threshold,
            }));
        }
        debug!(window = %window, "empty window");
        Ok(None)
    }
}

pub fn apply_freshness_decay(
    mut items: Vec<Item>,
    now: DateTime<Utc>,
    decay_hours: f64,
    floor: f64,
) -> Vec<Item> {
    if decay_hours <= 0.0 {
        return items;
    }
    for item in items.iter_mut() {
        item.importance_score = apply_freshness(
            item.importance_score,
            now,
            item.published_at,
            decay_hours,
            floor,
        );
    }
    items
}

/// Left unclamped; corroboration clamps later.
pub fn apply_diversity_bonus(items: &mut [Item]) {
    let mut counts: HashMap<String, usize> = HashMap::new();
    for item in items.iter() {
        *counts.entry(item.channel_key()).or_default() += 1;
    }
    for item in items.iter_mut() {
        if counts.get(&item.channel_key()) == Some(&1) {
            item.importance_score += DIVERSITY_BONUS;
        }
    }
}

pub fn apply_relevance_deltas(items: &mut [Item], deltas: &HashMap<i64, f64>) {
    if deltas.is_empty() {
        return;
    }
    for item in items.iter_mut() {
        if let Some(delta) = deltas.get(&item.source_channel_id) {
            item.relevance_score = clamp01(item.relevance_score + delta);
        }
    }
}

/// Importance descending, relevance descending; stable for full ties.
pub fn sort_candidates(items: &mut [Item]) {
    items.sort_by(|a, b| {
        b.importance_score
            .total_cmp(&a.importance_score)
            .then(b.relevance_score.total_cmp(&a.relevance_score))
    });
}

#[derive(Debug, Clone, PartialEq)]
pub struct Balanced {
    pub items: Vec<Item>,
    pub relaxed: bool,
}

/// Cap the sorted list at `top_n`, limiting each topic to
/// `max(1, floor(top_n * cap))` items when `0 < cap < 1`.
///
/// If the capped pass leaves slots open while candidates remain, a second
/// pass fills them without the cap and the result is marked relaxed. Blank
/// topics never count against a cap and are only taken by that second pass.
/// The output keeps the input order.
pub fn balance_topics(items: Vec<Item>, top_n: usize, enabled: bool, cap: f64) -> Balanced {
    if !enabled || cap <= 0.0 || cap >= 1.0 || top_n == 0 {
        let mut items = items;
        items.truncate(top_n);
        return Balanced {
            items,
            relaxed: false,
        };
    }

    let max_per_topic = ((top_n as f64 * cap).floor() as usize).max(1);
    let mut picked = vec![false; items.len()];
    let mut per_topic: HashMap<String, usize> = HashMap::new();
    let mut selected = 0usize;

    for (idx, item) in items.iter().enumerate() {
        if selected == top_n {
            break;
        }
        let key = topic_key(&item.topic);
        if key.is_empty() {
            continue;
        }
        let count = per_topic.entry(key).or_default();
        if *count >= max_per_topic {
            continue;
        }
        *count += 1;
        picked[idx] = true;
        selected += 1;
    }

    let target = top_n.min(items.len());
    let relaxed = selected < target;
    if relaxed {
        for flag in picked.iter_mut() {
            if selected == target {
                break;
            }
            if !*flag {
                *flag = true;
                selected += 1;
            }
        }
        debug!(max_per_topic, selected, "topic balance relaxed");
    }

    let items = items
        .into_iter()
        .zip(picked)
        .filter_map(|(item, keep)| keep.then_some(item))
        .collect();
    Balanced { items, relaxed }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use digestor_storage::InMemoryRepository;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 12, 0, 0).unwrap()
    }

    fn item(id: &str, channel: &str, importance: f64, topic: &str) -> Item {
        Item {
            id: id.into(),
            importance_score: importance,
            relevance_score: 0.5,
            published_at: now() - Duration::hours(1),
            first_seen_at: now() - Duration::hours(1),
            source_channel: channel.into(),
            source_channel_id: channel.len() as i64,
            source_channel_title: channel.into(),
            source_msg_id: 1,
            summary: id.into(),
            topic: topic.into(),
            embedding: vec![],
            media: None,
        }
    }

    fn config() -> SelectionConfig {
        SelectionConfig {
            top_n: 5,
            pool_multiplier: 3,
            importance_threshold: 0.5,
            freshness_decay_hours: 0.0,
            freshness_floor: 0.0,
            backlog_anomaly_threshold: 100,
            with_media: false,
        }
    }

    fn window() -> Window {
        Window::new(now() - Duration::hours(4), now()).unwrap()
    }

    #[test]
    fn topic_balance_relaxes_when_topics_run_out() {
        let mut items = Vec::new();
        for n in 0..8 {
            items.push(item(&format!("a{n}"), "wire", 0.9 - n as f64 * 0.05, "A"));
        }
        items.push(item("b0", "desk", 0.52, "B"));
        items.push(item("b1", "desk", 0.51, "b "));

        let out = balance_topics(items, 5, true, 0.3);
        assert!(out.relaxed);
        let ids = out.items.iter().map(|i| i.id.as_str()).collect::<Vec<_>>();
        assert_eq!(ids, vec!["a0", "a1", "a2", "a3", "b0"]);
    }

    #[test]
    fn topic_balance_spreads_when_enough_topics() {
        let items = vec![
            item("a0", "w", 0.9, "A"),
            item("a1", "w", 0.8, "A"),
            item("b0", "w", 0.7, "B"),
            item("c0", "w", 0.6, "C"),
        ];
        let out = balance_topics(items, 2, true, 0.5);
        assert!(!out.relaxed);
        let ids = out.items.iter().map(|i| i.id.as_str()).collect::<Vec<_>>();
        assert_eq!(ids, vec!["a0", "b0"]);
    }

    #[test]
    fn cap_of_one_or_more_only_truncates() {
        let items = (0..6).map(|n| item(&format!("a{n}"), "w", 0.5, "A")).collect();
        let out = balance_topics(items, 3, true, 1.0);
        assert_eq!(out.items.len(), 3);
        assert!(!out.relaxed);
    }

    #[test]
    fn blank_topics_only_fill_in_the_relaxed_pass() {
        let items = vec![item("x", "w", 0.9, "  "), item("a", "w", 0.8, "A")];
        let out = balance_topics(items, 2, true, 0.5);
        assert!(out.relaxed);
        assert_eq!(out.items.len(), 2);
        assert_eq!(out.items[0].id, "x");
    }

    #[test]
    fn diversity_bonus_rewards_single_source_items() {
        let mut items = vec![
            item("a", "wire", 0.5, "A"),
            item("b", "wire", 0.5, "A"),
            item("c", "desk", 0.5, "A"),
        ];
        apply_diversity_bonus(&mut items);
        assert_eq!(items[0].importance_score, 0.5);
        assert!((items[2].importance_score - 0.6).abs() < 1e-9);
    }

    #[test]
    fn sort_breaks_ties_on_relevance() {
        let mut a = item("a", "w", 0.5, "A");
        a.relevance_score = 0.2;
        let b = item("b", "w", 0.5, "A");
        let c = item("c", "w", 0.7, "A");
        let mut items = vec![a, b, c];
        sort_candidates(&mut items);
        let ids = items.iter().map(|i| i.id.as_str()).collect::<Vec<_>>();
        assert_eq!(ids, vec!["c", "b", "a"]);
    }

    #[test]
    fn freshness_halves_at_the_half_life() {
        let mut old = item("a", "w", 0.8, "A");
        old.published_at = now() - Duration::hours(36);
        let out = apply_freshness_decay(vec![old], now(), 36.0, 0.0);
        assert!((out[0].importance_score - 0.4).abs() < 0.01);
    }

    #[test]
    fn relevance_deltas_are_clamped() {
        let mut items = vec![item("a", "wire", 0.5, "A")];
        let deltas = HashMap::from([(4, 0.6)]);
        apply_relevance_deltas(&mut items, &deltas);
        assert_eq!(items[0].relevance_score, 1.0);
    }

    #[tokio::test]
    async fn empty_window_with_backlog_reports_backlog() {
        let repo = InMemoryRepository::new();
        repo.set_backlog_count(250);
        let ctx = RunContext::detached(std::time::Duration::from_secs(5));
        let cfg = config();
        let pool = Selector::new(&repo, &ctx, &cfg)
            .candidate_pool(&window(), now(), &HashMap::new())
            .await
            .unwrap();
        assert!(pool.items.is_empty());
        assert_eq!(
            pool.anomaly,
            Some(Anomaly::Backlog {
                window: window(),
                backlog_size: 250,
                threshold: 0.5,
            })
        );
    }

    #[tokio::test]
    async fn starved_window_reports_totals() {
        let repo = InMemoryRepository::new();
        for n in 0..30 {
            let importance = 0.1 + (n % 4) as f64 * 0.1;
            let it = item(&format!("i{n}"), "wire", importance, "A");
            if n < 25 {
                repo.insert_item(it);
            } else {
                repo.insert_pending_item(it);
            }
        }
        let ctx = RunContext::detached(std::time::Duration::from_secs(5));
        let cfg = config();
        let pool = Selector::new(&repo, &ctx, &cfg)
            .candidate_pool(&window(), now(), &HashMap::new())
            .await
            .unwrap();
        assert_eq!(
            pool.anomaly,
            Some(Anomaly::ThresholdStarved {
                window: window(),
                total_items: 30,
                ready_items: 25,
                threshold: 0.5,
            })
        );
    }

    #[tokio::test]
    async fn pool_keeps_stored_scores_apart_from_rescoring() {
        let repo = InMemoryRepository::new();
        repo.insert_item(item("a", "wire", 0.6, "A"));
        repo.insert_item(item("b", "desk", 0.7, "B"));
        let ctx = RunContext::detached(std::time::Duration::from_secs(5));
        let cfg = SelectionConfig {
            freshness_decay_hours: 1.0,
            ..config()
        };
        let pool = Selector::new(&repo, &ctx, &cfg)
            .candidate_pool(&window(), now(), &HashMap::new())
            .await
            .unwrap();

        assert_eq!(pool.stored_importance.len(), 2);
        assert_eq!(pool.stored_importance["a"], 0.6);
        assert_eq!(pool.stored_importance["b"], 0.7);
        // One half-life of decay, then the single-source bonus.
        let a = pool.items.iter().find(|i| i.id == "a").unwrap();
        assert!((a.importance_score - 0.4).abs() < 1e-6);
    }

    #[tokio::test]
    async fn quiet_window_has_no_anomaly() {
        let repo = InMemoryRepository::new();
        repo.set_backlog_count(3);
        let ctx = RunContext::detached(std::time::Duration::from_secs(5));
        let cfg = config();
        let pool = Selector::new(&repo, &ctx, &cfg)
            .candidate_pool(&window(), now(), &HashMap::new())
            .await
            .unwrap();
        assert_eq!(pool.anomaly, None);
    }
}
