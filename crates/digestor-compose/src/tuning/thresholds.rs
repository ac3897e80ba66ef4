//! Global importance/relevance threshold tuning from the recent rating mix.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use digestor_core::scoring::{clamp, half_life_weight};
use digestor_core::ThresholdTuningLogEntry;
use digestor_storage::Repository;
use serde_json::json;
use tracing::{info, warn};

use super::{RatingTally, TunerTask};
use crate::context::RunContext;
use crate::error::ComposeResult;
use crate::settings::{keys, DigestSettings};

pub const LOOKBACK_DAYS: i64 = 30;
pub const HALF_LIFE_DAYS: f64 = 14.0;
pub const NET_CAP: f64 = 0.3;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThresholdStep {
    pub net: f64,
    pub delta: f64,
}

/// The step to apply, `None` when there is not enough signal.
pub fn threshold_step(tally: &RatingTally, min_samples: usize, step: f64) -> Option<ThresholdStep> {
    if tally.samples < min_samples {
        return None;
    }
    let net = tally.net()?;
    let delta = clamp(net, -NET_CAP, NET_CAP) * step;
    if !delta.is_finite() || delta.abs() < 1e-6 {
        return None;
    }
    Some(ThresholdStep { net, delta })
}

/// `current + delta` inside the configured bounds. `min` is floored at 0,
/// `max` capped at 1 and never below `min`.
pub fn apply_step(current: f64, delta: f64, min: f64, max: f64) -> f64 {
    let lo = min.max(0.0);
    let hi = max.min(1.0).max(lo);
    clamp(current + delta, lo, hi)
}

pub struct ThresholdTuningTask;

#[async_trait]
impl TunerTask for ThresholdTuningTask {
    fn name(&self) -> &'static str {
        "threshold_tuning"
    }

    fn enabled(&self, settings: &DigestSettings) -> bool {
        settings.tuners.threshold_tuning_enabled
    }

    async fn run(
        &self,
        repo: &dyn Repository,
        ctx: &RunContext,
        settings: &DigestSettings,
        now: DateTime<Utc>,
    ) -> ComposeResult<String> {
        let samples = ctx
            .guard(
                "get_rating_samples_since",
                repo.get_rating_samples_since(now - Duration::days(LOOKBACK_DAYS)),
            )
            .await?;
        let tally = RatingTally::from_samples(samples.iter(), now, |age_days| {
            half_life_weight(age_days, HALF_LIFE_DAYS)
        });
        let t = &settings.tuners;
        let Some(step) = threshold_step(&tally, t.rating_min_samples_global, t.threshold_tuning_step)
        else {
            return Ok(format!("insufficient data ({} samples)", tally.samples));
        };

        let importance = apply_step(
            settings.importance_threshold,
            step.delta,
            t.threshold_min,
            t.threshold_max,
        );
        let relevance = apply_step(
            settings.relevance_threshold,
            step.delta,
            t.threshold_min,
            t.threshold_max,
        );
        ctx.guard(
            "set_setting",
            repo.set_setting(keys::IMPORTANCE_THRESHOLD, json!(importance)),
        )
        .await?;
        ctx.guard(
            "set_setting",
            repo.set_setting(keys::RELEVANCE_THRESHOLD, json!(relevance)),
        )
        .await?;
        info!(
            net = step.net,
            delta = step.delta,
            importance,
            relevance,
            "thresholds tuned"
        );

        let entry = ThresholdTuningLogEntry {
            tuned_at: now,
            net_score: step.net,
            delta: step.delta,
            importance_threshold: importance,
            relevance_threshold: relevance,
        };
        if let Err(err) = ctx
            .guard(
                "insert_threshold_tuning_log",
                repo.insert_threshold_tuning_log(&entry),
            )
            .await
        {
            warn!(%err, "threshold tuning log not written");
        }
        Ok(format!(
            "importance {importance:.3}, relevance {relevance:.3} (delta {:+.4})",
            step.delta
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use digestor_core::{Rating, RatingSample};
    use digestor_storage::InMemoryRepository;

    use crate::config::ComposeConfig;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 9, 12, 0, 0).unwrap()
    }

    fn rate(repo: &InMemoryRepository, rating: Rating, n: usize) {
        for i in 0..n {
            repo.add_rating(RatingSample {
                item_id: format!("{rating}-{i}"),
                rating,
                created_at: now(),
                channel_id: 1,
            });
        }
    }

    fn settings() -> DigestSettings {
        let mut s = DigestSettings::defaults(&ComposeConfig::default());
        s.importance_threshold = 0.5;
        s.relevance_threshold = 0.6;
        s
    }

    #[tokio::test]
    async fn positive_feedback_raises_both_thresholds() {
        let repo = InMemoryRepository::new();
        rate(&repo, Rating::Good, 120);
        rate(&repo, Rating::Bad, 40);
        rate(&repo, Rating::Irrelevant, 40);
        let ctx = RunContext::detached(std::time::Duration::from_secs(5));

        ThresholdTuningTask
            .run(&repo, &ctx, &settings(), now())
            .await
            .unwrap();

        let importance = repo.setting(keys::IMPORTANCE_THRESHOLD).unwrap().as_f64().unwrap();
        let relevance = repo.setting(keys::RELEVANCE_THRESHOLD).unwrap().as_f64().unwrap();
        assert!((importance - 0.51).abs() < 1e-9);
        assert!((relevance - 0.61).abs() < 1e-9);
        let log = repo.tuning_log();
        assert_eq!(log.len(), 1);
        assert!((log[0].net_score - 0.2).abs() < 1e-9);
        assert!((log[0].delta - 0.01).abs() < 1e-9);
    }

    #[tokio::test]
    async fn too_few_samples_change_nothing() {
        let repo = InMemoryRepository::new();
        rate(&repo, Rating::Good, 10);
        let ctx = RunContext::detached(std::time::Duration::from_secs(5));
        let outcome = ThresholdTuningTask
            .run(&repo, &ctx, &settings(), now())
            .await
            .unwrap();
        assert!(outcome.starts_with("insufficient data"));
        assert_eq!(repo.setting(keys::IMPORTANCE_THRESHOLD), None);
        assert!(repo.tuning_log().is_empty());
    }

    #[tokio::test]
    async fn log_failures_do_not_fail_the_job() {
        let repo = InMemoryRepository::new();
        rate(&repo, Rating::Bad, 60);
        repo.fail_next("insert_threshold_tuning_log");
        let ctx = RunContext::detached(std::time::Duration::from_secs(5));
        ThresholdTuningTask
            .run(&repo, &ctx, &settings(), now())
            .await
            .unwrap();
        // net -1 capped to -0.3, step 0.05
        let importance = repo.setting(keys::IMPORTANCE_THRESHOLD).unwrap().as_f64().unwrap();
        assert!((importance - 0.485).abs() < 1e-9);
    }

    #[test]
    fn bounds_are_coerced() {
        assert_eq!(apply_step(0.95, 0.1, 0.1, 0.9), 0.9);
        assert_eq!(apply_step(0.05, -0.1, -0.5, 0.9), 0.0);
        assert_eq!(apply_step(0.5, 0.0, 0.7, 0.4), 0.7);
        assert_eq!(apply_step(0.5, 0.25, 0.0, 3.0), 0.75);
    }

    #[test]
    fn tiny_steps_are_ignored() {
        let balanced = RatingTally {
            samples: 100,
            good: 50.0,
            bad: 25.0,
            irrelevant: 25.0,
        };
        assert_eq!(threshold_step(&balanced, 50, 0.05), None);
    }
}
