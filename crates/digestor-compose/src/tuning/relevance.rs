//! Per-channel relevance deltas from each channel's recent rating mix.
//!
//! The selector adds a channel's delta to its items' relevance before
//! sorting, so well-rated channels win importance ties.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use digestor_core::scoring::{clamp, half_life_weight};
use digestor_core::RatingSample;
use digestor_storage::Repository;
use tracing::debug;

use super::{RatingTally, TunerTask};
use crate::context::RunContext;
use crate::error::ComposeResult;
use crate::settings::DigestSettings;

pub const LOOKBACK_DAYS: i64 = 30;
pub const HALF_LIFE_DAYS: f64 = 14.0;
pub const GAIN: f64 = 0.15;
pub const MAX_DELTA: f64 = 0.15;
pub const MIN_CHANGE: f64 = 0.01;

pub fn relevance_delta(tally: &RatingTally, min_samples: usize) -> Option<f64> {
    if tally.samples < min_samples {
        return None;
    }
    tally
        .net()
        .map(|net| clamp(net * GAIN, -MAX_DELTA, MAX_DELTA))
}

pub struct RelevanceDeltaTask;

#[async_trait]
impl TunerTask for RelevanceDeltaTask {
    fn name(&self) -> &'static str {
        "relevance_delta"
    }

    fn enabled(&self, settings: &DigestSettings) -> bool {
        settings.tuners.auto_relevance_enabled
    }

    async fn run(
        &self,
        repo: &dyn Repository,
        ctx: &RunContext,
        settings: &DigestSettings,
        now: DateTime<Utc>,
    ) -> ComposeResult<String> {
        let channels = ctx.guard("list_channels", repo.list_channels()).await?;
        let samples = ctx
            .guard(
                "get_rating_samples_since",
                repo.get_rating_samples_since(now - Duration::days(LOOKBACK_DAYS)),
            )
            .await?;
        let mut by_channel: HashMap<i64, Vec<&RatingSample>> = HashMap::new();
        for sample in &samples {
            by_channel.entry(sample.channel_id).or_default().push(sample);
        }

        let mut updated = 0usize;
        for channel in channels {
            let Some(rated) = by_channel.get(&channel.id) else {
                continue;
            };
            let tally = RatingTally::from_samples(rated.iter().copied(), now, |age_days| {
                half_life_weight(age_days, HALF_LIFE_DAYS)
            });
            let Some(delta) = relevance_delta(&tally, settings.tuners.rating_min_samples_channel)
            else {
                continue;
            };
            if (delta - channel.relevance_delta).abs() < MIN_CHANGE {
                continue;
            }
            debug!(channel = channel.id, old = channel.relevance_delta, new = delta, "relevance delta");
            ctx.guard(
                "update_channel_relevance_delta",
                repo.update_channel_relevance_delta(channel.id, delta, now),
            )
            .await?;
            updated += 1;
        }
        Ok(format!("{updated} relevance delta(s) updated"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use digestor_core::{ChannelInfo, Rating};
    use digestor_storage::InMemoryRepository;

    use crate::config::ComposeConfig;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 9, 12, 0, 0).unwrap()
    }

    #[test]
    fn delta_is_bounded() {
        let all_bad = RatingTally {
            samples: 20,
            bad: 20.0,
            ..Default::default()
        };
        assert_eq!(relevance_delta(&all_bad, 10), Some(-0.15));
        let mixed = RatingTally {
            samples: 20,
            good: 15.0,
            bad: 5.0,
            ..Default::default()
        };
        assert!((relevance_delta(&mixed, 10).unwrap() - 0.075).abs() < 1e-9);
        assert_eq!(relevance_delta(&mixed, 21), None);
    }

    #[tokio::test]
    async fn updates_rated_channels_only() {
        let repo = InMemoryRepository::new();
        for id in [1, 2, 3] {
            repo.upsert_channel(ChannelInfo {
                id,
                username: format!("ch{id}"),
                title: String::new(),
                auto_weight_enabled: true,
                weight_override: false,
                importance_weight: 1.0,
                relevance_delta: if id == 2 { 0.15 } else { 0.0 },
            });
        }
        for n in 0..12 {
            for (channel_id, rating) in [(1, Rating::Good), (2, Rating::Good), (3, Rating::Bad)] {
                if channel_id == 3 && n >= 5 {
                    continue;
                }
                repo.add_rating(RatingSample {
                    item_id: format!("{channel_id}-{n}"),
                    rating,
                    created_at: now() - Duration::hours(n),
                    channel_id,
                });
            }
        }
        let ctx = RunContext::detached(std::time::Duration::from_secs(5));
        let settings = DigestSettings::defaults(&ComposeConfig::default());
        let outcome = RelevanceDeltaTask
            .run(&repo, &ctx, &settings, now())
            .await
            .unwrap();

        assert_eq!(outcome, "1 relevance delta(s) updated");
        assert_eq!(repo.channel(1).unwrap().relevance_delta, 0.15);
        // Already at the target.
        assert_eq!(repo.channel(2).unwrap().relevance_delta, 0.15);
        // Too few samples.
        assert_eq!(repo.channel(3).unwrap().relevance_delta, 0.0);
    }
}
