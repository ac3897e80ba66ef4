//! Per-channel importance weight from rolling activity plus rating reliability.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use digestor_core::scoring::{clamp, clamp01};
use digestor_core::{RatingSample, RollingStats};
use digestor_storage::Repository;
use tracing::debug;

use super::{RatingTally, TunerTask};
use crate::context::RunContext;
use crate::error::ComposeResult;
use crate::settings::DigestSettings;

pub const ROLLING_WINDOW_DAYS: i64 = 30;
pub const RELIABILITY_WINDOW_DAYS: i64 = 60;
pub const RELIABILITY_HALF_LIFE_DAYS: f64 = 30.0;
pub const AUTO_MIN: f64 = 0.5;
pub const AUTO_MAX: f64 = 1.5;
pub const MIN_MESSAGES: u64 = 10;
pub const EXPECTED_MESSAGES_PER_DAY: f64 = 5.0;
pub const MIN_CHANGE: f64 = 0.05;
const IRRELEVANT_PENALTY_RATE: f64 = 0.35;
const IRRELEVANT_PENALTY: f64 = 0.05;

/// Activity-based weight, `None` for channels too quiet to judge.
pub fn base_weight(stats: &RollingStats, window_days: f64) -> Option<f64> {
    if stats.total_messages < MIN_MESSAGES {
        return None;
    }
    let inclusion = stats.items_digested as f64 / stats.items_created.max(1) as f64;
    let importance = stats.avg_importance_digested.unwrap_or(0.5);
    let per_day = stats.total_messages as f64 / window_days.max(1.0);
    let consistency = (per_day / EXPECTED_MESSAGES_PER_DAY).min(1.0);
    let signal = stats.items_created as f64 / stats.total_messages.max(1) as f64;
    let raw = 0.4 * inclusion + 0.3 * importance + 0.2 * consistency + 0.1 * signal;
    Some(clamp(0.5 + raw, AUTO_MIN, AUTO_MAX))
}

/// `2^(-age / 30 days)`.
pub fn reliability_weight(age_days: f64) -> f64 {
    2f64.powf(-age_days.max(0.0) / RELIABILITY_HALF_LIFE_DAYS)
}

/// Additive weight adjustment from a channel's rating mix.
pub fn reliability_delta(tally: &RatingTally) -> Option<f64> {
    let total = tally.total();
    if !(total > 0.0) {
        return None;
    }
    let good_rate = tally.good / total;
    let irrelevant_rate = tally.irrelevant / total;
    let reliability = clamp01(0.5 + (good_rate - irrelevant_rate) * 0.5);
    let mut delta = (reliability - 0.5) * 0.2;
    if irrelevant_rate >= IRRELEVANT_PENALTY_RATE {
        delta -= IRRELEVANT_PENALTY;
    }
    Some(delta)
}

pub struct AutoWeightTask;

#[async_trait]
impl TunerTask for AutoWeightTask {
    fn name(&self) -> &'static str {
        "auto_weight"
    }

    fn enabled(&self, settings: &DigestSettings) -> bool {
        settings.tuners.auto_weight_enabled
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
                repo.get_rating_samples_since(now - Duration::days(RELIABILITY_WINDOW_DAYS)),
            )
            .await?;
        let mut by_channel: HashMap<i64, Vec<&RatingSample>> = HashMap::new();
        for sample in &samples {
            by_channel.entry(sample.channel_id).or_default().push(sample);
        }

        let since = now - Duration::days(ROLLING_WINDOW_DAYS);
        let min_samples = settings.tuners.rating_min_samples_channel;
        let mut updated = 0usize;
        let mut skipped = 0usize;
        for channel in channels {
            if channel.weight_override || !channel.auto_weight_enabled {
                skipped += 1;
                continue;
            }
            let stats = ctx
                .guard(
                    "get_channel_rolling_stats",
                    repo.get_channel_rolling_stats(channel.id, since),
                )
                .await?;
            let Some(mut weight) = base_weight(&stats, ROLLING_WINDOW_DAYS as f64) else {
                skipped += 1;
                continue;
            };

            let rated = by_channel.get(&channel.id).map(Vec::as_slice).unwrap_or(&[]);
            let tally = RatingTally::from_samples(rated.iter().copied(), now, reliability_weight);
            if tally.samples >= min_samples {
                if let Some(delta) = reliability_delta(&tally) {
                    weight = clamp(weight + delta, AUTO_MIN, AUTO_MAX);
                }
            }

            if (weight - channel.importance_weight).abs() < MIN_CHANGE {
                continue;
            }
            debug!(
                channel = channel.id,
                old = channel.importance_weight,
                new = weight,
                "auto weight"
            );
            ctx.guard(
                "update_channel_auto_weight",
                repo.update_channel_auto_weight(channel.id, weight, now),
            )
            .await?;
            updated += 1;
        }
        Ok(format!("{updated} channel weight(s) updated, {skipped} skipped"))
    }
}
