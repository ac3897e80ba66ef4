//! Pure scoring primitives shared by the selector, clusterer and tuners.

use std::f64::consts::LN_2;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::DEFAULT_TOPIC;

/// Cosine similarity of two equal-length vectors.
///
/// Mismatched lengths, empty inputs and zero-magnitude vectors score `0.0`.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() {
        debug!(left = a.len(), right = b.len(), "embedding dimension mismatch");
        return 0.0;
    }
    if a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f64;
    let mut mag_a = 0.0f64;
    let mut mag_b = 0.0f64;
    for (x, y) in a.iter().zip(b.iter()) {
        let (x, y) = (f64::from(*x), f64::from(*y));
        dot += x * y;
        mag_a += x * x;
        mag_b += y * y;
    }
    if mag_a <= f64::EPSILON || mag_b <= f64::EPSILON {
        return 0.0;
    }
    dot / (mag_a.sqrt() * mag_b.sqrt())
}

/// Clamp into `[lo, hi]`. `NaN` maps to `lo`.
pub fn clamp(value: f64, lo: f64, hi: f64) -> f64 {
    if value.is_nan() || value < lo {
        lo
    } else if value > hi {
        hi
    } else {
        value
    }
}

pub fn clamp01(value: f64) -> f64 {
    clamp(value, 0.0, 1.0)
}

/// Exponential decay weight for an item published at `ts`, observed at `now`.
///
/// Always in `(0, 1]`; future timestamps and a non-positive half-life give `1.0`.
pub fn decay_weight(now: DateTime<Utc>, ts: DateTime<Utc>, half_life_hours: f64) -> f64 {
    if half_life_hours <= 0.0 || half_life_hours.is_nan() {
        return 1.0;
    }
    let age_hours = ((now - ts).num_milliseconds() as f64 / 3_600_000.0).max(0.0);
    let weight = (-age_hours * LN_2 / half_life_hours).exp();
    if weight > 0.0 {
        weight
    } else {
        f64::MIN_POSITIVE
    }
}

/// Freshness-adjusted score: `max(floor, score * decay)`; identity when decay is off.
pub fn apply_freshness(
    score: f64,
    now: DateTime<Utc>,
    published_at: DateTime<Utc>,
    half_life_hours: f64,
    floor: f64,
) -> f64 {
    if half_life_hours <= 0.0 {
        return score;
    }
    let floor = clamp01(floor);
    (score * decay_weight(now, published_at, half_life_hours)).max(floor)
}

/// Weight of a sample that is `age_days` old under the given half-life in days.
pub fn half_life_weight(age_days: f64, half_life_days: f64) -> f64 {
    if half_life_days <= 0.0 {
        return 1.0;
    }
    (-age_days.max(0.0) * LN_2 / half_life_days).exp()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImportanceTier {
    Low,
    Notable,
    High,
    Critical,
}

impl ImportanceTier {
    pub fn classify(importance: f64) -> Self {
        if importance >= 0.8 {
            ImportanceTier::Critical
        } else if importance >= 0.6 {
            ImportanceTier::High
        } else if importance >= 0.4 {
            ImportanceTier::Notable
        } else {
            ImportanceTier::Low
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ImportanceTier::Low => "low",
            ImportanceTier::Notable => "notable",
            ImportanceTier::High => "high",
            ImportanceTier::Critical => "critical",
        }
    }
}

/// Balance key for a topic: trimmed and lower-cased. Empty means "no topic".
pub fn topic_key(topic: &str) -> String {
    topic.trim().to_lowercase()
}

/// Title-cased display form of a topic, [`DEFAULT_TOPIC`] when blank.
pub fn normalize_topic(topic: &str) -> String {
    let words = topic.split_whitespace().collect::<Vec<_>>();
    if words.is_empty() {
        return DEFAULT_TOPIC.to_string();
    }
    words
        .into_iter()
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first
                    .to_uppercase()
                    .chain(chars.flat_map(char::to_lowercase))
                    .collect::<String>(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}
