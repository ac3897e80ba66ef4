//! Core domain model for the digest composition engine.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod scoring;

pub const CRATE_NAME: &str = "digestor-core";

/// Display topic used when an item carries no topic.
pub const DEFAULT_TOPIC: &str = "General";

/// A scored, embedded item produced by the ingestion pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    pub id: String,
    pub importance_score: f64,
    pub relevance_score: f64,
    pub published_at: DateTime<Utc>,
    pub first_seen_at: DateTime<Utc>,
    /// Channel username; empty for private channels.
    pub source_channel: String,
    pub source_channel_id: i64,
    pub source_channel_title: String,
    pub source_msg_id: i64,
    pub summary: String,
    pub topic: String,
    #[serde(default)]
    pub embedding: Vec<f32>,
    /// Cover media; only hydrated by the `with_media` repository reads.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media: Option<Vec<u8>>,
}

impl Item {
    pub fn has_embedding(&self) -> bool {
        !self.embedding.is_empty()
    }

    /// Key used for source-diversity accounting: the username when present,
    /// otherwise the numeric channel id.
    pub fn channel_key(&self) -> String {
        let username = self.source_channel.trim();
        if username.is_empty() {
            format!("#{}", self.source_channel_id)
        } else {
            username.to_ascii_lowercase()
        }
    }
}

/// Third-party reference attached to an item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemEvidence {
    pub item_id: String,
    pub url: String,
    pub agreement_score: f64,
    pub is_contradiction: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FactCheck {
    pub item_id: String,
    pub claim: String,
    pub verdict: String,
    pub url: Option<String>,
}

/// Half-open `[start, end)` UTC range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Window {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl Window {
    /// Returns `None` unless `start < end`.
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Option<Self> {
        (start < end).then_some(Self { start, end })
    }

    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        self.start <= ts && ts < self.end
    }

    pub fn duration(&self) -> Duration {
        self.end - self.start
    }
}

impl fmt::Display for Window {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start.to_rfc3339(), self.end.to_rfc3339())
    }
}

/// A topic cluster persisted for a window. The representative item is first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cluster {
    pub id: String,
    pub topic: String,
    pub items: Vec<Item>,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
}

impl Cluster {
    pub fn representative(&self) -> Option<&Item> {
        self.items.first()
    }

    pub fn item_ids(&self) -> Vec<String> {
        self.items.iter().map(|i| i.id.clone()).collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Rating {
    Good,
    Bad,
    Irrelevant,
    Unknown,
}

impl Rating {
    /// Case-insensitive parse; anything unrecognised is `Unknown`.
    pub fn parse_lenient(raw: &str) -> Self {
        raw.parse().unwrap_or(Rating::Unknown)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Rating::Good => "good",
            Rating::Bad => "bad",
            Rating::Irrelevant => "irrelevant",
            Rating::Unknown => "unknown",
        }
    }
}

impl FromStr for Rating {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "good" => Ok(Rating::Good),
            "bad" => Ok(Rating::Bad),
            "irrelevant" => Ok(Rating::Irrelevant),
            "unknown" | "" => Ok(Rating::Unknown),
            other => Err(format!("unrecognised rating {other:?}")),
        }
    }
}

impl fmt::Display for Rating {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RatingSample {
    pub item_id: String,
    pub rating: Rating,
    pub created_at: DateTime<Utc>,
    pub channel_id: i64,
}

/// Per-channel activity over a lookback.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct RollingStats {
    pub total_messages: u64,
    pub items_created: u64,
    pub items_digested: u64,
    /// `None` when nothing from the channel was digested.
    pub avg_importance_digested: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelInfo {
    pub id: i64,
    pub username: String,
    pub title: String,
    pub auto_weight_enabled: bool,
    /// A manually pinned weight; auto-weighting leaves it alone.
    pub weight_override: bool,
    pub importance_weight: f64,
    pub relevance_delta: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterSummaryCacheEntry {
    pub digest_language: String,
    pub fingerprint: String,
    pub item_ids: Vec<String>,
    pub summary: String,
    pub created_at: DateTime<Utc>,
}

/// One rendered section of a posted digest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DigestEntry {
    pub position: u32,
    pub title: String,
    pub body: String,
    pub topic: String,
    pub item_ids: Vec<String>,
    pub channel_ids: Vec<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DigestRecord {
    pub id: Uuid,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub chat_id: i64,
    pub message_id: i64,
    pub posted_at: DateTime<Utc>,
    pub entries: Vec<DigestEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdTuningLogEntry {
    pub tuned_at: DateTime<Utc>,
    pub net_score: f64,
    pub delta: f64,
    pub importance_threshold: f64,
    pub relevance_threshold: f64,
}

/// Counters recorded after a window has been posted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DigestWindowStats {
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub candidates: usize,
    pub selected: usize,
    pub clusters: usize,
    pub topic_balance_relaxed: bool,
    pub posted_at: DateTime<Utc>,
}

/// Why a window produced no digest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Anomaly {
    /// Items exist in the window but none cleared the importance threshold.
    ThresholdStarved {
        window: Window,
        total_items: u64,
        ready_items: u64,
        threshold: f64,
    },
    /// The window is empty while ingestion is behind.
    Backlog {
        window: Window,
        backlog_size: u64,
        threshold: f64,
    },
}

impl Anomaly {
    pub fn window(&self) -> &Window {
        match self {
            Anomaly::ThresholdStarved { window, .. } | Anomaly::Backlog { window, .. } => window,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Anomaly::ThresholdStarved { .. } => "threshold",
            Anomaly::Backlog { .. } => "backlog",
        }
    }
}
