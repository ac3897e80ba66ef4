//! Dynamic settings stored in the repository, hydrated in one place.
//!
//! Every key the engine reads is listed in [`keys`] and gets its default in
//! [`DigestSettings::load`]. A value that fails to deserialize is logged and
//! replaced by the default; a repository failure aborts the load.

use chrono::{DateTime, SecondsFormat, Utc};
use digestor_schedule::{CompiledSchedule, Schedule, ScheduleError};
use digestor_storage::Repository;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::warn;

use crate::cluster::ClusteringConfig;
use crate::config::ComposeConfig;
use crate::context::RunContext;
use crate::error::ComposeResult;

pub mod keys {
    pub const DIGEST_SCHEDULE: &str = "digest_schedule";
    pub const DIGEST_ANCHOR: &str = "digest_anchor";
    pub const DIGEST_TOP_N: &str = "digest_top_n";
    pub const IMPORTANCE_THRESHOLD: &str = "importance_threshold";
    pub const RELEVANCE_THRESHOLD: &str = "relevance_threshold";
    pub const TOPICS_ENABLED: &str = "topics_enabled";
    pub const TOPIC_BALANCE_ENABLED: &str = "topic_balance_enabled";
    pub const TOPIC_DIVERSITY_CAP: &str = "topic_diversity_cap";
    pub const FRESHNESS_DECAY_HOURS: &str = "freshness_decay_hours";
    pub const FRESHNESS_FLOOR: &str = "freshness_floor";
    pub const DEDUP_SIMILARITY_THRESHOLD: &str = "dedup_similarity_threshold";
    pub const CLUSTERING_ENABLED: &str = "clustering_enabled";
    pub const CLUSTER_SIMILARITY_THRESHOLD: &str = "cluster_similarity_threshold";
    pub const CROSS_TOPIC_ENABLED: &str = "cross_topic_enabled";
    pub const CROSS_TOPIC_THRESHOLD: &str = "cross_topic_threshold";
    pub const CLUSTER_COHERENCE_THRESHOLD: &str = "cluster_coherence_threshold";
    pub const CLUSTER_WINDOW_HOURS: &str = "cluster_window_hours";
    pub const EVIDENCE_BOOST_ENABLED: &str = "evidence_boost_enabled";
    pub const EVIDENCE_BOOST: &str = "evidence_boost";
    pub const EVIDENCE_MIN_AGREEMENT: &str = "evidence_min_agreement";
    pub const CORROBORATION_BOOST: &str = "corroboration_boost";
    pub const SINGLE_SOURCE_PENALTY: &str = "single_source_penalty";
    pub const DIGEST_COVER_IMAGE: &str = "digest_cover_image";
    pub const ANOMALY_NOTIFICATIONS_ENABLED: &str = "anomaly_notifications_enabled";
    pub const ANOMALY_NOTIFIED_THROUGH: &str = "anomaly_notified_through";
    pub const DIGEST_LANGUAGE: &str = "digest_language";
    pub const AUTO_WEIGHT_ENABLED: &str = "auto_weight_enabled";
    pub const AUTO_RELEVANCE_ENABLED: &str = "auto_relevance_enabled";
    pub const THRESHOLD_TUNING_ENABLED: &str = "threshold_tuning_enabled";
    pub const THRESHOLD_TUNING_STEP: &str = "threshold_tuning_step";
    pub const THRESHOLD_MIN: &str = "threshold_min";
    pub const THRESHOLD_MAX: &str = "threshold_max";
    pub const RATING_MIN_SAMPLES_GLOBAL: &str = "rating_min_samples_global";
    pub const RATING_MIN_SAMPLES_CHANNEL: &str = "rating_min_samples_channel";

    pub fn tuner_last_run(task: &str) -> String {
        format!("tuner_last_run.{task}")
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TunerSettings {
    pub auto_weight_enabled: bool,
    pub auto_relevance_enabled: bool,
    pub threshold_tuning_enabled: bool,
    pub threshold_tuning_step: f64,
    pub threshold_min: f64,
    pub threshold_max: f64,
    pub rating_min_samples_global: usize,
    pub rating_min_samples_channel: usize,
}

impl Default for TunerSettings {
    fn default() -> Self {
        Self {
            auto_weight_enabled: true,
            auto_relevance_enabled: true,
            threshold_tuning_enabled: true,
            threshold_tuning_step: 0.05,
            threshold_min: 0.1,
            threshold_max: 0.9,
            rating_min_samples_global: 50,
            rating_min_samples_channel: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DigestSettings {
    pub schedule: Option<Schedule>,
    pub anchor: Option<DateTime<Utc>>,
    pub top_n: usize,
    pub pool_multiplier: usize,
    pub importance_threshold: f64,
    pub relevance_threshold: f64,
    pub topics_enabled: bool,
    pub topic_balance_enabled: bool,
    pub topic_diversity_cap: f64,
    pub freshness_decay_hours: f64,
    pub freshness_floor: f64,
    pub dedup_similarity_threshold: f64,
    pub clustering_enabled: bool,
    pub clustering: ClusteringConfig,
    pub corroboration_boost: f64,
    pub single_source_penalty: f64,
    pub cover_image: bool,
    pub anomaly_notifications_enabled: bool,
    pub anomaly_notified_through: Option<DateTime<Utc>>,
    pub backlog_anomaly_threshold: u64,
    pub language: String,
    pub tuners: TunerSettings,
}

impl DigestSettings {
    /// Settings with every key at its default, for the given process config.
    pub fn defaults(config: &ComposeConfig) -> Self {
        Self {
            schedule: None,
            anchor: None,
            top_n: config.top_n,
            pool_multiplier: config.pool_multiplier.max(1),
            importance_threshold: config.importance_threshold,
            relevance_threshold: config.relevance_threshold,
            topics_enabled: true,
            topic_balance_enabled: true,
            topic_diversity_cap: 0.3,
            freshness_decay_hours: config.freshness_decay_hours,
            freshness_floor: config.freshness_floor,
            dedup_similarity_threshold: config.dedup_similarity_threshold,
            clustering_enabled: true,
            clustering: ClusteringConfig {
                max_pool: config.cluster_max_pool,
                ..ClusteringConfig::default()
            },
            corroboration_boost: 0.05,
            single_source_penalty: 0.05,
            cover_image: false,
            anomaly_notifications_enabled: true,
            anomaly_notified_through: None,
            backlog_anomaly_threshold: config.backlog_anomaly_threshold,
            language: config.digest_language.clone(),
            tuners: TunerSettings::default(),
        }
    }

    pub async fn load(
        repo: &dyn Repository,
        ctx: &RunContext,
        config: &ComposeConfig,
    ) -> ComposeResult<Self> {
        let d = Self::defaults(config);
        let r = SettingsReader { repo, ctx };

        let clustering = ClusteringConfig {
            similarity_threshold: r
                .get(keys::CLUSTER_SIMILARITY_THRESHOLD, d.clustering.similarity_threshold)
                .await?,
            cross_topic_enabled: r
                .get(keys::CROSS_TOPIC_ENABLED, d.clustering.cross_topic_enabled)
                .await?,
            cross_topic_threshold: r
                .get(keys::CROSS_TOPIC_THRESHOLD, d.clustering.cross_topic_threshold)
                .await?,
            coherence_threshold: r
                .get(keys::CLUSTER_COHERENCE_THRESHOLD, d.clustering.coherence_threshold)
                .await?,
            cluster_window_hours: r
                .get(keys::CLUSTER_WINDOW_HOURS, d.clustering.cluster_window_hours)
                .await?,
            evidence_enabled: r
                .get(keys::EVIDENCE_BOOST_ENABLED, d.clustering.evidence_enabled)
                .await?,
            evidence_boost: r.get(keys::EVIDENCE_BOOST, d.clustering.evidence_boost).await?,
            evidence_min_agreement: r
                .get(keys::EVIDENCE_MIN_AGREEMENT, d.clustering.evidence_min_agreement)
                .await?,
            max_pool: d.clustering.max_pool,
        }
        .resolved(config.cluster_similarity_threshold);

        let tuners = TunerSettings {
            auto_weight_enabled: r
                .get(keys::AUTO_WEIGHT_ENABLED, d.tuners.auto_weight_enabled)
                .await?,
            auto_relevance_enabled: r
                .get(keys::AUTO_RELEVANCE_ENABLED, d.tuners.auto_relevance_enabled)
                .await?,
            threshold_tuning_enabled: r
                .get(keys::THRESHOLD_TUNING_ENABLED, d.tuners.threshold_tuning_enabled)
                .await?,
            threshold_tuning_step: r
                .get(keys::THRESHOLD_TUNING_STEP, d.tuners.threshold_tuning_step)
                .await?,
            threshold_min: r.get(keys::THRESHOLD_MIN, d.tuners.threshold_min).await?,
            threshold_max: r.get(keys::THRESHOLD_MAX, d.tuners.threshold_max).await?,
            rating_min_samples_global: r
                .get(keys::RATING_MIN_SAMPLES_GLOBAL, d.tuners.rating_min_samples_global)
                .await?,
            rating_min_samples_channel: r
                .get(keys::RATING_MIN_SAMPLES_CHANNEL, d.tuners.rating_min_samples_channel)
                .await?,
        };

        Ok(Self {
            schedule: r.schedule().await?,
            anchor: r.get(keys::DIGEST_ANCHOR, d.anchor).await?,
            top_n: r.get(keys::DIGEST_TOP_N, d.top_n).await?,
            pool_multiplier: d.pool_multiplier,
            importance_threshold: r
                .get(keys::IMPORTANCE_THRESHOLD, d.importance_threshold)
                .await?,
            relevance_threshold: r.get(keys::RELEVANCE_THRESHOLD, d.relevance_threshold).await?,
            topics_enabled: r.get(keys::TOPICS_ENABLED, d.topics_enabled).await?,
            topic_balance_enabled: r
                .get(keys::TOPIC_BALANCE_ENABLED, d.topic_balance_enabled)
                .await?,
            topic_diversity_cap: r.get(keys::TOPIC_DIVERSITY_CAP, d.topic_diversity_cap).await?,
            freshness_decay_hours: r
                .get(keys::FRESHNESS_DECAY_HOURS, d.freshness_decay_hours)
                .await?,
            freshness_floor: r.get(keys::FRESHNESS_FLOOR, d.freshness_floor).await?,
            dedup_similarity_threshold: r
                .get(keys::DEDUP_SIMILARITY_THRESHOLD, d.dedup_similarity_threshold)
                .await?,
            clustering_enabled: r.get(keys::CLUSTERING_ENABLED, d.clustering_enabled).await?,
            clustering,
            corroboration_boost: r.get(keys::CORROBORATION_BOOST, d.corroboration_boost).await?,
            single_source_penalty: r
                .get(keys::SINGLE_SOURCE_PENALTY, d.single_source_penalty)
                .await?,
            cover_image: r.get(keys::DIGEST_COVER_IMAGE, d.cover_image).await?,
            anomaly_notifications_enabled: r
                .get(
                    keys::ANOMALY_NOTIFICATIONS_ENABLED,
                    d.anomaly_notifications_enabled,
                )
                .await?,
            anomaly_notified_through: r
                .get(keys::ANOMALY_NOTIFIED_THROUGH, d.anomaly_notified_through)
                .await?,
            backlog_anomaly_threshold: d.backlog_anomaly_threshold,
            language: r.get(keys::DIGEST_LANGUAGE, d.language).await?,
            tuners,
        })
    }

    /// Compiled schedule, `Ok(None)` when digests are disabled.
    pub fn compiled_schedule(&self) -> Result<Option<CompiledSchedule>, ScheduleError> {
        match &self.schedule {
            None => Ok(None),
            Some(schedule) if schedule.is_empty() => Ok(None),
            Some(schedule) => schedule.compile().map(Some),
        }
    }
}

/// Serialized form used for every timestamp setting.
pub fn timestamp_value(ts: DateTime<Utc>) -> Value {
    Value::String(ts.to_rfc3339_opts(SecondsFormat::Secs, true))
}

/// Typed read of one timestamp setting, used for tuner bookkeeping.
pub async fn read_timestamp(
    repo: &dyn Repository,
    ctx: &RunContext,
    key: &str,
) -> ComposeResult<Option<DateTime<Utc>>> {
    SettingsReader { repo, ctx }.get(key, None).await
}

struct SettingsReader<'a> {
    repo: &'a dyn Repository,
    ctx: &'a RunContext,
}

impl SettingsReader<'_> {
    async fn get<T: DeserializeOwned>(&self, key: &str, default: T) -> ComposeResult<T> {
        let raw = self
            .ctx
            .guard("get_setting", self.repo.get_setting(key))
            .await?;
        Ok(match raw {
            None | Some(Value::Null) => default,
            Some(value) => decode(key, value).unwrap_or(default),
        })
    }

    /// The schedule may be stored as a JSON object or as a string holding one.
    async fn schedule(&self) -> ComposeResult<Option<Schedule>> {
        let raw = self
            .ctx
            .guard("get_setting", self.repo.get_setting(keys::DIGEST_SCHEDULE))
            .await?;
        Ok(match raw {
            None | Some(Value::Null) => None,
            Some(Value::String(text)) if text.trim().is_empty() => None,
            Some(Value::String(text)) => match Schedule::from_json(&text) {
                Ok(schedule) => Some(schedule),
                Err(err) => {
                    warn!(key = keys::DIGEST_SCHEDULE, %err, "malformed setting, digests disabled");
                    None
                }
            },
            Some(value) => decode(keys::DIGEST_SCHEDULE, value),
        })
    }
}

fn decode<T: DeserializeOwned>(key: &str, value: Value) -> Option<T> {
    match serde_json::from_value(value) {
        Ok(v) => Some(v),
        Err(err) => {
            warn!(key, %err, "malformed setting, using default");
            None
        }
    }
}
