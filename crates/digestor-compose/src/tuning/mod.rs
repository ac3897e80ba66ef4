//! Adaptive tuners: periodic batch jobs driven by user ratings.
//!
//! Each tuner is a [`TunerTask`] with a due check and a run step. The
//! [`TunerScheduler`] runs due tasks one at a time and records each
//! successful run under `tuner_last_run.<name>`. Failures are logged and
//! never propagate to the digest loop.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use digestor_core::RatingSample;
use digestor_storage::Repository;
use tracing::{debug, info, warn};

use crate::context::RunContext;
use crate::error::ComposeResult;
use crate::settings::{keys, read_timestamp, timestamp_value, DigestSettings};

pub mod auto_weight;
pub mod relevance;
pub mod thresholds;

pub use auto_weight::AutoWeightTask;
pub use relevance::RelevanceDeltaTask;
pub use thresholds::ThresholdTuningTask;

#[async_trait]
pub trait TunerTask: Send + Sync {
    fn name(&self) -> &'static str;

    fn enabled(&self, settings: &DigestSettings) -> bool;

    fn interval(&self) -> Duration {
        Duration::weeks(1)
    }

    fn is_due(&self, now: DateTime<Utc>, last_run: Option<DateTime<Utc>>) -> bool {
        match last_run {
            None => true,
            Some(last) => now - last >= self.interval(),
        }
    }

    /// One batch pass. Returns a short human-readable outcome.
    async fn run(
        &self,
        repo: &dyn Repository,
        ctx: &RunContext,
        settings: &DigestSettings,
        now: DateTime<Utc>,
    ) -> ComposeResult<String>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunerStatus {
    Disabled,
    NotDue,
    Ran(String),
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunerReport {
    pub name: &'static str,
    pub status: TunerStatus,
}

pub struct TunerScheduler {
    tasks: Vec<Box<dyn TunerTask>>,
}

impl Default for TunerScheduler {
    fn default() -> Self {
        Self::new(vec![
            Box::new(AutoWeightTask),
            Box::new(RelevanceDeltaTask),
            Box::new(ThresholdTuningTask),
        ])
    }
}

impl TunerScheduler {
    pub fn new(tasks: Vec<Box<dyn TunerTask>>) -> Self {
        Self { tasks }
    }

    /// Run every enabled, due task serially. `force` ignores the due check.
    pub async fn run_due(
        &self,
        repo: &dyn Repository,
        ctx: &RunContext,
        settings: &DigestSettings,
        now: DateTime<Utc>,
        force: bool,
    ) -> Vec<TunerReport> {
        let mut reports = Vec::with_capacity(self.tasks.len());
        for task in &self.tasks {
            let name = task.name();
            let status = self.run_task(task.as_ref(), repo, ctx, settings, now, force).await;
            reports.push(TunerReport { name, status });
        }
        reports
    }

    async fn run_task(
        &self,
        task: &dyn TunerTask,
        repo: &dyn Repository,
        ctx: &RunContext,
        settings: &DigestSettings,
        now: DateTime<Utc>,
        force: bool,
    ) -> TunerStatus {
        let name = task.name();
        if !task.enabled(settings) {
            return TunerStatus::Disabled;
        }
        let key = keys::tuner_last_run(name);
        if !force {
            let last_run = match read_timestamp(repo, ctx, &key).await {
                Ok(last_run) => last_run,
                Err(err) => {
                    warn!(tuner = name, %err, "could not read last run");
                    return TunerStatus::Failed(err.to_string());
                }
            };
            if !task.is_due(now, last_run) {
                debug!(tuner = name, "not due");
                return TunerStatus::NotDue;
            }
        }

        match task.run(repo, ctx, settings, now).await {
            Ok(outcome) => {
                info!(tuner = name, %outcome, "tuner finished");
                if let Err(err) = ctx
                    .guard("set_setting", repo.set_setting(&key, timestamp_value(now)))
                    .await
                {
                    warn!(tuner = name, %err, "could not record last run");
                }
                TunerStatus::Ran(outcome)
            }
            Err(err) => {
                warn!(tuner = name, %err, "tuner failed");
                TunerStatus::Failed(err.to_string())
            }
        }
    }
}

/// Weighted rating tally; `unknown` counts as bad.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RatingTally {
    pub samples: usize,
    pub good: f64,
    pub bad: f64,
    pub irrelevant: f64,
}

impl RatingTally {
    pub fn total(&self) -> f64 {
        self.good + self.bad + self.irrelevant
    }

    /// `(G - (B + I)) / T`, `None` when there is no weight.
    pub fn net(&self) -> Option<f64> {
        let total = self.total();
        if !(total > 0.0) || !total.is_finite() {
            return None;
        }
        let net = (self.good - (self.bad + self.irrelevant)) / total;
        net.is_finite().then_some(net)
    }

    /// Tally `samples` with `weight(age_days)`, dropping non-positive weights.
    pub fn from_samples<'a>(
        samples: impl IntoIterator<Item = &'a RatingSample>,
        now: DateTime<Utc>,
        weight: impl Fn(f64) -> f64,
    ) -> Self {
        use digestor_core::Rating;

        let mut tally = Self::default();
        for sample in samples {
            let age_days = (now - sample.created_at).num_seconds().max(0) as f64 / 86_400.0;
            let w = weight(age_days);
            if !(w > 0.0) {
                continue;
            }
            tally.samples += 1;
            match sample.rating {
                Rating::Good => tally.good += w,
                Rating::Irrelevant => tally.irrelevant += w,
                Rating::Bad | Rating::Unknown => tally.bad += w,
            }
        }
        tally
    }
}
