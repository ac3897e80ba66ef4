//! The per-tick composition run: leader election, window loop, anomaly
//! report and adaptive tuners.
//!
//! A run holds the advisory lock for its whole duration. Windows are
//! processed strictly in time order; each one either posts exactly one
//! digest, is skipped because a digest already exists, comes up empty, or
//! records a send failure. The anchor moves forward over every settled
//! window (posted, already emitted or empty) but never past a window whose
//! send failed in the same run, so the failed window is rebuilt and retried
//! on the next tick.
//!
//! Once the sink accepts a digest the window counts as posted: the digest
//! record is written first, and a failing write after the send is logged
//! instead of aborting the window.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use digestor_adapters::render::render;
use digestor_adapters::{
    ClusterSummarizer, ComposedCluster, ComposedDigest, ExtractiveSummarizer, Poster,
    RenderOptions,
};
use digestor_core::{Anomaly, DigestRecord, DigestWindowStats, Item, Window};
use digestor_schedule::{build_windows, CompiledSchedule};
use digestor_storage::{advisory_lock_id, Repository};
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::anomaly::{render_report, unreported};
use crate::cluster::{persist_clusters, singleton_plans, ClusterPlan, TopicClusterer};
use crate::config::ComposeConfig;
use crate::context::RunContext;
use crate::corroborate::{corroborate, persisted_scores, CorroborationConfig};
use crate::dedup::dedup_by_embedding;
use crate::error::{ComposeError, ComposeResult};
use crate::select::{balance_topics, Balanced, CandidatePool, SelectionConfig, Selector};
use crate::settings::{keys, timestamp_value, DigestSettings};
use crate::summary_cache::SummaryCache;
use crate::tuning::{TunerReport, TunerScheduler};

/// What a run covers once the lock is held.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunScope {
    /// Digest windows, then due tuners.
    Full,
    DigestsOnly,
    /// Tuners only; `force` ignores their due checks.
    TunersOnly { force: bool },
}

impl RunScope {
    fn digests(self) -> bool {
        matches!(self, RunScope::Full | RunScope::DigestsOnly)
    }

    fn tuners(self) -> Option<bool> {
        match self {
            RunScope::Full => Some(false),
            RunScope::DigestsOnly => None,
            RunScope::TunersOnly { force } => Some(force),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunSummary {
    pub lock_acquired: bool,
    pub windows: usize,
    pub posted: usize,
    pub skipped_existing: usize,
    pub empty: usize,
    pub send_failures: usize,
    pub anomalies: Vec<Anomaly>,
    pub anomaly_notified: bool,
    /// Set when an I/O failure stopped the window loop early.
    pub aborted: Option<String>,
    pub tuners: Vec<TunerReport>,
}

#[derive(Debug)]
enum WindowOutcome {
    AlreadyEmitted,
    Empty(Option<Anomaly>),
    SendFailed(String),
    Posted { digest_id: Uuid, message_id: i64 },
}

pub struct Composer {
    repo: Arc<dyn Repository>,
    poster: Arc<dyn Poster>,
    summarizer: Arc<dyn ClusterSummarizer>,
    tuners: TunerScheduler,
    config: ComposeConfig,
    lock_id: i64,
}

impl Composer {
    pub fn new(repo: Arc<dyn Repository>, poster: Arc<dyn Poster>, config: ComposeConfig) -> Self {
        let lock_id = advisory_lock_id(&config.lease_name);
        Self {
            repo,
            poster,
            summarizer: Arc::new(ExtractiveSummarizer),
            tuners: TunerScheduler::default(),
            config,
            lock_id,
        }
    }

    pub fn with_summarizer(mut self, summarizer: Arc<dyn ClusterSummarizer>) -> Self {
        self.summarizer = summarizer;
        self
    }

    pub fn with_tuners(mut self, tuners: TunerScheduler) -> Self {
        self.tuners = tuners;
        self
    }

    pub fn config(&self) -> &ComposeConfig {
        &self.config
    }

    pub fn lock_id(&self) -> i64 {
        self.lock_id
    }

    /// One locked run. Returns an empty summary with `lock_acquired = false`
    /// when another replica holds the lease.
    pub async fn run(
        &self,
        ctx: &RunContext,
        now: DateTime<Utc>,
        scope: RunScope,
    ) -> ComposeResult<RunSummary> {
        let mut summary = RunSummary::default();
        let acquired = ctx
            .guard(
                "try_acquire_advisory_lock",
                self.repo.try_acquire_advisory_lock(self.lock_id),
            )
            .await?;
        if !acquired {
            debug!(lock_id = self.lock_id, "advisory lock held elsewhere, skipping run");
            return Ok(summary);
        }
        summary.lock_acquired = true;

        let result = self.run_locked(ctx, now, scope, &mut summary).await;

        // Released even when the run was cancelled.
        let release_ctx = RunContext::detached(ctx.op_timeout());
        if let Err(err) = release_ctx
            .guard(
                "release_advisory_lock",
                self.repo.release_advisory_lock(self.lock_id),
            )
            .await
        {
            warn!(lock_id = self.lock_id, %err, "advisory lock release failed");
        }
        result.map(|()| summary)
    }

    /// Windows the next run would process, without taking the lock.
    pub async fn plan_windows(
        &self,
        ctx: &RunContext,
        now: DateTime<Utc>,
    ) -> ComposeResult<Vec<Window>> {
        let settings = DigestSettings::load(self.repo.as_ref(), ctx, &self.config).await?;
        let schedule = settings
            .compiled_schedule()
            .map_err(|err| ComposeError::Settings(err.to_string()))?;
        Ok(schedule
            .map(|s| build_windows(&s, now, self.config.catchup(), settings.anchor))
            .unwrap_or_default())
    }

    async fn run_locked(
        &self,
        ctx: &RunContext,
        now: DateTime<Utc>,
        scope: RunScope,
        summary: &mut RunSummary,
    ) -> ComposeResult<()> {
        let settings = DigestSettings::load(self.repo.as_ref(), ctx, &self.config).await?;
        if scope.digests() {
            self.run_digests(ctx, now, &settings, summary).await?;
        }
        if let Some(force) = scope.tuners() {
            summary.tuners = self
                .tuners
                .run_due(self.repo.as_ref(), ctx, &settings, now, force)
                .await;
        }
        Ok(())
    }

    async fn run_digests(
        &self,
        ctx: &RunContext,
        now: DateTime<Utc>,
        settings: &DigestSettings,
        summary: &mut RunSummary,
    ) -> ComposeResult<()> {
        let schedule = match settings.compiled_schedule() {
            Ok(Some(schedule)) => schedule,
            Ok(None) => {
                debug!("no digest schedule configured");
                return Ok(());
            }
            Err(err) => {
                warn!(%err, "invalid digest schedule, digests skipped");
                return Ok(());
            }
        };
        let windows = build_windows(&schedule, now, self.config.catchup(), settings.anchor);
        if windows.is_empty() {
            return Ok(());
        }
        let deltas = self.relevance_deltas(ctx, settings).await?;

        let mut anchor_blocked = false;
        for window in windows {
            summary.windows += 1;
            let span = info_span!("window", start = %window.start, end = %window.end);
            let outcome = self
                .process_window(ctx, now, settings, &schedule, &window, &deltas)
                .instrument(span)
                .await;
            let settled = match outcome {
                Ok(WindowOutcome::AlreadyEmitted) => {
                    debug!(window = %window, "digest already emitted");
                    summary.skipped_existing += 1;
                    true
                }
                Ok(WindowOutcome::Empty(anomaly)) => {
                    summary.empty += 1;
                    if let Some(anomaly) = anomaly {
                        info!(window = %window, kind = anomaly.kind(), "anomaly recorded");
                        summary.anomalies.push(anomaly);
                    }
                    true
                }
                Ok(WindowOutcome::SendFailed(error)) => {
                    warn!(window = %window, %error, "digest send failed");
                    summary.send_failures += 1;
                    anchor_blocked = true;
                    false
                }
                Ok(WindowOutcome::Posted {
                    digest_id,
                    message_id,
                }) => {
                    info!(window = %window, %digest_id, message_id, "digest posted");
                    summary.posted += 1;
                    true
                }
                Err(err) if err.is_cancelled() => return Err(err),
                Err(err) => {
                    warn!(window = %window, %err, "window aborted");
                    summary.aborted = Some(err.to_string());
                    break;
                }
            };
            if settled && !anchor_blocked {
                if let Err(err) = ctx
                    .guard(
                        "set_setting",
                        self.repo
                            .set_setting(keys::DIGEST_ANCHOR, timestamp_value(window.end)),
                    )
                    .await
                {
                    if err.is_cancelled() {
                        return Err(err);
                    }
                    warn!(window = %window, %err, "anchor not advanced");
                    summary.aborted = Some(err.to_string());
                    break;
                }
            }
        }

        self.notify_anomalies(ctx, settings, summary).await
    }

    /// Per-channel relevance deltas consulted by the selector.
    async fn relevance_deltas(
        &self,
        ctx: &RunContext,
        settings: &DigestSettings,
    ) -> ComposeResult<HashMap<i64, f64>> {
        if !settings.tuners.auto_relevance_enabled {
            return Ok(HashMap::new());
        }
        let channels = ctx
            .guard("list_channels", self.repo.list_channels())
            .await?;
        Ok(channels
            .into_iter()
            .filter(|c| c.relevance_delta != 0.0 && c.relevance_delta.is_finite())
            .map(|c| (c.id, c.relevance_delta))
            .collect())
    }

    async fn process_window(
        &self,
        ctx: &RunContext,
        now: DateTime<Utc>,
        settings: &DigestSettings,
        schedule: &CompiledSchedule,
        window: &Window,
        deltas: &HashMap<i64, f64>,
    ) -> ComposeResult<WindowOutcome> {
        let repo = self.repo.as_ref();
        if ctx.guard("digest_exists", repo.digest_exists(window)).await? {
            return Ok(WindowOutcome::AlreadyEmitted);
        }

        let selection = SelectionConfig {
            top_n: settings.top_n,
            pool_multiplier: settings.pool_multiplier,
            importance_threshold: settings.importance_threshold,
            freshness_decay_hours: settings.freshness_decay_hours,
            freshness_floor: settings.freshness_floor,
            backlog_anomaly_threshold: settings.backlog_anomaly_threshold,
            with_media: settings.cover_image,
        };
        let CandidatePool {
            items: pool,
            stored_importance,
            anomaly,
        } = Selector::new(repo, ctx, &selection)
            .candidate_pool(window, now, deltas)
            .await?;
        if pool.is_empty() {
            return Ok(WindowOutcome::Empty(anomaly));
        }
        let candidates = pool.len();

        let deduped = dedup_by_embedding(pool, settings.dedup_similarity_threshold);
        let Balanced {
            mut items,
            relaxed,
        } = balance_topics(
            deduped,
            settings.top_n,
            settings.topics_enabled && settings.topic_balance_enabled,
            settings.topic_diversity_cap,
        );
        if relaxed {
            debug!(window = %window, "topic balance relaxed");
        }

        let mut importance_updates = Vec::new();
        let mut plans = if settings.clustering_enabled {
            let ids = items.iter().map(|i| i.id.clone()).collect::<Vec<_>>();
            let evidence = if settings.clustering.evidence_enabled {
                ctx.guard("get_evidence_for_items", repo.get_evidence_for_items(&ids))
                    .await?
            } else {
                Vec::new()
            };
            let plans = TopicClusterer::new(&settings.clustering, &evidence, settings.topics_enabled)
                .cluster(&items);
            items.truncate(settings.clustering.max_pool);
            persist_clusters(repo, ctx, window, &items, &plans).await?;

            let adjustments = corroborate(
                &mut items,
                &plans,
                &CorroborationConfig {
                    boost: settings.corroboration_boost,
                    single_source_penalty: settings.single_source_penalty,
                },
            );
            importance_updates = persisted_scores(&adjustments, &stored_importance);
            plans
        } else {
            singleton_plans(&items, settings.topics_enabled)
        };
        let lead_score = |plan: &ClusterPlan| {
            plan.representative()
                .and_then(|idx| items.get(idx))
                .map_or(f64::NEG_INFINITY, |item| item.importance_score)
        };
        plans.sort_by(|a, b| lead_score(b).total_cmp(&lead_score(a)));

        let digest = self
            .compose(ctx, now, settings, window, &items, &plans)
            .await?;
        let options = RenderOptions {
            timezone: schedule.timezone(),
            ..RenderOptions::default()
        };
        let rendered = render(&digest, &options);
        if rendered.entries.is_empty() {
            return Ok(WindowOutcome::Empty(None));
        }
        let rendered_ids = rendered
            .entries
            .iter()
            .flat_map(|e| e.item_ids.iter().cloned())
            .collect::<Vec<_>>();
        let cover = settings
            .cover_image
            .then(|| cover_image(&digest, &rendered_ids))
            .flatten();

        let digest_id = Uuid::new_v4();
        let chat_id = self.config.target_chat_id;
        let sent = match cover {
            Some(image) => {
                ctx.guard(
                    "send_digest_with_image",
                    self.poster
                        .send_digest_with_image(chat_id, &rendered.text, digest_id, image),
                )
                .await
            }
            None => {
                ctx.guard(
                    "send_digest",
                    self.poster.send_digest(chat_id, &rendered.text, digest_id),
                )
                .await
            }
        };
        let message_id = match sent {
            Ok(message_id) => message_id,
            Err(err @ (ComposeError::Poster(_) | ComposeError::Timeout { .. })) => {
                let error = err.to_string();
                ctx.guard(
                    "save_digest_error",
                    repo.save_digest_error(window, chat_id, &error),
                )
                .await?;
                return Ok(WindowOutcome::SendFailed(error));
            }
            Err(err) => return Err(err),
        };

        // Not cancelled by shutdown; each write only logs on failure.
        let after_send = RunContext::detached(ctx.op_timeout());
        let record = DigestRecord {
            id: digest_id,
            window_start: window.start,
            window_end: window.end,
            chat_id,
            message_id,
            posted_at: now,
            entries: rendered.entries.clone(),
        };
        let stored_id = match record_after_send(
            &after_send,
            window,
            "save_digest",
            repo.save_digest(&record),
        )
        .await
        {
            Some(stored_id) => {
                record_after_send(
                    &after_send,
                    window,
                    "save_digest_entries",
                    repo.save_digest_entries(stored_id, &rendered.entries),
                )
                .await;
                stored_id
            }
            None => digest_id,
        };
        record_after_send(
            &after_send,
            window,
            "mark_items_as_digested",
            repo.mark_items_as_digested(&rendered_ids, now),
        )
        .await;
        if !importance_updates.is_empty() {
            record_after_send(
                &after_send,
                window,
                "update_item_importance",
                repo.update_item_importance(&importance_updates),
            )
            .await;
        }

        let stats = DigestWindowStats {
            window_start: window.start,
            window_end: window.end,
            candidates,
            selected: rendered_ids.len(),
            clusters: rendered.entries.len(),
            topic_balance_relaxed: relaxed,
            posted_at: now,
        };
        record_after_send(
            &after_send,
            window,
            "save_digest_stats",
            repo.save_digest_stats(&stats),
        )
        .await;

        Ok(WindowOutcome::Posted {
            digest_id: stored_id,
            message_id,
        })
    }

    /// Materialize plans into owned clusters with summaries and annotations.
    async fn compose(
        &self,
        ctx: &RunContext,
        now: DateTime<Utc>,
        settings: &DigestSettings,
        window: &Window,
        items: &[Item],
        plans: &[ClusterPlan],
    ) -> ComposeResult<ComposedDigest> {
        let repo = self.repo.as_ref();
        let cache = SummaryCache::new(repo, ctx, &settings.language);
        let mut clusters = Vec::with_capacity(plans.len());
        for plan in plans {
            let members = plan
                .members
                .iter()
                .filter_map(|&i| items.get(i).cloned())
                .collect::<Vec<_>>();
            let summary = if plan.is_consolidated() {
                Some(
                    cache
                        .summary_for(self.summarizer.as_ref(), &members, now)
                        .await?,
                )
            } else {
                None
            };
            clusters.push(ComposedCluster {
                topic: plan.topic.clone(),
                items: members,
                summary,
            });
        }

        let ids = clusters
            .iter()
            .flat_map(|c| c.items.iter().map(|i| i.id.clone()))
            .collect::<Vec<_>>();
        let evidence = ctx
            .guard("get_evidence_for_items", repo.get_evidence_for_items(&ids))
            .await?;
        let fact_checks = ctx
            .guard(
                "get_fact_checks_for_items",
                repo.get_fact_checks_for_items(&ids),
            )
            .await?;
        Ok(ComposedDigest {
            window: *window,
            clusters,
            evidence,
            fact_checks,
        })
    }

    async fn notify_anomalies(
        &self,
        ctx: &RunContext,
        settings: &DigestSettings,
        summary: &mut RunSummary,
    ) -> ComposeResult<()> {
        if summary.anomalies.is_empty() || !settings.anomaly_notifications_enabled {
            return Ok(());
        }
        let fresh = unreported(&summary.anomalies, settings.anomaly_notified_through);
        let Some(text) = render_report(&fresh) else {
            debug!("anomalies already reported");
            return Ok(());
        };
        match ctx
            .guard("send_notification", self.poster.send_notification(&text))
            .await
        {
            Ok(_) => {
                summary.anomaly_notified = true;
                if let Some(through) = fresh.iter().map(|a| a.window().end).max() {
                    if let Err(err) = ctx
                        .guard(
                            "set_setting",
                            self.repo
                                .set_setting(keys::ANOMALY_NOTIFIED_THROUGH, timestamp_value(through)),
                        )
                        .await
                    {
                        warn!(%err, "anomaly watermark not recorded");
                    }
                }
            }
            Err(err) if err.is_cancelled() => return Err(err),
            Err(err) => warn!(%err, "anomaly notification failed"),
        }
        Ok(())
    }
}

async fn record_after_send<T, F>(
    ctx: &RunContext,
    window: &Window,
    op: &'static str,
    fut: F,
) -> Option<T>
where
    F: Future<Output = anyhow::Result<T>>,
{
    match ctx.guard(op, fut).await {
        Ok(value) => Some(value),
        Err(err) => {
            warn!(window = %window, op, %err, "write after send failed");
            None
        }
    }
}

/// Media of the first rendered item that carries any.
fn cover_image<'d>(digest: &'d ComposedDigest, rendered_ids: &[String]) -> Option<&'d [u8]> {
    digest
        .clusters
        .iter()
        .flat_map(|c| c.items.iter())
        .filter(|i| rendered_ids.contains(&i.id))
        .find_map(|i| i.media.as_deref().filter(|m| !m.is_empty()))
}
