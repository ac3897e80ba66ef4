//! Long-running service: a composition tick and an hourly tuner tick on one
//! scheduler, serialized by a process-local gate.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, info, warn};

use crate::composer::{Composer, RunScope};
use crate::context::{RunContext, Shutdown};

pub const TUNER_TICK: Duration = Duration::from_secs(60 * 60);

pub struct ComposeService {
    composer: Arc<Composer>,
    shutdown: Arc<Shutdown>,
    gate: Arc<Mutex<()>>,
}

impl ComposeService {
    pub fn new(composer: Composer) -> Self {
        Self {
            composer: Arc::new(composer),
            shutdown: Arc::new(Shutdown::new()),
            gate: Arc::new(Mutex::new(())),
        }
    }

    pub fn shutdown_handle(&self) -> Arc<Shutdown> {
        self.shutdown.clone()
    }

    pub async fn build_scheduler(&self) -> Result<JobScheduler> {
        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let ctx = self
            .shutdown
            .context(self.composer.config().operation_timeout());
        let tick = Duration::from_secs(self.composer.config().tick_secs.max(1));

        let compose_job = {
            let composer = self.composer.clone();
            let gate = self.gate.clone();
            let ctx = ctx.clone();
            Job::new_repeated_async(tick, move |_uuid, _l| {
                let composer = composer.clone();
                let gate = gate.clone();
                let ctx = ctx.clone();
                Box::pin(async move {
                    let Ok(_running) = gate.try_lock() else {
                        debug!("previous run still in progress, tick skipped");
                        return;
                    };
                    run_tick(&composer, &ctx, RunScope::DigestsOnly).await;
                })
            })
            .context("creating composition job")?
        };
        sched.add(compose_job).await.context("adding composition job")?;

        let tuner_job = {
            let composer = self.composer.clone();
            let gate = self.gate.clone();
            Job::new_repeated_async(TUNER_TICK, move |_uuid, _l| {
                let composer = composer.clone();
                let gate = gate.clone();
                let ctx = ctx.clone();
                Box::pin(async move {
                    let _running = gate.lock().await;
                    run_tick(&composer, &ctx, RunScope::TunersOnly { force: false }).await;
                })
            })
            .context("creating tuner job")?
        };
        sched.add(tuner_job).await.context("adding tuner job")?;
        Ok(sched)
    }

    /// Run until Ctrl-C, then cancel the in-flight run and stop the scheduler.
    pub async fn run_until_shutdown(self) -> Result<()> {
        let mut sched = self.build_scheduler().await?;
        sched.start().await.context("starting scheduler")?;
        info!(
            tick_secs = self.composer.config().tick_secs,
            lock_id = self.composer.lock_id(),
            "composition service started"
        );

        tokio::signal::ctrl_c()
            .await
            .context("waiting for shutdown signal")?;
        info!("shutdown requested");
        self.shutdown.trigger();
        sched.shutdown().await.context("stopping scheduler")?;
        let _idle = self.gate.lock().await;
        info!("composition service stopped");
        Ok(())
    }
}

async fn run_tick(composer: &Composer, ctx: &RunContext, scope: RunScope) {
    match composer.run(ctx, Utc::now(), scope).await {
        Ok(summary) => {
            if summary.lock_acquired && (summary.windows > 0 || !summary.tuners.is_empty()) {
                info!(
                    windows = summary.windows,
                    posted = summary.posted,
                    skipped = summary.skipped_existing,
                    send_failures = summary.send_failures,
                    anomalies = summary.anomalies.len(),
                    "run finished"
                );
            }
        }
        Err(err) if err.is_cancelled() => debug!("run cancelled"),
        Err(err) => warn!(%err, "run failed"),
    }
}
