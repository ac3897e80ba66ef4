//! Digest composition engine.
//!
//! Turns scored items into one digest per scheduled window: select, dedup,
//! balance, cluster, corroborate, render, post, finalize. Adaptive tuners
//! feed user ratings back into channel weights, relevance deltas and the
//! global thresholds.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use digestor_adapters::{LogPoster, Poster, WebhookConfig, WebhookPoster};
use digestor_storage::PgRepository;
use tracing::info;

pub mod anomaly;
pub mod cluster;
pub mod composer;
pub mod config;
pub mod context;
pub mod corroborate;
pub mod dedup;
pub mod error;
pub mod select;
pub mod service;
pub mod settings;
pub mod summary_cache;
pub mod tuning;

pub use composer::{Composer, RunScope, RunSummary};
pub use config::ComposeConfig;
pub use context::{RunContext, Shutdown};
pub use error::{ComposeError, ComposeResult};
pub use service::ComposeService;
pub use settings::DigestSettings;

pub const CRATE_NAME: &str = "digestor-compose";

pub fn build_poster(config: &ComposeConfig) -> Result<Arc<dyn Poster>> {
    match &config.poster_webhook_url {
        Some(url) => {
            let poster = WebhookPoster::new(WebhookConfig {
                base_url: url.clone(),
                timeout: Duration::from_secs(config.http_timeout_secs.max(1)),
                user_agent: Some(config.user_agent.clone()),
                notification_chat_id: (config.target_chat_id != 0).then_some(config.target_chat_id),
            })
            .context("building webhook poster")?;
            info!(base_url = %url, "posting through webhook");
            Ok(Arc::new(poster))
        }
        None => {
            info!("no POSTER_WEBHOOK_URL set, digests go to the log");
            Ok(Arc::new(LogPoster::new()))
        }
    }
}

/// Composer over Postgres and the configured poster.
pub async fn build_composer(config: ComposeConfig) -> Result<Composer> {
    let repo = PgRepository::connect(&config.database_url).await?;
    let poster = build_poster(&config)?;
    Ok(Composer::new(Arc::new(repo), poster, config))
}

/// One full locked run (digests, then due tuners) with env configuration.
pub async fn run_once_from_env() -> Result<RunSummary> {
    let config = ComposeConfig::from_env();
    let ctx = RunContext::detached(config.operation_timeout());
    let composer = build_composer(config).await?;
    let summary = composer
        .run(&ctx, Utc::now(), RunScope::Full)
        .await
        .context("composition run")?;
    Ok(summary)
}
