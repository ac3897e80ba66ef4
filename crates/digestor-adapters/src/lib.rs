//! Collaborator seams consumed by the composition engine: the outbound
//! poster, the cluster summarizer and the render adapter.

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use digestor_core::Item;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, info_span, Instrument};
use uuid::Uuid;

pub mod render;

pub use render::{ComposedCluster, ComposedDigest, RenderOptions, RenderedDigest};

pub const CRATE_NAME: &str = "digestor-adapters";

#[derive(Debug, Error)]
pub enum PosterError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("{0}")]
    Message(String),
}

/// Outbound delivery sink. Returns the sink's message id.
#[async_trait]
pub trait Poster: Send + Sync {
    async fn send_digest(&self, chat_id: i64, text: &str, digest_id: Uuid)
        -> Result<i64, PosterError>;

    async fn send_digest_with_image(
        &self,
        chat_id: i64,
        text: &str,
        digest_id: Uuid,
        image: &[u8],
    ) -> Result<i64, PosterError>;

    async fn send_notification(&self, text: &str) -> Result<i64, PosterError>;
}

/// Poster that only logs; used for dry runs and when no sink is configured.
#[derive(Debug, Default)]
pub struct LogPoster {
    next_message_id: AtomicI64,
}

impl LogPoster {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_id(&self) -> i64 {
        self.next_message_id.fetch_add(1, Ordering::Relaxed) + 1
    }
}

#[async_trait]
impl Poster for LogPoster {
    async fn send_digest(
        &self,
        chat_id: i64,
        text: &str,
        digest_id: Uuid,
    ) -> Result<i64, PosterError> {
        info!(chat_id, %digest_id, chars = text.chars().count(), "digest (log sink)\n{text}");
        Ok(self.next_id())
    }

    async fn send_digest_with_image(
        &self,
        chat_id: i64,
        text: &str,
        digest_id: Uuid,
        image: &[u8],
    ) -> Result<i64, PosterError> {
        info!(
            chat_id,
            %digest_id,
            image_bytes = image.len(),
            "digest with cover (log sink)\n{text}"
        );
        Ok(self.next_id())
    }

    async fn send_notification(&self, text: &str) -> Result<i64, PosterError> {
        info!("notification (log sink)\n{text}");
        Ok(self.next_id())
    }
}

#[derive(Debug, Clone)]
pub struct WebhookConfig {
    pub base_url: String,
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub notification_chat_id: Option<i64>,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            timeout: Duration::from_secs(20),
            user_agent: None,
            notification_chat_id: None,
        }
    }
}

#[derive(Debug, Serialize)]
struct DigestPayload<'a> {
    chat_id: i64,
    text: &'a str,
    digest_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    image_base64: Option<String>,
}

#[derive(Debug, Serialize)]
struct NotificationPayload<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    chat_id: Option<i64>,
    text: &'a str,
}

#[derive(Debug, Deserialize)]
struct SendResponse {
    message_id: i64,
}

/// Posts JSON to a delivery bridge (`POST {base}/digest`, `POST {base}/notify`).
///
/// Sends are never retried here; the orchestrator records the failure for
/// the window instead.
#[derive(Debug)]
pub struct WebhookPoster {
    client: reqwest::Client,
    base_url: String,
    notification_chat_id: Option<i64>,
}

impl WebhookPoster {
    pub fn new(config: WebhookConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder().timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            notification_chat_id: config.notification_chat_id,
        })
    }

    async fn post<T: Serialize + ?Sized>(&self, path: &str, body: &T) -> Result<i64, PosterError> {
        let url = format!("{}/{path}", self.base_url);
        let span = info_span!("webhook_post", url = %url);
        async move {
            let resp = self.client.post(&url).json(body).send().await?;
            let status = resp.status();
            if !status.is_success() {
                return Err(PosterError::HttpStatus {
                    status: status.as_u16(),
                    url,
                });
            }
            if status == StatusCode::NO_CONTENT {
                return Err(PosterError::Message(format!(
                    "{url} returned no message id"
                )));
            }
            let parsed: SendResponse = resp.json().await?;
            Ok(parsed.message_id)
        }
        .instrument(span)
        .await
    }
}

#[async_trait]
impl Poster for WebhookPoster {
    async fn send_digest(
        &self,
        chat_id: i64,
        text: &str,
        digest_id: Uuid,
    ) -> Result<i64, PosterError> {
        self.post(
            "digest",
            &DigestPayload {
                chat_id,
                text,
                digest_id,
                image_base64: None,
            },
        )
        .await
    }

    async fn send_digest_with_image(
        &self,
        chat_id: i64,
        text: &str,
        digest_id: Uuid,
        image: &[u8],
    ) -> Result<i64, PosterError> {
        self.post(
            "digest",
            &DigestPayload {
                chat_id,
                text,
                digest_id,
                image_base64: Some(BASE64.encode(image)),
            },
        )
        .await
    }

    async fn send_notification(&self, text: &str) -> Result<i64, PosterError> {
        self.post(
            "notify",
            &NotificationPayload {
                chat_id: self.notification_chat_id,
                text,
            },
        )
        .await
    }
}

/// Produces a short narrative for a multi-item cluster (the LLM gateway seam).
#[async_trait]
pub trait ClusterSummarizer: Send + Sync {
    async fn summarize(&self, items: &[Item], language: &str) -> anyhow::Result<String>;
}

/// Picks the representative's own summary; no model involved.
#[derive(Debug, Default, Clone, Copy)]
pub struct ExtractiveSummarizer;

#[async_trait]
impl ClusterSummarizer for ExtractiveSummarizer {
    async fn summarize(&self, items: &[Item], _language: &str) -> anyhow::Result<String> {
        let representative = items
            .iter()
            .find(|i| !i.summary.trim().is_empty())
            .context("cluster has no summarizable item")?;
        Ok(representative.summary.trim().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn item(id: &str, summary: &str) -> Item {
        let t = Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap();
        Item {
            id: id.into(),
            importance_score: 0.5,
            relevance_score: 0.5,
            published_at: t,
            first_seen_at: t,
            source_channel: "wire".into(),
            source_channel_id: 1,
            source_channel_title: "Wire".into(),
            source_msg_id: 10,
            summary: summary.into(),
            topic: "tech".into(),
            embedding: vec![],
            media: None,
        }
    }

    #[tokio::test]
    async fn log_poster_hands_out_increasing_ids() {
        let poster = LogPoster::new();
        let a = poster.send_digest(1, "hello", Uuid::new_v4()).await.unwrap();
        let b = poster.send_notification("note").await.unwrap();
        assert!(b > a);
    }

    #[tokio::test]
    async fn extractive_summary_skips_blank_summaries() {
        let items = vec![item("a", "  "), item("b", "Chip export rules tightened")];
        let summary = ExtractiveSummarizer.summarize(&items, "en").await.unwrap();
        assert_eq!(summary, "Chip export rules tightened");
        assert!(ExtractiveSummarizer
            .summarize(&[item("c", "")], "en")
            .await
            .is_err());
    }

    #[test]
    fn webhook_base_url_is_normalized() {
        let poster = WebhookPoster::new(WebhookConfig {
            base_url: "http://bridge.local/".into(),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(poster.base_url, "http://bridge.local");
    }

    #[test]
    fn cover_images_travel_as_base64() {
        let digest_id = Uuid::nil();
        let plain = serde_json::to_value(DigestPayload {
            chat_id: 7,
            text: "hi",
            digest_id,
            image_base64: None,
        })
        .unwrap();
        assert!(plain.get("image_base64").is_none());

        let with_cover = serde_json::to_value(DigestPayload {
            chat_id: 7,
            text: "hi",
            digest_id,
            image_base64: Some(BASE64.encode(b"png")),
        })
        .unwrap();
        assert_eq!(with_cover["image_base64"], "cG5n");
        assert_eq!(with_cover["digest_id"], "00000000-0000-0000-0000-000000000000");
    }
}
