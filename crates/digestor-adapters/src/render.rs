//! Render adapter: turns a composed digest into sink text plus persisted entries.

use std::collections::BTreeSet;

use chrono_tz::Tz;
use digestor_core::scoring::ImportanceTier;
use digestor_core::{DigestEntry, FactCheck, Item, ItemEvidence, Window};

/// A cluster ready for rendering; the representative item is first.
#[derive(Debug, Clone, PartialEq)]
pub struct ComposedCluster {
    pub topic: String,
    pub items: Vec<Item>,
    pub summary: Option<String>,
}

impl ComposedCluster {
    pub fn representative(&self) -> Option<&Item> {
        self.items.first()
    }

    pub fn is_consolidated(&self) -> bool {
        self.items.len() > 1
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ComposedDigest {
    pub window: Window,
    pub clusters: Vec<ComposedCluster>,
    pub evidence: Vec<ItemEvidence>,
    pub fact_checks: Vec<FactCheck>,
}

#[derive(Debug, Clone)]
pub struct RenderOptions {
    pub timezone: Tz,
    pub max_chars: usize,
    pub heading: String,
}

impl Default for RenderOptions {
    fn default() -> Self {
        Self {
            timezone: Tz::UTC,
            max_chars: 4096,
            heading: "Digest".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RenderedDigest {
    pub text: String,
    pub entries: Vec<DigestEntry>,
}

pub fn render(digest: &ComposedDigest, options: &RenderOptions) -> RenderedDigest {
    let start = digest.window.start.with_timezone(&options.timezone);
    let end = digest.window.end.with_timezone(&options.timezone);
    let mut text = format!(
        "*{}* {} - {} ({})\n",
        options.heading,
        start.format("%Y-%m-%d %H:%M"),
        end.format("%H:%M"),
        options.timezone.name()
    );

    let mut entries = Vec::new();
    let mut current_tier: Option<ImportanceTier> = None;
    let mut omitted = 0usize;

    for cluster in &digest.clusters {
        let Some(representative) = cluster.representative() else {
            continue;
        };
        if omitted > 0 {
            omitted += 1;
            continue;
        }
        let tier = ImportanceTier::classify(representative.importance_score);
        let mut block = String::new();
        if current_tier != Some(tier) {
            block.push_str(&format!("\n*{}*\n", tier_heading(tier)));
        }
        let body = entry_body(cluster, digest);
        block.push_str(&format!("• *{}*: {}\n", cluster.topic, body));

        let footer_reserve = 32;
        let used = text.chars().count();
        if used + block.chars().count() + footer_reserve > options.max_chars {
            if !entries.is_empty() {
                omitted += 1;
                continue;
            }
            // A lone oversized entry is cut to the budget rather than dropped.
            let budget = options.max_chars.saturating_sub(used + footer_reserve);
            block = truncate_chars(&block, budget);
        }
        text.push_str(&block);
        current_tier = Some(tier);

        let channel_ids = cluster
            .items
            .iter()
            .map(|i| i.source_channel_id)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        entries.push(DigestEntry {
            position: entries.len() as u32,
            title: cluster.topic.clone(),
            body,
            topic: cluster.topic.clone(),
            item_ids: cluster.items.iter().map(|i| i.id.clone()).collect(),
            channel_ids,
        });
    }

    if omitted > 0 {
        text.push_str(&format!("\n…and {omitted} more\n"));
    }

    RenderedDigest { text, entries }
}

/// At most `max` chars, ending in an ellipsis and newline when cut.
fn truncate_chars(block: &str, max: usize) -> String {
    if block.chars().count() <= max {
        return block.to_string();
    }
    let mut cut = block
        .chars()
        .take(max.saturating_sub(2))
        .collect::<String>()
        .trim_end()
        .to_string();
    cut.push_str("…\n");
    cut
}

fn tier_heading(tier: ImportanceTier) -> &'static str {
    match tier {
        ImportanceTier::Critical => "Breaking",
        ImportanceTier::High => "Top stories",
        ImportanceTier::Notable => "Notable",
        ImportanceTier::Low => "Also noted",
    }
}

fn entry_body(cluster: &ComposedCluster, digest: &ComposedDigest) -> String {
    let Some(representative) = cluster.representative() else {
        return String::new();
    };
    let summary = cluster
        .summary
        .as_deref()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or(representative.summary.as_str())
        .trim()
        .to_string();

    let mut lines = vec![summary];

    if cluster.is_consolidated() {
        let sources = cluster
            .items
            .iter()
            .map(source_label)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect::<Vec<_>>();
        lines.push(format!(
            "  sources: {} ({} reports)",
            sources.join(", "),
            cluster.items.len()
        ));
    }

    let item_ids = cluster.items.iter().map(|i| i.id.as_str()).collect::<Vec<_>>();
    let references = digest
        .evidence
        .iter()
        .filter(|e| item_ids.contains(&e.item_id.as_str()) && !e.is_contradiction)
        .map(|e| e.url.as_str())
        .collect::<BTreeSet<_>>();
    if !references.is_empty() {
        lines.push(format!("  corroborated by {} references", references.len()));
    }

    for check in digest
        .fact_checks
        .iter()
        .filter(|f| item_ids.contains(&f.item_id.as_str()))
    {
        lines.push(format!("  fact-check ({}): {}", check.verdict, check.claim));
    }

    lines.push(format!("  {}", item_link(representative)));
    lines.join("\n")
}

fn source_label(item: &Item) -> String {
    if item.source_channel.trim().is_empty() {
        item.source_channel_title.clone()
    } else {
        format!("@{}", item.source_channel.trim())
    }
}

fn item_link(item: &Item) -> String {
    let username = item.source_channel.trim();
    if username.is_empty() {
        format!("{} #{}", item.source_channel_title, item.source_msg_id)
    } else {
        format!("https://t.me/{}/{}", username, item.source_msg_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn item(id: &str, channel: &str, channel_id: i64, importance: f64, summary: &str) -> Item {
        let t = Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap();
        Item {
            id: id.into(),
            importance_score: importance,
            relevance_score: 0.5,
            published_at: t,
            first_seen_at: t,
            source_channel: channel.into(),
            source_channel_id: channel_id,
            source_channel_title: format!("{channel} title"),
            source_msg_id: 77,
            summary: summary.into(),
            topic: "Tech".into(),
            embedding: vec![],
            media: None,
        }
    }

    fn digest(clusters: Vec<ComposedCluster>) -> ComposedDigest {
        ComposedDigest {
            window: Window::new(
                Utc.with_ymd_and_hms(2026, 3, 2, 8, 0, 0).unwrap(),
                Utc.with_ymd_and_hms(2026, 3, 2, 12, 0, 0).unwrap(),
            )
            .unwrap(),
            clusters,
            evidence: vec![],
            fact_checks: vec![],
        }
    }

    #[test]
    fn renders_tiers_sources_and_links() {
        let mut d = digest(vec![
            ComposedCluster {
                topic: "Chips".into(),
                items: vec![
                    item("a", "wire", 1, 0.9, "Export rules tightened"),
                    item("b", "desk", 2, 0.7, "Rules tightened again"),
                ],
                summary: Some("New export rules for chips".into()),
            },
            ComposedCluster {
                topic: "Weather".into(),
                items: vec![item("c", "", 3, 0.3, "Rain tomorrow")],
                summary: None,
            },
        ]);
        d.evidence.push(ItemEvidence {
            item_id: "b".into(),
            url: "https://example.org/a".into(),
            agreement_score: 0.9,
            is_contradiction: false,
        });
        d.fact_checks.push(FactCheck {
            item_id: "c".into(),
            claim: "Rain tomorrow".into(),
            verdict: "likely".into(),
            url: None,
        });

        let rendered = render(&d, &RenderOptions::default());
        assert!(rendered.text.contains("*Breaking*"));
        assert!(rendered.text.contains("*Also noted*"));
        assert!(rendered.text.contains("New export rules for chips"));
        assert!(rendered.text.contains("sources: @desk, @wire (2 reports)"));
        assert!(rendered.text.contains("corroborated by 1 references"));
        assert!(rendered.text.contains("fact-check (likely): Rain tomorrow"));
        assert!(rendered.text.contains("https://t.me/wire/77"));
        assert!(rendered.text.contains("wire title") || rendered.text.contains(" title #77"));
        assert_eq!(rendered.entries.len(), 2);
        assert_eq!(rendered.entries[0].item_ids, vec!["a", "b"]);
        assert_eq!(rendered.entries[0].channel_ids, vec![1, 2]);
        assert_eq!(rendered.entries[1].position, 1);
    }

    #[test]
    fn overflow_is_summarized_not_cut_mid_entry() {
        let clusters = (0..50)
            .map(|n| ComposedCluster {
                topic: format!("Topic {n}"),
                items: vec![item(&format!("i{n}"), "wire", 1, 0.5, &"x".repeat(120))],
                summary: None,
            })
            .collect();
        let options = RenderOptions {
            max_chars: 1000,
            ..Default::default()
        };
        let rendered = render(&digest(clusters), &options);
        assert!(rendered.text.chars().count() <= 1000);
        assert!(rendered.entries.len() < 50);
        assert!(rendered
            .text
            .contains(&format!("…and {} more", 50 - rendered.entries.len())));
    }

    #[test]
    fn oversized_first_entry_is_cut_to_the_budget() {
        let clusters = vec![
            ComposedCluster {
                topic: "Long".into(),
                items: vec![item("big", "wire", 1, 0.5, &"y".repeat(1000))],
                summary: None,
            },
            ComposedCluster {
                topic: "Short".into(),
                items: vec![item("small", "desk", 2, 0.5, "short")],
                summary: None,
            },
        ];
        let options = RenderOptions {
            max_chars: 300,
            ..Default::default()
        };
        let rendered = render(&digest(clusters), &options);
        assert!(rendered.text.chars().count() <= 300);
        assert!(rendered.text.contains("yyy…\n"));
        assert!(rendered.text.contains("…and 1 more"));
        assert_eq!(rendered.entries.len(), 1);
        assert_eq!(rendered.entries[0].item_ids, vec!["big"]);
    }

    #[test]
    fn truncation_keeps_short_blocks_intact() {
        assert_eq!(truncate_chars("abc\n", 10), "abc\n");
        let cut = truncate_chars("abcdefghij", 6);
        assert_eq!(cut, "abcd…\n");
        assert_eq!(cut.chars().count(), 6);
    }
}
