use chrono::{TimeZone, Utc};
use chrono_tz::Tz;
use digestor_adapters::render::render;
use digestor_adapters::{ComposedCluster, ComposedDigest, RenderOptions};
use digestor_core::{Item, ItemEvidence, Window};

fn item(id: &str, channel: &str, title: &str) -> Item {
    let t = Utc.with_ymd_and_hms(2026, 3, 2, 9, 30, 0).unwrap();
    Item {
        id: id.into(),
        importance_score: 0.3,
        relevance_score: 0.5,
        published_at: t,
        first_seen_at: t,
        source_channel: channel.into(),
        source_channel_id: 9,
        source_channel_title: title.into(),
        source_msg_id: 12,
        summary: format!("summary of {id}"),
        topic: "Local".into(),
        embedding: vec![],
        media: None,
    }
}

#[test]
fn header_uses_the_schedule_timezone_and_contradictions_are_not_references() {
    let window = Window::new(
        Utc.with_ymd_and_hms(2026, 3, 2, 8, 0, 0).unwrap(),
        Utc.with_ymd_and_hms(2026, 3, 2, 12, 0, 0).unwrap(),
    )
    .unwrap();
    let digest = ComposedDigest {
        window,
        clusters: vec![ComposedCluster {
            topic: "Local".into(),
            items: vec![item("x", "", "City Desk")],
            summary: Some("   ".into()),
        }],
        evidence: vec![ItemEvidence {
            item_id: "x".into(),
            url: "https://example.org/denial".into(),
            agreement_score: 0.1,
            is_contradiction: true,
        }],
        fact_checks: vec![],
    };
    let options = RenderOptions {
        timezone: Tz::Europe__Berlin,
        heading: "Morning".into(),
        ..Default::default()
    };

    let rendered = render(&digest, &options);
    assert!(rendered
        .text
        .starts_with("*Morning* 2026-03-02 09:00 - 13:00 (Europe/Berlin)"));
    assert!(rendered.text.contains("summary of x"));
    assert!(rendered.text.contains("City Desk #12"));
    assert!(!rendered.text.contains("corroborated"));
    assert!(!rendered.text.contains("sources:"));
    assert_eq!(rendered.entries.len(), 1);
    assert_eq!(rendered.entries[0].channel_ids, vec![9]);
}

#[test]
fn empty_clusters_are_skipped() {
    let window = Window::new(
        Utc.with_ymd_and_hms(2026, 3, 2, 8, 0, 0).unwrap(),
        Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap(),
    )
    .unwrap();
    let digest = ComposedDigest {
        window,
        clusters: vec![
            ComposedCluster {
                topic: "Nothing".into(),
                items: vec![],
                summary: None,
            },
            ComposedCluster {
                topic: "Local".into(),
                items: vec![item("y", "citydesk", "City Desk")],
                summary: None,
            },
        ],
        evidence: vec![],
        fact_checks: vec![],
    };

    let rendered = render(&digest, &RenderOptions::default());
    assert_eq!(rendered.entries.len(), 1);
    assert_eq!(rendered.entries[0].position, 0);
    assert_eq!(rendered.entries[0].item_ids, vec!["y"]);
    assert!(rendered.text.contains("https://t.me/citydesk/12"));
    assert!(!rendered.text.contains("Nothing"));
}
