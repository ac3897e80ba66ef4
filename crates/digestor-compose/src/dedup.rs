use digestor_core::scoring::cosine_similarity;
use digestor_core::Item;
use tracing::debug;

/// Greedy, order-preserving near-duplicate removal on embeddings.
///
/// An item is dropped when its similarity to any kept item reaches
/// `threshold`. Items without an embedding are always kept.
pub fn dedup_by_embedding(items: Vec<Item>, threshold: f64) -> Vec<Item> {
    let mut kept: Vec<Item> = Vec::with_capacity(items.len());
    for item in items {
        if item.has_embedding() {
            let duplicate_of = kept.iter().find(|k| {
                k.has_embedding() && cosine_similarity(&k.embedding, &item.embedding) >= threshold
            });
            if let Some(original) = duplicate_of {
                debug!(dropped = %item.id, kept = %original.id, "near-duplicate");
                continue;
            }
        }
        kept.push(item);
    }
    kept
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn item(id: &str, embedding: Vec<f32>) -> Item {
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
            source_msg_id: 1,
            summary: String::new(),
            topic: String::new(),
            embedding,
            media: None,
        }
    }

    #[test]
    fn drops_near_duplicates_of_earlier_items() {
        let items = vec![
            item("1", vec![1.0, 0.0, 0.0, 0.0]),
            item("2", vec![0.98, 0.0, 0.02, 0.0]),
            item("3", vec![0.0, 1.0, 0.0, 0.0]),
            item("4", vec![1.0, 0.0, 0.0, 0.0]),
        ];
        let kept = dedup_by_embedding(items, 0.9);
        let ids = kept.iter().map(|i| i.id.as_str()).collect::<Vec<_>>();
        assert_eq!(ids, vec!["1", "3"]);
    }

    #[test]
    fn items_without_embeddings_survive() {
        let items = vec![
            item("a", vec![]),
            item("b", vec![]),
            item("c", vec![1.0, 0.0]),
            item("d", vec![1.0, 0.0, 0.0]),
        ];
        let kept = dedup_by_embedding(items, 0.9);
        assert_eq!(kept.len(), 4);
    }

    #[test]
    fn kept_pairs_stay_below_threshold() {
        let items = (0..20)
            .map(|n| {
                let x = n as f32 / 20.0;
                item(&n.to_string(), vec![1.0 - x, x, 0.5])
            })
            .collect::<Vec<_>>();
        let kept = dedup_by_embedding(items, 0.95);
        for (i, a) in kept.iter().enumerate() {
            for b in kept.iter().skip(i + 1) {
                assert!(cosine_similarity(&a.embedding, &b.embedding) < 0.95);
            }
        }
    }
}
