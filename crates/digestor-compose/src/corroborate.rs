use std::collections::{HashMap, HashSet};

use digestor_core::scoring::clamp01;
use digestor_core::Item;

use crate::cluster::ClusterPlan;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CorroborationConfig {
    pub boost: f64,
    pub single_source_penalty: f64,
}

/// Adjust importance by how many distinct channels back each cluster.
///
/// Scores are written in place through the plan indices and clamped to
/// `[0, 1]`. Returns `(item id, adjustment)` for every item whose cluster
/// earned a boost or a penalty; the adjustment excludes any selection-time
/// rescoring already folded into the in-memory score.
pub fn corroborate(
    items: &mut [Item],
    plans: &[ClusterPlan],
    config: &CorroborationConfig,
) -> Vec<(String, f64)> {
    let mut updates = Vec::new();
    for plan in plans {
        let channels = plan
            .members
            .iter()
            .map(|&i| items[i].source_channel_id)
            .collect::<HashSet<_>>()
            .len();
        if channels == 0 {
            continue;
        }
        let boost = if channels > 1 && config.boost > 0.0 {
            (channels - 1) as f64 * config.boost
        } else {
            0.0
        };
        let penalty =
            if channels == 1 && plan.members.len() > 1 && config.single_source_penalty > 0.0 {
                config.single_source_penalty
            } else {
                0.0
            };
        let adjustment = boost - penalty;
        for &idx in &plan.members {
            let item = &mut items[idx];
            item.importance_score = clamp01(item.importance_score + adjustment);
            if adjustment != 0.0 {
                updates.push((item.id.clone(), adjustment));
            }
        }
    }
    updates
}

/// Authoritative scores to persist: the stored score of each adjusted item
/// plus its corroboration adjustment, clamped. Items whose stored score is
/// unknown or would not change are left out.
pub fn persisted_scores(
    adjustments: &[(String, f64)],
    stored: &HashMap<String, f64>,
) -> Vec<(String, f64)> {
    adjustments
        .iter()
        .filter_map(|(id, adjustment)| {
            let base = *stored.get(id)?;
            let score = clamp01(base + adjustment);
            (score != base).then(|| (id.clone(), score))
        })
        .collect()
}
