use chrono::{DateTime, Utc};
use digestor_core::Anomaly;

/// Anomalies whose window ends after the last notified point.
pub fn unreported(anomalies: &[Anomaly], notified_through: Option<DateTime<Utc>>) -> Vec<Anomaly> {
    anomalies
        .iter()
        .filter(|a| notified_through.map_or(true, |t| a.window().end > t))
        .cloned()
        .collect()
}

/// One consolidated, plain-text report for a run. `None` when there is nothing to say.
pub fn render_report(anomalies: &[Anomaly]) -> Option<String> {
    let first = anomalies.iter().map(|a| a.window().start).min()?;
    let last = anomalies.iter().map(|a| a.window().end).max()?;

    let mut starved = 0usize;
    let mut total_items = 0u64;
    let mut ready_items = 0u64;
    let mut backlog = 0usize;
    let mut max_backlog = 0u64;
    let mut threshold = None;
    for anomaly in anomalies {
        match anomaly {
            Anomaly::ThresholdStarved {
                total_items: total,
                ready_items: ready,
                threshold: t,
                ..
            } => {
                starved += 1;
                total_items += total;
                ready_items += ready;
                threshold = Some(*t);
            }
            Anomaly::Backlog {
                backlog_size,
                threshold: t,
                ..
            } => {
                backlog += 1;
                max_backlog = max_backlog.max(*backlog_size);
                threshold = threshold.or(Some(*t));
            }
        }
    }

    let mut lines = vec![
        format!("Digest anomalies: {} window(s) produced no digest", anomalies.len()),
        format!(
            "range: {} .. {}",
            first.format("%Y-%m-%d %H:%M UTC"),
            last.format("%Y-%m-%d %H:%M UTC")
        ),
    ];
    if starved > 0 {
        lines.push(format!(
            "threshold: {starved} window(s), {total_items} items in window, {ready_items} ready, none above threshold"
        ));
    }
    if backlog > 0 {
        lines.push(format!(
            "backlog: {backlog} empty window(s), ingestion backlog up to {max_backlog}"
        ));
    }
    if let Some(t) = threshold {
        lines.push(format!("importance threshold: {t:.2}"));
    }
    Some(lines.join("\n"))
}
