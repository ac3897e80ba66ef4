use chrono::{DateTime, Duration, Utc};
use digestor_core::Window;
use tracing::debug;

use crate::CompiledSchedule;

/// Materialize the half-open windows a run should process.
///
/// `anchor` is the end of the last window that was fully processed; windows
/// never start before it, and never start earlier than `now - catchup`.
pub fn build_windows(
    schedule: &CompiledSchedule,
    now: DateTime<Utc>,
    catchup: Duration,
    anchor: Option<DateTime<Utc>>,
) -> Vec<Window> {
    let horizon = now - catchup;
    let min_start = match anchor {
        Some(a) if a >= horizon && a < now => a.max(horizon),
        _ => horizon,
    };

    let times = schedule.times_between(min_start, now);
    let mut prev = match anchor {
        Some(a) if a >= min_start => a,
        _ => schedule.previous_time_before(min_start).unwrap_or(min_start),
    };

    let mut windows = Vec::new();
    for t in times {
        if t <= prev {
            continue;
        }
        let start = prev.max(min_start);
        if let Some(window) = Window::new(start, t) {
            windows.push(window);
        }
        prev = t;
    }
    debug!(
        %min_start,
        windows = windows.len(),
        anchored = anchor.is_some(),
        "built digest windows"
    );
    windows
}
