//! Declarative weekday/weekend digest schedules and their expansion to UTC send-times.

use std::collections::BTreeSet;

use chrono::{DateTime, Datelike, Duration, LocalResult, NaiveDate, TimeZone, Utc, Weekday};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use thiserror::Error;

mod window;

pub use window::build_windows;

pub const CRATE_NAME: &str = "digestor-schedule";

/// How far back `previous_time_before` searches.
pub const PREVIOUS_LOOKBACK_DAYS: i64 = 8;

const TIMEZONE_ALIASES: &[(&str, &str)] = &[
    ("Asia/Nicosia", "Europe/Nicosia"),
    ("Asia/Calcutta", "Asia/Kolkata"),
    ("Asia/Saigon", "Asia/Ho_Chi_Minh"),
    ("Asia/Katmandu", "Asia/Kathmandu"),
    ("Europe/Kiev", "Europe/Kyiv"),
];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ScheduleError {
    #[error("invalid timezone: {0}")]
    InvalidTimezone(String),
    #[error("invalid time {0:?}: expected H:MM or HH:MM")]
    InvalidTime(String),
    #[error("invalid schedule: {0}")]
    InvalidSchedule(String),
}

/// Wire format stored under the `digest_schedule` setting.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schedule {
    #[serde(default)]
    pub timezone: String,
    #[serde(default)]
    pub weekdays: DaySchedule,
    #[serde(default)]
    pub weekends: DaySchedule,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaySchedule {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub times: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hourly: Option<HourlyRange>,
}

impl DaySchedule {
    pub fn is_empty(&self) -> bool {
        self.times.is_empty() && self.hourly.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HourlyRange {
    pub start: String,
    pub end: String,
}

impl Schedule {
    pub fn from_json(raw: &str) -> Result<Self, ScheduleError> {
        serde_json::from_str(raw).map_err(|err| ScheduleError::InvalidSchedule(err.to_string()))
    }

    /// An empty schedule disables digests.
    pub fn is_empty(&self) -> bool {
        self.weekdays.is_empty() && self.weekends.is_empty()
    }

    /// Validate and pre-compute minute-of-day lists.
    pub fn compile(&self) -> Result<CompiledSchedule, ScheduleError> {
        let tz = resolve_timezone(&self.timezone)?;
        Ok(CompiledSchedule {
            tz,
            weekday_minutes: expand_day(&self.weekdays)?,
            weekend_minutes: expand_day(&self.weekends)?,
        })
    }
}

/// A validated schedule bound to a concrete zone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledSchedule {
    tz: Tz,
    weekday_minutes: Vec<u32>,
    weekend_minutes: Vec<u32>,
}

impl CompiledSchedule {
    pub fn timezone(&self) -> Tz {
        self.tz
    }

    pub fn is_empty(&self) -> bool {
        self.weekday_minutes.is_empty() && self.weekend_minutes.is_empty()
    }

    pub fn minutes_for(&self, weekday: Weekday) -> &[u32] {
        match weekday {
            Weekday::Sat | Weekday::Sun => &self.weekend_minutes,
            _ => &self.weekday_minutes,
        }
    }

    /// Every scheduled instant in `[lo, hi]`, ascending and de-duplicated.
    ///
    /// Wall-clock times that fall into a DST gap are skipped; a repeated
    /// wall-clock time resolves to its earlier occurrence.
    pub fn times_between(&self, lo: DateTime<Utc>, hi: DateTime<Utc>) -> Vec<DateTime<Utc>> {
        if hi < lo || self.is_empty() {
            return Vec::new();
        }
        let first_day = lo.with_timezone(&self.tz).date_naive().pred_opt();
        let last_day = hi.with_timezone(&self.tz).date_naive().succ_opt();
        let (Some(first_day), Some(last_day)) = (first_day, last_day) else {
            return Vec::new();
        };

        let mut out = BTreeSet::new();
        let mut day = first_day;
        while day <= last_day {
            for &minute in self.minutes_for(day.weekday()) {
                if let Some(instant) = self.local_instant(day, minute) {
                    if instant >= lo && instant <= hi {
                        out.insert(instant);
                    }
                }
            }
            match day.succ_opt() {
                Some(next) => day = next,
                None => break,
            }
        }
        out.into_iter().collect()
    }

    /// Latest scheduled instant strictly before `t`, looking back at most eight days.
    pub fn previous_time_before(&self, t: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.times_between(t - Duration::days(PREVIOUS_LOOKBACK_DAYS), t)
            .into_iter()
            .rev()
            .find(|instant| *instant < t)
    }

    /// Earliest scheduled instant strictly after `t`, looking ahead at most eight days.
    pub fn next_time_after(&self, t: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.times_between(t, t + Duration::days(PREVIOUS_LOOKBACK_DAYS))
            .into_iter()
            .find(|instant| *instant > t)
    }

    fn local_instant(&self, day: NaiveDate, minute: u32) -> Option<DateTime<Utc>> {
        let naive = day.and_hms_opt(minute / 60, minute % 60, 0)?;
        match self.tz.from_local_datetime(&naive) {
            LocalResult::Single(dt) => Some(dt.with_timezone(&Utc)),
            LocalResult::Ambiguous(earliest, _) => Some(earliest.with_timezone(&Utc)),
            LocalResult::None => None,
        }
    }
}

/// Resolve an IANA name (after alias rewriting); blank means UTC.
pub fn resolve_timezone(name: &str) -> Result<Tz, ScheduleError> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Ok(Tz::UTC);
    }
    let canonical = TIMEZONE_ALIASES
        .iter()
        .find(|(alias, _)| *alias == trimmed)
        .map(|(_, target)| *target)
        .unwrap_or(trimmed);
    canonical
        .parse::<Tz>()
        .map_err(|_| ScheduleError::InvalidTimezone(trimmed.to_string()))
}

/// Parse `H:MM` / `HH:MM` into minutes since midnight.
pub fn parse_hhmm(raw: &str) -> Result<u32, ScheduleError> {
    let invalid = || ScheduleError::InvalidTime(raw.to_string());
    let trimmed = raw.trim();
    let (hours, minutes) = trimmed.split_once(':').ok_or_else(invalid)?;
    if hours.is_empty() || hours.len() > 2 || minutes.len() != 2 {
        return Err(invalid());
    }
    if !hours.chars().chain(minutes.chars()).all(|c| c.is_ascii_digit()) {
        return Err(invalid());
    }
    let h: u32 = hours.parse().map_err(|_| invalid())?;
    let m: u32 = minutes.parse().map_err(|_| invalid())?;
    if h > 23 || m > 59 {
        return Err(invalid());
    }
    Ok(h * 60 + m)
}

fn expand_day(day: &DaySchedule) -> Result<Vec<u32>, ScheduleError> {
    let mut minutes = BTreeSet::new();
    for raw in &day.times {
        minutes.insert(parse_hhmm(raw)?);
    }
    if let Some(hourly) = &day.hourly {
        let start = parse_hhmm(&hourly.start)?;
        let end = parse_hhmm(&hourly.end)?;
        if start > end {
            return Err(ScheduleError::InvalidSchedule(format!(
                "hourly range {}-{} crosses midnight",
                hourly.start, hourly.end
            )));
        }
        let first_hour = start.div_ceil(60);
        let last_hour = end / 60;
        for hour in first_hour..=last_hour {
            if hour * 60 >= start && hour * 60 <= end {
                minutes.insert(hour * 60);
            }
        }
    }
    Ok(minutes.into_iter().collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utc(y: i32, m: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, mi, 0).unwrap()
    }

    fn schedule(tz: &str, times: &[&str]) -> CompiledSchedule {
        Schedule {
            timezone: tz.to_string(),
            weekdays: DaySchedule {
                times: times.iter().map(|s| s.to_string()).collect(),
                hourly: None,
            },
            weekends: DaySchedule {
                times: times.iter().map(|s| s.to_string()).collect(),
                hourly: None,
            },
        }
        .compile()
        .unwrap()
    }

    #[test]
    fn hhmm_boundaries() {
        assert_eq!(parse_hhmm("0:00"), Ok(0));
        assert_eq!(parse_hhmm("23:59"), Ok(23 * 60 + 59));
        assert_eq!(parse_hhmm("09:30"), Ok(570));
        assert!(parse_hhmm("24:00").is_err());
        assert!(parse_hhmm("9:5").is_err());
        assert!(parse_hhmm("12:60").is_err());
        assert!(parse_hhmm("123:00").is_err());
        assert!(parse_hhmm("noon").is_err());
        assert!(parse_hhmm("-1:00").is_err());
    }

    #[test]
    fn timezone_aliases_resolve() {
        assert_eq!(resolve_timezone("Asia/Nicosia"), Ok(chrono_tz::Europe::Nicosia));
        assert_eq!(resolve_timezone(""), Ok(Tz::UTC));
        assert!(matches!(
            resolve_timezone("Mars/Olympus"),
            Err(ScheduleError::InvalidTimezone(_))
        ));
    }

    #[test]
    fn hourly_range_must_not_cross_midnight() {
        let s = Schedule {
            timezone: "UTC".into(),
            weekdays: DaySchedule {
                times: vec![],
                hourly: Some(HourlyRange {
                    start: "22:00".into(),
                    end: "02:00".into(),
                }),
            },
            weekends: DaySchedule::default(),
        };
        let err = s.compile().unwrap_err();
        assert!(err.to_string().starts_with("invalid schedule"));
    }

    #[test]
    fn hourly_expansion_rounds_up_and_unions_with_explicit_times() {
        let day = DaySchedule {
            times: vec!["10:00".into(), "12:15".into()],
            hourly: Some(HourlyRange {
                start: "9:30".into(),
                end: "12:00".into(),
            }),
        };
        assert_eq!(expand_day(&day).unwrap(), vec![600, 660, 720, 735]);
    }

    #[test]
    fn hourly_range_with_equal_bounds_yields_one_instant() {
        let day = DaySchedule {
            times: vec![],
            hourly: Some(HourlyRange {
                start: "08:00".into(),
                end: "08:00".into(),
            }),
        };
        assert_eq!(expand_day(&day).unwrap(), vec![480]);
    }

    #[test]
    fn weekends_use_their_own_times() {
        let s = Schedule {
            timezone: "UTC".into(),
            weekdays: DaySchedule {
                times: vec!["08:00".into()],
                hourly: None,
            },
            weekends: DaySchedule {
                times: vec!["11:00".into()],
                hourly: None,
            },
        }
        .compile()
        .unwrap();
        // 2026-03-06 is a Friday.
        let times = s.times_between(utc(2026, 3, 6, 0, 0), utc(2026, 3, 8, 23, 59));
        assert_eq!(
            times,
            vec![utc(2026, 3, 6, 8, 0), utc(2026, 3, 7, 11, 0), utc(2026, 3, 8, 11, 0)]
        );
    }

    #[test]
    fn local_times_convert_to_utc() {
        let s = schedule("Europe/Berlin", &["09:00"]);
        let times = s.times_between(utc(2026, 1, 10, 0, 0), utc(2026, 1, 10, 23, 0));
        assert_eq!(times, vec![utc(2026, 1, 10, 8, 0)]);
    }

    #[test]
    fn spring_forward_gap_is_skipped() {
        // Europe/Berlin jumps 02:00 -> 03:00 on 2026-03-29.
        let s = schedule("Europe/Berlin", &["02:30"]);
        let times = s.times_between(utc(2026, 3, 28, 0, 0), utc(2026, 3, 30, 23, 0));
        assert_eq!(times, vec![utc(2026, 3, 28, 1, 30), utc(2026, 3, 30, 0, 30)]);
    }

    #[test]
    fn fall_back_overlap_is_not_double_emitted() {
        // Europe/Berlin repeats 02:00-03:00 on 2026-10-25.
        let s = schedule("Europe/Berlin", &["02:30"]);
        let times = s.times_between(utc(2026, 10, 25, 0, 0), utc(2026, 10, 25, 23, 0));
        assert_eq!(times, vec![utc(2026, 10, 25, 0, 30)]);
    }

    #[test]
    fn previous_time_before_is_strict() {
        let s = schedule("UTC", &["09:00", "18:00"]);
        let t = utc(2026, 3, 3, 18, 0);
        assert_eq!(s.previous_time_before(t), Some(utc(2026, 3, 3, 9, 0)));
        assert_eq!(s.next_time_after(t), Some(utc(2026, 3, 4, 9, 0)));
    }

    #[test]
    fn previous_time_before_gives_up_after_lookback() {
        let s = Schedule::default().compile().unwrap();
        assert!(s.is_empty());
        assert_eq!(s.previous_time_before(utc(2026, 3, 3, 18, 0)), None);
    }

    #[test]
    fn wire_format_round_trips_from_json() {
        let raw = r#"{"timezone":"Asia/Nicosia","weekdays":{"times":["8:00","20:00"]},"weekends":{"hourly":{"start":"10:00","end":"12:00"}}}"#;
        let s = Schedule::from_json(raw).unwrap();
        assert!(!s.is_empty());
        let compiled = s.compile().unwrap();
        assert_eq!(compiled.minutes_for(Weekday::Mon), &[480, 1200]);
        assert_eq!(compiled.minutes_for(Weekday::Sun), &[600, 660, 720]);
    }
}
