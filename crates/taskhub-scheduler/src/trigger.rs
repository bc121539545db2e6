//! Declarative, stateless trigger rules.
//!
//! A [`Trigger`] never remembers when it last fired. Every call to
//! [`Trigger::next_fire_at`] derives the next occurrence from the current
//! clock and the trigger's fields alone, so a task can be reset and asked
//! again without any bookkeeping on the trigger side.

use std::time::Duration;

use chrono::{DateTime, Datelike, NaiveDate, NaiveTime, TimeDelta, Utc, Weekday};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SchedulerError};

/// When a task should fire. All times are UTC.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trigger {
    /// First day the trigger may fire. Defaults to today.
    #[serde(default)]
    pub start_date: Option<NaiveDate>,
    /// Repeat period. Without it the trigger fires at most once.
    #[serde(default, with = "interval_secs")]
    pub interval: Option<Duration>,
    /// Allowed weekdays. `None` allows every day; an empty list is invalid.
    #[serde(default)]
    pub days_of_week: Option<Vec<Weekday>>,
    /// Start of the daily window (default 00:00:00).
    #[serde(default)]
    pub start_time: Option<NaiveTime>,
    /// End of the daily window (default 23:59:59).
    #[serde(default)]
    pub end_time: Option<NaiveTime>,
    /// Maximum number of interval repetitions counted from the window start.
    #[serde(default)]
    pub max_recurrences: Option<u32>,
}

impl Trigger {
    /// Fire once at `at`.
    ///
    /// The date acts as a lower bound: evaluated on a later day, the trigger
    /// resolves to that day's `at.time()` if it is still ahead.
    pub fn once_at(at: DateTime<Utc>) -> Self {
        Self {
            start_date: Some(at.date_naive()),
            start_time: Some(at.time()),
            ..Self::default()
        }
    }

    /// Fire every `interval`, starting at midnight today.
    pub fn every(interval: Duration) -> Self {
        Self {
            interval: Some(interval),
            ..Self::default()
        }
    }

    pub fn starting(mut self, date: NaiveDate) -> Self {
        self.start_date = Some(date);
        self
    }

    pub fn on_days(mut self, days: impl IntoIterator<Item = Weekday>) -> Self {
        self.days_of_week = Some(days.into_iter().collect());
        self
    }

    pub fn daily_at(mut self, time: NaiveTime) -> Self {
        self.start_time = Some(time);
        self
    }

    pub fn between(mut self, start: NaiveTime, end: NaiveTime) -> Self {
        self.start_time = Some(start);
        self.end_time = Some(end);
        self
    }

    pub fn max_recurrences(mut self, max: u32) -> Self {
        self.max_recurrences = Some(max);
        self
    }

    /// Reject self-contradictory configurations.
    pub fn validate(&self) -> Result<()> {
        let (start, end) = self.window();
        if start > end {
            return Err(SchedulerError::TriggerConfig(format!(
                "daily start time {start} is after end time {end}"
            )));
        }
        if self.days_of_week.as_ref().is_some_and(|d| d.is_empty()) {
            return Err(SchedulerError::TriggerConfig(
                "weekday set is empty, the trigger can never fire".to_string(),
            ));
        }
        if self.interval.is_some_and(|i| i.is_zero()) {
            return Err(SchedulerError::TriggerConfig(
                "interval must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Compute the earliest fire time at or after `now`.
    ///
    /// Returns `Ok(None)` when the schedule is exhausted: a one-shot trigger
    /// whose time has passed, or an interval that ran past `max_recurrences`.
    pub fn next_fire_at(&self, now: DateTime<Utc>) -> Result<Option<DateTime<Utc>>> {
        self.validate()?;
        let (daily_start, daily_end) = self.window();

        let today = now.date_naive();
        let first_day = match self.start_date {
            Some(date) if date > today => date,
            _ => today,
        };
        let mut candidate = self
            .next_allowed_day(first_day)?
            .and_time(daily_start)
            .and_utc();

        let mut recurrences = 0u64;
        while candidate < now {
            let Some(interval) = self.interval else {
                return Ok(None);
            };
            let step = TimeDelta::from_std(interval)
                .map_err(|e| SchedulerError::TriggerConfig(format!("interval too large: {e}")))?;

            // jump straight over the in-window steps that are still behind `now`
            let day_end = candidate.date_naive().and_time(daily_end).and_utc();
            if let Some((k, advance)) = steps_within(step, day_end - candidate, now - candidate) {
                recurrences += k;
                if self.max_recurrences.is_some_and(|max| recurrences > u64::from(max)) {
                    return Ok(None);
                }
                candidate += advance;
                continue;
            }

            let next = candidate + step;
            let time = next.time();

            if !self.allows(next.weekday()) || time < daily_start || time > daily_end {
                // outside the window: jump to the next allowed day's window start
                let mut day = next.date_naive();
                if time > daily_end {
                    day = succ(day)?;
                }
                candidate = self.next_allowed_day(day)?.and_time(daily_start).and_utc();
            } else {
                candidate = next;
                recurrences += 1;
                if self.max_recurrences.is_some_and(|max| recurrences > u64::from(max)) {
                    return Ok(None);
                }
            }
        }

        Ok(Some(candidate))
    }

    /// Human-readable summary of the schedule.
    pub fn describe(&self) -> String {
        let mut parts = Vec::new();
        parts.push(match self.interval {
            Some(interval) => format!("Every {}", format_interval(interval)),
            None => "Once".to_string(),
        });
        if let Some(days) = &self.days_of_week {
            let names: Vec<String> = days.iter().map(|d| d.to_string()).collect();
            parts.push(format!("on {}", names.join("/")));
        }
        match (self.start_time, self.end_time) {
            (Some(start), Some(end)) => parts.push(format!(
                "between {} and {}",
                start.format("%H:%M:%S"),
                end.format("%H:%M:%S")
            )),
            (Some(start), None) => parts.push(format!("at {}", start.format("%H:%M:%S"))),
            (None, Some(end)) => parts.push(format!("until {}", end.format("%H:%M:%S"))),
            (None, None) => {}
        }
        if let Some(date) = self.start_date {
            parts.push(format!("starting {date}"));
        }
        if let Some(max) = self.max_recurrences {
            parts.push(format!("max {max} recurrences"));
        }
        parts.join(", ")
    }

    fn window(&self) -> (NaiveTime, NaiveTime) {
        (
            self.start_time.unwrap_or(NaiveTime::MIN),
            self.end_time.unwrap_or_else(end_of_day),
        )
    }

    fn allows(&self, day: Weekday) -> bool {
        self.days_of_week
            .as_ref()
            .map_or(true, |days| days.contains(&day))
    }

    /// First day on or after `date` whose weekday is allowed (at most 6 days ahead).
    fn next_allowed_day(&self, mut date: NaiveDate) -> Result<NaiveDate> {
        for _ in 0..7 {
            if self.allows(date.weekday()) {
                return Ok(date);
            }
            date = succ(date)?;
        }
        Err(SchedulerError::TriggerConfig(
            "no allowed weekday within a week".to_string(),
        ))
    }
}

/// Whole `step`s to advance, and their total: enough to reach `behind`, but
/// never past `room`. `None` when not even one step fits.
fn steps_within(step: TimeDelta, room: TimeDelta, behind: TimeDelta) -> Option<(u64, TimeDelta)> {
    let step = step.num_nanoseconds().filter(|ns| *ns > 0)?;
    let room = room.num_nanoseconds()?;
    let behind = behind.num_nanoseconds()?;
    let k = (room / step).min((behind + step - 1) / step);
    (k > 0).then(|| (k as u64, TimeDelta::nanoseconds(step * k)))
}

fn end_of_day() -> NaiveTime {
    NaiveTime::from_hms_opt(23, 59, 59).unwrap_or(NaiveTime::MIN)
}

fn succ(date: NaiveDate) -> Result<NaiveDate> {
    date.succ_opt()
        .ok_or_else(|| SchedulerError::TriggerConfig(format!("no date after {date}")))
}

fn format_interval(interval: Duration) -> String {
    let total = interval.as_secs();
    if total == 0 {
        return format!("{}ms", interval.as_millis());
    }
    let (h, m, s) = (total / 3600, (total % 3600) / 60, total % 60);
    let mut out = String::new();
    if h > 0 {
        out.push_str(&format!("{h}h"));
    }
    if m > 0 {
        out.push_str(&format!("{m}m"));
    }
    if s > 0 {
        out.push_str(&format!("{s}s"));
    }
    out
}

/// Serialises the interval as fractional seconds (`interval = 90.0`).
mod interval_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Duration>, ser: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => ser.serialize_some(&d.as_secs_f64()),
            None => ser.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Option<Duration>, D::Error> {
        let secs = Option::<f64>::deserialize(de)?;
        secs.map(|s| Duration::try_from_secs_f64(s).map_err(serde::de::Error::custom))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    fn time(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    #[test]
    fn weekday_trigger_rolls_to_next_allowed_day() {
        // 2026-10-13 is a Tuesday
        let now = at(2026, 10, 13, 8, 0);
        let trigger = Trigger::default().on_days([Weekday::Mon]).daily_at(time(9, 0));

        let first = trigger.next_fire_at(now).unwrap();
        assert_eq!(first, Some(at(2026, 10, 19, 9, 0)));
        // same input, same answer
        assert_eq!(trigger.next_fire_at(now).unwrap(), first);
    }

    #[test]
    fn one_shot_in_the_past_is_exhausted() {
        let now = at(2026, 10, 13, 8, 0);
        let trigger = Trigger::default().starting(now.date_naive().pred_opt().unwrap());
        assert_eq!(trigger.next_fire_at(now).unwrap(), None);
    }

    #[test]
    fn one_shot_in_the_future_fires_at_its_time() {
        let now = at(2026, 10, 13, 8, 0);
        let trigger = Trigger::once_at(at(2026, 10, 14, 6, 30));
        assert_eq!(trigger.next_fire_at(now).unwrap(), Some(at(2026, 10, 14, 6, 30)));
    }

    #[test]
    fn recurrence_cap_limits_future_occurrences() {
        let trigger = Trigger::every(Duration::from_secs(3600)).max_recurrences(2);

        let first = trigger.next_fire_at(at(2026, 10, 13, 0, 30)).unwrap();
        assert_eq!(first, Some(at(2026, 10, 13, 1, 0)));

        let second = trigger.next_fire_at(at(2026, 10, 13, 1, 30)).unwrap();
        assert_eq!(second, Some(at(2026, 10, 13, 2, 0)));

        assert_eq!(trigger.next_fire_at(at(2026, 10, 13, 2, 30)).unwrap(), None);
    }

    #[test]
    fn interval_snaps_to_window_start_outside_daily_window() {
        let trigger =
            Trigger::every(Duration::from_secs(4 * 3600)).between(time(9, 0), time(17, 0));

        // 09:00, 13:00, 17:00 are in the window
        assert_eq!(
            trigger.next_fire_at(at(2026, 10, 13, 14, 0)).unwrap(),
            Some(at(2026, 10, 13, 17, 0))
        );
        // 21:00 falls outside, so next is tomorrow 09:00
        assert_eq!(
            trigger.next_fire_at(at(2026, 10, 13, 17, 30)).unwrap(),
            Some(at(2026, 10, 14, 9, 0))
        );
    }

    #[test]
    fn interval_skips_disallowed_weekdays() {
        // Friday 2026-10-16, weekdays only
        let trigger = Trigger::every(Duration::from_secs(6 * 3600)).on_days([
            Weekday::Mon,
            Weekday::Tue,
            Weekday::Wed,
            Weekday::Thu,
            Weekday::Fri,
        ]);
        assert_eq!(
            trigger.next_fire_at(at(2026, 10, 16, 19, 0)).unwrap(),
            Some(at(2026, 10, 19, 0, 0))
        );
    }

    #[test]
    fn millisecond_interval_resolves_late_in_the_day() {
        let now = at(2026, 10, 13, 23, 0);
        let trigger = Trigger::every(Duration::from_millis(1));
        let started = std::time::Instant::now();
        assert_eq!(trigger.next_fire_at(now).unwrap(), Some(now));
        assert!(started.elapsed() < Duration::from_millis(100));

        let odd = Trigger::every(Duration::from_millis(7));
        assert_eq!(
            odd.next_fire_at(at(2026, 10, 13, 12, 0)).unwrap(),
            Some(at(2026, 10, 13, 12, 0) + TimeDelta::milliseconds(3))
        );
    }

    #[test]
    fn recurrence_cap_holds_across_large_jumps() {
        let trigger = Trigger::every(Duration::from_millis(1)).max_recurrences(1000);
        let midnight = at(2026, 10, 13, 0, 0);

        assert_eq!(
            trigger
                .next_fire_at(midnight + TimeDelta::microseconds(999_500))
                .unwrap(),
            Some(midnight + TimeDelta::seconds(1))
        );
        assert_eq!(
            trigger
                .next_fire_at(midnight + TimeDelta::milliseconds(1500))
                .unwrap(),
            None
        );
    }

    #[test]
    fn future_start_date_is_respected() {
        let start = NaiveDate::from_ymd_opt(2026, 12, 1).unwrap();
        let trigger = Trigger::every(Duration::from_secs(60)).starting(start);
        assert_eq!(
            trigger.next_fire_at(at(2026, 10, 13, 12, 0)).unwrap(),
            Some(at(2026, 12, 1, 0, 0))
        );
    }

    #[test]
    fn contradictory_configs_are_rejected() {
        let inverted = Trigger::default().between(time(17, 0), time(9, 0));
        let err = inverted.next_fire_at(at(2026, 10, 13, 8, 0)).unwrap_err();
        assert_eq!(err.code(), "TRIGGER_CONFIG");

        let no_days = Trigger::default().on_days([]);
        assert!(matches!(no_days.validate(), Err(SchedulerError::TriggerConfig(_))));

        let zero = Trigger::every(Duration::ZERO);
        assert!(zero.validate().is_err());
    }

    #[test]
    fn describe_summarises_the_schedule() {
        let trigger = Trigger::every(Duration::from_secs(5400))
            .on_days([Weekday::Mon, Weekday::Wed])
            .between(time(9, 0), time(17, 0))
            .max_recurrences(3);
        assert_eq!(
            trigger.describe(),
            "Every 1h30m, on Mon/Wed, between 09:00:00 and 17:00:00, max 3 recurrences"
        );
        assert_eq!(Trigger::default().describe(), "Once");
    }

    #[test]
    fn interval_deserializes_from_seconds() {
        let trigger: Trigger = serde_json::from_str(
            r#"{"interval": 90.0, "days_of_week": ["Mon", "Fri"], "start_time": "08:00:00"}"#,
        )
        .unwrap();
        assert_eq!(trigger.interval, Some(Duration::from_secs(90)));
        assert_eq!(trigger.days_of_week, Some(vec![Weekday::Mon, Weekday::Fri]));
        assert_eq!(trigger.start_time, Some(time(8, 0)));
    }
}
