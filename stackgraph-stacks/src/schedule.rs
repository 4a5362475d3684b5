//! EventBridge cron expressions
//!
//! Format: `cron(minutes hours day-of-month month day-of-week year)`, all in
//! UTC. Day-of-week runs 1-7 starting on Sunday. Exactly one of the two day
//! fields must be `?`. The `L`, `W` and `#` extensions are rejected.

use crate::error::ScheduleError;
use chrono::{DateTime, Datelike, Duration, NaiveDate, Timelike, Utc};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

const MONTH_NAMES: [&str; 12] = [
    "JAN", "FEB", "MAR", "APR", "MAY", "JUN", "JUL", "AUG", "SEP", "OCT", "NOV", "DEC",
];
const DAY_NAMES: [&str; 7] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];

const MIN_YEAR: u32 = 1970;
const MAX_YEAR: u32 = 2199;

#[derive(Debug, Clone, Copy)]
struct FieldDef {
    name: &'static str,
    min: u32,
    max: u32,
    names: &'static [&'static str],
}

const MINUTES: FieldDef = FieldDef { name: "minutes", min: 0, max: 59, names: &[] };
const HOURS: FieldDef = FieldDef { name: "hours", min: 0, max: 23, names: &[] };
const DAY_OF_MONTH: FieldDef = FieldDef { name: "day-of-month", min: 1, max: 31, names: &[] };
const MONTH: FieldDef = FieldDef { name: "month", min: 1, max: 12, names: &MONTH_NAMES };
const DAY_OF_WEEK: FieldDef = FieldDef { name: "day-of-week", min: 1, max: 7, names: &DAY_NAMES };
const YEAR: FieldDef = FieldDef { name: "year", min: MIN_YEAR, max: MAX_YEAR, names: &[] };

#[derive(Debug, Clone, PartialEq, Eq)]
enum Field {
    /// `?` in one of the day fields
    Unspecified,
    Values(BTreeSet<u32>),
}

impl Field {
    fn contains(&self, value: u32) -> bool {
        match self {
            Field::Unspecified => true,
            Field::Values(values) => values.contains(&value),
        }
    }

    fn values(&self) -> Vec<u32> {
        match self {
            Field::Unspecified => Vec::new(),
            Field::Values(values) => values.iter().copied().collect(),
        }
    }
}

/// A parsed cron schedule
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronSchedule {
    expression: String,
    minutes: Field,
    hours: Field,
    day_of_month: Field,
    month: Field,
    day_of_week: Field,
    year: Field,
}

impl CronSchedule {
    /// Parse `cron(...)` or the bare six fields
    pub fn parse(expression: &str) -> Result<Self, ScheduleError> {
        let trimmed = expression.trim();
        let body = trimmed
            .strip_prefix("cron(")
            .and_then(|rest| rest.strip_suffix(')'))
            .unwrap_or(trimmed);

        let fields: Vec<&str> = body.split_whitespace().collect();
        if fields.len() != 6 {
            return Err(ScheduleError::FieldCount(fields.len()));
        }

        let day_of_month = parse_field(fields[2], DAY_OF_MONTH, true)?;
        let day_of_week = parse_field(fields[4], DAY_OF_WEEK, true)?;
        let dom_unspecified = day_of_month == Field::Unspecified;
        let dow_unspecified = day_of_week == Field::Unspecified;
        if dom_unspecified == dow_unspecified {
            return Err(ScheduleError::DayFieldConflict);
        }

        Ok(Self {
            expression: format!("cron({})", fields.join(" ")),
            minutes: parse_field(fields[0], MINUTES, false)?,
            hours: parse_field(fields[1], HOURS, false)?,
            day_of_month,
            month: parse_field(fields[3], MONTH, false)?,
            day_of_week,
            year: parse_field(fields[5], YEAR, false)?,
        })
    }

    /// Normalised `cron(...)` form, as submitted to EventBridge
    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// First firing time strictly after `after`
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.first_at_or_after(after + Duration::nanoseconds(1))
    }

    /// Firing times within `[start, end)`
    pub fn fires_between(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Vec<DateTime<Utc>> {
        let mut fires = Vec::new();
        let mut cursor = self.first_at_or_after(start);
        while let Some(fire) = cursor {
            if fire >= end {
                break;
            }
            fires.push(fire);
            cursor = self.next_after(fire);
        }
        fires
    }

    pub fn matches_date(&self, date: NaiveDate) -> bool {
        let Ok(year) = u32::try_from(date.year()) else {
            return false;
        };
        if !self.year.contains(year) || !self.month.contains(date.month()) {
            return false;
        }
        match self.day_of_month {
            Field::Unspecified => self
                .day_of_week
                .contains(date.weekday().number_from_sunday()),
            Field::Values(_) => self.day_of_month.contains(date.day()),
        }
    }

    fn first_at_or_after(&self, at: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let start = ceil_to_minute(at)?;
        let hours = self.hours.values();
        let minutes = self.minutes.values();
        let mut date = start.date_naive();

        while u32::try_from(date.year()).ok()? <= MAX_YEAR {
            if !self.year.contains(u32::try_from(date.year()).ok()?) {
                date = NaiveDate::from_ymd_opt(date.year() + 1, 1, 1)?;
                continue;
            }
            if self.matches_date(date) {
                for &hour in &hours {
                    for &minute in &minutes {
                        let candidate = date.and_hms_opt(hour, minute, 0)?.and_utc();
                        if candidate >= start {
                            return Some(candidate);
                        }
                    }
                }
            }
            date = date.succ_opt()?;
        }
        None
    }
}

impl FromStr for CronSchedule {
    type Err = ScheduleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CronSchedule::parse(s)
    }
}

impl fmt::Display for CronSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.expression)
    }
}

fn ceil_to_minute(at: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let floor = at.with_second(0)?.with_nanosecond(0)?;
    if floor == at {
        Some(floor)
    } else {
        Some(floor + Duration::minutes(1))
    }
}

fn parse_field(raw: &str, def: FieldDef, allow_unspecified: bool) -> Result<Field, ScheduleError> {
    if raw == "?" {
        return if allow_unspecified {
            Ok(Field::Unspecified)
        } else {
            Err(invalid(def, raw))
        };
    }
    if raw.contains(['L', 'W', '#']) && !def.names.iter().any(|n| raw.to_ascii_uppercase().contains(n)) {
        return Err(ScheduleError::Unsupported {
            field: def.name,
            value: raw.to_string(),
        });
    }

    let mut values = BTreeSet::new();
    for part in raw.split(',') {
        let (range, step) = match part.split_once('/') {
            Some((range, step)) => {
                let step: u32 = step.parse().map_err(|_| invalid(def, raw))?;
                if step == 0 {
                    return Err(invalid(def, raw));
                }
                (range, step)
            }
            None => (part, 1),
        };

        let (start, end) = if range == "*" {
            (def.min, def.max)
        } else if let Some((low, high)) = range.split_once('-') {
            (parse_value(low, def)?, parse_value(high, def)?)
        } else {
            let value = parse_value(range, def)?;
            // `5/15` means "from 5 to the end of the range every 15"
            if part.contains('/') {
                (value, def.max)
            } else {
                (value, value)
            }
        };

        if start > end {
            return Err(invalid(def, raw));
        }
        values.extend((start..=end).step_by(step as usize));
    }

    Ok(Field::Values(values))
}

fn parse_value(raw: &str, def: FieldDef) -> Result<u32, ScheduleError> {
    let upper = raw.to_ascii_uppercase();
    if let Some(position) = def.names.iter().position(|name| *name == upper) {
        return Ok(def.min + position as u32);
    }
    if raw.contains(['L', 'W', '#']) || upper.contains(['L', 'W']) {
        return Err(ScheduleError::Unsupported {
            field: def.name,
            value: raw.to_string(),
        });
    }
    let value: u32 = raw.parse().map_err(|_| invalid(def, raw))?;
    if value < def.min || value > def.max {
        return Err(ScheduleError::OutOfRange {
            field: def.name,
            value,
            min: def.min,
            max: def.max,
        });
    }
    Ok(value)
}

fn invalid(def: FieldDef, raw: &str) -> ScheduleError {
    ScheduleError::InvalidField {
        field: def.name,
        value: raw.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    #[test]
    fn morning_trigger_fires_once_a_day_at_seven() {
        let schedule = CronSchedule::parse("cron(0 7 * * ? *)").unwrap();
        let start = utc(2024, 2, 15, 0, 0);
        let end = start + Duration::days(30);

        let fires = schedule.fires_between(start, end);
        assert_eq!(fires.len(), 30);
        for (day, fire) in fires.iter().enumerate() {
            assert_eq!(fire.date_naive(), (start + Duration::days(day as i64)).date_naive());
            assert_eq!((fire.hour(), fire.minute(), fire.second()), (7, 0, 0));
        }
    }

    #[test]
    fn next_after_is_strictly_later() {
        let schedule = CronSchedule::parse("cron(0 7 * * ? *)").unwrap();
        assert_eq!(schedule.next_after(utc(2024, 3, 1, 6, 59)), Some(utc(2024, 3, 1, 7, 0)));
        assert_eq!(schedule.next_after(utc(2024, 3, 1, 7, 0)), Some(utc(2024, 3, 2, 7, 0)));
        assert_eq!(schedule.next_after(utc(2024, 12, 31, 8, 0)), Some(utc(2025, 1, 1, 7, 0)));
    }

    #[test]
    fn day_of_week_uses_sunday_as_one() {
        // Mondays through Fridays at 09:30
        let schedule = CronSchedule::parse("cron(30 9 ? * MON-FRI *)").unwrap();
        let start = utc(2024, 6, 1, 0, 0); // a Saturday
        let fires = schedule.fires_between(start, start + Duration::days(7));
        assert_eq!(fires.len(), 5);
        assert_eq!(fires[0], utc(2024, 6, 3, 9, 30));

        let sundays = CronSchedule::parse("cron(0 0 ? * 1 *)").unwrap();
        assert_eq!(sundays.next_after(start), Some(utc(2024, 6, 2, 0, 0)));
    }

    #[test]
    fn steps_lists_and_years() {
        let schedule = CronSchedule::parse("0/15 8,20 1 JAN ? 2030").unwrap();
        let fires = schedule.fires_between(utc(2020, 1, 1, 0, 0), utc(2040, 1, 1, 0, 0));
        assert_eq!(fires.len(), 8);
        assert_eq!(fires[0], utc(2030, 1, 1, 8, 0));
        assert_eq!(fires[7], utc(2030, 1, 1, 20, 45));
        assert_eq!(schedule.expression(), "cron(0/15 8,20 1 JAN ? 2030)");
    }

    #[test]
    fn requires_exactly_one_unspecified_day_field() {
        assert_eq!(
            CronSchedule::parse("cron(0 7 * * * *)"),
            Err(ScheduleError::DayFieldConflict)
        );
        assert_eq!(
            CronSchedule::parse("cron(0 7 ? * ? *)"),
            Err(ScheduleError::DayFieldConflict)
        );
    }

    #[test]
    fn rejects_malformed_expressions() {
        assert_eq!(CronSchedule::parse("cron(0 7 * *)"), Err(ScheduleError::FieldCount(4)));
        assert!(matches!(
            CronSchedule::parse("cron(61 7 * * ? *)"),
            Err(ScheduleError::OutOfRange { field: "minutes", value: 61, .. })
        ));
        assert_eq!(
            CronSchedule::parse("cron(0 7 * * ? ?)"),
            Err(ScheduleError::InvalidField { field: "year", value: "?".into() })
        );
        assert!(matches!(
            CronSchedule::parse("cron(0 7 L * ? *)"),
            Err(ScheduleError::Unsupported { .. })
        ));
        assert!(matches!(
            CronSchedule::parse("cron(0 7 ? * 2#1 *)"),
            Err(ScheduleError::Unsupported { .. })
        ));
    }
}
