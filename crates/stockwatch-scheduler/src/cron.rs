//! Cron expression parser.
//! Supports: "MIN HOUR DOM MON DOW" (5-field, no seconds), evaluated in UTC.
//! Field syntax: *, N, A-B, */N, A-B/N, A/N and comma lists of those.
//! Month names (JAN..DEC) and weekday names (SUN..SAT, 7 = Sunday).
//! Macros: @hourly @daily @midnight @weekly @monthly @yearly @annually.
//! Example: "0 8 * * MON-FRI" = weekdays at 8:00
//!
//! Parsing is the validation step: a task's schedule is only ever stored in
//! a trigger as a parsed `CronSchedule`.

use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Timelike, Utc};
use stockwatch_core::error::{Result, StockWatchError};
use stockwatch_core::types::MonitoringTask;

const MONTH_NAMES: [&str; 12] = [
    "JAN", "FEB", "MAR", "APR", "MAY", "JUN", "JUL", "AUG", "SEP", "OCT", "NOV", "DEC",
];
const DAY_NAMES: [&str; 7] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];
const DAYS_IN_MONTH: [u32; 12] = [31, 29, 31, 30, 31, 30, 31, 31, 30, 31, 30, 31];

/// How far ahead `next_after` searches before giving up.
const SEARCH_HORIZON_DAYS: i64 = 366 * 5;

/// A validated recurrence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronSchedule {
    expression: String,
    minutes: Vec<u32>,
    hours: Vec<u32>,
    days_of_month: Vec<u32>,
    months: Vec<u32>,
    days_of_week: Vec<u32>,
    dom_restricted: bool,
    dow_restricted: bool,
}

impl CronSchedule {
    /// Parse and validate an expression.
    pub fn parse(expression: &str) -> Result<Self> {
        let trimmed = expression.trim();
        let expanded = expand_macro(trimmed).unwrap_or(trimmed);
        let parts: Vec<&str> = expanded.split_whitespace().collect();
        if parts.len() != 5 {
            return Err(invalid(
                expression,
                &format!("need 5 fields: MIN HOUR DOM MON DOW, got {}", parts.len()),
            ));
        }

        let minutes = parse_field(parts[0], 0, 59, None).map_err(|e| invalid(expression, &e))?;
        let hours = parse_field(parts[1], 0, 23, None).map_err(|e| invalid(expression, &e))?;
        let days_of_month =
            parse_field(parts[2], 1, 31, None).map_err(|e| invalid(expression, &e))?;
        let months = parse_field(parts[3], 1, 12, Some((&MONTH_NAMES, 1)))
            .map_err(|e| invalid(expression, &e))?;
        // 7 is an alias for Sunday.
        let mut days_of_week = parse_field(parts[4], 0, 7, Some((&DAY_NAMES, 0)))
            .map_err(|e| invalid(expression, &e))?;
        if days_of_week.contains(&7) {
            days_of_week.retain(|d| *d != 7);
            if !days_of_week.contains(&0) {
                days_of_week.insert(0, 0);
            }
        }

        let schedule = Self {
            expression: trimmed.to_string(),
            minutes,
            hours,
            days_of_month,
            months,
            days_of_week,
            dom_restricted: !parts[2].starts_with('*'),
            dow_restricted: !parts[4].starts_with('*'),
        };

        if schedule.dom_restricted && !schedule.dow_restricted && !schedule.has_possible_day() {
            return Err(invalid(expression, "day-of-month never occurs in the selected months"));
        }
        Ok(schedule)
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// First firing strictly after `after` (minute resolution).
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let mut candidate = after.with_second(0)?.with_nanosecond(0)? + Duration::minutes(1);
        let limit = after + Duration::days(SEARCH_HORIZON_DAYS);

        while candidate <= limit {
            if !self.months.contains(&candidate.month()) {
                candidate = start_of_next_month(candidate)?;
                continue;
            }
            if !self.day_matches(candidate) {
                candidate = start_of_day(candidate)? + Duration::days(1);
                continue;
            }
            if !self.hours.contains(&candidate.hour()) {
                candidate = candidate.with_minute(0)? + Duration::hours(1);
                continue;
            }
            if !self.minutes.contains(&candidate.minute()) {
                candidate += Duration::minutes(1);
                continue;
            }
            return Some(candidate);
        }

        None
    }

    /// Standard cron rule: when both day fields are restricted, either may match.
    fn day_matches(&self, t: DateTime<Utc>) -> bool {
        let dom = self.days_of_month.contains(&t.day());
        let dow = self
            .days_of_week
            .contains(&t.weekday().num_days_from_sunday());
        if self.dom_restricted && self.dow_restricted {
            dom || dow
        } else {
            dom && dow
        }
    }

    fn has_possible_day(&self) -> bool {
        self.months.iter().any(|m| {
            let max_day = DAYS_IN_MONTH[(*m - 1) as usize];
            self.days_of_month.iter().any(|d| *d <= max_day)
        })
    }
}

impl std::fmt::Display for CronSchedule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.expression)
    }
}

impl std::str::FromStr for CronSchedule {
    type Err = StockWatchError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

fn invalid(expression: &str, reason: &str) -> StockWatchError {
    StockWatchError::ConfigValidation(format!("invalid cron expression '{expression}': {reason}"))
}

fn expand_macro(expression: &str) -> Option<&'static str> {
    match expression.to_ascii_lowercase().as_str() {
        "@yearly" | "@annually" => Some("0 0 1 1 *"),
        "@monthly" => Some("0 0 1 * *"),
        "@weekly" => Some("0 0 * * 0"),
        "@daily" | "@midnight" => Some("0 0 * * *"),
        "@hourly" => Some("0 * * * *"),
        _ => None,
    }
}

/// Parse a cron field into a sorted list of matching values.
/// `names` maps symbolic values (e.g. "MON") to numbers starting at the given offset.
fn parse_field(
    field: &str,
    min: u32,
    max: u32,
    names: Option<(&[&str], u32)>,
) -> std::result::Result<Vec<u32>, String> {
    let mut values = Vec::new();

    for part in field.split(',') {
        let part = part.trim();
        if part.is_empty() {
            return Err(format!("empty list element in '{field}'"));
        }

        let (range, step) = match part.split_once('/') {
            Some((range, step)) => {
                let n: u32 = step
                    .parse()
                    .map_err(|_| format!("invalid step '{step}' in '{field}'"))?;
                if n == 0 {
                    return Err(format!("step must be positive in '{field}'"));
                }
                (range, Some(n))
            }
            None => (part, None),
        };

        let (start, end) = if range == "*" {
            (min, max)
        } else if let Some((a, b)) = range.split_once('-') {
            (parse_value(a, names)?, parse_value(b, names)?)
        } else {
            let v = parse_value(range, names)?;
            // "A/N" runs from A to the end of the range.
            if step.is_some() { (v, max) } else { (v, v) }
        };

        if start < min || end > max {
            return Err(format!("value out of range {min}-{max} in '{field}'"));
        }
        if start > end {
            return Err(format!("descending range in '{field}'"));
        }

        values.extend((start..=end).step_by(step.unwrap_or(1) as usize));
    }

    values.sort_unstable();
    values.dedup();
    Ok(values)
}

fn parse_value(raw: &str, names: Option<(&[&str], u32)>) -> std::result::Result<u32, String> {
    if let Ok(n) = raw.parse::<u32>() {
        return Ok(n);
    }
    if let Some((table, offset)) = names {
        let upper = raw.to_ascii_uppercase();
        if let Some(idx) = table.iter().position(|n| *n == upper) {
            return Ok(idx as u32 + offset);
        }
    }
    Err(format!("invalid value '{raw}'"))
}

fn start_of_day(t: DateTime<Utc>) -> Option<DateTime<Utc>> {
    Some(Utc.from_utc_datetime(&t.date_naive().and_hms_opt(0, 0, 0)?))
}

fn start_of_next_month(t: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let (year, month) = if t.month() == 12 {
        (t.year() + 1, 1)
    } else {
        (t.year(), t.month() + 1)
    };
    let date = NaiveDate::from_ymd_opt(year, month, 1)?;
    Some(Utc.from_utc_datetime(&date.and_hms_opt(0, 0, 0)?))
}

/// Validate a task record and parse its schedule.
pub fn validate_task(task: &MonitoringTask) -> Result<CronSchedule> {
    task.validate()?;
    CronSchedule::parse(&task.schedule).map_err(|e| match e {
        StockWatchError::ConfigValidation(msg) => {
            StockWatchError::ConfigValidation(format!("task '{}': {msg}", task.id))
        }
        other => other,
    })
}
