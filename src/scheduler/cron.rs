use chrono::{
    DateTime, Datelike, Duration, LocalResult, NaiveDate, NaiveDateTime, TimeZone, Timelike,
};
use std::collections::BTreeSet;
use std::fmt;

const MONTH_NAMES: &[&str] = &[
    "jan", "feb", "mar", "apr", "may", "jun", "jul", "aug", "sep", "oct", "nov", "dec",
];
const WEEKDAY_NAMES: &[&str] = &["sun", "mon", "tue", "wed", "thu", "fri", "sat"];

// Leap-day schedules restricted to a weekday can wait several years for a match.
const SEARCH_HORIZON_DAYS: i64 = 366 * 8;

/// Parsed five-field cron expression: minute hour day-of-month month day-of-week.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronSchedule {
    expression: String,
    minutes: BTreeSet<u32>,
    hours: BTreeSet<u32>,
    days_of_month: BTreeSet<u32>,
    months: BTreeSet<u32>,
    days_of_week: BTreeSet<u32>,
    dom_restricted: bool,
    dow_restricted: bool,
}

impl CronSchedule {
    pub fn parse(expr: &str) -> Result<Self, String> {
        let parts: Vec<&str> = expr.split_whitespace().collect();
        if parts.len() != 5 {
            return Err(format!(
                "Cron expression '{}' must contain 5 fields: min hour day month dow",
                expr.trim()
            ));
        }

        let minutes = parse_cron_field(parts[0], 0, 59, &[])
            .map_err(|e| format!("minute field: {}", e))?;
        let hours = parse_cron_field(parts[1], 0, 23, &[])
            .map_err(|e| format!("hour field: {}", e))?;
        let days_of_month = parse_cron_field(parts[2], 1, 31, &[])
            .map_err(|e| format!("day-of-month field: {}", e))?;
        let months = parse_cron_field(parts[3], 1, 12, MONTH_NAMES)
            .map_err(|e| format!("month field: {}", e))?;
        // 7 is accepted as an alias for Sunday.
        let days_of_week = parse_cron_field(parts[4], 0, 7, WEEKDAY_NAMES)
            .map_err(|e| format!("day-of-week field: {}", e))?
            .into_iter()
            .map(|day| day % 7)
            .collect();

        Ok(Self {
            expression: parts.join(" "),
            minutes,
            hours,
            days_of_month,
            months,
            days_of_week,
            dom_restricted: !parts[2].starts_with('*'),
            dow_restricted: !parts[4].starts_with('*'),
        })
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// First matching minute strictly after `from`, evaluated in `from`'s timezone.
    pub fn next_after<Tz: TimeZone>(&self, from: &DateTime<Tz>) -> Option<DateTime<Tz>> {
        let tz = from.timezone();
        let start = from
            .naive_local()
            .with_second(0)
            .and_then(|dt| dt.with_nanosecond(0))?;
        let mut probe = start + Duration::minutes(1);
        let limit = start + Duration::days(SEARCH_HORIZON_DAYS);

        while probe <= limit {
            if !self.months.contains(&probe.month()) {
                probe = start_of_next_month(probe)?;
                continue;
            }
            if !self.day_matches(probe.date()) {
                probe = probe.date().succ_opt()?.and_hms_opt(0, 0, 0)?;
                continue;
            }
            if !self.hours.contains(&probe.hour()) {
                probe = probe.with_minute(0)? + Duration::hours(1);
                continue;
            }
            if !self.minutes.contains(&probe.minute()) {
                probe += Duration::minutes(1);
                continue;
            }
            match tz.from_local_datetime(&probe) {
                LocalResult::Single(dt) => return Some(dt),
                LocalResult::Ambiguous(earliest, _) => return Some(earliest),
                // Wall-clock minute skipped by a DST transition.
                LocalResult::None => probe += Duration::minutes(1),
            }
        }

        None
    }

    fn day_matches(&self, date: NaiveDate) -> bool {
        let dom = self.days_of_month.contains(&date.day());
        let dow = self
            .days_of_week
            .contains(&date.weekday().num_days_from_sunday());
        match (self.dom_restricted, self.dow_restricted) {
            (true, true) => dom || dow,
            (true, false) => dom,
            (false, true) => dow,
            (false, false) => true,
        }
    }
}

impl fmt::Display for CronSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.expression)
    }
}

fn start_of_next_month(probe: NaiveDateTime) -> Option<NaiveDateTime> {
    let (year, month) = if probe.month() == 12 {
        (probe.year() + 1, 1)
    } else {
        (probe.year(), probe.month() + 1)
    };
    NaiveDate::from_ymd_opt(year, month, 1)?.and_hms_opt(0, 0, 0)
}

fn parse_cron_field(
    field: &str,
    min: u32,
    max: u32,
    names: &[&str],
) -> Result<BTreeSet<u32>, String> {
    let mut out = BTreeSet::new();
    for part in field.split(',') {
        let token = part.trim();
        if token.is_empty() {
            return Err(format!("Invalid cron token '{}'", field));
        }

        let (range, step) = match token.split_once('/') {
            Some((range, step_raw)) => {
                let step: u32 = step_raw
                    .parse()
                    .map_err(|_| format!("Invalid cron step '{}'", token))?;
                if step == 0 {
                    return Err("Cron step cannot be 0".to_string());
                }
                (range, Some(step))
            }
            None => (token, None),
        };

        let (start, end) = if range == "*" {
            (min, max)
        } else if let Some((start_raw, end_raw)) = range.split_once('-') {
            let start = parse_cron_value(start_raw, min, names)?;
            let end = parse_cron_value(end_raw, min, names)?;
            if start > end {
                return Err(format!("Cron range is reversed '{}'", token));
            }
            (start, end)
        } else {
            let value = parse_cron_value(range, min, names)?;
            // "5/15" runs from 5 to the field maximum.
            if step.is_some() {
                (value, max)
            } else {
                (value, value)
            }
        };

        if start < min || end > max {
            return Err(format!(
                "Cron value out of bounds '{}' (allowed {}-{})",
                token, min, max
            ));
        }

        let step = step.unwrap_or(1) as usize;
        out.extend((start..=end).step_by(step));
    }

    if out.is_empty() {
        return Err("Cron field resolved to empty set".to_string());
    }

    Ok(out)
}

fn parse_cron_value(raw: &str, min: u32, names: &[&str]) -> Result<u32, String> {
    let lowered = raw.trim().to_ascii_lowercase();
    if let Some(index) = names.iter().position(|name| *name == lowered) {
        return Ok(min + index as u32);
    }
    lowered
        .parse()
        .map_err(|_| format!("Invalid cron value '{}'", raw))
}
