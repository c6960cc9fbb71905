//! 5-field cron expressions
//!
//! `minute hour day-of-month month day-of-week`, each field accepting `*`,
//! values, `a-b` ranges, `/step` and comma lists. Months and weekdays also
//! accept three-letter names; weekday `7` is Sunday. When both day fields are
//! restricted a day matches if *either* matches.

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, TimeZone, Timelike, Utc};
use chrono_tz::Tz;
use hive_foundation::{Error, Result};
use std::str::FromStr;

const MONTH_NAMES: &[&str] = &[
    "jan", "feb", "mar", "apr", "may", "jun", "jul", "aug", "sep", "oct", "nov", "dec",
];
const DAY_NAMES: &[&str] = &["sun", "mon", "tue", "wed", "thu", "fri", "sat"];

/// How far ahead `next_after` searches before giving up (e.g. `0 0 30 2 *`)
const SEARCH_YEARS: i32 = 5;

/// Parsed cron expression
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronExpr {
    source: String,
    minutes: u64,
    hours: u64,
    days_of_month: u64,
    months: u64,
    days_of_week: u64,
    dom_restricted: bool,
    dow_restricted: bool,
}

impl CronExpr {
    pub fn parse(expr: &str) -> Result<Self> {
        let fields: Vec<&str> = expr.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(Error::Cron(format!(
                "expected 5 fields in {:?}, found {}",
                expr,
                fields.len()
            )));
        }

        let mut days_of_week = parse_field(fields[4], 0, 7, Some((DAY_NAMES, 0)))?;
        if days_of_week & (1 << 7) != 0 {
            days_of_week = (days_of_week & !(1 << 7)) | 1;
        }

        Ok(Self {
            source: fields.join(" "),
            minutes: parse_field(fields[0], 0, 59, None)?,
            hours: parse_field(fields[1], 0, 23, None)?,
            days_of_month: parse_field(fields[2], 1, 31, None)?,
            months: parse_field(fields[3], 1, 12, Some((MONTH_NAMES, 1)))?,
            days_of_week,
            dom_restricted: !fields[2].starts_with('*'),
            dow_restricted: !fields[4].starts_with('*'),
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    fn day_matches(&self, date: NaiveDate) -> bool {
        let dom = bit(self.days_of_month, date.day());
        let dow = bit(self.days_of_week, date.weekday().num_days_from_sunday());
        match (self.dom_restricted, self.dow_restricted) {
            (true, true) => dom || dow,
            (true, false) => dom,
            (false, true) => dow,
            (false, false) => true,
        }
    }

    /// First fire time strictly after `after`, evaluated in `tz`
    pub fn next_after(&self, after: DateTime<Utc>, tz: Tz) -> Option<DateTime<Utc>> {
        let local = after.with_timezone(&tz).naive_local();
        let mut t = local.with_second(0)?.with_nanosecond(0)? + Duration::minutes(1);
        let limit_year = local.year() + SEARCH_YEARS;

        while t.year() <= limit_year {
            if !bit(self.months, t.month()) {
                t = first_of_next_month(t)?;
                continue;
            }
            if !self.day_matches(t.date()) {
                t = (t.date() + Duration::days(1)).and_hms_opt(0, 0, 0)?;
                continue;
            }
            if !bit(self.hours, t.hour()) {
                t = t.with_minute(0)? + Duration::hours(1);
                continue;
            }
            if !bit(self.minutes, t.minute()) {
                t += Duration::minutes(1);
                continue;
            }

            let resolved = tz.from_local_datetime(&t);
            let candidate = resolved
                .earliest()
                .filter(|dt| dt.with_timezone(&Utc) > after)
                .or_else(|| resolved.latest().filter(|dt| dt.with_timezone(&Utc) > after));
            match candidate {
                Some(dt) => return Some(dt.with_timezone(&Utc)),
                // Skipped by a DST gap (or already passed in a repeated hour)
                None => t += Duration::minutes(1),
            }
        }
        None
    }
}

impl FromStr for CronExpr {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl std::fmt::Display for CronExpr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.source)
    }
}

/// Resolve an IANA timezone name (`None` = UTC)
pub fn parse_timezone(tz: Option<&str>) -> Result<Tz> {
    match tz {
        None => Ok(Tz::UTC),
        Some(name) if name.trim().is_empty() => Ok(Tz::UTC),
        Some(name) => name
            .trim()
            .parse::<Tz>()
            .map_err(|e| Error::Cron(format!("unknown timezone {:?}: {}", name, e))),
    }
}

fn bit(mask: u64, value: u32) -> bool {
    value < 64 && mask & (1u64 << value) != 0
}

fn first_of_next_month(t: NaiveDateTime) -> Option<NaiveDateTime> {
    let (year, month) = if t.month() == 12 {
        (t.year() + 1, 1)
    } else {
        (t.year(), t.month() + 1)
    };
    NaiveDate::from_ymd_opt(year, month, 1)?.and_hms_opt(0, 0, 0)
}

fn parse_value(token: &str, names: Option<(&[&str], u32)>) -> Result<u32> {
    if let Ok(v) = token.parse::<u32>() {
        return Ok(v);
    }
    if let Some((names, offset)) = names {
        let lower = token.to_ascii_lowercase();
        if let Some(index) = names.iter().position(|n| *n == lower) {
            return Ok(index as u32 + offset);
        }
    }
    Err(Error::Cron(format!("invalid value {:?}", token)))
}

/// Parse one field into a bit mask of allowed values
fn parse_field(field: &str, min: u32, max: u32, names: Option<(&[&str], u32)>) -> Result<u64> {
    let mut mask = 0u64;
    for item in field.split(',') {
        if item.is_empty() {
            return Err(Error::Cron(format!("empty list item in {:?}", field)));
        }
        let (range, step) = match item.split_once('/') {
            Some((range, step)) => {
                let step: u32 = step
                    .parse()
                    .map_err(|_| Error::Cron(format!("invalid step in {:?}", item)))?;
                if step == 0 {
                    return Err(Error::Cron(format!("zero step in {:?}", item)));
                }
                (range, step)
            }
            None => (item, 1),
        };

        let (start, end) = if range == "*" {
            (min, max)
        } else if let Some((a, b)) = range.split_once('-') {
            (parse_value(a, names)?, parse_value(b, names)?)
        } else {
            let start = parse_value(range, names)?;
            // `5/15` means every 15 starting at 5
            if item.contains('/') {
                (start, max)
            } else {
                (start, start)
            }
        };

        if start < min || end > max || start > end {
            return Err(Error::Cron(format!(
                "{:?} out of range {}-{}",
                item, min, max
            )));
        }
        let mut v = start;
        while v <= end {
            mask |= 1u64 << v;
            v += step;
        }
    }
    Ok(mask)
}
