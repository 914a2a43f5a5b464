//! Five-field cron expressions, matched in the trigger's IANA timezone.
//!
//! Supported syntax per field: `*`, an integer, a comma list, a hyphen
//! range, and `*/N` intervals. Expressions are parsed once at insertion and
//! rejected when malformed; matching computes the five fields from the
//! trigger's timezone, never the host's.

use anyhow::{bail, Result};
use chrono::{DateTime, Datelike, Duration, Timelike, Utc};
use chrono_tz::Tz;

/// Upper bound on the forward scan for the informational next-fire time.
const NEXT_FIRE_SCAN_MINUTES: i64 = 366 * 24 * 60;

/// One field of a cron expression.
#[derive(Debug, Clone, PartialEq)]
enum CronField {
    Any,
    Values(Vec<u8>),
}

impl CronField {
    fn matches(&self, value: u8) -> bool {
        match self {
            Self::Any => true,
            Self::Values(values) => values.contains(&value),
        }
    }
}

/// A parsed 5-field cron expression: minute, hour, day-of-month, month,
/// day-of-week (0 = Sunday, 7 accepted as Sunday).
#[derive(Debug, Clone, PartialEq)]
pub struct CronExpr {
    minute: CronField,
    hour: CronField,
    day_of_month: CronField,
    month: CronField,
    day_of_week: CronField,
}

impl CronExpr {
    /// Parse an expression, rejecting anything other than five
    /// whitespace-separated fields of supported syntax.
    pub fn parse(expr: &str) -> Result<Self> {
        let fields: Vec<&str> = expr.split_whitespace().collect();
        if fields.len() != 5 {
            bail!("cron expression must have 5 fields, got {}: {expr:?}", fields.len());
        }
        Ok(Self {
            minute: parse_field(fields[0], 0, 59, false)?,
            hour: parse_field(fields[1], 0, 23, false)?,
            day_of_month: parse_field(fields[2], 1, 31, false)?,
            month: parse_field(fields[3], 1, 12, false)?,
            day_of_week: parse_field(fields[4], 0, 7, true)?,
        })
    }

    /// Whether the expression matches the given instant, evaluated in `tz`.
    pub fn matches(&self, at: DateTime<Utc>, tz: Tz) -> bool {
        let local = at.with_timezone(&tz);
        self.minute.matches(local.minute() as u8)
            && self.hour.matches(local.hour() as u8)
            && self.day_of_month.matches(local.day() as u8)
            && self.month.matches(local.month() as u8)
            && self.day_of_week.matches(local.weekday().num_days_from_sunday() as u8)
    }

    /// The next matching instant strictly after `from`, scanning forward
    /// minute by minute for up to a year.
    pub fn next_fire(&self, from: DateTime<Utc>, tz: Tz) -> Option<DateTime<Utc>> {
        let mut candidate = from
            .with_second(0)
            .and_then(|t| t.with_nanosecond(0))
            .unwrap_or(from)
            + Duration::minutes(1);
        for _ in 0..NEXT_FIRE_SCAN_MINUTES {
            if self.matches(candidate, tz) {
                return Some(candidate);
            }
            candidate += Duration::minutes(1);
        }
        None
    }
}

fn parse_field(field: &str, min: u8, max: u8, is_dow: bool) -> Result<CronField> {
    if field == "*" {
        return Ok(CronField::Any);
    }

    let mut values: Vec<u8> = Vec::new();
    for part in field.split(',') {
        if let Some(step) = part.strip_prefix("*/") {
            let step: u8 = step
                .parse()
                .map_err(|_| anyhow::anyhow!("bad interval in cron field: {part:?}"))?;
            if step == 0 {
                bail!("cron interval must be positive: {part:?}");
            }
            values.extend((min..=max).step_by(step as usize));
        } else if let Some((start, end)) = part.split_once('-') {
            let start = parse_value(start, min, max, is_dow)?;
            let end = parse_value(end, min, max, is_dow)?;
            if start > end {
                bail!("cron range is inverted: {part:?}");
            }
            values.extend(start..=end);
        } else {
            values.push(parse_value(part, min, max, is_dow)?);
        }
    }
    values.sort_unstable();
    values.dedup();
    Ok(CronField::Values(values))
}

fn parse_value(raw: &str, min: u8, max: u8, is_dow: bool) -> Result<u8> {
    let value: u8 = raw
        .parse()
        .map_err(|_| anyhow::anyhow!("bad cron value: {raw:?}"))?;
    // Day-of-week accepts 7 as Sunday
    let value = if is_dow && value == 7 { 0 } else { value };
    if !(min..=max).contains(&value) {
        bail!("cron value {value} out of range {min}-{max}");
    }
    Ok(value)
}
