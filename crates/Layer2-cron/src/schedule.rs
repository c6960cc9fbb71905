//! When a cron job fires
//!
//! - `at` - one-shot at an absolute timestamp
//! - `every` - fixed interval from an anchor
//! - `cron` - 5-field expression in a timezone

use crate::expr::{parse_timezone, CronExpr};
use chrono::{TimeZone, Utc};
use hive_foundation::{Error, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum CronSchedule {
    #[serde(rename_all = "camelCase")]
    At { at_ms: i64 },

    #[serde(rename_all = "camelCase")]
    Every {
        every_ms: i64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        anchor_ms: Option<i64>,
    },

    #[serde(rename_all = "camelCase")]
    Cron {
        expr: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tz: Option<String>,
    },
}

impl CronSchedule {
    pub fn at(at_ms: i64) -> Self {
        Self::At { at_ms }
    }

    pub fn every(every_ms: i64) -> Self {
        Self::Every {
            every_ms,
            anchor_ms: None,
        }
    }

    pub fn cron(expr: impl Into<String>, tz: Option<String>) -> Self {
        Self::Cron {
            expr: expr.into(),
            tz,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::At { .. } => "at",
            Self::Every { .. } => "every",
            Self::Cron { .. } => "cron",
        }
    }

    /// Fired by the cron timers rather than the poll
    pub fn is_cron(&self) -> bool {
        matches!(self, Self::Cron { .. })
    }

    pub fn is_one_shot(&self) -> bool {
        matches!(self, Self::At { .. })
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            Self::At { at_ms } if *at_ms <= 0 => {
                Err(Error::InvalidInput(format!("invalid at timestamp: {}", at_ms)))
            }
            Self::Every { every_ms, .. } if *every_ms <= 0 => Err(Error::InvalidInput(format!(
                "interval must be positive, got {}ms",
                every_ms
            ))),
            Self::Cron { expr, tz } => {
                CronExpr::parse(expr)?;
                parse_timezone(tz.as_deref())?;
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Next fire time in ms, or `None` when the job will never fire again
    ///
    /// `created_at_ms` anchors `every` schedules without an explicit anchor;
    /// `last_run_ms` guards one-shot jobs against firing twice.
    pub fn next_run(&self, now_ms: i64, created_at_ms: i64, last_run_ms: Option<i64>) -> Option<i64> {
        match self {
            Self::At { at_ms } => match last_run_ms {
                Some(last) if last >= *at_ms => None,
                _ => Some(*at_ms),
            },
            Self::Every { every_ms, anchor_ms } => {
                let every = (*every_ms).max(1);
                let anchor = anchor_ms.unwrap_or(created_at_ms);
                if anchor > now_ms {
                    return Some(anchor);
                }
                // an interval too large to represent never fires again
                let elapsed = now_ms.checked_sub(anchor)?;
                (elapsed / every + 1)
                    .checked_mul(every)
                    .and_then(|offset| anchor.checked_add(offset))
            }
            Self::Cron { expr, tz } => {
                let expr = CronExpr::parse(expr).ok()?;
                let tz = parse_timezone(tz.as_deref()).ok()?;
                let now = Utc.timestamp_millis_opt(now_ms).single()?;
                expr.next_after(now, tz).map(|dt| dt.timestamp_millis())
            }
        }
    }
}

impl std::fmt::Display for CronSchedule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::At { at_ms } => match Utc.timestamp_millis_opt(*at_ms).single() {
                Some(dt) => write!(f, "at {}", dt.to_rfc3339()),
                None => write!(f, "at {}ms", at_ms),
            },
            Self::Every { every_ms, .. } => write!(f, "every {}ms", every_ms),
            Self::Cron { expr, tz } => match tz {
                Some(tz) => write!(f, "cron \"{}\" ({})", expr, tz),
                None => write!(f, "cron \"{}\"", expr),
            },
        }
    }
}
