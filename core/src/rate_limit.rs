//! Fixed-window rate limiting aligned to clock boundaries.
//!
//! The day is cut into windows of `window_minutes` starting at UTC midnight, so
//! with a 15 minute window every quarter hour opens a fresh counter. The last
//! window of the day is shortened when the size does not divide the day evenly.

use anyhow::Result;
use chrono::{DateTime, Duration, NaiveTime, Timelike, Utc};

use crate::db::Database;
use crate::models::RateLimitStatus;

pub const DEFAULT_LIMIT: u32 = 60;
pub const DEFAULT_WINDOW_MINUTES: u32 = 15;
const MINUTES_PER_DAY: u32 = 24 * 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitConfig {
    pub limit: u32,
    pub window_minutes: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            limit: DEFAULT_LIMIT,
            window_minutes: DEFAULT_WINDOW_MINUTES,
        }
    }
}

impl RateLimitConfig {
    pub fn new(limit: u32, window_minutes: u32) -> Result<Self> {
        if window_minutes == 0 || window_minutes > MINUTES_PER_DAY {
            anyhow::bail!("Rate limit window must be between 1 and {MINUTES_PER_DAY} minutes");
        }
        Ok(Self {
            limit,
            window_minutes,
        })
    }
}

/// Start (inclusive) and end (exclusive) of the window containing `now`.
#[must_use]
pub fn window_bounds(now: DateTime<Utc>, window_minutes: u32) -> (DateTime<Utc>, DateTime<Utc>) {
    let window = window_minutes.clamp(1, MINUTES_PER_DAY);
    let midnight = now.date_naive().and_time(NaiveTime::MIN).and_utc();
    let minute_of_day = now.hour() * 60 + now.minute();
    let index = minute_of_day / window;

    let start = midnight + Duration::minutes(i64::from(index * window));
    let next_midnight = midnight + Duration::days(1);
    let end = (start + Duration::minutes(i64::from(window))).min(next_midnight);
    (start, end)
}

fn status(config: RateLimitConfig, count: u32, allowed: bool, reset_at: DateTime<Utc>) -> RateLimitStatus {
    RateLimitStatus {
        allowed,
        limit: config.limit,
        remaining: config.limit.saturating_sub(count),
        reset_at,
    }
}

/// Count one call against `key` if the current window has room.
///
/// A refused call leaves the stored counter unchanged.
pub fn check_and_consume(
    db: &Database,
    key: &str,
    config: RateLimitConfig,
    now: DateTime<Utc>,
) -> Result<RateLimitStatus> {
    let (start, end) = window_bounds(now, config.window_minutes);
    let window_start = start.timestamp();

    match db.try_increment_rate_limit(key, window_start, config.limit)? {
        Some(count) => {
            if count == 1 {
                // First call in a new window: drop counters older than the previous window.
                let horizon = start - Duration::minutes(i64::from(config.window_minutes));
                let pruned = db.prune_rate_limits(horizon.timestamp())?;
                if pruned > 0 {
                    tracing::debug!(pruned, "pruned expired rate-limit windows");
                }
            }
            Ok(status(config, count, true, end))
        }
        None => {
            let count = db.rate_limit_count(key, window_start)?;
            tracing::debug!(key, count, limit = config.limit, "rate limit exceeded");
            Ok(status(config, count, false, end))
        }
    }
}

/// Current status for `key` without consuming a call.
pub fn peek(
    db: &Database,
    key: &str,
    config: RateLimitConfig,
    now: DateTime<Utc>,
) -> Result<RateLimitStatus> {
    let (start, end) = window_bounds(now, config.window_minutes);
    let count = db.rate_limit_count(key, start.timestamp())?;
    Ok(status(config, count, count < config.limit, end))
}
