//! Cron-scheduled transient tasks.
//!
//! Scheduling is minute-granular: the supervisor evaluates every entry once
//! per wall-clock minute, against the start of that minute. Instances of an
//! entry with `allow-multiple=false` are keyed by name (at most one alive);
//! with `allow-multiple=true` each fire gets a ULID-suffixed key so repeated
//! fires never collide.

use anyhow::{Result, anyhow};
use chrono::{DateTime, Local, Timelike};
use cron::Schedule;
use std::str::FromStr;
use std::thread::JoinHandle;
use std::time::Instant;
use ulid::Ulid;

use crate::child::ChildHandle;
use crate::config::PeriodicSpec;

/// A periodic entry with its parsed schedule, in declared order.
pub struct PeriodicEntry {
    pub name: String,
    pub spec: PeriodicSpec,
    pub schedule: Schedule,
}

/// One live run of a periodic task.
pub struct PeriodicInstance {
    pub key: String,
    pub name: String,
    pub child: ChildHandle,
    pub pump: Option<JoinHandle<()>>,
    pub started_at: Instant,
}

/// Parse a five-field cron expression (minute, hour, day-of-month, month,
/// day-of-week). The cron crate wants a seconds field; pin it to zero so
/// the schedule fires exactly at minute boundaries.
pub fn parse_schedule(timing: &str) -> Result<Schedule> {
    Schedule::from_str(&format!("0 {timing}"))
        .map_err(|err| anyhow!("invalid cron expression '{timing}': {err}"))
}

/// True when the schedule matches the minute containing `now`.
pub fn matches_minute(schedule: &Schedule, now: DateTime<Local>) -> bool {
    let Some(minute_start) = now.with_second(0).and_then(|t| t.with_nanosecond(0)) else {
        return false;
    };
    schedule.includes(minute_start)
}

/// Key for a new instance. Repeated fires of an `allow-multiple` entry must
/// not collide, which the ULID's monotonic randomness guarantees.
pub fn instance_key(name: &str, allow_multiple: bool) -> String {
    if allow_multiple {
        format!("{name}:{}", Ulid::new())
    } else {
        name.to_string()
    }
}
