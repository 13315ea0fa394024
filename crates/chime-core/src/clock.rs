//! Clock and time zone source.
//!
//! Everything in the engine asks a [`Clock`] for "now" instead of calling
//! `Utc::now()` directly, so tests and `chime daemon --simulate-from` can run
//! against a [`SimulatedClock`].

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, FixedOffset, LocalResult, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Source of wall-clock time and the zone alarms are evaluated in.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    fn zone(&self) -> AlarmZone;
}

/// Zone used to turn an alarm's wall-clock time into an instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AlarmZone {
    /// The host's local zone, DST rules included.
    #[default]
    Local,
    /// A fixed UTC offset in seconds east of UTC.
    Fixed { offset_secs: i32 },
}

impl AlarmZone {
    pub fn utc() -> Self {
        AlarmZone::Fixed { offset_secs: 0 }
    }

    /// Wall-clock time of `t` in this zone.
    pub fn to_local(&self, t: DateTime<Utc>) -> NaiveDateTime {
        match self {
            AlarmZone::Local => t.with_timezone(&chrono::Local).naive_local(),
            AlarmZone::Fixed { offset_secs } => match FixedOffset::east_opt(*offset_secs) {
                Some(offset) => t.with_timezone(&offset).naive_local(),
                None => t.naive_utc(),
            },
        }
    }

    /// Instant for a wall-clock time in this zone.
    ///
    /// An ambiguous time (clocks going back) resolves to the earlier instant.
    /// A time inside a DST gap moves forward minute by minute to the first
    /// time that exists.
    pub fn to_utc(&self, local: NaiveDateTime) -> DateTime<Utc> {
        match self {
            AlarmZone::Local => resolve(&chrono::Local, local),
            AlarmZone::Fixed { offset_secs } => match FixedOffset::east_opt(*offset_secs) {
                Some(offset) => resolve(&offset, local),
                None => Utc.from_utc_datetime(&local),
            },
        }
    }
}

fn resolve<Tz: TimeZone>(tz: &Tz, local: NaiveDateTime) -> DateTime<Utc> {
    let mut probe = local;
    // DST gaps are at most a couple of hours.
    for _ in 0..=180 {
        match tz.from_local_datetime(&probe) {
            LocalResult::Single(t) => return t.with_timezone(&Utc),
            LocalResult::Ambiguous(earliest, _) => return earliest.with_timezone(&Utc),
            LocalResult::None => probe += Duration::minutes(1),
        }
    }
    Utc.from_utc_datetime(&local)
}

/// The real system clock in the host's local zone.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn zone(&self) -> AlarmZone {
        AlarmZone::Local
    }
}

/// Settable clock shared between the engine and whoever drives the simulation.
#[derive(Debug, Clone)]
pub struct SimulatedClock {
    now: Arc<Mutex<DateTime<Utc>>>,
    zone: AlarmZone,
}

impl SimulatedClock {
    /// Start a simulated clock at `start`, evaluated in UTC.
    pub fn new(start: DateTime<Utc>) -> Self {
        Self::with_zone(start, AlarmZone::utc())
    }

    pub fn with_zone(start: DateTime<Utc>, zone: AlarmZone) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
            zone,
        }
    }

    pub fn set(&self, t: DateTime<Utc>) {
        if let Ok(mut now) = self.now.lock() {
            *now = t;
        }
    }

    pub fn advance(&self, by: Duration) {
        if let Ok(mut now) = self.now.lock() {
            *now += by;
        }
    }
}

impl Clock for SimulatedClock {
    fn now(&self) -> DateTime<Utc> {
        match self.now.lock() {
            Ok(now) => *now,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    fn zone(&self) -> AlarmZone {
        self.zone
    }
}
