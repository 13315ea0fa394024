//! Working-hours and holiday restrictions.

use std::collections::BTreeSet;

use chrono::{DateTime, Datelike, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};

use crate::clock::AlarmZone;

/// Monday to Friday.
pub const DEFAULT_WORK_DAYS: u8 = 0b001_1111;

/// Weekday bitmask plus the daily working window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkingHours {
    /// Monday = bit 0 ... Sunday = bit 6.
    pub days: u8,
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl Default for WorkingHours {
    fn default() -> Self {
        Self {
            days: DEFAULT_WORK_DAYS,
            start: NaiveTime::from_hms_opt(9, 0, 0).unwrap_or_default(),
            end: NaiveTime::from_hms_opt(17, 0, 0).unwrap_or_default(),
        }
    }
}

impl WorkingHours {
    pub fn is_work_day(&self, date: NaiveDate) -> bool {
        let bit = date.weekday().num_days_from_monday();
        self.days & (1 << bit) != 0
    }

    /// Whether `time` falls inside the working window. A window whose end is
    /// not after its start runs overnight.
    pub fn contains_time(&self, time: NaiveTime) -> bool {
        if self.start < self.end {
            time >= self.start && time < self.end
        } else {
            time >= self.start || time < self.end
        }
    }
}

/// Working-time and holiday rules, as configured in the preferences.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkTimeRules {
    pub hours: WorkingHours,
    pub holidays: BTreeSet<NaiveDate>,
}

impl WorkTimeRules {
    pub fn new(hours: WorkingHours, holidays: impl IntoIterator<Item = NaiveDate>) -> Self {
        Self {
            hours,
            holidays: holidays.into_iter().collect(),
        }
    }

    /// True if an alarm with the given restriction flags may not trigger at `t`.
    ///
    /// Date-only alarms are only checked against the day, never the hours.
    pub fn excludes(
        &self,
        t: DateTime<Utc>,
        zone: AlarmZone,
        work_time_only: bool,
        exclude_holidays: bool,
        date_only: bool,
    ) -> bool {
        let local = zone.to_local(t);
        if exclude_holidays && self.holidays.contains(&local.date()) {
            return true;
        }
        if work_time_only {
            if !self.hours.is_work_day(local.date()) {
                return true;
            }
            if !date_only && !self.hours.contains_time(local.time()) {
                return true;
            }
        }
        false
    }
}
