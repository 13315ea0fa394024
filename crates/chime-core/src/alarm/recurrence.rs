//! Recurrence rules.
//!
//! A rule is anchored at the definition's start time and evaluated in the
//! alarm's wall-clock zone, so a daily 09:00 alarm stays at 09:00 local time
//! across DST changes. Minutely rules are the exception: they step in
//! absolute time.
//!
//! Occurrences are grouped into *periods* (one minute/day/week/month/year
//! step of the rule). Searches jump straight to the period containing the
//! target time and scan from there, so nothing here walks the whole history
//! of a long-running alarm.

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::clock::AlarmZone;
use crate::error::ValidationError;

/// Upper bound on periods scanned by a single search. Large enough to cross
/// runs of skipped months or non-leap years.
const MAX_PERIOD_SCAN: i64 = 4000;

/// Upper bound on periods walked when counting occurrences from the start.
const MAX_COUNT_SCAN: i64 = 200_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frequency {
    Minutely,
    Daily,
    /// `days` is a weekday bitmask, Monday = bit 0.
    Weekly { days: u8 },
    /// Months without `day` are skipped.
    MonthlyByDay { day: u32 },
    /// Same month and day as the start; Feb 29 only recurs in leap years.
    Yearly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RecurrenceEnd {
    #[default]
    Never,
    Count {
        count: u32,
    },
    Until {
        until: DateTime<Utc>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recurrence {
    pub frequency: Frequency,
    pub interval: u32,
    #[serde(default)]
    pub end: RecurrenceEnd,
}

/// One occurrence of a rule: 0-based index and instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hit {
    pub index: u64,
    pub at: DateTime<Utc>,
}

impl Recurrence {
    pub fn minutely(interval: u32) -> Self {
        Self::new(Frequency::Minutely, interval)
    }

    pub fn daily(interval: u32) -> Self {
        Self::new(Frequency::Daily, interval)
    }

    pub fn weekly(days: u8, interval: u32) -> Self {
        Self::new(Frequency::Weekly { days }, interval)
    }

    pub fn monthly(day: u32, interval: u32) -> Self {
        Self::new(Frequency::MonthlyByDay { day }, interval)
    }

    pub fn yearly(interval: u32) -> Self {
        Self::new(Frequency::Yearly, interval)
    }

    fn new(frequency: Frequency, interval: u32) -> Self {
        Self {
            frequency,
            interval,
            end: RecurrenceEnd::Never,
        }
    }

    pub fn with_end(mut self, end: RecurrenceEnd) -> Self {
        self.end = end;
        self
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.interval == 0 {
            return Err(ValidationError::ZeroInterval {
                field: "recurrence.interval".into(),
            });
        }
        match self.frequency {
            Frequency::Weekly { days } if days & 0x7f == 0 => Err(ValidationError::NoWeekdays),
            Frequency::MonthlyByDay { day } if day == 0 || day > 31 => {
                Err(ValidationError::InvalidValue {
                    field: "recurrence.day".into(),
                    message: format!("{day} is not a day of the month"),
                })
            }
            _ => Ok(()),
        }
    }

    /// Shortest possible gap between two consecutive occurrences, in minutes.
    pub fn shortest_gap_minutes(&self) -> i64 {
        let iv = i64::from(self.interval.max(1));
        match self.frequency {
            Frequency::Minutely => iv,
            Frequency::Daily => iv * 1440,
            Frequency::Weekly { days } => {
                let set: Vec<i64> = (0..7).filter(|d| days & (1 << d) != 0).collect();
                match (set.first(), set.last()) {
                    (Some(first), Some(last)) if set.len() > 1 => {
                        let wrap = first + 7 * iv - last;
                        let inner = set.windows(2).map(|w| w[1] - w[0]).min().unwrap_or(wrap);
                        wrap.min(inner) * 1440
                    }
                    _ => iv * 7 * 1440,
                }
            }
            Frequency::MonthlyByDay { .. } => iv * 28 * 1440,
            Frequency::Yearly => iv * 365 * 1440,
        }
    }

    /// First occurrence strictly after `after`.
    pub fn next_after(
        &self,
        start: DateTime<Utc>,
        after: DateTime<Utc>,
        zone: AlarmZone,
    ) -> Option<Hit> {
        let zone = self.effective_zone(zone);
        let start_l = zone.to_local(start);
        // Step back one period: an ambiguous wall-clock hour can place an
        // occurrence of the previous period after `after`.
        let mut p = (self.period_index(start_l, zone.to_local(after)) - 1).max(0);
        let mut index = self.count_before_period(start_l, p);
        for _ in 0..MAX_PERIOD_SCAN {
            for local in self.period_occurrences(start_l, p) {
                if self.beyond_count(index) {
                    return None;
                }
                let at = zone.to_utc(local);
                if let RecurrenceEnd::Until { until } = self.end {
                    if at > until {
                        return None;
                    }
                }
                if at > after {
                    return Some(Hit { index, at });
                }
                index += 1;
            }
            p += 1;
        }
        None
    }

    /// Latest occurrence at or before `at`.
    pub fn previous_at_or_before(
        &self,
        start: DateTime<Utc>,
        at: DateTime<Utc>,
        zone: AlarmZone,
    ) -> Option<Hit> {
        let zone = self.effective_zone(zone);
        match self.end {
            RecurrenceEnd::Never => {}
            RecurrenceEnd::Count { count: 0 } => return None,
            RecurrenceEnd::Count { .. } | RecurrenceEnd::Until { .. } => {
                match self.last(start, zone) {
                    Some(last) if last.at <= at => return Some(last),
                    Some(_) => {}
                    None if matches!(self.end, RecurrenceEnd::Until { .. }) => return None,
                    None => {}
                }
            }
        }
        self.scan_back(start, at, zone)
    }

    /// Final occurrence of a bounded rule; `None` for open-ended rules.
    pub fn last(&self, start: DateTime<Utc>, zone: AlarmZone) -> Option<Hit> {
        let zone = self.effective_zone(zone);
        match self.end {
            RecurrenceEnd::Never | RecurrenceEnd::Count { count: 0 } => None,
            RecurrenceEnd::Count { count } => self.nth(start, u64::from(count) - 1, zone),
            RecurrenceEnd::Until { until } => self.scan_back(start, until, zone),
        }
    }

    /// Occurrence number `index`, ignoring the rule's end.
    pub fn nth(&self, start: DateTime<Utc>, index: u64, zone: AlarmZone) -> Option<Hit> {
        let zone = self.effective_zone(zone);
        let start_l = zone.to_local(start);
        if matches!(self.frequency, Frequency::Minutely | Frequency::Daily) {
            let p = i64::try_from(index).ok()?;
            return self
                .period_occurrences(start_l, p)
                .first()
                .map(|local| Hit {
                    index,
                    at: zone.to_utc(*local),
                });
        }
        let mut seen = 0u64;
        for p in 0..MAX_COUNT_SCAN {
            let occurrences = self.period_occurrences(start_l, p);
            let len = occurrences.len() as u64;
            if seen + len > index {
                let local = occurrences[(index - seen) as usize];
                return Some(Hit {
                    index,
                    at: zone.to_utc(local),
                });
            }
            seen += len;
        }
        None
    }

    fn scan_back(&self, start: DateTime<Utc>, at: DateTime<Utc>, zone: AlarmZone) -> Option<Hit> {
        if at < start {
            return None;
        }
        let start_l = zone.to_local(start);
        let mut p = self.period_index(start_l, zone.to_local(at)) + 1;
        for _ in 0..MAX_PERIOD_SCAN {
            let base = self.count_before_period(start_l, p);
            let occurrences = self.period_occurrences(start_l, p);
            for (i, local) in occurrences.iter().enumerate().rev() {
                let t = zone.to_utc(*local);
                if t <= at {
                    return Some(Hit {
                        index: base + i as u64,
                        at: t,
                    });
                }
            }
            if p == 0 {
                return None;
            }
            p -= 1;
        }
        None
    }

    fn beyond_count(&self, index: u64) -> bool {
        matches!(self.end, RecurrenceEnd::Count { count } if index >= u64::from(count))
    }

    fn effective_zone(&self, zone: AlarmZone) -> AlarmZone {
        match self.frequency {
            Frequency::Minutely => AlarmZone::utc(),
            _ => zone,
        }
    }

    /// Index of the period containing wall-clock time `t`.
    fn period_index(&self, start: NaiveDateTime, t: NaiveDateTime) -> i64 {
        if t <= start {
            return 0;
        }
        let iv = i64::from(self.interval.max(1));
        let p = match self.frequency {
            Frequency::Minutely => (t - start).num_minutes() / iv,
            Frequency::Daily => (t.date() - start.date()).num_days() / iv,
            Frequency::Weekly { .. } => {
                (t.date() - week_monday(start.date())).num_days() / 7 / iv
            }
            Frequency::MonthlyByDay { .. } => {
                (month_index(t.date()) - month_index(start.date())) / iv
            }
            Frequency::Yearly => i64::from(t.year() - start.year()) / iv,
        };
        p.max(0)
    }

    /// Wall-clock occurrences in period `p`, in order, none before `start`.
    fn period_occurrences(&self, start: NaiveDateTime, p: i64) -> Vec<NaiveDateTime> {
        let step = p * i64::from(self.interval.max(1));
        let time = start.time();
        let mut out: Vec<NaiveDateTime> = match self.frequency {
            Frequency::Minutely => vec![start + Duration::minutes(step)],
            Frequency::Daily => vec![(start.date() + Duration::days(step)).and_time(time)],
            Frequency::Weekly { days } => {
                let monday = week_monday(start.date()) + Duration::weeks(step);
                (0..7)
                    .filter(|d| days & (1 << d) != 0)
                    .map(|d| (monday + Duration::days(d)).and_time(time))
                    .collect()
            }
            Frequency::MonthlyByDay { day } => {
                date_in_month(month_index(start.date()) + step, day)
                    .map(|date| date.and_time(time))
                    .into_iter()
                    .collect()
            }
            Frequency::Yearly => i32::try_from(step)
                .ok()
                .and_then(|years| {
                    NaiveDate::from_ymd_opt(start.year() + years, start.month(), start.day())
                })
                .map(|date| date.and_time(time))
                .into_iter()
                .collect(),
        };
        out.retain(|t| *t >= start);
        out
    }

    /// Number of occurrences in periods `0..p`.
    fn count_before_period(&self, start: NaiveDateTime, p: i64) -> u64 {
        match self.frequency {
            Frequency::Minutely | Frequency::Daily => p.max(0) as u64,
            Frequency::Weekly { days } if p > 0 => {
                let first = self.period_occurrences(start, 0).len() as u64;
                first + (p as u64 - 1) * u64::from((days & 0x7f).count_ones())
            }
            _ => (0..p)
                .map(|q| self.period_occurrences(start, q).len() as u64)
                .sum(),
        }
    }
}

fn week_monday(date: NaiveDate) -> NaiveDate {
    date - Duration::days(i64::from(date.weekday().num_days_from_monday()))
}

fn month_index(date: NaiveDate) -> i64 {
    i64::from(date.year()) * 12 + i64::from(date.month0())
}

fn date_in_month(index: i64, day: u32) -> Option<NaiveDate> {
    let year = i32::try_from(index.div_euclid(12)).ok()?;
    let month = u32::try_from(index.rem_euclid(12)).ok()? + 1;
    NaiveDate::from_ymd_opt(year, month, day)
}
