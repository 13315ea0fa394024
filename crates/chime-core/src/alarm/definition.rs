//! Alarm definitions and their sub-alarms.

use chrono::{DateTime, Duration, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::recurrence::{Hit, Recurrence};
use crate::clock::AlarmZone;
use crate::error::ValidationError;

/// Stable identity of an alarm definition.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AlarmId(String);

impl AlarmId {
    /// Fresh random id.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AlarmId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AlarmId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for AlarmId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// What an alarm does when it fires.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AlarmAction {
    /// Show a text message.
    Display { text: String },
    /// Show the contents of a file.
    File { path: String },
    /// Run a shell command, or a script body when `script` is set.
    Command {
        command: String,
        #[serde(default)]
        script: bool,
        #[serde(default)]
        in_terminal: bool,
    },
    Email {
        to: Vec<String>,
        subject: String,
        body: String,
        #[serde(default)]
        bcc: bool,
    },
    /// Play a sound without showing a message.
    Audio {
        file: String,
        #[serde(default)]
        volume: Option<f32>,
    },
}

impl AlarmAction {
    /// One-line description for listings.
    pub fn summary(&self) -> String {
        match self {
            AlarmAction::Display { text } => text.lines().next().unwrap_or_default().to_string(),
            AlarmAction::File { path } => format!("file: {path}"),
            AlarmAction::Command { command, script, .. } => {
                if *script {
                    "script".to_string()
                } else {
                    format!("command: {command}")
                }
            }
            AlarmAction::Email { to, subject, .. } => {
                format!("email to {}: {subject}", to.join(", "))
            }
            AlarmAction::Audio { file, .. } => format!("audio: {file}"),
        }
    }

    /// Display-like actions are presented in a window.
    pub fn is_display(&self) -> bool {
        matches!(self, AlarmAction::Display { .. } | AlarmAction::File { .. })
    }
}

/// Kind of a concrete trigger instance, in evaluation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubAlarmKind {
    Main,
    Reminder,
    DeferredReminder,
    Deferred,
    AtLogin,
}

impl SubAlarmKind {
    pub fn is_deferral(self) -> bool {
        matches!(self, SubAlarmKind::Deferred | SubAlarmKind::DeferredReminder)
    }

    pub fn is_reminder(self) -> bool {
        matches!(self, SubAlarmKind::Reminder | SubAlarmKind::DeferredReminder)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubAlarm {
    pub kind: SubAlarmKind,
    pub trigger: DateTime<Utc>,
}

/// Fixed-interval repeat after each main occurrence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubRepetition {
    pub interval_minutes: u32,
    /// Repeats after the base occurrence, not counting it.
    pub count: u32,
}

impl SubRepetition {
    pub fn span_minutes(&self) -> i64 {
        i64::from(self.interval_minutes) * i64::from(self.count)
    }
}

/// Command run before a display alarm is shown.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreAction {
    pub command: String,
    /// Abort the firing if the command fails.
    #[serde(default)]
    pub cancel_on_error: bool,
    /// Also run for deferred firings.
    #[serde(default)]
    pub execute_on_deferral: bool,
}

/// Position of an occurrence in its series.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OccurrenceType {
    FirstOrOnly,
    Recurrence,
    LastRecurrence,
}

/// A concrete occurrence, including sub-repetitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Occurrence {
    pub at: DateTime<Utc>,
    /// The recurrence occurrence this belongs to.
    pub base: DateTime<Utc>,
    pub base_index: u64,
    /// 0 for the base itself, else the sub-repetition number.
    pub repetition: u32,
    pub kind: OccurrenceType,
}

impl Occurrence {
    pub fn is_repetition(&self) -> bool {
        self.repetition > 0
    }
}

/// Result of advancing a definition's main trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextOccurrence {
    /// No occurrence after the cursor.
    None,
    /// The first occurrence of the series is still ahead.
    First(Occurrence),
    Later(Occurrence),
}

/// A stored alarm's full configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlarmDefinition {
    pub id: AlarmId,
    pub action: AlarmAction,
    /// First occurrence; for date-only alarms, the start of day on that date.
    pub start: DateTime<Utc>,
    #[serde(default)]
    pub date_only: bool,
    #[serde(default)]
    pub recurrence: Option<Recurrence>,
    #[serde(default)]
    pub repetition: Option<SubRepetition>,
    #[serde(default)]
    pub sub_alarms: Vec<SubAlarm>,
    /// 0 = never cancel.
    #[serde(default)]
    pub late_cancel_minutes: u32,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Positive: minutes before each occurrence. Negative: after it.
    #[serde(default)]
    pub reminder_minutes: i32,
    #[serde(default)]
    pub repeat_at_login: bool,
    #[serde(default)]
    pub work_time_only: bool,
    #[serde(default)]
    pub exclude_holidays: bool,
    /// Archive instead of deleting when the schedule is exhausted.
    #[serde(default)]
    pub archive: bool,
    #[serde(default)]
    pub last_triggered: Option<DateTime<Utc>>,
    /// Set once the trailing reminder after an at-login firing is placed.
    #[serde(default)]
    pub login_reminder_armed: bool,
    #[serde(default)]
    pub pre_action: Option<PreAction>,
    #[serde(default)]
    pub post_action: Option<String>,
    pub created_at: DateTime<Utc>,
}

fn default_true() -> bool {
    true
}

impl AlarmDefinition {
    pub fn sub_alarm(&self, kind: SubAlarmKind) -> Option<&SubAlarm> {
        self.sub_alarms.iter().find(|a| a.kind == kind)
    }

    /// Add or replace the sub-alarm of this kind.
    pub fn set_sub_alarm(&mut self, kind: SubAlarmKind, trigger: DateTime<Utc>) {
        match self.sub_alarms.iter_mut().find(|a| a.kind == kind) {
            Some(existing) => existing.trigger = trigger,
            None => self.sub_alarms.push(SubAlarm { kind, trigger }),
        }
    }

    pub fn remove_sub_alarm(&mut self, kind: SubAlarmKind) -> Option<SubAlarm> {
        let pos = self.sub_alarms.iter().position(|a| a.kind == kind)?;
        Some(self.sub_alarms.remove(pos))
    }

    /// Sub-alarms in evaluation order, main first.
    pub fn alarms_in_order(&self) -> Vec<SubAlarm> {
        let mut alarms = self.sub_alarms.clone();
        alarms.sort_by_key(|a| a.kind);
        alarms
    }

    /// Earliest scheduled trigger, ignoring the standing at-login trigger.
    pub fn next_trigger(&self) -> Option<DateTime<Utc>> {
        self.sub_alarms
            .iter()
            .filter(|a| a.kind != SubAlarmKind::AtLogin)
            .map(|a| a.trigger)
            .min()
    }

    pub fn recurs(&self) -> bool {
        self.recurrence.is_some() || self.repetition.is_some_and(|r| r.count > 0)
    }

    /// Whether working-time or holiday rules apply.
    pub fn is_restricted(&self) -> bool {
        self.work_time_only || self.exclude_holidays
    }

    /// First occurrence strictly after `after`, sub-repetitions included.
    pub fn next_occurrence(&self, after: DateTime<Utc>, zone: AlarmZone) -> Option<Occurrence> {
        let from_repetition = self.base_at_or_before(after, zone).and_then(|base| {
            let rep = self.repetition?;
            if rep.interval_minutes == 0 {
                return None;
            }
            let step = i64::from(rep.interval_minutes) * 60;
            let k = (after - base.at).num_seconds() / step + 1;
            if k > i64::from(rep.count) {
                return None;
            }
            Some(self.occurrence(base, k as u32, zone))
        });
        let from_base = self
            .base_after(after, zone)
            .map(|base| self.occurrence(base, 0, zone));
        match (from_repetition, from_base) {
            (Some(a), Some(b)) => Some(if a.at <= b.at { a } else { b }),
            (a, b) => a.or(b),
        }
    }

    /// Latest occurrence at or before `at`, sub-repetitions included.
    pub fn previous_occurrence(&self, at: DateTime<Utc>, zone: AlarmZone) -> Option<Occurrence> {
        let base = self.base_at_or_before(at, zone)?;
        let k = match self.repetition {
            Some(rep) if rep.interval_minutes > 0 => {
                let step = i64::from(rep.interval_minutes) * 60;
                ((at - base.at).num_seconds() / step).min(i64::from(rep.count))
            }
            _ => 0,
        };
        Some(self.occurrence(base, k as u32, zone))
    }

    /// Move the main trigger to the first occurrence after `after`.
    ///
    /// Pending reminders are dropped and a fresh positive reminder is placed
    /// if it would still be ahead of `now`. The definition is left alone when
    /// there is no further occurrence.
    pub fn set_next_occurrence(
        &mut self,
        after: DateTime<Utc>,
        now: DateTime<Utc>,
        zone: AlarmZone,
    ) -> NextOccurrence {
        let Some(occ) = self.next_occurrence(after, zone) else {
            return NextOccurrence::None;
        };
        self.set_sub_alarm(SubAlarmKind::Main, occ.at);
        self.remove_sub_alarm(SubAlarmKind::Reminder);
        self.remove_sub_alarm(SubAlarmKind::DeferredReminder);
        self.login_reminder_armed = false;
        if self.reminder_minutes > 0 && !occ.is_repetition() {
            let at = occ.at - Duration::minutes(i64::from(self.reminder_minutes));
            if at > now {
                self.set_sub_alarm(SubAlarmKind::Reminder, at);
            }
        }
        if occ.kind == OccurrenceType::FirstOrOnly && !occ.is_repetition() {
            NextOccurrence::First(occ)
        } else {
            NextOccurrence::Later(occ)
        }
    }

    /// Move date-only triggers to a new start-of-day time.
    pub fn apply_start_of_day(&mut self, start_of_day: NaiveTime, zone: AlarmZone) -> bool {
        if !self.date_only {
            return false;
        }
        let shift = |t: DateTime<Utc>| zone.to_utc(zone.to_local(t).date().and_time(start_of_day));
        let before = (self.start, self.sub_alarms.clone());
        self.start = shift(self.start);
        for alarm in &mut self.sub_alarms {
            if !alarm.kind.is_deferral() {
                alarm.trigger = shift(alarm.trigger);
            }
        }
        before != (self.start, self.sub_alarms.clone())
    }

    fn base_at_or_before(&self, at: DateTime<Utc>, zone: AlarmZone) -> Option<Hit> {
        match &self.recurrence {
            Some(rule) => rule.previous_at_or_before(self.start, at, zone),
            None if self.start <= at => Some(Hit {
                index: 0,
                at: self.start,
            }),
            None => None,
        }
    }

    fn base_after(&self, after: DateTime<Utc>, zone: AlarmZone) -> Option<Hit> {
        match &self.recurrence {
            Some(rule) => rule.next_after(self.start, after, zone),
            None if self.start > after => Some(Hit {
                index: 0,
                at: self.start,
            }),
            None => None,
        }
    }

    fn occurrence(&self, base: Hit, repetition: u32, zone: AlarmZone) -> Occurrence {
        let offset = self
            .repetition
            .map(|r| i64::from(r.interval_minutes) * i64::from(repetition))
            .unwrap_or(0);
        let is_last = match &self.recurrence {
            Some(rule) => rule
                .last(self.start, zone)
                .is_some_and(|last| last.index == base.index),
            None => true,
        };
        let kind = if base.index == 0 {
            OccurrenceType::FirstOrOnly
        } else if is_last {
            OccurrenceType::LastRecurrence
        } else {
            OccurrenceType::Recurrence
        };
        Occurrence {
            at: base.at + Duration::minutes(offset),
            base: base.at,
            base_index: base.index,
            repetition,
            kind,
        }
    }
}

/// Largest reminder offset either side of the alarm: one year.
pub const MAX_REMINDER_MINUTES: u32 = 366 * 24 * 60;

/// Defaults filled into a draft from the preferences.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DraftDefaults {
    pub late_cancel_minutes: u32,
    pub start_of_day: NaiveTime,
}

/// A new alarm as entered by a front end, before first scheduling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlarmDraft {
    pub action: AlarmAction,
    pub start: DateTime<Utc>,
    #[serde(default)]
    pub date_only: bool,
    #[serde(default)]
    pub recurrence: Option<Recurrence>,
    #[serde(default)]
    pub repetition: Option<SubRepetition>,
    /// `None` takes the configured default.
    #[serde(default)]
    pub late_cancel_minutes: Option<u32>,
    #[serde(default)]
    pub reminder_minutes: i32,
    #[serde(default)]
    pub repeat_at_login: bool,
    #[serde(default)]
    pub work_time_only: bool,
    #[serde(default)]
    pub exclude_holidays: bool,
    #[serde(default)]
    pub archive: bool,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub pre_action: Option<PreAction>,
    #[serde(default)]
    pub post_action: Option<String>,
}

impl AlarmDraft {
    pub fn new(action: AlarmAction, start: DateTime<Utc>) -> Self {
        Self {
            action,
            start,
            date_only: false,
            recurrence: None,
            repetition: None,
            late_cancel_minutes: None,
            reminder_minutes: 0,
            repeat_at_login: false,
            work_time_only: false,
            exclude_holidays: false,
            archive: false,
            enabled: true,
            pre_action: None,
            post_action: None,
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.reminder_minutes.unsigned_abs() > MAX_REMINDER_MINUTES {
            return Err(ValidationError::InvalidValue {
                field: "reminder_minutes".into(),
                message: format!("must be within {MAX_REMINDER_MINUTES} minutes of the alarm"),
            });
        }
        if let Some(rule) = &self.recurrence {
            rule.validate()?;
        }
        if let Some(rep) = &self.repetition {
            if rep.interval_minutes == 0 {
                return Err(ValidationError::ZeroInterval {
                    field: "repetition.interval_minutes".into(),
                });
            }
            if let Some(rule) = &self.recurrence {
                let period = rule.shortest_gap_minutes();
                if rep.span_minutes() >= period {
                    return Err(ValidationError::RepetitionTooLong {
                        span_minutes: rep.span_minutes(),
                        period_minutes: period,
                    });
                }
            }
        }
        match &self.action {
            AlarmAction::Command { command, .. } if command.trim().is_empty() => {
                Err(ValidationError::InvalidValue {
                    field: "command".into(),
                    message: "must not be empty".into(),
                })
            }
            AlarmAction::Email { to, .. } if to.is_empty() => Err(ValidationError::InvalidValue {
                field: "to".into(),
                message: "at least one recipient is required".into(),
            }),
            _ => Ok(()),
        }
    }

    /// Validate and build the stored definition with its first triggers.
    ///
    /// A recurring alarm whose start is already past begins at its next
    /// occurrence from `now`; a past one-shot alarm keeps its time and is
    /// dealt with by the late-cancel rules when evaluated.
    pub fn into_definition(
        self,
        now: DateTime<Utc>,
        zone: AlarmZone,
        defaults: &DraftDefaults,
    ) -> Result<AlarmDefinition, ValidationError> {
        self.validate()?;
        let start = if self.date_only {
            zone.to_utc(zone.to_local(self.start).date().and_time(defaults.start_of_day))
        } else {
            self.start
        };
        let mut def = AlarmDefinition {
            id: AlarmId::generate(),
            action: self.action,
            start,
            date_only: self.date_only,
            recurrence: self.recurrence,
            repetition: self.repetition,
            sub_alarms: Vec::new(),
            late_cancel_minutes: self
                .late_cancel_minutes
                .unwrap_or(defaults.late_cancel_minutes),
            enabled: self.enabled,
            reminder_minutes: self.reminder_minutes,
            repeat_at_login: self.repeat_at_login,
            work_time_only: self.work_time_only,
            exclude_holidays: self.exclude_holidays,
            archive: self.archive,
            last_triggered: None,
            login_reminder_armed: false,
            pre_action: self.pre_action,
            post_action: self.post_action,
            created_at: now,
        };
        let before_start = start - Duration::seconds(1);
        let cursor = match def.next_occurrence(before_start, zone) {
            Some(first) if def.recurs() && first.at < now => now - Duration::seconds(1),
            _ => before_start,
        };
        if def.set_next_occurrence(cursor, now, zone) == NextOccurrence::None {
            return Err(ValidationError::NoOccurrence(now));
        }
        if def.repeat_at_login {
            def.set_sub_alarm(SubAlarmKind::AtLogin, now);
        }
        Ok(def)
    }
}
