//! Alarm model: definitions, sub-alarms, recurrence and working-time rules.

pub mod definition;
pub mod recurrence;
pub mod working_time;

pub use definition::{
    AlarmAction, AlarmDefinition, AlarmDraft, AlarmId, DraftDefaults, NextOccurrence, Occurrence,
    OccurrenceType, PreAction, SubAlarm, SubAlarmKind, SubRepetition,
};
pub use recurrence::{Frequency, Hit, Recurrence, RecurrenceEnd};
pub use working_time::{WorkTimeRules, WorkingHours, DEFAULT_WORK_DAYS};
