use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::alarm::{AlarmId, SubAlarmKind};
use crate::error::ActionStage;

/// Every decision the engine takes produces an Event.
/// Front ends drain them to show status; nothing in the engine depends on
/// them being consumed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Event {
    AlarmScheduled {
        id: AlarmId,
        next_trigger: Option<DateTime<Utc>>,
        at: DateTime<Utc>,
    },
    AlarmFired {
        id: AlarmId,
        kind: SubAlarmKind,
        forced: bool,
        at: DateTime<Utc>,
    },
    /// Due, but alarms are disabled globally or for this definition.
    AlarmSuppressed {
        id: AlarmId,
        kind: SubAlarmKind,
        at: DateTime<Utc>,
    },
    AlarmRescheduled {
        id: AlarmId,
        next_trigger: Option<DateTime<Utc>>,
        at: DateTime<Utc>,
    },
    /// Removed because its schedule is exhausted or it was cancelled.
    AlarmCancelled {
        id: AlarmId,
        archived: bool,
        at: DateTime<Utc>,
    },
    AlarmDeferred {
        id: AlarmId,
        until: DateTime<Utc>,
        at: DateTime<Utc>,
    },
    ActionFailed {
        id: AlarmId,
        stage: ActionStage,
        message: String,
        at: DateTime<Utc>,
    },
    /// The alarm store could not be read or written.
    StoreUnavailable {
        message: String,
        at: DateTime<Utc>,
    },
    ArchivePurged {
        count: usize,
        at: DateTime<Utc>,
    },
}
