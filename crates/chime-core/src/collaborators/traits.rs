use std::collections::HashSet;

use chrono::{DateTime, Utc};

use crate::alarm::{AlarmDefinition, AlarmId, SubAlarm};
use crate::dispatch::DispatchHandle;
use crate::error::StoreError;

/// Error type returned by external collaborators.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Persistent home of all alarm definitions.
///
/// Only the queue processor writes to the store. Definitions handed out are
/// copies; callers re-read after any mutation instead of holding on to them.
pub trait AlarmStore: Send {
    fn open(&mut self) -> Result<(), StoreError>;

    fn close(&mut self);

    /// Drop any cached state and re-read the backing storage.
    fn reload(&mut self) -> Result<(), StoreError> {
        self.close();
        self.open()
    }

    fn event(&self, id: &AlarmId) -> Result<Option<AlarmDefinition>, StoreError>;

    /// Ids of active definitions starting with `prefix`.
    fn find_by_prefix(&self, prefix: &str) -> Result<Vec<AlarmId>, StoreError>;

    /// Active definition with the earliest pending trigger, skipping `exclude`.
    fn earliest_alarm(
        &self,
        exclude: &HashSet<AlarmId>,
    ) -> Result<Option<AlarmDefinition>, StoreError>;

    /// Insert or replace a definition.
    fn update_event(&mut self, def: &AlarmDefinition) -> Result<(), StoreError>;

    /// Remove a definition, or keep it read-only when `archive` is set.
    fn delete_event(
        &mut self,
        id: &AlarmId,
        archive: bool,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    fn at_login_alarms(&self) -> Result<Vec<AlarmDefinition>, StoreError>;

    /// All non-archived definitions, earliest trigger first.
    fn active_events(&self) -> Result<Vec<AlarmDefinition>, StoreError>;

    /// Delete archived definitions archived before `before`.
    fn purge_archived(&mut self, before: DateTime<Utc>) -> Result<usize, StoreError>;
}

/// What an open alarm window is currently showing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WindowState {
    pub showing_reminder: bool,
    pub audio_only: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DisplayFlags {
    pub reminder: bool,
    pub deferred: bool,
    /// No visible window; play the sound only.
    pub audio_only: bool,
    /// Shown on explicit request rather than because it was due.
    pub forced: bool,
}

/// Alarm message windows.
pub trait Presenter: Send {
    fn find_by_definition_id(&self, id: &AlarmId) -> Option<WindowState>;

    fn open(
        &mut self,
        def: &AlarmDefinition,
        alarm: &SubAlarm,
        flags: DisplayFlags,
    ) -> Result<(), BoxError>;

    /// Replay the sound and bring the existing window forward.
    fn repeat(&mut self, def: &AlarmDefinition, alarm: &SubAlarm) -> Result<(), BoxError>;

    /// Turn a window showing a reminder into the real alarm message.
    fn cancel_reminder(&mut self, def: &AlarmDefinition, alarm: &SubAlarm)
        -> Result<(), BoxError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandLine {
    /// Passed to the shell.
    Shell(String),
    /// Written to an executable temporary file and run.
    Script(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandRequest {
    pub handle: DispatchHandle,
    pub alarm_id: AlarmId,
    pub command: CommandLine,
    pub env: Vec<(String, String)>,
    pub in_terminal: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ProcessStatus {
    pub success: bool,
    pub code: Option<i32>,
    pub output: String,
}

/// Runs commands without blocking; completion is reported back through the
/// engine handle with the request's [`DispatchHandle`].
pub trait ProcessRunner: Send {
    fn run(&mut self, request: CommandRequest) -> Result<(), BoxError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmailJob {
    pub handle: DispatchHandle,
    pub alarm_id: AlarmId,
    pub to: Vec<String>,
    pub subject: String,
    pub body: String,
    /// Blind-copy the sender.
    pub bcc: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MailOutcome {
    Sent,
    /// Accepted for delivery; completion arrives through the engine handle.
    Queued,
}

pub trait MailSender: Send {
    fn send(&mut self, job: EmailJob) -> Result<MailOutcome, BoxError>;
}
