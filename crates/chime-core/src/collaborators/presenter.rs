//! Terminal presentation of alarm messages.

use std::collections::HashMap;
use std::io::Write;

use tracing::{debug, info};

use super::traits::{BoxError, DisplayFlags, Presenter, WindowState};
use crate::alarm::{AlarmAction, AlarmDefinition, AlarmId, SubAlarm, SubAlarmKind};
use crate::engine::EngineHandle;

/// Text shown for one firing.
pub fn render(def: &AlarmDefinition, alarm: &SubAlarm, flags: DisplayFlags) -> String {
    let mut label = match alarm.kind {
        SubAlarmKind::Reminder | SubAlarmKind::DeferredReminder => "Reminder",
        SubAlarmKind::Deferred => "Deferred alarm",
        SubAlarmKind::AtLogin => "Login alarm",
        SubAlarmKind::Main => "Alarm",
    }
    .to_string();
    if flags.forced {
        label.push_str(" (manual)");
    }
    let when = alarm.trigger.with_timezone(&chrono::Local).format("%Y-%m-%d %H:%M");

    let body = match &def.action {
        AlarmAction::Display { text } => text.clone(),
        AlarmAction::File { path } => std::fs::read_to_string(path)
            .unwrap_or_else(|e| format!("[cannot read {path}: {e}]")),
        AlarmAction::Audio { file, volume } => match volume {
            Some(v) => format!("playing {file} at {:.0}%", v * 100.0),
            None => format!("playing {file}"),
        },
        other => other.summary(),
    };
    format!("[{label} {when} {}]\n{body}\n", short_id(&def.id))
}

fn short_id(id: &AlarmId) -> &str {
    let s = id.as_str();
    s.get(..8).unwrap_or(s)
}

/// Prints alarm messages to a writer. With `auto_close` a window is
/// acknowledged as soon as it is printed, as a headless daemon has nobody to
/// close it.
pub struct TerminalPresenter {
    engine: EngineHandle,
    auto_close: bool,
    out: Box<dyn Write + Send>,
    windows: HashMap<AlarmId, WindowState>,
}

impl TerminalPresenter {
    pub fn new(engine: EngineHandle, auto_close: bool) -> Self {
        Self::with_writer(engine, auto_close, Box::new(std::io::stdout()))
    }

    pub fn with_writer(engine: EngineHandle, auto_close: bool, out: Box<dyn Write + Send>) -> Self {
        Self {
            engine,
            auto_close,
            out,
            windows: HashMap::new(),
        }
    }

    fn print(&mut self, text: &str) -> Result<(), BoxError> {
        self.out.write_all(text.as_bytes())?;
        self.out.flush()?;
        Ok(())
    }

    fn settle(&mut self, id: &AlarmId) {
        if self.auto_close {
            self.windows.remove(id);
            self.engine.window_closed(id.clone());
        }
    }

    /// Close the window for `id`, as a user acknowledging it would.
    pub fn close(&mut self, id: &AlarmId) -> bool {
        if self.windows.remove(id).is_some() {
            self.engine.window_closed(id.clone());
            true
        } else {
            false
        }
    }
}

impl Presenter for TerminalPresenter {
    fn find_by_definition_id(&self, id: &AlarmId) -> Option<WindowState> {
        self.windows.get(id).copied()
    }

    fn open(
        &mut self,
        def: &AlarmDefinition,
        alarm: &SubAlarm,
        flags: DisplayFlags,
    ) -> Result<(), BoxError> {
        info!(alarm_id = %def.id, kind = ?alarm.kind, "showing alarm");
        self.windows.insert(
            def.id.clone(),
            WindowState {
                showing_reminder: flags.reminder,
                audio_only: flags.audio_only,
            },
        );
        self.print(&render(def, alarm, flags))?;
        self.settle(&def.id);
        Ok(())
    }

    fn repeat(&mut self, def: &AlarmDefinition, alarm: &SubAlarm) -> Result<(), BoxError> {
        debug!(alarm_id = %def.id, "repeating alarm");
        self.print(&format!("\x07[again] {}\n", def.action.summary()))?;
        if let Some(window) = self.windows.get_mut(&def.id) {
            window.showing_reminder = alarm.kind.is_reminder();
        }
        Ok(())
    }

    fn cancel_reminder(
        &mut self,
        def: &AlarmDefinition,
        alarm: &SubAlarm,
    ) -> Result<(), BoxError> {
        if let Some(window) = self.windows.get_mut(&def.id) {
            window.showing_reminder = false;
        }
        self.print(&render(def, alarm, DisplayFlags::default()))
    }
}
