use std::sync::Arc;

use clap::{Args, ValueEnum};
use chime_core::alarm::{PreAction, RecurrenceEnd, SubRepetition};
use chime_core::{
    AlarmAction, AlarmDraft, AlarmZone, Clock, Preferences, QueueMode, Recurrence, SystemClock,
};
use chrono::{DateTime, Datelike, Utc};

use super::{finish, format_time, open_engine, parse_date, parse_when, CliResult, Globals};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Repeat {
    Minutely,
    Daily,
    Weekly,
    Monthly,
    Yearly,
}

#[derive(Debug, Args)]
pub struct AddArgs {
    /// Message text to display
    pub message: Option<String>,
    /// Display the contents of a file instead of a message
    #[arg(long, conflicts_with_all = ["command", "email", "audio"])]
    pub file: Option<String>,
    /// Run a shell command
    #[arg(long, conflicts_with_all = ["email", "audio"])]
    pub command: Option<String>,
    /// Treat --command as a script body
    #[arg(long, requires = "command")]
    pub script: bool,
    /// Run the command in a terminal window
    #[arg(long, requires = "command")]
    pub terminal: bool,
    /// Send an email to this address (repeatable)
    #[arg(long, conflicts_with = "audio")]
    pub email: Vec<String>,
    #[arg(long, requires = "email")]
    pub subject: Option<String>,
    /// Blind-copy the sender
    #[arg(long, requires = "email")]
    pub bcc: bool,
    /// Play a sound file
    #[arg(long)]
    pub audio: Option<String>,
    /// Volume between 0 and 1
    #[arg(long, requires = "audio")]
    pub volume: Option<f32>,

    /// When: +10m, HH:MM, "YYYY-MM-DD HH:MM" or RFC 3339
    #[arg(long, conflicts_with = "date")]
    pub at: Option<String>,
    /// Date-only alarm (YYYY-MM-DD), due at the configured start of day
    #[arg(long)]
    pub date: Option<String>,

    #[arg(long, value_enum)]
    pub repeat: Option<Repeat>,
    #[arg(long, default_value_t = 1)]
    pub interval: u32,
    /// Weekdays for weekly repeats, e.g. mon,wed,fri
    #[arg(long, value_delimiter = ',')]
    pub days: Vec<String>,
    /// Stop after this many occurrences
    #[arg(long, conflicts_with = "until")]
    pub count: Option<u32>,
    /// Stop after this time
    #[arg(long)]
    pub until: Option<String>,

    /// Repeat each occurrence every N minutes
    #[arg(long, requires = "times")]
    pub every: Option<u32>,
    /// Number of extra repeats per occurrence
    #[arg(long, requires = "every")]
    pub times: Option<u32>,

    /// Reminder minutes before (positive) or after (negative) the alarm
    #[arg(long, allow_hyphen_values = true)]
    pub reminder: Option<i32>,
    /// Cancel if missed by more than this many minutes
    #[arg(long)]
    pub late_cancel: Option<u32>,
    /// Also fire at every login
    #[arg(long)]
    pub at_login: bool,
    /// Only fire during working hours
    #[arg(long)]
    pub work_time: bool,
    /// Skip configured holidays
    #[arg(long)]
    pub no_holidays: bool,
    /// Keep the alarm in the archive once it is finished
    #[arg(long)]
    pub archive: bool,
    /// Store the alarm disabled
    #[arg(long)]
    pub disabled: bool,

    /// Command to run before the alarm is shown
    #[arg(long)]
    pub pre_action: Option<String>,
    /// Don't show the alarm if the pre-action fails
    #[arg(long, requires = "pre_action")]
    pub cancel_on_error: bool,
    /// Command to run after the alarm is acknowledged
    #[arg(long)]
    pub post_action: Option<String>,
}

fn weekday_bit(name: &str) -> Result<u8, String> {
    let bit = match name.trim().to_ascii_lowercase().get(..3) {
        Some("mon") => 0,
        Some("tue") => 1,
        Some("wed") => 2,
        Some("thu") => 3,
        Some("fri") => 4,
        Some("sat") => 5,
        Some("sun") => 6,
        _ => return Err(format!("unknown weekday '{name}'")),
    };
    Ok(1 << bit)
}

impl AddArgs {
    fn action(&self) -> Result<AlarmAction, String> {
        if let Some(path) = &self.file {
            return Ok(AlarmAction::File { path: path.clone() });
        }
        if let Some(command) = &self.command {
            return Ok(AlarmAction::Command {
                command: command.clone(),
                script: self.script,
                in_terminal: self.terminal,
            });
        }
        if !self.email.is_empty() {
            return Ok(AlarmAction::Email {
                to: self.email.clone(),
                subject: self.subject.clone().unwrap_or_default(),
                body: self.message.clone().unwrap_or_default(),
                bcc: self.bcc,
            });
        }
        if let Some(file) = &self.audio {
            return Ok(AlarmAction::Audio {
                file: file.clone(),
                volume: self.volume,
            });
        }
        match &self.message {
            Some(text) => Ok(AlarmAction::Display { text: text.clone() }),
            None => Err("nothing to do: give a message, --file, --command, --email or --audio".into()),
        }
    }

    fn recurrence(&self, start: DateTime<Utc>, now: DateTime<Utc>, zone: AlarmZone) -> Result<Option<Recurrence>, String> {
        let Some(repeat) = self.repeat else {
            return Ok(None);
        };
        let rule = match repeat {
            Repeat::Minutely => Recurrence::minutely(self.interval),
            Repeat::Daily => Recurrence::daily(self.interval),
            Repeat::Weekly => {
                let days = if self.days.is_empty() {
                    1 << zone.to_local(start).weekday().num_days_from_monday()
                } else {
                    self.days
                        .iter()
                        .map(|d| weekday_bit(d))
                        .collect::<Result<Vec<_>, _>>()?
                        .into_iter()
                        .fold(0, |acc, bit| acc | bit)
                };
                Recurrence::weekly(days, self.interval)
            }
            Repeat::Monthly => Recurrence::monthly(zone.to_local(start).day(), self.interval),
            Repeat::Yearly => Recurrence::yearly(self.interval),
        };
        let end = match (self.count, &self.until) {
            (Some(count), _) => RecurrenceEnd::Count { count },
            (None, Some(until)) => RecurrenceEnd::Until {
                until: parse_when(until, now, zone)?,
            },
            (None, None) => RecurrenceEnd::Never,
        };
        Ok(Some(rule.with_end(end)))
    }

    /// Turn the arguments into a draft, relative to `now`.
    pub fn draft(&self, now: DateTime<Utc>, zone: AlarmZone) -> Result<AlarmDraft, String> {
        let (start, date_only) = match (&self.at, &self.date) {
            (Some(at), _) => (parse_when(at, now, zone)?, false),
            (None, Some(date)) => (parse_date(date, zone)?, true),
            (None, None) => return Err("give --at or --date".into()),
        };
        let mut draft = AlarmDraft::new(self.action()?, start);
        draft.date_only = date_only;
        draft.recurrence = self.recurrence(start, now, zone)?;
        draft.repetition = match (self.every, self.times) {
            (Some(interval_minutes), Some(count)) => Some(SubRepetition {
                interval_minutes,
                count,
            }),
            _ => None,
        };
        draft.late_cancel_minutes = self.late_cancel;
        draft.reminder_minutes = self.reminder.unwrap_or(0);
        draft.repeat_at_login = self.at_login;
        draft.work_time_only = self.work_time;
        draft.exclude_holidays = self.no_holidays;
        draft.archive = self.archive;
        draft.enabled = !self.disabled;
        draft.pre_action = self.pre_action.as_ref().map(|command| PreAction {
            command: command.clone(),
            cancel_on_error: self.cancel_on_error,
            execute_on_deferral: false,
        });
        draft.post_action = self.post_action.clone();
        Ok(draft)
    }
}

fn system_clock() -> Arc<dyn Clock> {
    Arc::new(SystemClock)
}

pub async fn add(globals: &Globals, args: AddArgs) -> CliResult {
    let clock = system_clock();
    let draft = args.draft(clock.now(), clock.zone())?;
    let mut engine = open_engine(globals, clock, Preferences::load_or_default())?;
    engine.skip_login_alarms();
    engine.schedule_new(draft)?;
    finish(engine).await
}

pub async fn list(globals: &Globals, json: bool) -> CliResult {
    let engine = open_engine(globals, system_clock(), Preferences::load_or_default())?;
    let alarms = engine.list_scheduled()?;
    if json {
        println!("{}", serde_json::to_string_pretty(&alarms)?);
        return Ok(());
    }
    if alarms.is_empty() {
        println!("no alarms scheduled");
        return Ok(());
    }
    for alarm in alarms {
        let when = alarm
            .next_trigger
            .map(format_time)
            .unwrap_or_else(|| "-".to_string());
        let mut flags = String::new();
        if alarm.recurring {
            flags.push('R');
        }
        if !alarm.enabled {
            flags.push('D');
        }
        println!(
            "{:<8}  {:<16}  {:<2}  {}",
            alarm.id.as_str().get(..8).unwrap_or(alarm.id.as_str()),
            when,
            flags,
            alarm.summary
        );
    }
    Ok(())
}

/// Queue `mode` for the alarm matching `id` and process it.
pub async fn handle(globals: &Globals, id: &str, mode: QueueMode) -> CliResult {
    let mut engine = open_engine(globals, system_clock(), Preferences::load_or_default())?;
    engine.skip_login_alarms();
    let id = engine.resolve_id(id)?;
    if !engine.handle_by_id(&id, mode) {
        return Err(format!("alarm {id} could not be queued").into());
    }
    finish(engine).await
}

pub async fn defer(globals: &Globals, id: &str, until: &str, reminder: bool) -> CliResult {
    let clock = system_clock();
    let until = parse_when(until, clock.now(), clock.zone())?;
    let mut engine = open_engine(globals, clock, Preferences::load_or_default())?;
    engine.skip_login_alarms();
    let id = engine.resolve_id(id)?;
    engine.defer(&id, until, reminder);
    finish(engine).await
}
