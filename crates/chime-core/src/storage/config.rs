//! TOML-based preferences.
//!
//! Stores:
//! - Working hours and working days
//! - Holiday dates
//! - Alarm defaults (late-cancel, start of day, archive purge)
//! - Command and mail settings
//!
//! Preferences are stored at `~/.config/chime/config.toml`. A running engine
//! only sees changes when they are pushed to it.

use chrono::{NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use super::data_dir;
use crate::alarm::{DraftDefaults, WorkTimeRules, WorkingHours, DEFAULT_WORK_DAYS};
use crate::error::ConfigError;

/// Working-time configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkTimeConfig {
    /// Monday = bit 0 ... Sunday = bit 6.
    #[serde(default = "default_work_days")]
    pub days: u8,
    #[serde(default = "default_work_start")]
    pub start: String,
    #[serde(default = "default_work_end")]
    pub end: String,
}

/// Holiday configuration.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct HolidaysConfig {
    /// Informational region name; only `dates` are used for matching.
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub dates: Vec<NaiveDate>,
}

/// Alarm defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlarmsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Applied to new alarms that don't set their own limit. 0 = never.
    #[serde(default)]
    pub default_late_cancel_minutes: u32,
    /// Trigger time of date-only alarms.
    #[serde(default = "default_start_of_day")]
    pub start_of_day: String,
    /// Days to keep archived alarms. 0 = forever.
    #[serde(default)]
    pub archive_purge_days: u32,
    /// `%c` is replaced by the command; otherwise it is appended.
    #[serde(default = "default_terminal_command")]
    pub terminal_command: String,
    #[serde(default)]
    pub execute_pre_action_on_deferral: bool,
}

/// Mail configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailConfig {
    #[serde(default = "default_sendmail_path")]
    pub sendmail_path: String,
    #[serde(default)]
    pub from_address: String,
}

/// User preferences.
///
/// Serialized to/from TOML at `~/.config/chime/config.toml`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Preferences {
    #[serde(default)]
    pub work_time: WorkTimeConfig,
    #[serde(default)]
    pub holidays: HolidaysConfig,
    #[serde(default)]
    pub alarms: AlarmsConfig,
    #[serde(default)]
    pub mail: MailConfig,
}

// Default functions
fn default_work_days() -> u8 {
    DEFAULT_WORK_DAYS
}
fn default_work_start() -> String {
    "09:00".into()
}
fn default_work_end() -> String {
    "17:00".into()
}
fn default_true() -> bool {
    true
}
fn default_start_of_day() -> String {
    "00:00".into()
}
fn default_terminal_command() -> String {
    "xterm -hold -e %c".into()
}
fn default_sendmail_path() -> String {
    "/usr/sbin/sendmail".into()
}

impl Default for WorkTimeConfig {
    fn default() -> Self {
        Self {
            days: default_work_days(),
            start: default_work_start(),
            end: default_work_end(),
        }
    }
}

impl Default for AlarmsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            default_late_cancel_minutes: 0,
            start_of_day: default_start_of_day(),
            archive_purge_days: 0,
            terminal_command: default_terminal_command(),
            execute_pre_action_on_deferral: false,
        }
    }
}

impl Default for MailConfig {
    fn default() -> Self {
        Self {
            sendmail_path: default_sendmail_path(),
            from_address: String::new(),
        }
    }
}

fn parse_time(key: &str, value: &str) -> Result<NaiveTime, ConfigError> {
    NaiveTime::parse_from_str(value, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(value, "%H:%M:%S"))
        .map_err(|e| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("'{value}' is not a time of day: {e}"),
        })
}

impl Preferences {
    fn get_json_value_by_path<'a>(
        root: &'a serde_json::Value,
        key: &str,
    ) -> Option<&'a serde_json::Value> {
        if key.is_empty() {
            return None;
        }

        let mut current = root;
        for part in key.split('.') {
            current = current.get(part)?;
        }
        Some(current)
    }

    fn set_json_value_by_path(
        root: &mut serde_json::Value,
        key: &str,
        value: &str,
    ) -> Result<(), ConfigError> {
        let unknown = || ConfigError::UnknownKey(key.to_string());
        let invalid = |message: String| ConfigError::InvalidValue {
            key: key.to_string(),
            message,
        };

        let mut parts = key.split('.').peekable();
        if parts.peek().is_none() {
            return Err(unknown());
        }

        let mut current = root;
        while let Some(part) = parts.next() {
            let is_leaf = parts.peek().is_none();
            if is_leaf {
                let obj = current.as_object_mut().ok_or_else(unknown)?;
                let existing = obj.get(part).ok_or_else(unknown)?;

                let new_value = match existing {
                    serde_json::Value::Bool(_) => serde_json::Value::Bool(
                        value.parse::<bool>().map_err(|e| invalid(e.to_string()))?,
                    ),
                    serde_json::Value::Number(_) => {
                        let n = value
                            .parse::<u64>()
                            .map_err(|_| invalid(format!("cannot parse '{value}' as number")))?;
                        serde_json::Value::Number(n.into())
                    }
                    serde_json::Value::Object(_) | serde_json::Value::Array(_) => {
                        serde_json::from_str(value).map_err(|e| invalid(e.to_string()))?
                    }
                    _ => serde_json::Value::String(value.into()),
                };

                obj.insert(part.to_string(), new_value);
                return Ok(());
            }

            current = current.get_mut(part).ok_or_else(unknown)?;
        }

        Err(unknown())
    }

    /// Default location of the preferences file.
    pub fn path() -> Result<PathBuf, ConfigError> {
        Ok(data_dir()?.join("config.toml"))
    }

    /// Load from the default location, writing defaults if it doesn't exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be parsed, or if the
    /// defaults cannot be written.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&Self::path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        match std::fs::read_to_string(path) {
            Ok(content) => toml::from_str(&content).map_err(|e| ConfigError::LoadFailed {
                path: path.to_path_buf(),
                message: e.to_string(),
            }),
            Err(_) => {
                let prefs = Self::default();
                prefs.save_to(path)?;
                Ok(prefs)
            }
        }
    }

    /// Persist to the default location.
    pub fn save(&self) -> Result<(), ConfigError> {
        self.save_to(&Self::path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        let failed = |message: String| ConfigError::SaveFailed {
            path: path.to_path_buf(),
            message,
        };
        let content = toml::to_string_pretty(self).map_err(|e| failed(e.to_string()))?;
        std::fs::write(path, content).map_err(|e| failed(e.to_string()))
    }

    /// Load from disk, returning defaults on error.
    pub fn load_or_default() -> Self {
        Self::load().unwrap_or_default()
    }

    /// Get a value as string by dot-separated key.
    pub fn get(&self, key: &str) -> Option<String> {
        let json = serde_json::to_value(self).ok()?;
        let val = Self::get_json_value_by_path(&json, key)?;
        match val {
            serde_json::Value::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        }
    }

    /// Set a value by dot-separated key. The result is validated; nothing is
    /// written to disk.
    ///
    /// # Errors
    ///
    /// Returns an error if the key is unknown or the value doesn't fit it.
    pub fn set(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        let mut json = serde_json::to_value(&*self).map_err(|e| ConfigError::InvalidValue {
            key: key.to_string(),
            message: e.to_string(),
        })?;
        Self::set_json_value_by_path(&mut json, key, value)?;
        let updated: Preferences =
            serde_json::from_value(json).map_err(|e| ConfigError::InvalidValue {
                key: key.to_string(),
                message: e.to_string(),
            })?;
        updated.validate()?;
        *self = updated;
        Ok(())
    }

    /// Check that time-of-day strings parse.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.work_rules()?;
        self.start_of_day()?;
        Ok(())
    }

    pub fn start_of_day(&self) -> Result<NaiveTime, ConfigError> {
        parse_time("alarms.start_of_day", &self.alarms.start_of_day)
    }

    /// Working-time rules as used by the evaluator.
    pub fn work_rules(&self) -> Result<WorkTimeRules, ConfigError> {
        let hours = WorkingHours {
            days: self.work_time.days & 0x7f,
            start: parse_time("work_time.start", &self.work_time.start)?,
            end: parse_time("work_time.end", &self.work_time.end)?,
        };
        Ok(WorkTimeRules::new(hours, self.holidays.dates.iter().copied()))
    }

    pub fn draft_defaults(&self) -> Result<DraftDefaults, ConfigError> {
        Ok(DraftDefaults {
            late_cancel_minutes: self.alarms.default_late_cancel_minutes,
            start_of_day: self.start_of_day()?,
        })
    }
}
