pub mod alarm;
pub mod config;
pub mod daemon;

use std::path::PathBuf;
use std::sync::Arc;

use chime_core::collaborators::{SendmailMailer, TerminalPresenter, TokioProcessRunner};
use chime_core::engine::{self, AlarmEngine, EngineContext};
use chime_core::{AlarmZone, Clock, Dispatcher, Event, Preferences, SqliteStore};
use chrono::{DateTime, Duration, Local, NaiveDate, NaiveDateTime, NaiveTime, Utc};

pub type CliResult<T = ()> = Result<T, Box<dyn std::error::Error>>;

/// Options shared by every command.
#[derive(Debug, Clone, Default)]
pub struct Globals {
    /// Alarm database; defaults to the data directory.
    pub db: Option<PathBuf>,
}

impl Globals {
    fn store(&self) -> CliResult<SqliteStore> {
        Ok(match &self.db {
            Some(path) => SqliteStore::new(path),
            None => SqliteStore::at_default_path()?,
        })
    }
}

/// Build an engine over the SQLite store with the terminal collaborators.
pub fn open_engine(
    globals: &Globals,
    clock: Arc<dyn Clock>,
    prefs: Preferences,
) -> CliResult<AlarmEngine> {
    let (handle, inbox) = engine::channel();
    let dispatcher = Dispatcher::new(
        Box::new(TerminalPresenter::new(handle.clone(), true)),
        Box::new(TokioProcessRunner::new(
            handle.clone(),
            prefs.alarms.terminal_command.clone(),
        )),
        Box::new(SendmailMailer::new(
            handle.clone(),
            prefs.mail.sendmail_path.clone(),
            prefs.mail.from_address.clone(),
        )),
    );
    let ctx = EngineContext {
        store: Box::new(globals.store()?),
        clock,
        dispatcher,
        prefs,
    };
    let mut engine = AlarmEngine::new(ctx, handle, inbox)?;
    engine.initialise()?;
    Ok(engine)
}

/// Drain what the command queued, then exit once nothing is outstanding.
pub async fn finish(engine: AlarmEngine) -> CliResult {
    engine.handle().request_quit();
    chime_core::runtime::run(engine, print_event).await?;
    Ok(())
}

pub fn format_time(t: DateTime<Utc>) -> String {
    t.with_timezone(&Local).format("%Y-%m-%d %H:%M").to_string()
}

/// Human-readable lines for one-shot commands.
pub fn print_event(event: &Event) {
    match event {
        Event::AlarmScheduled { id, next_trigger, .. } => match next_trigger {
            Some(t) => println!("scheduled {id} for {}", format_time(*t)),
            None => println!("scheduled {id}"),
        },
        Event::AlarmRescheduled { id, next_trigger: Some(t), .. } => {
            println!("{id} next at {}", format_time(*t));
        }
        Event::AlarmCancelled { id, archived, .. } => {
            if *archived {
                println!("cancelled {id} (archived)");
            } else {
                println!("cancelled {id}");
            }
        }
        Event::AlarmDeferred { id, until, .. } => {
            println!("deferred {id} until {}", format_time(*until));
        }
        Event::AlarmSuppressed { id, .. } => println!("{id} is disabled, not shown"),
        Event::ActionFailed { id, stage, message, .. } => {
            eprintln!("{stage} failed for {id}: {message}");
        }
        Event::StoreUnavailable { message, .. } => eprintln!("alarm store unavailable: {message}"),
        _ => {}
    }
}

/// Parse a point in time.
///
/// Accepts `+N` with an `m`, `h` or `d` suffix, RFC 3339, `YYYY-MM-DD HH:MM`
/// and `HH:MM` (the next such time, today or tomorrow).
pub fn parse_when(input: &str, now: DateTime<Utc>, zone: AlarmZone) -> Result<DateTime<Utc>, String> {
    let s = input.trim();
    if let Some(rest) = s.strip_prefix('+') {
        return parse_offset(rest).map(|d| now + d);
    }
    if let Ok(t) = DateTime::parse_from_rfc3339(s) {
        return Ok(t.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%d %H:%M", "%Y-%m-%dT%H:%M", "%Y-%m-%d %H:%M:%S"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
            return Ok(zone.to_utc(naive));
        }
    }
    if let Ok(time) = NaiveTime::parse_from_str(s, "%H:%M") {
        let today = zone.to_local(now).date();
        let candidate = zone.to_utc(today.and_time(time));
        if candidate > now {
            return Ok(candidate);
        }
        return Ok(zone.to_utc((today + Duration::days(1)).and_time(time)));
    }
    Err(format!("cannot parse time '{input}'"))
}

/// Parse a calendar date as its local midnight.
pub fn parse_date(input: &str, zone: AlarmZone) -> Result<DateTime<Utc>, String> {
    NaiveDate::parse_from_str(input.trim(), "%Y-%m-%d")
        .map(|d| zone.to_utc(d.and_time(NaiveTime::MIN)))
        .map_err(|e| format!("cannot parse date '{input}': {e}"))
}

fn parse_offset(s: &str) -> Result<Duration, String> {
    let (num, unit) = s.split_at(s.len().saturating_sub(1));
    let (num, unit) = match unit {
        "m" | "h" | "d" => (num, unit),
        _ => (s, "m"),
    };
    let n: i64 = num
        .parse()
        .map_err(|_| format!("cannot parse offset '+{s}'"))?;
    Ok(match unit {
        "h" => Duration::hours(n),
        "d" => Duration::days(n),
        _ => Duration::minutes(n),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 3, 10, 0, 0).unwrap()
    }

    #[test]
    fn relative_offsets() {
        let utc = AlarmZone::utc();
        assert_eq!(parse_when("+10m", now(), utc).unwrap(), now() + Duration::minutes(10));
        assert_eq!(parse_when("+2h", now(), utc).unwrap(), now() + Duration::hours(2));
        assert_eq!(parse_when("+1d", now(), utc).unwrap(), now() + Duration::days(1));
        assert_eq!(parse_when("+5", now(), utc).unwrap(), now() + Duration::minutes(5));
        assert!(parse_when("+x", now(), utc).is_err());
    }

    #[test]
    fn clock_time_rolls_over_to_tomorrow() {
        let utc = AlarmZone::utc();
        assert_eq!(
            parse_when("11:30", now(), utc).unwrap(),
            Utc.with_ymd_and_hms(2024, 1, 3, 11, 30, 0).unwrap()
        );
        assert_eq!(
            parse_when("09:00", now(), utc).unwrap(),
            Utc.with_ymd_and_hms(2024, 1, 4, 9, 0, 0).unwrap()
        );
    }

    #[test]
    fn absolute_forms() {
        let utc = AlarmZone::utc();
        let expected = Utc.with_ymd_and_hms(2024, 2, 1, 8, 15, 0).unwrap();
        assert_eq!(parse_when("2024-02-01 08:15", now(), utc).unwrap(), expected);
        assert_eq!(parse_when("2024-02-01T08:15:00Z", now(), utc).unwrap(), expected);
        assert_eq!(
            parse_date("2024-02-01", utc).unwrap(),
            Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap()
        );
        assert!(parse_when("tomorrow-ish", now(), utc).is_err());
    }
}
