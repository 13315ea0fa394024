use clap::Subcommand;
use chime_core::Preferences;

use super::CliResult;

#[derive(Subcommand)]
pub enum ConfigAction {
    /// Get a config value
    Get {
        /// Config key (e.g. "work_time.start", "alarms.enabled")
        key: String,
    },
    /// Set a config value
    Set {
        /// Config key
        key: String,
        /// New value
        value: String,
    },
    /// List all config values
    List,
    /// Reset config to defaults
    Reset,
    /// Print the config file location
    Path,
}

pub fn run(action: ConfigAction) -> CliResult {
    match action {
        ConfigAction::Get { key } => {
            let prefs = Preferences::load()?;
            match prefs.get(&key) {
                Some(value) => println!("{value}"),
                None => return Err(format!("unknown key: {key}").into()),
            }
        }
        ConfigAction::Set { key, value } => {
            let mut prefs = Preferences::load()?;
            prefs.set(&key, &value)?;
            prefs.save()?;
            println!("ok");
        }
        ConfigAction::List => {
            let prefs = Preferences::load()?;
            println!("{}", serde_json::to_string_pretty(&prefs)?);
        }
        ConfigAction::Reset => {
            Preferences::default().save()?;
            println!("config reset to defaults");
        }
        ConfigAction::Path => {
            println!("{}", Preferences::path()?.display());
        }
    }
    Ok(())
}

/// `chime enable` / `chime disable`: flip the global switch. A running
/// daemon picks the change up from the config file.
pub fn set_enabled(enabled: bool) -> CliResult {
    let mut prefs = Preferences::load()?;
    prefs.alarms.enabled = enabled;
    prefs.save()?;
    println!("alarms {}", if enabled { "enabled" } else { "disabled" });
    Ok(())
}
