use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Args;
use chime_core::engine::EngineHandle;
use chime_core::{runtime, AlarmZone, Clock, Preferences, SimulatedClock, SystemClock};
use chrono::Utc;
use tracing::{debug, info, warn};

use super::{open_engine, parse_when, CliResult, Globals};

const ARCHIVE_PURGE_INTERVAL: Duration = Duration::from_secs(60 * 60);
const PREFERENCES_POLL_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Args)]
pub struct DaemonArgs {
    /// Run on a simulated clock starting at this time; it then advances in
    /// real time
    #[arg(long)]
    pub simulate_from: Option<String>,
    /// Print every engine event to stdout as a JSON line
    #[arg(long)]
    pub json_events: bool,
}

pub async fn run(globals: &Globals, args: DaemonArgs) -> CliResult {
    let prefs = Preferences::load_or_default();
    let clock: Arc<dyn Clock> = match &args.simulate_from {
        Some(start) => {
            let start = parse_when(start, Utc::now(), AlarmZone::Local)?;
            let sim = SimulatedClock::with_zone(start, AlarmZone::Local);
            info!(%start, "running on simulated clock");
            spawn_simulation_tick(sim.clone());
            Arc::new(sim)
        }
        None => Arc::new(SystemClock),
    };

    let engine = open_engine(globals, clock, prefs.clone())?;
    let handle = engine.handle();
    spawn_interrupt(handle.clone());
    spawn_archive_purge(handle.clone());
    spawn_preferences_watch(handle, prefs);

    info!("chime daemon started");
    let json = args.json_events;
    runtime::run(engine, |event| {
        if json {
            match serde_json::to_string(event) {
                Ok(line) => println!("{line}"),
                Err(e) => warn!(error = %e, "failed to serialize event"),
            }
        }
    })
    .await?;
    info!("chime daemon stopped");
    Ok(())
}

/// Keep the simulated clock moving with real elapsed time.
fn spawn_simulation_tick(clock: SimulatedClock) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        let mut last = Instant::now();
        loop {
            ticker.tick().await;
            let now = Instant::now();
            let elapsed = chrono::Duration::from_std(now - last).unwrap_or_else(|_| chrono::Duration::zero());
            clock.advance(elapsed);
            last = now;
        }
    });
}

fn spawn_interrupt(handle: EngineHandle) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, stopping once outstanding actions finish");
            handle.request_quit();
        }
    });
}

fn spawn_archive_purge(handle: EngineHandle) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(ARCHIVE_PURGE_INTERVAL);
        loop {
            ticker.tick().await;
            if !handle.request_archive_purge() {
                break;
            }
        }
    });
}

/// Forward edits of the config file (`chime config set`, `chime disable`).
fn spawn_preferences_watch(handle: EngineHandle, mut current: Preferences) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(PREFERENCES_POLL_INTERVAL);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let loaded = match Preferences::load() {
                Ok(prefs) => prefs,
                Err(e) => {
                    debug!(error = %e, "config not reloaded");
                    continue;
                }
            };
            if loaded != current {
                info!("preferences changed");
                if !handle.preferences_changed(loaded.clone()) {
                    break;
                }
                current = loaded;
            }
        }
    });
}
