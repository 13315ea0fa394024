use std::path::PathBuf;

use chime_core::QueueMode;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod commands;

use commands::Globals;

#[derive(Parser)]
#[command(name = "chime", version, about = "Alarm scheduler")]
struct Cli {
    /// Alarm database file (default: ~/.config/chime/alarms.db)
    #[arg(long, global = true, env = "CHIME_DB")]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the alarm daemon
    Daemon(commands::daemon::DaemonArgs),
    /// Schedule a new alarm
    Add(commands::alarm::AddArgs),
    /// List scheduled alarms
    List {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Fire an alarm now
    Trigger {
        /// Alarm id or unique prefix
        id: String,
    },
    /// Cancel an alarm
    Cancel {
        /// Alarm id or unique prefix
        id: String,
    },
    /// Defer an alarm, or its reminder
    Defer {
        /// Alarm id or unique prefix
        id: String,
        /// New time: +10m, HH:MM, "YYYY-MM-DD HH:MM" or RFC 3339
        until: String,
        /// Defer the reminder instead of the alarm
        #[arg(long)]
        reminder: bool,
    },
    /// Enable all alarms
    Enable,
    /// Disable all alarms
    Disable,
    /// Configuration management
    Config {
        #[command(subcommand)]
        action: commands::config::ConfigAction,
    },
}

fn init_logging(default_level: &str) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let globals = Globals { db: cli.db };
    init_logging(match cli.command {
        Commands::Daemon(_) => "info",
        _ => "warn",
    });

    let result = match cli.command {
        Commands::Daemon(args) => commands::daemon::run(&globals, args).await,
        Commands::Add(args) => commands::alarm::add(&globals, args).await,
        Commands::List { json } => commands::alarm::list(&globals, json).await,
        Commands::Trigger { id } => commands::alarm::handle(&globals, &id, QueueMode::Trigger).await,
        Commands::Cancel { id } => commands::alarm::handle(&globals, &id, QueueMode::Cancel).await,
        Commands::Defer {
            id,
            until,
            reminder,
        } => commands::alarm::defer(&globals, &id, &until, reminder).await,
        Commands::Enable => commands::config::set_enabled(true),
        Commands::Disable => commands::config::set_enabled(false),
        Commands::Config { action } => commands::config::run(action),
    };

    if let Err(e) = result {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}
