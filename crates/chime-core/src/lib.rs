//! # Chime Core Library
//!
//! Alarm trigger and rescheduling engine. Alarm definitions live in a store;
//! the engine works out which sub-alarm of each definition is due, hands the
//! firing to collaborators (message window, command runner, mailer) and moves
//! the definition on to its next occurrence, or cancels it when it was missed
//! for too long.
//!
//! ## Architecture
//!
//! - **Queue**: FIFO of requests, drained only by the engine's single owner
//! - **Evaluator**: pure per-definition decision of what fires and what changes
//! - **Dispatch**: boundary towards presentation, processes and mail
//! - **Storage**: SQLite alarm store and TOML preferences
//!
//! ## Key Components
//!
//! - [`AlarmEngine`]: queue processor and wake-time scheduler
//! - [`EngineHandle`]: cloneable sender used by timers and collaborators
//! - [`AlarmDefinition`]: a stored alarm with its sub-alarms
//! - [`Preferences`]: application configuration

pub mod alarm;
pub mod clock;
pub mod collaborators;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod evaluator;
pub mod events;
pub mod queue;
pub mod runtime;
pub mod storage;

pub use alarm::{
    AlarmAction, AlarmDefinition, AlarmDraft, AlarmId, Frequency, Recurrence, RecurrenceEnd,
    SubAlarm, SubAlarmKind,
};
pub use clock::{AlarmZone, Clock, SimulatedClock, SystemClock};
pub use dispatch::Dispatcher;
pub use engine::{channel, AlarmEngine, DrainOutcome, EngineContext, EngineHandle, ScheduledAlarm};
pub use error::{ConfigError, CoreError, StoreError, ValidationError};
pub use events::Event;
pub use queue::QueueMode;
pub use storage::{MemoryStore, Preferences, SqliteStore};
