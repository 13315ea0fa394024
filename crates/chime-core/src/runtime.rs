//! Async driver for [`AlarmEngine`].
//!
//! One task owns the engine and alternates between draining the queue and
//! waiting for either the next wake time or a stimulus from a handle.

use tracing::{debug, trace};

use crate::engine::{AlarmEngine, DrainOutcome, MAX_WAIT};
use crate::error::Result;
use crate::events::Event;

/// Run the engine until a quit request has been honoured. Every event the
/// engine records is passed to `on_event` in order.
///
/// # Errors
/// Returns an error if the store cannot be opened at startup.
pub async fn run(mut engine: AlarmEngine, mut on_event: impl FnMut(&Event)) -> Result<()> {
    if !engine.is_initialised() {
        engine.initialise()?;
    }
    loop {
        let outcome = engine.process_queue();
        for event in engine.take_events() {
            on_event(&event);
        }
        trace!(?outcome, "drain pass finished");
        match outcome {
            DrainOutcome::Quit => break,
            DrainOutcome::Immediate => continue,
            DrainOutcome::Sleep(wake) => {
                debug!(at = %wake.at, wait_ms = wake.wait.as_millis() as u64, "sleeping until next alarm");
                engine.wait_for_stimulus(Some(wake.wait)).await;
            }
            DrainOutcome::Idle | DrainOutcome::AlreadyDraining | DrainOutcome::NotInitialised => {
                engine.wait_for_stimulus(Some(MAX_WAIT)).await;
            }
        }
    }
    for event in engine.take_events() {
        on_event(&event);
    }
    Ok(())
}
