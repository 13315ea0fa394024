//! Shared harness: an engine over a [`MemoryStore`] and a [`SimulatedClock`],
//! with collaborators that record what they were asked to do.

#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chime_core::alarm::DraftDefaults;
use chime_core::collaborators::{
    AlarmStore, BoxError, CommandRequest, DisplayFlags, EmailJob, MailOutcome, MailSender,
    Presenter, ProcessRunner, WindowState,
};
use chime_core::engine::{self, AlarmEngine, DrainOutcome, EngineContext, EngineHandle};
use chime_core::{
    AlarmDefinition, AlarmDraft, AlarmId, AlarmZone, Dispatcher, Event, MemoryStore, Preferences,
    SimulatedClock, SubAlarm, SubAlarmKind,
};
use chrono::{DateTime, TimeZone, Utc};

pub fn at(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
}

#[derive(Debug, Clone, PartialEq)]
pub struct Shown {
    pub id: AlarmId,
    pub kind: SubAlarmKind,
    pub trigger: DateTime<Utc>,
    pub flags: DisplayFlags,
}

#[derive(Clone, Default)]
pub struct Recorder {
    pub shown: Arc<Mutex<Vec<Shown>>>,
    pub commands: Arc<Mutex<Vec<CommandRequest>>>,
    pub mails: Arc<Mutex<Vec<EmailJob>>>,
    /// Mailer answers `Queued` instead of `Sent`.
    pub queue_mail: Arc<AtomicBool>,
}

impl Recorder {
    pub fn shown(&self) -> Vec<Shown> {
        self.shown.lock().unwrap().clone()
    }

    pub fn commands(&self) -> Vec<CommandRequest> {
        self.commands.lock().unwrap().clone()
    }

    pub fn mails(&self) -> Vec<EmailJob> {
        self.mails.lock().unwrap().clone()
    }
}

struct RecordingPresenter {
    rec: Recorder,
}

impl Presenter for RecordingPresenter {
    fn find_by_definition_id(&self, _id: &AlarmId) -> Option<WindowState> {
        None
    }

    fn open(
        &mut self,
        def: &AlarmDefinition,
        alarm: &SubAlarm,
        flags: DisplayFlags,
    ) -> Result<(), BoxError> {
        self.rec.shown.lock().unwrap().push(Shown {
            id: def.id.clone(),
            kind: alarm.kind,
            trigger: alarm.trigger,
            flags,
        });
        Ok(())
    }

    fn repeat(&mut self, _def: &AlarmDefinition, _alarm: &SubAlarm) -> Result<(), BoxError> {
        Ok(())
    }

    fn cancel_reminder(&mut self, _def: &AlarmDefinition, _alarm: &SubAlarm) -> Result<(), BoxError> {
        Ok(())
    }
}

/// Records requests; completion is delivered by the test through the handle.
struct RecordingRunner {
    rec: Recorder,
}

impl ProcessRunner for RecordingRunner {
    fn run(&mut self, request: CommandRequest) -> Result<(), BoxError> {
        self.rec.commands.lock().unwrap().push(request);
        Ok(())
    }
}

struct RecordingMailer {
    rec: Recorder,
}

impl MailSender for RecordingMailer {
    fn send(&mut self, job: EmailJob) -> Result<MailOutcome, BoxError> {
        self.rec.mails.lock().unwrap().push(job);
        if self.rec.queue_mail.load(Ordering::SeqCst) {
            Ok(MailOutcome::Queued)
        } else {
            Ok(MailOutcome::Sent)
        }
    }
}

pub struct Harness {
    pub engine: AlarmEngine,
    pub store: MemoryStore,
    pub clock: SimulatedClock,
    pub handle: EngineHandle,
    pub rec: Recorder,
    pub events: Vec<Event>,
}

impl Harness {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self::with_prefs(now, Preferences::default())
    }

    pub fn with_prefs(now: DateTime<Utc>, prefs: Preferences) -> Self {
        let clock = SimulatedClock::with_zone(now, AlarmZone::utc());
        Self::build(MemoryStore::new(), clock, prefs)
    }

    fn build(store: MemoryStore, clock: SimulatedClock, prefs: Preferences) -> Self {
        let rec = Recorder::default();
        let (handle, inbox) = engine::channel();
        let dispatcher = Dispatcher::new(
            Box::new(RecordingPresenter { rec: rec.clone() }),
            Box::new(RecordingRunner { rec: rec.clone() }),
            Box::new(RecordingMailer { rec: rec.clone() }),
        );
        let ctx = EngineContext {
            store: Box::new(store.clone()),
            clock: Arc::new(clock.clone()),
            dispatcher,
            prefs,
        };
        let mut engine = AlarmEngine::new(ctx, handle.clone(), inbox).unwrap();
        engine.initialise().unwrap();
        Self {
            engine,
            store,
            clock,
            handle,
            rec,
            events: Vec::new(),
        }
    }

    /// A fresh engine over the same store and clock, as after a new login.
    pub fn restart(&self) -> Self {
        Self::build(self.store.clone(), self.clock.clone(), Preferences::default())
    }

    /// Build a definition as if it had been created at `created` and put it
    /// straight into the store.
    pub fn seed(&mut self, draft: AlarmDraft, created: DateTime<Utc>) -> AlarmId {
        let def = draft
            .into_definition(created, AlarmZone::utc(), &DraftDefaults::default())
            .unwrap();
        let id = def.id.clone();
        self.store.clone().update_event(&def).unwrap();
        id
    }

    /// One drain pass.
    pub fn drain(&mut self) -> DrainOutcome {
        let outcome = self.engine.process_queue();
        self.events.extend(self.engine.take_events());
        outcome
    }

    /// Drain until the engine stops asking to run again straight away.
    pub fn settle(&mut self) -> DrainOutcome {
        for _ in 0..16 {
            let outcome = self.drain();
            if outcome != DrainOutcome::Immediate {
                return outcome;
            }
        }
        panic!("engine kept requesting immediate drains");
    }

    pub fn set_now(&mut self, t: DateTime<Utc>) {
        self.clock.set(t);
    }

    pub fn stored(&self, id: &AlarmId) -> Option<AlarmDefinition> {
        self.store.snapshot(id)
    }

    pub fn active_ids(&self) -> HashSet<AlarmId> {
        self.store
            .active_events()
            .unwrap()
            .into_iter()
            .map(|d| d.id)
            .collect()
    }

    pub fn fired(&self, id: &AlarmId) -> Vec<SubAlarmKind> {
        self.events
            .iter()
            .filter_map(|e| match e {
                Event::AlarmFired { id: fired, kind, .. } if fired == id => Some(*kind),
                _ => None,
            })
            .collect()
    }
}
