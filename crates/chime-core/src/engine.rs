//! Queue processor and scheduler.
//!
//! [`AlarmEngine`] owns the action queue, the alarm store and the
//! dispatcher. Only [`AlarmEngine::process_queue`] pops and evaluates queue
//! entries, and only while it holds the drain token; everything else, from
//! timer expiry to a finished command, reaches the engine as a queued entry
//! or flag through an [`EngineHandle`].

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, NaiveTime, Utc};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::alarm::{
    AlarmAction, AlarmDefinition, AlarmDraft, AlarmId, SubAlarm, SubAlarmKind, WorkTimeRules,
};
use crate::clock::Clock;
use crate::collaborators::{AlarmStore, ProcessStatus};
use crate::dispatch::{AwaitStage, DispatchHandle, DispatchStatus, Dispatcher, FireOptions, FollowUp};
use crate::error::{ActionStage, CoreError, Result, StoreError};
use crate::evaluator::{self, EvalEnv, EvalMode, Mutation, RescheduleOutcome};
use crate::events::Event;
use crate::queue::{ActionQueue, QueueEntry, QueueMode};
use crate::storage::Preferences;

/// Longest single wait, so a clock jump (suspend, manual change) is noticed
/// within a minute.
pub const MAX_WAIT: std::time::Duration = std::time::Duration::from_secs(60);

/// Longest wait a platform timer can represent.
pub const PLATFORM_MAX_WAIT: std::time::Duration = std::time::Duration::from_millis(i32::MAX as u64);

/// Everything the engine needs from the outside, built once at startup.
pub struct EngineContext {
    pub store: Box<dyn AlarmStore>,
    pub clock: Arc<dyn Clock>,
    pub dispatcher: Dispatcher,
    pub prefs: Preferences,
}

/// Something sent to the engine from another task.
#[derive(Debug, Clone)]
pub enum Stimulus {
    Enqueue(QueueEntry),
    SetGloballyEnabled(bool),
    PreferencesChanged(Box<Preferences>),
    Resync,
    ArchivePurge,
    Quit,
}

/// Cloneable sender side of the engine. Never blocks and never touches the
/// store.
#[derive(Debug, Clone)]
pub struct EngineHandle {
    tx: mpsc::UnboundedSender<Stimulus>,
    draining: Arc<AtomicBool>,
}

/// Receiver side, owned by the engine.
#[derive(Debug)]
pub struct Inbox {
    rx: mpsc::UnboundedReceiver<Stimulus>,
    draining: Arc<AtomicBool>,
}

/// Create the handle/inbox pair. The handle exists before the engine so that
/// collaborators can be given clones of it.
pub fn channel() -> (EngineHandle, Inbox) {
    let (tx, rx) = mpsc::unbounded_channel();
    let draining = Arc::new(AtomicBool::new(false));
    (
        EngineHandle {
            tx,
            draining: draining.clone(),
        },
        Inbox { rx, draining },
    )
}

impl EngineHandle {
    fn send(&self, stimulus: Stimulus) -> bool {
        self.tx.send(stimulus).is_ok()
    }

    pub fn enqueue(&self, entry: QueueEntry) -> bool {
        self.send(Stimulus::Enqueue(entry))
    }

    pub fn handle_by_id(&self, id: AlarmId, mode: QueueMode) -> bool {
        self.enqueue(QueueEntry::ById { id, mode })
    }

    pub fn command_finished(&self, handle: DispatchHandle, status: ProcessStatus) -> bool {
        self.enqueue(QueueEntry::FollowUp(FollowUp::CommandExited { handle, status }))
    }

    pub fn mail_finished(&self, handle: DispatchHandle, result: std::result::Result<(), String>) -> bool {
        self.enqueue(QueueEntry::FollowUp(FollowUp::MailFinished { handle, result }))
    }

    pub fn window_closed(&self, id: AlarmId) -> bool {
        self.enqueue(QueueEntry::FollowUp(FollowUp::WindowClosed { id }))
    }

    pub fn set_globally_enabled(&self, enabled: bool) -> bool {
        self.send(Stimulus::SetGloballyEnabled(enabled))
    }

    pub fn preferences_changed(&self, prefs: Preferences) -> bool {
        self.send(Stimulus::PreferencesChanged(Box::new(prefs)))
    }

    pub fn request_resync(&self) -> bool {
        self.send(Stimulus::Resync)
    }

    pub fn request_archive_purge(&self) -> bool {
        self.send(Stimulus::ArchivePurge)
    }

    pub fn request_quit(&self) -> bool {
        self.send(Stimulus::Quit)
    }

    /// Whether a drain pass is running right now. Answers may be stale.
    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::Acquire)
    }
}

impl Inbox {
    /// Next stimulus, for front ends that drive a detached inbox themselves.
    pub async fn recv(&mut self) -> Option<Stimulus> {
        self.rx.recv().await
    }
}

/// Single-owner drain token, released on drop.
struct DrainToken(Arc<AtomicBool>);

impl DrainToken {
    fn try_acquire(flag: Arc<AtomicBool>) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| DrainToken(flag))
    }
}

impl Drop for DrainToken {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// When the engine next needs to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WakeUp {
    /// Trigger time of the earliest pending alarm.
    pub at: DateTime<Utc>,
    /// Real time to wait, clamped to [`MAX_WAIT`].
    pub wait: std::time::Duration,
}

impl WakeUp {
    pub fn until(now: DateTime<Utc>, at: DateTime<Utc>) -> Self {
        let wait = (at - now).to_std().unwrap_or_default();
        Self {
            at,
            wait: wait.min(MAX_WAIT).min(PLATFORM_MAX_WAIT),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    /// Another drain holds the token; it will see this request.
    AlreadyDraining,
    NotInitialised,
    Sleep(WakeUp),
    /// Something is due now; drain again straight away.
    Immediate,
    /// No pending alarms.
    Idle,
    /// Quit was requested and nothing is outstanding.
    Quit,
}

/// Row of [`AlarmEngine::list_scheduled`].
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct ScheduledAlarm {
    pub id: AlarmId,
    pub next_trigger: Option<DateTime<Utc>>,
    pub summary: String,
    pub enabled: bool,
    pub recurring: bool,
}

/// An asynchronous dispatch waiting for its completion.
#[derive(Debug, Clone)]
enum PendingDispatch {
    /// Pre-alarm action running; the window opens afterwards.
    PreAction {
        id: AlarmId,
        alarm: SubAlarm,
        opts: FireOptions,
        mutations: Vec<Mutation>,
        cancel_on_error: bool,
    },
    /// Command or email in flight.
    Action {
        id: AlarmId,
        stage: AwaitStage,
        mutations: Vec<Mutation>,
    },
    PostAction {
        id: AlarmId,
    },
}

pub struct AlarmEngine {
    ctx: EngineContext,
    queue: ActionQueue,
    inbox: Inbox,
    handle: EngineHandle,
    rules: WorkTimeRules,
    start_of_day: NaiveTime,
    initialised: bool,
    login_alarms_done: bool,
    globally_enabled: bool,
    resync_requested: bool,
    purge_requested: bool,
    quit_requested: bool,
    pending: HashMap<DispatchHandle, PendingDispatch>,
    /// Definitions with a dispatch in flight; not evaluated again until it ends.
    busy: HashSet<AlarmId>,
    /// Requests for busy definitions, queued again once the dispatch ends.
    parked: HashMap<AlarmId, Vec<QueueEntry>>,
    /// Open windows whose post-alarm action runs when they close.
    awaiting_close: HashMap<AlarmId, AlarmDefinition>,
    /// Last alarm found due by the wake computation, to catch one that stays due.
    last_immediate: Option<(AlarmId, DateTime<Utc>)>,
    events: Vec<Event>,
}

impl AlarmEngine {
    /// # Errors
    /// Returns an error if the preferences contain unparsable times.
    pub fn new(ctx: EngineContext, handle: EngineHandle, inbox: Inbox) -> Result<Self> {
        let rules = ctx.prefs.work_rules()?;
        let start_of_day = ctx.prefs.start_of_day()?;
        let globally_enabled = ctx.prefs.alarms.enabled;
        Ok(Self {
            ctx,
            queue: ActionQueue::new(),
            inbox,
            handle,
            rules,
            start_of_day,
            initialised: false,
            login_alarms_done: false,
            globally_enabled,
            resync_requested: false,
            purge_requested: false,
            quit_requested: false,
            pending: HashMap::new(),
            busy: HashSet::new(),
            parked: HashMap::new(),
            awaiting_close: HashMap::new(),
            last_immediate: None,
            events: Vec::new(),
        })
    }

    pub fn handle(&self) -> EngineHandle {
        self.handle.clone()
    }

    /// Open the store and allow queue processing.
    pub fn initialise(&mut self) -> Result<()> {
        self.ctx.store.open()?;
        self.initialised = true;
        info!("alarm engine initialised");
        Ok(())
    }

    pub fn is_initialised(&self) -> bool {
        self.initialised
    }

    /// Treat at-login alarms as already handled for this process, for one-shot
    /// front-end commands that are not a session start.
    pub fn skip_login_alarms(&mut self) {
        self.login_alarms_done = true;
    }

    pub fn take_events(&mut self) -> Vec<Event> {
        std::mem::take(&mut self.events)
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub fn pending_dispatches(&self) -> usize {
        self.pending.len()
    }

    pub fn is_busy(&self, id: &AlarmId) -> bool {
        self.busy.contains(id)
    }

    pub fn globally_enabled(&self) -> bool {
        self.globally_enabled
    }

    // ── Engine surface ───────────────────────────────────────────────

    /// Build a definition from `draft` and queue it for first scheduling.
    ///
    /// # Errors
    /// Returns a validation error if the draft is invalid or never triggers.
    pub fn schedule_new(&mut self, draft: AlarmDraft) -> Result<AlarmId> {
        let defaults = self.ctx.prefs.draft_defaults()?;
        let def = draft.into_definition(self.ctx.clock.now(), self.ctx.clock.zone(), &defaults)?;
        let id = def.id.clone();
        self.queue.enqueue(QueueEntry::NewAlarm {
            definition: Box::new(def),
            mode: QueueMode::HandleIfDue,
        });
        Ok(id)
    }

    /// Queue an action for an existing alarm. False if the id is unknown or
    /// an identical request is already queued.
    pub fn handle_by_id(&mut self, id: &AlarmId, mode: QueueMode) -> bool {
        match self.ctx.store.event(id) {
            Ok(Some(_)) => self.queue.enqueue(QueueEntry::ById {
                id: id.clone(),
                mode,
            }),
            Ok(None) => {
                debug!(alarm_id = %id, "handle request for unknown alarm");
                false
            }
            Err(e) => {
                self.store_unavailable(&e);
                false
            }
        }
    }

    /// Queue a deferral of the alarm, or of its reminder, until `until`.
    pub fn defer(&mut self, id: &AlarmId, until: DateTime<Utc>, reminder: bool) -> bool {
        self.queue.enqueue(QueueEntry::Defer {
            id: id.clone(),
            until,
            reminder,
        })
    }

    pub fn set_globally_enabled(&mut self, enabled: bool) {
        if self.globally_enabled != enabled {
            info!(enabled, "alarms globally toggled");
        }
        self.globally_enabled = enabled;
    }

    /// Take new preferences. Working-time rules apply from the next
    /// evaluation; date-only triggers move on the next drain.
    pub fn preferences_changed(&mut self, prefs: Preferences) {
        match (prefs.work_rules(), prefs.start_of_day()) {
            (Ok(rules), Ok(start_of_day)) => {
                self.rules = rules;
                self.start_of_day = start_of_day;
            }
            (Err(e), _) | (_, Err(e)) => {
                warn!(error = %e, "ignoring invalid working-time preferences");
            }
        }
        self.globally_enabled = prefs.alarms.enabled;
        self.ctx.prefs = prefs;
        self.resync_requested = true;
    }

    pub fn request_resync(&mut self) {
        self.resync_requested = true;
    }

    pub fn request_archive_purge(&mut self) {
        self.purge_requested = true;
    }

    pub fn request_quit(&mut self) {
        self.quit_requested = true;
    }

    /// Resolve a full id or unique prefix.
    pub fn resolve_id(&self, id_or_prefix: &str) -> Result<AlarmId> {
        let exact = AlarmId::from(id_or_prefix);
        if self.ctx.store.event(&exact)?.is_some() {
            return Ok(exact);
        }
        let mut matches = self.ctx.store.find_by_prefix(id_or_prefix)?;
        match matches.len() {
            0 => Err(CoreError::NotFound(exact)),
            1 => Ok(matches.remove(0)),
            _ => Err(CoreError::Ambiguous(exact)),
        }
    }

    /// Active alarms, earliest first. Read-only; may be stale during a drain.
    pub fn list_scheduled(&self) -> Result<Vec<ScheduledAlarm>> {
        Ok(self
            .ctx
            .store
            .active_events()?
            .into_iter()
            .map(|def| ScheduledAlarm {
                next_trigger: def.next_trigger(),
                summary: def.action.summary(),
                enabled: def.enabled,
                recurring: def.recurs(),
                id: def.id,
            })
            .collect())
    }

    // ── Stimuli ──────────────────────────────────────────────────────

    fn apply_stimulus(&mut self, stimulus: Stimulus) {
        match stimulus {
            Stimulus::Enqueue(entry) => {
                self.queue.enqueue(entry);
            }
            Stimulus::SetGloballyEnabled(enabled) => self.set_globally_enabled(enabled),
            Stimulus::PreferencesChanged(prefs) => self.preferences_changed(*prefs),
            Stimulus::Resync => self.request_resync(),
            Stimulus::ArchivePurge => self.request_archive_purge(),
            Stimulus::Quit => self.request_quit(),
        }
    }

    /// Move everything already sent through the handle into the engine.
    pub fn pull_stimuli(&mut self) {
        while let Ok(stimulus) = self.inbox.rx.try_recv() {
            self.apply_stimulus(stimulus);
        }
    }

    /// Wait up to `timeout` (forever if `None`) for something to arrive.
    /// Returns false on timeout.
    pub async fn wait_for_stimulus(&mut self, timeout: Option<std::time::Duration>) -> bool {
        let received = match timeout {
            Some(wait) => {
                tokio::select! {
                    stimulus = self.inbox.rx.recv() => stimulus,
                    _ = tokio::time::sleep(wait) => None,
                }
            }
            None => self.inbox.rx.recv().await,
        };
        match received {
            Some(stimulus) => {
                self.apply_stimulus(stimulus);
                self.pull_stimuli();
                true
            }
            None => false,
        }
    }

    // ── Queue processing ─────────────────────────────────────────────

    /// Run one drain pass and work out when to run next.
    pub fn process_queue(&mut self) -> DrainOutcome {
        let Some(_token) = DrainToken::try_acquire(self.inbox.draining.clone()) else {
            debug!("drain already in progress");
            return DrainOutcome::AlreadyDraining;
        };
        if !self.initialised {
            return DrainOutcome::NotInitialised;
        }
        self.pull_stimuli();

        if self.resync_requested {
            self.resync_requested = false;
            self.resync();
        }

        if !self.login_alarms_done {
            self.login_alarms_done = true;
            self.run_login_alarms();
        }

        while let Some(entry) = self.queue.drain_next() {
            self.handle_entry(entry);
            self.pull_stimuli();
        }

        if self.purge_requested {
            self.purge_requested = false;
            self.purge_archive();
        }

        if self.quit_requested && self.queue.is_empty() && self.pending.is_empty() {
            info!("quit requested and nothing outstanding");
            return DrainOutcome::Quit;
        }

        self.next_wake()
    }

    fn next_wake(&mut self) -> DrainOutcome {
        let now = self.ctx.clock.now();
        let def = match self.ctx.store.earliest_alarm(&self.busy) {
            Ok(def) => def,
            Err(e) => {
                self.store_unavailable(&e);
                return DrainOutcome::Sleep(WakeUp {
                    at: now,
                    wait: MAX_WAIT,
                });
            }
        };
        let Some((id, at)) = def.and_then(|d| d.next_trigger().map(|t| (d.id, t))) else {
            self.last_immediate = None;
            return DrainOutcome::Idle;
        };
        if at > now {
            self.last_immediate = None;
            return DrainOutcome::Sleep(WakeUp::until(now, at));
        }
        let key = (id.clone(), at);
        if self.last_immediate.as_ref() == Some(&key) {
            // Handled once already and still due: don't spin on it.
            warn!(alarm_id = %id, %at, "alarm remains due after handling");
            self.last_immediate = None;
            return DrainOutcome::Sleep(WakeUp { at, wait: MAX_WAIT });
        }
        self.last_immediate = Some(key);
        self.queue.enqueue(QueueEntry::ById {
            id,
            mode: QueueMode::HandleIfDue,
        });
        DrainOutcome::Immediate
    }

    fn resync(&mut self) {
        if let Err(e) = self.ctx.store.reload() {
            self.store_unavailable(&e);
            return;
        }
        let defs = match self.ctx.store.active_events() {
            Ok(defs) => defs,
            Err(e) => {
                self.store_unavailable(&e);
                return;
            }
        };
        let zone = self.ctx.clock.zone();
        for mut def in defs {
            if self.busy.contains(&def.id) {
                continue;
            }
            if def.apply_start_of_day(self.start_of_day, zone) {
                debug!(alarm_id = %def.id, "date-only alarm moved to new start of day");
                self.persist(&def);
            }
        }
    }

    fn run_login_alarms(&mut self) {
        let defs = match self.ctx.store.at_login_alarms() {
            Ok(defs) => defs,
            Err(e) => {
                self.store_unavailable(&e);
                return;
            }
        };
        let now = self.ctx.clock.now();
        for mut def in defs {
            if self.busy.contains(&def.id) {
                continue;
            }
            let stored = def.clone();
            let stale: Vec<SubAlarmKind> = def
                .sub_alarms
                .iter()
                .filter(|a| {
                    (a.kind.is_reminder() || a.kind.is_deferral()) && a.trigger <= now
                })
                .map(|a| a.kind)
                .collect();
            for kind in &stale {
                def.remove_sub_alarm(*kind);
            }
            def.login_reminder_armed = false;
            if def != stored && !self.persist(&def) {
                continue;
            }
            info!(alarm_id = %def.id, "repeat-at-login alarm");
            self.process_definition(def, EvalMode::Login);
        }
    }

    fn purge_archive(&mut self) {
        let days = self.ctx.prefs.alarms.archive_purge_days;
        if days == 0 {
            return;
        }
        let now = self.ctx.clock.now();
        let before = now - chrono::Duration::days(i64::from(days));
        match self.ctx.store.purge_archived(before) {
            Ok(count) => {
                if count > 0 {
                    info!(count, "purged archived alarms");
                }
                self.events.push(Event::ArchivePurged { count, at: now });
            }
            Err(e) => self.store_unavailable(&e),
        }
    }

    fn handle_entry(&mut self, entry: QueueEntry) {
        match entry {
            QueueEntry::NewAlarm { definition, mode } => {
                let def = *definition;
                if !self.persist(&def) {
                    return;
                }
                info!(alarm_id = %def.id, next = ?def.next_trigger(), "alarm scheduled");
                self.events.push(Event::AlarmScheduled {
                    id: def.id.clone(),
                    next_trigger: def.next_trigger(),
                    at: self.ctx.clock.now(),
                });
                self.handle_definition(def, mode);
            }
            QueueEntry::ById { id, mode } => {
                if self.busy.contains(&id) {
                    self.park(QueueEntry::ById { id, mode });
                    return;
                }
                if let Some(def) = self.load(&id) {
                    self.handle_definition(def, mode);
                }
            }
            QueueEntry::Defer { id, until, reminder } => {
                if self.busy.contains(&id) {
                    self.park(QueueEntry::Defer { id, until, reminder });
                    return;
                }
                self.apply_defer(&id, until, reminder);
            }
            QueueEntry::FollowUp(follow_up) => self.handle_follow_up(follow_up),
        }
    }

    fn handle_definition(&mut self, def: AlarmDefinition, mode: QueueMode) {
        match mode {
            QueueMode::Cancel => {
                let archive = def.archive;
                self.cancel_definition(&def.id, archive);
            }
            QueueMode::Trigger => self.process_definition(def, EvalMode::Trigger),
            QueueMode::HandleIfDue => self.process_definition(def, EvalMode::HandleIfDue),
        }
    }

    /// Hold `entry` until the dispatch for its definition has finished.
    fn park(&mut self, entry: QueueEntry) {
        let id = match &entry {
            QueueEntry::ById { id, .. } | QueueEntry::Defer { id, .. } => id.clone(),
            _ => return,
        };
        let parked = self.parked.entry(id.clone()).or_default();
        if !parked.contains(&entry) {
            debug!(alarm_id = %id, "dispatch in flight, request held");
            parked.push(entry);
        }
    }

    /// End the in-flight dispatch of `id` and queue what was held for it.
    fn release(&mut self, id: &AlarmId) {
        self.busy.remove(id);
        for entry in self.parked.remove(id).unwrap_or_default() {
            self.queue.enqueue(entry);
        }
    }

    fn apply_defer(&mut self, id: &AlarmId, until: DateTime<Utc>, reminder: bool) {
        let Some(mut def) = self.load(id) else {
            return;
        };
        if reminder {
            def.remove_sub_alarm(SubAlarmKind::Reminder);
            def.set_sub_alarm(SubAlarmKind::DeferredReminder, until);
        } else {
            def.set_sub_alarm(SubAlarmKind::Deferred, until);
        }
        if self.persist(&def) {
            info!(alarm_id = %id, %until, "alarm deferred");
            self.events.push(Event::AlarmDeferred {
                id: id.clone(),
                until,
                at: self.ctx.clock.now(),
            });
        }
    }

    /// Evaluate one definition and act on the result.
    fn process_definition(&mut self, def: AlarmDefinition, mode: EvalMode) {
        let now = self.ctx.clock.now();
        let env = EvalEnv {
            now,
            zone: self.ctx.clock.zone(),
            rules: &self.rules,
        };
        let eval = evaluator::evaluate(&def, mode, &env);
        if eval.cancels() {
            let archive = def.archive;
            self.cancel_definition(&def.id, archive);
            return;
        }
        let mut work = eval.definition;
        let Some(alarm) = eval.fire else {
            self.finish(&def, work, &eval.mutations);
            return;
        };

        if !self.globally_enabled || !work.enabled {
            debug!(alarm_id = %work.id, kind = ?alarm.kind, "alarm disabled, not dispatching");
            self.events.push(Event::AlarmSuppressed {
                id: work.id.clone(),
                kind: alarm.kind,
                at: now,
            });
            self.finish(&def, work, &eval.mutations);
            return;
        }

        if alarm.kind == SubAlarmKind::Main && !eval.forced {
            work.last_triggered = Some(now);
        }
        self.events.push(Event::AlarmFired {
            id: work.id.clone(),
            kind: alarm.kind,
            forced: eval.forced,
            at: now,
        });
        let opts = FireOptions {
            forced: eval.forced,
            pre_action_on_deferral: self.ctx.prefs.alarms.execute_pre_action_on_deferral,
        };
        let report = self.ctx.dispatcher.dispatch(&work, &alarm, opts);
        let failed = !report.failures.is_empty();
        for failure in report.failures {
            self.action_failed(&work.id, failure.stage, failure.message);
        }

        match report.status {
            DispatchStatus::Done => {
                self.after_shown(&work);
                self.finish(&def, work.clone(), &eval.mutations);
                // Windows run their post-action on close; a sent email runs it now.
                if matches!(work.action, AlarmAction::Email { .. }) && !failed {
                    self.start_post_action(&work);
                }
            }
            DispatchStatus::Aborted => self.finish(&def, work, &eval.mutations),
            DispatchStatus::Awaiting(handle, stage) => {
                debug!(alarm_id = %work.id, ?stage, "dispatch awaiting completion");
                if work != def {
                    self.persist(&work);
                }
                self.busy.insert(work.id.clone());
                let id = work.id.clone();
                let pending = match (stage, &work.pre_action) {
                    (AwaitStage::PreAction, pre) => PendingDispatch::PreAction {
                        id,
                        alarm,
                        opts,
                        mutations: eval.mutations,
                        cancel_on_error: pre.as_ref().is_some_and(|p| p.cancel_on_error),
                    },
                    _ => PendingDispatch::Action {
                        id,
                        stage,
                        mutations: eval.mutations,
                    },
                };
                self.pending.insert(handle, pending);
            }
        }
    }

    fn handle_follow_up(&mut self, follow_up: FollowUp) {
        match follow_up {
            FollowUp::CommandExited { handle, status } => {
                let Some(pending) = self.pending.remove(&handle) else {
                    debug!(?handle, "completion for unknown dispatch");
                    return;
                };
                match pending {
                    PendingDispatch::PreAction {
                        id,
                        alarm,
                        opts,
                        mutations,
                        cancel_on_error,
                    } => {
                        self.release(&id);
                        let Some(def) = self.load(&id) else {
                            return;
                        };
                        if !status.success {
                            self.action_failed(&id, ActionStage::PreAction, exit_message(&status));
                            if cancel_on_error {
                                info!(alarm_id = %id, "pre-alarm action failed, alarm not shown");
                                self.finish(&def, def.clone(), &mutations);
                                return;
                            }
                        }
                        let report = self.ctx.dispatcher.show(&def, &alarm, opts);
                        for failure in report.failures {
                            self.action_failed(&id, failure.stage, failure.message);
                        }
                        self.after_shown(&def);
                        self.finish(&def, def.clone(), &mutations);
                    }
                    PendingDispatch::Action { id, stage, mutations } => {
                        self.release(&id);
                        if !status.success {
                            let stage = match stage {
                                AwaitStage::Email => ActionStage::Email,
                                _ => ActionStage::Command,
                            };
                            self.action_failed(&id, stage, exit_message(&status));
                        }
                        self.complete_action(&id, &mutations);
                    }
                    PendingDispatch::PostAction { id } => {
                        if !status.success {
                            self.action_failed(&id, ActionStage::PostAction, exit_message(&status));
                        }
                    }
                }
            }
            FollowUp::MailFinished { handle, result } => {
                let Some(pending) = self.pending.remove(&handle) else {
                    debug!(?handle, "completion for unknown dispatch");
                    return;
                };
                if let PendingDispatch::Action { id, mutations, .. } = pending {
                    self.release(&id);
                    if let Err(message) = result {
                        self.action_failed(&id, ActionStage::Email, message);
                    }
                    self.complete_action(&id, &mutations);
                }
            }
            FollowUp::WindowClosed { id } => {
                if let Some(def) = self.awaiting_close.remove(&id) {
                    self.start_post_action(&def);
                }
            }
        }
    }

    /// Apply the mutations deferred by a command or email, then run the
    /// post-alarm action.
    fn complete_action(&mut self, id: &AlarmId, mutations: &[Mutation]) {
        let Some(def) = self.load(id) else {
            return;
        };
        self.finish(&def, def.clone(), mutations);
        self.start_post_action(&def);
    }

    fn after_shown(&mut self, def: &AlarmDefinition) {
        if def.post_action.is_some()
            && (def.action.is_display() || matches!(def.action, AlarmAction::Audio { .. }))
        {
            self.awaiting_close.insert(def.id.clone(), def.clone());
        }
    }

    fn start_post_action(&mut self, def: &AlarmDefinition) {
        match self.ctx.dispatcher.run_post_action(def) {
            Ok(Some(handle)) => {
                self.pending
                    .insert(handle, PendingDispatch::PostAction { id: def.id.clone() });
            }
            Ok(None) => {}
            Err(e) => self.action_failed(&def.id, ActionStage::PostAction, e.to_string()),
        }
    }

    /// Apply mutations to `work` and write the result once.
    fn finish(&mut self, original: &AlarmDefinition, mut work: AlarmDefinition, mutations: &[Mutation]) {
        let now = self.ctx.clock.now();
        let env = EvalEnv {
            now,
            zone: self.ctx.clock.zone(),
            rules: &self.rules,
        };
        match evaluator::apply_mutations(&mut work, mutations, &env) {
            RescheduleOutcome::Cancelled => {
                let archive = work.archive;
                self.cancel_definition(&work.id, archive);
            }
            RescheduleOutcome::Updated | RescheduleOutcome::Unchanged => {
                if work == *original {
                    return;
                }
                if !self.persist(&work) {
                    return;
                }
                if work.next_trigger() != original.next_trigger() {
                    info!(alarm_id = %work.id, next = ?work.next_trigger(), "alarm rescheduled");
                    self.events.push(Event::AlarmRescheduled {
                        id: work.id.clone(),
                        next_trigger: work.next_trigger(),
                        at: now,
                    });
                }
            }
        }
    }

    fn cancel_definition(&mut self, id: &AlarmId, archive: bool) {
        let now = self.ctx.clock.now();
        match self.ctx.store.delete_event(id, archive, now) {
            Ok(()) => {
                info!(alarm_id = %id, archive, "alarm cancelled");
                self.events.push(Event::AlarmCancelled {
                    id: id.clone(),
                    archived: archive,
                    at: now,
                });
            }
            Err(e) => self.store_unavailable(&e),
        }
    }

    fn load(&mut self, id: &AlarmId) -> Option<AlarmDefinition> {
        match self.ctx.store.event(id) {
            Ok(Some(def)) => Some(def),
            Ok(None) => {
                debug!(alarm_id = %id, "alarm no longer exists");
                None
            }
            Err(e) => {
                self.store_unavailable(&e);
                None
            }
        }
    }

    fn persist(&mut self, def: &AlarmDefinition) -> bool {
        match self.ctx.store.update_event(def) {
            Ok(()) => true,
            Err(e) => {
                self.store_unavailable(&e);
                false
            }
        }
    }

    fn store_unavailable(&mut self, err: &StoreError) {
        warn!(error = %err, "alarm store unavailable");
        self.events.push(Event::StoreUnavailable {
            message: err.to_string(),
            at: self.ctx.clock.now(),
        });
    }

    fn action_failed(&mut self, id: &AlarmId, stage: ActionStage, message: String) {
        let err = CoreError::ExternalActionFailed {
            id: id.clone(),
            stage,
            message: message.clone(),
        };
        warn!(error = %err, "alarm action failed");
        self.events.push(Event::ActionFailed {
            id: id.clone(),
            stage,
            message,
            at: self.ctx.clock.now(),
        });
    }
}

fn exit_message(status: &ProcessStatus) -> String {
    match status.code {
        Some(code) => format!("exit status {code}"),
        None => "terminated by signal".to_string(),
    }
}
