//! Trigger evaluator.
//!
//! For one definition, decides which sub-alarm (if any) fires now, and which
//! reschedule or cancel mutations follow. Evaluation works on a private copy
//! of the definition and never touches the store; the queue processor
//! persists the result once, after dispatch.

use chrono::{DateTime, Duration, NaiveTime, Utc};
use tracing::debug;

use crate::alarm::{AlarmDefinition, NextOccurrence, SubAlarm, SubAlarmKind, WorkTimeRules};
use crate::clock::AlarmZone;

/// Grace added to every late-cancel limit.
pub const LATE_CANCEL_LEEWAY_SECS: i64 = 5;

/// Bound on enumeration restarts caused by working-time reschedules.
const MAX_RESTARTS: usize = 8;

/// Bound on occurrences skipped while looking for an allowed slot.
pub const MAX_ADVANCE_STEPS: usize = 10_000;

/// Allowed occurrences further out than this count as never.
pub const MAX_ADVANCE_HORIZON_DAYS: i64 = 5 * 366;

/// Seconds an alarm may be overdue before it is cancelled.
pub fn max_lateness_secs(late_cancel_minutes: u32) -> i64 {
    LATE_CANCEL_LEEWAY_SECS + (i64::from(late_cancel_minutes) - 1).max(0) * 60
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvalMode {
    /// Fire now. With nothing due, the main alarm is shown and the schedule
    /// is left alone.
    Trigger,
    HandleIfDue,
    /// Startup pass: only here do at-login alarms fire on their own.
    Login,
}

/// Inputs shared by every evaluation in a drain pass.
#[derive(Debug, Clone, Copy)]
pub struct EvalEnv<'a> {
    pub now: DateTime<Utc>,
    pub zone: AlarmZone,
    pub rules: &'a WorkTimeRules,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mutation {
    Reschedule(SubAlarmKind),
    /// No further occurrence: archive or delete the definition.
    Cancel,
}

#[derive(Debug, Clone)]
pub struct Evaluation {
    /// Working copy, including any working-time advances already made.
    pub definition: AlarmDefinition,
    pub fire: Option<SubAlarm>,
    /// Fired by an explicit trigger request, not because it was due.
    pub forced: bool,
    /// Applied after dispatch, in order.
    pub mutations: Vec<Mutation>,
    /// The working copy differs from the stored definition.
    pub modified: bool,
}

impl Evaluation {
    pub fn cancels(&self) -> bool {
        self.mutations.contains(&Mutation::Cancel)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RescheduleOutcome {
    Unchanged,
    Updated,
    /// The schedule is exhausted.
    Cancelled,
}

enum Lateness {
    OnTime,
    /// Too late for this trigger, but a later occurrence is still in time.
    FireOccurrence(DateTime<Utc>),
    Reschedule,
    Cancel,
}

/// Decide what happens to `def` at `env.now`.
pub fn evaluate(def: &AlarmDefinition, mode: EvalMode, env: &EvalEnv<'_>) -> Evaluation {
    let mut work = def.clone();
    let mut modified = false;
    let mut restarts = 0;

    'pass: loop {
        let mut fire: Option<SubAlarm> = None;
        let mut mutations = Vec::new();

        for alarm in work.alarms_in_order() {
            if alarm.kind == SubAlarmKind::AtLogin {
                if mode != EvalMode::Login || fire.is_some() {
                    continue;
                }
                debug!(alarm_id = %work.id, "at-login alarm eligible");
                fire = Some(SubAlarm {
                    kind: alarm.kind,
                    trigger: env.now,
                });
                mutations.insert(0, Mutation::Reschedule(alarm.kind));
                continue;
            }

            if alarm.trigger > env.now {
                continue;
            }

            if work.is_restricted()
                && !alarm.kind.is_deferral()
                && env.rules.excludes(
                    alarm.trigger,
                    env.zone,
                    work.work_time_only,
                    work.exclude_holidays,
                    work.date_only,
                )
            {
                debug!(alarm_id = %work.id, kind = ?alarm.kind, "outside working time, rescheduling");
                modified = true;
                if reschedule_alarm(&mut work, alarm.kind, env) == RescheduleOutcome::Cancelled {
                    return Evaluation {
                        definition: work,
                        fire: None,
                        forced: false,
                        mutations: vec![Mutation::Cancel],
                        modified,
                    };
                }
                restarts += 1;
                if restarts <= MAX_RESTARTS {
                    continue 'pass;
                }
                continue;
            }

            if fire.is_some() {
                // Consumed by the alarm that fires in this pass.
                mutations.push(Mutation::Reschedule(alarm.kind));
                continue;
            }

            let mut selected = alarm;
            match lateness(&work, &alarm, env) {
                Lateness::OnTime => {}
                Lateness::FireOccurrence(at) => {
                    debug!(alarm_id = %work.id, %at, "firing most recent occurrence instead");
                    selected.trigger = at;
                }
                Lateness::Reschedule => {
                    debug!(alarm_id = %work.id, kind = ?alarm.kind, "too late, rescheduling");
                    mutations.push(Mutation::Reschedule(alarm.kind));
                    continue;
                }
                Lateness::Cancel => {
                    debug!(alarm_id = %work.id, "too late and no further occurrence");
                    return Evaluation {
                        definition: work,
                        fire: None,
                        forced: false,
                        mutations: vec![Mutation::Cancel],
                        modified,
                    };
                }
            }

            fire = Some(selected);
            mutations.insert(0, Mutation::Reschedule(alarm.kind));
        }

        let mut forced = false;
        if fire.is_none() && mode == EvalMode::Trigger {
            fire = work
                .sub_alarm(SubAlarmKind::Main)
                .copied()
                .or_else(|| work.alarms_in_order().into_iter().next());
            forced = fire.is_some();
        }

        return Evaluation {
            definition: work,
            fire,
            forced,
            mutations,
            modified,
        };
    }
}

fn lateness(def: &AlarmDefinition, alarm: &SubAlarm, env: &EvalEnv<'_>) -> Lateness {
    if !is_late(def, alarm.trigger, env.now, env.zone) {
        return Lateness::OnTime;
    }
    if alarm.kind != SubAlarmKind::Main {
        return Lateness::Reschedule;
    }
    if let Some(prev) = def.previous_occurrence(env.now, env.zone) {
        if prev.at > alarm.trigger && !is_late(def, prev.at, env.now, env.zone) {
            return Lateness::FireOccurrence(prev.at);
        }
    }
    match def.next_occurrence(env.now, env.zone) {
        Some(_) => Lateness::Reschedule,
        None => Lateness::Cancel,
    }
}

/// Whether an occurrence due at `due` is past the definition's late-cancel
/// limit. Date-only alarms count whole days.
pub fn is_late(def: &AlarmDefinition, due: DateTime<Utc>, now: DateTime<Utc>, zone: AlarmZone) -> bool {
    if def.late_cancel_minutes == 0 {
        return false;
    }
    if def.date_only {
        let days = i64::from(def.late_cancel_minutes / 1440);
        let limit = zone.to_local(due).date() + Duration::days(days + 1);
        return now >= zone.to_utc(limit.and_time(NaiveTime::default()));
    }
    (now - due).num_seconds() > max_lateness_secs(def.late_cancel_minutes)
}

/// Advance or remove one sub-alarm after it fired or was skipped.
pub fn reschedule_alarm(
    def: &mut AlarmDefinition,
    kind: SubAlarmKind,
    env: &EvalEnv<'_>,
) -> RescheduleOutcome {
    match kind {
        SubAlarmKind::AtLogin => {
            if def.reminder_minutes < 0 && !def.login_reminder_armed {
                let at = env.now + Duration::minutes(-i64::from(def.reminder_minutes));
                def.set_sub_alarm(SubAlarmKind::Reminder, at);
                def.login_reminder_armed = true;
                RescheduleOutcome::Updated
            } else {
                RescheduleOutcome::Unchanged
            }
        }
        SubAlarmKind::Reminder | SubAlarmKind::DeferredReminder | SubAlarmKind::Deferred => {
            // A rescheduled main alarm may already have set a fresh one.
            if def.sub_alarm(kind).is_some_and(|a| a.trigger <= env.now) {
                def.remove_sub_alarm(kind);
                RescheduleOutcome::Updated
            } else {
                RescheduleOutcome::Unchanged
            }
        }
        SubAlarmKind::Main => reschedule_main(def, env),
    }
}

fn reschedule_main(def: &mut AlarmDefinition, env: &EvalEnv<'_>) -> RescheduleOutcome {
    let before = def.clone();
    let horizon = env.now + Duration::days(MAX_ADVANCE_HORIZON_DAYS);
    let mut cursor = match def.sub_alarm(SubAlarmKind::Main) {
        Some(main) if main.trigger > env.now => main.trigger,
        _ => env.now,
    };

    let mut next = None;
    for _ in 0..MAX_ADVANCE_STEPS {
        let occ = match def.set_next_occurrence(cursor, env.now, env.zone) {
            NextOccurrence::None => return RescheduleOutcome::Cancelled,
            NextOccurrence::First(occ) | NextOccurrence::Later(occ) => occ,
        };
        if occ.at > horizon {
            break;
        }
        if def.is_restricted()
            && env.rules.excludes(
                occ.at,
                env.zone,
                def.work_time_only,
                def.exclude_holidays,
                def.date_only,
            )
        {
            cursor = occ.at;
            continue;
        }
        next = Some(occ);
        break;
    }
    let Some(occ) = next else {
        tracing::warn!(alarm_id = %def.id, "no allowed occurrence within the search bound");
        return RescheduleOutcome::Cancelled;
    };

    if def.reminder_minutes < 0 {
        if let Some(last) = def.last_triggered {
            let at = last + Duration::minutes(-i64::from(def.reminder_minutes));
            if at > env.now && at < occ.at {
                def.set_sub_alarm(SubAlarmKind::Reminder, at);
            }
        }
    }
    if def
        .sub_alarm(SubAlarmKind::Deferred)
        .is_some_and(|d| d.trigger >= occ.at)
    {
        def.remove_sub_alarm(SubAlarmKind::Deferred);
    }

    if *def == before {
        RescheduleOutcome::Unchanged
    } else {
        RescheduleOutcome::Updated
    }
}

/// Apply evaluation mutations in order. Stops at the first cancellation.
pub fn apply_mutations(
    def: &mut AlarmDefinition,
    mutations: &[Mutation],
    env: &EvalEnv<'_>,
) -> RescheduleOutcome {
    let mut outcome = RescheduleOutcome::Unchanged;
    for mutation in mutations {
        let step = match mutation {
            Mutation::Cancel => RescheduleOutcome::Cancelled,
            Mutation::Reschedule(kind) => reschedule_alarm(def, *kind, env),
        };
        match step {
            RescheduleOutcome::Cancelled => return RescheduleOutcome::Cancelled,
            RescheduleOutcome::Updated => outcome = RescheduleOutcome::Updated,
            RescheduleOutcome::Unchanged => {}
        }
    }
    outcome
}
