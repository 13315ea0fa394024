//! Integration tests for the alarm engine.
//!
//! Each test drives the engine over an in-memory store and a simulated clock
//! and checks what was presented, what ended up in the store, and which
//! events were recorded.

mod support;

use chime_core::alarm::PreAction;
use chime_core::collaborators::{AlarmStore, CommandLine, ProcessStatus};
use chime_core::engine::{DrainOutcome, MAX_WAIT};
use chime_core::error::ActionStage;
use chime_core::{AlarmAction, AlarmDraft, Event, QueueMode, Recurrence, SubAlarmKind};
use chrono::Duration;
use support::{at, Harness};

fn display(text: &str) -> AlarmAction {
    AlarmAction::Display { text: text.into() }
}

fn exit(success: bool) -> ProcessStatus {
    ProcessStatus {
        success,
        code: Some(if success { 0 } else { 1 }),
        output: String::new(),
    }
}

fn daily_command(command: &str) -> AlarmDraft {
    let mut draft = AlarmDraft::new(
        AlarmAction::Command {
            command: command.into(),
            script: false,
            in_terminal: false,
        },
        at(2024, 1, 1, 9, 0),
    );
    draft.recurrence = Some(Recurrence::daily(1));
    draft
}

fn daily(start: chrono::DateTime<chrono::Utc>) -> AlarmDraft {
    let mut draft = AlarmDraft::new(display("Standup"), start);
    draft.recurrence = Some(Recurrence::daily(1));
    draft
}

#[test]
fn daily_alarm_fires_when_due_and_moves_to_next_day() {
    let mut h = Harness::new(at(2024, 1, 3, 9, 0));
    let id = h.seed(daily(at(2024, 1, 1, 9, 0)), at(2024, 1, 2, 9, 30));
    assert_eq!(h.stored(&id).unwrap().next_trigger(), Some(at(2024, 1, 3, 9, 0)));

    let outcome = h.settle();

    let shown = h.rec.shown();
    assert_eq!(shown.len(), 1);
    assert_eq!(shown[0].kind, SubAlarmKind::Main);
    assert_eq!(shown[0].trigger, at(2024, 1, 3, 9, 0));
    assert!(!shown[0].flags.forced);

    let stored = h.stored(&id).unwrap();
    assert_eq!(stored.next_trigger(), Some(at(2024, 1, 4, 9, 0)));
    assert_eq!(stored.last_triggered, Some(at(2024, 1, 3, 9, 0)));
    assert!(h.events.iter().any(|e| matches!(
        e,
        Event::AlarmRescheduled { next_trigger: Some(t), .. } if *t == at(2024, 1, 4, 9, 0)
    )));

    match outcome {
        DrainOutcome::Sleep(wake) => {
            assert_eq!(wake.at, at(2024, 1, 4, 9, 0));
            assert_eq!(wake.wait, MAX_WAIT);
        }
        other => panic!("expected to sleep until tomorrow, got {other:?}"),
    }
}

#[test]
fn missed_one_shot_beyond_late_cancel_is_archived() {
    let mut h = Harness::new(at(2024, 1, 1, 9, 20));
    let mut draft = AlarmDraft::new(display("Call back"), at(2024, 1, 1, 9, 0));
    draft.late_cancel_minutes = Some(10);
    draft.archive = true;
    let id = h.seed(draft, at(2024, 1, 1, 8, 0));

    assert_eq!(h.settle(), DrainOutcome::Idle);

    assert!(h.rec.shown().is_empty());
    assert!(h.fired(&id).is_empty());
    assert!(h.store.is_archived(&id));
    assert!(h.active_ids().is_empty());
    assert!(h
        .events
        .iter()
        .any(|e| matches!(e, Event::AlarmCancelled { id: c, archived: true, .. } if *c == id)));
}

#[test]
fn one_shot_within_late_cancel_fires_then_is_removed() {
    let mut h = Harness::new(at(2024, 1, 1, 9, 0) + Duration::seconds(545));
    let mut draft = AlarmDraft::new(display("Call back"), at(2024, 1, 1, 9, 0));
    draft.late_cancel_minutes = Some(10);
    let id = h.seed(draft, at(2024, 1, 1, 8, 0));

    h.settle();

    assert_eq!(h.fired(&id), vec![SubAlarmKind::Main]);
    // Exhausted and not archived: gone from the store.
    assert!(h.stored(&id).is_none());
}

#[test]
fn at_login_alarm_fires_once_per_start() {
    let mut h = Harness::new(at(2024, 1, 1, 8, 5));
    let mut draft = AlarmDraft::new(display("Check backups"), at(2024, 1, 5, 9, 0));
    draft.repeat_at_login = true;
    let id = h.seed(draft, at(2024, 1, 1, 8, 0));

    h.settle();
    assert!(h.engine.handle_by_id(&id, QueueMode::HandleIfDue));
    h.settle();
    h.settle();

    assert_eq!(h.fired(&id), vec![SubAlarmKind::AtLogin]);
    let shown = h.rec.shown();
    assert_eq!(shown.len(), 1);
    assert_eq!(shown[0].trigger, at(2024, 1, 1, 8, 5));
    // The main alarm is untouched.
    assert_eq!(h.stored(&id).unwrap().next_trigger(), Some(at(2024, 1, 5, 9, 0)));

    let mut next_login = h.restart();
    next_login.settle();
    assert_eq!(next_login.fired(&id), vec![SubAlarmKind::AtLogin]);
}

#[test]
fn only_one_sub_alarm_fires_per_pass() {
    let mut h = Harness::new(at(2024, 1, 1, 9, 0));
    let mut draft = daily(at(2024, 1, 1, 9, 0));
    draft.reminder_minutes = 15;
    let id = h.seed(draft, at(2024, 1, 1, 8, 0));
    let mut def = h.stored(&id).unwrap();
    def.set_sub_alarm(SubAlarmKind::Deferred, at(2024, 1, 1, 8, 55));
    h.store.clone().update_event(&def).unwrap();

    h.settle();

    assert_eq!(h.fired(&id), vec![SubAlarmKind::Main]);
    let stored = h.stored(&id).unwrap();
    assert!(stored.sub_alarm(SubAlarmKind::Deferred).is_none());
    assert_eq!(
        stored.sub_alarm(SubAlarmKind::Reminder).map(|a| a.trigger),
        Some(at(2024, 1, 2, 8, 45))
    );
    assert_eq!(
        stored.sub_alarm(SubAlarmKind::Main).map(|a| a.trigger),
        Some(at(2024, 1, 2, 9, 0))
    );
}

#[test]
fn reminder_fires_before_main_alarm() {
    let mut h = Harness::new(at(2024, 1, 1, 8, 0));
    let mut draft = AlarmDraft::new(display("Dentist"), at(2024, 1, 1, 9, 0));
    draft.reminder_minutes = 15;
    let id = h.seed(draft, at(2024, 1, 1, 8, 0));

    h.set_now(at(2024, 1, 1, 8, 45));
    h.settle();
    h.set_now(at(2024, 1, 1, 9, 0));
    h.settle();

    assert_eq!(h.fired(&id), vec![SubAlarmKind::Reminder, SubAlarmKind::Main]);
    let shown = h.rec.shown();
    assert!(shown[0].flags.reminder);
    assert!(!shown[1].flags.reminder);
}

#[test]
fn duplicate_handle_requests_are_merged() {
    let mut h = Harness::new(at(2024, 1, 1, 8, 0));
    let id = h.seed(daily(at(2024, 1, 1, 9, 0)), at(2024, 1, 1, 8, 0));

    assert!(h.engine.handle_by_id(&id, QueueMode::HandleIfDue));
    assert!(!h.engine.handle_by_id(&id, QueueMode::HandleIfDue));
    assert!(h.engine.handle_by_id(&id, QueueMode::Trigger));
    assert_eq!(h.engine.queue_len(), 2);
}

#[test]
fn unknown_id_is_not_queued() {
    let mut h = Harness::new(at(2024, 1, 1, 8, 0));
    assert!(!h.engine.handle_by_id(&"missing".into(), QueueMode::Trigger));
    assert_eq!(h.engine.queue_len(), 0);
}

#[test]
fn explicit_trigger_fires_without_rescheduling() {
    let mut h = Harness::new(at(2024, 1, 1, 8, 0));
    let id = h.seed(daily(at(2024, 1, 1, 9, 0)), at(2024, 1, 1, 8, 0));

    assert!(h.engine.handle_by_id(&id, QueueMode::Trigger));
    h.settle();

    let shown = h.rec.shown();
    assert_eq!(shown.len(), 1);
    assert!(shown[0].flags.forced);
    let stored = h.stored(&id).unwrap();
    assert_eq!(stored.next_trigger(), Some(at(2024, 1, 1, 9, 0)));
    assert_eq!(stored.last_triggered, None);
}

#[test]
fn working_time_alarm_skips_the_weekend() {
    // 2024-01-05 is a Friday; default working days are Monday to Friday.
    let mut h = Harness::new(at(2024, 1, 5, 10, 0));
    let mut draft = daily(at(2024, 1, 5, 10, 0));
    draft.work_time_only = true;
    let id = h.seed(draft, at(2024, 1, 5, 9, 0));

    h.settle();

    assert_eq!(h.fired(&id), vec![SubAlarmKind::Main]);
    assert_eq!(h.stored(&id).unwrap().next_trigger(), Some(at(2024, 1, 8, 10, 0)));
}

#[test]
fn disabled_alarms_are_suppressed_but_still_advance() {
    let mut h = Harness::new(at(2024, 1, 1, 9, 0));
    let mut draft = daily(at(2024, 1, 1, 9, 0));
    draft.enabled = false;
    let off = h.seed(draft, at(2024, 1, 1, 8, 0));

    h.settle();

    assert!(h.rec.shown().is_empty());
    assert!(h
        .events
        .iter()
        .any(|e| matches!(e, Event::AlarmSuppressed { id, .. } if *id == off)));
    assert_eq!(h.stored(&off).unwrap().next_trigger(), Some(at(2024, 1, 2, 9, 0)));
}

#[test]
fn global_switch_suppresses_every_alarm() {
    let mut h = Harness::new(at(2024, 1, 1, 9, 0));
    let id = h.seed(daily(at(2024, 1, 1, 9, 0)), at(2024, 1, 1, 8, 0));
    assert!(h.handle.set_globally_enabled(false));

    h.settle();

    assert!(!h.engine.globally_enabled());
    assert!(h.rec.shown().is_empty());
    assert_eq!(h.stored(&id).unwrap().next_trigger(), Some(at(2024, 1, 2, 9, 0)));
}

#[test]
fn deferral_fires_at_requested_time_and_keeps_main() {
    let mut h = Harness::new(at(2024, 1, 1, 9, 0));
    let id = h.seed(
        AlarmDraft::new(display("Lunch"), at(2024, 1, 1, 12, 0)),
        at(2024, 1, 1, 8, 0),
    );

    assert!(h.engine.defer(&id, at(2024, 1, 1, 9, 30), false));
    match h.settle() {
        DrainOutcome::Sleep(wake) => assert_eq!(wake.at, at(2024, 1, 1, 9, 30)),
        other => panic!("expected sleep, got {other:?}"),
    }

    h.set_now(at(2024, 1, 1, 9, 30));
    h.settle();

    assert_eq!(h.fired(&id), vec![SubAlarmKind::Deferred]);
    assert!(h.rec.shown()[0].flags.deferred);
    let stored = h.stored(&id).unwrap();
    assert!(stored.sub_alarm(SubAlarmKind::Deferred).is_none());
    assert_eq!(stored.next_trigger(), Some(at(2024, 1, 1, 12, 0)));
}

#[test]
fn command_alarm_reschedules_after_the_command_exits() {
    let mut h = Harness::new(at(2024, 1, 1, 9, 0));
    let mut draft = AlarmDraft::new(
        AlarmAction::Command {
            command: "backup.sh".into(),
            script: false,
            in_terminal: false,
        },
        at(2024, 1, 1, 9, 0),
    );
    draft.recurrence = Some(Recurrence::daily(1));
    let id = h.seed(draft, at(2024, 1, 1, 8, 0));

    // While the command runs the alarm is busy and not picked up again.
    assert_eq!(h.settle(), DrainOutcome::Idle);
    assert!(h.engine.is_busy(&id));
    let commands = h.rec.commands();
    assert_eq!(commands.len(), 1);
    assert!(commands[0]
        .env
        .contains(&("CHIME_ALARM_ID".to_string(), id.to_string())));
    assert_eq!(h.stored(&id).unwrap().next_trigger(), Some(at(2024, 1, 1, 9, 0)));

    h.set_now(at(2024, 1, 1, 9, 1));
    assert!(h.handle.command_finished(
        commands[0].handle,
        ProcessStatus {
            success: false,
            code: Some(2),
            output: String::new(),
        },
    ));
    h.settle();

    assert!(!h.engine.is_busy(&id));
    assert_eq!(h.engine.pending_dispatches(), 0);
    assert!(h.events.iter().any(|e| matches!(
        e,
        Event::ActionFailed { stage: ActionStage::Command, .. }
    )));
    assert_eq!(h.stored(&id).unwrap().next_trigger(), Some(at(2024, 1, 2, 9, 0)));
}

#[test]
fn quit_waits_for_outstanding_dispatches() {
    let mut h = Harness::new(at(2024, 1, 1, 9, 0));
    h.seed(
        AlarmDraft::new(
            AlarmAction::Command {
                command: "sleep 5".into(),
                script: false,
                in_terminal: false,
            },
            at(2024, 1, 1, 9, 0),
        ),
        at(2024, 1, 1, 8, 0),
    );
    h.settle();
    assert!(h.handle.request_quit());
    assert_ne!(h.drain(), DrainOutcome::Quit);

    let handle = h.rec.commands()[0].handle;
    h.handle.command_finished(
        handle,
        ProcessStatus {
            success: true,
            code: Some(0),
            output: String::new(),
        },
    );
    assert_eq!(h.drain(), DrainOutcome::Quit);
}

#[test]
fn new_alarm_is_scheduled_through_the_queue() {
    let mut h = Harness::new(at(2024, 1, 1, 8, 0));
    let id = h
        .engine
        .schedule_new(daily(at(2024, 1, 1, 9, 0)))
        .unwrap();
    assert!(h.stored(&id).is_none());

    h.settle();

    assert_eq!(h.stored(&id).unwrap().next_trigger(), Some(at(2024, 1, 1, 9, 0)));
    assert!(matches!(h.events[0], Event::AlarmScheduled { .. }));
    let listed = h.engine.list_scheduled().unwrap();
    assert_eq!(listed.len(), 1);
    assert!(listed[0].recurring);
    assert_eq!(h.engine.resolve_id(&id.as_str()[..8]).unwrap(), id);
}

#[test]
fn cancel_request_deletes_or_archives() {
    let mut h = Harness::new(at(2024, 1, 1, 8, 0));
    let plain = h.seed(daily(at(2024, 1, 1, 9, 0)), at(2024, 1, 1, 8, 0));
    let mut draft = daily(at(2024, 1, 1, 9, 0));
    draft.archive = true;
    let kept = h.seed(draft, at(2024, 1, 1, 8, 0));

    h.engine.handle_by_id(&plain, QueueMode::Cancel);
    h.engine.handle_by_id(&kept, QueueMode::Cancel);
    assert_eq!(h.settle(), DrainOutcome::Idle);

    assert!(h.stored(&plain).is_none());
    assert!(h.store.is_archived(&kept));
    assert!(h.rec.shown().is_empty());
}

#[test]
fn store_write_failure_is_reported_not_fatal() {
    let mut h = Harness::new(at(2024, 1, 1, 8, 0));
    h.store.set_fail_writes(true);
    let id = h
        .engine
        .schedule_new(daily(at(2024, 1, 1, 9, 0)))
        .unwrap();

    h.settle();

    assert!(h.stored(&id).is_none());
    assert!(h
        .events
        .iter()
        .any(|e| matches!(e, Event::StoreUnavailable { .. })));
}

#[test]
fn archive_purge_follows_configured_retention() {
    let mut prefs = chime_core::Preferences::default();
    prefs.alarms.archive_purge_days = 7;
    let mut h = Harness::with_prefs(at(2024, 1, 1, 9, 20), prefs);
    let mut draft = AlarmDraft::new(display("Old"), at(2024, 1, 1, 9, 0));
    draft.late_cancel_minutes = Some(1);
    draft.archive = true;
    let id = h.seed(draft, at(2024, 1, 1, 8, 0));
    h.settle();
    assert!(h.store.is_archived(&id));

    h.set_now(at(2024, 1, 9, 9, 0));
    h.engine.request_archive_purge();
    h.settle();

    assert!(h.stored(&id).is_none());
    assert!(h
        .events
        .iter()
        .any(|e| matches!(e, Event::ArchivePurged { count: 1, .. })));
}

#[test]
fn forced_trigger_of_login_alarm_leaves_schedule_alone() {
    let mut h = Harness::new(at(2024, 1, 1, 8, 5));
    let mut draft = AlarmDraft::new(display("Check backups"), at(2024, 1, 5, 9, 0));
    draft.repeat_at_login = true;
    draft.reminder_minutes = -10;
    let id = h.seed(draft, at(2024, 1, 1, 8, 0));
    let before = h.stored(&id).unwrap();

    h.engine.skip_login_alarms();
    assert!(h.engine.handle_by_id(&id, QueueMode::Trigger));
    h.settle();

    assert_eq!(h.fired(&id), vec![SubAlarmKind::Main]);
    let shown = h.rec.shown();
    assert_eq!(shown.len(), 1);
    assert!(shown[0].flags.forced);
    let stored = h.stored(&id).unwrap();
    assert!(stored.sub_alarm(SubAlarmKind::Reminder).is_none());
    assert_eq!(stored, before);
}

#[test]
fn cancel_while_command_runs_applies_once_it_exits() {
    let mut h = Harness::new(at(2024, 1, 1, 9, 0));
    let id = h.seed(daily_command("backup.sh"), at(2024, 1, 1, 8, 0));
    h.settle();
    assert!(h.engine.is_busy(&id));

    assert!(h.engine.handle_by_id(&id, QueueMode::Cancel));
    h.settle();
    // Held until the running command finishes.
    assert!(h.stored(&id).is_some());

    h.set_now(at(2024, 1, 1, 9, 1));
    let handle = h.rec.commands()[0].handle;
    assert!(h.handle.command_finished(handle, exit(true)));
    assert_eq!(h.settle(), DrainOutcome::Idle);

    assert!(h.stored(&id).is_none());
    assert!(h.active_ids().is_empty());
    assert!(h
        .events
        .iter()
        .any(|e| matches!(e, Event::AlarmCancelled { id: c, .. } if *c == id)));
}

#[test]
fn defer_and_trigger_while_busy_run_in_order_after_completion() {
    let mut h = Harness::new(at(2024, 1, 1, 9, 0));
    let id = h.seed(daily_command("backup.sh"), at(2024, 1, 1, 8, 0));
    h.settle();

    assert!(h.engine.defer(&id, at(2024, 1, 1, 10, 0), false));
    assert!(h.engine.handle_by_id(&id, QueueMode::Trigger));
    h.settle();
    assert_eq!(h.rec.commands().len(), 1);
    assert!(!h.events.iter().any(|e| matches!(e, Event::AlarmDeferred { .. })));

    h.set_now(at(2024, 1, 1, 9, 1));
    let handle = h.rec.commands()[0].handle;
    assert!(h.handle.command_finished(handle, exit(true)));
    h.settle();

    let stored = h.stored(&id).unwrap();
    assert_eq!(
        stored.sub_alarm(SubAlarmKind::Deferred).map(|a| a.trigger),
        Some(at(2024, 1, 1, 10, 0))
    );
    assert_eq!(
        stored.sub_alarm(SubAlarmKind::Main).map(|a| a.trigger),
        Some(at(2024, 1, 2, 9, 0))
    );
    // The held trigger ran the command a second time.
    assert_eq!(h.rec.commands().len(), 2);
    assert!(h
        .events
        .iter()
        .any(|e| matches!(e, Event::AlarmFired { forced: true, .. })));
    assert!(h.engine.is_busy(&id));
}

fn display_with_pre_action(cancel_on_error: bool) -> AlarmDraft {
    let mut draft = daily(at(2024, 1, 1, 9, 0));
    draft.pre_action = Some(PreAction {
        command: "mount /backup".into(),
        cancel_on_error,
        execute_on_deferral: false,
    });
    draft
}

#[test]
fn failed_pre_action_with_cancel_on_error_skips_display_and_advances() {
    let mut h = Harness::new(at(2024, 1, 1, 9, 0));
    let id = h.seed(display_with_pre_action(true), at(2024, 1, 1, 8, 0));

    assert_eq!(h.settle(), DrainOutcome::Idle);
    let commands = h.rec.commands();
    assert_eq!(commands.len(), 1);
    assert_eq!(commands[0].command, CommandLine::Shell("mount /backup".into()));
    assert!(h.rec.shown().is_empty());

    h.set_now(at(2024, 1, 1, 9, 1));
    assert!(h.handle.command_finished(commands[0].handle, exit(false)));
    h.settle();

    assert!(h.rec.shown().is_empty());
    assert!(!h.engine.is_busy(&id));
    assert!(h.events.iter().any(|e| matches!(
        e,
        Event::ActionFailed { stage: ActionStage::PreAction, .. }
    )));
    assert_eq!(h.stored(&id).unwrap().next_trigger(), Some(at(2024, 1, 2, 9, 0)));
}

#[test]
fn failed_pre_action_without_cancel_on_error_still_shows() {
    let mut h = Harness::new(at(2024, 1, 1, 9, 0));
    let id = h.seed(display_with_pre_action(false), at(2024, 1, 1, 8, 0));
    h.settle();
    assert!(h.rec.shown().is_empty());

    h.set_now(at(2024, 1, 1, 9, 1));
    let handle = h.rec.commands()[0].handle;
    assert!(h.handle.command_finished(handle, exit(false)));
    h.settle();

    let shown = h.rec.shown();
    assert_eq!(shown.len(), 1);
    assert_eq!(shown[0].kind, SubAlarmKind::Main);
    assert!(h.events.iter().any(|e| matches!(
        e,
        Event::ActionFailed { stage: ActionStage::PreAction, .. }
    )));
    assert_eq!(h.stored(&id).unwrap().next_trigger(), Some(at(2024, 1, 2, 9, 0)));
}

#[test]
fn queued_email_reschedules_on_completion_then_runs_post_action() {
    let mut h = Harness::new(at(2024, 1, 1, 9, 0));
    h.rec.queue_mail.store(true, std::sync::atomic::Ordering::SeqCst);
    let mut draft = AlarmDraft::new(
        AlarmAction::Email {
            to: vec!["me@example.com".into()],
            subject: "Timesheet".into(),
            body: "Fill it in".into(),
            bcc: false,
        },
        at(2024, 1, 1, 9, 0),
    );
    draft.recurrence = Some(Recurrence::daily(1));
    draft.post_action = Some("echo sent".into());
    let id = h.seed(draft, at(2024, 1, 1, 8, 0));

    h.settle();
    let mails = h.rec.mails();
    assert_eq!(mails.len(), 1);
    assert!(h.engine.is_busy(&id));
    assert!(h.rec.commands().is_empty());
    assert_eq!(h.stored(&id).unwrap().next_trigger(), Some(at(2024, 1, 1, 9, 0)));

    h.set_now(at(2024, 1, 1, 9, 1));
    assert!(h.handle.mail_finished(mails[0].handle, Ok(())));
    h.settle();

    assert!(!h.engine.is_busy(&id));
    assert_eq!(h.stored(&id).unwrap().next_trigger(), Some(at(2024, 1, 2, 9, 0)));
    let commands = h.rec.commands();
    assert_eq!(commands.len(), 1);
    assert_eq!(commands[0].command, CommandLine::Shell("echo sent".into()));
    assert_eq!(h.engine.pending_dispatches(), 1);
}

#[test]
fn closing_the_window_runs_the_post_action() {
    let mut h = Harness::new(at(2024, 1, 1, 9, 0));
    let mut draft = daily(at(2024, 1, 1, 9, 0));
    draft.post_action = Some("log-closed".into());
    let id = h.seed(draft, at(2024, 1, 1, 8, 0));

    h.settle();
    assert_eq!(h.rec.shown().len(), 1);
    assert!(h.rec.commands().is_empty());

    assert!(h.handle.window_closed(id.clone()));
    h.settle();
    let commands = h.rec.commands();
    assert_eq!(commands.len(), 1);
    assert_eq!(commands[0].command, CommandLine::Shell("log-closed".into()));
    assert_eq!(commands[0].alarm_id, id);

    // A second close has nothing left to run.
    assert!(h.handle.window_closed(id));
    h.settle();
    assert_eq!(h.rec.commands().len(), 1);
}
