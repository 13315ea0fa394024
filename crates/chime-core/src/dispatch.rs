//! Dispatch boundary.
//!
//! Turns "this sub-alarm fires now" into calls on the presentation, process
//! and mail collaborators. Nothing here waits: anything asynchronous returns
//! [`DispatchStatus::Awaiting`] and finishes later through a [`FollowUp`].

use tracing::{info, warn};

use crate::alarm::{AlarmAction, AlarmDefinition, AlarmId, SubAlarm};
use crate::collaborators::{
    BoxError, CommandLine, CommandRequest, DisplayFlags, EmailJob, MailOutcome, MailSender,
    ProcessRunner, ProcessStatus, Presenter,
};
use crate::error::ActionStage;

/// Correlates an asynchronous dispatch with its completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DispatchHandle(pub u64);

/// Completion of something a dispatch started.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FollowUp {
    CommandExited {
        handle: DispatchHandle,
        status: ProcessStatus,
    },
    MailFinished {
        handle: DispatchHandle,
        result: Result<(), String>,
    },
    WindowClosed {
        id: AlarmId,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AwaitStage {
    PreAction,
    Command,
    Email,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchStatus {
    /// Fully handled; mutations can be applied now.
    Done,
    Awaiting(DispatchHandle, AwaitStage),
    /// The firing was abandoned.
    Aborted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionFailure {
    pub stage: ActionStage,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchReport {
    pub status: DispatchStatus,
    pub failures: Vec<ActionFailure>,
}

impl DispatchReport {
    fn done() -> Self {
        Self {
            status: DispatchStatus::Done,
            failures: Vec::new(),
        }
    }

    fn failed(status: DispatchStatus, stage: ActionStage, err: BoxError) -> Self {
        Self {
            status,
            failures: vec![ActionFailure {
                stage,
                message: err.to_string(),
            }],
        }
    }
}

/// Per-firing options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FireOptions {
    pub forced: bool,
    /// Run pre-actions for deferred firings even if the alarm doesn't ask to.
    pub pre_action_on_deferral: bool,
}

pub struct Dispatcher {
    presenter: Box<dyn Presenter>,
    runner: Box<dyn ProcessRunner>,
    mailer: Box<dyn MailSender>,
    next_handle: u64,
}

impl Dispatcher {
    pub fn new(
        presenter: Box<dyn Presenter>,
        runner: Box<dyn ProcessRunner>,
        mailer: Box<dyn MailSender>,
    ) -> Self {
        Self {
            presenter,
            runner,
            mailer,
            next_handle: 1,
        }
    }

    fn handle(&mut self) -> DispatchHandle {
        let handle = DispatchHandle(self.next_handle);
        self.next_handle += 1;
        handle
    }

    pub fn flags_for(def: &AlarmDefinition, alarm: &SubAlarm, opts: FireOptions) -> DisplayFlags {
        DisplayFlags {
            reminder: alarm.kind.is_reminder(),
            deferred: alarm.kind.is_deferral(),
            audio_only: matches!(def.action, AlarmAction::Audio { .. }),
            forced: opts.forced,
        }
    }

    pub fn dispatch(
        &mut self,
        def: &AlarmDefinition,
        alarm: &SubAlarm,
        opts: FireOptions,
    ) -> DispatchReport {
        info!(alarm_id = %def.id, kind = ?alarm.kind, forced = opts.forced, "firing alarm");
        match &def.action {
            AlarmAction::Display { .. } | AlarmAction::File { .. } => {
                if let Some(report) = self.reuse_window(def, alarm) {
                    return report;
                }
                match &def.pre_action {
                    Some(pre)
                        if !alarm.kind.is_deferral()
                            || pre.execute_on_deferral
                            || opts.pre_action_on_deferral =>
                    {
                        let handle = self.handle();
                        let request = command_request(handle, def, CommandLine::Shell(pre.command.clone()), false);
                        match self.runner.run(request) {
                            Ok(()) => DispatchReport {
                                status: DispatchStatus::Awaiting(handle, AwaitStage::PreAction),
                                failures: Vec::new(),
                            },
                            Err(e) if pre.cancel_on_error => {
                                warn!(alarm_id = %def.id, error = %e, "pre-alarm action failed, firing aborted");
                                DispatchReport::failed(DispatchStatus::Aborted, ActionStage::PreAction, e)
                            }
                            Err(e) => {
                                warn!(alarm_id = %def.id, error = %e, "pre-alarm action failed");
                                let mut report = self.show(def, alarm, opts);
                                report.failures.insert(
                                    0,
                                    ActionFailure {
                                        stage: ActionStage::PreAction,
                                        message: e.to_string(),
                                    },
                                );
                                report
                            }
                        }
                    }
                    _ => self.show(def, alarm, opts),
                }
            }
            AlarmAction::Audio { .. } => {
                let result = if self.presenter.find_by_definition_id(&def.id).is_some() {
                    self.presenter.repeat(def, alarm)
                } else {
                    let flags = Self::flags_for(def, alarm, opts);
                    self.presenter.open(def, alarm, flags)
                };
                match result {
                    Ok(()) => DispatchReport::done(),
                    Err(e) => DispatchReport::failed(DispatchStatus::Done, ActionStage::Display, e),
                }
            }
            AlarmAction::Command {
                command,
                script,
                in_terminal,
            } => {
                let handle = self.handle();
                let line = if *script {
                    CommandLine::Script(command.clone())
                } else {
                    CommandLine::Shell(command.clone())
                };
                match self.runner.run(command_request(handle, def, line, *in_terminal)) {
                    Ok(()) => DispatchReport {
                        status: DispatchStatus::Awaiting(handle, AwaitStage::Command),
                        failures: Vec::new(),
                    },
                    Err(e) => {
                        warn!(alarm_id = %def.id, error = %e, "command could not be started");
                        DispatchReport::failed(DispatchStatus::Done, ActionStage::Command, e)
                    }
                }
            }
            AlarmAction::Email {
                to,
                subject,
                body,
                bcc,
            } => {
                let handle = self.handle();
                let job = EmailJob {
                    handle,
                    alarm_id: def.id.clone(),
                    to: to.clone(),
                    subject: subject.clone(),
                    body: body.clone(),
                    bcc: *bcc,
                };
                match self.mailer.send(job) {
                    Ok(MailOutcome::Sent) => DispatchReport::done(),
                    Ok(MailOutcome::Queued) => DispatchReport {
                        status: DispatchStatus::Awaiting(handle, AwaitStage::Email),
                        failures: Vec::new(),
                    },
                    Err(e) => {
                        warn!(alarm_id = %def.id, error = %e, "email could not be sent");
                        DispatchReport::failed(DispatchStatus::Done, ActionStage::Email, e)
                    }
                }
            }
        }
    }

    /// Upgrade or replay the definition's open window, if there is one.
    fn reuse_window(&mut self, def: &AlarmDefinition, alarm: &SubAlarm) -> Option<DispatchReport> {
        let window = self.presenter.find_by_definition_id(&def.id)?;
        let result = if window.showing_reminder && !alarm.kind.is_reminder() {
            self.presenter.cancel_reminder(def, alarm)
        } else {
            self.presenter.repeat(def, alarm)
        };
        Some(match result {
            Ok(()) => DispatchReport::done(),
            Err(e) => DispatchReport::failed(DispatchStatus::Done, ActionStage::Display, e),
        })
    }

    /// Open the alarm window, once any pre-action has finished. A window
    /// opened for the definition in the meantime is reused.
    pub fn show(&mut self, def: &AlarmDefinition, alarm: &SubAlarm, opts: FireOptions) -> DispatchReport {
        if let Some(report) = self.reuse_window(def, alarm) {
            return report;
        }
        let flags = Self::flags_for(def, alarm, opts);
        match self.presenter.open(def, alarm, flags) {
            Ok(()) => DispatchReport::done(),
            Err(e) => DispatchReport::failed(DispatchStatus::Done, ActionStage::Display, e),
        }
    }

    /// Start the definition's post-alarm action, if it has one.
    pub fn run_post_action(&mut self, def: &AlarmDefinition) -> Result<Option<DispatchHandle>, BoxError> {
        let Some(command) = &def.post_action else {
            return Ok(None);
        };
        let handle = self.handle();
        self.runner
            .run(command_request(handle, def, CommandLine::Shell(command.clone()), false))?;
        Ok(Some(handle))
    }
}

fn command_request(
    handle: DispatchHandle,
    def: &AlarmDefinition,
    command: CommandLine,
    in_terminal: bool,
) -> CommandRequest {
    CommandRequest {
        handle,
        alarm_id: def.id.clone(),
        command,
        env: vec![("CHIME_ALARM_ID".to_string(), def.id.to_string())],
        in_terminal,
    }
}
