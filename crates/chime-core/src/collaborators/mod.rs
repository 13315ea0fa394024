//! Collaborator interfaces the engine drives, with the reference
//! implementations used by the command-line front end.

pub mod mail;
pub mod presenter;
pub mod process;
mod traits;

pub use mail::SendmailMailer;
pub use presenter::TerminalPresenter;
pub use process::TokioProcessRunner;
pub use traits::{
    AlarmStore, BoxError, CommandLine, CommandRequest, DisplayFlags, EmailJob, MailOutcome,
    MailSender, Presenter, ProcessRunner, ProcessStatus, WindowState,
};
