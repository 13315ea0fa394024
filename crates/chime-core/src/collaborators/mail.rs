//! Email delivery through a local sendmail binary.

use std::process::Stdio;

use chrono::{DateTime, Local};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use super::traits::{BoxError, EmailJob, MailOutcome, MailSender};
use crate::engine::EngineHandle;

/// Render `job` as an RFC 5322 message.
pub fn format_message(from: &str, job: &EmailJob, date: DateTime<Local>) -> String {
    let mut message = String::new();
    if !from.is_empty() {
        message.push_str(&format!("From: {from}\r\n"));
    }
    message.push_str(&format!("To: {}\r\n", job.to.join(", ")));
    if job.bcc && !from.is_empty() {
        message.push_str(&format!("Bcc: {from}\r\n"));
    }
    message.push_str(&format!("Subject: {}\r\n", job.subject));
    message.push_str(&format!("Date: {}\r\n", date.to_rfc2822()));
    message.push_str("MIME-Version: 1.0\r\n");
    message.push_str("Content-Type: text/plain; charset=utf-8\r\n");
    message.push_str("Content-Transfer-Encoding: 8bit\r\n");
    message.push_str(&format!("X-Chime-Alarm: {}\r\n", job.alarm_id));
    message.push_str("\r\n");
    for line in job.body.lines() {
        message.push_str(line);
        message.push_str("\r\n");
    }
    message
}

/// Hands messages to `sendmail -t` and reports the exit through the engine
/// handle. Every accepted job is [`MailOutcome::Queued`].
pub struct SendmailMailer {
    engine: EngineHandle,
    sendmail_path: String,
    from_address: String,
}

impl SendmailMailer {
    pub fn new(
        engine: EngineHandle,
        sendmail_path: impl Into<String>,
        from_address: impl Into<String>,
    ) -> Self {
        Self {
            engine,
            sendmail_path: sendmail_path.into(),
            from_address: from_address.into(),
        }
    }
}

impl MailSender for SendmailMailer {
    fn send(&mut self, job: EmailJob) -> Result<MailOutcome, BoxError> {
        if job.to.is_empty() {
            return Err("email alarm has no recipients".into());
        }
        let runtime = tokio::runtime::Handle::try_current()?;
        let _guard = runtime.enter();
        let message = format_message(&self.from_address, &job, Local::now());

        let mut child = tokio::process::Command::new(&self.sendmail_path)
            .args(["-oi", "-t"])
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| format!("failed to start {}: {e}", self.sendmail_path))?;
        let mut stdin = child
            .stdin
            .take()
            .ok_or("sendmail stdin unavailable")?;
        debug!(alarm_id = %job.alarm_id, recipients = job.to.len(), "queued alarm email");

        let engine = self.engine.clone();
        let handle = job.handle;
        let alarm_id = job.alarm_id;
        runtime.spawn(async move {
            let written = stdin.write_all(message.as_bytes()).await;
            drop(stdin);
            let result = match (written, child.wait_with_output().await) {
                (Err(e), _) => Err(format!("writing message failed: {e}")),
                (_, Err(e)) => Err(format!("sendmail failed: {e}")),
                (Ok(()), Ok(output)) if output.status.success() => Ok(()),
                (Ok(()), Ok(output)) => Err(format!(
                    "sendmail exited with {}: {}",
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                )),
            };
            if let Err(e) = &result {
                warn!(alarm_id = %alarm_id, error = %e, "alarm email not delivered");
            }
            engine.mail_finished(handle, result);
        });
        Ok(MailOutcome::Queued)
    }
}
