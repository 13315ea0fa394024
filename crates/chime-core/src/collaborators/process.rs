//! Command execution with tokio.

use std::io::Write;
use std::process::Stdio;

use tempfile::TempPath;
use tracing::{debug, warn};

use super::traits::{BoxError, CommandLine, CommandRequest, ProcessRunner, ProcessStatus};
use crate::engine::EngineHandle;

/// Placeholder for the command in a terminal template.
pub const TERMINAL_PLACEHOLDER: &str = "%c";

/// Put `command` into a terminal template: `%c` is replaced, otherwise the
/// command is appended.
pub fn compose_terminal_command(template: &str, command: &str) -> String {
    if template.contains(TERMINAL_PLACEHOLDER) {
        template.replace(TERMINAL_PLACEHOLDER, command)
    } else {
        format!("{} {}", template.trim_end(), command)
    }
}

/// Write a script body to an executable temporary file. The file is removed
/// when the returned path is dropped.
pub fn materialize_script(body: &str) -> std::io::Result<TempPath> {
    let mut file = tempfile::Builder::new()
        .prefix("chime-")
        .suffix(".sh")
        .tempfile()?;
    if !body.starts_with("#!") {
        writeln!(file, "#!/bin/sh")?;
    }
    file.write_all(body.as_bytes())?;
    if !body.ends_with('\n') {
        writeln!(file)?;
    }
    file.flush()?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(file.path(), std::fs::Permissions::from_mode(0o700))?;
    }

    Ok(file.into_temp_path())
}

/// Runs alarm commands as child processes and reports each exit through the
/// engine handle.
pub struct TokioProcessRunner {
    engine: EngineHandle,
    shell: String,
    terminal_command: String,
}

impl TokioProcessRunner {
    pub fn new(engine: EngineHandle, terminal_command: impl Into<String>) -> Self {
        Self {
            engine,
            shell: "/bin/sh".to_string(),
            terminal_command: terminal_command.into(),
        }
    }

    /// Shell line to execute, plus the script file it needs kept alive.
    fn prepare(&self, request: &CommandRequest) -> Result<(String, Option<TempPath>), BoxError> {
        let (line, script) = match &request.command {
            CommandLine::Shell(command) => (command.clone(), None),
            CommandLine::Script(body) => {
                let path = materialize_script(body)?;
                (path.display().to_string(), Some(path))
            }
        };
        let line = if request.in_terminal {
            compose_terminal_command(&self.terminal_command, &line)
        } else {
            line
        };
        Ok((line, script))
    }
}

impl ProcessRunner for TokioProcessRunner {
    fn run(&mut self, request: CommandRequest) -> Result<(), BoxError> {
        let runtime = tokio::runtime::Handle::try_current()?;
        let _guard = runtime.enter();
        let (line, script) = self.prepare(&request)?;
        debug!(alarm_id = %request.alarm_id, command = %line, "spawning alarm command");

        let child = tokio::process::Command::new(&self.shell)
            .arg("-c")
            .arg(&line)
            .envs(request.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        let engine = self.engine.clone();
        let handle = request.handle;
        let alarm_id = request.alarm_id;
        runtime.spawn(async move {
            // The script must outlive the process.
            let _script = script;
            let status = match child.wait_with_output().await {
                Ok(output) => ProcessStatus {
                    success: output.status.success(),
                    code: output.status.code(),
                    output: String::from_utf8_lossy(&output.stdout).into_owned(),
                },
                Err(e) => {
                    warn!(alarm_id = %alarm_id, error = %e, "waiting for alarm command failed");
                    ProcessStatus {
                        success: false,
                        code: None,
                        output: e.to_string(),
                    }
                }
            };
            debug!(alarm_id = %alarm_id, code = ?status.code, "alarm command finished");
            engine.command_finished(handle, status);
        });
        Ok(())
    }
}
