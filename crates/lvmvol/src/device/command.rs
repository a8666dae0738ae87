//! External command invocation.

use std::ffi::OsStr;
use std::process::Command;

use lvmvol_common::{VolumeError, VolumeResult};

/// Run `program` with `args`, returning its stdout.
///
/// A failed command is logged with its exit status and combined output;
/// the returned error carries only the status.
pub(crate) fn run<I, S>(program: &str, args: I) -> VolumeResult<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let mut cmd = Command::new(program);
    cmd.args(args);
    tracing::debug!(command = ?cmd, "Running command");

    let output = cmd.output().map_err(|e| {
        tracing::error!(program, error = %e, "Failed to execute command");
        VolumeError::Command {
            program: program.to_string(),
            detail: e.to_string(),
        }
    })?;

    if !output.status.success() {
        tracing::error!(
            program,
            status = %output.status,
            stdout = %String::from_utf8_lossy(&output.stdout).trim(),
            stderr = %String::from_utf8_lossy(&output.stderr).trim(),
            "Command failed"
        );
        return Err(VolumeError::Command {
            program: program.to_string(),
            detail: output.status.to_string(),
        });
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Whether `program` can be executed, probed by running it with `probe_arg`.
pub(crate) fn available(program: &str, probe_arg: &str) -> bool {
    Command::new(program)
        .arg(probe_arg)
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}
