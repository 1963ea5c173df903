//! Runs a single shell command as a subprocess.

use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::Path;
use std::process::{Command, Stdio};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    Success,
    Interrupted,
    Failure,
}

pub struct CommandOutput {
    pub termination: Termination,
    /// Human-readable exit status, e.g. "exit status 1" or "signal 15".
    pub status: String,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

/// Run `cmdline` through /bin/sh in `dir`, capturing stdout and stderr
/// separately.  The child leads its own process group, so kill_group()
/// reaches everything the shell starts.  `on_spawn` receives the pid before
/// we block on the child.
pub fn run_command(
    cmdline: &str,
    dir: &Path,
    on_spawn: impl FnOnce(u32),
) -> anyhow::Result<CommandOutput> {
    let child = Command::new("/bin/sh")
        .arg("-c")
        .arg(cmdline)
        .current_dir(dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0)
        .spawn()
        .map_err(|err| anyhow::anyhow!("spawn /bin/sh: {}", err))?;
    on_spawn(child.id());
    let output = child.wait_with_output()?;

    let (termination, status) = if output.status.success() {
        (Termination::Success, "exit status 0".to_string())
    } else if let Some(sig) = output.status.signal() {
        let termination = match sig {
            libc::SIGINT | libc::SIGTERM | libc::SIGKILL => Termination::Interrupted,
            _ => Termination::Failure,
        };
        (termination, format!("signal {}", sig))
    } else {
        (
            Termination::Failure,
            format!("exit status {}", output.status.code().unwrap_or(-1)),
        )
    };

    Ok(CommandOutput {
        termination,
        status,
        stdout: output.stdout,
        stderr: output.stderr,
    })
}

/// Ask a command's whole process group to terminate.
pub fn kill_group(pid: u32) {
    // Safety: kill() has no memory-safety preconditions.
    let ret = unsafe { libc::kill(-(pid as libc::pid_t), libc::SIGTERM) };
    if ret < 0 {
        tracing::debug!(
            "kill {}: {}",
            pid,
            std::io::Error::last_os_error()
        );
    }
}
