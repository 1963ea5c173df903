//! Build progress tracking and reporting.

use crate::process::{CommandOutput, Termination};

/// Trait for build progress notifications.
pub trait Progress: Send {
    /// Called when a command starts.
    fn task_started(&mut self, cmdline: &str);

    /// Called when a command completes, with its captured output.
    fn task_finished(&mut self, cmdline: &str, result: &CommandOutput);

    /// Called when a rule's outputs were restored from the cache instead of
    /// running its command; once per output.
    fn cached(&mut self, target: &str);

    /// Log a line that isn't tied to a command, e.g. a failure reason.
    fn log(&mut self, msg: &str);

    /// Called once at the end of the build.
    fn finish(&mut self, success: bool);
}

/// Progress implementation that writes to the tracing log.  Output of
/// successful commands is logged at debug level, so the log level decides
/// whether it shows.
#[derive(Default)]
pub struct LogProgress;

impl Progress for LogProgress {
    fn task_started(&mut self, cmdline: &str) {
        tracing::info!("run: {}", cmdline);
    }

    fn task_finished(&mut self, cmdline: &str, result: &CommandOutput) {
        match result.termination {
            Termination::Success => {}
            Termination::Interrupted => tracing::warn!("interrupted: {}", cmdline),
            Termination::Failure => tracing::warn!("failed ({}): {}", result.status, cmdline),
        }
        for (name, bytes) in [("stdout", &result.stdout), ("stderr", &result.stderr)] {
            if bytes.is_empty() {
                continue;
            }
            let text = String::from_utf8_lossy(bytes);
            if result.termination == Termination::Failure {
                tracing::info!("{}: {}", name, text.trim_end());
            } else {
                tracing::debug!("{}: {}", name, text.trim_end());
            }
        }
    }

    fn cached(&mut self, target: &str) {
        tracing::info!("cached: {}", target);
    }

    fn log(&mut self, msg: &str) {
        tracing::info!("{}", msg);
    }

    fn finish(&mut self, success: bool) {
        if success {
            tracing::info!("build succeeded");
        } else {
            tracing::warn!("build failed");
        }
    }
}

/// Report to two progress sinks.
impl<A: Progress, B: Progress> Progress for (A, B) {
    fn task_started(&mut self, cmdline: &str) {
        self.0.task_started(cmdline);
        self.1.task_started(cmdline);
    }

    fn task_finished(&mut self, cmdline: &str, result: &CommandOutput) {
        self.0.task_finished(cmdline, result);
        self.1.task_finished(cmdline, result);
    }

    fn cached(&mut self, target: &str) {
        self.0.cached(target);
        self.1.cached(target);
    }

    fn log(&mut self, msg: &str) {
        self.0.log(msg);
        self.1.log(msg);
    }

    fn finish(&mut self, success: bool) {
        self.0.finish(success);
        self.1.finish(success);
    }
}
