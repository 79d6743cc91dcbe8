//! Shutdown of threads left behind by the application
//!
//! When the entry procedure returns, any non-daemon thread spawned under the
//! application's loader is a leftover. Depending on the policy leftovers are
//! only reported, or asked to stop and waited for.

use std::time::{Duration, Instant};

use nestpack_core::thread;
use nestpack_core::LoaderId;

/// Default time granted to leftover threads to honor a stop request.
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(2);

/// How the bootstrap ends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShutdownPolicy {
    /// Warn about leftover threads without stopping them.
    pub report_only: bool,
    /// Exit the process with the bootstrap status instead of returning.
    pub system_exit: bool,
    /// How long to wait for all stopped threads to exit.
    pub stop_timeout: Duration,
}

impl Default for ShutdownPolicy {
    fn default() -> Self {
        Self {
            report_only: false,
            system_exit: false,
            stop_timeout: DEFAULT_STOP_TIMEOUT,
        }
    }
}

/// What the janitor found and did. Entries are thread labels.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Leftover threads seen at shutdown.
    pub leftover: Vec<String>,
    /// Leftovers that exited after a stop request.
    pub stopped: Vec<String>,
    /// Leftovers still running when the timeout ran out.
    pub unresponsive: Vec<String>,
}

impl ShutdownReport {
    pub fn is_clean(&self) -> bool {
        self.leftover.is_empty()
    }
}

/// Cleans up threads spawned by loaded code.
pub trait ThreadJanitor: Send + Sync {
    fn shutdown(&self, loader: LoaderId, policy: &ShutdownPolicy) -> ShutdownReport;
}

/// Janitor over the process-wide tagged thread registry.
#[derive(Debug, Default, Clone, Copy)]
pub struct TaggedThreadJanitor;

impl ThreadJanitor for TaggedThreadJanitor {
    fn shutdown(&self, loader: LoaderId, policy: &ShutdownPolicy) -> ShutdownReport {
        let leftovers: Vec<_> = thread::registry()
            .snapshot()
            .into_iter()
            .filter(|r| !r.is_daemon() && r.spawned_under(loader))
            .collect();

        let mut report = ShutdownReport {
            leftover: leftovers.iter().map(|r| r.label()).collect(),
            ..ShutdownReport::default()
        };
        if leftovers.is_empty() {
            return report;
        }

        for record in &leftovers {
            tracing::warn!(
                thread = %record.label(),
                loader = %loader,
                "Non-daemon thread still running at shutdown"
            );
        }
        if policy.report_only {
            return report;
        }

        for record in &leftovers {
            record.request_stop();
        }

        let deadline = Instant::now() + policy.stop_timeout;
        for record in leftovers {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if record.wait_for_exit(remaining) {
                tracing::debug!(thread = %record.label(), "Leftover thread stopped");
                report.stopped.push(record.label());
            } else {
                tracing::warn!(thread = %record.label(), "Leftover thread did not stop in time");
                report.unresponsive.push(record.label());
            }
        }
        report
    }
}
