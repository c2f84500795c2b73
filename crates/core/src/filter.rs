//! Local filter pipeline
//!
//! Some probes post-process their output on the gateway machine, e.g. to
//! resolve names the remote host cannot. The output is written to a scratch
//! file and piped through the probe's filter on a dedicated local session.
//! A single scratch path is used, so only one filter runs at a time.

use std::path::PathBuf;

use tokio::sync::Mutex;
use tracing::{debug, warn};
use wurm_runtime::{CommandOutput, CommandRunner, FILTER_SESSION_KEY};

/// Scratch file shared by all filter runs.
pub const DEFAULT_SCRATCH_PATH: &str = "/tmp/wurmterm_localhost_filter";

/// Stderr reported when the scratch file cannot be written.
pub const SCRATCH_WRITE_FAILED: &str = "Local filter execution failed, writing temporary file failed!";

/// Stderr prefix reported when the filter command itself fails.
pub const FILTER_RUN_FAILED: &str = "Local filter execution failed";

#[derive(Debug)]
pub struct LocalFilter {
	scratch: PathBuf,
	lock: Mutex<()>,
}

impl Default for LocalFilter {
	fn default() -> Self {
		Self::new(DEFAULT_SCRATCH_PATH)
	}
}

impl LocalFilter {
	pub fn new(scratch: impl Into<PathBuf>) -> Self {
		Self {
			scratch: scratch.into(),
			lock: Mutex::new(()),
		}
	}

	/// Pipes `stdout` through `filter` and returns the filter's output.
	///
	/// Failures are not errors: a scratch write failure degrades to empty
	/// stdout with [`SCRATCH_WRITE_FAILED`] as stderr, a failing filter run to
	/// empty stdout with [`FILTER_RUN_FAILED`] and the cause.
	pub async fn apply(&self, runner: &dyn CommandRunner, stdout: &str, filter: &str) -> CommandOutput {
		let _running = self.lock.lock().await;

		if let Err(err) = tokio::fs::write(&self.scratch, stdout).await {
			warn!(target = "wurm.dispatch", path = %self.scratch.display(), error = %err, "failed to write filter scratch file");
			return CommandOutput {
				stdout: String::new(),
				stderr: SCRATCH_WRITE_FAILED.to_string(),
			};
		}

		let scratch = shell_quote(&self.scratch.to_string_lossy());
		let filtered = runner.execute(FILTER_SESSION_KEY, &format!("cat {scratch} | {filter}")).await;

		if let Err(err) = runner.execute(FILTER_SESSION_KEY, &format!("rm -f {scratch}")).await {
			debug!(target = "wurm.dispatch", error = %err, "failed to remove filter scratch file");
		}

		filtered.unwrap_or_else(|err| {
			warn!(target = "wurm.dispatch", filter, error = %err, "local filter failed");
			CommandOutput {
				stdout: String::new(),
				stderr: format!("{FILTER_RUN_FAILED}: {err}"),
			}
		})
	}
}

/// Single-quotes `text` for a POSIX shell.
pub(crate) fn shell_quote(text: &str) -> String {
	format!("'{}'", text.replace('\'', r"'\''"))
}
