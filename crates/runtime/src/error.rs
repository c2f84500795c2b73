//! Error types for the session runtime.

use std::time::Duration;

use thiserror::Error;

/// Result type alias for session operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised while starting or driving host sessions.
#[derive(Debug, Error)]
pub enum Error {
	/// The shell or SSH process could not be spawned or failed its startup checks.
	#[error("Failed to start session for '{key}': {reason}")]
	SessionStart { key: String, reason: String },

	/// The command failed twice in a row, once on a recreated session.
	#[error("Execution on '{key}' failed: {reason}")]
	Execution { key: String, reason: String },

	/// The opt-in execution timeout fired; the session was torn down.
	#[error("Execution on '{key}' timed out after {}s", .after.as_secs())]
	Timeout { key: String, after: Duration },

	/// The process closed its output before the end marker arrived.
	#[error("Session process closed its {stream} stream")]
	Closed { stream: &'static str },

	/// I/O error on the session pipes.
	#[error("I/O error: {0}")]
	Io(#[from] std::io::Error),
}

impl Error {
	pub(crate) fn session_start(key: &str, reason: impl ToString) -> Self {
		Error::SessionStart {
			key: key.to_string(),
			reason: reason.to_string(),
		}
	}

	/// Returns true if the session could not be created at all.
	pub fn is_session_start(&self) -> bool {
		matches!(self, Error::SessionStart { .. })
	}

	/// Returns true if the opt-in execution timeout fired.
	pub fn is_timeout(&self) -> bool {
		matches!(self, Error::Timeout { .. })
	}
}
