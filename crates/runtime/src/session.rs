//! One reusable execution channel bound to a host key.

use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde::Serialize;
use tracing::debug;

use crate::error::{Error, Result};
use crate::pool::SessionProfile;
use crate::shell::{CommandOutput, ShellLauncher, ShellProcess};

/// Lifecycle of a [`Session`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
	Starting,
	Ready,
	Busy,
	Invalid,
	Closed,
}

/// Snapshot reported by the `status` command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatus {
	pub key: String,
	pub state: SessionState,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub pid: Option<u32>,
	/// Unix epoch milliseconds.
	pub created_at: u64,
	pub idle_ms: u64,
	pub commands: u64,
}

pub struct Session {
	key: String,
	process: ShellProcess,
	state: SessionState,
	created_at: SystemTime,
	last_activity: Instant,
	commands: u64,
}

impl Session {
	/// Spawns the process for `key` and runs the profile's init commands.
	///
	/// Init command output is discarded; it exists to swallow login banners
	/// and to pin things like the locale before real commands run.
	pub async fn start(key: &str, launcher: &ShellLauncher, profile: &SessionProfile) -> Result<Self> {
		let process = launcher.spawn(key)?;
		let mut session = Self {
			key: key.to_string(),
			process,
			state: SessionState::Starting,
			created_at: SystemTime::now(),
			last_activity: Instant::now(),
			commands: 0,
		};

		for init in &profile.init_commands {
			if let Err(err) = session.process.run(init).await {
				session.close().await;
				return Err(Error::session_start(key, format!("init command failed: {err}")));
			}
		}

		if !session.process.is_alive() {
			session.close().await;
			return Err(Error::session_start(key, "process exited during startup"));
		}

		session.state = SessionState::Ready;
		debug!(target = "wurm.session", key, pid = session.process.pid(), "session ready");
		Ok(session)
	}

	pub fn state(&self) -> SessionState {
		self.state
	}

	/// True if the session can take another command.
	pub fn is_usable(&mut self) -> bool {
		self.state == SessionState::Ready && self.process.is_alive()
	}

	pub fn mark_invalid(&mut self) {
		self.state = SessionState::Invalid;
	}

	pub fn idle_for(&self) -> Duration {
		self.last_activity.elapsed()
	}

	/// Runs `command`, optionally bounded by `timeout`.
	///
	/// Any failure leaves the session [`SessionState::Invalid`].
	pub async fn execute(&mut self, command: &str, timeout: Option<Duration>) -> Result<CommandOutput> {
		self.state = SessionState::Busy;
		self.commands += 1;

		let result = match timeout {
			Some(after) => match tokio::time::timeout(after, self.process.run(command)).await {
				Ok(result) => result,
				Err(_) => Err(Error::Timeout {
					key: self.key.clone(),
					after,
				}),
			},
			None => self.process.run(command).await,
		};

		self.last_activity = Instant::now();
		self.state = match &result {
			Ok(_) => SessionState::Ready,
			Err(_) => SessionState::Invalid,
		};
		result
	}

	pub fn status(&self) -> SessionStatus {
		SessionStatus {
			key: self.key.clone(),
			state: self.state,
			pid: self.process.pid(),
			created_at: self
				.created_at
				.duration_since(UNIX_EPOCH)
				.unwrap_or_default()
				.as_millis() as u64,
			idle_ms: self.idle_for().as_millis() as u64,
			commands: self.commands,
		}
	}

	/// Tears down the process.
	pub async fn close(mut self) {
		self.state = SessionState::Closed;
		debug!(target = "wurm.session", key = %self.key, commands = self.commands, "closing session");
		self.process.shutdown().await;
	}
}
