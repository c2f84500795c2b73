//! Shell process management
//!
//! A [`ShellProcess`] wraps one long-lived `bash` (local) or `ssh` (remote)
//! child and runs commands on it one at a time. Because the shell never exits
//! between commands, every command is followed by a unique end marker printed
//! on both stdout and stderr; output is collected up to those markers.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tracing::debug;
use wurm_protocol::LOCAL_HOST;

use crate::error::{Error, Result};

/// Session key of the shared local shell used for output filters.
pub const FILTER_SESSION_KEY: &str = ":localhost_filter";

static MARKER_SEQ: AtomicU64 = AtomicU64::new(0);

/// Returns true if `key` is served by a local shell rather than SSH.
pub fn is_local_key(key: &str) -> bool {
	key == LOCAL_HOST || key == FILTER_SESSION_KEY
}

/// Captured output of one command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
	pub stdout: String,
	pub stderr: String,
}

/// Knows how to spawn the process behind a session key.
#[derive(Debug, Clone)]
pub struct ShellLauncher {
	/// Local shell, used for the local host and the filter session.
	pub shell: PathBuf,
	/// SSH client used for every other host.
	pub ssh: PathBuf,
	/// Options passed to SSH before the host name.
	pub ssh_options: Vec<String>,
	/// Working directory of spawned processes.
	pub cwd: Option<PathBuf>,
}

impl Default for ShellLauncher {
	fn default() -> Self {
		Self {
			shell: PathBuf::from("/bin/bash"),
			ssh: PathBuf::from("/usr/bin/ssh"),
			ssh_options: [
				"-o",
				"UserKnownHostsFile=/dev/null",
				"-o",
				"StrictHostKeyChecking=no",
				"-o",
				"PreferredAuthentications=publickey",
			]
			.into_iter()
			.map(String::from)
			.collect(),
			cwd: None,
		}
	}
}

impl ShellLauncher {
	/// Builds the command for `key` without spawning it.
	///
	/// # Errors
	///
	/// Returns [`Error::SessionStart`] for host keys SSH would parse as options.
	pub fn command_for(&self, key: &str) -> Result<Command> {
		let mut cmd = if is_local_key(key) {
			Command::new(&self.shell)
		} else {
			if key.is_empty() || key.starts_with('-') || key.chars().any(char::is_whitespace) {
				return Err(Error::session_start(key, "invalid host name"));
			}
			let mut cmd = Command::new(&self.ssh);
			cmd.args(&self.ssh_options).arg(key);
			cmd
		};
		if let Some(cwd) = &self.cwd {
			cmd.current_dir(cwd);
		}
		Ok(cmd)
	}

	/// Spawns the process for `key` with piped stdio.
	pub fn spawn(&self, key: &str) -> Result<ShellProcess> {
		let cmd = self.command_for(key)?;
		ShellProcess::spawn(key, cmd)
	}
}

/// A running shell with its stdio pipes.
#[derive(Debug)]
pub struct ShellProcess {
	child: Child,
	stdin: ChildStdin,
	stdout: BufReader<ChildStdout>,
	stderr: BufReader<ChildStderr>,
}

impl ShellProcess {
	/// Spawns `cmd` with all three standard streams piped.
	pub fn spawn(key: &str, mut cmd: Command) -> Result<Self> {
		cmd.stdin(Stdio::piped())
			.stdout(Stdio::piped())
			.stderr(Stdio::piped())
			.kill_on_drop(true);

		let mut child = cmd
			.spawn()
			.map_err(|e| Error::session_start(key, format!("failed to spawn process: {e}")))?;

		let (Some(stdin), Some(stdout), Some(stderr)) = (child.stdin.take(), child.stdout.take(), child.stderr.take()) else {
			return Err(Error::session_start(key, "process stdio was not captured"));
		};

		debug!(target = "wurm.session", key, pid = child.id(), "spawned shell process");

		Ok(Self {
			child,
			stdin,
			stdout: BufReader::new(stdout),
			stderr: BufReader::new(stderr),
		})
	}

	pub fn pid(&self) -> Option<u32> {
		self.child.id()
	}

	/// Cheap liveness check: the process has not exited.
	pub fn is_alive(&mut self) -> bool {
		matches!(self.child.try_wait(), Ok(None))
	}

	/// Runs one command and waits for both end markers.
	pub async fn run(&mut self, command: &str) -> Result<CommandOutput> {
		let marker = format!(
			"__wurm_done_{}_{}__",
			std::process::id(),
			MARKER_SEQ.fetch_add(1, Ordering::Relaxed)
		);
		let script = format!("{command}\nprintf '\\n%s\\n' '{marker}'\nprintf '\\n%s\\n' '{marker}' >&2\n");

		self.stdin.write_all(script.as_bytes()).await?;
		self.stdin.flush().await?;

		let (stdout, stderr) = tokio::try_join!(
			read_until_marker(&mut self.stdout, &marker, "stdout"),
			read_until_marker(&mut self.stderr, &marker, "stderr"),
		)?;

		Ok(CommandOutput { stdout, stderr })
	}

	/// Kills the process and reaps it.
	pub async fn shutdown(mut self) {
		let pid = self.child.id();
		drop(self.stdin);
		if let Err(err) = self.child.kill().await {
			debug!(target = "wurm.session", ?pid, error = %err, "kill failed, process already gone");
		}
		let _ = tokio::time::timeout(Duration::from_millis(500), self.child.wait()).await;
	}
}

/// Reads lines until one equals `marker`, returning what came before it.
///
/// The newline printed in front of the marker is removed again, so output
/// that did not end in a newline comes back unchanged.
async fn read_until_marker<R>(reader: &mut R, marker: &str, stream: &'static str) -> Result<String>
where
	R: AsyncBufRead + Unpin,
{
	let mut collected = Vec::new();
	let mut line = Vec::new();
	loop {
		line.clear();
		let read = reader.read_until(b'\n', &mut line).await?;
		if read == 0 {
			return Err(Error::Closed { stream });
		}
		let text = line.strip_suffix(b"\n").unwrap_or(&line);
		if text == marker.as_bytes() {
			break;
		}
		collected.extend_from_slice(&line);
	}
	if collected.last() == Some(&b'\n') {
		collected.pop();
	}
	Ok(String::from_utf8_lossy(&collected).into_owned())
}
